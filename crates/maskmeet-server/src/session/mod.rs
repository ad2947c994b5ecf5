//! Session manager: one dispatcher for every signalling event.
//!
//! Maps connected clients to sessions, meetings to participant pairs and
//! producers to owners, relays peer-to-peer signalling, and hosts the
//! pipeline coordinator for video producers.

pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use maskmeet_protocol::{ClientEvent, MediaKind, ServerEvent, TransportDirection};

use crate::pipeline::PipelineCoordinator;
use crate::sfu::{Consumer, Producer, Router, WebRtcTransport};

use registry::{JoinOutcome, SessionId, SessionRegistry};

pub const MEETING_FULL_MESSAGE: &str = "Meeting is full (maximum 2 participants)";

pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    router: Arc<dyn Router>,
    coordinator: Arc<PipelineCoordinator>,
    transports: RwLock<HashMap<Uuid, (SessionId, Arc<dyn WebRtcTransport>)>>,
    consumers: RwLock<HashMap<Uuid, (SessionId, Arc<dyn Consumer>)>>,
    producers: RwLock<HashMap<Uuid, Arc<dyn Producer>>>,
}

impl SessionManager {
    pub fn new(
        registry: Arc<SessionRegistry>,
        router: Arc<dyn Router>,
        coordinator: Arc<PipelineCoordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            router,
            coordinator,
            transports: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            producers: RwLock::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Register a newly connected client and hand back its session id.
    pub async fn connect(&self, sink: mpsc::UnboundedSender<ServerEvent>) -> SessionId {
        self.registry.register(sink).await.id
    }

    pub async fn handle_event(&self, session_id: SessionId, event: ClientEvent) {
        match event {
            ClientEvent::JoinMeeting { meeting_id, name } => {
                self.handle_join(session_id, &meeting_id, &name).await;
            }

            ClientEvent::Offer { room_id, sdp } => {
                self.registry
                    .send_to_peer(session_id, ServerEvent::Offer { room_id, sdp })
                    .await;
            }

            ClientEvent::Answer { room_id, sdp } => {
                self.registry
                    .send_to_peer(session_id, ServerEvent::Answer { room_id, sdp })
                    .await;
            }

            ClientEvent::IceCandidate {
                room_id,
                candidate,
                target,
            } => {
                self.registry
                    .send_to_peer(
                        session_id,
                        ServerEvent::IceCandidate {
                            room_id,
                            candidate,
                            target,
                        },
                    )
                    .await;
            }

            // Landmark hints go to the peer only, never back to the sender.
            ClientEvent::OverlayData {
                meeting_id: _,
                landmarks,
                overlay_url,
                opacity,
            } => {
                self.registry
                    .send_to_peer(
                        session_id,
                        ServerEvent::OverlayData {
                            landmarks,
                            overlay_url,
                            opacity,
                        },
                    )
                    .await;
            }

            ClientEvent::GetRouterCapabilities => {
                self.registry
                    .send_to(
                        session_id,
                        ServerEvent::RouterCapabilities {
                            rtp_capabilities: self.router.rtp_capabilities(),
                        },
                    )
                    .await;
            }

            ClientEvent::CreateTransport { direction } => {
                self.handle_create_transport(session_id, direction).await;
            }

            ClientEvent::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                let Some(transport) = self.owned_transport(session_id, transport_id).await else {
                    self.emit_error(session_id, "Unknown transport").await;
                    return;
                };
                match transport.connect(dtls_parameters).await {
                    Ok(()) => {
                        self.registry
                            .send_to(session_id, ServerEvent::TransportConnected { transport_id })
                            .await;
                    }
                    Err(e) => {
                        tracing::error!(session = %session_id, "transport connect failed: {e}");
                        self.emit_error(session_id, "Failed to connect transport")
                            .await;
                    }
                }
            }

            ClientEvent::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => {
                self.handle_produce(session_id, transport_id, kind, rtp_parameters)
                    .await;
            }

            ClientEvent::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                self.handle_consume(session_id, transport_id, producer_id, rtp_capabilities)
                    .await;
            }

            ClientEvent::ConsumerResume { consumer_id } => {
                let consumer = {
                    let consumers = self.consumers.read().await;
                    consumers
                        .get(&consumer_id)
                        .filter(|(owner, _)| *owner == session_id)
                        .map(|(_, c)| c.clone())
                };
                match consumer {
                    Some(consumer) => consumer.resume().await,
                    None => tracing::warn!(session = %session_id, %consumer_id, "resume for unknown consumer"),
                }
            }

            ClientEvent::ChangeOverlay { overlay_url } => {
                if let Some(handle) = self.registry.get(session_id).await {
                    handle.settings.write().await.overlay_url = Some(overlay_url.clone());
                    handle.emit(ServerEvent::OverlayChanged { overlay_url });
                }
            }

            ClientEvent::ChangeOpacity { opacity } => {
                if let Some(handle) = self.registry.get(session_id).await {
                    let opacity = opacity.clamp(0.0, 1.0);
                    handle.settings.write().await.opacity = opacity;
                    handle.emit(ServerEvent::OpacityChanged { opacity });
                }
            }

            ClientEvent::ToggleOverlay { enabled } => {
                if let Some(handle) = self.registry.get(session_id).await {
                    handle.settings.write().await.enabled = enabled;
                    handle.emit(ServerEvent::OverlayToggled { enabled });
                }
            }
        }
    }

    /// Full teardown for a departing session. Safe to call repeatedly.
    pub async fn disconnect(&self, session_id: SessionId) {
        if self.registry.get(session_id).await.is_none() {
            return;
        }

        // Media pipelines first: decoders, encoders, ports, processed
        // producers.
        self.coordinator.detach_session(session_id).await;

        // Raw producers owned by the session.
        for producer_id in self.registry.remove_producers_of(session_id).await {
            if let Some(producer) = self.producers.write().await.remove(&producer_id) {
                producer.close().await;
            }
        }

        // Consumers and client-facing transports.
        let consumer_ids: Vec<Uuid> = {
            let consumers = self.consumers.read().await;
            consumers
                .iter()
                .filter(|(_, (owner, _))| *owner == session_id)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in consumer_ids {
            if let Some((_, consumer)) = self.consumers.write().await.remove(&id) {
                consumer.close().await;
            }
        }

        let transport_ids: Vec<Uuid> = {
            let transports = self.transports.read().await;
            transports
                .iter()
                .filter(|(_, (owner, _))| *owner == session_id)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in transport_ids {
            if let Some((_, transport)) = self.transports.write().await.remove(&id) {
                transport.close().await;
            }
        }

        // Room bookkeeping last: tell a remaining peer, drop empty meetings.
        if let Some(peer) = self.registry.leave_meeting(session_id).await {
            self.registry
                .send_to(peer, ServerEvent::UserDisconnected)
                .await;
        }

        self.registry.remove(session_id).await;
        tracing::info!(session = %session_id, "session disconnected");
    }

    async fn handle_join(&self, session_id: SessionId, meeting_id: &str, name: &str) {
        match self.registry.join_meeting(session_id, meeting_id, name).await {
            JoinOutcome::Waiting => {
                self.registry.send_to(session_id, ServerEvent::Waiting).await;
            }
            JoinOutcome::Paired(peer) => {
                let event = ServerEvent::PartnerConnected {
                    meeting_id: meeting_id.to_string(),
                };
                self.registry.send_to(session_id, event.clone()).await;
                self.registry.send_to(peer, event).await;
                tracing::info!(meeting = %meeting_id, "meeting paired");
            }
            JoinOutcome::Full => {
                self.emit_error(session_id, MEETING_FULL_MESSAGE).await;
            }
        }
    }

    async fn handle_create_transport(&self, session_id: SessionId, direction: TransportDirection) {
        match self.router.create_webrtc_transport().await {
            Ok(transport) => {
                let id = transport.id();
                self.transports
                    .write()
                    .await
                    .insert(id, (session_id, transport.clone()));
                self.registry
                    .send_to(
                        session_id,
                        ServerEvent::TransportCreated {
                            id,
                            ice_parameters: transport.ice_parameters(),
                            ice_candidates: transport.ice_candidates(),
                            dtls_parameters: transport.dtls_parameters(),
                            direction,
                        },
                    )
                    .await;
            }
            Err(e) => {
                tracing::error!(session = %session_id, "create transport failed: {e}");
                self.emit_error(session_id, "Failed to create transport").await;
            }
        }
    }

    async fn handle_produce(
        &self,
        session_id: SessionId,
        transport_id: Uuid,
        kind: MediaKind,
        rtp_parameters: maskmeet_protocol::RtpParameters,
    ) {
        let Some(transport) = self.owned_transport(session_id, transport_id).await else {
            self.emit_error(session_id, "Unknown transport").await;
            return;
        };

        let producer = match transport.produce(kind, rtp_parameters).await {
            Ok(producer) => producer,
            Err(e) => {
                tracing::error!(session = %session_id, "produce failed: {e}");
                self.emit_error(session_id, "Failed to produce").await;
                return;
            }
        };

        let producer_id = producer.id();
        self.registry.register_producer(producer_id, session_id).await;
        self.producers
            .write()
            .await
            .insert(producer_id, producer.clone());

        self.registry
            .send_to(session_id, ServerEvent::ProducerCreated { id: producer_id })
            .await;

        match kind {
            // Audio is forwarded as-is; the peer can consume right away.
            MediaKind::Audio => {
                self.registry
                    .send_to_peer(
                        session_id,
                        ServerEvent::NewProducer {
                            producer_id,
                            kind: MediaKind::Audio,
                        },
                    )
                    .await;
            }
            // Video goes through the processing pipeline; the peer hears
            // about the processed producer once the first frame decodes.
            MediaKind::Video => {
                if let Err(e) = self
                    .coordinator
                    .attach_video_producer(session_id, producer.as_ref())
                    .await
                {
                    tracing::error!(
                        session = %session_id,
                        producer = %producer_id,
                        "pipeline setup failed: {e:#}"
                    );
                    self.emit_error(session_id, "Failed to set up video processing")
                        .await;
                }
            }
        }
    }

    async fn handle_consume(
        &self,
        session_id: SessionId,
        transport_id: Uuid,
        producer_id: Uuid,
        rtp_capabilities: maskmeet_protocol::RtpCapabilities,
    ) {
        let Some(transport) = self.owned_transport(session_id, transport_id).await else {
            self.emit_error(session_id, "Unknown transport").await;
            return;
        };

        if !self.router.can_consume(producer_id, &rtp_capabilities).await {
            tracing::warn!(
                session = %session_id,
                producer = %producer_id,
                "cannot consume producer, skipping"
            );
            self.emit_error(session_id, "Cannot consume producer").await;
            return;
        }

        // Consumers start paused; the client resumes once its transport
        // is connected.
        match transport.consume(producer_id, rtp_capabilities, true).await {
            Ok(consumer) => {
                let id = consumer.id();
                self.consumers
                    .write()
                    .await
                    .insert(id, (session_id, consumer.clone()));
                self.registry
                    .send_to(
                        session_id,
                        ServerEvent::ConsumerCreated {
                            id,
                            producer_id,
                            kind: consumer.kind(),
                            rtp_parameters: consumer.rtp_parameters(),
                        },
                    )
                    .await;
            }
            Err(e) => {
                tracing::warn!(session = %session_id, "consume failed: {e}");
                self.emit_error(session_id, "Cannot consume producer").await;
            }
        }
    }

    async fn owned_transport(
        &self,
        session_id: SessionId,
        transport_id: Uuid,
    ) -> Option<Arc<dyn WebRtcTransport>> {
        let transports = self.transports.read().await;
        transports
            .get(&transport_id)
            .filter(|(owner, _)| *owner == session_id)
            .map(|(_, t)| t.clone())
    }

    async fn emit_error(&self, session_id: SessionId, message: &str) {
        self.registry
            .send_to(
                session_id,
                ServerEvent::Error {
                    message: message.to_string(),
                },
            )
            .await;
    }
}
