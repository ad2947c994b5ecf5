//! In-process SFU.
//!
//! Producers fan raw RTP datagrams out over broadcast channels; plain
//! transports bridge them to loopback UDP sockets for the decoder and
//! encoder processes. WebRTC transports synthesize their ICE/DTLS
//! parameters and keep producer/consumer bookkeeping; DTLS/SRTP
//! termination stays outside this crate.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::rtp::packet::Packet;
use webrtc::util::Unmarshal;

use maskmeet_protocol::{
    DtlsFingerprint, DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities,
    RtpCodecCapability, RtpParameters,
};

use super::{
    Consumer, PlainTransport, PlainTransportOptions, PlainTransportRemote, Producer, Result,
    Router, SfuError, TransportTuple, WebRtcTransport,
};

/// Broadcast depth per producer; a slow consumer drops packets rather
/// than stalling the pipeline.
const PRODUCER_CHANNEL_CAPACITY: usize = 512;
const MAX_DATAGRAM: usize = 1500;

struct ProducerEntry {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    packets: broadcast::Sender<Bytes>,
}

#[derive(Default)]
struct RouterShared {
    producers: RwLock<HashMap<Uuid, Arc<ProducerEntry>>>,
}

impl RouterShared {
    async fn remove_producer(&self, id: Uuid) {
        self.producers.write().await.remove(&id);
    }
}

/// The in-process router.
pub struct LocalSfu {
    announced_ip: IpAddr,
    shared: Arc<RouterShared>,
}

impl LocalSfu {
    pub fn new(announced_ip: IpAddr) -> Self {
        Self {
            announced_ip,
            shared: Arc::new(RouterShared::default()),
        }
    }
}

#[async_trait]
impl Router for LocalSfu {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        router_capabilities()
    }

    async fn can_consume(&self, producer_id: Uuid, rtp_capabilities: &RtpCapabilities) -> bool {
        let producers = self.shared.producers.read().await;
        let Some(producer) = producers.get(&producer_id) else {
            return false;
        };
        producer
            .rtp_parameters
            .codecs
            .iter()
            .any(|c| rtp_capabilities.supports_mime(&c.mime_type))
    }

    async fn create_webrtc_transport(&self) -> Result<Arc<dyn WebRtcTransport>> {
        let transport = LocalWebRtcTransport::new(self.announced_ip, self.shared.clone()).await?;
        Ok(Arc::new(transport))
    }

    async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> Result<Arc<dyn PlainTransport>> {
        let transport = LocalPlainTransport::bind(options, self.shared.clone()).await?;
        Ok(Arc::new(transport))
    }
}

fn router_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                kind: MediaKind::Video,
                preferred_payload_type: Some(96),
                clock_rate: 90000,
                channels: None,
                parameters: serde_json::Value::Null,
            },
            RtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                kind: MediaKind::Audio,
                preferred_payload_type: Some(111),
                clock_rate: 48000,
                channels: Some(2),
                parameters: serde_json::Value::Null,
            },
        ],
        header_extensions: vec![],
    }
}

/// Consumer parameters reuse the producer's codec/extension/rtcp blocks.
fn derive_consumer_parameters(producer: &RtpParameters) -> RtpParameters {
    RtpParameters {
        mid: None,
        codecs: producer.codecs.clone(),
        header_extensions: producer.header_extensions.clone(),
        encodings: producer.encodings.clone(),
        rtcp: producer.rtcp.clone(),
    }
}

struct LocalProducer {
    id: Uuid,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    shared: Arc<RouterShared>,
    /// Ingest task for comedia plain producers.
    ingest: Mutex<Option<JoinHandle<()>>>,
}

impl LocalProducer {
    async fn register(
        shared: Arc<RouterShared>,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> (Arc<Self>, broadcast::Sender<Bytes>) {
        let id = Uuid::new_v4();
        let (packets, _) = broadcast::channel(PRODUCER_CHANNEL_CAPACITY);

        shared.producers.write().await.insert(
            id,
            Arc::new(ProducerEntry {
                kind,
                rtp_parameters: rtp_parameters.clone(),
                packets: packets.clone(),
            }),
        );

        let producer = Arc::new(LocalProducer {
            id,
            kind,
            rtp_parameters,
            shared,
            ingest: Mutex::new(None),
        });
        (producer, packets)
    }
}

#[async_trait]
impl Producer for LocalProducer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn close(&self) {
        if let Some(task) = self.ingest.lock().await.take() {
            task.abort();
        }
        self.shared.remove_producer(self.id).await;
        tracing::debug!(producer = %self.id, "producer closed");
    }
}

struct LocalConsumer {
    id: Uuid,
    producer_id: Uuid,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: Arc<AtomicBool>,
    forward: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Consumer for LocalConsumer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn producer_id(&self) -> Uuid {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    async fn close(&self) {
        if let Some(task) = self.forward.lock().await.take() {
            task.abort();
        }
    }
}

pub struct LocalPlainTransport {
    id: Uuid,
    rtp_socket: Arc<UdpSocket>,
    rtcp_socket: Option<Arc<UdpSocket>>,
    comedia: bool,
    remote: Arc<RwLock<Option<SocketAddr>>>,
    closed: Arc<AtomicBool>,
    shared: Arc<RouterShared>,
}

impl LocalPlainTransport {
    async fn bind(options: PlainTransportOptions, shared: Arc<RouterShared>) -> Result<Self> {
        let rtp_socket = UdpSocket::bind((options.listen_ip, 0)).await?;
        let rtcp_socket = if options.rtcp_mux {
            None
        } else {
            Some(Arc::new(UdpSocket::bind((options.listen_ip, 0)).await?))
        };

        let transport = Self {
            id: Uuid::new_v4(),
            rtp_socket: Arc::new(rtp_socket),
            rtcp_socket,
            comedia: options.comedia,
            remote: Arc::new(RwLock::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            shared,
        };
        tracing::debug!(
            transport = %transport.id,
            port = transport.tuple().local_port,
            comedia = options.comedia,
            "plain transport bound"
        );
        Ok(transport)
    }

    fn local_tuple(socket: &UdpSocket) -> TransportTuple {
        let addr = socket.local_addr().expect("bound socket has an address");
        TransportTuple {
            local_ip: addr.ip(),
            local_port: addr.port(),
        }
    }
}

#[async_trait]
impl PlainTransport for LocalPlainTransport {
    fn id(&self) -> Uuid {
        self.id
    }

    fn tuple(&self) -> TransportTuple {
        Self::local_tuple(&self.rtp_socket)
    }

    fn rtcp_tuple(&self) -> Option<TransportTuple> {
        self.rtcp_socket.as_deref().map(Self::local_tuple)
    }

    async fn connect(&self, remote: PlainTransportRemote) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SfuError::TransportClosed);
        }
        let addr = SocketAddr::new(remote.ip, remote.port);
        *self.remote.write().await = Some(addr);
        tracing::debug!(transport = %self.id, %addr, rtcp_port = ?remote.rtcp_port, "plain transport connected");
        Ok(())
    }

    /// Forward a producer's RTP to this transport's remote endpoint.
    async fn consume(
        &self,
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SfuError::TransportClosed);
        }

        let entry = {
            let producers = self.shared.producers.read().await;
            producers
                .get(&producer_id)
                .cloned()
                .ok_or(SfuError::ProducerNotFound(producer_id))?
        };

        let supported = entry
            .rtp_parameters
            .codecs
            .iter()
            .any(|c| rtp_capabilities.supports_mime(&c.mime_type));
        if !supported {
            return Err(SfuError::CannotConsume(producer_id));
        }

        let paused = Arc::new(AtomicBool::new(paused));
        let mut packets = entry.packets.subscribe();
        let socket = self.rtp_socket.clone();
        let remote = self.remote.clone();
        let closed = self.closed.clone();
        let paused_flag = paused.clone();

        let forward = tokio::spawn(async move {
            loop {
                let packet = match packets.recv().await {
                    Ok(packet) => packet,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "plain consumer lagged, packets dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                if paused_flag.load(Ordering::SeqCst) {
                    continue;
                }
                let Some(addr) = *remote.read().await else {
                    continue;
                };
                if let Err(e) = socket.send_to(&packet, addr).await {
                    tracing::debug!("plain consumer send failed: {e}");
                    break;
                }
            }
        });

        let consumer = Arc::new(LocalConsumer {
            id: Uuid::new_v4(),
            producer_id,
            kind: entry.kind,
            rtp_parameters: derive_consumer_parameters(&entry.rtp_parameters),
            paused,
            forward: Mutex::new(Some(forward)),
        });
        Ok(consumer)
    }

    /// Publish what arrives on this transport's RTP socket. With comedia
    /// the remote endpoint is learned from the first datagram that parses
    /// as RTP.
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SfuError::TransportClosed);
        }

        let (producer, packets) =
            LocalProducer::register(self.shared.clone(), kind, rtp_parameters).await;

        let socket = self.rtp_socket.clone();
        let remote = self.remote.clone();
        let comedia = self.comedia;
        let closed = self.closed.clone();
        let producer_id = producer.id;

        let ingest = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::debug!(producer = %producer_id, "ingest recv failed: {e}");
                        break;
                    }
                };
                if closed.load(Ordering::SeqCst) {
                    break;
                }

                // Only well-formed RTP participates; RTCP and strays are
                // ignored for both comedia learning and forwarding.
                let mut slice = &buf[..len];
                if Packet::unmarshal(&mut slice).is_err() {
                    continue;
                }

                if comedia && remote.read().await.is_none() {
                    *remote.write().await = Some(from);
                    tracing::info!(producer = %producer_id, %from, "comedia remote learned");
                }

                let _ = packets.send(Bytes::copy_from_slice(&buf[..len]));
            }
        });
        *producer.ingest.lock().await = Some(ingest);

        Ok(producer)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(transport = %self.id, "plain transport closed");
    }
}

pub struct LocalWebRtcTransport {
    id: Uuid,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    // Holds the candidate port for the transport's lifetime.
    _socket: Arc<UdpSocket>,
    connected: AtomicBool,
    closed: AtomicBool,
    shared: Arc<RouterShared>,
    owned_producers: Mutex<Vec<Arc<dyn Producer>>>,
}

impl LocalWebRtcTransport {
    async fn new(announced_ip: IpAddr, shared: Arc<RouterShared>) -> Result<Self> {
        let socket = UdpSocket::bind((announced_ip, 0)).await?;
        let port = socket.local_addr()?.port();

        Ok(Self {
            id: Uuid::new_v4(),
            ice_parameters: IceParameters {
                username_fragment: random_token(8),
                password: random_token(22),
                ice_lite: Some(true),
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                ip: announced_ip.to_string(),
                protocol: "udp".to_string(),
                port,
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: Some("auto".to_string()),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: random_fingerprint(),
                }],
            },
            _socket: Arc::new(socket),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shared,
            owned_producers: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl WebRtcTransport for LocalWebRtcTransport {
    fn id(&self) -> Uuid {
        self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SfuError::TransportClosed);
        }
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(
            transport = %self.id,
            fingerprints = dtls_parameters.fingerprints.len(),
            "webrtc transport connected"
        );
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SfuError::TransportClosed);
        }
        let (producer, _packets) =
            LocalProducer::register(self.shared.clone(), kind, rtp_parameters).await;
        self.owned_producers.lock().await.push(producer.clone());
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SfuError::TransportClosed);
        }

        let entry = {
            let producers = self.shared.producers.read().await;
            producers
                .get(&producer_id)
                .cloned()
                .ok_or(SfuError::ProducerNotFound(producer_id))?
        };

        let supported = entry
            .rtp_parameters
            .codecs
            .iter()
            .any(|c| rtp_capabilities.supports_mime(&c.mime_type));
        if !supported {
            return Err(SfuError::CannotConsume(producer_id));
        }

        Ok(Arc::new(LocalConsumer {
            id: Uuid::new_v4(),
            producer_id,
            kind: entry.kind,
            rtp_parameters: derive_consumer_parameters(&entry.rtp_parameters),
            paused: Arc::new(AtomicBool::new(paused)),
            forward: Mutex::new(None),
        }))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for producer in self.owned_producers.lock().await.drain(..) {
            producer.close().await;
        }
        tracing::debug!(transport = %self.id, "webrtc transport closed");
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_fingerprint() -> String {
    let bytes: [u8; 32] = rand::random();
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use maskmeet_protocol::RtpCodecParameters;
    use std::net::Ipv4Addr;

    fn vp8_parameters(ssrc: u32) -> RtpParameters {
        RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: serde_json::Value::Null,
                rtcp_feedback: vec![],
            }],
            header_extensions: vec![],
            encodings: vec![maskmeet_protocol::RtpEncodingParameters {
                ssrc: Some(ssrc),
                ..Default::default()
            }],
            rtcp: Some(maskmeet_protocol::RtcpParameters {
                cname: Some("maskmeet".to_string()),
                reduced_size: None,
            }),
        }
    }

    fn minimal_rtp_packet(ssrc: u32) -> Vec<u8> {
        // 12-byte RTP header, version 2, payload type 96.
        let mut packet = vec![0u8; 16];
        packet[0] = 0x80;
        packet[1] = 96;
        packet[8..12].copy_from_slice(&ssrc.to_be_bytes());
        packet
    }

    #[tokio::test]
    async fn router_capabilities_cover_vp8_and_opus() {
        let sfu = LocalSfu::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let caps = sfu.rtp_capabilities();
        assert!(caps.supports_mime("video/VP8"));
        assert!(caps.supports_mime("audio/opus"));
    }

    #[tokio::test]
    async fn can_consume_requires_matching_codec() {
        let sfu = LocalSfu::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let transport = sfu.create_webrtc_transport().await.unwrap();
        let producer = transport
            .produce(MediaKind::Video, vp8_parameters(1))
            .await
            .unwrap();

        assert!(sfu.can_consume(producer.id(), &router_capabilities()).await);
        assert!(
            !sfu.can_consume(producer.id(), &RtpCapabilities::default())
                .await
        );
        assert!(!sfu.can_consume(Uuid::new_v4(), &router_capabilities()).await);
    }

    #[tokio::test]
    async fn comedia_producer_forwards_to_plain_consumer() {
        let sfu = LocalSfu::new(IpAddr::V4(Ipv4Addr::LOCALHOST));

        // Ingest transport: comedia, the encoder stand-in sends to it.
        let ingress = sfu
            .create_plain_transport(PlainTransportOptions {
                listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                rtcp_mux: false,
                comedia: true,
            })
            .await
            .unwrap();
        let producer = ingress
            .produce(MediaKind::Video, vp8_parameters(7))
            .await
            .unwrap();

        // Egress transport: connected to a socket we read from.
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let egress = sfu
            .create_plain_transport(PlainTransportOptions {
                listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                rtcp_mux: false,
                comedia: false,
            })
            .await
            .unwrap();
        egress
            .connect(PlainTransportRemote {
                ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: sink.local_addr().unwrap().port(),
                rtcp_port: None,
            })
            .await
            .unwrap();
        let _consumer = egress
            .consume(producer.id(), router_capabilities(), false)
            .await
            .unwrap();

        // Send RTP into the ingress socket from a fresh "encoder" socket.
        let encoder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ingress_port = ingress.tuple().local_port;
        let packet = minimal_rtp_packet(7);
        for _ in 0..5 {
            encoder
                .send_to(&packet, ("127.0.0.1", ingress_port))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let mut buf = [0u8; 64];
        let received = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            sink.recv_from(&mut buf),
        )
        .await
        .expect("forwarded RTP within deadline")
        .unwrap();
        assert_eq!(&buf[..received.0], &packet[..]);

        producer.close().await;
        ingress.close().await;
        egress.close().await;
    }

    #[tokio::test]
    async fn closed_producer_disappears_from_router() {
        let sfu = LocalSfu::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let transport = sfu.create_webrtc_transport().await.unwrap();
        let producer = transport
            .produce(MediaKind::Audio, vp8_parameters(9))
            .await
            .unwrap();
        let id = producer.id();
        assert!(sfu.can_consume(id, &router_capabilities()).await);

        producer.close().await;
        assert!(!sfu.can_consume(id, &router_capabilities()).await);
    }
}
