//! Wires one raw video producer to its processing pipeline and owns all
//! teardown.
//!
//! Data path: SFU plain consumer → decoder process → frame handler →
//! overlay transform → encoder stdin → comedia plain transport →
//! processed producer. The encoder and the processed producer are created
//! lazily on the first decoded frame, when the resolution is known.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use maskmeet_media::decoder::DecoderEvent;
use maskmeet_media::encoder::FrameSink;
use maskmeet_media::overlay::OverlayCache;
use maskmeet_media::ports::{PortAllocator, PortPair};
use maskmeet_media::transform::FrameTransform;
use maskmeet_media::DecodedFrame;
use maskmeet_protocol::{MediaKind, RtpEncodingParameters, RtpParameters, ServerEvent};

use crate::session::registry::{SessionId, SessionRegistry};
use crate::sfu::{
    Consumer, PlainTransport, PlainTransportOptions, PlainTransportRemote, Producer, Router,
};

use super::{DecoderControl, DecoderSpec, EncoderControl, EncoderSpec, Stage, StageCell, WorkerFactory};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Grace period between encoder start and publishing the processed
/// producer, so the encoder is consuming stdin before RTP is expected.
const ENCODER_WARMUP: Duration = Duration::from_secs(1);

/// Depth of the decoder event channel. Frames that arrive while the
/// handler is behind wait here briefly; ordering is preserved.
const FRAME_CHANNEL_CAPACITY: usize = 32;

/// All live handles of one per-producer pipeline.
pub struct Pipeline {
    pub producer_id: Uuid,
    pub owner: SessionId,
    stage: StageCell,
    port_pair: PortPair,
    input_transport: Arc<dyn PlainTransport>,
    input_consumer: Arc<dyn Consumer>,
    output_transport: Arc<dyn PlainTransport>,
    egress_port: u16,
    decoder: Mutex<Option<Box<dyn DecoderControl>>>,
    encoder: Mutex<Option<Box<dyn EncoderControl>>>,
    sink: Mutex<Option<Box<dyn FrameSink>>>,
    processed: Mutex<Option<Arc<dyn Producer>>>,
}

impl Pipeline {
    pub fn stage(&self) -> Stage {
        self.stage.load()
    }

    pub async fn processed_producer_id(&self) -> Option<Uuid> {
        self.processed.lock().await.as_ref().map(|p| p.id())
    }
}

pub struct PipelineCoordinator {
    router: Arc<dyn Router>,
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn WorkerFactory>,
    ports: Arc<PortAllocator>,
    transform: Arc<dyn FrameTransform>,
    overlays: Arc<OverlayCache>,
    pipelines: RwLock<HashMap<Uuid, Arc<Pipeline>>>,
}

impl PipelineCoordinator {
    pub fn new(
        router: Arc<dyn Router>,
        registry: Arc<SessionRegistry>,
        factory: Arc<dyn WorkerFactory>,
        ports: Arc<PortAllocator>,
        transform: Arc<dyn FrameTransform>,
        overlays: Arc<OverlayCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            registry,
            factory,
            ports,
            transform,
            overlays,
            pipelines: RwLock::new(HashMap::new()),
        })
    }

    pub async fn pipeline(&self, producer_id: Uuid) -> Option<Arc<Pipeline>> {
        self.pipelines.read().await.get(&producer_id).cloned()
    }

    /// Build the input and output legs for a raw video producer and start
    /// its decoder. The encoder side stays down until the first frame.
    pub async fn attach_video_producer(
        self: &Arc<Self>,
        owner: SessionId,
        producer: &dyn Producer,
    ) -> Result<()> {
        let producer_id = producer.id();
        if self.pipelines.read().await.contains_key(&producer_id) {
            tracing::warn!(producer = %producer_id, "pipeline already attached");
            return Ok(());
        }

        let port_pair = self.ports.allocate()?;

        match self
            .build_pipeline(owner, producer_id, port_pair)
            .await
        {
            Ok(pipeline) => {
                self.pipelines
                    .write()
                    .await
                    .insert(producer_id, pipeline);
                Ok(())
            }
            Err(e) => {
                self.ports.free(port_pair);
                Err(e)
            }
        }
    }

    async fn build_pipeline(
        self: &Arc<Self>,
        owner: SessionId,
        producer_id: Uuid,
        port_pair: PortPair,
    ) -> Result<Arc<Pipeline>> {
        // Nothing built so far lands in the pipelines map until the whole
        // chain is up, so every early return below must close what already
        // exists itself: a dropped consumer would leave its forwarding task
        // running forever.

        // Input leg: the SFU sends the raw producer's RTP to the decoder's
        // ports, so the transport is told its remote up front.
        let input_transport = self
            .router
            .create_plain_transport(PlainTransportOptions {
                listen_ip: LOOPBACK,
                rtcp_mux: false,
                comedia: false,
            })
            .await
            .context("create input plain transport")?;

        if let Err(e) = input_transport
            .connect(PlainTransportRemote {
                ip: LOOPBACK,
                port: port_pair.rtp,
                rtcp_port: Some(port_pair.rtcp),
            })
            .await
        {
            input_transport.close().await;
            return Err(e).context("connect input plain transport");
        }

        let input_consumer = match input_transport
            .consume(producer_id, self.router.rtp_capabilities(), false)
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                input_transport.close().await;
                return Err(e).context("consume raw producer");
            }
        };

        // Output leg: comedia, so the SFU learns the encoder's source port
        // from the first packet. Created before the encoder exists.
        let output_transport = match self
            .router
            .create_plain_transport(PlainTransportOptions {
                listen_ip: LOOPBACK,
                rtcp_mux: false,
                comedia: true,
            })
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                input_consumer.close().await;
                input_transport.close().await;
                return Err(e).context("create output plain transport");
            }
        };
        let egress_port = output_transport.tuple().local_port;

        let consumer_params = input_consumer.rtp_parameters();
        let payload_type = consumer_params.first_payload_type().unwrap_or(96);
        let ssrc = consumer_params.first_ssrc();
        let cname = consumer_params.cname().unwrap_or("maskmeet").to_string();
        let codec = consumer_params
            .codecs
            .first()
            .and_then(|c| c.mime_type.split('/').nth(1))
            .unwrap_or("VP8")
            .to_string();
        let clock_rate = consumer_params
            .codecs
            .first()
            .map(|c| c.clock_rate)
            .unwrap_or(90000);

        let pipeline = Arc::new(Pipeline {
            producer_id,
            owner,
            stage: StageCell::new(),
            port_pair,
            input_transport,
            input_consumer,
            output_transport,
            egress_port,
            decoder: Mutex::new(None),
            encoder: Mutex::new(None),
            sink: Mutex::new(None),
            processed: Mutex::new(None),
        });

        let (events_tx, events_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let decoder = match self
            .factory
            .start_decoder(
                DecoderSpec {
                    rtp_port: port_pair.rtp,
                    payload_type,
                    ssrc,
                    cname,
                    codec,
                    clock_rate,
                    stream_tag: producer_id.to_string(),
                },
                events_tx,
            )
            .await
        {
            Ok(decoder) => decoder,
            Err(e) => {
                pipeline.stage.close();
                pipeline.input_consumer.close().await;
                pipeline.input_transport.close().await;
                pipeline.output_transport.close().await;
                return Err(e.context("start decoder"));
            }
        };
        *pipeline.decoder.lock().await = Some(decoder);

        // Frame pump: consumes decoder events in FIFO order for the whole
        // pipeline lifetime.
        let coordinator = self.clone();
        let pump_pipeline = pipeline.clone();
        tokio::spawn(async move {
            coordinator.run_frame_pump(pump_pipeline, events_rx).await;
        });

        tracing::info!(
            producer = %producer_id,
            session = %owner,
            decoder_rtp = port_pair.rtp,
            egress = egress_port,
            "video pipeline attached"
        );

        Ok(pipeline)
    }

    async fn run_frame_pump(
        self: Arc<Self>,
        pipeline: Arc<Pipeline>,
        mut events: mpsc::Receiver<DecoderEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                DecoderEvent::Frame(frame) => self.handle_frame(&pipeline, frame).await,
                DecoderEvent::Terminated { reason } => {
                    self.fail_pipeline(&pipeline, &reason).await;
                    return;
                }
            }
        }
    }

    /// Per-frame state machine.
    ///
    /// The first frame claims the `Idle → Initializing` edge and spawns
    /// encoder startup; frames seen while initializing (or after close)
    /// are dropped, never queued. Ready frames take the transform-and-
    /// write path.
    pub async fn handle_frame(self: &Arc<Self>, pipeline: &Arc<Pipeline>, frame: DecodedFrame) {
        if pipeline.stage.try_begin_init() {
            let coordinator = self.clone();
            let pipeline = pipeline.clone();
            let (width, height) = (frame.width, frame.height);
            tokio::spawn(async move {
                if let Err(e) = coordinator.initialize_encoder(&pipeline, width, height).await {
                    tracing::error!(
                        producer = %pipeline.producer_id,
                        "encoder initialisation failed: {e:#}"
                    );
                    coordinator
                        .fail_pipeline(&pipeline, "encoder startup failed")
                        .await;
                }
            });
            return;
        }

        match pipeline.stage.load() {
            Stage::Ready => self.write_frame(pipeline, frame).await,
            // Initializing: dropped by design. Closed: teardown has begun.
            _ => {}
        }
    }

    async fn initialize_encoder(
        self: &Arc<Self>,
        pipeline: &Arc<Pipeline>,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let consumer_params = pipeline.input_consumer.rtp_parameters();
        let payload_type = consumer_params.first_payload_type().unwrap_or(96);
        let ssrc = consumer_params
            .first_ssrc()
            .unwrap_or_else(rand::random::<u32>);
        let cname = consumer_params
            .cname()
            .unwrap_or("maskmeet")
            .to_string();

        let (encoder, sink) = self
            .factory
            .start_encoder(EncoderSpec {
                width,
                height,
                egress_rtp_port: pipeline.egress_port,
                payload_type,
                ssrc,
                cname,
                stream_tag: pipeline.producer_id.to_string(),
            })
            .await
            .context("start encoder")?;
        *pipeline.encoder.lock().await = Some(encoder);
        *pipeline.sink.lock().await = Some(sink);

        tokio::time::sleep(ENCODER_WARMUP).await;

        // The processed producer reuses the inbound codec description; only
        // the SSRC is fresh, since the encoder emits a new stream.
        let processed_params = RtpParameters {
            mid: None,
            codecs: consumer_params.codecs.clone(),
            header_extensions: consumer_params.header_extensions.clone(),
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(rand::random::<u32>()),
                scalability_mode: Some("L1T1".to_string()),
                ..Default::default()
            }],
            rtcp: consumer_params.rtcp.clone(),
        };

        let processed = pipeline
            .output_transport
            .produce(MediaKind::Video, processed_params)
            .await
            .map_err(|e| anyhow!("publish processed producer: {e}"))?;
        let processed_id = processed.id();
        *pipeline.processed.lock().await = Some(processed);

        if !pipeline.stage.finish_init() {
            // Teardown raced us; it has already drained the stored handles,
            // so the just-published producer is ours to close.
            tracing::debug!(producer = %pipeline.producer_id, "pipeline closed during init");
            if let Some(processed) = pipeline.processed.lock().await.take() {
                processed.close().await;
            }
            return Ok(());
        }

        // The peer learns about the processed producer only; the raw video
        // producer id never leaves the server.
        self.registry
            .send_to_peer(
                pipeline.owner,
                ServerEvent::NewProducer {
                    producer_id: processed_id,
                    kind: MediaKind::Video,
                },
            )
            .await;

        tracing::info!(
            producer = %pipeline.producer_id,
            processed = %processed_id,
            width,
            height,
            "pipeline ready"
        );
        Ok(())
    }

    async fn write_frame(&self, pipeline: &Arc<Pipeline>, mut frame: DecodedFrame) {
        let settings = self.registry.settings(pipeline.owner).await;

        if let Some(settings) = settings {
            if settings.enabled {
                if let Some(url) = settings.overlay_url.as_deref() {
                    match self.overlays.get(url).await {
                        Ok(overlay) => self.transform.apply(
                            &mut frame.data,
                            frame.width,
                            frame.height,
                            &overlay,
                            settings.opacity,
                        ),
                        // Unfetchable overlay: frame passes through untouched.
                        Err(e) => tracing::debug!(url, "overlay unavailable: {e}"),
                    }
                }
            }
        }

        let mut sink = pipeline.sink.lock().await;
        if let Some(sink) = sink.as_mut() {
            // An unwritable sink silently drops the frame.
            sink.write_frame(&frame.data).await;
        }
    }

    async fn fail_pipeline(self: &Arc<Self>, pipeline: &Arc<Pipeline>, reason: &str) {
        let was_ready = pipeline.stage.load() == Stage::Ready;
        tracing::warn!(
            producer = %pipeline.producer_id,
            was_ready,
            "pipeline failed: {reason}"
        );
        self.registry
            .send_to(
                pipeline.owner,
                ServerEvent::Error {
                    message: format!("Video processing failed: {reason}"),
                },
            )
            .await;
        self.close_pipeline(pipeline.producer_id).await;
    }

    /// Tear down one pipeline: processes, transports, ports, producer.
    /// Safe to call repeatedly; later calls find nothing to do.
    pub async fn close_pipeline(&self, producer_id: Uuid) {
        let Some(pipeline) = self.pipelines.write().await.remove(&producer_id) else {
            return;
        };

        if pipeline.stage.close() == Stage::Closed {
            return;
        }

        if let Some(decoder) = pipeline.decoder.lock().await.take() {
            decoder.stop().await;
        }
        if let Some(encoder) = pipeline.encoder.lock().await.take() {
            encoder.stop().await;
        }
        if let Some(mut sink) = pipeline.sink.lock().await.take() {
            sink.close().await;
        }

        pipeline.input_consumer.close().await;
        pipeline.input_transport.close().await;
        self.ports.free(pipeline.port_pair);

        // Comedia side: the SFU owns the egress port, nothing to free here.
        pipeline.output_transport.close().await;

        if let Some(processed) = pipeline.processed.lock().await.take() {
            processed.close().await;
        }

        tracing::info!(producer = %producer_id, "pipeline closed");
    }

    /// Tear down every pipeline owned by a session. Idempotent.
    pub async fn detach_session(&self, owner: SessionId) {
        let owned: Vec<Uuid> = self
            .pipelines
            .read()
            .await
            .values()
            .filter(|p| p.owner == owner)
            .map(|p| p.producer_id)
            .collect();

        for producer_id in owned {
            self.close_pipeline(producer_id).await;
        }
    }

    /// Number of live pipelines, for diagnostics.
    pub async fn pipeline_count(&self) -> usize {
        self.pipelines.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use maskmeet_media::transform::Watermark;
    use maskmeet_protocol::{RtcpParameters, RtpCapabilities, RtpCodecParameters};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
    use tokio::sync::mpsc::error::TryRecvError;

    use crate::sfu::{
        Consumer as SfuConsumer, PlainTransport as SfuPlainTransport, Producer as SfuProducer,
        Result as SfuResult, SfuError, TransportTuple, WebRtcTransport,
    };

    fn vp8_parameters() -> RtpParameters {
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
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(424242),
                ..Default::default()
            }],
            rtcp: Some(RtcpParameters {
                cname: Some("raw-stream".to_string()),
                reduced_size: None,
            }),
        }
    }

    struct MockProducer {
        id: Uuid,
        closed: Arc<AtomicBool>,
    }

    impl MockProducer {
        fn new() -> Self {
            Self {
                id: Uuid::new_v4(),
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl SfuProducer for MockProducer {
        fn id(&self) -> Uuid {
            self.id
        }
        fn kind(&self) -> MediaKind {
            MediaKind::Video
        }
        fn rtp_parameters(&self) -> RtpParameters {
            vp8_parameters()
        }
        async fn close(&self) {
            self.closed.store(true, AtomicOrdering::SeqCst);
        }
    }

    struct MockConsumer {
        id: Uuid,
        producer_id: Uuid,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SfuConsumer for MockConsumer {
        fn id(&self) -> Uuid {
            self.id
        }
        fn producer_id(&self) -> Uuid {
            self.producer_id
        }
        fn kind(&self) -> MediaKind {
            MediaKind::Video
        }
        fn rtp_parameters(&self) -> RtpParameters {
            vp8_parameters()
        }
        async fn resume(&self) {}
        async fn close(&self) {
            self.closed.store(true, AtomicOrdering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockTransportLog {
        plain_transports: Mutex<Vec<MockPlainRecord>>,
        produced: Mutex<Vec<Uuid>>,
        consumers_closed: Arc<AtomicBool>,
    }

    struct MockPlainRecord {
        comedia: bool,
        closed: Arc<AtomicBool>,
    }

    struct MockPlainTransport {
        id: Uuid,
        comedia: bool,
        port: u16,
        closed: Arc<AtomicBool>,
        log: Arc<MockTransportLog>,
        fail_produce: bool,
    }

    #[async_trait]
    impl SfuPlainTransport for MockPlainTransport {
        fn id(&self) -> Uuid {
            self.id
        }
        fn tuple(&self) -> TransportTuple {
            TransportTuple {
                local_ip: LOOPBACK,
                local_port: self.port,
            }
        }
        fn rtcp_tuple(&self) -> Option<TransportTuple> {
            Some(TransportTuple {
                local_ip: LOOPBACK,
                local_port: self.port + 1,
            })
        }
        async fn connect(&self, _remote: PlainTransportRemote) -> SfuResult<()> {
            Ok(())
        }
        async fn consume(
            &self,
            producer_id: Uuid,
            _caps: RtpCapabilities,
            _paused: bool,
        ) -> SfuResult<Arc<dyn SfuConsumer>> {
            Ok(Arc::new(MockConsumer {
                id: Uuid::new_v4(),
                producer_id,
                closed: self.log.consumers_closed.clone(),
            }))
        }
        async fn produce(
            &self,
            _kind: MediaKind,
            rtp_parameters: RtpParameters,
        ) -> SfuResult<Arc<dyn SfuProducer>> {
            if self.fail_produce || self.closed.load(AtomicOrdering::SeqCst) {
                return Err(SfuError::TransportClosed);
            }
            assert_eq!(
                rtp_parameters.encodings[0].scalability_mode.as_deref(),
                Some("L1T1")
            );
            let producer = MockProducer::new();
            self.log.produced.lock().await.push(producer.id);
            Ok(Arc::new(producer))
        }
        async fn close(&self) {
            self.closed.store(true, AtomicOrdering::SeqCst);
        }
    }

    struct MockRouter {
        log: Arc<MockTransportLog>,
        next_port: AtomicUsize,
        fail_output_produce: bool,
    }

    impl MockRouter {
        fn new() -> Self {
            Self {
                log: Arc::new(MockTransportLog::default()),
                next_port: AtomicUsize::new(30000),
                fail_output_produce: false,
            }
        }
    }

    #[async_trait]
    impl Router for MockRouter {
        fn rtp_capabilities(&self) -> RtpCapabilities {
            RtpCapabilities::default()
        }
        async fn can_consume(&self, _producer_id: Uuid, _caps: &RtpCapabilities) -> bool {
            true
        }
        async fn create_webrtc_transport(&self) -> SfuResult<Arc<dyn WebRtcTransport>> {
            unimplemented!("not used by the pipeline")
        }
        async fn create_plain_transport(
            &self,
            options: PlainTransportOptions,
        ) -> SfuResult<Arc<dyn SfuPlainTransport>> {
            assert!(!options.rtcp_mux);
            let closed = Arc::new(AtomicBool::new(false));
            self.log.plain_transports.lock().await.push(MockPlainRecord {
                comedia: options.comedia,
                closed: closed.clone(),
            });
            let port = self.next_port.fetch_add(2, AtomicOrdering::SeqCst) as u16;
            Ok(Arc::new(MockPlainTransport {
                id: Uuid::new_v4(),
                comedia: options.comedia,
                port,
                closed,
                log: self.log.clone(),
                fail_produce: self.fail_output_produce && options.comedia,
            }))
        }
    }

    struct MockDecoderControl {
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DecoderControl for MockDecoderControl {
        async fn stop(&self) {
            self.stops.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    struct MockEncoderControl {
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EncoderControl for MockEncoderControl {
        async fn stop(&self) {
            self.stops.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    struct MockSink {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl FrameSink for MockSink {
        async fn write_frame(&mut self, frame: &[u8]) -> bool {
            self.writes.lock().await.push(frame.to_vec());
            true
        }
        async fn close(&mut self) {}
    }

    #[derive(Default)]
    struct MockFactory {
        decoder_events: Mutex<Option<mpsc::Sender<DecoderEvent>>>,
        encoder_starts: AtomicUsize,
        decoder_stops: Arc<AtomicUsize>,
        encoder_stops: Arc<AtomicUsize>,
        sink_writes: Arc<Mutex<Vec<Vec<u8>>>>,
        fail_decoder: AtomicBool,
        fail_encoder: AtomicBool,
    }

    #[async_trait]
    impl WorkerFactory for MockFactory {
        async fn start_decoder(
            &self,
            _spec: DecoderSpec,
            events: mpsc::Sender<DecoderEvent>,
        ) -> anyhow::Result<Box<dyn DecoderControl>> {
            if self.fail_decoder.load(AtomicOrdering::SeqCst) {
                anyhow::bail!("mock decoder refused to start");
            }
            *self.decoder_events.lock().await = Some(events);
            Ok(Box::new(MockDecoderControl {
                stops: self.decoder_stops.clone(),
            }))
        }

        async fn start_encoder(
            &self,
            spec: EncoderSpec,
        ) -> anyhow::Result<(Box<dyn EncoderControl>, Box<dyn FrameSink>)> {
            if self.fail_encoder.load(AtomicOrdering::SeqCst) {
                anyhow::bail!("mock encoder refused to start");
            }
            assert_eq!(spec.payload_type, 96);
            assert_eq!(spec.ssrc, 424242);
            assert_eq!(spec.cname, "raw-stream");
            self.encoder_starts.fetch_add(1, AtomicOrdering::SeqCst);
            Ok((
                Box::new(MockEncoderControl {
                    stops: self.encoder_stops.clone(),
                }),
                Box::new(MockSink {
                    writes: self.sink_writes.clone(),
                }),
            ))
        }
    }

    struct Rig {
        coordinator: Arc<PipelineCoordinator>,
        registry: Arc<SessionRegistry>,
        factory: Arc<MockFactory>,
        ports: Arc<PortAllocator>,
        router_log: Arc<MockTransportLog>,
    }

    async fn rig() -> Rig {
        let router = Arc::new(MockRouter::new());
        let router_log = router.log.clone();
        let registry = Arc::new(SessionRegistry::new());
        let factory = Arc::new(MockFactory::default());
        let ports = Arc::new(PortAllocator::default());
        let coordinator = PipelineCoordinator::new(
            router,
            registry.clone(),
            factory.clone(),
            ports.clone(),
            Arc::new(Watermark::new()),
            Arc::new(OverlayCache::new()),
        );
        Rig {
            coordinator,
            registry,
            factory,
            ports,
            router_log,
        }
    }

    async fn paired_sessions(
        registry: &SessionRegistry,
    ) -> (
        SessionId,
        SessionId,
        mpsc::UnboundedReceiver<ServerEvent>,
        mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let s1 = registry.register(tx1).await;
        let s2 = registry.register(tx2).await;
        registry.join_meeting(s1.id, "m1", "a").await;
        registry.join_meeting(s2.id, "m1", "b").await;
        (s1.id, s2.id, rx1, rx2)
    }

    fn frame(width: u32, height: u32, fill: u8) -> DecodedFrame {
        DecodedFrame {
            data: vec![fill; (width * height * 3) as usize],
            width,
            height,
        }
    }

    async fn frame_sender(factory: &MockFactory) -> mpsc::Sender<DecoderEvent> {
        factory
            .decoder_events
            .lock()
            .await
            .clone()
            .expect("decoder started")
    }

    /// Drain until a `new-producer` event shows up or the channel is dry.
    fn find_new_producer(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Option<(Uuid, MediaKind)> {
        loop {
            match rx.try_recv() {
                Ok(ServerEvent::NewProducer { producer_id, kind }) => {
                    return Some((producer_id, kind))
                }
                Ok(_) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn processed_producer_exists_iff_a_frame_was_decoded() {
        let rig = rig().await;
        let (s1, _s2, _rx1, mut rx2) = paired_sessions(&rig.registry).await;
        let raw = MockProducer::new();

        rig.coordinator
            .attach_video_producer(s1, &raw)
            .await
            .unwrap();

        // No frame yet: no processed producer, peer not notified.
        let pipeline = rig.coordinator.pipeline(raw.id).await.unwrap();
        assert_eq!(pipeline.stage(), Stage::Idle);
        assert!(pipeline.processed_producer_id().await.is_none());
        assert!(find_new_producer(&mut rx2).is_none());

        // First frame arrives.
        let sender = frame_sender(&rig.factory).await;
        sender
            .send(DecoderEvent::Frame(frame(640, 480, 1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(pipeline.stage(), Stage::Ready);
        let processed = pipeline.processed_producer_id().await.unwrap();
        assert_ne!(processed, raw.id);

        let (announced, kind) = find_new_producer(&mut rx2).expect("peer notified");
        assert_eq!(announced, processed);
        assert_eq!(kind, MediaKind::Video);

        // Later frames never re-announce.
        sender
            .send(DecoderEvent::Frame(frame(640, 480, 2)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(find_new_producer(&mut rx2).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_first_frames_start_exactly_one_encoder() {
        let rig = rig().await;
        let (s1, _s2, _rx1, mut rx2) = paired_sessions(&rig.registry).await;
        let raw = MockProducer::new();
        rig.coordinator
            .attach_video_producer(s1, &raw)
            .await
            .unwrap();
        let pipeline = rig.coordinator.pipeline(raw.id).await.unwrap();

        // Hit the idle edge from many tasks at once, bypassing the pump.
        let mut handles = Vec::new();
        for i in 0..8 {
            let coordinator = rig.coordinator.clone();
            let pipeline = pipeline.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .handle_frame(&pipeline, frame(640, 480, i))
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(rig.factory.encoder_starts.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(rig.router_log.produced.lock().await.len(), 1);

        // And the peer heard about it exactly once.
        assert!(find_new_producer(&mut rx2).is_some());
        assert!(find_new_producer(&mut rx2).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn frames_before_ready_are_never_written() {
        let rig = rig().await;
        let (s1, _s2, _rx1, _rx2) = paired_sessions(&rig.registry).await;
        let raw = MockProducer::new();
        rig.coordinator
            .attach_video_producer(s1, &raw)
            .await
            .unwrap();

        let sender = frame_sender(&rig.factory).await;
        // First frame triggers init; the next two land during warmup and
        // must be dropped, not queued.
        for fill in 1..=3 {
            sender
                .send(DecoderEvent::Frame(frame(320, 240, fill)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(rig.factory.sink_writes.lock().await.is_empty());

        // A frame after ready is written.
        sender
            .send(DecoderEvent::Frame(frame(320, 240, 9)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let writes = rig.factory.sink_writes.lock().await;
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], vec![9u8; 320 * 240 * 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn decoder_death_before_first_frame_never_notifies_peer() {
        let rig = rig().await;
        let (s1, _s2, mut rx1, mut rx2) = paired_sessions(&rig.registry).await;
        let raw = MockProducer::new();
        rig.coordinator
            .attach_video_producer(s1, &raw)
            .await
            .unwrap();

        let sender = frame_sender(&rig.factory).await;
        sender
            .send(DecoderEvent::Terminated {
                reason: "decoder exited: signal 9".to_string(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Pipeline is gone, ports are back, peer never learned anything.
        assert!(rig.coordinator.pipeline(raw.id).await.is_none());
        assert_eq!(rig.ports.in_use(), 0);
        assert!(find_new_producer(&mut rx2).is_none());

        // The owner got the operational error.
        let mut owner_got_error = false;
        while let Ok(event) = rx1.try_recv() {
            if matches!(event, ServerEvent::Error { .. }) {
                owner_got_error = true;
            }
        }
        assert!(owner_got_error);
    }

    #[tokio::test(start_paused = true)]
    async fn encoder_startup_failure_tears_the_pipeline_down() {
        let rig = rig().await;
        let (s1, _s2, mut rx1, mut rx2) = paired_sessions(&rig.registry).await;
        let raw = MockProducer::new();
        rig.coordinator
            .attach_video_producer(s1, &raw)
            .await
            .unwrap();
        rig.factory.fail_encoder.store(true, AtomicOrdering::SeqCst);

        let sender = frame_sender(&rig.factory).await;
        sender
            .send(DecoderEvent::Frame(frame(640, 480, 1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(rig.coordinator.pipeline(raw.id).await.is_none());
        assert_eq!(rig.ports.in_use(), 0);
        assert_eq!(rig.factory.decoder_stops.load(AtomicOrdering::SeqCst), 1);
        assert!(find_new_producer(&mut rx2).is_none());

        let mut owner_got_error = false;
        while let Ok(event) = rx1.try_recv() {
            if matches!(event, ServerEvent::Error { .. }) {
                owner_got_error = true;
            }
        }
        assert!(owner_got_error);
    }

    #[tokio::test(start_paused = true)]
    async fn decoder_start_failure_closes_the_partial_wiring() {
        let rig = rig().await;
        let (s1, _s2, _rx1, _rx2) = paired_sessions(&rig.registry).await;
        rig.factory.fail_decoder.store(true, AtomicOrdering::SeqCst);

        let raw = MockProducer::new();
        let result = rig.coordinator.attach_video_producer(s1, &raw).await;
        assert!(result.is_err());

        // Nothing was registered, the ports came back, and the transports
        // and consumer built before the decoder blew up are closed.
        assert!(rig.coordinator.pipeline(raw.id).await.is_none());
        assert_eq!(rig.coordinator.pipeline_count().await, 0);
        assert_eq!(rig.ports.in_use(), 0);
        assert!(rig.router_log.consumers_closed.load(AtomicOrdering::SeqCst));
        let transports = rig.router_log.plain_transports.lock().await;
        assert_eq!(transports.len(), 2);
        for record in transports.iter() {
            assert!(record.closed.load(AtomicOrdering::SeqCst));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn detach_session_runs_the_full_teardown_list() {
        let rig = rig().await;
        let (s1, _s2, _rx1, _rx2) = paired_sessions(&rig.registry).await;
        let raw = MockProducer::new();
        rig.coordinator
            .attach_video_producer(s1, &raw)
            .await
            .unwrap();

        let sender = frame_sender(&rig.factory).await;
        sender
            .send(DecoderEvent::Frame(frame(640, 480, 1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(rig.ports.in_use(), 2);

        rig.coordinator.detach_session(s1).await;

        assert_eq!(rig.coordinator.pipeline_count().await, 0);
        assert_eq!(rig.ports.in_use(), 0);
        assert_eq!(rig.factory.decoder_stops.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(rig.factory.encoder_stops.load(AtomicOrdering::SeqCst), 1);
        assert!(rig.router_log.consumers_closed.load(AtomicOrdering::SeqCst));
        for record in rig.router_log.plain_transports.lock().await.iter() {
            assert!(record.closed.load(AtomicOrdering::SeqCst));
        }

        // Repeated cleanup of the same session is a no-op.
        rig.coordinator.detach_session(s1).await;
        assert_eq!(rig.factory.decoder_stops.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlay_disabled_passes_frames_through() {
        let rig = rig().await;
        let (s1, _s2, _rx1, _rx2) = paired_sessions(&rig.registry).await;

        // Overlay configured but disabled: bytes must be untouched.
        let handle = rig.registry.get(s1).await.unwrap();
        {
            let mut settings = handle.settings.write().await;
            settings.overlay_url = Some("https://example.com/mask.png".to_string());
            settings.enabled = false;
        }

        let raw = MockProducer::new();
        rig.coordinator
            .attach_video_producer(s1, &raw)
            .await
            .unwrap();
        let sender = frame_sender(&rig.factory).await;
        sender
            .send(DecoderEvent::Frame(frame(64, 48, 1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        sender
            .send(DecoderEvent::Frame(frame(64, 48, 7)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let writes = rig.factory.sink_writes.lock().await;
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], vec![7u8; 64 * 48 * 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn input_and_output_transports_use_the_expected_modes() {
        let rig = rig().await;
        let (s1, _s2, _rx1, _rx2) = paired_sessions(&rig.registry).await;
        let raw = MockProducer::new();
        rig.coordinator
            .attach_video_producer(s1, &raw)
            .await
            .unwrap();

        let transports = rig.router_log.plain_transports.lock().await;
        assert_eq!(transports.len(), 2);
        // Input first (told its remote), comedia output second.
        assert!(!transports[0].comedia);
        assert!(transports[1].comedia);
    }
}
