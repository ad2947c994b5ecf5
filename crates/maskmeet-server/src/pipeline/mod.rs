//! Per-producer media processing pipeline.
//!
//! For every raw video producer the coordinator wires SFU plain
//! transports to an external decoder and encoder, applies the owner's
//! overlay to each decoded frame, and republishes the result as the
//! processed producer the peer actually consumes.

pub mod coordinator;

pub use coordinator::PipelineCoordinator;

use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use maskmeet_media::decoder::{DecoderEvent, DecoderSettings, DecoderWorker};
use maskmeet_media::encoder::{EncoderSettings, EncoderWorker, FrameSink};

/// Lifecycle of one pipeline.
///
/// `Idle → Initializing` is the only contended edge: the first decoded
/// frame wins it with a compare-and-set, every near-simultaneous loser
/// drops its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    Idle = 0,
    Initializing = 1,
    Ready = 2,
    Closed = 3,
}

impl Stage {
    fn from_u8(value: u8) -> Stage {
        match value {
            0 => Stage::Idle,
            1 => Stage::Initializing,
            2 => Stage::Ready,
            _ => Stage::Closed,
        }
    }
}

/// Atomic stage holder with compare-and-set transitions.
#[derive(Debug)]
pub struct StageCell(AtomicU8);

impl StageCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(Stage::Idle as u8))
    }

    pub fn load(&self) -> Stage {
        Stage::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Claim the `Idle → Initializing` edge. Exactly one caller wins.
    pub fn try_begin_init(&self) -> bool {
        self.0
            .compare_exchange(
                Stage::Idle as u8,
                Stage::Initializing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// `Initializing → Ready`. Fails if teardown won the race.
    pub fn finish_init(&self) -> bool {
        self.0
            .compare_exchange(
                Stage::Initializing as u8,
                Stage::Ready as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Move to `Closed`, returning the previous stage. Idempotent.
    pub fn close(&self) -> Stage {
        Stage::from_u8(self.0.swap(Stage::Closed as u8, Ordering::SeqCst))
    }
}

impl Default for StageCell {
    fn default() -> Self {
        Self::new()
    }
}

/// What the coordinator needs to start a decoder.
#[derive(Debug, Clone)]
pub struct DecoderSpec {
    pub rtp_port: u16,
    pub payload_type: u8,
    pub ssrc: Option<u32>,
    pub cname: String,
    pub codec: String,
    pub clock_rate: u32,
    pub stream_tag: String,
}

/// What the coordinator needs to start an encoder.
#[derive(Debug, Clone)]
pub struct EncoderSpec {
    pub width: u32,
    pub height: u32,
    pub egress_rtp_port: u16,
    pub payload_type: u8,
    pub ssrc: u32,
    pub cname: String,
    pub stream_tag: String,
}

#[async_trait]
pub trait DecoderControl: Send + Sync {
    async fn stop(&self);
}

#[async_trait]
pub trait EncoderControl: Send + Sync {
    async fn stop(&self);
}

/// Seam between the coordinator and the external processes, so tests can
/// observe encoder writes without spawning anything.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn start_decoder(
        &self,
        spec: DecoderSpec,
        events: mpsc::Sender<DecoderEvent>,
    ) -> anyhow::Result<Box<dyn DecoderControl>>;

    async fn start_encoder(
        &self,
        spec: EncoderSpec,
    ) -> anyhow::Result<(Box<dyn EncoderControl>, Box<dyn FrameSink>)>;
}

#[async_trait]
impl DecoderControl for DecoderWorker {
    async fn stop(&self) {
        DecoderWorker::stop(self).await;
    }
}

#[async_trait]
impl EncoderControl for EncoderWorker {
    async fn stop(&self) {
        EncoderWorker::stop(self).await;
    }
}

/// Production factory spawning ffmpeg (or whatever the config names).
pub struct ProcessWorkerFactory {
    pub decoder_binary: String,
    pub encoder_binary: String,
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    async fn start_decoder(
        &self,
        spec: DecoderSpec,
        events: mpsc::Sender<DecoderEvent>,
    ) -> anyhow::Result<Box<dyn DecoderControl>> {
        let worker = DecoderWorker::spawn(
            DecoderSettings {
                binary: self.decoder_binary.clone(),
                rtp_port: spec.rtp_port,
                payload_type: spec.payload_type,
                ssrc: spec.ssrc,
                cname: spec.cname,
                codec: spec.codec,
                clock_rate: spec.clock_rate,
                stream_tag: spec.stream_tag,
            },
            events,
        )
        .await?;
        Ok(Box::new(worker))
    }

    async fn start_encoder(
        &self,
        spec: EncoderSpec,
    ) -> anyhow::Result<(Box<dyn EncoderControl>, Box<dyn FrameSink>)> {
        let (worker, sink) = EncoderWorker::spawn(EncoderSettings {
            binary: self.encoder_binary.clone(),
            width: spec.width,
            height: spec.height,
            egress_rtp_port: spec.egress_rtp_port,
            payload_type: spec.payload_type,
            ssrc: spec.ssrc,
            cname: spec.cname,
            stream_tag: spec.stream_tag,
        })
        .await?;
        Ok((Box::new(worker), Box::new(sink)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_caller_wins_the_init_edge() {
        let cell = StageCell::new();
        assert!(cell.try_begin_init());
        assert!(!cell.try_begin_init());
        assert_eq!(cell.load(), Stage::Initializing);
    }

    #[test]
    fn finish_init_requires_initializing() {
        let cell = StageCell::new();
        assert!(!cell.finish_init());
        cell.try_begin_init();
        assert!(cell.finish_init());
        assert_eq!(cell.load(), Stage::Ready);
    }

    #[test]
    fn close_is_terminal_and_idempotent() {
        let cell = StageCell::new();
        cell.try_begin_init();
        cell.finish_init();
        assert_eq!(cell.close(), Stage::Ready);
        assert_eq!(cell.close(), Stage::Closed);
        assert!(!cell.try_begin_init());
        assert!(!cell.finish_init());
    }

    #[test]
    fn concurrent_init_claims_yield_one_winner() {
        use std::sync::Arc;

        let cell = Arc::new(StageCell::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let cell = cell.clone();
            handles.push(std::thread::spawn(move || cell.try_begin_init()));
        }

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
