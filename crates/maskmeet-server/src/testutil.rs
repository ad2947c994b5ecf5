//! Shared test doubles for the media workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use maskmeet_media::decoder::DecoderEvent;
use maskmeet_media::encoder::FrameSink;

use crate::pipeline::{DecoderControl, DecoderSpec, EncoderControl, EncoderSpec, WorkerFactory};

pub struct RecordingSink {
    pub writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn write_frame(&mut self, frame: &[u8]) -> bool {
        self.writes.lock().await.push(frame.to_vec());
        true
    }

    async fn close(&mut self) {}
}

struct CountingControl {
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl DecoderControl for CountingControl {
    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EncoderControl for CountingControl {
    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Worker factory that spawns nothing: the test injects decoder events
/// through the captured sender and reads encoder writes back out.
#[derive(Default)]
pub struct MockWorkerFactory {
    pub decoder_events: Mutex<Option<mpsc::Sender<DecoderEvent>>>,
    pub encoder_starts: AtomicUsize,
    pub decoder_stops: Arc<AtomicUsize>,
    pub encoder_stops: Arc<AtomicUsize>,
    pub sink_writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockWorkerFactory {
    pub async fn frame_sender(&self) -> mpsc::Sender<DecoderEvent> {
        self.decoder_events
            .lock()
            .await
            .clone()
            .expect("decoder not started")
    }
}

#[async_trait]
impl WorkerFactory for MockWorkerFactory {
    async fn start_decoder(
        &self,
        _spec: DecoderSpec,
        events: mpsc::Sender<DecoderEvent>,
    ) -> anyhow::Result<Box<dyn DecoderControl>> {
        *self.decoder_events.lock().await = Some(events);
        Ok(Box::new(CountingControl {
            stops: self.decoder_stops.clone(),
        }))
    }

    async fn start_encoder(
        &self,
        _spec: EncoderSpec,
    ) -> anyhow::Result<(Box<dyn EncoderControl>, Box<dyn FrameSink>)> {
        self.encoder_starts.fetch_add(1, Ordering::SeqCst);
        Ok((
            Box::new(CountingControl {
                stops: self.encoder_stops.clone(),
            }),
            Box::new(RecordingSink {
                writes: self.sink_writes.clone(),
            }),
        ))
    }
}
