//! External raw-frames-to-RTP encoder process.
//!
//! Created lazily once the decoder has reported the stream resolution.
//! Reads RGB24 frames from stdin at 30 fps, encodes with realtime settings
//! and transmits RTP to the SFU's comedia egress port on loopback.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use crate::{MediaError, Result};

const STDIN_READY_TIMEOUT: Duration = Duration::from_secs(5);
const STDIN_READY_POLL: Duration = Duration::from_millis(100);

/// Everything needed to start one encoder process.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    /// Encoder binary, `ffmpeg` unless overridden.
    pub binary: String,
    /// Frame dimensions reported by the decoder.
    pub width: u32,
    pub height: u32,
    /// Loopback port of the SFU output plain transport.
    pub egress_rtp_port: u16,
    /// Payload type copied from the inbound consumer's RTP parameters.
    pub payload_type: u8,
    /// SSRC copied from the inbound parameters, random if absent.
    pub ssrc: u32,
    /// RTCP cname, defaulted when the inbound parameters carry none.
    pub cname: String,
    /// Tag for log lines.
    pub stream_tag: String,
}

/// Write side of a running encoder: raw frames in, silence on failure.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame. Returns `false` once the sink is no longer
    /// writable (encoder gone, stdin closed); the frame is dropped.
    async fn write_frame(&mut self, frame: &[u8]) -> bool;

    /// Close the sink, tolerating broken pipes.
    async fn close(&mut self);
}

/// Frame sink backed by the encoder process stdin.
pub struct EncoderSink {
    stdin: Option<ChildStdin>,
    stream_tag: String,
}

#[async_trait]
impl FrameSink for EncoderSink {
    async fn write_frame(&mut self, frame: &[u8]) -> bool {
        let Some(stdin) = self.stdin.as_mut() else {
            return false;
        };
        match stdin.write_all(frame).await {
            Ok(()) => true,
            Err(e) => {
                // Broken pipe means the encoder went away mid-stream; the
                // frame is dropped and the sink marked unwritable.
                tracing::debug!(stream = %self.stream_tag, "encoder stdin write failed: {e}");
                self.stdin = None;
                false
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(stream = %self.stream_tag, "encoder stdin close: {e}");
            }
        }
    }
}

/// Handle on a running encoder process.
pub struct EncoderWorker {
    child: Arc<Mutex<Option<Child>>>,
    stopped: Arc<AtomicBool>,
    stream_tag: String,
}

impl EncoderWorker {
    /// Spawn the encoder and wait until its stdin is observably open.
    pub async fn spawn(settings: EncoderSettings) -> Result<(EncoderWorker, EncoderSink)> {
        let size = format!("{}x{}", settings.width, settings.height);
        let target = format!("rtp://127.0.0.1:{}", settings.egress_rtp_port);

        let mut child = Command::new(&settings.binary)
            .args(["-hide_banner", "-loglevel", "warning"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .args(["-s", &size])
            .args(["-r", "30", "-i", "pipe:0"])
            .args(["-c:v", "libvpx", "-deadline", "realtime", "-cpu-used", "4"])
            .args(["-b:v", "500k", "-g", "30"])
            .args(["-payload_type", &settings.payload_type.to_string()])
            .args(["-ssrc", &settings.ssrc.to_string()])
            .args(["-cname", &settings.cname])
            .args(["-f", "rtp", &target])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MediaError::Spawn {
                process: "encoder",
                source,
            })?;

        let stdin = child.stdin.take();

        // The caller must not write before the sink is open: poll the child
        // until the deadline, failing if it exits or stdin was not piped.
        let deadline = tokio::time::Instant::now() + STDIN_READY_TIMEOUT;
        loop {
            if stdin.is_some() {
                break;
            }
            if let Some(status) = child.try_wait().map_err(MediaError::Io)? {
                return Err(MediaError::StartupFailed {
                    process: "encoder",
                    detail: format!("exited with {status} before accepting frames"),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(MediaError::StdinNotReady {
                    process: "encoder",
                    seconds: STDIN_READY_TIMEOUT.as_secs(),
                });
            }
            tokio::time::sleep(STDIN_READY_POLL).await;
        }

        tracing::info!(
            stream = %settings.stream_tag,
            %size,
            egress = settings.egress_rtp_port,
            ssrc = settings.ssrc,
            "encoder started"
        );

        let worker = EncoderWorker {
            child: Arc::new(Mutex::new(Some(child))),
            stopped: Arc::new(AtomicBool::new(false)),
            stream_tag: settings.stream_tag.clone(),
        };
        let sink = EncoderSink {
            stdin,
            stream_tag: settings.stream_tag,
        };
        Ok((worker, sink))
    }

    /// Terminate the encoder process. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(stream = %self.stream_tag, "encoder kill: {e}");
            }
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
        }
        tracing::info!(stream = %self.stream_tag, "encoder stopped");
    }
}
