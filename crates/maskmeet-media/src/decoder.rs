//! External RTP-to-raw-frames decoder process.
//!
//! One decoder per inbound video producer. The process consumes RTP on a
//! loopback port described by a generated SDP file and writes contiguous
//! RGB24 frames to stdout. Its stderr is scanned for the negotiated
//! resolution; no frame is emitted before the resolution is known.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};

use crate::{DecodedFrame, MediaError, Result};

/// Dimension bootstrap for buffer sizing before the real resolution is known.
const BOOTSTRAP_WIDTH: u32 = 640;
const BOOTSTRAP_HEIGHT: u32 = 480;

/// How long a freshly started decoder may stay silent before we log it.
const SILENCE_WARN_AFTER: Duration = Duration::from_secs(10);

// First video-stream line of the decoder diagnostics, e.g.
// "  Stream #0:0: Video: vp8, yuv420p(tv), 640x480, 90k tbn".
static RE_RESOLUTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{3,4})x(\d{3,4})\b").unwrap());

/// Everything needed to start one decoder process.
#[derive(Debug, Clone)]
pub struct DecoderSettings {
    /// Decoder binary, `ffmpeg` unless overridden.
    pub binary: String,
    /// Loopback RTP port the SFU plain transport sends to.
    pub rtp_port: u16,
    /// Payload type copied from the inbound consumer's RTP parameters.
    pub payload_type: u8,
    /// SSRC of the inbound stream, when the RTP parameters carry one.
    pub ssrc: Option<u32>,
    /// RTCP cname from the inbound parameters, or a default.
    pub cname: String,
    /// Codec name for the SDP rtpmap line, e.g. `VP8`.
    pub codec: String,
    /// Codec clock rate, 90000 for video.
    pub clock_rate: u32,
    /// Tag used for the SDP temp file name and log lines.
    pub stream_tag: String,
}

/// What the decoder reports back to its owner, in emission order.
#[derive(Debug)]
pub enum DecoderEvent {
    Frame(DecodedFrame),
    /// The decoder died or reported an error; the pipeline must go down.
    Terminated { reason: String },
}

/// Handle on a running decoder process.
pub struct DecoderWorker {
    child: Arc<Mutex<Option<Child>>>,
    stopped: Arc<AtomicBool>,
    sdp_path: PathBuf,
    stream_tag: String,
}

impl DecoderWorker {
    /// Spawn the decoder and begin streaming events into `events`.
    pub async fn spawn(
        settings: DecoderSettings,
        events: mpsc::Sender<DecoderEvent>,
    ) -> Result<DecoderWorker> {
        let sdp_path =
            std::env::temp_dir().join(format!("maskmeet-decode-{}.sdp", settings.stream_tag));
        tokio::fs::write(&sdp_path, build_sdp(&settings)).await?;

        let mut child = Command::new(&settings.binary)
            .args([
                "-hide_banner",
                "-loglevel",
                "info",
                "-protocol_whitelist",
                "file,udp,rtp",
                "-i",
            ])
            .arg(&sdp_path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                let _ = std::fs::remove_file(&sdp_path);
                MediaError::Spawn {
                    process: "decoder",
                    source,
                }
            })?;

        let stdout = child.stdout.take().expect("decoder stdout piped");
        let stderr = child.stderr.take().expect("decoder stderr piped");

        let stopped = Arc::new(AtomicBool::new(false));
        let frames_emitted = Arc::new(AtomicU64::new(0));
        let (dims_tx, dims_rx) = watch::channel::<Option<(u32, u32)>>(None);

        let tag = settings.stream_tag.clone();

        // Diagnostic stream: resolution auto-detection plus error lines.
        {
            let events = events.clone();
            let stopped = stopped.clone();
            let tag = tag.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut resolution_known = false;
                while let Ok(Some(line)) = lines.next_line().await {
                    if !resolution_known && line.contains("Video") {
                        if let Some(caps) = RE_RESOLUTION.captures(&line) {
                            let width: u32 = caps[1].parse().unwrap_or(BOOTSTRAP_WIDTH);
                            let height: u32 = caps[2].parse().unwrap_or(BOOTSTRAP_HEIGHT);
                            tracing::info!(stream = %tag, width, height, "decoder resolution detected");
                            let _ = dims_tx.send(Some((width, height)));
                            resolution_known = true;
                            continue;
                        }
                    }
                    if line.contains("error") || line.contains("Error") {
                        tracing::error!(stream = %tag, line = %line, "decoder reported an error");
                        if !stopped.load(Ordering::SeqCst) {
                            let _ = events
                                .send(DecoderEvent::Terminated {
                                    reason: format!("decoder error: {line}"),
                                })
                                .await;
                        }
                        return;
                    }
                    tracing::trace!(stream = %tag, line = %line, "decoder");
                }
            });
        }

        // Frame stream: accumulate stdout bytes and slice exact frames once
        // the resolution is known. The channel preserves decoder order.
        {
            let events = events.clone();
            let stopped = stopped.clone();
            let frames_emitted = frames_emitted.clone();
            let mut dims_rx = dims_rx.clone();
            tokio::spawn(async move {
                let mut assembler = FrameAssembler::new();
                let mut stdout = stdout;
                let mut chunk = vec![0u8; BOOTSTRAP_WIDTH as usize * BOOTSTRAP_HEIGHT as usize * 3];
                loop {
                    let read = match stdout.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if assembler.dimensions().is_none() {
                        if let Some(dims) = *dims_rx.borrow_and_update() {
                            assembler.set_dimensions(dims.0, dims.1);
                        }
                    }
                    assembler.push(&chunk[..read]);
                    while let Some(frame) = assembler.next_frame() {
                        if stopped.load(Ordering::SeqCst) {
                            return;
                        }
                        frames_emitted.fetch_add(1, Ordering::Relaxed);
                        if events.send(DecoderEvent::Frame(frame)).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }

        // Silence watchdog: a decoder that never produced a frame after
        // startup is logged but left running.
        {
            let frames_emitted = frames_emitted.clone();
            let stopped = stopped.clone();
            let tag = tag.clone();
            tokio::spawn(async move {
                tokio::time::sleep(SILENCE_WARN_AFTER).await;
                if !stopped.load(Ordering::SeqCst) && frames_emitted.load(Ordering::Relaxed) == 0 {
                    tracing::warn!(
                        stream = %tag,
                        "decoder silent for {}s with no frames",
                        SILENCE_WARN_AFTER.as_secs()
                    );
                }
            });
        }

        let child = Arc::new(Mutex::new(Some(child)));

        // Exit watcher: a decoder that dies takes its pipeline with it.
        {
            let child = child.clone();
            let stopped = stopped.clone();
            let tag = tag.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    if stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    let status = {
                        let mut guard = child.lock().await;
                        match guard.as_mut() {
                            Some(child) => child.try_wait().ok().flatten(),
                            None => return,
                        }
                    };
                    if let Some(status) = status {
                        tracing::warn!(stream = %tag, %status, "decoder exited");
                        let _ = events
                            .send(DecoderEvent::Terminated {
                                reason: format!("decoder exited: {status}"),
                            })
                            .await;
                        return;
                    }
                }
            });
        }

        Ok(DecoderWorker {
            child,
            stopped,
            sdp_path,
            stream_tag: settings.stream_tag,
        })
    }

    /// Terminate the decoder process and remove its SDP file. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(stream = %self.stream_tag, "decoder kill: {e}");
            }
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
        }
        if let Err(e) = tokio::fs::remove_file(&self.sdp_path).await {
            tracing::debug!(stream = %self.stream_tag, "sdp cleanup: {e}");
        }
        tracing::info!(stream = %self.stream_tag, "decoder stopped");
    }
}

fn build_sdp(settings: &DecoderSettings) -> String {
    let mut sdp = format!(
        "v=0\r\n\
         o=- 0 0 IN IP4 127.0.0.1\r\n\
         s=maskmeet-{tag}\r\n\
         c=IN IP4 127.0.0.1\r\n\
         t=0 0\r\n\
         m=video {port} RTP/AVP {pt}\r\n\
         a=rtpmap:{pt} {codec}/{clock}\r\n\
         a=recvonly\r\n",
        tag = settings.stream_tag,
        port = settings.rtp_port,
        pt = settings.payload_type,
        codec = settings.codec,
        clock = settings.clock_rate,
    );
    if let Some(ssrc) = settings.ssrc {
        sdp.push_str(&format!("a=ssrc:{ssrc} cname:{}\r\n", settings.cname));
    }
    sdp
}

/// Splits a byte stream into exact `width * height * 3` frames.
///
/// Bytes arriving before the dimensions are known are buffered, never
/// emitted; once dimensions are set, whole frames are sliced off the front
/// in arrival order.
pub struct FrameAssembler {
    buffer: Vec<u8>,
    dimensions: Option<(u32, u32)>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(BOOTSTRAP_WIDTH as usize * BOOTSTRAP_HEIGHT as usize * 3),
            dimensions: None,
        }
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    pub fn set_dimensions(&mut self, width: u32, height: u32) {
        self.dimensions = Some((width, height));
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Option<DecodedFrame> {
        let (width, height) = self.dimensions?;
        let frame_size = width as usize * height as usize * 3;
        if self.buffer.len() < frame_size {
            return None;
        }
        let rest = self.buffer.split_off(frame_size);
        let data = std::mem::replace(&mut self.buffer, rest);
        Some(DecodedFrame {
            data,
            width,
            height,
        })
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
