//! MaskMeet media workers.
//!
//! This crate owns everything that touches raw frames: the UDP port
//! allocator for decoder ingest, the external decoder and encoder
//! processes, the per-frame overlay transform and the overlay image cache.
//! It knows nothing about signalling or the SFU; the server wires those
//! together.

pub mod decoder;
pub mod encoder;
pub mod overlay;
pub mod ports;
pub mod transform;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("no free port pairs below {0}")]
    PortsExhausted(u16),

    #[error("failed to spawn {process}: {source}")]
    Spawn {
        process: &'static str,
        source: std::io::Error,
    },

    #[error("{process} exited during startup: {detail}")]
    StartupFailed {
        process: &'static str,
        detail: String,
    },

    #[error("{process} stdin not ready within {seconds}s")]
    StdinNotReady { process: &'static str, seconds: u64 },

    #[error("failed to fetch overlay {url}: {detail}")]
    OverlayFetch { url: String, detail: String },

    #[error("failed to decode overlay image {url}: {source}")]
    OverlayDecode {
        url: String,
        #[source]
        source: image::ImageError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MediaError>;

/// One decoded RGB24 frame together with its dimensions.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl DecodedFrame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
