//! MaskMeet Protocol Library
//!
//! Shared definitions for the signalling channel and the SFU parameter
//! surface, used by the server and by integration tests.

pub mod events;
pub mod rtp;

pub use events::{CandidateTarget, ClientEvent, ServerEvent};
pub use rtp::{
    DtlsFingerprint, DtlsParameters, IceCandidate, IceParameters, MediaKind, RtcpParameters,
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters,
    RtpHeaderExtensionParameters, RtpParameters, TransportDirection,
};
