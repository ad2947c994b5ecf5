use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rtp::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
    TransportDirection,
};

/// Which of the two peer-side transports an ICE candidate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateTarget {
    Sender,
    Receiver,
}

/// Events accepted from clients on the signalling channel.
///
/// The wire format is a JSON object tagged by `type` with kebab-case event
/// names and camelCase payload fields, e.g.
/// `{"type":"join-meeting","meetingId":"m1","name":"a"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    JoinMeeting {
        meeting_id: String,
        name: String,
    },

    /// Peer-to-peer SDP offer, relayed verbatim.
    Offer {
        room_id: String,
        sdp: serde_json::Value,
    },

    /// Peer-to-peer SDP answer, relayed verbatim.
    Answer {
        room_id: String,
        sdp: serde_json::Value,
    },

    /// Trickle ICE candidate for the sender or receiver leg, relayed verbatim.
    /// The leg is carried as `target` (the `type` key is taken by the event tag).
    IceCandidate {
        room_id: String,
        candidate: serde_json::Value,
        target: CandidateTarget,
    },

    /// Overlay landmark hints for the peer's local compositor.
    OverlayData {
        meeting_id: String,
        landmarks: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        overlay_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        opacity: Option<f32>,
    },

    GetRouterCapabilities,

    CreateTransport {
        direction: TransportDirection,
    },

    ConnectTransport {
        transport_id: Uuid,
        dtls_parameters: DtlsParameters,
    },

    Produce {
        transport_id: Uuid,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    Consume {
        transport_id: Uuid,
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
    },

    ConsumerResume {
        consumer_id: Uuid,
    },

    ChangeOverlay {
        overlay_url: String,
    },

    ChangeOpacity {
        opacity: f32,
    },

    ToggleOverlay {
        enabled: bool,
    },
}

/// Events emitted by the server on the signalling channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Sole participant so far; waiting for a partner.
    Waiting,

    PartnerConnected {
        meeting_id: String,
    },

    /// Relayed peer-to-peer offer.
    Offer {
        room_id: String,
        sdp: serde_json::Value,
    },

    /// Relayed peer-to-peer answer.
    Answer {
        room_id: String,
        sdp: serde_json::Value,
    },

    /// Relayed trickle ICE candidate.
    IceCandidate {
        room_id: String,
        candidate: serde_json::Value,
        target: CandidateTarget,
    },

    RouterCapabilities {
        rtp_capabilities: RtpCapabilities,
    },

    TransportCreated {
        id: Uuid,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
        direction: TransportDirection,
    },

    TransportConnected {
        transport_id: Uuid,
    },

    ProducerCreated {
        id: Uuid,
    },

    ConsumerCreated {
        id: Uuid,
        producer_id: Uuid,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    /// A producer the peer should consume. For video this carries the
    /// processed producer id, never the raw one.
    NewProducer {
        producer_id: Uuid,
        kind: MediaKind,
    },

    /// Relayed overlay landmark hints.
    OverlayData {
        landmarks: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        overlay_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        opacity: Option<f32>,
    },

    OverlayChanged {
        overlay_url: String,
    },

    OpacityChanged {
        opacity: f32,
    },

    OverlayToggled {
        enabled: bool,
    },

    UserDisconnected,

    Error {
        message: String,
    },
}
