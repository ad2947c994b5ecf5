//! SFU contract consumed by the session manager and the media pipeline.
//!
//! The SFU itself is an external collaborator; everything the server
//! needs from it is expressed as these traits: a router handing out
//! transports, plain transports speaking raw RTP/RTCP on loopback for the
//! decoder/encoder legs, and producer/consumer handles. `local` provides
//! the in-process implementation the binary runs with.

pub mod local;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use maskmeet_protocol::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
};

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("transport setup failed: {0}")]
    Transport(String),

    #[error("producer {0} not found")]
    ProducerNotFound(Uuid),

    #[error("cannot consume producer {0} with the given capabilities")]
    CannotConsume(Uuid),

    #[error("transport is closed")]
    TransportClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SfuError>;

/// Options for creating a plain RTP transport.
#[derive(Debug, Clone)]
pub struct PlainTransportOptions {
    pub listen_ip: IpAddr,
    /// When false, RTCP uses its own socket one port above RTP.
    pub rtcp_mux: bool,
    /// When true the transport learns its remote endpoint from the first
    /// received packet instead of `connect`.
    pub comedia: bool,
}

/// Remote endpoint handed to `PlainTransport::connect`.
#[derive(Debug, Clone)]
pub struct PlainTransportRemote {
    pub ip: IpAddr,
    pub port: u16,
    pub rtcp_port: Option<u16>,
}

/// Local (and, once known, remote) endpoint of a transport socket.
#[derive(Debug, Clone, Copy)]
pub struct TransportTuple {
    pub local_ip: IpAddr,
    pub local_port: u16,
}

#[async_trait]
pub trait Router: Send + Sync {
    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn can_consume(&self, producer_id: Uuid, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(&self) -> Result<Arc<dyn WebRtcTransport>>;

    async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> Result<Arc<dyn PlainTransport>>;
}

#[async_trait]
pub trait PlainTransport: Send + Sync {
    fn id(&self) -> Uuid;

    /// RTP socket endpoint.
    fn tuple(&self) -> TransportTuple;

    /// RTCP socket endpoint when `rtcp_mux` is off.
    fn rtcp_tuple(&self) -> Option<TransportTuple>;

    async fn connect(&self, remote: PlainTransportRemote) -> Result<()>;

    async fn consume(
        &self,
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>>;

    async fn close(&self);
}

#[async_trait]
pub trait WebRtcTransport: Send + Sync {
    fn id(&self) -> Uuid;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> Vec<IceCandidate>;

    fn dtls_parameters(&self) -> DtlsParameters;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>>;

    async fn consume(
        &self,
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>>;

    async fn close(&self);
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> Uuid;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    async fn close(&self);
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> Uuid;

    fn producer_id(&self) -> Uuid;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    async fn resume(&self);

    async fn close(&self);
}
