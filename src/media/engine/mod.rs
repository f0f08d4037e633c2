#![forbid(unsafe_code)]

// Media engine collaborator interface.
// The signaling core drives workers, routers, transports, producers and consumers only
// through these traits; packet forwarding and ICE/DTLS/SRTP live behind them.

pub mod handlers;
#[cfg(test)]
pub mod local;
pub mod native;

pub use handlers::{Bag, HandlerId};
#[cfg(test)]
pub use local::LocalEngine;
pub use native::MediasoupEngine;

use crate::media::data_structures::{
    ConsumerId, DtlsParameters, DtlsState, IceCandidate, IceParameters, ListenInfo, ProducerId,
    RouterId, TransportId, WorkerId,
};
use crate::media::rtp_parameters::{MediaKind, RtpCapabilities, RtpCodecCapability, RtpParameters};
use async_trait::async_trait;
use std::ops::RangeInclusive;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by the media engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("entity closed: {0}")]
    Closed(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid parameters: {0}")]
    TypeError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("resources exhausted: {0}")]
    Exhausted(String),
}

/// Log level of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLogLevel {
    Debug,
    Warn,
    Error,
    None,
}

/// Settings a worker is started with
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub rtc_port_range: RangeInclusive<u16>,
    pub log_level: WorkerLogLevel,
}

/// Options to create a router
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub media_codecs: Vec<RtpCodecCapability>,
}

/// Options to create a WebRTC transport
#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_infos: Vec<ListenInfo>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

/// Options to create a producer
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
    pub app_data: serde_json::Value,
}

impl ProducerOptions {
    pub fn new(kind: MediaKind, rtp_parameters: RtpParameters) -> Self {
        Self {
            kind,
            rtp_parameters,
            paused: false,
            app_data: serde_json::Value::Null,
        }
    }
}

/// Options to create a consumer
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
    pub paused: bool,
}

impl ConsumerOptions {
    pub fn new(producer_id: ProducerId, rtp_capabilities: RtpCapabilities) -> Self {
        Self {
            producer_id,
            rtp_capabilities,
            paused: false,
        }
    }
}

pub type DeadCallback = dyn Fn(&str) + Send + Sync;
pub type CloseCallback = dyn Fn() + Send + Sync;
pub type DtlsStateCallback = dyn Fn(DtlsState) + Send + Sync;

/// Entry point of the engine: spawns workers
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, settings: WorkerSettings) -> Result<Arc<dyn Worker>, EngineError>;
}

/// One media-processing worker
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> WorkerId;
    fn pid(&self) -> u32;
    fn closed(&self) -> bool;

    async fn create_router(&self, options: RouterOptions) -> Result<Arc<dyn Router>, EngineError>;

    /// Closes the worker and everything created on it
    fn close(&self);

    /// Fires when the worker dies unexpectedly
    fn on_dead(&self, callback: Arc<DeadCallback>) -> HandlerId;
}

/// Routing context matching producers to compatible consumers
#[async_trait]
pub trait Router: Send + Sync {
    fn id(&self) -> RouterId;
    fn rtp_capabilities(&self) -> &RtpCapabilities;
    fn closed(&self) -> bool;

    /// True iff the producer exists on this router and the capabilities can receive it
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn WebRtcTransport>, EngineError>;

    fn close(&self);

    fn on_close(&self, callback: Arc<CloseCallback>) -> HandlerId;
}

/// One ICE+DTLS network path
#[async_trait]
pub trait WebRtcTransport: Send + Sync {
    fn id(&self) -> TransportId;
    fn ice_parameters(&self) -> IceParameters;
    fn ice_candidates(&self) -> Vec<IceCandidate>;
    fn dtls_parameters(&self) -> DtlsParameters;
    fn dtls_state(&self) -> DtlsState;
    fn closed(&self) -> bool;

    /// Completes the DTLS handshake with the remote parameters
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    async fn produce(&self, options: ProducerOptions) -> Result<Arc<dyn Producer>, EngineError>;

    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn Consumer>, EngineError>;

    /// Closes the transport and everything bound to it
    fn close(&self);

    fn on_close(&self, callback: Arc<CloseCallback>) -> HandlerId;

    fn on_dtls_state_change(&self, callback: Arc<DtlsStateCallback>) -> HandlerId;
}

/// Inbound media source bound to a send transport
pub trait Producer: Send + Sync {
    fn id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> &RtpParameters;
    fn closed(&self) -> bool;

    /// Closes the producer and every consumer of it
    fn close(&self);

    fn on_close(&self, callback: Arc<CloseCallback>) -> HandlerId;

    fn on_transport_close(&self, callback: Arc<CloseCallback>) -> HandlerId;
}

/// Outbound forwarding target bound to a receive transport and a producer
#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> ConsumerId;
    fn producer_id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> &RtpParameters;
    fn paused(&self) -> bool;
    fn closed(&self) -> bool;

    /// Starts forwarding media
    async fn resume(&self) -> Result<(), EngineError>;

    fn close(&self);

    fn on_close(&self, callback: Arc<CloseCallback>) -> HandlerId;

    fn on_producer_close(&self, callback: Arc<CloseCallback>) -> HandlerId;

    fn on_transport_close(&self, callback: Arc<CloseCallback>) -> HandlerId;
}
