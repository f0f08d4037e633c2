#![forbid(unsafe_code)]

// Common types and error handling for the media module

use crate::media::data_structures::{
    ConsumerId, DtlsParameters, DtlsState, IceCandidate, IceParameters, ProducerId, TransportId,
    TransportRole,
};
use crate::media::engine::{Consumer, EngineError, HandlerId, Producer, WebRtcTransport};
use crate::media::rtp_parameters::{MediaKind, RtpParameters};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Custom error type for media operations
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No {0} transport")]
    TransportNotFound(TransportRole),

    #[error("A {0} transport already exists")]
    TransportExists(TransportRole),

    #[error("The {0} transport is closed")]
    TransportClosed(TransportRole),

    #[error("The {0} transport is already connected")]
    AlreadyConnected(TransportRole),

    #[error("The {0} transport is not connected")]
    NotConnected(TransportRole),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Producer closed: {0}")]
    ProducerClosed(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Consumer closed: {0}")]
    ConsumerClosed(String),

    #[error("Consumer is not paused: {0}")]
    ConsumerNotPaused(String),

    #[error("Cannot consume producer {0} with the given capabilities")]
    CannotConsume(String),

    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// How an error is reported to the requesting peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    /// Missing or invalid fields; nothing changed
    MalformedRequest,
    /// Entity in the wrong state; nothing changed
    PreconditionFailed,
    /// The media engine refused; nothing was created
    EngineFailure,
}

impl MediaError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            MediaError::InvalidRequest(_) => ErrorCategory::MalformedRequest,
            MediaError::PeerNotFound(_)
            | MediaError::SessionNotFound(_)
            | MediaError::TransportNotFound(_)
            | MediaError::TransportExists(_)
            | MediaError::TransportClosed(_)
            | MediaError::AlreadyConnected(_)
            | MediaError::NotConnected(_)
            | MediaError::ProducerNotFound(_)
            | MediaError::ProducerClosed(_)
            | MediaError::ConsumerNotFound(_)
            | MediaError::ConsumerClosed(_)
            | MediaError::ConsumerNotPaused(_)
            | MediaError::CannotConsume(_) => ErrorCategory::PreconditionFailed,
            MediaError::WorkerError(_) | MediaError::Engine(_) => ErrorCategory::EngineFailure,
        }
    }
}

/// Transport information for signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

impl TransportInfo {
    pub fn from_transport(transport: &dyn WebRtcTransport) -> Self {
        Self {
            id: transport.id(),
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
        }
    }
}

/// Producer information for signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub id: ProducerId,
    pub kind: MediaKind,
}

/// Forwarding mode of a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerMode {
    /// Single layer, non-scalable forwarding
    Simple,
}

/// Consumer information for signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub mode: ConsumerMode,
    pub paused: bool,
}

impl ConsumerInfo {
    pub fn from_consumer(consumer: &dyn Consumer) -> Self {
        Self {
            id: consumer.id(),
            producer_id: consumer.producer_id(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
            mode: ConsumerMode::Simple,
            paused: consumer.paused(),
        }
    }
}

/// Why a consumer went away without its owner asking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    ProducerClosed,
    TransportClosed,
}

/// Closure notifications raised by engine observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    TransportClosed {
        peer_id: String,
        role: TransportRole,
        transport_id: TransportId,
    },
    ProducerClosed {
        peer_id: String,
        producer_id: ProducerId,
    },
    ConsumerClosed {
        peer_id: String,
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        reason: CloseReason,
    },
}

/// A transport owned by a peer plus the observers registered on it.
/// The `_handlers` guards are held only so the observers stay registered
/// for the lifetime of the entry; dropping them unregisters.
pub struct TransportEntry {
    pub transport: Arc<dyn WebRtcTransport>,
    pub role: TransportRole,
    pub connected: bool,
    pub(crate) _handlers: Vec<HandlerId>,
}

pub struct ProducerEntry {
    pub producer: Arc<dyn Producer>,
    pub(crate) _handlers: Vec<HandlerId>,
}

pub struct ConsumerEntry {
    pub consumer: Arc<dyn Consumer>,
    pub(crate) _handlers: Vec<HandlerId>,
}

/// Peer media state
pub struct PeerMedia {
    pub id: String,
    pub send_transport: Option<TransportEntry>,
    pub recv_transport: Option<TransportEntry>,
    pub producers: HashMap<ProducerId, ProducerEntry>,
    pub consumers: HashMap<ConsumerId, ConsumerEntry>,
}

impl PeerMedia {
    pub fn new(id: String) -> Self {
        Self {
            id,
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    pub fn transport(&self, role: TransportRole) -> Option<&TransportEntry> {
        match role {
            TransportRole::Send => self.send_transport.as_ref(),
            TransportRole::Receive => self.recv_transport.as_ref(),
        }
    }

    pub fn transport_slot(&mut self, role: TransportRole) -> &mut Option<TransportEntry> {
        match role {
            TransportRole::Send => &mut self.send_transport,
            TransportRole::Receive => &mut self.recv_transport,
        }
    }

    /// Drops entries the engine already closed; their observers unregister with them
    pub fn prune_closed(&mut self) {
        self.consumers.retain(|_, entry| !entry.consumer.closed());
        self.producers.retain(|_, entry| !entry.producer.closed());
        for role in [TransportRole::Send, TransportRole::Receive] {
            let slot = self.transport_slot(role);
            if slot.as_ref().is_some_and(|entry| entry.transport.closed()) {
                *slot = None;
            }
        }
    }

    /// Closes all media resources for this peer
    pub fn close_all(&mut self) {
        for (_, entry) in self.consumers.drain() {
            entry.consumer.close();
        }
        for (_, entry) in self.producers.drain() {
            entry.producer.close();
        }
        for role in [TransportRole::Send, TransportRole::Receive] {
            if let Some(entry) = self.transport_slot(role).take() {
                entry.transport.close();
            }
        }
    }

    /// Counts the entities the engine still has open
    pub fn open_counts(&self) -> EntityCounts {
        EntityCounts {
            transports: [TransportRole::Send, TransportRole::Receive]
                .into_iter()
                .filter_map(|role| self.transport(role))
                .filter(|entry| !entry.transport.closed())
                .count(),
            producers: self.producers.values().filter(|entry| !entry.producer.closed()).count(),
            consumers: self.consumers.values().filter(|entry| !entry.consumer.closed()).count(),
        }
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        let transports = [TransportRole::Send, TransportRole::Receive]
            .into_iter()
            .filter_map(|role| self.transport(role))
            .filter(|entry| !entry.transport.closed())
            .map(|entry| TransportState {
                id: entry.transport.id(),
                role: entry.role,
                connected: entry.connected,
                dtls_state: entry.transport.dtls_state(),
            })
            .collect();

        let mut producers: Vec<ProducerId> = self
            .producers
            .values()
            .filter(|entry| !entry.producer.closed())
            .map(|entry| entry.producer.id())
            .collect();
        producers.sort();

        let mut consumers: Vec<ConsumerState> = self
            .consumers
            .values()
            .filter(|entry| !entry.consumer.closed())
            .map(|entry| ConsumerState {
                id: entry.consumer.id(),
                producer_id: entry.consumer.producer_id(),
                paused: entry.consumer.paused(),
            })
            .collect();
        consumers.sort_by_key(|c| c.id);

        PeerSnapshot {
            transports,
            producers,
            consumers,
        }
    }
}

/// Open entity totals for one peer or summed over all of them
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EntityCounts {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

/// Open transport as seen from outside
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportState {
    pub id: TransportId,
    pub role: TransportRole,
    pub connected: bool,
    pub dtls_state: DtlsState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerState {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub paused: bool,
}

/// Point-in-time view of a peer's open entities
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub transports: Vec<TransportState>,
    pub producers: Vec<ProducerId>,
    pub consumers: Vec<ConsumerState>,
}

impl PeerSnapshot {
    pub fn transport(&self, role: TransportRole) -> Option<&TransportState> {
        self.transports.iter().find(|t| t.role == role)
    }
}
