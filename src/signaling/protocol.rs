#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use crate::media::data_structures::{
    ConsumerId, DtlsParameters, IceCandidate, IceParameters, ProducerId, TransportId, TransportRole,
};
use crate::media::rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters};
use crate::media::types::{
    CloseReason, ConsumerInfo, ConsumerMode, ErrorCategory, MediaError, TransportInfo,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Get the session router's capabilities
    GetCapabilities,
    /// Create the send or receive transport
    CreateTransport {
        role: TransportRole,
    },
    /// Connect a transport with the browser's DTLS parameters
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        role: TransportRole,
        dtls_parameters: DtlsParameters,
    },
    /// Produce media (audio/video) on the send transport
    #[serde(rename_all = "camelCase")]
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        app_data: Value,
    },
    /// Consume a producer on the receive transport
    #[serde(rename_all = "camelCase")]
    Consume {
        #[serde(default)]
        producer_id: Option<ProducerId>,
        #[serde(alias = "rtpCapabilities")]
        peer_capabilities: RtpCapabilities,
    },
    /// Resume a paused consumer
    #[serde(rename_all = "camelCase")]
    ResumeConsumer {
        consumer_id: ConsumerId,
    },
    /// Close one of the peer's own producers
    #[serde(rename_all = "camelCase")]
    CloseProducer {
        producer_id: ProducerId,
    },
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First message on every connection
    Welcome {
        message: String,
    },
    /// The peer was admitted to a session
    #[serde(rename_all = "camelCase")]
    ConnectionSuccess {
        peer_id: String,
        session_id: String,
    },
    /// Router capabilities of the peer's session
    #[serde(rename_all = "camelCase")]
    Capabilities {
        rtp_capabilities: RtpCapabilities,
    },
    /// Transport created
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        role: TransportRole,
        id: TransportId,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
    },
    /// Transport connected
    #[serde(rename_all = "camelCase")]
    TransportConnected {
        role: TransportRole,
    },
    /// Producer created
    #[serde(rename_all = "camelCase")]
    ProducerCreated {
        producer_id: ProducerId,
        kind: MediaKind,
    },
    /// Consumer created (always paused)
    #[serde(rename_all = "camelCase")]
    ConsumerCreated {
        id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        mode: ConsumerMode,
        paused: bool,
    },
    /// Consumer resumed
    #[serde(rename_all = "camelCase")]
    ConsumerResumed {
        consumer_id: ConsumerId,
    },
    /// A producer of the session went away
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        peer_id: String,
        producer_id: ProducerId,
    },
    /// One of the peer's consumers went away without being asked to
    #[serde(rename_all = "camelCase")]
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        reason: CloseReason,
    },
    /// One of the peer's transports closed (DTLS closed or engine teardown)
    #[serde(rename_all = "camelCase")]
    TransportClosed {
        role: TransportRole,
        transport_id: TransportId,
    },
    /// New producer available from another peer
    #[serde(rename_all = "camelCase")]
    NewProducer {
        peer_id: String,
        producer_id: ProducerId,
        kind: MediaKind,
    },
    /// Peer left the session
    #[serde(rename_all = "camelCase")]
    PeerLeft {
        peer_id: String,
    },
    /// Error response
    Error {
        category: ErrorCategory,
        message: String,
    },
}

impl ClientMessage {
    /// Wire name of the request, used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::GetCapabilities => "get-capabilities",
            ClientMessage::CreateTransport { .. } => "create-transport",
            ClientMessage::ConnectTransport { .. } => "connect-transport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::ResumeConsumer { .. } => "resume-consumer",
            ClientMessage::CloseProducer { .. } => "close-producer",
        }
    }
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::ConnectionSuccess { .. } => "connection-success",
            ServerMessage::Capabilities { .. } => "capabilities",
            ServerMessage::TransportCreated { .. } => "transport-created",
            ServerMessage::TransportConnected { .. } => "transport-connected",
            ServerMessage::ProducerCreated { .. } => "producer-created",
            ServerMessage::ConsumerCreated { .. } => "consumer-created",
            ServerMessage::ConsumerResumed { .. } => "consumer-resumed",
            ServerMessage::ProducerClosed { .. } => "producer-closed",
            ServerMessage::ConsumerClosed { .. } => "consumer-closed",
            ServerMessage::TransportClosed { .. } => "transport-closed",
            ServerMessage::NewProducer { .. } => "new-producer",
            ServerMessage::PeerLeft { .. } => "peer-left",
            ServerMessage::Error { .. } => "error",
        }
    }

    pub fn transport_created(role: TransportRole, info: TransportInfo) -> Self {
        ServerMessage::TransportCreated {
            role,
            id: info.id,
            ice_parameters: info.ice_parameters,
            ice_candidates: info.ice_candidates,
            dtls_parameters: info.dtls_parameters,
        }
    }

    pub fn consumer_created(info: ConsumerInfo) -> Self {
        ServerMessage::ConsumerCreated {
            id: info.id,
            producer_id: info.producer_id,
            kind: info.kind,
            rtp_parameters: info.rtp_parameters,
            mode: info.mode,
            paused: info.paused,
        }
    }

    pub fn error(error: &MediaError) -> Self {
        ServerMessage::Error {
            category: error.category(),
            message: error.to_string(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            category: ErrorCategory::MalformedRequest,
            message: message.into(),
        }
    }
}

/// Parses one inbound text frame.
///
/// The request id is recovered even when the message itself is malformed, so the
/// error response can still be correlated.
pub fn parse_request(text: &str) -> (Option<u64>, Result<ClientMessage, String>) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return (None, Err(format!("Invalid JSON: {e}"))),
    };
    let request_id = value.get("requestId").and_then(Value::as_u64);
    let message = serde_json::from_value(value).map_err(|e| format!("Invalid message format: {e}"));
    (request_id, message)
}

/// Serializes a message, echoing the request id of the request it answers
pub fn encode(request_id: Option<u64>, message: &ServerMessage) -> serde_json::Result<String> {
    let mut value = serde_json::to_value(message)?;
    if let (Some(id), Value::Object(fields)) = (request_id, &mut value) {
        fields.insert("requestId".to_string(), Value::from(id));
    }
    serde_json::to_string(&value)
}
