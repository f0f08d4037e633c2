#![forbid(unsafe_code)]

// Transport level data structures (ICE, DTLS) and entity identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

entity_id!(
    /// Identifies a media worker
    WorkerId
);
entity_id!(
    /// Identifies a router
    RouterId
);
entity_id!(
    /// Identifies a WebRTC transport
    TransportId
);
entity_id!(
    /// Identifies a producer
    ProducerId
);
entity_id!(
    /// Identifies a consumer
    ConsumerId
);

/// Direction of a transport, fixed at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportRole {
    /// Browser sends media to the server (producers live here)
    Send,
    /// Server sends media to the browser (consumers live here)
    #[serde(alias = "recv")]
    Receive,
}

impl fmt::Display for TransportRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportRole::Send => f.write_str("send"),
            TransportRole::Receive => f.write_str("receive"),
        }
    }
}

/// Network protocol of a listening socket or candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

/// Address a transport listens on, optionally announced under another address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenInfo {
    pub ip: IpAddr,
    pub announced_address: Option<String>,
}

/// ICE parameters of the server side of a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

/// ICE candidate type (the server is ICE-lite, so only host candidates exist)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceCandidateType {
    Host,
}

/// TCP candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceCandidateTcpType {
    Passive,
}

/// A local ICE candidate the browser can reach the server on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    #[serde(alias = "ip")]
    pub address: String,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: IceCandidateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<IceCandidateTcpType>,
}

/// DTLS role of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

/// Certificate fingerprint announced over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// Hash functions accepted in remote DTLS fingerprints
pub const FINGERPRINT_ALGORITHMS: [&str; 5] = ["sha-1", "sha-224", "sha-256", "sha-384", "sha-512"];

impl DtlsFingerprint {
    /// Checks the algorithm is known and the value is colon separated hex octets
    pub fn is_well_formed(&self) -> bool {
        let algorithm = self.algorithm.to_ascii_lowercase();
        if !FINGERPRINT_ALGORITHMS.contains(&algorithm.as_str()) {
            return false;
        }
        !self.value.is_empty()
            && self
                .value
                .split(':')
                .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()))
    }
}

/// DTLS parameters of one side of a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

impl DtlsParameters {
    /// Remote parameters need at least one fingerprint and every fingerprint must parse
    pub fn validate(&self) -> Result<(), String> {
        if self.fingerprints.is_empty() {
            return Err("dtlsParameters.fingerprints must not be empty".to_string());
        }
        if let Some(bad) = self.fingerprints.iter().find(|f| !f.is_well_formed()) {
            return Err(format!("malformed DTLS fingerprint ({})", bad.algorithm));
        }
        Ok(())
    }
}

/// DTLS state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}
