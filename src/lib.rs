#![forbid(unsafe_code)]

// SFU signaling library - session, transport, producer and consumer control plane

pub mod config;
pub mod media;
pub mod metrics;
pub mod session;
pub mod signaling;
