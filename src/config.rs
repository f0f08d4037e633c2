#![forbid(unsafe_code)]

// Process configuration read from the environment

use crate::media::MediaConfig;
use anyhow::{anyhow, Result};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
const DEFAULT_WORKER_DEATH_GRACE: Duration = Duration::from_millis(2000);

/// Everything main needs to start the server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    pub metrics_token: Option<String>,
    /// How long to wait for logs to flush before exiting on worker death
    pub worker_death_grace: Duration,
    pub media: MediaConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            metrics_token: None,
            worker_death_grace: DEFAULT_WORKER_DEATH_GRACE,
            media: MediaConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads PORT, MAX_CONNECTIONS, RTC_MIN_PORT, RTC_MAX_PORT, LISTEN_IP, ANNOUNCE_IP,
    /// WORKER_DEATH_GRACE_MS and METRICS_TOKEN
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = parse::<u16>(&lookup, "PORT") {
            config.port = port;
        }

        match parse::<usize>(&lookup, "MAX_CONNECTIONS") {
            Some(0) => warn!("MAX_CONNECTIONS=0 would reject all connections, using default {}", DEFAULT_MAX_CONNECTIONS),
            Some(n) => config.max_connections = n,
            None => {}
        }

        if let Some(ms) = parse::<u64>(&lookup, "WORKER_DEATH_GRACE_MS") {
            config.worker_death_grace = Duration::from_millis(ms);
        }

        config.metrics_token = lookup("METRICS_TOKEN").filter(|t| !t.is_empty());

        let min = parse::<u16>(&lookup, "RTC_MIN_PORT").unwrap_or(config.media.worker_config.rtc_min_port);
        let max = parse::<u16>(&lookup, "RTC_MAX_PORT").unwrap_or(config.media.worker_config.rtc_max_port);
        config.media.worker_config = config
            .media
            .worker_config
            .with_port_range(min, max)
            .map_err(|e| anyhow!(e))?;

        if let Some(ip) = lookup("LISTEN_IP") {
            let addr: IpAddr = ip.parse().map_err(|_| anyhow!("Invalid LISTEN_IP: {ip}"))?;
            config.media.webrtc_transport_config = config.media.webrtc_transport_config.with_listen_ip(addr);
        }

        if let Some(ip) = lookup("ANNOUNCE_IP") {
            info!("Using ANNOUNCE_IP={}", ip);
            let addr: IpAddr = ip.parse().map_err(|_| anyhow!("Invalid ANNOUNCE_IP: {ip}"))?;
            config.media.webrtc_transport_config = config.media.webrtc_transport_config.with_public_ip(addr);
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {}={}", key, raw);
            None
        }
    }
}
