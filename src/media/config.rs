#![forbid(unsafe_code)]

// Configuration for the media worker, routers, and transports

use crate::media::data_structures::ListenInfo;
use crate::media::engine::{RouterOptions, WebRtcTransportOptions, WorkerLogLevel, WorkerSettings};
use crate::media::rtp_parameters::{CodecParameters, MediaKind, RtcpFeedback, RtpCodecCapability};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr};

/// Main media server configuration
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub router_config: RouterConfig,
    pub webrtc_transport_config: WebRtcTransportConfig,
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub log_level: WorkerLogLevel,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_level: WorkerLogLevel::Debug,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }
}

impl WorkerConfig {
    /// Overrides the RTC port range, rejecting inverted ranges
    pub fn with_port_range(mut self, min: u16, max: u16) -> Result<Self, String> {
        if min > max {
            return Err(format!("invalid RTC port range {min}..={max}"));
        }
        self.rtc_min_port = min;
        self.rtc_max_port = max;
        Ok(self)
    }

    /// Converts to engine WorkerSettings
    pub fn to_worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            rtc_port_range: self.rtc_min_port..=self.rtc_max_port,
            log_level: self.log_level,
        }
    }
}

/// Router configuration with codec capabilities
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    /// Returns default codec capabilities: opus for audio, VP8 for video
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        let mut vp8_parameters = CodecParameters::new();
        vp8_parameters.insert("x-google-start-bitrate".to_string(), Value::from(1000));

        vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                preferred_payload_type: None,
                clock_rate: 48000,
                channels: Some(2),
                parameters: CodecParameters::new(),
                rtcp_feedback: vec![RtcpFeedback::new("transport-cc", "")],
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                preferred_payload_type: None,
                clock_rate: 90000,
                channels: None,
                parameters: vp8_parameters,
                rtcp_feedback: vec![
                    RtcpFeedback::new("nack", ""),
                    RtcpFeedback::new("nack", "pli"),
                    RtcpFeedback::new("ccm", "fir"),
                    RtcpFeedback::new("goog-remb", ""),
                    RtcpFeedback::new("transport-cc", ""),
                ],
            },
        ]
    }

    /// Converts to RouterOptions for the engine
    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions {
            media_codecs: self.media_codecs.clone(),
        }
    }
}

/// WebRTC transport configuration
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub listen_infos: Vec<ListenInfo>,
    pub initial_available_outgoing_bitrate: u32,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_infos: vec![ListenInfo {
                ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                announced_address: None,
            }],
            initial_available_outgoing_bitrate: 600_000,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

impl WebRtcTransportConfig {
    /// Sets the local IP the transports listen on
    pub fn with_listen_ip(mut self, ip: IpAddr) -> Self {
        match self.listen_infos.first_mut() {
            Some(listen_info) => listen_info.ip = ip,
            None => self.listen_infos.push(ListenInfo { ip, announced_address: None }),
        }
        self
    }

    /// Sets the public address announced in ICE candidates
    pub fn with_public_ip(mut self, public_ip: IpAddr) -> Self {
        if let Some(listen_info) = self.listen_infos.first_mut() {
            listen_info.announced_address = Some(public_ip.to_string());
        }
        self
    }

    /// Converts to WebRtcTransportOptions
    pub fn to_transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_infos: self.listen_infos.clone(),
            enable_udp: self.enable_udp,
            enable_tcp: self.enable_tcp,
            prefer_udp: self.prefer_udp,
            initial_available_outgoing_bitrate: self.initial_available_outgoing_bitrate,
        }
    }
}
