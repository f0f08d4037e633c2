#![forbid(unsafe_code)]

// Capability lookups and the producer checks run before the engine is asked

use crate::media::engine::Router;
use crate::media::rtp_parameters::{
    CodecParameters, MediaKind, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
};
use serde_json::Value;

/// Read-only projection of a router's capabilities
pub fn get_capabilities(router: &dyn Router) -> RtpCapabilities {
    router.rtp_capabilities().clone()
}

fn packetization_mode(parameters: &CodecParameters) -> u64 {
    match parameters.get("packetization-mode") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Whether a stream codec can be carried as the given capability
pub fn codec_matches(codec: &RtpCodecParameters, capability: &RtpCodecCapability) -> bool {
    if !codec.mime_type.eq_ignore_ascii_case(&capability.mime_type) {
        return false;
    }
    if codec.clock_rate != capability.clock_rate {
        return false;
    }
    if capability.kind == MediaKind::Audio
        && codec.channels.unwrap_or(1) != capability.channels.unwrap_or(1)
    {
        return false;
    }
    if codec.mime_type.eq_ignore_ascii_case("video/H264")
        && packetization_mode(&codec.parameters) != packetization_mode(&capability.parameters)
    {
        return false;
    }
    true
}

/// Finds the capability matching a stream codec
pub fn find_capability<'a>(
    capabilities: &'a RtpCapabilities,
    kind: MediaKind,
    codec: &RtpCodecParameters,
) -> Option<&'a RtpCodecCapability> {
    capabilities
        .codecs
        .iter()
        .find(|capability| capability.kind == kind && codec_matches(codec, capability))
}

/// Checks that RTP parameters a browser wants to produce are usable on the router
pub fn validate_producer_parameters(
    kind: MediaKind,
    rtp_parameters: &RtpParameters,
    router_capabilities: &RtpCapabilities,
) -> Result<(), String> {
    if rtp_parameters.codecs.is_empty() {
        return Err("rtpParameters.codecs must not be empty".to_string());
    }

    for codec in &rtp_parameters.codecs {
        if MediaKind::from_mime_type(&codec.mime_type) != Some(kind) {
            return Err(format!("codec {} does not match kind {kind}", codec.mime_type));
        }
    }

    let media_codec = rtp_parameters
        .media_codec()
        .ok_or_else(|| "rtpParameters carry no media codec".to_string())?;

    if find_capability(router_capabilities, kind, media_codec).is_none() {
        return Err(format!("unsupported codec {}/{}", media_codec.mime_type, media_codec.clock_rate));
    }

    Ok(())
}
