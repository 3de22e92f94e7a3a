//! Media negotiation types.
//!
//! These mirror what the media engine hands out and what client devices
//! send back. The SFU core treats most of them as opaque and relays them
//! verbatim; only codec matching is interpreted here.

use common::TransportId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Kind of media carried by a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl MediaKind {
    /// Every media kind, in re-produce order.
    pub const ALL: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];

    /// Returns the kind as a string for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a transport relative to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client sends media to the SFU (producers live here)
    Send,
    /// Client receives media from the SFU (consumers live here)
    Recv,
}

impl Direction {
    /// Returns the direction as a string for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Recv => "recv",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A codec supported by a routing context or a receiving device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
}

impl CodecCapability {
    /// Audio codec capability.
    #[must_use]
    pub fn audio(mime_type: impl Into<String>, clock_rate: u32, channels: u8) -> Self {
        Self {
            kind: MediaKind::Audio,
            mime_type: mime_type.into(),
            clock_rate,
            channels: Some(channels),
            parameters: BTreeMap::new(),
        }
    }

    /// Video codec capability.
    #[must_use]
    pub fn video(mime_type: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            kind: MediaKind::Video,
            mime_type: mime_type.into(),
            clock_rate,
            channels: None,
            parameters: BTreeMap::new(),
        }
    }

    /// Add a format parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Whether two capabilities describe the same codec.
    ///
    /// Mime types compare case-insensitively; format parameters are not
    /// compared (profile negotiation belongs to the media engine).
    #[must_use]
    pub fn matches(&self, other: &CodecCapability) -> bool {
        self.kind == other.kind
            && self.mime_type.eq_ignore_ascii_case(&other.mime_type)
            && self.clock_rate == other.clock_rate
            && channels_match(self.channels, other.channels)
    }
}

fn channels_match(a: Option<u8>, b: Option<u8>) -> bool {
    a.unwrap_or(1) == b.unwrap_or(1)
}

/// The codec set of a routing context, or the receive capabilities a client
/// declares after loading its device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<CodecCapability>,
}

impl RtpCapabilities {
    /// Whether any codec of the given kind is present.
    #[must_use]
    pub fn supports_kind(&self, kind: MediaKind) -> bool {
        self.codecs.iter().any(|c| c.kind == kind)
    }

    /// Whether a codec matching `codec` is present.
    #[must_use]
    pub fn supports(&self, codec: &CodecCapability) -> bool {
        self.codecs.iter().any(|c| c.matches(codec))
    }

    /// Codecs present in both capability sets, in `self` order.
    #[must_use]
    pub fn intersect(&self, other: &RtpCapabilities) -> RtpCapabilities {
        RtpCapabilities {
            codecs: self
                .codecs
                .iter()
                .filter(|c| other.supports(c))
                .cloned()
                .collect(),
        }
    }
}

/// A negotiated codec inside RTP parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
}

impl RtpCodecParameters {
    /// The capability this codec corresponds to, for the given kind.
    #[must_use]
    pub fn as_capability(&self, kind: MediaKind) -> CodecCapability {
        CodecCapability {
            kind,
            mime_type: self.mime_type.clone(),
            clock_rate: self.clock_rate,
            channels: self.channels,
            parameters: self.parameters.clone(),
        }
    }
}

/// One RTP encoding (simulcast layer or single stream).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncoding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
}

/// Encoding parameters (producer side) or decoding parameters (consumer side).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncoding>,
}

/// ICE credentials of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

/// Transport protocol of an ICE candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

/// A server-side ICE candidate announced to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub protocol: TransportProtocol,
    #[serde(rename = "type")]
    pub candidate_type: String,
}

/// DTLS role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

/// A certificate fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS (security) parameters exchanged during the transport handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<DtlsRole>,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Negotiation parameters of a freshly created transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Codec set every routing context is created with.
///
/// Opus for audio, VP8 and constrained-baseline H264 for video.
#[must_use]
pub fn default_media_codecs() -> Vec<CodecCapability> {
    vec![
        CodecCapability::audio("audio/opus", 48_000, 2),
        CodecCapability::video("video/VP8", 90_000),
        CodecCapability::video("video/H264", 90_000)
            .with_parameter("packetization-mode", 1)
            .with_parameter("profile-level-id", "42e01f")
            .with_parameter("level-asymmetry-allowed", 1),
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_match_is_case_insensitive() {
        let a = CodecCapability::video("video/VP8", 90_000);
        let b = CodecCapability::video("video/vp8", 90_000);
        assert!(a.matches(&b));

        let c = CodecCapability::video("video/VP8", 48_000);
        assert!(!a.matches(&c));
    }

    #[test]
    fn test_audio_channels_must_match() {
        let stereo = CodecCapability::audio("audio/opus", 48_000, 2);
        let mono = CodecCapability::audio("audio/opus", 48_000, 1);
        assert!(!stereo.matches(&mono));
    }

    #[test]
    fn test_intersect_keeps_common_codecs() {
        let router = RtpCapabilities {
            codecs: default_media_codecs(),
        };
        let device = RtpCapabilities {
            codecs: vec![CodecCapability::video("video/H264", 90_000)],
        };

        let common = router.intersect(&device);
        assert_eq!(common.codecs.len(), 1);
        assert!(common.supports_kind(MediaKind::Video));
        assert!(!common.supports_kind(MediaKind::Audio));
    }

    #[test]
    fn test_default_codecs_serialize_camel_case() {
        let caps = RtpCapabilities {
            codecs: default_media_codecs(),
        };
        let json = serde_json::to_value(&caps).unwrap();
        assert_eq!(json["codecs"][0]["mimeType"], "audio/opus");
        assert_eq!(json["codecs"][0]["clockRate"], 48_000);
        assert_eq!(json["codecs"][2]["parameters"]["profile-level-id"], "42e01f");
        assert!(json["codecs"][1].get("channels").is_none());
    }

    #[test]
    fn test_kind_and_direction_wire_names() {
        assert_eq!(serde_json::to_string(&MediaKind::Video).unwrap(), "\"video\"");
        assert_eq!(serde_json::to_string(&Direction::Recv).unwrap(), "\"recv\"");
        assert_eq!(MediaKind::Audio.to_string(), "audio");
    }
}
