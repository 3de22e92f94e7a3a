//! Pre-configured test data fixtures for SFU testing.
//!
//! Provides:
//! - Room codes unique per test
//! - Client DTLS parameters
//! - Sending RTP parameters for the default codecs
//! - Receive capability sets (full, audio-only, H264-only)

use signaling_protocol::{
    CodecCapability, DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, RtpCapabilities,
    RtpCodecParameters, RtpEncoding, RtpParameters,
};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A room code no other test uses.
#[must_use]
pub fn unique_room_code() -> String {
    format!("room-{}", Uuid::new_v4().simple())
}

/// DTLS parameters of a well-behaved client.
#[must_use]
pub fn client_dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: Some(DtlsRole::Client),
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99:AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99".to_string(),
        }],
    }
}

/// Opus sending parameters.
#[must_use]
pub fn opus_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 111,
            clock_rate: 48_000,
            channels: Some(2),
            parameters: BTreeMap::new(),
        }],
        encodings: vec![RtpEncoding {
            ssrc: Some(1111),
            max_bitrate: None,
        }],
    }
}

/// VP8 sending parameters.
#[must_use]
pub fn vp8_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("1".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 96,
            clock_rate: 90_000,
            channels: None,
            parameters: BTreeMap::new(),
        }],
        encodings: vec![RtpEncoding {
            ssrc: Some(2222),
            max_bitrate: Some(600_000),
        }],
    }
}

/// Default sending parameters for `kind`.
#[must_use]
pub fn rtp_parameters_for(kind: MediaKind) -> RtpParameters {
    match kind {
        MediaKind::Audio => opus_parameters(),
        MediaKind::Video => vp8_parameters(),
    }
}

/// A receiver that decodes Opus only.
#[must_use]
pub fn audio_only_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![CodecCapability::audio("audio/opus", 48_000, 2)],
    }
}

/// A receiver that decodes Opus and H264 but not VP8.
#[must_use]
pub fn h264_only_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            CodecCapability::audio("audio/opus", 48_000, 2),
            CodecCapability::video("video/H264", 90_000)
                .with_parameter("packetization-mode", 1)
                .with_parameter("profile-level-id", "42e01f")
                .with_parameter("level-asymmetry-allowed", 1),
        ],
    }
}

/// Receive capabilities matching every default codec.
#[must_use]
pub fn full_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: signaling_protocol::default_media_codecs(),
    }
}
