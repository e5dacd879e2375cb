//! Call-signaling wire types.
//!
//! The core relays these between participants and decides peer-to-peer vs
//! relay routing; actual media forwarding lives behind the relay control
//! interface.

use serde::{Deserialize, Serialize};

/// Media type for the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Audio,
    Video,
    AudioVideo,
}

/// How call media is routed, decided once at call start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    /// Direct media between peers (small calls)
    PeerToPeer,
    /// Media forwarded through the external relay (group calls)
    Relay,
}

/// Call session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Ringing,
    Accepted,
    Connected,
    Ended,
    Rejected,
}

/// Why an invitee rejected a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Busy,
    Unavailable,
    Declined,
    Error,
}

impl RejectReason {
    /// Whether the caller may reasonably retry after this rejection.
    /// A deliberate decline is final; the rest are circumstantial.
    #[must_use]
    pub const fn retryable(&self) -> bool {
        !matches!(self, Self::Declined)
    }
}

/// ICE candidate for WebRTC connection establishment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Full candidate string
    pub candidate: String,
    /// SDP mid
    pub sdp_mid: Option<String>,
    /// SDP mline index
    pub sdp_mline_index: Option<u32>,
}

/// Signaling payload relayed verbatim between call participants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
}

impl SignalPayload {
    #[must_use]
    pub const fn kind(&self) -> &str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice_candidate",
        }
    }
}

/// Per-participant transport connection state as reported by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerConnectionState {
    Checking,
    Connected,
    Disconnected,
    Failed,
    Reconnecting,
}

/// Connection-quality statistics reported by (or computed for) a participant.
///
/// Both fields are optional: absent measurements classify as `medium`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityStats {
    /// Packet loss as a percentage (0.0 - 100.0)
    #[serde(default)]
    pub packet_loss_pct: Option<f32>,
    /// Round-trip time in milliseconds
    #[serde(default)]
    pub rtt_ms: Option<u32>,
}

/// Connection-quality tier driving media constraint recommendations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    High,
    Medium,
    Low,
    AudioOnly,
}

impl QualityTier {
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::AudioOnly => "audio_only",
        }
    }
}

/// Recommended capture constraints pushed back to a participant for a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub video: bool,
    pub max_width: u32,
    pub max_height: u32,
    pub max_framerate: u32,
    pub max_bitrate_kbps: u32,
}

impl MediaConstraints {
    /// Constraint set for a quality tier
    #[must_use]
    pub const fn for_tier(tier: QualityTier) -> Self {
        match tier {
            QualityTier::High => Self {
                video: true,
                max_width: 1280,
                max_height: 720,
                max_framerate: 30,
                max_bitrate_kbps: 2500,
            },
            QualityTier::Medium => Self {
                video: true,
                max_width: 640,
                max_height: 480,
                max_framerate: 24,
                max_bitrate_kbps: 1000,
            },
            QualityTier::Low => Self {
                video: true,
                max_width: 320,
                max_height: 240,
                max_framerate: 15,
                max_bitrate_kbps: 300,
            },
            QualityTier::AudioOnly => Self {
                video: false,
                max_width: 0,
                max_height: 0,
                max_framerate: 0,
                max_bitrate_kbps: 64,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_reason_retryable() {
        assert!(RejectReason::Busy.retryable());
        assert!(RejectReason::Unavailable.retryable());
        assert!(RejectReason::Error.retryable());
        assert!(!RejectReason::Declined.retryable());
    }

    #[test]
    fn test_signal_payload_tagged() {
        let payload = SignalPayload::Offer {
            sdp: "v=0".to_string(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"kind\":\"offer\""));
        let back: SignalPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), "offer");
    }

    #[test]
    fn test_ice_candidate_roundtrip() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 UDP 2130706431 192.168.1.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_string(&candidate).unwrap();
        let back: IceCandidate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, candidate);
    }

    #[test]
    fn test_audio_only_constraints_disable_video() {
        let constraints = MediaConstraints::for_tier(QualityTier::AudioOnly);
        assert!(!constraints.video);
        assert_eq!(constraints.max_framerate, 0);
    }

    #[test]
    fn test_quality_stats_defaults_to_unmeasured() {
        let stats: QualityStats = serde_json::from_str("{}").unwrap();
        assert!(stats.packet_loss_pct.is_none());
        assert!(stats.rtt_ms.is_none());
    }
}
