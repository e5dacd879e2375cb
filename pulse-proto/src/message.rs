//! Message-level wire types: statuses, media references, and sync entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{ClientId, MessageId};

/// Lifecycle status of an outbound message.
///
/// Transitions are monotonic along `pending -> sending -> sent -> delivered
/// -> read`; `failed` is reachable from `sending` and a retry moves it back
/// to `sending` without decreasing the message version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Position on the monotonic delivery ladder. `Failed` sits beside
    /// `Sending` so a retry does not count as a regression.
    #[must_use]
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sending | Self::Failed => 1,
            Self::Sent => 2,
            Self::Delivered => 3,
            Self::Read => 4,
        }
    }

    /// Whether the message has been acknowledged by the server side.
    #[must_use]
    pub const fn is_acknowledged(&self) -> bool {
        matches!(self, Self::Sent | Self::Delivered | Self::Read)
    }

    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }
}

/// Classification of an attached media object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    File,
}

/// Raw media reference carried in a message.
///
/// The core never resolves these itself; the media-variant collaborator
/// turns them into signed, time-limited URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub id: String,
    pub kind: MediaKind,
}

/// One resolved variant of a media object (a specific resolution/quality)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaVariant {
    /// Variant label, e.g. "thumb", "720p", "original"
    pub label: String,
    /// Signed, time-limited URL
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Full resolver output for one media reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaVariants {
    pub kind: MediaKind,
    pub placeholder_url: String,
    pub variants: Vec<MediaVariant>,
}

/// One remote message copy offered for reconciliation during sync.
///
/// Matching against the local queue is attempted by `client_id` first,
/// falling back to `message_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEntry {
    #[serde(default)]
    pub message_id: Option<MessageId>,
    #[serde(default)]
    pub client_id: Option<ClientId>,
    pub version: u64,
    pub content: String,
    pub status: MessageStatus,
    pub updated_at: DateTime<Utc>,
}

/// A reported (not fatal) version conflict found during sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub message_id: MessageId,
    pub local_version: u64,
    pub remote_version: u64,
}
