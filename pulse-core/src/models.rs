//! Core-owned data model: the queued outbound message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pulse_proto::{
    ClientId, MediaRef, MessageId, MessageStatus, RoomId, ServerMessageId, UserId,
};

/// A message as submitted by a client, before the queue assigns identity
#[derive(Debug, Clone)]
pub struct DraftMessage {
    pub room_id: RoomId,
    pub client_id: ClientId,
    pub content: String,
    pub media: Vec<MediaRef>,
    pub ttl_seconds: Option<u64>,
}

/// An outbound message owned by the sender's delivery queue.
///
/// Exclusively owned by the queue until acknowledged; after that a copy also
/// lives in the message-persistence collaborator under `server_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: MessageId,
    pub client_id: ClientId,
    pub room_id: RoomId,
    pub sender: UserId,
    pub content: String,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    #[serde(default)]
    pub server_id: Option<ServerMessageId>,
    /// Monotonically increasing; never decreases, not even across retries
    pub version: u64,
    pub status: MessageStatus,
    pub retry_count: u32,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl QueuedMessage {
    #[must_use]
    pub fn new(sender: UserId, draft: DraftMessage) -> Self {
        Self {
            id: MessageId::new(),
            client_id: draft.client_id,
            room_id: draft.room_id,
            sender,
            content: draft.content,
            media: draft.media,
            server_id: None,
            version: 1,
            status: MessageStatus::Pending,
            retry_count: 0,
            ttl_seconds: draft.ttl_seconds,
            created_at: Utc::now(),
            last_synced_at: None,
        }
    }

    /// Whether `from -> to` is a legal status transition.
    ///
    /// The ladder is monotonic except `sending -> failed -> sending`
    /// (retry), which never decreases the version.
    #[must_use]
    pub const fn can_transition(from: MessageStatus, to: MessageStatus) -> bool {
        use MessageStatus::{Delivered, Failed, Pending, Read, Sending, Sent};
        matches!(
            (from, to),
            (Pending, Sending)
                | (Sending, Sent | Failed)
                | (Failed, Sending)
                | (Sent, Delivered | Read)
                | (Delivered, Read)
        )
    }

    /// Advance the status if legal. Returns `true` when the status changed;
    /// an already-reached or illegal target is a no-op (idempotent marks).
    pub fn advance(&mut self, to: MessageStatus) -> bool {
        if Self::can_transition(self.status, to) {
            self.status = to;
            true
        } else {
            false
        }
    }

    /// Overwrite this copy with a higher-versioned remote one, preserving
    /// local-only identity fields.
    pub fn apply_remote(&mut self, content: String, version: u64, status: MessageStatus) {
        debug_assert!(version > self.version);
        self.content = content;
        self.version = version;
        // Remote status only ever moves the local copy forward
        if self.status.rank() < status.rank() {
            self.status = status;
        }
        self.last_synced_at = Some(Utc::now());
    }
}
