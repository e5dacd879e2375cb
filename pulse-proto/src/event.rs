//! The logical event surface, transport-agnostic.
//!
//! Inbound events never carry the acting identity; the transport layer
//! verifies it at connect time and passes it to the dispatcher explicitly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::call::{
    CallMode, CallState, MediaConstraints, MediaType, PeerConnectionState, QualityStats,
    QualityTier, RejectReason, SignalPayload,
};
use crate::id::{CallId, ClientId, MessageId, RoomId, ServerMessageId, UserId};
use crate::message::{MediaRef, MediaVariants, MessageStatus, SyncConflict, SyncEntry};

/// Room kind, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Direct,
    Group,
}

/// Inbound events from a connected client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    PresenceJoin {
        room_id: RoomId,
        kind: RoomKind,
    },
    PresenceLeave {
        room_id: RoomId,
    },
    MessageSend {
        room_id: RoomId,
        client_id: ClientId,
        content: String,
        #[serde(default)]
        media: Vec<MediaRef>,
        #[serde(default)]
        ttl_seconds: Option<u64>,
    },
    MessageRetry {
        message_id: MessageId,
    },
    MessageSync {
        entries: Vec<SyncEntry>,
    },
    MessageTyping {
        room_id: RoomId,
    },
    MessageRead {
        room_id: RoomId,
        message_id: MessageId,
    },
    MessageDelete {
        room_id: RoomId,
        message_id: MessageId,
    },
    CallStart {
        room_id: RoomId,
        media_type: MediaType,
        participants: Vec<UserId>,
    },
    CallAccept {
        call_id: CallId,
    },
    CallReject {
        call_id: CallId,
        reason: RejectReason,
    },
    CallSignal {
        call_id: CallId,
        to: UserId,
        payload: SignalPayload,
    },
    CallConnectionState {
        call_id: CallId,
        state: PeerConnectionState,
    },
    CallQuality {
        call_id: CallId,
        stats: QualityStats,
    },
}

impl ClientEvent {
    /// Stable event name, used for logging and rate-limit keys.
    /// `'static` so the name outlives an event moved into the dispatcher.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PresenceJoin { .. } => "presence.join",
            Self::PresenceLeave { .. } => "presence.leave",
            Self::MessageSend { .. } => "message.send",
            Self::MessageRetry { .. } => "message.retry",
            Self::MessageSync { .. } => "message.sync",
            Self::MessageTyping { .. } => "message.typing",
            Self::MessageRead { .. } => "message.read",
            Self::MessageDelete { .. } => "message.delete",
            Self::CallStart { .. } => "call.start",
            Self::CallAccept { .. } => "call.accept",
            Self::CallReject { .. } => "call.reject",
            Self::CallSignal { .. } => "call.signal",
            Self::CallConnectionState { .. } => "call.connection_state",
            Self::CallQuality { .. } => "call.quality",
        }
    }
}

/// Outbound events pushed to connected clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Enqueue acknowledgment to the sender
    Queued {
        message_id: MessageId,
        client_id: ClientId,
        room_id: RoomId,
    },
    /// A chat message delivered to room members
    ChatMessage {
        message_id: MessageId,
        #[serde(default)]
        server_id: Option<ServerMessageId>,
        room_id: RoomId,
        sender: UserId,
        content: String,
        #[serde(default)]
        media: Vec<MediaVariants>,
        sent_at: DateTime<Utc>,
    },
    /// Status transition on one of the client's own queued messages
    MessageStatus {
        message_id: MessageId,
        status: MessageStatus,
        #[serde(default)]
        reason: Option<String>,
    },
    MessageDeleted {
        room_id: RoomId,
        message_id: MessageId,
    },
    MessageExpired {
        room_id: RoomId,
        message_id: MessageId,
    },
    Typing {
        room_id: RoomId,
        user: UserId,
    },
    ReadReceipt {
        room_id: RoomId,
        message_id: MessageId,
        reader: UserId,
    },
    SyncReport {
        applied: Vec<MessageId>,
        conflicts: Vec<SyncConflict>,
        unchanged: u32,
    },
    UserOnline {
        room_id: RoomId,
        user: UserId,
    },
    UserReconnected {
        room_id: RoomId,
        user: UserId,
    },
    UserLeft {
        room_id: RoomId,
        user: UserId,
    },
    IncomingCall {
        call_id: CallId,
        room_id: RoomId,
        caller: UserId,
        media_type: MediaType,
        mode: CallMode,
    },
    CallAccepted {
        call_id: CallId,
        user: UserId,
    },
    CallRejected {
        call_id: CallId,
        user: UserId,
        reason: RejectReason,
        retryable: bool,
    },
    CallEnded {
        call_id: CallId,
        room_id: RoomId,
    },
    CallStateChanged {
        call_id: CallId,
        state: CallState,
    },
    Signal {
        call_id: CallId,
        from: UserId,
        payload: SignalPayload,
    },
    /// Suggest an ICE restart to the participant that reported `failed`
    IceRestart {
        call_id: CallId,
    },
    /// Tell a counterpart that a peer's transport needs re-negotiation
    PeerRestartNeeded {
        call_id: CallId,
        peer: UserId,
    },
    CallUnstable {
        call_id: CallId,
        user: UserId,
        state: PeerConnectionState,
    },
    CallStable {
        call_id: CallId,
        user: UserId,
    },
    QualityChanged {
        call_id: CallId,
        user: UserId,
        tier: QualityTier,
    },
    MediaConstraintsUpdate {
        call_id: CallId,
        tier: QualityTier,
        constraints: MediaConstraints,
    },
    ActiveSpeaker {
        call_id: CallId,
        user: UserId,
    },
    RateLimited {
        action: String,
        retry_after_seconds: u64,
    },
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl ServerEvent {
    /// Stable event name for logging
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::ChatMessage { .. } => "chat.message",
            Self::MessageStatus { .. } => "message.status",
            Self::MessageDeleted { .. } => "message.deleted",
            Self::MessageExpired { .. } => "message.expired",
            Self::Typing { .. } => "typing",
            Self::ReadReceipt { .. } => "read_receipt",
            Self::SyncReport { .. } => "sync.report",
            Self::UserOnline { .. } => "presence.online",
            Self::UserReconnected { .. } => "presence.reconnected",
            Self::UserLeft { .. } => "presence.left",
            Self::IncomingCall { .. } => "call.incoming",
            Self::CallAccepted { .. } => "call.accepted",
            Self::CallRejected { .. } => "call.rejected",
            Self::CallEnded { .. } => "call.ended",
            Self::CallStateChanged { .. } => "call.state",
            Self::Signal { .. } => "call.signal",
            Self::IceRestart { .. } => "call.ice_restart",
            Self::PeerRestartNeeded { .. } => "call.peer_restart",
            Self::CallUnstable { .. } => "call.unstable",
            Self::CallStable { .. } => "call.stable",
            Self::QualityChanged { .. } => "call.quality_changed",
            Self::MediaConstraintsUpdate { .. } => "call.media_constraints",
            Self::ActiveSpeaker { .. } => "call.active_speaker",
            Self::RateLimited { .. } => "rate_limited",
            Self::Error { .. } => "error",
        }
    }
}
