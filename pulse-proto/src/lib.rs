//! Wire types for the Pulse realtime core.
//!
//! Transport-agnostic identifiers, the inbound/outbound event surface, and
//! call-signaling payload types. Everything here serializes to JSON tagged
//! enums so any transport (WebSocket, gRPC stream) can carry it unchanged.

pub mod call;
pub mod event;
pub mod id;
pub mod message;

pub use call::{
    CallMode, CallState, MediaConstraints, MediaType, PeerConnectionState, QualityStats,
    QualityTier, RejectReason, SignalPayload,
};
pub use event::{ClientEvent, RoomKind, ServerEvent};
pub use id::{CallId, ClientId, ConnectionId, MessageId, RoomId, ServerMessageId, UserId};
pub use message::{
    MediaKind, MediaRef, MediaVariant, MediaVariants, MessageStatus, SyncConflict, SyncEntry,
};
