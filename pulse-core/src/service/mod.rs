//! The realtime services: one module per concern, composed by the hub.

pub mod call;
pub mod delivery;
pub mod expiry;
pub mod rate_limit;
pub mod registry;
pub mod rooms;

pub use call::{CallCoordinator, CallSession, DepartureOutcome, RejectOutcome, StateEffect};
pub use delivery::{
    ConflictResolution, DeliveryService, RetryDue, RetryProfile, SendOutcome, SyncOutcome,
};
pub use expiry::{EphemeralRecord, ExpiryService};
pub use rate_limit::{Action, RateLimiter};
pub use registry::{ConnectOutcome, ConnectionRegistry, EventSender, PresenceTimeout};
pub use rooms::{JoinOutcome, LeaveOutcome, RoomDirectory, RoomEntry};
