//! Realtime communication core: presence, durable message delivery,
//! call signaling, and ephemeral expiry for a social backend.
//!
//! The crate is transport-agnostic. An embedding server verifies nothing
//! and stores nothing itself; it feeds [`ClientEvent`]s from its transport
//! into the [`hub::RealtimeHub`] and forwards the [`ServerEvent`]s that
//! come back, while durable state and external systems sit behind the
//! traits in [`upstream`] and [`storage`].
//!
//! [`ClientEvent`]: pulse_proto::ClientEvent
//! [`ServerEvent`]: pulse_proto::ServerEvent

pub mod config;
pub mod error;
pub mod hub;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod service;
pub mod storage;
pub mod upstream;

pub use config::Config;
pub use error::{Error, Result};
pub use hub::{RealtimeHub, Upstreams};
