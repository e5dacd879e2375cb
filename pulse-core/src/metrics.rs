//! Prometheus metrics for the realtime core.
//!
//! Counters and gauges live behind `LazyLock` statics registered on a
//! dedicated registry so the embedding process can expose them however it
//! likes.

use prometheus::{
    register_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, CounterVec, Encoder, IntCounter, IntGauge, Registry,
    TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Currently connected users
pub static ACTIVE_CONNECTIONS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "pulse_active_connections",
        "Current number of connected users",
        REGISTRY.clone()
    )
    .expect("Failed to register ACTIVE_CONNECTIONS")
});

/// Currently tracked rooms
pub static ACTIVE_ROOMS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "pulse_active_rooms",
        "Current number of rooms with members",
        REGISTRY.clone()
    )
    .expect("Failed to register ACTIVE_ROOMS")
});

/// Currently live call sessions
pub static ACTIVE_CALLS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "pulse_active_calls",
        "Current number of live call sessions",
        REGISTRY.clone()
    )
    .expect("Failed to register ACTIVE_CALLS")
});

/// Message outcomes by terminal status
pub static MESSAGES_TOTAL: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
    register_counter_vec_with_registry!(
        "pulse_messages_total",
        "Queued messages by outcome",
        &["outcome"],
        REGISTRY.clone()
    )
    .expect("Failed to register MESSAGES_TOTAL")
});

/// Scheduled delivery retries
pub static DELIVERY_RETRIES: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter_with_registry!(
        "pulse_delivery_retries_total",
        "Delivery retries scheduled",
        REGISTRY.clone()
    )
    .expect("Failed to register DELIVERY_RETRIES")
});

/// Rate-limited actions
pub static RATE_LIMITED: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
    register_counter_vec_with_registry!(
        "pulse_rate_limited_total",
        "Actions rejected by the rate limiter",
        &["action"],
        REGISTRY.clone()
    )
    .expect("Failed to register RATE_LIMITED")
});

/// Expired ephemeral messages
pub static MESSAGES_EXPIRED: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter_with_registry!(
        "pulse_messages_expired_total",
        "Ephemeral messages removed by the sweep",
        REGISTRY.clone()
    )
    .expect("Failed to register MESSAGES_EXPIRED")
});

/// Dropped unauthorized signaling payloads
pub static SIGNALS_DROPPED: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter_with_registry!(
        "pulse_signals_dropped_total",
        "Signaling payloads dropped for failing participant authorization",
        REGISTRY.clone()
    )
    .expect("Failed to register SIGNALS_DROPPED")
});

/// Render all registered metrics in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
