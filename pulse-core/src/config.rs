use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Realtime core configuration.
///
/// Every tuning knob in the subsystem lives here; none of the defaults
/// below are load-tested truths, they are starting points.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub presence: PresenceConfig,
    pub rate_limit: RateLimitConfig,
    pub delivery: DeliveryConfig,
    pub call: CallConfig,
    pub expiry: ExpiryConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Grace period after a disconnect before the user is treated as gone
    pub grace_period_seconds: u64,
    /// Minimum interval between typing broadcasts per user per room
    pub typing_throttle_seconds: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            grace_period_seconds: 30,
            typing_throttle_seconds: 2,
        }
    }
}

/// Ceiling and window for one rate-limited action
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ActionLimit {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl ActionLimit {
    #[must_use]
    pub const fn new(max_requests: u32, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub message_send: ActionLimit,
    pub typing: ActionLimit,
    pub call_start: ActionLimit,
    pub media_upload: ActionLimit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            message_send: ActionLimit::new(30, 60),
            typing: ActionLimit::new(5, 10),
            call_start: ActionLimit::new(3, 60),
            media_upload: ActionLimit::new(10, 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// First retry delay in milliseconds
    pub initial_delay_ms: u64,
    /// Multiplier applied per retry: delay = initial * factor^(retries-1)
    pub backoff_factor: f64,
    /// Ceiling on any single retry delay
    pub max_delay_ms: u64,
    /// Retry bound before a message is left `failed`
    pub max_retries: u32,
    /// Attempts observed before the adaptive strategy may switch profiles
    pub min_samples: u32,
    /// Failure rate above which the degraded profile applies
    pub degraded_failure_rate: f64,
    /// Average transmit latency above which the high-latency profile applies
    pub high_latency_ms: u64,
    /// Extra retries granted by the degraded profile
    pub degraded_extra_retries: u32,
    /// Backoff factor multiplier for the degraded profile
    pub degraded_backoff_multiplier: f64,
    /// Extra retries granted by the high-latency profile
    pub high_latency_extra_retries: u32,
    /// Backoff factor multiplier for the high-latency profile
    pub high_latency_backoff_multiplier: f64,
    /// Maximum content length in characters
    pub max_content_length: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            max_retries: 5,
            min_samples: 10,
            degraded_failure_rate: 0.5,
            high_latency_ms: 500,
            degraded_extra_retries: 3,
            degraded_backoff_multiplier: 1.5,
            high_latency_extra_retries: 1,
            high_latency_backoff_multiplier: 1.25,
            max_content_length: 4000,
        }
    }
}

/// Packet-loss / RTT bounds for one quality tier boundary
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityThreshold {
    pub packet_loss_pct: f32,
    pub rtt_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Expected participant count at/above which media routes through the relay
    pub relay_threshold: usize,
    /// Worse than this classifies as audio-only
    pub audio_only_above: QualityThreshold,
    /// Worse than this classifies as low
    pub low_above: QualityThreshold,
    /// Worse than this classifies as medium
    pub medium_above: QualityThreshold,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            relay_threshold: 4,
            audio_only_above: QualityThreshold {
                packet_loss_pct: 10.0,
                rtt_ms: 300,
            },
            low_above: QualityThreshold {
                packet_loss_pct: 5.0,
                rtt_ms: 200,
            },
            medium_above: QualityThreshold {
                packet_loss_pct: 2.0,
                rtt_ms: 100,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpiryConfig {
    /// Sweep interval for ephemeral messages
    pub sweep_interval_seconds: u64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the file-backed per-user delivery queues
    pub queue_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            queue_dir: "./data/queues".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (PULSE_PRESENCE_GRACE_PERIOD_SECONDS, etc.)
        builder = builder.add_source(
            Environment::with_prefix("PULSE")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.presence.grace_period_seconds)
    }

    #[must_use]
    pub const fn typing_throttle(&self) -> Duration {
        Duration::from_secs(self.presence.typing_throttle_seconds)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry.sweep_interval_seconds)
    }
}
