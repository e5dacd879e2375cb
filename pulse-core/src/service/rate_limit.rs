//! Per-user, per-action rate limiting.
//!
//! Fixed windows keyed by `(user, action)`, reset lazily on the first check
//! after the window expires; no background sweep. A limited check mutates
//! nothing downstream — callers short-circuit and surface the error.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{ActionLimit, RateLimitConfig};
use crate::metrics;
use crate::{Error, Result};
use pulse_proto::UserId;

/// Actions guarded by the limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    MessageSend,
    Typing,
    CallStart,
    MediaUpload,
}

impl Action {
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::MessageSend => "message_send",
            Self::Typing => "typing",
            Self::CallStart => "call_start",
            Self::MediaUpload => "media_upload",
        }
    }
}

struct Window {
    started: Instant,
    count: u32,
}

/// Sliding fixed-window rate limiter keyed by `(user, action)`
pub struct RateLimiter {
    windows: DashMap<(UserId, Action), Window>,
    config: RateLimitConfig,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            config,
        }
    }

    const fn limit_for(&self, action: Action) -> ActionLimit {
        match action {
            Action::MessageSend => self.config.message_send,
            Action::Typing => self.config.typing,
            Action::CallStart => self.config.call_start,
            Action::MediaUpload => self.config.media_upload,
        }
    }

    /// Check whether `user` may perform `action` now.
    ///
    /// An allowed check counts the request against the current window; a
    /// limited check leaves the window untouched and reports how long the
    /// caller should wait.
    pub fn check(&self, user: UserId, action: Action) -> Result<()> {
        let limit = self.limit_for(action);
        let window_len = Duration::from_secs(limit.window_seconds);
        let now = Instant::now();

        let mut entry = self
            .windows
            .entry((user, action))
            .or_insert_with(|| Window {
                started: now,
                count: 0,
            });
        let window = entry.value_mut();

        // Lazy reset on first check after expiry
        if now.duration_since(window.started) >= window_len {
            window.started = now;
            window.count = 0;
        }

        if window.count >= limit.max_requests {
            let retry_after = window_len.saturating_sub(now.duration_since(window.started));
            metrics::RATE_LIMITED.with_label_values(&[action.as_str()]).inc();
            return Err(Error::RateLimited { retry_after });
        }

        window.count += 1;
        Ok(())
    }

    /// Drop a user's windows (admin/testing)
    pub fn reset(&self, user: UserId) {
        self.windows.retain(|(u, _), _| *u != user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default())
    }

    #[tokio::test]
    async fn test_ceiling_is_exact() {
        let limiter = limiter();
        let user = UserId::new(1);

        // Defaults allow 3 call starts per window; the 4th is limited
        for _ in 0..3 {
            limiter.check(user, Action::CallStart).unwrap();
        }
        let err = limiter.check(user, Action::CallStart).unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_limited_check_reports_retry_after() {
        let limiter = limiter();
        let user = UserId::new(1);
        for _ in 0..5 {
            limiter.check(user, Action::Typing).unwrap();
        }
        match limiter.check(user, Action::Typing) {
            Err(Error::RateLimited { retry_after }) => {
                assert!(retry_after <= Duration::from_secs(10));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_lazily() {
        let limiter = limiter();
        let user = UserId::new(1);

        for _ in 0..3 {
            limiter.check(user, Action::CallStart).unwrap();
        }
        assert!(limiter.check(user, Action::CallStart).is_err());

        // Past the window the next check succeeds without any sweep
        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.check(user, Action::CallStart).unwrap();
    }

    #[tokio::test]
    async fn test_users_and_actions_are_independent() {
        let limiter = limiter();
        let a = UserId::new(1);
        let b = UserId::new(2);

        for _ in 0..3 {
            limiter.check(a, Action::CallStart).unwrap();
        }
        assert!(limiter.check(a, Action::CallStart).is_err());

        // Other user, other action: untouched buckets
        assert!(limiter.check(b, Action::CallStart).is_ok());
        assert!(limiter.check(a, Action::Typing).is_ok());
    }
}
