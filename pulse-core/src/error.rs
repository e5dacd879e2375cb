use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Rate limit exceeded. Try again in {}s", retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    #[error("Delivery failure: {0}")]
    Delivery(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Upstream unavailable: {0}")]
    Upstream(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable error code surfaced to clients
    #[must_use]
    pub const fn code(&self) -> &str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::Authorization(_) => "authorization",
            Self::RateLimited { .. } => "rate_limited",
            Self::Delivery(_) => "delivery_failure",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::InvalidInput(_) => "invalid_input",
            Self::Upstream(_) => "upstream_unavailable",
            Self::Serialization(_) | Self::Io(_) | Self::Internal(_) => "internal",
        }
    }

    /// Whether the client may retry the action as-is.
    ///
    /// Upstream and transient delivery failures are retryable; validation
    /// and authorization failures are not.
    #[must_use]
    pub const fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Delivery(_) | Self::Upstream(_) | Self::Internal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_message_rounds_up() {
        let err = Error::RateLimited {
            retry_after: Duration::from_millis(200),
        };
        assert!(err.to_string().contains("1s"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Upstream("store down".into()).retryable());
        assert!(Error::Delivery("timeout".into()).retryable());
        assert!(!Error::Authorization("not a member".into()).retryable());
        assert!(!Error::InvalidInput("empty".into()).retryable());
    }
}
