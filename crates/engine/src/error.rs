//! Error taxonomy for the research pipeline

use std::time::Duration;
use thiserror::Error;

/// Configuration rejected before a session starts
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    Missing(&'static str),

    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("unknown search-space preset: {0}")]
    UnknownPreset(String),
}

impl ValidationError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ValidationError::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Failure reported by an external collaborator (optimizer, history source)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("collaborator request failed: {0}")]
    Failed(String),
}

/// History acquisition failure, returned (never raised) by the fetch coordinator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("history source rate limited, retry in {retry_in_secs} seconds")]
    RateLimited {
        retry_in_secs: u64,
        blocked_until_ms: i64,
    },

    #[error("history source error: {0}")]
    Upstream(String),

    #[error("no bars returned for {symbol} {timeframe}")]
    Empty { symbol: String, timeframe: String },

    #[error("invalid history request: {0}")]
    InvalidRequest(String),
}

/// Ledger write/read failure. Callers in the run loop log and swallow these.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Db(#[from] persistence::DbError),

    #[error("ledger serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Any failure inside one experiment iteration. Caught at the iteration boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExperimentError {
    #[error("history fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("optimizer call failed: {0}")]
    Optimizer(#[from] CollaboratorError),

    #[error("optimizer round {round} failed: {reason}")]
    RoundFailed { round: u8, reason: String },

    #[error("optimizer round {round} timed out after {secs}s")]
    RoundTimeout { round: u8, secs: u64 },

    #[error("optimizer returned no candidates in round {0}")]
    NoCandidate(u8),

    #[error("empty test window: {0}")]
    EmptyTestWindow(String),
}

impl ExperimentError {
    /// Whether this failure should drive the pause/backoff/stop policy
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            ExperimentError::Fetch(FetchError::RateLimited { .. })
                | ExperimentError::Optimizer(CollaboratorError::RateLimited { .. })
        )
    }
}

/// Errors surfaced by the public session API
#[derive(Error, Debug)]
pub enum AutopilotError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_detection_is_typed() {
        let fetch = ExperimentError::Fetch(FetchError::RateLimited {
            retry_in_secs: 5,
            blocked_until_ms: 0,
        });
        let optimizer = ExperimentError::Optimizer(CollaboratorError::RateLimited {
            retry_after: None,
        });
        // A message that merely mentions rate limits is not a rate-limit condition
        let other = ExperimentError::RoundFailed {
            round: 1,
            reason: "worker said: rate limit exceeded".to_string(),
        };

        assert!(fetch.is_rate_limit());
        assert!(optimizer.is_rate_limit());
        assert!(!other.is_rate_limit());
        assert!(!ExperimentError::Fetch(FetchError::Upstream("timeout".into())).is_rate_limit());
    }

    #[test]
    fn test_fetch_rate_limit_message_carries_retry_estimate() {
        let err = FetchError::RateLimited {
            retry_in_secs: 10,
            blocked_until_ms: 1_000,
        };
        assert_eq!(
            err.to_string(),
            "history source rate limited, retry in 10 seconds"
        );
    }
}
