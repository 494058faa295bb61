//! Rate Limiting Error Types
//!
//! Every failure crossing the admission-control boundary is one of these
//! variants, so the transport layer can map it to a status code.

use super::tier::Tier;

/// Error types for admission-control operations
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// Tier lookup service returned an error
    #[error("Tier lookup failed for user {user_id}: {reason}")]
    LookupFailure { user_id: String, reason: String },

    /// Tier lookup service did not answer in time
    #[error("Tier lookup timed out after {0}ms")]
    LookupTimeout(u64),

    /// Counter/queue backend is unreachable
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Rejected configuration update; the previous configuration is retained
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Tier queue is at its maximum depth
    #[error("Queue for tier {tier} is full ({max_depth} entries)")]
    QueueFull { tier: Tier, max_depth: usize },

    /// No queue entry with this request id
    #[error("Queue entry not found: {0}")]
    EntryNotFound(String),

    /// Queue entry state machine violation
    #[error("Invalid queue entry transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Queue entry (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RateLimitError {
    /// HTTP status code the transport layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            RateLimitError::QueueFull { .. } => 429,
            RateLimitError::StoreUnavailable(_)
            | RateLimitError::LookupFailure { .. }
            | RateLimitError::LookupTimeout(_) => 503,
            RateLimitError::InvalidConfiguration(_) => 400,
            RateLimitError::EntryNotFound(_) => 404,
            RateLimitError::InvalidTransition { .. } => 409,
            RateLimitError::Serialization(_) => 500,
        }
    }

    /// Whether this error came from the backing store
    pub fn is_store_failure(&self) -> bool {
        matches!(self, RateLimitError::StoreUnavailable(_))
    }
}

impl From<serde_json::Error> for RateLimitError {
    fn from(err: serde_json::Error) -> Self {
        RateLimitError::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for RateLimitError {
    fn from(err: redis::RedisError) -> Self {
        RateLimitError::StoreUnavailable(err.to_string())
    }
}

/// Convenience alias used across the rate limiting module
pub type Result<T> = std::result::Result<T, RateLimitError>;
