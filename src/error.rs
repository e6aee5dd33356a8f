//! Error types for the conversation middleware core.
//!
//! Variants map 1:1 onto the error taxonomy of the middleware contract: `UserError`,
//! `QuotaError`, `BusyError`, `DependencyError`, `InternalError`. HTTP status mapping is
//! deliberately not performed here — that is the job of whatever layer sits on top of
//! this crate; see [`Error::status_hint`].

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the middleware core.
#[derive(Error, Debug)]
pub enum Error {
    /// Input was empty or whitespace-only.
    #[error("empty input")]
    EmptyInput,

    /// Input exceeded the configured maximum length.
    #[error("input too long: {length} characters (max: {max})")]
    InputTooLong { length: usize, max: usize },

    /// Input matched a prompt-injection screening pattern.
    #[error("input contains disallowed pattern: {pattern}")]
    PromptInjection { pattern: String },

    /// Caller exceeded their request budget; retry after the given number of seconds.
    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    /// Lock could not be acquired within the caller's timeout.
    #[error("lock acquisition timed out for resource {resource}")]
    LockTimeout { resource: String },

    /// A circuit breaker is open and failing fast; retry after the given duration.
    #[error("circuit '{name}' is open, retry after {retry_after}s")]
    CircuitOpen { name: String, retry_after: u64 },

    /// The embedding provider chain was exhausted without a success.
    #[error("embedding failed: {0}")]
    EmbeddingFailure(String),

    /// The vector store rejected or failed an operation.
    #[error("vector store failure: {0}")]
    VectorStoreFailure(String),

    /// The LLM invocation failed after exhausting retries.
    #[error("llm invocation failed: {0}")]
    LlmFailure(String),

    /// A generic persistence-layer failure (locks, rate limiter, event queue backing store).
    #[error("store failure: {0}")]
    StoreFailure(String),

    /// Invalid configuration supplied at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Redis client/transport error, surfaced as a store failure at the boundary.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error, used only by the alert webhook dispatcher.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Unanticipated internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// The four broad error families from the middleware contract, used by callers (e.g. an
/// HTTP layer) to pick a response without re-deriving the taxonomy from variant names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFamily {
    User,
    Quota,
    Busy,
    Dependency,
    Internal,
}

impl Error {
    pub fn input_too_long(length: usize, max: usize) -> Self {
        Error::InputTooLong { length, max }
    }

    pub fn prompt_injection(pattern: impl Into<String>) -> Self {
        Error::PromptInjection {
            pattern: pattern.into(),
        }
    }

    pub fn rate_limited(retry_after: u64) -> Self {
        Error::RateLimited { retry_after }
    }

    pub fn lock_timeout(resource: impl Into<String>) -> Self {
        Error::LockTimeout {
            resource: resource.into(),
        }
    }

    pub fn circuit_open(name: impl Into<String>, retry_after: u64) -> Self {
        Error::CircuitOpen {
            name: name.into(),
            retry_after,
        }
    }

    pub fn embedding_failure(msg: impl Into<String>) -> Self {
        Error::EmbeddingFailure(msg.into())
    }

    pub fn vector_store_failure(msg: impl Into<String>) -> Self {
        Error::VectorStoreFailure(msg.into())
    }

    pub fn llm_failure(msg: impl Into<String>) -> Self {
        Error::LlmFailure(msg.into())
    }

    pub fn store_failure(msg: impl Into<String>) -> Self {
        Error::StoreFailure(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Retry-after seconds carried by the quota/busy families, if any.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after } => Some(*retry_after),
            Error::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// The broad family this error belongs to, per the middleware error taxonomy.
    pub fn family(&self) -> ErrorFamily {
        match self {
            Error::EmptyInput | Error::InputTooLong { .. } | Error::PromptInjection { .. } => {
                ErrorFamily::User
            }
            Error::RateLimited { .. } => ErrorFamily::Quota,
            Error::LockTimeout { .. } | Error::CircuitOpen { .. } => ErrorFamily::Busy,
            Error::EmbeddingFailure(_)
            | Error::VectorStoreFailure(_)
            | Error::LlmFailure(_)
            | Error::StoreFailure(_) => ErrorFamily::Dependency,
            Error::Config(_) | Error::Redis(_) | Error::Json(_) | Error::Http(_) | Error::Internal(_) => {
                ErrorFamily::Internal
            }
        }
    }

    /// Whether this failure kind is safe to retry internally (the dependency family only).
    pub fn is_retryable(&self) -> bool {
        self.family() == ErrorFamily::Dependency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_family_mapping() {
        assert_eq!(Error::EmptyInput.family(), ErrorFamily::User);
        assert_eq!(Error::rate_limited(30).family(), ErrorFamily::Quota);
        assert_eq!(Error::lock_timeout("t").family(), ErrorFamily::Busy);
        assert_eq!(Error::llm_failure("x").family(), ErrorFamily::Dependency);
        assert_eq!(Error::internal("x").family(), ErrorFamily::Internal);
    }

    #[test]
    fn test_retry_after_present_only_on_quota_and_busy() {
        assert_eq!(Error::rate_limited(42).retry_after(), Some(42));
        assert_eq!(Error::circuit_open("llm", 5).retry_after(), Some(5));
        assert_eq!(Error::EmptyInput.retry_after(), None);
    }

    #[test]
    fn test_only_dependency_family_is_retryable() {
        assert!(Error::llm_failure("x").is_retryable());
        assert!(Error::vector_store_failure("x").is_retryable());
        assert!(!Error::rate_limited(1).is_retryable());
        assert!(!Error::EmptyInput.is_retryable());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::input_too_long(4001, 4000).to_string(),
            "input too long: 4001 characters (max: 4000)"
        );
        assert_eq!(
            Error::circuit_open("llm", 12).to_string(),
            "circuit 'llm' is open, retry after 12s"
        );
    }
}
