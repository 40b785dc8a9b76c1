//! Error types for rubric-core.

use thiserror::Error;

/// Result type alias using rubric-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running an evaluation pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Blueprint invariant violation (missing ids, duplicate prompts, bad axes)
    #[error("Blueprint error: {0}")]
    Config(String),

    /// Missing or rejected credentials for a provider that was actually invoked
    #[error("Provider auth error: {provider} - {message}")]
    ProviderAuth { provider: String, message: String },

    /// A single call exceeded its deadline
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// 429 from a provider, surfaced after retry exhaustion
    #[error("Rate limited by {provider}{}", .retry_after_ms.map(|ms| format!(" (retry after {ms}ms)")).unwrap_or_default())]
    RateLimited {
        provider: String,
        retry_after_ms: Option<u64>,
    },

    /// Auto-failed cell because the per-model circuit breaker is open
    #[error("Circuit breaker for model '{model}' is open")]
    BreakerOpen { model: String },

    /// Provider returned a non-success response body
    #[error("Provider error: {provider} - {message}")]
    Provider { provider: String, message: String },

    /// Network-level failure reaching a provider or service
    #[error("Transport error: {0}")]
    Transport(String),

    /// Provider response could not be parsed into the expected shape
    #[error("Format error: {0}")]
    Format(String),

    /// A judge model failed while grading a point
    #[error("Judge error: {0}")]
    Judge(String),

    /// A point function rejected its arguments or threw
    #[error("Point function error: {function}: {message}")]
    PointFunction { function: String, message: String },

    /// Every non-self similarity score was NaN; the embedding backend is broken
    #[error("Embedding failure: {0}")]
    EmbeddingFail(String),

    /// Final artifact persistence failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Cache backing store failure
    #[error("Cache error: {0}")]
    Cache(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Work was cancelled by pool shutdown
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a provider auth error.
    pub fn provider_auth(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderAuth {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a point function error.
    pub fn point_function(function: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PointFunction {
            function: function.into(),
            message: message.into(),
        }
    }

    /// Stable kind tag recorded in artifacts and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::ProviderAuth { .. } => "provider-auth",
            Self::Timeout { .. } => "timeout",
            Self::RateLimited { .. } => "rate-limited",
            Self::BreakerOpen { .. } => "breaker-open",
            Self::Provider { .. } => "provider-error",
            Self::Transport(_) => "transport",
            Self::Format(_) => "format",
            Self::Judge(_) => "judge-error",
            Self::PointFunction { .. } => "function-error",
            Self::EmbeddingFail(_) => "embedding-fail",
            Self::Storage(_) => "storage-error",
            Self::Cache(_) => "cache-error",
            Self::Serialization(_) => "format",
            Self::Cancelled(_) => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether a retry of the same call could plausibly succeed.
    ///
    /// Timeouts, 429s, transport failures, and 5xx-class provider errors are
    /// transient; auth, config, format, and breaker rejections are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::RateLimited { .. } | Self::Transport(_) => true,
            Self::Provider { message, .. } => {
                let lower = message.to_ascii_lowercase();
                lower.contains("500")
                    || lower.contains("502")
                    || lower.contains("503")
                    || lower.contains("529")
                    || lower.contains("overloaded")
                    || lower.contains("temporarily unavailable")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_open_message_names_the_model() {
        let err = Error::BreakerOpen {
            model: "failing-model".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Circuit breaker for model 'failing-model' is open"
        );
        assert_eq!(err.kind(), "breaker-open");
    }

    #[test]
    fn rate_limited_display_includes_retry_after() {
        let err = Error::RateLimited {
            provider: "openai".to_string(),
            retry_after_ms: Some(2000),
        };
        assert_eq!(err.to_string(), "Rate limited by openai (retry after 2000ms)");

        let bare = Error::RateLimited {
            provider: "openai".to_string(),
            retry_after_ms: None,
        };
        assert_eq!(bare.to_string(), "Rate limited by openai");
    }

    #[test]
    fn transient_classification() {
        assert!(Error::timeout(30_000).is_transient());
        assert!(Error::Transport("connection reset".to_string()).is_transient());
        assert!(Error::provider("openai", "503 service unavailable").is_transient());
        assert!(!Error::provider("openai", "400 bad request").is_transient());
        assert!(!Error::provider_auth("openai", "missing key").is_transient());
        assert!(!Error::BreakerOpen {
            model: "m".to_string()
        }
        .is_transient());
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(Error::Config("x".into()).kind(), "config");
        assert_eq!(Error::Judge("x".into()).kind(), "judge-error");
        assert_eq!(
            Error::point_function("contains", "bad args").kind(),
            "function-error"
        );
        assert_eq!(Error::EmbeddingFail("all NaN".into()).kind(), "embedding-fail");
        assert_eq!(Error::Storage("write failed".into()).kind(), "storage-error");
    }
}
