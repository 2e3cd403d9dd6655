use thiserror::Error;

/// Errors from a call to the model provider. [`ProviderError::is_retryable`]
/// is the single place that classifies retryable vs. terminal outcomes —
/// call sites in the compute engine consult it rather than re-deriving the
/// taxonomy themselves.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("response parse error: {0}")]
    Parse(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("content blocked: {reason}: {message}")]
    Blocked { reason: String, message: String },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("missing embedding for input index {index}")]
    MissingEmbedding { index: usize },

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Network errors, 5xx, and 429 are retryable; blocked content,
    /// malformed responses, and non-5xx API errors are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::RateLimited { .. } => true,
            ProviderError::Unavailable(_) => true,
            ProviderError::Parse(_) => false,
            ProviderError::Blocked { .. } => false,
            ProviderError::MissingEmbedding { .. } => false,
            ProviderError::Cancelled => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }
}
