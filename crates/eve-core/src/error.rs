use thiserror::Error;

/// Errors shared across the Eve core crates that don't own a more specific
/// error type of their own (config loading, time/id helpers).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
