use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] eve_migrate::MigrateError),

    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {job_id} is not leased by {owner}")]
    LeaseMismatch { job_id: String, owner: String },

    #[error("unknown job state {0:?}")]
    UnknownState(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
