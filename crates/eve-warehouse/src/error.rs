use thiserror::Error;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] eve_migrate::MigrateError),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("batch of {size} writes failed, rolled back: {source}")]
    BatchFailed {
        size: usize,
        #[source]
        source: rusqlite::Error,
    },

    #[error("conversation {0} not found")]
    ConversationNotFound(i64),

    #[error("source database schema error: {0}")]
    SourceSchema(String),
}

pub type Result<T> = std::result::Result<T, WarehouseError>;
