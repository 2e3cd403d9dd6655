use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("migration {filename} failed: {source}")]
    Apply {
        filename: &'static str,
        #[source]
        source: rusqlite::Error,
    },
}

pub type Result<T> = std::result::Result<T, MigrateError>;
