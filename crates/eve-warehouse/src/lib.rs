//! Warehouse schema, batched writer (C4), ETL (C6), conversation windowing
//! (C7), watermark plumbing (C10), and the read/persist helpers the compute
//! engine (C9) uses to load conversations and store results.

pub mod error;
pub mod etl;
pub mod query;
pub mod source;
pub mod types;
pub mod watermark;
pub mod windowing;
pub mod writer;

pub use error::{Result, WarehouseError};
pub use writer::{WriteOp, Writer, WriterHandle};

use std::time::Duration;

use eve_migrate::MigrationTarget;

/// Open the warehouse at `path`, applying any pending migrations, and start
/// its background batched writer.
pub fn open(path: &str, batch_size: usize, flush_interval: Duration) -> Result<WriterHandle> {
    let mut conn = eve_migrate::open_with_pragmas(path, 5_000)?;
    eve_migrate::run(&mut conn, MigrationTarget::Warehouse)?;
    Ok(writer::spawn(conn, batch_size, flush_interval))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_applies_migrations_and_accepts_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warehouse.db");
        let handle = open(path.to_str().unwrap(), 10, Duration::from_secs(60)).unwrap();

        handle
            .writer
            .write(WriteOp::new(
                "INSERT INTO contacts (name, is_me, data_source) VALUES ('Me', 1, 'chatdb')",
                vec![],
            ))
            .unwrap();
        handle.writer.flush().unwrap();

        let count: i64 = handle
            .writer
            .with_connection(|conn| conn.query_row("SELECT COUNT(*) FROM contacts", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 1);
        handle.close().await.unwrap();
    }
}
