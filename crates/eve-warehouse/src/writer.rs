//! Batched warehouse writer (C4): the sole write path into `eve.db`.
//!
//! Every mutation — ETL upserts and compute-result persistence alike —
//! funnels through a single [`Writer`] so `eve.db` is always written by
//! exactly one connection, the way §5 requires.

use std::sync::Mutex;
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::Connection;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{Result, WarehouseError};

/// One statement queued for the next flush.
pub struct WriteOp {
    pub sql: String,
    pub params: Vec<Value>,
}

impl WriteOp {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Accumulates [`WriteOp`]s and flushes them as a single transaction,
/// either when the batch fills or on a timer. See module docs.
pub struct Writer {
    conn: Mutex<Connection>,
    pending: Mutex<Vec<WriteOp>>,
    batch_size: usize,
    shutdown_tx: watch::Sender<bool>,
}

/// Owns the background flush task. Call [`WriterHandle::close`] on shutdown.
pub struct WriterHandle {
    pub writer: std::sync::Arc<Writer>,
    task: JoinHandle<Result<()>>,
}

impl Writer {
    /// Queue a statement. If this fills the batch, flushes immediately and
    /// inline (synchronously, within this call) — the background task only
    /// covers the time-triggered case.
    pub fn write(&self, op: WriteOp) -> Result<()> {
        let should_flush = {
            let mut pending = self.pending.lock().unwrap();
            pending.push(op);
            pending.len() >= self.batch_size
        };
        if should_flush {
            self.flush()?;
        }
        Ok(())
    }

    pub fn write_many(&self, ops: impl IntoIterator<Item = WriteOp>) -> Result<()> {
        for op in ops {
            self.write(op)?;
        }
        Ok(())
    }

    /// Force an immediate flush of whatever is pending. A no-op if nothing
    /// is queued. On failure the whole batch is rolled back and discarded —
    /// the writer is left clean for subsequent writes.
    pub fn flush(&self) -> Result<()> {
        let ops = {
            let mut pending = self.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        if ops.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let count = ops.len();
        for op in &ops {
            let params: Vec<&dyn rusqlite::ToSql> =
                op.params.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
            if let Err(source) = tx.execute(&op.sql, params.as_slice()) {
                warn!(batch_size = count, error = %source, "batch flush failed, rolling back");
                return Err(WarehouseError::BatchFailed { size: count, source });
            }
        }
        tx.commit()?;
        debug!(count, "flushed batch");
        Ok(())
    }

    /// Run a closure with direct, synchronous access to the underlying
    /// connection for reads (loading conversations, prompts, etc). Reads
    /// never go through the write batch.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap();
        Ok(f(&conn)?)
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.lock().unwrap().last_insert_rowid()
    }
}

/// Start the background flush timer and return a handle. `conn` becomes
/// the writer's sole connection.
pub fn spawn(conn: Connection, batch_size: usize, flush_interval: Duration) -> WriterHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let writer = std::sync::Arc::new(Writer {
        conn: Mutex::new(conn),
        pending: Mutex::new(Vec::new()),
        batch_size,
        shutdown_tx,
    });

    let task_writer = writer.clone();
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(flush_interval);
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = task_writer.flush() {
                        error!(error = %e, "timer-triggered flush failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return task_writer.flush();
                    }
                }
            }
        }
    });

    WriterHandle { writer, task }
}

impl WriterHandle {
    /// Stop the background timer, perform a final flush, and return any
    /// error from that final flush.
    pub async fn close(self) -> Result<()> {
        let _ = self.writer.shutdown_tx.send(true);
        match self.task.await {
            Ok(result) => result,
            Err(join_err) => {
                error!(error = %join_err, "writer background task panicked");
                Ok(())
            }
        }
    }
}
