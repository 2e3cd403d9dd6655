//! Eve: a personal communications data engine. ETLs Apple Messages'
//! `chat.db` into a SQLite warehouse, runs a durable job queue, and drives
//! an LLM compute engine over the result. Exposes its operations as plain
//! function calls returning JSON-serializable values; the binary is a thin
//! dispatcher over this surface (command-line parsing is out of scope here).

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

pub use eve_core::EveConfig;

const WAREHOUSE_BATCH_SIZE: usize = 200;
const WAREHOUSE_FLUSH_INTERVAL_SECS: u64 = 5;
const PROVIDER_CALL_TIMEOUT_SECS: u64 = 60;
const PROVIDER_POOL_IDLE_TIMEOUT_SECS: u64 = 90;
const PROVIDER_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum EveError {
    #[error(transparent)]
    Core(#[from] eve_core::CoreError),
    #[error(transparent)]
    Migrate(#[from] eve_migrate::MigrateError),
    #[error(transparent)]
    Queue(#[from] eve_queue::QueueError),
    #[error(transparent)]
    Warehouse(#[from] eve_warehouse::WarehouseError),
    #[error(transparent)]
    Provider(#[from] eve_provider::ProviderError),
    #[error(transparent)]
    Compute(#[from] eve_compute::ComputeError),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to start local runtime: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, EveError>;

/// Outcome envelope every top-level operation returns: `ok` mirrors
/// whether the call succeeded, `error` carries the message on failure,
/// and `counters` holds whatever per-operation stats apply.
#[derive(Debug, Serialize)]
pub struct OperationResult<T: Serialize> {
    pub ok: bool,
    pub error: Option<String>,
    pub counters: Option<T>,
}

impl<T: Serialize> OperationResult<T> {
    fn ok(counters: T) -> Self {
        Self { ok: true, error: None, counters: Some(counters) }
    }
    fn err(message: String) -> Self {
        Self { ok: false, error: Some(message), counters: None }
    }
}

/// Run pending migrations against both the warehouse and queue databases.
pub fn migrate(config: &EveConfig) -> OperationResult<serde_json::Value> {
    match migrate_inner(config) {
        Ok(v) => OperationResult::ok(v),
        Err(e) => OperationResult::err(e.to_string()),
    }
}

fn migrate_inner(config: &EveConfig) -> Result<serde_json::Value> {
    std::fs::create_dir_all(&config.app_dir).map_err(|e| eve_core::CoreError::Config(e.to_string()))?;

    let mut warehouse_conn = eve_migrate::open_with_pragmas(&config.warehouse_path(), 5_000)?;
    let warehouse_applied = eve_migrate::run(&mut warehouse_conn, eve_migrate::MigrationTarget::Warehouse)?;

    let mut queue_conn = eve_migrate::open_with_pragmas(&config.queue_path(), 5_000)?;
    let queue_applied = eve_migrate::run(&mut queue_conn, eve_migrate::MigrationTarget::Queue)?;

    info!(warehouse_applied, queue_applied, "migrations complete");
    Ok(serde_json::json!({
        "warehouse_migrations_applied": warehouse_applied,
        "queue_migrations_applied": queue_applied,
    }))
}

/// Run one incremental ETL pass from the Messages source database into the
/// warehouse.
pub fn sync(config: &EveConfig, source_path: &str) -> OperationResult<eve_warehouse::etl::SyncStats> {
    match sync_inner(config, source_path) {
        Ok(stats) => OperationResult::ok(stats),
        Err(e) => OperationResult::err(e.to_string()),
    }
}

fn sync_inner(config: &EveConfig, source_path: &str) -> Result<eve_warehouse::etl::SyncStats> {
    let rt = local_runtime()?;
    let _guard = rt.enter();
    let handle = open_warehouse(config)?;
    let stats = eve_warehouse::etl::sync(source_path, &handle.writer, config.conversation_gap_seconds);
    // Close regardless of sync's outcome so the background flush task is never leaked.
    let close_result = rt.block_on(handle.close());
    let stats = stats?;
    close_result?;
    Ok(stats)
}

/// Enqueue one job. `job_type` is `"analysis"` or `"embedding"`; `payload`
/// must match the shape the compute engine expects for that type.
pub fn enqueue(
    config: &EveConfig,
    job_type: &str,
    key: &str,
    payload: serde_json::Value,
) -> OperationResult<serde_json::Value> {
    match enqueue_inner(config, job_type, key, payload) {
        Ok(job_id) => OperationResult::ok(serde_json::json!({ "job_id": job_id })),
        Err(e) => OperationResult::err(e.to_string()),
    }
}

fn enqueue_inner(config: &EveConfig, job_type: &str, key: &str, payload: serde_json::Value) -> Result<String> {
    let queue = eve_queue::Queue::open(&config.queue_path())?;
    let mut req = eve_queue::EnqueueRequest::new(job_type, key, payload);
    req.max_attempts = config.queue_max_attempts as i64;
    Ok(queue.enqueue(req)?)
}

/// Current queue depth by job type and state.
pub fn compute_status(config: &EveConfig) -> OperationResult<eve_queue::QueueStats> {
    match compute_status_inner(config) {
        Ok(stats) => OperationResult::ok(stats),
        Err(e) => OperationResult::err(e.to_string()),
    }
}

fn compute_status_inner(config: &EveConfig) -> Result<eve_queue::QueueStats> {
    let queue = eve_queue::Queue::open(&config.queue_path())?;
    Ok(queue.stats()?)
}

/// Run the compute engine until `shutdown` fires, leasing analysis and
/// embedding jobs and driving them through the configured provider.
pub async fn compute_run(config: EveConfig, mut shutdown: watch::Receiver<bool>) -> OperationResult<serde_json::Value> {
    match compute_run_inner(config, &mut shutdown).await {
        Ok(()) => OperationResult::ok(serde_json::json!({})),
        Err(e) => OperationResult::err(e.to_string()),
    }
}

async fn compute_run_inner(config: EveConfig, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
    let queue = Arc::new(eve_queue::Queue::open(&config.queue_path())?);
    let writer_handle = eve_warehouse::open(
        &config.warehouse_path(),
        WAREHOUSE_BATCH_SIZE,
        Duration::from_secs(WAREHOUSE_FLUSH_INTERVAL_SECS),
    )?;
    let writer = writer_handle.writer.clone();

    let provider = Arc::new(eve_provider::ProviderClient::new(
        config.provider_api_key.clone(),
        None,
        Duration::from_secs(PROVIDER_CALL_TIMEOUT_SECS),
        Duration::from_secs(PROVIDER_POOL_IDLE_TIMEOUT_SECS),
        PROVIDER_MAX_ATTEMPTS,
    )?);

    let engine_config = eve_compute::ComputeConfig {
        app_dir: config.app_dir.clone(),
        analysis_model: config.analysis_model.clone(),
        embed_model: config.embed_model.clone(),
        analysis_max_messages: config.analysis_max_messages,
        analysis_rpm: config.analysis_rpm,
        embed_rpm: config.embed_rpm,
        worker_concurrency_analysis: config.worker_concurrency_analysis,
        worker_concurrency_embedding: config.worker_concurrency_embedding,
        embed_batch_size: config.embed_batch_size,
        queue_lease_ttl_seconds: config.queue_lease_ttl_seconds,
    };

    let prompt_resolver = Arc::new(eve_compute::FilePromptResolver::new(config.app_dir.clone()));
    let context_assembler = Arc::new(eve_compute::WarehouseContextAssembler::new(writer.clone()));
    let engine = Arc::new(eve_compute::ComputeEngine::new(
        queue,
        writer,
        provider,
        prompt_resolver,
        context_assembler,
        engine_config,
    ));
    engine.clone().run(shutdown.clone()).await;
    engine.shutdown().await;
    writer_handle.close().await?;
    Ok(())
}

/// Load a conversation's transcript and derived state, the same read path
/// the compute engine uses to build analysis prompts.
pub fn query_conversation(config: &EveConfig, conversation_id: i64) -> OperationResult<serde_json::Value> {
    match query_conversation_inner(config, conversation_id) {
        Ok(v) => OperationResult::ok(v),
        Err(e) => OperationResult::err(e.to_string()),
    }
}

fn query_conversation_inner(config: &EveConfig, conversation_id: i64) -> Result<serde_json::Value> {
    let rt = local_runtime()?;
    let _guard = rt.enter();
    let handle = open_warehouse(config)?;
    let result: Result<serde_json::Value> = (|| {
        let conversation = eve_warehouse::query::load_conversation(&handle.writer, conversation_id)?;
        let text = eve_warehouse::query::load_conversation_text(&handle.writer, conversation_id, 0)?;
        Ok(serde_json::json!({
            "conversation": conversation,
            "text": text,
        }))
    })();
    rt.block_on(handle.close())?;
    result
}

fn open_warehouse(config: &EveConfig) -> Result<eve_warehouse::WriterHandle> {
    Ok(eve_warehouse::open(
        &config.warehouse_path(),
        WAREHOUSE_BATCH_SIZE,
        Duration::from_secs(WAREHOUSE_FLUSH_INTERVAL_SECS),
    )?)
}

/// A small current-thread runtime for the synchronous, one-shot operations
/// above (`sync`, `query_conversation`) — only `compute_run` is inherently
/// long-lived and async, so these just need somewhere to await `close()`.
fn local_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| EveError::Runtime(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> (tempfile::TempDir, EveConfig) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EveConfig::default();
        config.app_dir = dir.path().to_str().unwrap().to_string();
        (dir, config)
    }

    #[test]
    fn migrate_creates_both_databases() {
        let (_dir, config) = test_config();
        let result = migrate(&config);
        assert!(result.ok, "{:?}", result.error);
        assert!(std::path::Path::new(&config.warehouse_path()).exists());
        assert!(std::path::Path::new(&config.queue_path()).exists());
    }

    #[test]
    fn enqueue_then_status_reflects_pending_job() {
        let (_dir, config) = test_config();
        assert!(migrate(&config).ok);

        let enqueued = enqueue(&config, "analysis", "conv-1", serde_json::json!({"conversation_id": 1}));
        assert!(enqueued.ok, "{:?}", enqueued.error);

        let status = compute_status(&config);
        assert!(status.ok, "{:?}", status.error);
        let stats = status.counters.unwrap();
        assert!(stats.by_type_state.iter().any(|c| c.job_type == "analysis" && c.count == 1));
    }

    #[test]
    fn enqueue_is_idempotent_by_key() {
        let (_dir, config) = test_config();
        assert!(migrate(&config).ok);

        let first = enqueue(&config, "embedding", "same-key", serde_json::json!({}));
        let second = enqueue(&config, "embedding", "same-key", serde_json::json!({}));
        assert_eq!(
            first.counters.unwrap()["job_id"],
            second.counters.unwrap()["job_id"]
        );
    }

    #[test]
    fn query_conversation_reports_not_found() {
        let (_dir, config) = test_config();
        assert!(migrate(&config).ok);

        let result = query_conversation(&config, 999);
        assert!(!result.ok);
    }
}
