//! Compute engine (C9): two worker pools — analysis and embedding — each
//! with its own semaphore, rate limiter, and lease loop. Adapts concurrency
//! and RPM downward on sustained 429s and ramps back up when traffic is
//! healthy.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use eve_provider::{GenerationConfig, HealthTracker, ProviderClient, RateLimiter};
use eve_queue::{Job, Queue};
use eve_warehouse::types::FacetKind;
use eve_warehouse::{query, Writer};

use crate::batcher::{BatcherHandle, EmbedTask};
use crate::context::ContextAssembler;
use crate::error::{ComputeError, Result};
use crate::prompt::{self, PromptResolver};

const ANALYSIS_TYPE: &str = "analysis";
const EMBEDDING_TYPE: &str = "embedding";

/// Fraction of 429s in the health tracker's rolling window above which the
/// pool backs off.
const RATE_LIMIT_BACKOFF_THRESHOLD: f64 = 0.2;
/// How often a pool's tick loop fires.
const TICK_INTERVAL: Duration = Duration::from_millis(250);
/// Jobs leased per tick relative to available worker slots.
const LEASE_BATCH_FACTOR: usize = 2;
/// How long `shutdown` waits for in-flight workers to finish before giving
/// up on them; their leases are then recovered by the next run's
/// `requeue_expired`.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ComputeConfig {
    pub app_dir: String,
    pub analysis_model: String,
    pub embed_model: String,
    pub analysis_max_messages: usize,
    pub analysis_rpm: u32,
    pub embed_rpm: u32,
    pub worker_concurrency_analysis: usize,
    pub worker_concurrency_embedding: usize,
    pub embed_batch_size: usize,
    pub queue_lease_ttl_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct AnalysisPayload {
    conversation_id: i64,
    #[allow(dead_code)]
    chat_id: i64,
    prompt_id: String,
}

#[derive(Debug, Deserialize)]
struct EmbedPayload {
    entity_type: String,
    entity_id: i64,
    text: String,
    model: String,
}

/// One pool's adaptive state: a semaphore capping in-flight jobs (shrunk by
/// permanently forgetting permits, grown by adding them back) and the RPM
/// currently applied to its rate limiter.
struct Pool {
    job_type: &'static str,
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    configured_rpm: u32,
    current_rpm: AtomicU32,
    limiter: Arc<RateLimiter>,
}

impl Pool {
    fn new(job_type: &'static str, max_concurrency: usize, configured_rpm: u32) -> Self {
        Self {
            job_type,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            max_concurrency: max_concurrency.max(1),
            configured_rpm,
            current_rpm: AtomicU32::new(configured_rpm),
            limiter: Arc::new(RateLimiter::new(configured_rpm)),
        }
    }

    /// React to the operation's recent 429 rate: back off hard on sustained
    /// rate limiting, ramp back toward the configured maxima when healthy.
    fn adapt(&self, rate_limited_fraction: f64) {
        if rate_limited_fraction > RATE_LIMIT_BACKOFF_THRESHOLD {
            if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                permit.forget();
                warn!(job_type = self.job_type, "sustained rate limiting, reducing concurrency by one permit");
            }
            let current = self.current_rpm.load(Ordering::Relaxed);
            if current > 0 {
                let halved = (current / 2).max(1);
                self.current_rpm.store(halved, Ordering::Relaxed);
                self.limiter.set_rpm(halved);
            }
        } else if rate_limited_fraction == 0.0 {
            let available = self.semaphore.available_permits();
            if available < self.max_concurrency {
                self.semaphore.add_permits(1);
            }
            let current = self.current_rpm.load(Ordering::Relaxed);
            if current > 0 && current < self.configured_rpm {
                let increased = (current + current / 10 + 1).min(self.configured_rpm);
                self.current_rpm.store(increased, Ordering::Relaxed);
                self.limiter.set_rpm(increased);
            }
        }
    }
}

pub struct ComputeEngine {
    queue: Arc<Queue>,
    writer: Arc<Writer>,
    provider: Arc<ProviderClient>,
    prompt_resolver: Arc<dyn PromptResolver>,
    context_assembler: Arc<dyn ContextAssembler>,
    health: Arc<HealthTracker>,
    analysis_pool: Pool,
    embedding_pool: Pool,
    batcher: BatcherHandle,
    config: ComputeConfig,
    owner: String,
    /// Cancelled once `shutdown` is called, so in-flight suspension points
    /// (rate-limiter waits, provider calls, batcher flushes) stop waiting
    /// out a full retry loop instead of blocking the grace period below.
    cancel: CancellationToken,
    /// Handles for workers spawned by `tick_pool`, joined with a bounded
    /// grace period in `shutdown`.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ComputeEngine {
    pub fn new(
        queue: Arc<Queue>,
        writer: Arc<Writer>,
        provider: Arc<ProviderClient>,
        prompt_resolver: Arc<dyn PromptResolver>,
        context_assembler: Arc<dyn ContextAssembler>,
        config: ComputeConfig,
    ) -> Self {
        let health = HealthTracker::new();
        let analysis_pool = Pool::new(ANALYSIS_TYPE, config.worker_concurrency_analysis, config.analysis_rpm);
        let embedding_pool = Pool::new(EMBEDDING_TYPE, config.worker_concurrency_embedding, config.embed_rpm);
        let cancel = CancellationToken::new();

        let batcher = crate::batcher::spawn(
            provider.clone(),
            embedding_pool.limiter.clone(),
            health.clone(),
            config.embed_model.clone(),
            config.embed_batch_size,
            Duration::from_secs(2),
            cancel.clone(),
        );

        Self {
            queue,
            writer,
            provider,
            prompt_resolver,
            context_assembler,
            health,
            analysis_pool,
            embedding_pool,
            batcher,
            owner: format!("eve-compute-{}", eve_core::ids::new_id()),
            config,
            cancel,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn health(&self) -> Arc<HealthTracker> {
        self.health.clone()
    }

    /// Run until `shutdown` broadcasts `true`, then stop accepting new
    /// leases and return. Call [`ComputeEngine::shutdown`] afterward to wait
    /// for in-flight workers and drain the embedding batcher.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        debug!("compute engine started");
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.queue.requeue_expired() {
                        error!(error = %e, "requeue_expired failed");
                    }
                    self.tick_pool(&self.analysis_pool, JobKind::Analysis);
                    self.tick_pool(&self.embedding_pool, JobKind::Embedding);
                    self.analysis_pool.adapt(self.health.rate_limited_fraction(ANALYSIS_TYPE));
                    self.embedding_pool.adapt(self.health.rate_limited_fraction(EMBEDDING_TYPE));
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("compute engine stopping new leases");
                        break;
                    }
                }
            }
        }
    }

    /// Stop accepting new leases (idempotent — safe even if `run` already
    /// exited), wait up to [`SHUTDOWN_GRACE_PERIOD`] for in-flight workers to
    /// finish, then drain the embedding batcher. Callers close the warehouse
    /// writer separately once this returns. Workers still running past the
    /// grace period are abandoned; their leases are recovered by the next
    /// run's `requeue_expired`.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        let join_all = async {
            for handle in handles {
                if let Err(join_err) = handle.await {
                    error!(error = %join_err, "worker task panicked during shutdown");
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, join_all).await.is_err() {
            warn!(
                grace_period_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
                "shutdown grace period elapsed with workers still in flight, abandoning them"
            );
        }

        self.batcher.close().await;
    }

    fn tick_pool(&self, pool: &Pool, kind: JobKind) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.tasks.lock().unwrap().retain(|h| !h.is_finished());

        let available = pool.semaphore.available_permits();
        if available == 0 {
            return;
        }
        let batch_size = available * LEASE_BATCH_FACTOR;
        let leased = match self.queue.lease(pool.job_type, &self.owner, self.config.queue_lease_ttl_seconds, batch_size) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(job_type = pool.job_type, error = %e, "lease failed");
                return;
            }
        };

        for job in leased {
            let permit = match pool.semaphore.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => break,
            };
            let queue = self.queue.clone();
            let writer = self.writer.clone();
            let provider = self.provider.clone();
            let prompt_resolver = self.prompt_resolver.clone();
            let context_assembler = self.context_assembler.clone();
            let health = self.health.clone();
            let limiter = pool.limiter.clone();
            let batcher = self.batcher.batcher.clone();
            let config = self.config.clone();
            let owner = self.owner.clone();
            let lease_ttl = self.config.queue_lease_ttl_seconds;
            let cancel = self.cancel.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let heartbeat_owner = owner.clone();
                let heartbeat_queue = queue.clone();
                let job_id = job.id.clone();

                let work = run_job(
                    job,
                    kind,
                    queue,
                    writer,
                    provider,
                    prompt_resolver,
                    context_assembler,
                    limiter,
                    health,
                    batcher,
                    config,
                    owner,
                    cancel,
                );
                tokio::pin!(work);

                let mut hb_interval = tokio::time::interval(Duration::from_secs((lease_ttl / 3).max(1)));
                hb_interval.tick().await;
                loop {
                    tokio::select! {
                        _ = &mut work => return,
                        _ = hb_interval.tick() => {
                            if let Err(e) = heartbeat_queue.heartbeat(&job_id, &heartbeat_owner, lease_ttl) {
                                warn!(job_id = %job_id, error = %e, "heartbeat failed, lease ownership lost; abandoning job");
                                return;
                            }
                        }
                    }
                }
            });
            self.tasks.lock().unwrap().push(handle);
        }
    }
}

#[derive(Clone, Copy)]
enum JobKind {
    Analysis,
    Embedding,
}

#[allow(clippy::too_many_arguments)]
async fn run_job(
    job: Job,
    kind: JobKind,
    queue: Arc<Queue>,
    writer: Arc<Writer>,
    provider: Arc<ProviderClient>,
    prompt_resolver: Arc<dyn PromptResolver>,
    context_assembler: Arc<dyn ContextAssembler>,
    limiter: Arc<RateLimiter>,
    health: Arc<HealthTracker>,
    batcher: Arc<crate::batcher::EmbeddingBatcher>,
    config: ComputeConfig,
    owner: String,
    cancel: CancellationToken,
) {
    let result = match kind {
        JobKind::Analysis => {
            run_analysis(
                &job,
                &queue,
                &writer,
                prompt_resolver.as_ref(),
                context_assembler.as_ref(),
                &provider,
                &limiter,
                &health,
                &config,
                &owner,
                &cancel,
            )
            .await
        }
        JobKind::Embedding => run_embedding(&job, &queue, &writer, &batcher, &owner).await,
    };
    if let Err(e) = result {
        error!(job_id = %job.id, error = %e, "job execution failed before it could be acked or failed");
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_analysis(
    job: &Job,
    queue: &Queue,
    writer: &Writer,
    prompt_resolver: &dyn PromptResolver,
    context_assembler: &dyn ContextAssembler,
    provider: &ProviderClient,
    limiter: &RateLimiter,
    health: &HealthTracker,
    config: &ComputeConfig,
    owner: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let payload: AnalysisPayload = serde_json::from_value(job.payload.clone())?;
    let context = context_assembler.assemble(payload.conversation_id, config.analysis_max_messages)?;

    let template = match prompt_resolver.resolve(&payload.prompt_id) {
        Ok(t) => t,
        Err(e) => {
            queue.fail(&job.id, owner, &e.to_string(), None)?;
            return Ok(());
        }
    };
    let compiled = prompt::compile_prompt(&template, &context.text);
    let generation_config: GenerationConfig = (&template.generation_config).into();

    match provider.analyze(limiter, health, &config.analysis_model, &compiled, &generation_config, cancel).await {
        Err(eve_provider::ProviderError::Cancelled) => {
            // Shutdown fired mid-call: leave the lease untouched so
            // `requeue_expired` recovers it on the next run rather than
            // counting this as a real failed attempt.
            debug!(job_id = %job.id, "analysis abandoned due to shutdown");
        }
        Ok(response) => match prompt::parse_analysis_response(&response.text) {
            Ok(result) => {
                let facets = build_facet_rows(&result, payload.conversation_id, context.chat_id);
                let result_json = serde_json::to_string(&result)?;
                query::persist_analysis_success(
                    writer,
                    payload.conversation_id,
                    context.chat_id,
                    &payload.prompt_id,
                    &compiled,
                    &config.analysis_model,
                    &result_json,
                    &facets,
                    eve_core::time::now_unix_secs(),
                )?;
                queue.ack(&job.id, owner)?;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "analysis response failed schema validation");
                query::persist_analysis_failure(
                    writer,
                    payload.conversation_id,
                    &payload.prompt_id,
                    eve_warehouse::types::AnalysisStatus::Failed,
                    &e.to_string(),
                )?;
                queue.fail(&job.id, owner, &e.to_string(), None)?;
            }
        },
        Err(eve_provider::ProviderError::Blocked { reason, message }) => {
            query::persist_analysis_blocked(
                writer,
                payload.conversation_id,
                &payload.prompt_id,
                &reason,
                &message,
                eve_core::time::now_unix_secs(),
            )?;
            queue.ack(&job.id, owner)?;
        }
        Err(e) => {
            let retry_delay = match &e {
                eve_provider::ProviderError::RateLimited { retry_after_ms } => Some((*retry_after_ms / 1000) as i64),
                _ => None,
            };
            query::persist_analysis_failure(
                writer,
                payload.conversation_id,
                &payload.prompt_id,
                eve_warehouse::types::AnalysisStatus::Failed,
                &e.to_string(),
            )?;
            queue.fail(&job.id, owner, &e.to_string(), retry_delay)?;
        }
    }
    Ok(())
}

async fn run_embedding(
    job: &Job,
    queue: &Queue,
    writer: &Writer,
    batcher: &crate::batcher::EmbeddingBatcher,
    owner: &str,
) -> Result<()> {
    let payload: EmbedPayload = serde_json::from_value(job.payload.clone())?;
    let outcome = batcher
        .add(EmbedTask {
            entity_type: payload.entity_type.clone(),
            entity_id: payload.entity_id,
            text: payload.text.clone(),
        })
        .await;

    match outcome {
        Ok(result) => {
            let blob = embedding_to_blob(&result.values);
            query::persist_embedding(
                writer,
                &payload.entity_type,
                payload.entity_id,
                &payload.model,
                &blob,
                result.dimension as i64,
                eve_core::time::now_unix_secs(),
            )?;
            queue.ack(&job.id, owner)?;
        }
        Err(message) => {
            queue.fail(&job.id, owner, &message, None)?;
        }
    }
    Ok(())
}

fn embedding_to_blob(values: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(values.len() * 4);
    for v in values {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn build_facet_rows(
    result: &prompt::AnalysisResult,
    conversation_id: i64,
    chat_id: i64,
) -> Vec<(FacetKind, eve_warehouse::types::FacetRow)> {
    let mut rows = Vec::new();
    for (kind, items) in [
        (FacetKind::Entity, &result.entities),
        (FacetKind::Topic, &result.topics),
        (FacetKind::Emotion, &result.emotions),
        (FacetKind::HumorItem, &result.humor_items),
    ] {
        for item in items {
            rows.push((
                kind,
                eve_warehouse::types::FacetRow {
                    conversation_id,
                    chat_id,
                    contact_id: None,
                    item_value: item.clone(),
                },
            ));
        }
    }
    rows
}
