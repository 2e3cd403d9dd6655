//! Embedding batcher (C8): accumulates embedding tasks and flushes them to
//! the provider as one `batchEmbed` call, either when the batch fills or on
//! a timer. A batch fails together — if the call errors, every task in
//! that batch receives the same error.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use eve_provider::{EmbeddingResult, HealthTracker, ProviderClient, RateLimiter};

#[derive(Debug, Clone)]
pub struct EmbedTask {
    pub entity_type: String,
    pub entity_id: i64,
    pub text: String,
}

pub type EmbedOutcome = std::result::Result<EmbeddingResult, String>;

struct Pending {
    task: EmbedTask,
    respond_to: oneshot::Sender<EmbedOutcome>,
}

pub struct EmbeddingBatcher {
    client: Arc<ProviderClient>,
    limiter: Arc<RateLimiter>,
    health: Arc<HealthTracker>,
    model: String,
    pending: Mutex<Vec<Pending>>,
    batch_size: usize,
    shutdown_tx: watch::Sender<bool>,
    cancel: CancellationToken,
}

pub struct BatcherHandle {
    pub batcher: Arc<EmbeddingBatcher>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EmbeddingBatcher {
    /// Queue a task and wait for its result. Returns the task's own result
    /// once its batch has been flushed — not necessarily this call's flush.
    pub async fn add(&self, task: EmbedTask) -> EmbedOutcome {
        let (tx, rx) = oneshot::channel();
        let should_flush = {
            let mut pending = self.pending.lock().unwrap();
            pending.push(Pending { task, respond_to: tx });
            pending.len() >= self.batch_size
        };
        if should_flush {
            self.flush().await;
        }
        rx.await.unwrap_or_else(|_| Err("batcher closed before this task's batch flushed".to_string()))
    }

    /// Force an immediate flush of whatever is pending.
    pub async fn flush(&self) {
        let batch: Vec<Pending> = {
            let mut pending = self.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        if batch.is_empty() {
            return;
        }

        let contents: Vec<String> = batch.iter().map(|p| p.task.text.clone()).collect();
        let count = batch.len();
        match self.client.batch_embed(&self.limiter, &self.health, &self.model, &contents, &self.cancel).await {
            Ok(results) => {
                debug!(count, "embedding batch flushed");
                for (pending, result) in batch.into_iter().zip(results) {
                    let _ = pending.respond_to.send(Ok(result));
                }
            }
            Err(e) => {
                let message = e.to_string();
                error!(count, error = %message, "embedding batch failed, failing all tasks in it");
                for pending in batch {
                    let _ = pending.respond_to.send(Err(message.clone()));
                }
            }
        }
    }
}

pub fn spawn(
    client: Arc<ProviderClient>,
    limiter: Arc<RateLimiter>,
    health: Arc<HealthTracker>,
    model: String,
    batch_size: usize,
    flush_interval: Duration,
    cancel: CancellationToken,
) -> BatcherHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let batcher = Arc::new(EmbeddingBatcher {
        client,
        limiter,
        health,
        model,
        pending: Mutex::new(Vec::new()),
        batch_size,
        shutdown_tx,
        cancel,
    });

    let task_batcher = batcher.clone();
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(flush_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    task_batcher.flush().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        task_batcher.flush().await;
                        return;
                    }
                }
            }
        }
    });

    BatcherHandle { batcher, task: tokio::sync::Mutex::new(Some(task)) }
}

impl BatcherHandle {
    /// Stop the background timer, flush whatever remains, and drain. Safe
    /// to call multiple times — only the first call actually awaits the
    /// background task.
    pub async fn close(&self) {
        let _ = self.batcher.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(join_err) = task.await {
                error!(error = %join_err, "embedding batcher background task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eve_provider::ProviderError;

    // A batcher wired to an unreachable base URL lets us exercise the
    // batch-fails-together path deterministically without a live provider.
    fn unreachable_client() -> Arc<ProviderClient> {
        Arc::new(
            ProviderClient::new(
                "test-key".to_string(),
                Some("http://127.0.0.1:1".to_string()),
                Duration::from_millis(200),
                Duration::from_secs(30),
                1,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn failing_flush_delivers_the_same_error_to_every_task() {
        let handle = spawn(
            unreachable_client(),
            Arc::new(RateLimiter::new(0)),
            HealthTracker::new(),
            "test-embed".to_string(),
            2,
            Duration::from_secs(3600),
            CancellationToken::new(),
        );

        let batcher = handle.batcher.clone();
        let t1 = tokio::spawn(async move {
            batcher
                .add(EmbedTask { entity_type: "message".into(), entity_id: 1, text: "a".into() })
                .await
        });
        let batcher2 = handle.batcher.clone();
        let t2 = tokio::spawn(async move {
            batcher2
                .add(EmbedTask { entity_type: "message".into(), entity_id: 2, text: "b".into() })
                .await
        });

        let (r1, r2) = tokio::join!(t1, t2);
        assert!(r1.unwrap().is_err());
        assert!(r2.unwrap().is_err());
        handle.close().await;
    }

    #[test]
    fn embed_outcome_error_is_a_plain_string() {
        let err: EmbedOutcome = Err(ProviderError::Unavailable("down".into()).to_string());
        assert!(err.is_err());
    }
}
