//! Rolling-window health tracking for provider calls, keyed by operation
//! type ("analysis", "embedding") rather than by provider instance — there
//! is exactly one configured provider, but analysis and embedding have
//! independent rate limits and failure profiles and are tracked separately.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

use crate::error::ProviderError;

const WINDOW_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Ok,
    Degraded,
    Down,
    RateLimited,
    AuthExpired,
    Unknown,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Degraded => write!(f, "degraded"),
            Self::Down => write!(f, "down"),
            Self::RateLimited => write!(f, "rate-limited"),
            Self::AuthExpired => write!(f, "auth-expired"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationHealthEntry {
    pub operation: String,
    pub status: OperationStatus,
    pub last_success_at: Option<i64>,
    pub last_error_at: Option<i64>,
    pub last_error: Option<String>,
    pub avg_latency_ms: u64,
    pub requests_ok: u32,
    pub requests_err: u32,
    pub requests_429: u32,
    pub total_requests: u64,
}

struct InternalEntry {
    window: VecDeque<(Instant, bool, u64)>,
    last_success_at: Option<i64>,
    last_error_at: Option<i64>,
    last_error: Option<String>,
    total_requests: u64,
    requests_429: u32,
    auth_override: Option<OperationStatus>,
}

impl InternalEntry {
    fn new() -> Self {
        Self {
            window: VecDeque::new(),
            last_success_at: None,
            last_error_at: None,
            last_error: None,
            total_requests: 0,
            requests_429: 0,
            auth_override: None,
        }
    }

    fn prune(&mut self) {
        let cutoff = Instant::now() - std::time::Duration::from_secs(WINDOW_SECS);
        while self.window.front().is_some_and(|(t, _, _)| *t < cutoff) {
            self.window.pop_front();
        }
    }

    fn derive_status(&self) -> OperationStatus {
        if let Some(status) = self.auth_override {
            return status;
        }
        if self.window.is_empty() {
            return OperationStatus::Unknown;
        }
        let total = self.window.len() as f64;
        let ok_count = self.window.iter().filter(|(_, ok, _)| *ok).count() as f64;
        let success_rate = ok_count / total;
        if success_rate > 0.8 {
            OperationStatus::Ok
        } else if success_rate >= 0.5 {
            OperationStatus::Degraded
        } else {
            OperationStatus::Down
        }
    }

    fn avg_latency_ms(&self) -> u64 {
        if self.window.is_empty() {
            return 0;
        }
        let sum: u64 = self.window.iter().map(|(_, _, lat)| lat).sum();
        sum / self.window.len() as u64
    }

    fn requests_ok(&self) -> u32 {
        self.window.iter().filter(|(_, ok, _)| *ok).count() as u32
    }

    fn requests_err(&self) -> u32 {
        self.window.iter().filter(|(_, ok, _)| !*ok).count() as u32
    }

    /// Fraction of the window's outcomes that were a 429, used by the
    /// compute engine's adaptive concurrency feedback loop.
    fn rate_limited_fraction(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.requests_429 as f64 / self.window.len() as f64
    }

    fn to_entry(&self, operation: &str) -> OperationHealthEntry {
        OperationHealthEntry {
            operation: operation.to_string(),
            status: self.derive_status(),
            last_success_at: self.last_success_at,
            last_error_at: self.last_error_at,
            last_error: self.last_error.clone(),
            avg_latency_ms: self.avg_latency_ms(),
            requests_ok: self.requests_ok(),
            requests_err: self.requests_err(),
            requests_429: self.requests_429,
            total_requests: self.total_requests,
        }
    }
}

/// Concurrent, lock-free health tracker shared across a compute worker pool.
pub struct HealthTracker {
    entries: DashMap<String, InternalEntry>,
}

impl HealthTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { entries: DashMap::new() })
    }

    pub fn record_success(&self, operation: &str, latency_ms: u64) {
        let mut entry = self.entries.entry(operation.to_string()).or_insert_with(InternalEntry::new);
        entry.prune();
        entry.window.push_back((Instant::now(), true, latency_ms));
        entry.last_success_at = Some(chrono::Utc::now().timestamp());
        entry.total_requests += 1;
        entry.auth_override = None;
    }

    pub fn record_error(&self, operation: &str, error: &ProviderError) {
        let mut entry = self.entries.entry(operation.to_string()).or_insert_with(InternalEntry::new);
        entry.prune();
        entry.window.push_back((Instant::now(), false, 0));
        entry.last_error_at = Some(chrono::Utc::now().timestamp());
        entry.last_error = Some(error.to_string());
        entry.total_requests += 1;

        match error {
            ProviderError::RateLimited { .. } => {
                entry.requests_429 += 1;
                entry.auth_override = Some(OperationStatus::RateLimited);
            }
            ProviderError::Api { status, .. } if *status == 401 || *status == 403 => {
                entry.auth_override = Some(OperationStatus::AuthExpired);
            }
            _ => {}
        }
    }

    /// Fraction of the last 5 minutes of calls for `operation` that hit a
    /// 429, used to drive the compute engine's adaptive slowdown/ramp.
    pub fn rate_limited_fraction(&self, operation: &str) -> f64 {
        self.entries
            .get(operation)
            .map(|e| e.rate_limited_fraction())
            .unwrap_or(0.0)
    }

    pub fn all_entries(&self) -> Vec<OperationHealthEntry> {
        self.entries
            .iter()
            .map(|e| {
                let mut entry = e.value().to_entry(e.key());
                entry.status = e.value().derive_status();
                entry
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_success_yields_ok_status() {
        let tracker = HealthTracker::new();
        for _ in 0..5 {
            tracker.record_success("analysis", 100);
        }
        let entries = tracker.all_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, OperationStatus::Ok);
        assert_eq!(entries[0].avg_latency_ms, 100);
    }

    #[test]
    fn mostly_errors_derive_down() {
        let tracker = HealthTracker::new();
        for _ in 0..10 {
            tracker.record_error("embedding", &ProviderError::Unavailable("x".into()));
        }
        let entries = tracker.all_entries();
        assert_eq!(entries[0].status, OperationStatus::Down);
    }

    #[test]
    fn rate_limit_overrides_status_and_counts_toward_fraction() {
        let tracker = HealthTracker::new();
        for _ in 0..3 {
            tracker.record_success("analysis", 50);
        }
        tracker.record_error("analysis", &ProviderError::RateLimited { retry_after_ms: 1000 });
        let entries = tracker.all_entries();
        assert_eq!(entries[0].status, OperationStatus::RateLimited);
        assert!(tracker.rate_limited_fraction("analysis") > 0.0);
    }

    #[test]
    fn operations_are_tracked_independently() {
        let tracker = HealthTracker::new();
        tracker.record_success("analysis", 10);
        tracker.record_error("embedding", &ProviderError::Unavailable("x".into()));
        let entries = tracker.all_entries();
        assert_eq!(entries.len(), 2);
    }
}
