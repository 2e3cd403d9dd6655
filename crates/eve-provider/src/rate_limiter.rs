//! Leaky-bucket rate limiter (C2): shapes request pacing to a target
//! requests-per-minute rate. One shared `next`-slot timestamp under a
//! mutex; every caller is assigned a strictly monotonic slot and sleeps
//! until it arrives. Bursts are never permitted; the very first call
//! returns immediately.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

struct State {
    /// `None` when the limiter is disabled (non-positive RPM): every call
    /// is a no-op, matching the "nil limiter" contract.
    interval: Option<Duration>,
    next: Instant,
}

pub struct RateLimiter {
    state: Mutex<State>,
}

impl RateLimiter {
    /// `rpm <= 0` yields a nil limiter: `wait` always returns immediately.
    pub fn new(rpm: u32) -> Self {
        Self {
            state: Mutex::new(State {
                interval: interval_for_rpm(rpm),
                next: Instant::now(),
            }),
        }
    }

    /// Retune the target rate. Only affects slots scheduled after this
    /// call; already-sleeping callers are unaffected.
    pub fn set_rpm(&self, rpm: u32) {
        let mut state = self.state.lock().unwrap();
        state.interval = interval_for_rpm(rpm);
    }

    /// Block until this caller's scheduled slot arrives, or until `cancel`
    /// fires. Returns immediately for a nil limiter or for the first call
    /// after a long idle period. Callers must check `cancel.is_cancelled()`
    /// afterward — a cancelled wait does not rewind the slot it was given.
    pub async fn wait(&self, cancel: &CancellationToken) {
        let sleep_until = {
            let mut state = self.state.lock().unwrap();
            let Some(interval) = state.interval else {
                return;
            };
            let now = Instant::now();
            let scheduled = if now >= state.next { now } else { state.next };
            state.next = scheduled + interval;
            scheduled
        };

        let now = Instant::now();
        if sleep_until > now {
            tokio::select! {
                _ = tokio::time::sleep(sleep_until - now) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }
}

fn interval_for_rpm(rpm: u32) -> Option<Duration> {
    if rpm == 0 {
        None
    } else {
        Some(Duration::from_secs_f64(60.0 / rpm as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn first_call_returns_immediately() {
        let limiter = RateLimiter::new(60);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        limiter.wait(&cancel).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn nil_limiter_never_sleeps() {
        let limiter = RateLimiter::new(0);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..5 {
            limiter.wait(&cancel).await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn concurrent_callers_are_serialized_to_the_interval() {
        // 600 rpm = 100ms between slots.
        let limiter = Arc::new(RateLimiter::new(600));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                limiter.wait(&cancel).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        // Three slots at 100ms spacing: the last caller waits at least ~200ms.
        assert!(start.elapsed() >= Duration::from_millis(180));
    }

    #[tokio::test]
    async fn set_rpm_changes_future_interval() {
        let limiter = RateLimiter::new(60);
        let cancel = CancellationToken::new();
        limiter.wait(&cancel).await;
        limiter.set_rpm(0);
        let start = Instant::now();
        limiter.wait(&cancel).await;
        assert!(start.elapsed() < Duration::from_millis(50), "disabling rpm should make wait a no-op");
    }

    #[tokio::test]
    async fn cancelling_returns_before_the_slot_arrives() {
        let limiter = RateLimiter::new(30); // 2s between slots
        let cancel = CancellationToken::new();
        limiter.wait(&cancel).await;
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            child.cancel();
        });
        let start = Instant::now();
        limiter.wait(&cancel).await;
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
