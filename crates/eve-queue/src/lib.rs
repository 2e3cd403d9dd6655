//! Durable job queue (C5): lease-based work distribution over SQLite.
//!
//! Jobs move `pending -> leased -> succeeded`, `pending -> leased -> pending`
//! (retry) or `pending -> leased -> dead` (attempts exhausted). A lease that
//! is never heartbeated or acked expires and is recovered by
//! `requeue_expired`, so a crashed worker never holds a job forever.

pub mod error;
pub mod types;

use std::sync::Mutex;

use eve_migrate::MigrationTarget;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info, warn};

pub use error::{QueueError, Result};
pub use types::{EnqueueRequest, Job, JobState, QueueStats, TypeStateCount};

/// A handle to the queue database. Cheap to clone behind an `Arc` — the
/// connection itself is serialized by an internal mutex, matching the way a
/// single SQLite writer is shared across worker tasks.
pub struct Queue {
    conn: Mutex<rusqlite::Connection>,
}

impl Queue {
    /// Open (creating if absent) the queue database at `path` and apply any
    /// pending migrations.
    pub fn open(path: &str) -> Result<Self> {
        let mut conn = eve_migrate::open_with_pragmas(path, 5_000)?;
        eve_migrate::run(&mut conn, MigrationTarget::Queue)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = rusqlite::Connection::open_in_memory()?;
        eve_migrate::run(&mut conn, MigrationTarget::Queue)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a job if its key is new; otherwise return the existing job's
    /// id unchanged. Idempotent so callers can re-enqueue freely after a
    /// crash without creating duplicate work.
    pub fn enqueue(&self, req: EnqueueRequest) -> Result<String> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM jobs WHERE key = ?1",
                params![req.key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            debug!(job_id = %id, key = %req.key, "enqueue: key already present, skipping");
            return Ok(id);
        }

        let id = eve_core::ids::new_id();
        let now = eve_core::time::now_unix_secs();
        let run_after_ts = req.run_after_ts.unwrap_or(now);
        let payload_json = serde_json::to_string(&req.payload)?;

        conn.execute(
            "INSERT INTO jobs (id, type, key, payload_json, state, attempts, max_attempts,
                                priority, run_after_ts, created_ts, updated_ts)
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?7, ?8, ?8)",
            params![
                id,
                req.job_type,
                req.key,
                payload_json,
                req.max_attempts,
                req.priority,
                run_after_ts,
                now,
            ],
        )?;
        info!(job_id = %id, job_type = %req.job_type, "job enqueued");
        Ok(id)
    }

    /// Atomically select up to `limit` due, pending jobs of `job_type` and
    /// mark them leased to `owner` until `now + lease_ttl_secs`. Ordered by
    /// priority (descending), then by how long a job has been runnable.
    pub fn lease(
        &self,
        job_type: &str,
        owner: &str,
        lease_ttl_secs: u64,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = eve_core::time::now_unix_secs();

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs
                 WHERE type = ?1 AND state = 'pending' AND run_after_ts <= ?2
                 ORDER BY priority DESC, run_after_ts ASC, created_ts ASC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![job_type, now, limit as i64], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let lease_expires_ts = now + lease_ttl_secs as i64;
        for id in &ids {
            tx.execute(
                "UPDATE jobs SET state = 'leased', lease_owner = ?1, lease_expires_ts = ?2,
                                 updated_ts = ?3
                 WHERE id = ?4",
                params![owner, lease_expires_ts, now, id],
            )?;
        }

        let mut leased = Vec::with_capacity(ids.len());
        for id in &ids {
            leased.push(fetch_job(&tx, id)?);
        }
        tx.commit()?;

        if !leased.is_empty() {
            debug!(count = leased.len(), owner, job_type, "jobs leased");
        }
        Ok(leased)
    }

    /// Extend an in-progress job's lease. Used by long-running workers to
    /// prove liveness before the current lease expires.
    pub fn heartbeat(&self, job_id: &str, owner: &str, lease_ttl_secs: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = eve_core::time::now_unix_secs();
        let lease_expires_ts = now + lease_ttl_secs as i64;
        let updated = conn.execute(
            "UPDATE jobs SET lease_expires_ts = ?1, updated_ts = ?2
             WHERE id = ?3 AND state = 'leased' AND lease_owner = ?4",
            params![lease_expires_ts, now, job_id, owner],
        )?;
        if updated == 0 {
            return Err(QueueError::LeaseMismatch {
                job_id: job_id.to_string(),
                owner: owner.to_string(),
            });
        }
        Ok(())
    }

    /// Mark a leased job succeeded.
    pub fn ack(&self, job_id: &str, owner: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = eve_core::time::now_unix_secs();
        let updated = conn.execute(
            "UPDATE jobs SET state = 'succeeded', lease_owner = NULL, lease_expires_ts = NULL,
                             updated_ts = ?1
             WHERE id = ?2 AND state = 'leased' AND lease_owner = ?3",
            params![now, job_id, owner],
        )?;
        if updated == 0 {
            return Err(QueueError::LeaseMismatch {
                job_id: job_id.to_string(),
                owner: owner.to_string(),
            });
        }
        info!(job_id, "job succeeded");
        Ok(())
    }

    /// Record a failed attempt. If attempts remain, reschedule with
    /// exponential backoff (`2^attempts` seconds, or `retry_delay_secs` if
    /// larger); otherwise move the job to `dead`.
    pub fn fail(
        &self,
        job_id: &str,
        owner: &str,
        error_message: &str,
        retry_delay_secs: Option<i64>,
    ) -> Result<JobState> {
        let conn = self.conn.lock().unwrap();
        let now = eve_core::time::now_unix_secs();

        let (attempts, max_attempts): (i64, i64) = conn
            .query_row(
                "SELECT attempts, max_attempts FROM jobs
                 WHERE id = ?1 AND state = 'leased' AND lease_owner = ?2",
                params![job_id, owner],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| QueueError::LeaseMismatch {
                job_id: job_id.to_string(),
                owner: owner.to_string(),
            })?;

        let attempts = attempts + 1;
        let next_state = if attempts >= max_attempts {
            JobState::Dead
        } else {
            JobState::Pending
        };

        let backoff = 2i64.saturating_pow(attempts.min(30) as u32);
        let run_after_ts = now + retry_delay_secs.unwrap_or(0).max(backoff);

        conn.execute(
            "UPDATE jobs SET state = ?1, attempts = ?2, lease_owner = NULL, lease_expires_ts = NULL,
                             last_error = ?3, run_after_ts = ?4, updated_ts = ?5
             WHERE id = ?6",
            params![
                next_state.to_string(),
                attempts,
                error_message,
                run_after_ts,
                now,
                job_id
            ],
        )?;
        warn!(job_id, attempts, next_state = %next_state, "job failed");
        Ok(next_state)
    }

    /// Move any job whose lease has expired back to `pending` so another
    /// worker can pick it up. Intended to run on a periodic timer.
    pub fn requeue_expired(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let now = eve_core::time::now_unix_secs();
        let updated = conn.execute(
            "UPDATE jobs SET state = 'pending', lease_owner = NULL, lease_expires_ts = NULL,
                             updated_ts = ?1
             WHERE state = 'leased' AND lease_expires_ts IS NOT NULL AND lease_expires_ts < ?1",
            params![now],
        )?;
        if updated > 0 {
            warn!(count = updated, "requeued expired leases");
        }
        Ok(updated)
    }

    /// Fetch a single job by id, regardless of state.
    pub fn get(&self, job_id: &str) -> Result<Job> {
        let conn = self.conn.lock().unwrap();
        fetch_job(&conn, job_id)
    }

    /// Counts grouped by job type and state, for operator visibility.
    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT type, state, COUNT(*) FROM jobs GROUP BY type, state ORDER BY type, state",
        )?;
        let rows = stmt.query_map([], |row| {
            let job_type: String = row.get(0)?;
            let state: String = row.get(1)?;
            let count: i64 = row.get(2)?;
            Ok((job_type, state, count))
        })?;

        let mut by_type_state = Vec::new();
        for row in rows {
            let (job_type, state, count) = row?;
            let state = state.parse().map_err(|_| QueueError::UnknownState(state))?;
            by_type_state.push(TypeStateCount {
                job_type,
                state,
                count,
            });
        }
        Ok(QueueStats { by_type_state })
    }
}

fn fetch_job(conn: &rusqlite::Connection, job_id: &str) -> Result<Job> {
    conn.query_row(
        "SELECT id, type, key, payload_json, state, attempts, max_attempts, priority,
                run_after_ts, lease_owner, lease_expires_ts, last_error, created_ts, updated_ts
         FROM jobs WHERE id = ?1",
        params![job_id],
        row_to_job,
    )
    .optional()?
    .ok_or_else(|| QueueError::NotFound(job_id.to_string()))
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let payload_json: String = row.get(3)?;
    let payload = serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null);
    let state_str: String = row.get(4)?;
    let state = state_str.parse().unwrap_or(JobState::Pending);

    Ok(Job {
        id: row.get(0)?,
        job_type: row.get(1)?,
        key: row.get(2)?,
        payload,
        state,
        attempts: row.get(5)?,
        max_attempts: row.get(6)?,
        priority: row.get(7)?,
        run_after_ts: row.get(8)?,
        lease_owner: row.get(9)?,
        lease_expires_ts: row.get(10)?,
        last_error: row.get(11)?,
        created_ts: row.get(12)?,
        updated_ts: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn enqueue_sample(q: &Queue, key: &str) -> String {
        q.enqueue(EnqueueRequest::new("analysis", key, json!({"conversation_id": 1})))
            .unwrap()
    }

    #[test]
    fn enqueue_is_idempotent_on_key() {
        let q = Queue::open_in_memory().unwrap();
        let id1 = enqueue_sample(&q, "conv:1");
        let id2 = enqueue_sample(&q, "conv:1");
        assert_eq!(id1, id2);

        let stats = q.stats().unwrap();
        assert_eq!(stats.by_type_state.len(), 1);
        assert_eq!(stats.by_type_state[0].count, 1);
    }

    #[test]
    fn lease_then_ack_marks_succeeded() {
        let q = Queue::open_in_memory().unwrap();
        enqueue_sample(&q, "conv:1");

        let leased = q.lease("analysis", "worker-a", 60, 10).unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].state, JobState::Leased);
        assert_eq!(leased[0].lease_owner.as_deref(), Some("worker-a"));

        q.ack(&leased[0].id, "worker-a").unwrap();
        let job = q.get(&leased[0].id).unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert!(job.lease_owner.is_none());
    }

    #[test]
    fn leased_jobs_are_not_leased_again() {
        let q = Queue::open_in_memory().unwrap();
        enqueue_sample(&q, "conv:1");
        let first = q.lease("analysis", "worker-a", 60, 10).unwrap();
        assert_eq!(first.len(), 1);

        let second = q.lease("analysis", "worker-b", 60, 10).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn expired_leases_are_recovered() {
        let q = Queue::open_in_memory().unwrap();
        enqueue_sample(&q, "conv:1");
        let leased = q.lease("analysis", "worker-a", 0, 10).unwrap();
        assert_eq!(leased.len(), 1);

        // lease_ttl_secs = 0 means it is already expired relative to "now".
        std::thread::sleep(std::time::Duration::from_millis(1_100));
        let recovered = q.requeue_expired().unwrap();
        assert_eq!(recovered, 1);

        let job = q.get(&leased[0].id).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(job.lease_owner.is_none());
    }

    #[test]
    fn failure_backs_off_until_exhausted() {
        let q = Queue::open_in_memory().unwrap();
        let mut req = EnqueueRequest::new("embedding", "batch:1", json!({}));
        req.max_attempts = 2;
        let id = q.enqueue(req).unwrap();

        let leased = q.lease("embedding", "worker-a", 60, 10).unwrap();
        assert_eq!(leased[0].id, id);
        let state = q.fail(&id, "worker-a", "provider timeout", None).unwrap();
        assert_eq!(state, JobState::Pending);

        let job = q.get(&id).unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.run_after_ts > job.created_ts || job.run_after_ts >= job.updated_ts - 1);

        // Force it runnable immediately for the second lease.
        {
            let conn = q.conn.lock().unwrap();
            conn.execute("UPDATE jobs SET run_after_ts = 0 WHERE id = ?1", params![id])
                .unwrap();
        }
        let leased_again = q.lease("embedding", "worker-a", 60, 10).unwrap();
        assert_eq!(leased_again.len(), 1);
        let state = q.fail(&id, "worker-a", "provider timeout again", None).unwrap();
        assert_eq!(state, JobState::Dead);

        let job = q.get(&id).unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn lease_respects_priority_then_age() {
        let q = Queue::open_in_memory().unwrap();
        let low = q
            .enqueue(EnqueueRequest {
                priority: 0,
                ..EnqueueRequest::new("analysis", "low", json!({}))
            })
            .unwrap();
        let high = q
            .enqueue(EnqueueRequest {
                priority: 10,
                ..EnqueueRequest::new("analysis", "high", json!({}))
            })
            .unwrap();

        let leased = q.lease("analysis", "worker-a", 60, 10).unwrap();
        assert_eq!(leased[0].id, high);
        assert_eq!(leased[1].id, low);
    }
}
