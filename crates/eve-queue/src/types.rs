use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Lifecycle state of a queued job.
///
/// `pending -> leased -> succeeded`
/// `pending -> leased -> pending` (failed, attempts remain)
/// `pending -> leased -> dead` (failed, attempts exhausted)
/// `leased -> pending` (lease expired before ack/fail, recovered by `requeue_expired`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Leased,
    Succeeded,
    Failed,
    Dead,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Pending => "pending",
            JobState::Leased => "leased",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        })
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "leased" => Ok(JobState::Leased),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::UnknownState(other.to_string())),
        }
    }
}

/// A queued unit of work: either an analysis job (one conversation) or an
/// embedding job (one batch of entity references).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub key: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub attempts: i64,
    pub max_attempts: i64,
    pub priority: i64,
    pub run_after_ts: i64,
    pub lease_owner: Option<String>,
    pub lease_expires_ts: Option<i64>,
    pub last_error: Option<String>,
    pub created_ts: i64,
    pub updated_ts: i64,
}

/// Request to enqueue a job. `key` is the idempotency key: enqueuing twice
/// with the same key is a no-op and returns the id of the existing job.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub job_type: String,
    pub key: String,
    pub payload: serde_json::Value,
    pub max_attempts: i64,
    pub run_after_ts: Option<i64>,
    pub priority: i64,
}

impl EnqueueRequest {
    pub fn new(job_type: impl Into<String>, key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            key: key.into(),
            payload,
            max_attempts: eve_core::config::DEFAULT_QUEUE_MAX_ATTEMPTS as i64,
            run_after_ts: None,
            priority: 0,
        }
    }
}

/// Aggregate counts used by `eve compute status` and operator dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub by_type_state: Vec<TypeStateCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeStateCount {
    pub job_type: String,
    pub state: JobState,
    pub count: i64,
}

impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for JobState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
