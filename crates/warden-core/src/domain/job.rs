//! Job record and status management.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{GroupId, JobId};

/// Name of a durable queue (one per kind of maintenance work).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueType(String);

impl QueueType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Job status.
///
/// State transitions:
/// - Created -> Running -> Completed | Failed
/// - Running -> Running (re-dequeued after heartbeat expiry, new version)
/// - Created -> Cancelled (group cancellation)
/// - Running -> Cancelled (worker observes the cancel flag and completes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// One row of the job queue.
///
/// `version` is the optimistic-concurrency token: it increments on every
/// heartbeat and status change, and completion is gated on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub queue_type: QueueType,
    pub group_id: GroupId,
    pub job_id: JobId,
    pub version: i64,
    pub status: JobStatus,
    pub definition: serde_json::Value,
    /// 冪等 enqueue のキー（queue_type 内で一意、archive されるまで保持）
    #[serde(default)]
    pub unique_key: Option<String>,
    pub worker_id: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub dequeue_count: u32,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(
        queue_type: QueueType,
        group_id: GroupId,
        job_id: JobId,
        definition: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            queue_type,
            group_id,
            job_id,
            version: 0,
            status: JobStatus::Created,
            definition,
            unique_key: None,
            worker_id: None,
            heartbeat_at: None,
            dequeue_count: 0,
            cancel_requested: false,
            created_at: now,
            ended_at: None,
        }
    }

    /// Created, or Running with a heartbeat older than `timeout`.
    pub fn is_claimable(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        match self.status {
            JobStatus::Created => true,
            JobStatus::Running => self
                .heartbeat_at
                .is_none_or(|beat| beat + timeout <= now),
            _ => false,
        }
    }

    /// claim: Running にして heartbeat を打ち直し、version を進める
    pub fn start_attempt(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.worker_id = Some(worker_id.to_string());
        self.heartbeat_at = Some(now);
        self.dequeue_count += 1;
        self.version += 1;
    }

    /// heartbeat のたびに version が 1 進む（古いコピーでの complete を弾くため）
    pub fn heartbeat(&mut self, now: DateTime<Utc>) {
        self.heartbeat_at = Some(now);
        self.version += 1;
    }

    /// 終端状態へ遷移し `ended_at` を記録する
    pub fn finish(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.ended_at = Some(now);
        self.version += 1;
    }
}

/// 状態ごとの件数（診断用）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub created: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobCounts {
    pub fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Created => self.created += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}
