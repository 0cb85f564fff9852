//! JobQueueClient port - 永続ジョブキュー
//!
//! # 設計原則
//! - 状態遷移（claim / heartbeat / complete）はすべて store 側の 1 操作
//! - `version` が楽観的並行制御のトークン。古い version の complete は拒否される
//! - heartbeat が途切れた Running ジョブは別 worker の dequeue 対象になる（job レベルの crash recovery）

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{GroupId, JobCounts, JobId, JobRecord, QueueType, Result};

/// heartbeat 成功時の結果。更新後の行と、group にキャンセルが要求されているか
#[derive(Debug, Clone)]
pub struct KeepAlive {
    pub job: JobRecord,
    pub cancel_requested: bool,
}

#[async_trait]
pub trait JobQueueClient: Send + Sync {
    /// Creates one job per definition in a single group.
    ///
    /// With `force_one_active_job_group`, fails with `JobGroupConflict` when
    /// any uncompleted job of `queue_type` exists. Identical definitions that
    /// are still active are not duplicated; the existing row is returned.
    async fn enqueue(
        &self,
        queue_type: &QueueType,
        definitions: Vec<serde_json::Value>,
        group_id: Option<GroupId>,
        force_one_active_job_group: bool,
    ) -> Result<Vec<JobRecord>>;

    /// Enqueues a single job keyed by `key`, unique within `queue_type`.
    ///
    /// If a job with the same key exists, in any status, it is returned and
    /// nothing is created. The key is released when its group is archived.
    async fn enqueue_unique(
        &self,
        queue_type: &QueueType,
        key: &str,
        definition: serde_json::Value,
    ) -> Result<JobRecord>;

    /// Claims one Created (or heartbeat-expired Running) job and marks it Running.
    async fn dequeue(
        &self,
        queue_type: &QueueType,
        worker_id: &str,
        heartbeat_timeout: Duration,
        job_id: Option<JobId>,
    ) -> Result<Option<JobRecord>>;

    /// Running ジョブの heartbeat。`job.version` が古ければ `StaleVersion`
    async fn keep_alive(&self, job: &JobRecord) -> Result<KeepAlive>;

    /// Running -> Completed | Failed (Cancelled when a cancel was requested),
    /// gated by `job.version`.
    async fn complete_job(&self, job: &JobRecord, failed: bool) -> Result<JobRecord>;

    /// Removes groups whose jobs are all terminal and ended before `now - retention`.
    async fn archive_expired_groups(
        &self,
        queue_type: &QueueType,
        retention: Duration,
    ) -> Result<usize>;

    /// group 内のジョブを状態によらず全件返す
    async fn get_jobs_by_group(
        &self,
        queue_type: &QueueType,
        group_id: GroupId,
    ) -> Result<Vec<JobRecord>>;

    /// Created は即 Cancelled、Running にはキャンセルフラグを立てる（worker が heartbeat で気付く）
    async fn cancel_group(&self, queue_type: &QueueType, group_id: GroupId) -> Result<usize>;

    async fn counts_by_status(&self, queue_type: &QueueType) -> Result<JobCounts>;
}
