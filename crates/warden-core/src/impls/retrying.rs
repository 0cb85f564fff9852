//! RetryingStore - store-access 層のリトライ
//!
//! `TransientStore` だけを指数バックオフでリトライする。それ以外のエラー
//! （Conflict / StaleVersion / NotFound ...）はそのまま呼び出し側へ返す。
//! 待機中・呼び出し中どちらでも CancellationToken を見て、shutdown を妨げない。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::{
    AcquireOutcome, AcquireRequest, ConfigParameter, ConfigValue, EventStatus, GroupId,
    JobCounts, JobId, JobRecord, Lease, QueueType, ResourceRecord, ResourceWrite, Result,
    TransactionId, TransactionRecord, WardenError,
};
use crate::ports::{
    ConfigStore, CoordinationStore, JobQueueClient, KeepAlive, LeaseStore, StoreClient,
};

/// 一時的な store エラーに対するバックオフ設定
///
/// delay = base_delay * multiplier^(attempt - 1)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Total attempts including the first call.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// No retries at all (tests that want to see the raw failure).
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Runs `call` until it succeeds, fails permanently, runs out of attempts,
/// or `token` is cancelled.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(WardenError::Cancelled),
            result = call() => result,
        };
        match result {
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.next_delay(attempt);
                warn!(operation, attempt, ?delay, error = %err, "transient store failure, retrying");
                tokio::select! {
                    _ = token.cancelled() => return Err(WardenError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// 全 store 呼び出しに [`with_retry`] をかける decorator
pub struct RetryingStore {
    inner: Arc<dyn CoordinationStore>,
    policy: RetryPolicy,
    token: CancellationToken,
}

impl RetryingStore {
    pub fn new(
        inner: Arc<dyn CoordinationStore>,
        policy: RetryPolicy,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner,
            policy,
            token,
        }
    }

    async fn retry<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_retry(&self.policy, &self.token, operation, call).await
    }
}

#[async_trait]
impl LeaseStore for RetryingStore {
    async fn try_acquire_lease(&self, request: &AcquireRequest) -> Result<AcquireOutcome> {
        self.retry("try_acquire_lease", || self.inner.try_acquire_lease(request))
            .await
    }

    async fn get_lease(&self, resource_name: &str) -> Result<Option<Lease>> {
        self.retry("get_lease", || self.inner.get_lease(resource_name))
            .await
    }
}

#[async_trait]
impl ConfigStore for RetryingStore {
    async fn insert_parameter_if_absent(&self, parameter: &ConfigParameter) -> Result<bool> {
        self.retry("insert_parameter_if_absent", || {
            self.inner.insert_parameter_if_absent(parameter)
        })
        .await
    }

    async fn get_parameter(&self, id: &str) -> Result<Option<ConfigValue>> {
        self.retry("get_parameter", || self.inner.get_parameter(id))
            .await
    }

    async fn set_parameter(&self, parameter: &ConfigParameter) -> Result<()> {
        self.retry("set_parameter", || self.inner.set_parameter(parameter))
            .await
    }
}

#[async_trait]
impl JobQueueClient for RetryingStore {
    async fn enqueue(
        &self,
        queue_type: &QueueType,
        definitions: Vec<serde_json::Value>,
        group_id: Option<GroupId>,
        force_one_active_job_group: bool,
    ) -> Result<Vec<JobRecord>> {
        // Enqueue de-duplicates active definitions, so a retry after a lost
        // response does not create a second copy.
        self.retry("enqueue", || {
            self.inner.enqueue(
                queue_type,
                definitions.clone(),
                group_id,
                force_one_active_job_group,
            )
        })
        .await
    }

    async fn enqueue_unique(
        &self,
        queue_type: &QueueType,
        key: &str,
        definition: serde_json::Value,
    ) -> Result<JobRecord> {
        self.retry("enqueue_unique", || {
            self.inner.enqueue_unique(queue_type, key, definition.clone())
        })
        .await
    }

    async fn dequeue(
        &self,
        queue_type: &QueueType,
        worker_id: &str,
        heartbeat_timeout: Duration,
        job_id: Option<JobId>,
    ) -> Result<Option<JobRecord>> {
        self.retry("dequeue", || {
            self.inner
                .dequeue(queue_type, worker_id, heartbeat_timeout, job_id)
        })
        .await
    }

    async fn keep_alive(&self, job: &JobRecord) -> Result<KeepAlive> {
        self.retry("keep_alive", || self.inner.keep_alive(job)).await
    }

    async fn complete_job(&self, job: &JobRecord, failed: bool) -> Result<JobRecord> {
        self.retry("complete_job", || self.inner.complete_job(job, failed))
            .await
    }

    async fn archive_expired_groups(
        &self,
        queue_type: &QueueType,
        retention: Duration,
    ) -> Result<usize> {
        self.retry("archive_expired_groups", || {
            self.inner.archive_expired_groups(queue_type, retention)
        })
        .await
    }

    async fn get_jobs_by_group(
        &self,
        queue_type: &QueueType,
        group_id: GroupId,
    ) -> Result<Vec<JobRecord>> {
        self.retry("get_jobs_by_group", || {
            self.inner.get_jobs_by_group(queue_type, group_id)
        })
        .await
    }

    async fn cancel_group(&self, queue_type: &QueueType, group_id: GroupId) -> Result<usize> {
        self.retry("cancel_group", || self.inner.cancel_group(queue_type, group_id))
            .await
    }

    async fn counts_by_status(&self, queue_type: &QueueType) -> Result<JobCounts> {
        self.retry("counts_by_status", || self.inner.counts_by_status(queue_type))
            .await
    }
}

#[async_trait]
impl StoreClient for RetryingStore {
    async fn begin_transaction(&self) -> Result<TransactionId> {
        self.retry("begin_transaction", || self.inner.begin_transaction())
            .await
    }

    async fn heartbeat_transaction(&self, transaction_id: TransactionId) -> Result<()> {
        self.retry("heartbeat_transaction", || {
            self.inner.heartbeat_transaction(transaction_id)
        })
        .await
    }

    async fn write_resources(
        &self,
        transaction_id: TransactionId,
        writes: &[ResourceWrite],
    ) -> Result<usize> {
        self.retry("write_resources", || {
            self.inner.write_resources(transaction_id, writes)
        })
        .await
    }

    async fn mark_resources_committed(&self, transaction_id: TransactionId) -> Result<usize> {
        self.retry("mark_resources_committed", || {
            self.inner.mark_resources_committed(transaction_id)
        })
        .await
    }

    async fn commit_transaction(
        &self,
        transaction_id: TransactionId,
        note: Option<&str>,
    ) -> Result<()> {
        self.retry("commit_transaction", || {
            self.inner.commit_transaction(transaction_id, note)
        })
        .await
    }

    async fn advance_visibility(&self) -> Result<TransactionId> {
        self.retry("advance_visibility", || self.inner.advance_visibility())
            .await
    }

    async fn current_visibility(&self) -> Result<TransactionId> {
        self.retry("current_visibility", || self.inner.current_visibility())
            .await
    }

    async fn get_timed_out_transactions(
        &self,
        threshold: Duration,
    ) -> Result<Vec<TransactionRecord>> {
        self.retry("get_timed_out_transactions", || {
            self.inner.get_timed_out_transactions(threshold)
        })
        .await
    }

    async fn get_resources_by_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<ResourceRecord>> {
        self.retry("get_resources_by_transaction", || {
            self.inner.get_resources_by_transaction(transaction_id)
        })
        .await
    }

    async fn get_committed_transactions(
        &self,
        after: TransactionId,
        up_to: TransactionId,
    ) -> Result<Vec<TransactionRecord>> {
        self.retry("get_committed_transactions", || {
            self.inner.get_committed_transactions(after, up_to)
        })
        .await
    }

    async fn remove_invisible_history(&self, transaction_id: TransactionId) -> Result<usize> {
        self.retry("remove_invisible_history", || {
            self.inner.remove_invisible_history(transaction_id)
        })
        .await
    }

    async fn try_log_event(
        &self,
        process: &str,
        status: EventStatus,
        text: Option<&str>,
        start_time: Option<DateTime<Utc>>,
    ) {
        self.inner
            .try_log_event(process, status, text, start_time)
            .await
    }
}
