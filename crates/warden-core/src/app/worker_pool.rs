//! WorkerPool - 固定サイズの worker ループで 1 つの queue を空になるまで処理する
//!
//! # フロー（worker ごと）
//! 1. `dequeue` で 1 件 claim（None なら終了）
//! 2. handler を実行しながら `keep_alive` で heartbeat
//! 3. `complete_job` で Completed / Failed（cancel 要求があれば Cancelled）
//!
//! heartbeat が StaleVersion を返したら別 worker に回収済み。handler を止めて complete はしない。
//! shutdown（親 token の cancel）時も complete しない。heartbeat 切れで他 instance が拾い直す。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{JobRecord, JobStatus, QueueType, Result, WardenError};
use crate::ports::CoordinationStore;

/// Executes one dequeued job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobRecord, token: &CancellationToken) -> Result<()>;
}

/// pool 1 回分の処理件数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Jobs reclaimed by another worker while this one held them.
    pub lost: usize,
}

impl PoolReport {
    pub(crate) fn merge(&mut self, other: PoolReport) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
        self.lost += other.lost;
    }

    pub fn processed(&self) -> usize {
        self.completed + self.failed + self.cancelled + self.lost
    }
}

/// How a heartbeated piece of work ended.
#[derive(Debug)]
pub enum Heartbeated<T> {
    /// The work returned; `job` is the latest version to complete with.
    Finished { result: Result<T>, job: JobRecord },
    /// The job was reclaimed elsewhere; the work was dropped.
    Lost,
}

/// Drives `work` while heartbeating `job` every `interval`.
///
/// A cancel request reported by the heartbeat cancels `job_token`, which the
/// work is expected to observe.
pub async fn run_with_heartbeat<T, F>(
    store: &dyn CoordinationStore,
    job: JobRecord,
    interval: Duration,
    job_token: &CancellationToken,
    work: F,
) -> Result<Heartbeated<T>>
where
    F: Future<Output = Result<T>>,
{
    tokio::pin!(work);
    let mut current = job;
    let mut beat = tokio::time::interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            result = &mut work => {
                return Ok(Heartbeated::Finished { result, job: current });
            }
            _ = beat.tick() => match store.keep_alive(&current).await {
                Ok(alive) => {
                    current = alive.job;
                    if alive.cancel_requested && !job_token.is_cancelled() {
                        info!(job_id = %current.job_id, "cancel requested for running job");
                        job_token.cancel();
                    }
                }
                Err(WardenError::StaleVersion { .. } | WardenError::NotFound(_)) => {
                    warn!(job_id = %current.job_id, "job was reclaimed by another worker");
                    job_token.cancel();
                    return Ok(Heartbeated::Lost);
                }
                Err(WardenError::Cancelled) => return Err(WardenError::Cancelled),
                Err(err) => {
                    warn!(job_id = %current.job_id, error = %err, "heartbeat failed");
                }
            },
        }
    }
}

/// 1 つのキューを処理する固定数の worker ループ
pub struct WorkerPool {
    ctx: WorkerContext,
    size: usize,
}

#[derive(Clone)]
struct WorkerContext {
    store: Arc<dyn CoordinationStore>,
    queue_type: QueueType,
    handler: Arc<dyn JobHandler>,
    heartbeat_timeout: Duration,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        queue_type: QueueType,
        handler: Arc<dyn JobHandler>,
        size: usize,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            ctx: WorkerContext {
                store,
                queue_type,
                handler,
                heartbeat_timeout,
            },
            size: size.max(1),
        }
    }

    pub fn queue_type(&self) -> &QueueType {
        &self.ctx.queue_type
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.ctx.heartbeat_timeout
    }

    /// Spawns the workers and waits until every one of them finds the queue empty.
    pub async fn run_until_empty(
        &self,
        worker_prefix: &str,
        token: &CancellationToken,
    ) -> Result<PoolReport> {
        let mut joins = Vec::with_capacity(self.size);
        for n in 0..self.size {
            let ctx = self.ctx.clone();
            let worker_id = format!("{worker_prefix}/{}/{n}", self.ctx.queue_type);
            let token = token.clone();
            joins.push(tokio::spawn(async move {
                ctx.worker_loop(worker_id, token).await
            }));
        }

        let mut report = PoolReport::default();
        let mut first_error = None;
        for join in joins {
            match join.await {
                Ok(Ok(partial)) => report.merge(partial),
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(join) => {
                    first_error.get_or_insert(WardenError::body(format!("worker task: {join}")));
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

impl WorkerContext {
    async fn worker_loop(&self, worker_id: String, token: CancellationToken) -> Result<PoolReport> {
        let mut report = PoolReport::default();
        loop {
            if token.is_cancelled() {
                return Err(WardenError::Cancelled);
            }
            let job = self
                .store
                .dequeue(&self.queue_type, &worker_id, self.heartbeat_timeout, None)
                .await?;
            let Some(job) = job else {
                debug!(worker_id = %worker_id, queue = %self.queue_type, "queue drained");
                return Ok(report);
            };
            self.process(job, &worker_id, &token, &mut report).await?;
        }
    }

    async fn process(
        &self,
        job: JobRecord,
        worker_id: &str,
        token: &CancellationToken,
        report: &mut PoolReport,
    ) -> Result<()> {
        debug!(worker_id, job_id = %job.job_id, attempt = job.dequeue_count, "job claimed");
        let job_token = token.child_token();
        let work = self.handler.handle(&job, &job_token);
        let interval = self.heartbeat_timeout / 3;
        let outcome =
            run_with_heartbeat(self.store.as_ref(), job.clone(), interval, &job_token, work)
                .await?;

        let (result, current) = match outcome {
            Heartbeated::Lost => {
                report.lost += 1;
                return Ok(());
            }
            Heartbeated::Finished { result, job } => (result, job),
        };
        if token.is_cancelled() {
            // Left Running: the heartbeat timeout hands it to another worker.
            return Err(WardenError::Cancelled);
        }
        if let Err(err) = &result {
            warn!(worker_id, job_id = %current.job_id, error = %err, "job handler failed");
        }

        match self.store.complete_job(&current, result.is_err()).await {
            Ok(done) => match done.status {
                JobStatus::Completed => report.completed += 1,
                JobStatus::Cancelled => report.cancelled += 1,
                _ => report.failed += 1,
            },
            Err(WardenError::StaleVersion { .. }) => {
                warn!(worker_id, job_id = %current.job_id, "completion rejected, job was reclaimed");
                report.lost += 1;
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }
}
