//! Coordinator / worker fan-out.
//!
//! One coordinator job per group (enqueued with `force_one_active_job_group`)
//! plans N units, enqueues them into the unit queue under its own group, and
//! drains them with a [`WorkerPool`]. The coordinator job is heartbeated the
//! whole time, so if this instance dies another one re-dequeues the same
//! coordinator after the heartbeat timeout and finishes the group.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::worker_pool::{run_with_heartbeat, Heartbeated, PoolReport, WorkerPool};
use crate::domain::{GroupId, JobRecord, QueueType, Result, WardenError};
use crate::ports::CoordinationStore;

/// Computes the units of work for one coordinator run.
#[async_trait]
pub trait UnitPlanner: Send + Sync {
    async fn plan(&self, coordinator: &JobRecord) -> Result<Vec<serde_json::Value>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanOutOutcome {
    /// Another instance owns the active coordinator.
    AlreadyRunning,
    Completed {
        group_id: GroupId,
        units: usize,
        report: PoolReport,
    },
    /// The coordinator job was reclaimed while this instance ran it.
    Lost,
}

/// coordinator ジョブ 1 つを claim し、unit の計画から完了までを担う
pub struct FanOutCoordinator {
    store: Arc<dyn CoordinationStore>,
    coordinator_queue: QueueType,
    pool: WorkerPool,
    worker_id: String,
}

impl FanOutCoordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        coordinator_queue: QueueType,
        pool: WorkerPool,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            coordinator_queue,
            pool,
            worker_id: worker_id.into(),
        }
    }

    pub fn coordinator_queue(&self) -> &QueueType {
        &self.coordinator_queue
    }

    pub fn unit_queue(&self) -> &QueueType {
        self.pool.queue_type()
    }

    /// coordinator を enqueue（既に active なら衝突を無視）して claim し、fan-out を最後まで回す。
    ///
    /// 別 instance の coordinator が生きていれば `AlreadyRunning`、
    /// 途中で再 claim されたら `Lost`。
    pub async fn run(
        &self,
        definition: serde_json::Value,
        planner: &dyn UnitPlanner,
        token: &CancellationToken,
    ) -> Result<FanOutOutcome> {
        match self
            .store
            .enqueue(&self.coordinator_queue, vec![definition], None, true)
            .await
        {
            Ok(_) => {}
            Err(WardenError::JobGroupConflict { .. }) => {
                // Possibly abandoned: dequeue below reclaims it once its heartbeat expired.
                debug!(queue = %self.coordinator_queue, "coordinator group already active");
            }
            Err(err) => return Err(err),
        }

        let heartbeat_timeout = self.pool.heartbeat_timeout();
        let Some(coordinator) = self
            .store
            .dequeue(&self.coordinator_queue, &self.worker_id, heartbeat_timeout, None)
            .await?
        else {
            return Ok(FanOutOutcome::AlreadyRunning);
        };
        info!(
            queue = %self.coordinator_queue,
            job_id = %coordinator.job_id,
            group_id = %coordinator.group_id,
            attempt = coordinator.dequeue_count,
            "coordinator claimed"
        );

        let job_token = token.child_token();
        let work = self.fan_out(&coordinator, planner, &job_token);
        let outcome = run_with_heartbeat(
            self.store.as_ref(),
            coordinator.clone(),
            heartbeat_timeout / 3,
            &job_token,
            work,
        )
        .await?;

        let (result, current) = match outcome {
            Heartbeated::Lost => return Ok(FanOutOutcome::Lost),
            Heartbeated::Finished { result, job } => (result, job),
        };
        if token.is_cancelled() {
            return Err(WardenError::Cancelled);
        }

        let failed = match &result {
            Ok((_, report)) => report.failed > 0,
            Err(_) => true,
        };
        match self.store.complete_job(&current, failed).await {
            Ok(done) => {
                info!(job_id = %done.job_id, status = ?done.status, "coordinator finished");
            }
            Err(WardenError::StaleVersion { .. }) => {
                warn!(job_id = %current.job_id, "coordinator completion rejected, job was reclaimed");
                return Ok(FanOutOutcome::Lost);
            }
            Err(err) => return Err(err),
        }

        let (units, report) = result?;
        Ok(FanOutOutcome::Completed {
            group_id: coordinator.group_id,
            units,
            report,
        })
    }

    /// 自 group の unit がすべて終端状態になるまで pool を回す。
    ///
    /// 再 dequeue された coordinator は前回の unit をそのまま引き継ぐ（再計画しない）。
    /// 死んだ worker が握っている unit は heartbeat 切れで claim 可能になるので、
    /// それまで `heartbeat_timeout / 3` 間隔で待ち直す。
    async fn fan_out(
        &self,
        coordinator: &JobRecord,
        planner: &dyn UnitPlanner,
        token: &CancellationToken,
    ) -> Result<(usize, PoolReport)> {
        let unit_queue = self.pool.queue_type();
        let existing = self
            .store
            .get_jobs_by_group(unit_queue, coordinator.group_id)
            .await?
            .len();
        let count = if existing > 0 {
            debug!(group_id = %coordinator.group_id, units = existing, "resuming planned units");
            existing
        } else {
            let units = planner.plan(coordinator).await?;
            let count = units.len();
            if count > 0 {
                self.store
                    .enqueue(unit_queue, units, Some(coordinator.group_id), false)
                    .await?;
            }
            debug!(group_id = %coordinator.group_id, units = count, "units enqueued");
            count
        };

        let poll = self.pool.heartbeat_timeout() / 3;
        let mut report = PoolReport::default();
        loop {
            report.merge(self.pool.run_until_empty(&self.worker_id, token).await?);

            let open = self
                .store
                .get_jobs_by_group(unit_queue, coordinator.group_id)
                .await?
                .iter()
                .filter(|j| !j.status.is_terminal())
                .count();
            if open == 0 {
                return Ok((count, report));
            }
            // Held by workers of a previous attempt; their heartbeats decide.
            debug!(group_id = %coordinator.group_id, open, "waiting for units running elsewhere");
            tokio::select! {
                _ = token.cancelled() => return Err(WardenError::Cancelled),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::app::worker_pool::JobHandler;
    use crate::domain::JobStatus;
    use crate::impls::InMemoryCoordinationStore;
    use crate::ports::{FixedClock, JobQueueClient, SystemClock};

    struct Units(usize);

    #[async_trait]
    impl UnitPlanner for Units {
        async fn plan(&self, coordinator: &JobRecord) -> Result<Vec<serde_json::Value>> {
            Ok((0..self.0)
                .map(|i| json!({ "unit": i, "coordinator": coordinator.job_id.to_string() }))
                .collect())
        }
    }

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn handle(&self, _job: &JobRecord, _token: &CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    fn coordinator(store: Arc<InMemoryCoordinationStore>, worker: &str) -> FanOutCoordinator {
        let pool = WorkerPool::new(
            store.clone(),
            QueueType::new("defrag.unit"),
            Arc::new(Noop),
            4,
            Duration::from_secs(60),
        );
        FanOutCoordinator::new(store, QueueType::new("defrag"), pool, worker)
    }

    #[tokio::test]
    async fn coordinator_fans_out_and_completes() {
        let store = Arc::new(InMemoryCoordinationStore::new(Arc::new(SystemClock)));
        let fan_out = coordinator(store.clone(), "node-a");

        let outcome = fan_out
            .run(json!({"kind": "defrag"}), &Units(12), &CancellationToken::new())
            .await
            .unwrap();
        let FanOutOutcome::Completed { group_id, units, report } = outcome else {
            panic!("coordinator did not complete");
        };
        assert_eq!(units, 12);
        assert_eq!(report.completed, 12);

        let unit_jobs = store
            .get_jobs_by_group(&QueueType::new("defrag.unit"), group_id)
            .await
            .unwrap();
        assert_eq!(unit_jobs.len(), 12);
        assert!(unit_jobs.iter().all(|j| j.status == JobStatus::Completed));
        let coordinators = store
            .get_jobs_by_group(&QueueType::new("defrag"), group_id)
            .await
            .unwrap();
        assert_eq!(coordinators[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn live_coordinator_elsewhere_means_already_running() {
        let store = Arc::new(InMemoryCoordinationStore::new(Arc::new(SystemClock)));
        let queue = QueueType::new("defrag");
        store
            .enqueue(&queue, vec![json!({"kind": "defrag"})], None, true)
            .await
            .unwrap();
        store
            .dequeue(&queue, "node-b", Duration::from_secs(60), None)
            .await
            .unwrap()
            .unwrap();

        let outcome = coordinator(store, "node-a")
            .run(json!({"kind": "defrag"}), &Units(3), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, FanOutOutcome::AlreadyRunning);
    }

    #[tokio::test]
    async fn crashed_coordinator_is_reclaimed_after_heartbeat_timeout() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let store = Arc::new(InMemoryCoordinationStore::new(Arc::new(clock.clone())));
        let queue = QueueType::new("defrag");
        store
            .enqueue(&queue, vec![json!({"kind": "defrag"})], None, true)
            .await
            .unwrap();
        let zombie = store
            .dequeue(&queue, "node-b", Duration::from_secs(60), None)
            .await
            .unwrap()
            .unwrap();

        clock.advance(chrono::Duration::seconds(61));
        let outcome = coordinator(store.clone(), "node-a")
            .run(json!({"kind": "defrag"}), &Units(2), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, FanOutOutcome::Completed { units: 2, .. }));

        let row = store.job(zombie.job_id).await.unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert_eq!(row.dequeue_count, 2);
    }

    /// Moves the fixed clock forward together with tokio's paused clock.
    fn follow_tokio_time(clock: FixedClock) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                clock.advance(chrono::Duration::seconds(1));
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn reclaimed_coordinator_waits_for_units_held_by_dead_worker() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let store = Arc::new(InMemoryCoordinationStore::new(Arc::new(clock.clone())));
        let queue = QueueType::new("defrag");
        let unit_queue = QueueType::new("defrag.unit");

        // node-b: coordinator at t=0, units planned, one unit claimed at t=30, then gone.
        store
            .enqueue(&queue, vec![json!({"kind": "defrag"})], None, true)
            .await
            .unwrap();
        let zombie = store
            .dequeue(&queue, "node-b", Duration::from_secs(60), None)
            .await
            .unwrap()
            .unwrap();
        let units: Vec<_> = (0..3).map(|i| json!({ "unit": i })).collect();
        store
            .enqueue(&unit_queue, units, Some(zombie.group_id), false)
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(30));
        let held = store
            .dequeue(&unit_queue, "node-b/defrag.unit/0", Duration::from_secs(60), None)
            .await
            .unwrap()
            .unwrap();

        clock.advance(chrono::Duration::seconds(31));
        let ticker = follow_tokio_time(clock.clone());
        let outcome = coordinator(store.clone(), "node-a")
            .run(json!({"kind": "defrag"}), &Units(5), &CancellationToken::new())
            .await
            .unwrap();
        ticker.abort();

        let FanOutOutcome::Completed { units, report, .. } = outcome else {
            panic!("coordinator did not complete");
        };
        assert_eq!(units, 3);
        assert_eq!(report.completed, 3);
        let unit_jobs = store.get_jobs_by_group(&unit_queue, zombie.group_id).await.unwrap();
        assert!(unit_jobs.iter().all(|j| j.status == JobStatus::Completed));
        let reclaimed = store.job(held.job_id).await.unwrap();
        assert_eq!(reclaimed.dequeue_count, 2);
        // The held unit only became claimable after its own heartbeat expired (t=90).
        assert!(reclaimed.ended_at.unwrap() >= Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 30).unwrap());
        assert_eq!(store.job(zombie.job_id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_for_foreign_units_stops_on_cancel() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let store = Arc::new(InMemoryCoordinationStore::new(Arc::new(clock.clone())));
        let queue = QueueType::new("defrag");
        let unit_queue = QueueType::new("defrag.unit");
        store
            .enqueue(&queue, vec![json!({"kind": "defrag"})], None, true)
            .await
            .unwrap();
        let zombie = store
            .dequeue(&queue, "node-b", Duration::from_secs(60), None)
            .await
            .unwrap()
            .unwrap();
        store
            .enqueue(&unit_queue, vec![json!({ "unit": 0 })], Some(zombie.group_id), false)
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(30));
        store
            .dequeue(&unit_queue, "node-b/defrag.unit/0", Duration::from_secs(60), None)
            .await
            .unwrap()
            .unwrap();
        clock.advance(chrono::Duration::seconds(31));

        // The fixed clock stands still, so the held unit never expires.
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(45)).await;
                token.cancel();
            })
        };
        let result = coordinator(store.clone(), "node-a")
            .run(json!({"kind": "defrag"}), &Units(1), &token)
            .await;
        canceller.await.unwrap();
        assert!(matches!(result, Err(WardenError::Cancelled)));
        assert_eq!(
            store.job(zombie.job_id).await.unwrap().status,
            JobStatus::Running
        );
    }
}
