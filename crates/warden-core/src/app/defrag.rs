//! DefragWatchdog - sample coordinator watchdog.
//!
//! Each run archives old groups, then drives one coordinator/worker fan-out:
//! the plan is `Defrag.UnitCount` units, executed by the injected
//! [`JobHandler`] on a pool of `worker_pool_size` workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::fanout::{FanOutCoordinator, FanOutOutcome, UnitPlanner};
use super::watchdog::Watchdog;
use super::worker_pool::{JobHandler, WorkerPool};
use crate::domain::{parameter_id, ConfigParameter, JobRecord, QueueType, Result};
use crate::ports::CoordinationStore;

pub const UNIT_COUNT: &str = "UnitCount";
pub const RETENTION_SEC: &str = "RetentionSec";

const DEFAULT_UNIT_COUNT: i64 = 8;
const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Placeholder unit body: the actual defragmentation lives outside this crate.
pub struct LoggingUnitHandler;

#[async_trait]
impl JobHandler for LoggingUnitHandler {
    async fn handle(&self, job: &JobRecord, _token: &CancellationToken) -> Result<()> {
        debug!(job_id = %job.job_id, unit = %job.definition["unit"], "defrag unit processed");
        Ok(())
    }
}

/// Defrag: 古い group の archive と、coordinator / unit の fan-out 1 回分
pub struct DefragWatchdog {
    store: Arc<dyn CoordinationStore>,
    coordinator: FanOutCoordinator,
}

impl DefragWatchdog {
    pub const NAME: &'static str = "Defrag";

    pub fn new(
        store: Arc<dyn CoordinationStore>,
        handler: Arc<dyn JobHandler>,
        worker_id: impl Into<String>,
        pool_size: usize,
        heartbeat_timeout: Duration,
    ) -> Self {
        let pool = WorkerPool::new(
            Arc::clone(&store),
            QueueType::new("defrag.unit"),
            handler,
            pool_size,
            heartbeat_timeout,
        );
        let coordinator =
            FanOutCoordinator::new(Arc::clone(&store), QueueType::new("defrag"), pool, worker_id);
        Self { store, coordinator }
    }

    pub fn coordinator_queue(&self) -> &QueueType {
        self.coordinator.coordinator_queue()
    }

    pub fn unit_queue(&self) -> &QueueType {
        self.coordinator.unit_queue()
    }

    async fn read_bigint(&self, suffix: &str) -> Result<Option<i64>> {
        Ok(self
            .store
            .get_parameter(&parameter_id(Self::NAME, suffix))
            .await?
            .and_then(|v| v.as_bigint()))
    }

    async fn archive(&self) -> Result<()> {
        let retention = self
            .read_bigint(RETENTION_SEC)
            .await?
            .filter(|v| *v > 0)
            .map(|v| Duration::from_secs(v as u64))
            .unwrap_or(DEFAULT_RETENTION);
        let mut archived = 0;
        for queue in [self.coordinator_queue(), self.unit_queue()] {
            archived += self.store.archive_expired_groups(queue, retention).await?;
        }
        if archived > 0 {
            info!(watchdog = Self::NAME, archived, "expired job groups archived");
        }
        Ok(())
    }
}

#[async_trait]
impl UnitPlanner for DefragWatchdog {
    async fn plan(&self, coordinator: &JobRecord) -> Result<Vec<serde_json::Value>> {
        let count = self
            .read_bigint(UNIT_COUNT)
            .await?
            .unwrap_or(DEFAULT_UNIT_COUNT)
            .max(0);
        Ok((0..count)
            .map(|unit| {
                json!({
                    "unit": unit,
                    "of": count,
                    "coordinator": coordinator.job_id.to_string(),
                })
            })
            .collect())
    }
}

#[async_trait]
impl Watchdog for DefragWatchdog {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn default_period(&self) -> Duration {
        Duration::from_secs(5)
    }

    fn default_lease_period(&self) -> Duration {
        Duration::from_secs(20)
    }

    async fn bootstrap(&self) -> Result<()> {
        let rows = [
            ConfigParameter::bigint(parameter_id(Self::NAME, UNIT_COUNT), DEFAULT_UNIT_COUNT),
            ConfigParameter::bigint(
                parameter_id(Self::NAME, RETENTION_SEC),
                DEFAULT_RETENTION.as_secs() as i64,
            ),
        ];
        for row in &rows {
            self.store.insert_parameter_if_absent(row).await?;
        }
        Ok(())
    }

    async fn execute(&self, token: &CancellationToken) -> Result<()> {
        self.archive().await?;
        let definition = json!({ "kind": "defrag" });
        match self.coordinator.run(definition, self, token).await? {
            FanOutOutcome::Completed { group_id, units, report } => {
                info!(
                    watchdog = Self::NAME,
                    %group_id,
                    units,
                    completed = report.completed,
                    failed = report.failed,
                    "defrag run finished"
                );
            }
            FanOutOutcome::AlreadyRunning => {
                debug!(watchdog = Self::NAME, "coordinator active elsewhere");
            }
            FanOutOutcome::Lost => {
                info!(watchdog = Self::NAME, "coordinator reclaimed by another instance");
            }
        }
        Ok(())
    }
}
