//! Watchdog - lease で守られた名前付きの定期ジョブ
//!
//! `WatchdogRunner` = `PeriodicRunner` + `LeaseManager`。
//! tick ごとに store の設定行を読み直し、lease holder のときだけ body を実行する。
//! 「1 tick window につき cluster 全体で 1 instance だけが body を実行する」は
//! 時計のずれに依存する soft な保証。
//!
//! # 設定行（insert-if-absent で起動時に作る）
//! - `<Name>.PeriodSec`
//! - `<Name>.LeasePeriodSec`
//! - `<Name>.IsEnabled`（0 で停止）

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::WatchdogSettings;
use super::lease_manager::LeaseManager;
use super::periodic::{PeriodicBody, PeriodicRunner};
use crate::domain::{
    config_seconds, parameter_id, ConfigParameter, EventStatus, Result, WardenError,
};
use crate::ports::{Clock, CoordinationStore};

pub const PERIOD_SEC: &str = "PeriodSec";
pub const LEASE_PERIOD_SEC: &str = "LeasePeriodSec";
pub const IS_ENABLED: &str = "IsEnabled";

/// A named recurring job. The name namespaces the lease and the config rows.
#[async_trait]
pub trait Watchdog: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn default_period(&self) -> Duration;

    fn default_lease_period(&self) -> Duration;

    /// One-time hook for additional config rows.
    async fn bootstrap(&self) -> Result<()> {
        Ok(())
    }

    /// The body. Runs only while this instance holds the lease.
    async fn execute(&self, token: &CancellationToken) -> Result<()>;
}

/// 1 tick の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Executed,
    NotHolder,
    Disabled,
}

/// Read-only diagnostics for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchdogStatus {
    pub name: String,
    pub worker_id: String,
    pub is_lease_holder: bool,
    pub lease_end_time: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub is_failing: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct RunStats {
    last_run_time: Option<DateTime<Utc>>,
    run_count: u64,
}

/// watchdog 1 つ分の実行器。lease ループと周期ループを束ねる
pub struct WatchdogRunner {
    inner: Arc<WatchdogInner>,
}

struct WatchdogInner {
    watchdog: Arc<dyn Watchdog>,
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    settings: WatchdogSettings,
    lease: LeaseManager,
    runner: PeriodicRunner,
    period_tx: watch::Sender<Duration>,
    lease_period_tx: watch::Sender<Duration>,
    stats: Mutex<RunStats>,
}

impl WatchdogRunner {
    pub fn new(
        watchdog: Arc<dyn Watchdog>,
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        worker_id: impl Into<String>,
        settings: WatchdogSettings,
        lease_timeout_factor: f64,
    ) -> Self {
        let name = watchdog.name().to_string();
        let (period_tx, period_rx) = watch::channel(settings.period);
        let (lease_period_tx, lease_period_rx) = watch::channel(settings.lease_period);
        let lease = LeaseManager::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            name.clone(),
            worker_id,
            lease_period_rx,
            lease_timeout_factor,
        )
        .with_rebalance(settings.allow_rebalance);
        let runner = PeriodicRunner::new(name, period_rx, Arc::clone(&clock));

        Self {
            inner: Arc::new(WatchdogInner {
                watchdog,
                store,
                clock,
                settings,
                lease,
                runner,
                period_tx,
                lease_period_tx,
                stats: Mutex::new(RunStats::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.watchdog.name()
    }

    pub fn lease(&self) -> &LeaseManager {
        &self.inner.lease
    }

    /// Inserts the config rows if absent and runs the watchdog's own hook.
    pub async fn bootstrap(&self) -> Result<()> {
        self.inner.bootstrap().await
    }

    /// One tick: refresh settings, check the lease, run the body if holder.
    pub async fn tick_once(&self, token: &CancellationToken) -> Result<TickOutcome> {
        self.inner.tick_once(token).await
    }

    /// Bootstraps, then spawns the lease loop and the periodic runner.
    pub async fn start(&self, token: CancellationToken) -> Result<WatchdogHandle> {
        self.bootstrap().await?;
        info!(
            watchdog = %self.name(),
            worker_id = %self.inner.lease.worker_id(),
            period = ?self.inner.settings.period,
            lease_period = ?self.inner.settings.lease_period,
            "starting watchdog"
        );

        let lease = tokio::spawn({
            let inner = Arc::clone(&self.inner);
            let token = token.clone();
            async move { inner.lease.run(token).await }
        });
        let ticks = tokio::spawn({
            let inner = Arc::clone(&self.inner);
            async move {
                let body: Arc<dyn PeriodicBody> = inner.clone();
                inner.runner.run(body, token).await
            }
        });
        Ok(WatchdogHandle {
            name: self.name().to_string(),
            joins: vec![lease, ticks],
        })
    }

    pub fn status(&self) -> WatchdogStatus {
        let runner = self.inner.runner.state();
        let stats = self.inner.lock_stats();
        WatchdogStatus {
            name: self.name().to_string(),
            worker_id: self.inner.lease.worker_id().to_string(),
            is_lease_holder: self.inner.lease.is_holder(),
            lease_end_time: self.inner.lease.cached_lease_end(),
            last_run_time: stats.last_run_time,
            run_count: stats.run_count,
            is_failing: runner.is_failing,
            last_error: runner.last_error,
        }
    }
}

/// 起動済み watchdog の JoinHandle 群
pub struct WatchdogHandle {
    name: String,
    joins: Vec<JoinHandle<()>>,
}

impl WatchdogHandle {
    /// Waits for the loops to exit (after the start token is cancelled).
    pub async fn join(self) {
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(watchdog = %self.name, error = %e, "watchdog task ended abnormally");
            }
        }
    }
}

impl WatchdogInner {
    fn name(&self) -> &str {
        self.watchdog.name()
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, RunStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn bootstrap(&self) -> Result<()> {
        let name = self.name();
        let rows = [
            ConfigParameter::number(
                parameter_id(name, PERIOD_SEC),
                self.settings.period.as_secs_f64(),
            ),
            ConfigParameter::number(
                parameter_id(name, LEASE_PERIOD_SEC),
                self.settings.lease_period.as_secs_f64(),
            ),
            ConfigParameter::number(
                parameter_id(name, IS_ENABLED),
                if self.settings.enabled { 1.0 } else { 0.0 },
            ),
        ];
        for row in &rows {
            if self.store.insert_parameter_if_absent(row).await? {
                debug!(watchdog = %name, parameter = %row.id, "config row created");
            }
        }
        self.watchdog.bootstrap().await
    }

    /// 範囲外の値は警告して無視し、現在の設定を維持する
    async fn read_seconds(&self, suffix: &str) -> Result<Option<Duration>> {
        let id = parameter_id(self.name(), suffix);
        let value = self.store.get_parameter(&id).await?;
        Ok(match value.and_then(|v| v.as_number()) {
            Some(secs) => {
                let period = config_seconds(secs);
                if period.is_none() {
                    warn!(watchdog = %self.name(), parameter = %id, secs, "ignoring out-of-range period");
                }
                period
            }
            None => None,
        })
    }

    /// Re-reads the config rows; returns whether the watchdog is enabled.
    async fn refresh_settings(&self) -> Result<bool> {
        if let Some(period) = self.read_seconds(PERIOD_SEC).await? {
            self.period_tx.send_if_modified(|current| {
                let changed = *current != period;
                *current = period;
                changed
            });
        }
        if let Some(lease_period) = self.read_seconds(LEASE_PERIOD_SEC).await? {
            self.lease_period_tx.send_if_modified(|current| {
                let changed = *current != lease_period;
                *current = lease_period;
                changed
            });
        }
        let enabled = self
            .store
            .get_parameter(&parameter_id(self.name(), IS_ENABLED))
            .await?
            .and_then(|v| v.as_number())
            .map(|v| v != 0.0)
            .unwrap_or(self.settings.enabled);
        Ok(enabled)
    }

    async fn tick_once(&self, token: &CancellationToken) -> Result<TickOutcome> {
        if !self.refresh_settings().await? {
            debug!(watchdog = %self.name(), "disabled, skipping tick");
            return Ok(TickOutcome::Disabled);
        }
        if !self.lease.is_holder() {
            debug!(watchdog = %self.name(), "not lease holder, skipping tick");
            return Ok(TickOutcome::NotHolder);
        }

        let name = self.name();
        let started = self.clock.now();
        self.store
            .try_log_event(name, EventStatus::Start, None, Some(started))
            .await;
        let result = self.watchdog.execute(token).await;
        {
            let mut stats = self.lock_stats();
            stats.run_count += 1;
            stats.last_run_time = Some(started);
        }

        match &result {
            Ok(()) => {
                self.store
                    .try_log_event(name, EventStatus::End, None, Some(started))
                    .await;
            }
            Err(WardenError::Cancelled) => {
                self.store
                    .try_log_event(name, EventStatus::Warn, Some("cancelled"), Some(started))
                    .await;
            }
            Err(err) => {
                error!(watchdog = %name, error = %err, "watchdog body failed");
                let text = err.to_string();
                self.store
                    .try_log_event(name, EventStatus::Error, Some(&text), Some(started))
                    .await;
            }
        }
        result.map(|()| TickOutcome::Executed)
    }
}

#[async_trait]
impl PeriodicBody for WatchdogInner {
    async fn run(&self, token: CancellationToken) -> Result<()> {
        self.tick_once(&token).await.map(|_| ())
    }
}
