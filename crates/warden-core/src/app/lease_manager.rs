//! LeaseManager - 名前付き resource の排他 lease を取得・更新する
//!
//! 状態は NotHeld → (tick ごとに acquire) → Held(until)。Held は wall clock で自然に
//! 失効する（shutdown 時の明示的な release はしない）。
//!
//! `is_holder` は store に問い合わせず、最後に取得できた lease end のキャッシュだけで判定する。
//! 最後の更新から `timeout_factor × period` 経過した時点で自分から holder を降りるので、
//! store 側の失効（period 経過）より十分前に「自分は holder」という判断が止まる。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{AcquireOutcome, AcquireRequest, Result, WardenError};
use crate::ports::{Clock, CoordinationStore};

/// The last lease the store granted to this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CachedLease {
    end: DateTime<Utc>,
    period: chrono::Duration,
}

impl CachedLease {
    fn renewed_at(&self) -> DateTime<Utc> {
        self.end - self.period
    }
}

/// 1 つの lease について、store への acquire / renew とローカルの holder 判定を持つ
pub struct LeaseManager {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    resource_name: String,
    worker_id: String,
    allow_rebalance: bool,
    timeout_factor: f64,
    lease_period: watch::Receiver<Duration>,
    cached: Mutex<Option<CachedLease>>,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        resource_name: impl Into<String>,
        worker_id: impl Into<String>,
        lease_period: watch::Receiver<Duration>,
        timeout_factor: f64,
    ) -> Self {
        Self {
            store,
            clock,
            resource_name: resource_name.into(),
            worker_id: worker_id.into(),
            allow_rebalance: false,
            timeout_factor,
            lease_period,
            cached: Mutex::new(None),
        }
    }

    pub fn with_rebalance(mut self, allow_rebalance: bool) -> Self {
        self.allow_rebalance = allow_rebalance;
        self
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn lease_period(&self) -> Duration {
        *self.lease_period.borrow()
    }

    /// Renewal cadence: twice per holder window, so one lost renewal does
    /// not drop the holder view.
    pub fn renew_interval(&self) -> Duration {
        self.lease_period()
            .mul_f64(self.timeout_factor / 2.0)
            .max(Duration::from_millis(1))
    }

    /// 最後に取得できた lease の終了時刻（キャッシュ）
    pub fn cached_lease_end(&self) -> Option<DateTime<Utc>> {
        self.lock_cached().map(|c| c.end)
    }

    fn lock_cached(&self) -> std::sync::MutexGuard<'_, Option<CachedLease>> {
        self.cached.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Local check only: `now - last_renewal < timeout_factor * period`.
    pub fn is_holder(&self) -> bool {
        let Some(cached) = *self.lock_cached() else {
            return false;
        };
        let margin = chrono::Duration::milliseconds(
            (cached.period.num_milliseconds() as f64 * self.timeout_factor) as i64,
        );
        self.clock.now() - cached.renewed_at() < margin
    }

    /// One atomic acquire/renew attempt against the store.
    ///
    /// A rejected or failed attempt leaves the cached lease untouched.
    pub async fn try_acquire(&self) -> Result<AcquireOutcome> {
        let period = self.lease_period();
        let request = AcquireRequest::new(&self.resource_name, &self.worker_id, period)
            .with_rebalance(self.allow_rebalance);
        let was_holder = self.is_holder();
        let outcome = self.store.try_acquire_lease(&request).await?;

        if outcome.acquired {
            let end = outcome.lease_end_time.ok_or_else(|| {
                WardenError::InvalidState(format!(
                    "lease {} acquired without an end time",
                    self.resource_name
                ))
            })?;
            let period = chrono::Duration::from_std(period)
                .map_err(|e| WardenError::Config(format!("lease period: {e}")))?;
            *self.lock_cached() = Some(CachedLease { end, period });
            if !was_holder {
                info!(resource = %self.resource_name, worker_id = %self.worker_id, lease_end = %end, "lease acquired");
            }
        } else {
            if was_holder {
                info!(
                    resource = %self.resource_name,
                    worker_id = %self.worker_id,
                    holder = outcome.current_holder.as_deref().unwrap_or("-"),
                    "lease lost"
                );
            }
            debug!(
                resource = %self.resource_name,
                holder = outcome.current_holder.as_deref().unwrap_or("-"),
                "lease held elsewhere"
            );
        }
        Ok(outcome)
    }

    /// `token` がキャンセルされるまで acquire / renew を繰り返す
    pub async fn run(&self, token: CancellationToken) {
        loop {
            match self.try_acquire().await {
                Ok(_) => {}
                Err(WardenError::Cancelled) => break,
                Err(err) => {
                    warn!(resource = %self.resource_name, error = %err, "lease attempt failed");
                }
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.renew_interval()) => {}
            }
        }
        debug!(resource = %self.resource_name, worker_id = %self.worker_id, "lease loop stopped");
    }
}
