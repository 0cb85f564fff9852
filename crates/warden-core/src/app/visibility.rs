//! Visibility watermark W and stuck-transaction recovery.
//!
//! W only moves forward and never passes an open transaction. When it stops
//! moving, transactions whose heartbeat is older than
//! `heartbeat_factor × period` are presumed crashed and are finished here,
//! lowest id first, re-trying the watermark after each one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::watchdog::{Watchdog, PERIOD_SEC};
use crate::domain::{
    config_seconds, parameter_id, ConfigParameter, ResourceWrite, Result, TransactionId, TransactionRecord,
    WardenError,
};
use crate::ports::CoordinationStore;

pub const HEARTBEAT_FACTOR: &str = "HeartbeatFactor";

/// 1 回の `run_once` の結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VisibilityReport {
    pub watermark_before: TransactionId,
    pub watermark_after: TransactionId,
    pub recovered: Vec<TransactionId>,
}

/// W の前進と stuck transaction の回収
pub struct TransactionVisibilityCoordinator {
    store: Arc<dyn CoordinationStore>,
}

impl TransactionVisibilityCoordinator {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub async fn advance(&self) -> Result<TransactionId> {
        self.store.advance_visibility().await
    }

    /// Advances W; if it did not move, recovers stuck transactions.
    pub async fn run_once(
        &self,
        stuck_threshold: Duration,
        token: &CancellationToken,
    ) -> Result<VisibilityReport> {
        let before = self.store.current_visibility().await?;
        let mut watermark = self.advance().await?;
        let mut report = VisibilityReport {
            watermark_before: before,
            watermark_after: watermark,
            recovered: Vec::new(),
        };
        if watermark > before {
            debug!(from = %before, to = %watermark, "visibility advanced");
            return Ok(report);
        }

        let mut stuck = self.store.get_timed_out_transactions(stuck_threshold).await?;
        stuck.sort_by_key(|tx| tx.transaction_id);
        for tx in &stuck {
            if token.is_cancelled() {
                return Err(WardenError::Cancelled);
            }
            self.recover(tx).await?;
            report.recovered.push(tx.transaction_id);
            watermark = self.advance().await?;
        }
        report.watermark_after = watermark;
        if !report.recovered.is_empty() {
            info!(
                recovered = report.recovered.len(),
                from = %before,
                to = %watermark,
                "stuck transactions recovered"
            );
        }
        Ok(report)
    }

    /// 落ちた writer の書き込みを同じ経路で再適用して commit まで進める
    pub async fn recover(&self, tx: &TransactionRecord) -> Result<()> {
        let id = tx.transaction_id;
        let rows = self.store.get_resources_by_transaction(id).await?;
        if rows.is_empty() {
            self.store
                .commit_transaction(id, Some("recovered: no resources"))
                .await?;
            info!(transaction_id = %id, "empty stuck transaction committed");
            return Ok(());
        }

        let writes: Vec<ResourceWrite> = rows.iter().map(|r| r.as_write()).collect();
        self.store.write_resources(id, &writes).await?;
        let marked = self.store.mark_resources_committed(id).await?;
        self.store.commit_transaction(id, Some("recovered")).await?;
        info!(transaction_id = %id, rows = rows.len(), marked, "stuck transaction recovered");
        Ok(())
    }
}

/// Periodically advances W and repairs stuck transactions.
pub struct TransactionWatchdog {
    store: Arc<dyn CoordinationStore>,
    coordinator: TransactionVisibilityCoordinator,
    default_heartbeat_factor: f64,
}

impl TransactionWatchdog {
    pub const NAME: &'static str = "Transactions";

    pub fn new(store: Arc<dyn CoordinationStore>, default_heartbeat_factor: f64) -> Self {
        Self {
            coordinator: TransactionVisibilityCoordinator::new(Arc::clone(&store)),
            store,
            default_heartbeat_factor,
        }
    }

    async fn read_number(&self, suffix: &str) -> Result<Option<f64>> {
        Ok(self
            .store
            .get_parameter(&parameter_id(Self::NAME, suffix))
            .await?
            .and_then(|v| v.as_number())
            .filter(|v| v.is_finite() && *v > 0.0))
    }

    fn default_threshold(&self) -> Duration {
        let period = self.default_period();
        config_seconds(period.as_secs_f64() * self.default_heartbeat_factor).unwrap_or(period)
    }

    /// `HeartbeatFactor × PeriodSec`, both re-read from the store.
    ///
    /// 積が範囲外なら既定値の積に戻す。
    async fn stuck_threshold(&self) -> Result<Duration> {
        let factor = self
            .read_number(HEARTBEAT_FACTOR)
            .await?
            .unwrap_or(self.default_heartbeat_factor);
        let period = self
            .read_number(PERIOD_SEC)
            .await?
            .and_then(config_seconds)
            .unwrap_or_else(|| self.default_period());
        let secs = period.as_secs_f64() * factor;
        Ok(config_seconds(secs).unwrap_or_else(|| {
            warn!(watchdog = Self::NAME, secs, "stuck threshold out of range, using defaults");
            self.default_threshold()
        }))
    }
}

#[async_trait]
impl Watchdog for TransactionWatchdog {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn default_period(&self) -> Duration {
        Duration::from_secs(3)
    }

    fn default_lease_period(&self) -> Duration {
        Duration::from_secs(20)
    }

    async fn bootstrap(&self) -> Result<()> {
        self.store
            .insert_parameter_if_absent(&ConfigParameter::number(
                parameter_id(Self::NAME, HEARTBEAT_FACTOR),
                self.default_heartbeat_factor,
            ))
            .await?;
        Ok(())
    }

    async fn execute(&self, token: &CancellationToken) -> Result<()> {
        let threshold = self.stuck_threshold().await?;
        self.coordinator.run_once(threshold, token).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::impls::InMemoryCoordinationStore;
    use crate::ports::{ConfigStore, FixedClock, StoreClient};

    const THRESHOLD: Duration = Duration::from_secs(18);

    fn setup() -> (FixedClock, Arc<InMemoryCoordinationStore>, TransactionVisibilityCoordinator) {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let store = Arc::new(InMemoryCoordinationStore::new(Arc::new(clock.clone())));
        let coordinator = TransactionVisibilityCoordinator::new(store.clone());
        (clock, store, coordinator)
    }

    async fn write_and_commit(store: &InMemoryCoordinationStore, id: &str) -> TransactionId {
        let tx = store.begin_transaction().await.unwrap();
        store
            .write_resources(tx, &[ResourceWrite::new("Patient", id, json!({"id": id}))])
            .await
            .unwrap();
        store.mark_resources_committed(tx).await.unwrap();
        store.commit_transaction(tx, None).await.unwrap();
        tx
    }

    #[tokio::test]
    async fn progress_skips_recovery() {
        let (_clock, store, coordinator) = setup();
        let tx = write_and_commit(&store, "p1").await;

        let report = coordinator
            .run_once(THRESHOLD, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.watermark_after, tx);
        assert!(report.recovered.is_empty());
    }

    #[tokio::test]
    async fn fresh_open_transaction_blocks_watermark() {
        let (clock, store, coordinator) = setup();
        let open = store.begin_transaction().await.unwrap();
        let later = write_and_commit(&store, "p2").await;

        clock.advance(chrono::Duration::seconds(5));
        let report = coordinator
            .run_once(THRESHOLD, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.watermark_after < open);
        assert!(report.recovered.is_empty());
        assert!(store.transaction(later).await.unwrap().is_committed());
    }

    #[tokio::test]
    async fn stuck_writer_is_recovered_and_watermark_passes_it() {
        let (clock, store, coordinator) = setup();
        let stuck = store.begin_transaction().await.unwrap();
        store
            .write_resources(stuck, &[ResourceWrite::new("Patient", "p1", json!(1))])
            .await
            .unwrap();
        let empty = store.begin_transaction().await.unwrap();
        let later = write_and_commit(&store, "p3").await;

        clock.advance(chrono::Duration::seconds(30));
        let report = coordinator
            .run_once(THRESHOLD, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.recovered, vec![stuck, empty]);
        assert_eq!(report.watermark_after, later);

        let stuck_row = store.transaction(stuck).await.unwrap();
        assert_eq!(stuck_row.commit_note.as_deref(), Some("recovered"));
        let empty_row = store.transaction(empty).await.unwrap();
        assert_eq!(empty_row.commit_note.as_deref(), Some("recovered: no resources"));

        let rows = store.get_resources_by_transaction(stuck).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_committed);
    }

    #[tokio::test]
    async fn recovery_is_idempotent() {
        let (clock, store, coordinator) = setup();
        let stuck = store.begin_transaction().await.unwrap();
        store
            .write_resources(stuck, &[ResourceWrite::new("Patient", "p1", json!(1))])
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(30));

        let tx = store.transaction(stuck).await.unwrap();
        coordinator.recover(&tx).await.unwrap();
        coordinator.recover(&tx).await.unwrap();
        assert_eq!(store.resources().await.len(), 1);
    }

    #[tokio::test]
    async fn watchdog_threshold_follows_config_rows() {
        let (_clock, store, _) = setup();
        let watchdog = TransactionWatchdog::new(store.clone(), 6.0);
        watchdog.bootstrap().await.unwrap();
        assert_eq!(
            watchdog.stuck_threshold().await.unwrap(),
            Duration::from_secs(18)
        );

        store
            .set_parameter(&ConfigParameter::number("Transactions.HeartbeatFactor", 2.0))
            .await
            .unwrap();
        store
            .set_parameter(&ConfigParameter::number("Transactions.PeriodSec", 10.0))
            .await
            .unwrap();
        assert_eq!(
            watchdog.stuck_threshold().await.unwrap(),
            Duration::from_secs(20)
        );
    }

    #[rstest]
    #[case::huge_factor(1e300, 3.0)]
    #[case::huge_period(6.0, 1e30)]
    #[case::product_beyond_a_year(1e6, 100.0)]
    #[tokio::test]
    async fn out_of_range_threshold_falls_back_to_defaults(
        #[case] factor: f64,
        #[case] period: f64,
    ) {
        let (_clock, store, _) = setup();
        let watchdog = TransactionWatchdog::new(store.clone(), 6.0);
        store
            .set_parameter(&ConfigParameter::number("Transactions.HeartbeatFactor", factor))
            .await
            .unwrap();
        store
            .set_parameter(&ConfigParameter::number("Transactions.PeriodSec", period))
            .await
            .unwrap();
        assert_eq!(
            watchdog.stuck_threshold().await.unwrap(),
            Duration::from_secs(18)
        );
    }
}
