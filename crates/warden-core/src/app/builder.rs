//! WardenBuilder - 1 instance 分の watchdog 群の構築とワイヤリング
//!
//! # 起動時検証（Fail-fast）
//! - 同じ名前の watchdog を 2 回登録したらエラー（lease と設定行が衝突する）
//! - `expect_watchdogs()` で期待した名前が揃っていなければエラー
//!
//! store は [`RetryingStore`] で包んでから各 watchdog に渡す。

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::config::WardenConfig;
use super::defrag::{DefragWatchdog, LoggingUnitHandler};
use super::log_consumer::{InvisibleHistoryCleanupWatchdog, SubscriptionDispatchWatchdog};
use super::visibility::TransactionWatchdog;
use super::watchdog::{Watchdog, WatchdogHandle, WatchdogRunner, WatchdogStatus};
use super::worker_pool::JobHandler;
use crate::domain::Result;
use crate::impls::RetryingStore;
use crate::ports::{Clock, CoordinationStore};

/// 構築時の検証エラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("watchdog registered twice: {0}")]
    DuplicateWatchdog(String),
    #[error("missing watchdogs: {0:?}. These were expected but not registered.")]
    MissingWatchdogs(Vec<String>),
}

/// 1 instance 分の watchdog を登録して [`WardenInstance`] を組み立てる
pub struct WardenBuilder {
    config: WardenConfig,
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    worker_id: String,
    token: CancellationToken,
    watchdogs: Vec<Arc<dyn Watchdog>>,
    expected: Option<Vec<String>>,
}

impl WardenBuilder {
    /// `token` is the shutdown token: store retries stop when it is cancelled.
    pub fn new(
        config: WardenConfig,
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        worker_id: impl Into<String>,
        token: CancellationToken,
    ) -> Self {
        let store: Arc<dyn CoordinationStore> = Arc::new(RetryingStore::new(
            store,
            config.store_retry.policy(),
            token.clone(),
        ));
        Self {
            config,
            store,
            clock,
            worker_id: worker_id.into(),
            token,
            watchdogs: Vec::new(),
            expected: None,
        }
    }

    /// The retrying store every registered watchdog should use.
    pub fn store(&self) -> Arc<dyn CoordinationStore> {
        Arc::clone(&self.store)
    }

    /// 同名の watchdog が既にあれば `DuplicateWatchdog`
    pub fn register(mut self, watchdog: Arc<dyn Watchdog>) -> Result<Self, BuildError> {
        if self.watchdogs.iter().any(|w| w.name() == watchdog.name()) {
            return Err(BuildError::DuplicateWatchdog(watchdog.name().to_string()));
        }
        self.watchdogs.push(watchdog);
        Ok(self)
    }

    /// Transactions, SubscriptionDispatch, InvisibleHistoryCleanup and Defrag
    /// (with the given unit handler).
    pub fn with_standard_watchdogs(
        self,
        unit_handler: Arc<dyn JobHandler>,
    ) -> Result<Self, BuildError> {
        let store = self.store();
        let stuck_factor = self.config.stuck_transaction_factor;
        let defrag = DefragWatchdog::new(
            Arc::clone(&store),
            unit_handler,
            self.worker_id.clone(),
            self.config.worker_pool_size,
            self.config.heartbeat_timeout(),
        );
        self.register(Arc::new(TransactionWatchdog::new(
            Arc::clone(&store),
            stuck_factor,
        )))?
        .register(Arc::new(SubscriptionDispatchWatchdog::new(Arc::clone(&store))))?
        .register(Arc::new(InvisibleHistoryCleanupWatchdog::new(store)))?
        .register(Arc::new(defrag))
    }

    /// 標準 watchdog 群。Defrag の unit 本体はログを出すだけ
    pub fn with_default_watchdogs(self) -> Result<Self, BuildError> {
        self.with_standard_watchdogs(Arc::new(LoggingUnitHandler))
    }

    /// `build()` 時に揃っているべき watchdog 名
    pub fn expect_watchdogs(mut self, names: &[&str]) -> Self {
        self.expected = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<WardenInstance, BuildError> {
        if let Some(expected) = &self.expected {
            let registered: BTreeSet<&str> = self.watchdogs.iter().map(|w| w.name()).collect();
            let missing: Vec<String> = expected
                .iter()
                .filter(|n| !registered.contains(n.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingWatchdogs(missing));
            }
        }

        let runners = self
            .watchdogs
            .into_iter()
            .map(|watchdog| {
                let settings = self.config.watchdog(
                    watchdog.name(),
                    watchdog.default_period(),
                    watchdog.default_lease_period(),
                );
                WatchdogRunner::new(
                    watchdog,
                    Arc::clone(&self.store),
                    Arc::clone(&self.clock),
                    self.worker_id.clone(),
                    settings,
                    self.config.lease_timeout_factor,
                )
            })
            .collect();
        Ok(WardenInstance {
            worker_id: self.worker_id,
            token: self.token,
            runners,
        })
    }
}

/// One process's set of watchdogs, sharing a worker id and a shutdown token.
pub struct WardenInstance {
    worker_id: String,
    token: CancellationToken,
    runners: Vec<WatchdogRunner>,
}

impl WardenInstance {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn runners(&self) -> &[WatchdogRunner] {
        &self.runners
    }

    /// Starts every watchdog. Fails on the first bootstrap error.
    pub async fn start(&self) -> Result<Vec<WatchdogHandle>> {
        let mut handles = Vec::with_capacity(self.runners.len());
        for runner in &self.runners {
            handles.push(runner.start(self.token.child_token()).await?);
        }
        info!(worker_id = %self.worker_id, watchdogs = handles.len(), "instance started");
        Ok(handles)
    }

    pub fn statuses(&self) -> Vec<WatchdogStatus> {
        self.runners.iter().map(|r| r.status()).collect()
    }
}
