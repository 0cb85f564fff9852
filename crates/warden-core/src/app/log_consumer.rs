//! Cursor-based consumers of the committed transaction log.
//!
//! The cursor is a `<Name>.LastProcessedTransactionId` row (bootstrapped to
//! `TransactionId::MIN`). A pass reads the cursor and the current W, handles
//! every committed transaction in (cursor, W] in id order, and then stores
//! W as the new cursor even if the range was empty. If a transaction fails
//! the cursor stops right before it, so it is retried on the next pass.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::watchdog::Watchdog;
use crate::domain::{
    parameter_id, ConfigParameter, QueueType, Result, TransactionId, TransactionRecord,
    WardenError,
};
use crate::ports::CoordinationStore;

pub const LAST_PROCESSED: &str = "LastProcessedTransactionId";
pub const RETENTION_SEC: &str = "RetentionSec";

const DEFAULT_DISPATCH_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Handles one fully visible transaction.
#[async_trait]
pub trait TransactionConsumer: Send + Sync {
    async fn process(&self, transaction: &TransactionRecord) -> Result<()>;
}

/// 1 回の pass でカーソルがどこからどこまで進んだか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorAdvance {
    pub from: TransactionId,
    pub to: TransactionId,
    pub processed: usize,
}

/// `<Name>.LastProcessedTransactionId` 行で表すカーソル
pub struct LogCursor {
    store: Arc<dyn CoordinationStore>,
    parameter: String,
}

impl LogCursor {
    pub fn new(store: Arc<dyn CoordinationStore>, namespace: &str) -> Self {
        Self {
            store,
            parameter: parameter_id(namespace, LAST_PROCESSED),
        }
    }

    pub async fn bootstrap(&self) -> Result<()> {
        self.store
            .insert_parameter_if_absent(&ConfigParameter::bigint(
                &self.parameter,
                TransactionId::MIN.value(),
            ))
            .await?;
        Ok(())
    }

    /// 行が無いか壊れていれば `TransactionId::MIN`
    pub async fn position(&self) -> Result<TransactionId> {
        Ok(self
            .store
            .get_parameter(&self.parameter)
            .await?
            .and_then(|v| v.as_bigint())
            .map(TransactionId::new)
            .unwrap_or(TransactionId::MIN))
    }

    async fn save(&self, position: TransactionId) -> Result<()> {
        self.store
            .set_parameter(&ConfigParameter::bigint(&self.parameter, position.value()))
            .await
    }

    /// One pass over (cursor, W].
    pub async fn run_once(
        &self,
        consumer: &dyn TransactionConsumer,
        token: &CancellationToken,
    ) -> Result<CursorAdvance> {
        let from = self.position().await?;
        let watermark = self.store.current_visibility().await?;
        if watermark <= from {
            return Ok(CursorAdvance {
                from,
                to: from,
                processed: 0,
            });
        }

        let transactions = self
            .store
            .get_committed_transactions(from, watermark)
            .await?;
        let mut done = from;
        for tx in &transactions {
            let result = if token.is_cancelled() {
                Err(WardenError::Cancelled)
            } else {
                consumer.process(tx).await
            };
            if let Err(err) = result {
                if done > from {
                    self.save(done).await?;
                }
                return Err(err);
            }
            done = tx.transaction_id;
        }

        self.save(watermark).await?;
        let advance = CursorAdvance {
            from,
            to: watermark,
            processed: transactions.len(),
        };
        if advance.processed > 0 {
            info!(cursor = %self.parameter, from = %from, to = %watermark, processed = advance.processed, "cursor advanced");
        } else {
            debug!(cursor = %self.parameter, to = %watermark, "cursor moved to watermark");
        }
        Ok(advance)
    }
}

/// 可視になった transaction ごとに通知ジョブを 1 つ enqueue する。
///
/// ジョブは `tx-<id>` をキーに一意で、完了後も archive されるまでは
/// 同じ transaction を再処理しても増えない。完了済みグループの archive も
/// この watchdog が `SubscriptionDispatch.RetentionSec` に従って行う。
pub struct SubscriptionDispatchWatchdog {
    store: Arc<dyn CoordinationStore>,
    cursor: LogCursor,
    queue_type: QueueType,
}

impl SubscriptionDispatchWatchdog {
    pub const NAME: &'static str = "SubscriptionDispatch";

    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            cursor: LogCursor::new(Arc::clone(&store), Self::NAME),
            store,
            queue_type: QueueType::new("subscription.dispatch"),
        }
    }

    pub fn queue_type(&self) -> &QueueType {
        &self.queue_type
    }

    pub fn cursor(&self) -> &LogCursor {
        &self.cursor
    }

    async fn retention(&self) -> Result<Duration> {
        Ok(self
            .store
            .get_parameter(&parameter_id(Self::NAME, RETENTION_SEC))
            .await?
            .and_then(|v| v.as_bigint())
            .filter(|v| *v > 0)
            .map(|v| Duration::from_secs(v as u64))
            .unwrap_or(DEFAULT_DISPATCH_RETENTION))
    }

    async fn archive(&self) -> Result<usize> {
        let retention = self.retention().await?;
        let archived = self
            .store
            .archive_expired_groups(&self.queue_type, retention)
            .await?;
        if archived > 0 {
            info!(watchdog = Self::NAME, archived, "finished dispatch jobs archived");
        }
        Ok(archived)
    }
}

#[async_trait]
impl TransactionConsumer for SubscriptionDispatchWatchdog {
    async fn process(&self, transaction: &TransactionRecord) -> Result<()> {
        let id = transaction.transaction_id.value();
        let job = self
            .store
            .enqueue_unique(
                &self.queue_type,
                &format!("tx-{id}"),
                json!({ "transaction_id": id }),
            )
            .await?;
        if job.status.is_terminal() {
            debug!(transaction_id = %transaction.transaction_id, status = ?job.status, "already dispatched");
        }
        Ok(())
    }
}

#[async_trait]
impl Watchdog for SubscriptionDispatchWatchdog {
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
            .insert_parameter_if_absent(&ConfigParameter::bigint(
                parameter_id(Self::NAME, RETENTION_SEC),
                DEFAULT_DISPATCH_RETENTION.as_secs() as i64,
            ))
            .await?;
        self.cursor.bootstrap().await
    }

    async fn execute(&self, token: &CancellationToken) -> Result<()> {
        self.archive().await?;
        self.cursor.run_once(self, token).await?;
        Ok(())
    }
}

/// 可視になった transaction が上書きした history 行を削除する
pub struct InvisibleHistoryCleanupWatchdog {
    store: Arc<dyn CoordinationStore>,
    cursor: LogCursor,
}

impl InvisibleHistoryCleanupWatchdog {
    pub const NAME: &'static str = "InvisibleHistoryCleanup";

    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            cursor: LogCursor::new(Arc::clone(&store), Self::NAME),
            store,
        }
    }

    pub fn cursor(&self) -> &LogCursor {
        &self.cursor
    }
}

#[async_trait]
impl TransactionConsumer for InvisibleHistoryCleanupWatchdog {
    async fn process(&self, transaction: &TransactionRecord) -> Result<()> {
        if transaction.invisible_history_removed_date.is_some() {
            return Ok(());
        }
        let removed = self
            .store
            .remove_invisible_history(transaction.transaction_id)
            .await?;
        if removed > 0 {
            debug!(transaction_id = %transaction.transaction_id, removed, "history rows removed");
        }
        Ok(())
    }
}

#[async_trait]
impl Watchdog for InvisibleHistoryCleanupWatchdog {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn default_period(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn default_lease_period(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn bootstrap(&self) -> Result<()> {
        self.cursor.bootstrap().await
    }

    async fn execute(&self, token: &CancellationToken) -> Result<()> {
        self.cursor.run_once(self, token).await?;
        Ok(())
    }
}
