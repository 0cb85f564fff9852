//! StoreClient port - トランザクション・リソース・イベントログの正本
//!
//! # 設計原則
//! - 書き込みは TransactionId を取ってから行う（begin_transaction）
//! - visibility watermark W の更新は store 側の 1 操作。open なトランザクションは決して越えない
//! - リソースの書き込みは冪等（同じ (type, id, tx) を再適用しても行は増えない）

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    EventStatus, ResourceRecord, ResourceWrite, Result, TransactionId, TransactionRecord,
};

/// トランザクション・リソース・イベントログを扱う store 操作
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Allocates the next transaction id and records it in flight.
    async fn begin_transaction(&self) -> Result<TransactionId>;

    /// 書き込み中のトランザクションが生きていることを示す。止まると stuck 扱いになる
    async fn heartbeat_transaction(&self, transaction_id: TransactionId) -> Result<()>;

    /// Writes resource versions for `transaction_id` as not yet committed.
    /// Re-applying a write already present for the same transaction does not
    /// insert a new row. Returns the number of rows inserted.
    async fn write_resources(
        &self,
        transaction_id: TransactionId,
        writes: &[ResourceWrite],
    ) -> Result<usize>;

    /// Marks every row of the transaction fully committed.
    async fn mark_resources_committed(&self, transaction_id: TransactionId) -> Result<usize>;

    async fn commit_transaction(
        &self,
        transaction_id: TransactionId,
        note: Option<&str>,
    ) -> Result<()>;

    /// Raises W to the highest id N such that every id <= N is committed.
    /// Returns the (possibly unchanged) watermark.
    async fn advance_visibility(&self) -> Result<TransactionId>;

    /// 現在の W を読むだけ（進めない）
    async fn current_visibility(&self) -> Result<TransactionId>;

    /// Uncommitted transactions whose heartbeat is older than `threshold`, by id.
    async fn get_timed_out_transactions(
        &self,
        threshold: Duration,
    ) -> Result<Vec<TransactionRecord>>;

    async fn get_resources_by_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<ResourceRecord>>;

    /// Committed transactions with `after < id <= up_to`, by id.
    async fn get_committed_transactions(
        &self,
        after: TransactionId,
        up_to: TransactionId,
    ) -> Result<Vec<TransactionRecord>>;

    /// Deletes history rows superseded by `transaction_id` and stamps
    /// `invisible_history_removed_date`. Returns the number of rows deleted.
    async fn remove_invisible_history(&self, transaction_id: TransactionId) -> Result<usize>;

    /// Best effort: implementations swallow their own failures.
    async fn try_log_event(
        &self,
        process: &str,
        status: EventStatus,
        text: Option<&str>,
        start_time: Option<DateTime<Utc>>,
    );
}
