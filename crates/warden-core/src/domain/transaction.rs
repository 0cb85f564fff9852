//! Write transactions, the resource rows they produce, and the event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TransactionId;

/// One write transaction as tracked by the store.
///
/// `visible_date` is set on commit. A transaction without it is in flight
/// (or crashed, which the visibility watchdog finds out by heartbeat age).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: TransactionId,
    pub created_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub visible_date: Option<DateTime<Utc>>,
    pub invisible_history_removed_date: Option<DateTime<Utc>>,
    pub commit_note: Option<String>,
}

impl TransactionRecord {
    pub fn begin(transaction_id: TransactionId, now: DateTime<Utc>) -> Self {
        Self {
            transaction_id,
            created_at: now,
            heartbeat_at: now,
            visible_date: None,
            invisible_history_removed_date: None,
            commit_note: None,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.visible_date.is_some()
    }

    /// `visible_date` を立てる。recovery 経由のときは `note` に理由が入る
    pub fn commit(&mut self, now: DateTime<Utc>, note: Option<String>) {
        self.visible_date = Some(now);
        self.commit_note = note;
    }
}

/// A resource write carried by a transaction (input of the merge path).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceWrite {
    pub resource_type: String,
    pub resource_id: String,
    pub payload: serde_json::Value,
}

impl ResourceWrite {
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            payload,
        }
    }
}

/// A stored resource version.
///
/// `is_history` marks a version superseded by a later write;
/// `is_committed` is false until the owning transaction's rows have been
/// fully written (or re-applied by recovery).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_type: String,
    pub resource_id: String,
    pub version: i32,
    pub transaction_id: TransactionId,
    /// Transaction that turned this row into history, if any.
    pub superseded_by: Option<TransactionId>,
    pub is_history: bool,
    pub is_committed: bool,
    pub payload: serde_json::Value,
}

impl ResourceRecord {
    /// recovery で再適用するための書き込みに戻す
    pub fn as_write(&self) -> ResourceWrite {
        ResourceWrite::new(
            self.resource_type.clone(),
            self.resource_id.clone(),
            self.payload.clone(),
        )
    }
}

/// イベントログの状態。Start / End が 1 回の実行を挟む
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Start,
    End,
    Warn,
    Error,
}

/// Row of the operational event log written by watchdog bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub process: String,
    pub status: EventStatus,
    pub text: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub logged_at: DateTime<Utc>,
}
