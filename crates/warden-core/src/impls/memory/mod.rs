//! InMemoryCoordinationStore - 開発・テスト用の coordination store
//!
//! すべての port を 1 つの struct で実装する。全操作は同じ `Mutex` の中で完結するので、
//! store 自身が直列化ポイントになる（client 側の compare-and-swap は不要）。
//! 複数 instance のシミュレーションは、同じ store を `Arc` で共有して行う。

mod config;
mod jobs;
mod leases;
mod transactions;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    ConfigValue, EventLogEntry, JobId, JobRecord, Lease, QueueType, ResourceRecord, Result,
    TransactionId, TransactionRecord, WardenError,
};
use crate::ports::{Clock, TransactionIdGenerator, UlidGenerator};

/// In-memory store state (single source of truth for every table).
#[derive(Default)]
struct StoreState {
    leases: HashMap<String, Lease>,
    /// ULID order is creation order, so iteration is FIFO.
    jobs: BTreeMap<JobId, JobRecord>,
    /// (queue_type, unique_key) -> job, for `enqueue_unique`.
    unique_keys: HashMap<(QueueType, String), JobId>,
    config: HashMap<String, ConfigValue>,
    transactions: BTreeMap<TransactionId, TransactionRecord>,
    resources: Vec<ResourceRecord>,
    visibility: TransactionId,
    events: Vec<EventLogEntry>,

    /// Number of upcoming calls that fail with `TransientStore`.
    injected_failures: usize,
}

impl StoreState {
    fn check_fault(&mut self, operation: &str) -> Result<()> {
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(WardenError::transient(operation, "injected failure"));
        }
        Ok(())
    }
}

pub struct InMemoryCoordinationStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
    transaction_ids: TransactionIdGenerator<Arc<dyn Clock>>,
}

impl InMemoryCoordinationStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            ids: UlidGenerator::new(Arc::clone(&clock)),
            transaction_ids: TransactionIdGenerator::new(Arc::clone(&clock)),
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Makes the next `n` store calls fail with a transient error.
    pub async fn inject_transient_failures(&self, n: usize) {
        self.state.lock().await.injected_failures = n;
    }

    /// Snapshot of the event log (for diagnostics and tests).
    pub async fn events(&self) -> Vec<EventLogEntry> {
        self.state.lock().await.events.clone()
    }

    /// Snapshot of every stored resource row.
    pub async fn resources(&self) -> Vec<ResourceRecord> {
        self.state.lock().await.resources.clone()
    }

    pub async fn transaction(&self, id: TransactionId) -> Option<TransactionRecord> {
        self.state.lock().await.transactions.get(&id).cloned()
    }

    pub async fn job(&self, id: JobId) -> Option<JobRecord> {
        self.state.lock().await.jobs.get(&id).cloned()
    }
}
