use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use super::{InMemoryCoordinationStore, StoreState};
use crate::domain::{
    EventLogEntry, EventStatus, ResourceRecord, ResourceWrite, Result, TransactionId,
    TransactionRecord, WardenError,
};
use crate::ports::StoreClient;

fn same_resource(row: &ResourceRecord, write: &ResourceWrite) -> bool {
    row.resource_type == write.resource_type && row.resource_id == write.resource_id
}

impl StoreState {
    fn transaction_mut(&mut self, id: TransactionId) -> Result<&mut TransactionRecord> {
        self.transactions
            .get_mut(&id)
            .ok_or_else(|| WardenError::NotFound(id.to_string()))
    }

    /// 同じ tx の同じリソースが既にあれば何もしない。新しい行を入れたら `true`、
    /// それまでの最新行は history になる
    fn apply_write(&mut self, transaction_id: TransactionId, write: ResourceWrite) -> bool {
        if self
            .resources
            .iter()
            .any(|r| same_resource(r, &write) && r.transaction_id == transaction_id)
        {
            return false;
        }

        let version = self
            .resources
            .iter()
            .filter(|r| same_resource(r, &write))
            .map(|r| r.version)
            .max()
            .unwrap_or(0)
            + 1;
        let latest = self
            .resources
            .iter_mut()
            .filter(|r| same_resource(r, &write) && !r.is_history)
            .max_by_key(|r| r.transaction_id);

        // A re-applied older write never hides a newer version.
        let superseded_by = match latest {
            Some(prior) if prior.transaction_id < transaction_id => {
                prior.is_history = true;
                prior.superseded_by = Some(transaction_id);
                None
            }
            Some(newer) => Some(newer.transaction_id),
            None => None,
        };
        self.resources.push(ResourceRecord {
            resource_type: write.resource_type,
            resource_id: write.resource_id,
            version,
            transaction_id,
            superseded_by,
            is_history: superseded_by.is_some(),
            is_committed: false,
            payload: write.payload,
        });
        true
    }
}

#[async_trait]
impl StoreClient for InMemoryCoordinationStore {
    async fn begin_transaction(&self) -> Result<TransactionId> {
        let mut state = self.state.lock().await;
        state.check_fault("begin_transaction")?;
        let id = self.transaction_ids.next_id();
        state
            .transactions
            .insert(id, TransactionRecord::begin(id, self.now()));
        Ok(id)
    }

    async fn heartbeat_transaction(&self, transaction_id: TransactionId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_fault("heartbeat_transaction")?;
        let now = self.now();
        state.transaction_mut(transaction_id)?.heartbeat_at = now;
        Ok(())
    }

    async fn write_resources(
        &self,
        transaction_id: TransactionId,
        writes: &[ResourceWrite],
    ) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.check_fault("write_resources")?;
        let now = self.now();
        state.transaction_mut(transaction_id)?.heartbeat_at = now;

        let mut inserted = 0;
        for write in writes {
            if state.apply_write(transaction_id, write.clone()) {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn mark_resources_committed(&self, transaction_id: TransactionId) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.check_fault("mark_resources_committed")?;
        state.transaction_mut(transaction_id)?;

        let mut marked = 0;
        for row in state
            .resources
            .iter_mut()
            .filter(|r| r.transaction_id == transaction_id && !r.is_committed)
        {
            row.is_committed = true;
            marked += 1;
        }
        Ok(marked)
    }

    async fn commit_transaction(
        &self,
        transaction_id: TransactionId,
        note: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_fault("commit_transaction")?;
        let now = self.now();
        let tx = state.transaction_mut(transaction_id)?;
        if !tx.is_committed() {
            tx.commit(now, note.map(str::to_string));
        }
        Ok(())
    }

    async fn advance_visibility(&self) -> Result<TransactionId> {
        let mut state = self.state.lock().await;
        state.check_fault("advance_visibility")?;

        let mut watermark = state.visibility;
        for tx in state.transactions.values() {
            if tx.transaction_id <= watermark {
                continue;
            }
            if !tx.is_committed() {
                break;
            }
            watermark = tx.transaction_id;
        }
        state.visibility = watermark;
        Ok(watermark)
    }

    async fn current_visibility(&self) -> Result<TransactionId> {
        let mut state = self.state.lock().await;
        state.check_fault("current_visibility")?;
        Ok(state.visibility)
    }

    async fn get_timed_out_transactions(
        &self,
        threshold: Duration,
    ) -> Result<Vec<TransactionRecord>> {
        let mut state = self.state.lock().await;
        state.check_fault("get_timed_out_transactions")?;
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| WardenError::Config(format!("threshold: {e}")))?;
        let now = self.now();
        Ok(state
            .transactions
            .values()
            .filter(|tx| !tx.is_committed() && tx.heartbeat_at + threshold <= now)
            .cloned()
            .collect())
    }

    async fn get_resources_by_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<ResourceRecord>> {
        let mut state = self.state.lock().await;
        state.check_fault("get_resources_by_transaction")?;
        Ok(state
            .resources
            .iter()
            .filter(|r| r.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn get_committed_transactions(
        &self,
        after: TransactionId,
        up_to: TransactionId,
    ) -> Result<Vec<TransactionRecord>> {
        let mut state = self.state.lock().await;
        state.check_fault("get_committed_transactions")?;
        if up_to <= after {
            return Ok(Vec::new());
        }
        Ok(state
            .transactions
            .range(TransactionId::new(after.value() + 1)..=up_to)
            .map(|(_, tx)| tx)
            .filter(|tx| tx.is_committed())
            .cloned()
            .collect())
    }

    async fn remove_invisible_history(&self, transaction_id: TransactionId) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.check_fault("remove_invisible_history")?;
        let now = self.now();
        state.transaction_mut(transaction_id)?;

        let before = state.resources.len();
        state
            .resources
            .retain(|r| !(r.is_history && r.superseded_by == Some(transaction_id)));
        let removed = before - state.resources.len();

        let tx = state.transaction_mut(transaction_id)?;
        if tx.invisible_history_removed_date.is_none() {
            tx.invisible_history_removed_date = Some(now);
        }
        Ok(removed)
    }

    async fn try_log_event(
        &self,
        process: &str,
        status: EventStatus,
        text: Option<&str>,
        start_time: Option<DateTime<Utc>>,
    ) {
        let mut state = self.state.lock().await;
        if let Err(error) = state.check_fault("try_log_event") {
            warn!(process, %error, "event log write failed");
            return;
        }
        let logged_at = self.now();
        state.events.push(EventLogEntry {
            process: process.to_string(),
            status,
            text: text.map(str::to_string),
            start_time,
            logged_at,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::ports::FixedClock;

    fn setup() -> (FixedClock, InMemoryCoordinationStore) {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let store = InMemoryCoordinationStore::new(Arc::new(clock.clone()));
        (clock, store)
    }

    async fn commit(store: &InMemoryCoordinationStore, tx: TransactionId) {
        store.mark_resources_committed(tx).await.unwrap();
        store.commit_transaction(tx, None).await.unwrap();
    }

    #[tokio::test]
    async fn watermark_stops_at_first_open_transaction() {
        let (_clock, store) = setup();
        let t1 = store.begin_transaction().await.unwrap();
        let t2 = store.begin_transaction().await.unwrap();
        let t3 = store.begin_transaction().await.unwrap();
        assert!(t1 < t2 && t2 < t3);

        commit(&store, t1).await;
        commit(&store, t3).await;
        assert_eq!(store.advance_visibility().await.unwrap(), t1);

        commit(&store, t2).await;
        assert_eq!(store.advance_visibility().await.unwrap(), t3);
        assert_eq!(store.current_visibility().await.unwrap(), t3);
    }

    #[tokio::test]
    async fn watermark_never_decreases() {
        let (_clock, store) = setup();
        let t1 = store.begin_transaction().await.unwrap();
        commit(&store, t1).await;
        let w1 = store.advance_visibility().await.unwrap();

        // New open transactions above W do not pull it back.
        store.begin_transaction().await.unwrap();
        let w2 = store.advance_visibility().await.unwrap();
        assert!(w2 >= w1);
    }

    #[tokio::test]
    async fn rewriting_the_same_transaction_is_idempotent() {
        let (_clock, store) = setup();
        let tx = store.begin_transaction().await.unwrap();
        let writes = [
            ResourceWrite::new("Patient", "p1", json!({"v": 1})),
            ResourceWrite::new("Patient", "p2", json!({"v": 1})),
        ];
        assert_eq!(store.write_resources(tx, &writes[..1]).await.unwrap(), 1);
        assert_eq!(store.write_resources(tx, &writes).await.unwrap(), 1);
        assert_eq!(store.get_resources_by_transaction(tx).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn later_write_turns_prior_version_into_history() {
        let (_clock, store) = setup();
        let t1 = store.begin_transaction().await.unwrap();
        store
            .write_resources(t1, &[ResourceWrite::new("Patient", "p1", json!(1))])
            .await
            .unwrap();
        commit(&store, t1).await;
        let t2 = store.begin_transaction().await.unwrap();
        store
            .write_resources(t2, &[ResourceWrite::new("Patient", "p1", json!(2))])
            .await
            .unwrap();

        let rows = store.resources().await;
        let old = rows.iter().find(|r| r.transaction_id == t1).unwrap();
        let new = rows.iter().find(|r| r.transaction_id == t2).unwrap();
        assert!(old.is_history);
        assert_eq!(old.superseded_by, Some(t2));
        assert_eq!(new.version, 2);
        assert!(!new.is_committed);

        assert_eq!(store.remove_invisible_history(t2).await.unwrap(), 1);
        assert_eq!(store.resources().await.len(), 1);
        let record = store.transaction(t2).await.unwrap();
        assert!(record.invisible_history_removed_date.is_some());
    }

    #[tokio::test]
    async fn timed_out_transactions_are_open_and_stale() {
        let (clock, store) = setup();
        let stale = store.begin_transaction().await.unwrap();
        let done = store.begin_transaction().await.unwrap();
        commit(&store, done).await;

        clock.advance(chrono::Duration::seconds(50));
        let fresh = store.begin_transaction().await.unwrap();
        clock.advance(chrono::Duration::seconds(20));

        let timed_out = store
            .get_timed_out_transactions(Duration::from_secs(60))
            .await
            .unwrap();
        let ids: Vec<_> = timed_out.iter().map(|t| t.transaction_id).collect();
        assert_eq!(ids, vec![stale]);
        assert!(!ids.contains(&fresh));
    }

    #[tokio::test]
    async fn committed_range_is_half_open() {
        let (_clock, store) = setup();
        let t1 = store.begin_transaction().await.unwrap();
        let t2 = store.begin_transaction().await.unwrap();
        let t3 = store.begin_transaction().await.unwrap();
        for tx in [t1, t2, t3] {
            commit(&store, tx).await;
        }
        let range = store.get_committed_transactions(t1, t3).await.unwrap();
        let ids: Vec<_> = range.iter().map(|t| t.transaction_id).collect();
        assert_eq!(ids, vec![t2, t3]);
        assert!(store.get_committed_transactions(t3, t1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_event_swallows_store_failures() {
        let (_clock, store) = setup();
        store.inject_transient_failures(1).await;
        store.try_log_event("Defrag", EventStatus::Start, None, None).await;
        store
            .try_log_event("Defrag", EventStatus::End, Some("ok"), None)
            .await;
        let events = store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, EventStatus::End);
    }
}
