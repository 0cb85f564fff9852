use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::InMemoryCoordinationStore;
use crate::domain::{AcquireOutcome, AcquireRequest, Lease, Result, WardenError};
use crate::ports::LeaseStore;

/// holder ごとの有効（未失効）lease 数
fn held_counts(leases: &HashMap<String, Lease>, now: DateTime<Utc>) -> HashMap<&str, usize> {
    let mut counts = HashMap::new();
    for lease in leases.values().filter(|l| !l.is_expired_at(now)) {
        *counts.entry(lease.holder_id.as_str()).or_insert(0) += 1;
    }
    counts
}

/// Rebalance priority: the caller may take a valid lease away from a holder
/// that holds at least two more leases than the caller does.
fn wins_rebalance(
    leases: &HashMap<String, Lease>,
    current: &Lease,
    worker_id: &str,
    now: DateTime<Utc>,
) -> bool {
    let counts = held_counts(leases, now);
    let holder = counts.get(current.holder_id.as_str()).copied().unwrap_or(0);
    let caller = counts.get(worker_id).copied().unwrap_or(0);
    holder > caller + 1
}

#[async_trait]
impl LeaseStore for InMemoryCoordinationStore {
    async fn try_acquire_lease(&self, request: &AcquireRequest) -> Result<AcquireOutcome> {
        let mut state = self.state.lock().await;
        state.check_fault("try_acquire_lease")?;
        let now = self.now();

        let current = state.leases.get(&request.resource_name);
        if !request.is_running {
            return Ok(AcquireOutcome::rejected(current));
        }

        let may_take = match current {
            None => true,
            Some(lease) if lease.is_expired_at(now) => true,
            Some(lease) if lease.holder_id == request.worker_id => true,
            Some(_) if request.force_acquire => true,
            Some(lease) => {
                request.allow_rebalance
                    && wins_rebalance(&state.leases, lease, &request.worker_id, now)
            }
        };
        if !may_take {
            return Ok(AcquireOutcome::rejected(current));
        }

        let period = chrono::Duration::from_std(request.lease_period)
            .map_err(|e| WardenError::Config(format!("lease period: {e}")))?;
        let lease_end_time = now + period;
        state.leases.insert(
            request.resource_name.clone(),
            Lease {
                resource_name: request.resource_name.clone(),
                holder_id: request.worker_id.clone(),
                lease_end_time,
                period_sec: request.lease_period.as_secs(),
            },
        );
        Ok(AcquireOutcome::acquired(lease_end_time, &request.worker_id))
    }

    async fn get_lease(&self, resource_name: &str) -> Result<Option<Lease>> {
        let mut state = self.state.lock().await;
        state.check_fault("get_lease")?;
        Ok(state.leases.get(resource_name).cloned())
    }
}
