//! Lease model: time-boxed exclusive claim on a named resource.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store row for one leased resource.
///
/// Exclusivity is decided at the store; instances only keep a cached view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub resource_name: String,
    pub holder_id: String,
    pub lease_end_time: DateTime<Utc>,
    pub period_sec: u64,
}

impl Lease {
    /// `lease_end_time` ちょうどの時点で期限切れ（終了時刻は排他的）
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_end_time <= now
    }
}

/// Input of one atomic acquire/renew attempt.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub resource_name: String,
    pub worker_id: String,
    pub allow_rebalance: bool,
    /// `false` makes the call a read-only check: nothing is written.
    pub is_running: bool,
    pub force_acquire: bool,
    pub lease_period: Duration,
}

impl AcquireRequest {
    pub fn new(
        resource_name: impl Into<String>,
        worker_id: impl Into<String>,
        lease_period: Duration,
    ) -> Self {
        Self {
            resource_name: resource_name.into(),
            worker_id: worker_id.into(),
            allow_rebalance: false,
            is_running: true,
            force_acquire: false,
            lease_period,
        }
    }

    pub fn with_rebalance(mut self, allow_rebalance: bool) -> Self {
        self.allow_rebalance = allow_rebalance;
        self
    }

    /// 現 holder の有効期限に関係なく取得する（運用操作用）
    pub fn forced(mut self) -> Self {
        self.force_acquire = true;
        self
    }

    /// 書き込まずに現在の holder だけを返す
    pub fn check_only(mut self) -> Self {
        self.is_running = false;
        self
    }
}

/// Result of an acquire attempt. `acquired == false` is a normal skip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireOutcome {
    /// New lease end when acquired, otherwise the current holder's end (if any).
    pub lease_end_time: Option<DateTime<Utc>>,
    pub acquired: bool,
    pub current_holder: Option<String>,
}

impl AcquireOutcome {
    pub fn acquired(lease_end_time: DateTime<Utc>, holder: impl Into<String>) -> Self {
        Self {
            lease_end_time: Some(lease_end_time),
            acquired: true,
            current_holder: Some(holder.into()),
        }
    }

    /// 取得できなかった。`current` があればその holder と期限を返す
    pub fn rejected(current: Option<&Lease>) -> Self {
        Self {
            lease_end_time: current.map(|l| l.lease_end_time),
            acquired: false,
            current_holder: current.map(|l| l.holder_id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn lease_expires_at_its_end_time() {
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 20).unwrap();
        let lease = Lease {
            resource_name: "Defrag".into(),
            holder_id: "a".into(),
            lease_end_time: end,
            period_sec: 20,
        };
        assert!(!lease.is_expired_at(end - chrono::Duration::seconds(1)));
        assert!(lease.is_expired_at(end));
    }

    #[test]
    fn request_builders_set_flags() {
        let req = AcquireRequest::new("Defrag", "a", Duration::from_secs(20))
            .with_rebalance(true)
            .forced()
            .check_only();
        assert!(req.allow_rebalance);
        assert!(req.force_acquire);
        assert!(!req.is_running);
    }
}
