//! LeaseStore port - 排他 lease の正本
//!
//! Lease の権威は store にある。instance 側のキャッシュは楽観的なビューに過ぎない。

use async_trait::async_trait;

use crate::domain::{AcquireOutcome, AcquireRequest, Lease, Result};

/// lease 行への原子的な操作
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// One atomic read-decide-write on the lease row.
    ///
    /// The caller gets the lease when it is free or expired, when the caller
    /// already holds it (renewal), when `force_acquire` is set, or when
    /// `allow_rebalance` is set and the caller wins the rebalance priority.
    /// `is_running == false` only reports the current holder.
    async fn try_acquire_lease(&self, request: &AcquireRequest) -> Result<AcquireOutcome>;

    async fn get_lease(&self, resource_name: &str) -> Result<Option<Lease>>;
}
