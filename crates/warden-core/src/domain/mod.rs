//! Domain model (ids, leases, jobs, config rows, transactions, errors).
//!
//! ここには副作用のないデータ型だけを置く。store への操作は ports、
//! ループやプロトコルは app に置く。

pub mod config;
pub mod errors;
pub mod ids;
pub mod job;
pub mod lease;
pub mod transaction;

pub use config::{config_seconds, parameter_id, ConfigParameter, ConfigValue, MAX_CONFIG_SECONDS};
pub use errors::{ErrorKind, Result, WardenError};
pub use ids::{GroupId, JobId, TransactionId};
pub use job::{JobCounts, JobRecord, JobStatus, QueueType};
pub use lease::{AcquireOutcome, AcquireRequest, Lease};
pub use transaction::{
    EventLogEntry, EventStatus, ResourceRecord, ResourceWrite, TransactionRecord,
};
