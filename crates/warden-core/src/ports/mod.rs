//! Ports - 抽象化レイヤー
//!
//! 各 trait は共有 coordination store へのインターフェース。lease・ジョブ・設定・
//! トランザクションの状態はすべて store が正本で、instance 同士は store 以外で通信しない。

pub mod clock;
pub mod config_store;
pub mod id_generator;
pub mod job_queue;
pub mod lease_store;
pub mod store_client;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::config_store::ConfigStore;
pub use self::id_generator::{IdGenerator, TransactionIdGenerator, UlidGenerator};
pub use self::job_queue::{JobQueueClient, KeepAlive};
pub use self::lease_store::LeaseStore;
pub use self::store_client::StoreClient;

/// Everything a watchdog needs from the coordination store.
pub trait CoordinationStore: LeaseStore + ConfigStore + JobQueueClient + StoreClient {}

impl<T: LeaseStore + ConfigStore + JobQueueClient + StoreClient> CoordinationStore for T {}
