//! warden-core
//!
//! Lease で守られた watchdog scheduler の中核。複数 instance が同じ
//! coordination store を共有し、各 watchdog の body は lease holder の
//! instance だけが実行する。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, lease, job, config, transaction, errors）
//! - **ports**: store への抽象化レイヤー（LeaseStore, ConfigStore, JobQueueClient, StoreClient, Clock）
//! - **impls**: 実装（InMemoryCoordinationStore, RetryingStore）
//! - **app**: アプリケーションロジック（periodic, lease_manager, watchdog, worker_pool, visibility, log_consumer）

pub mod domain;
pub mod ports;
pub mod impls;
pub mod app;
