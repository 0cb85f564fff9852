//! App - アプリケーション層
//!
//! ports を組み合わせて watchdog scheduler を実装する。
//!
//! # 主要コンポーネント
//! - **PeriodicRunner**: jitter 付き・重なりなしの定期実行
//! - **LeaseManager**: 名前付き lease の取得・更新と holder 判定
//! - **WatchdogRunner**: 上の 2 つ + store の設定行（lease holder だけが body を実行）
//! - **WorkerPool / FanOutCoordinator**: heartbeat 付きのジョブ実行と coordinator/worker fan-out
//! - **TransactionVisibilityCoordinator**: 可視性 watermark W と stuck transaction の回収
//! - **LogCursor**: W までの committed transaction を順に処理する consumer
//! - **WardenBuilder**: 1 instance 分の watchdog 群のワイヤリング

pub mod builder;
pub mod config;
pub mod defrag;
pub mod fanout;
pub mod lease_manager;
pub mod log_consumer;
pub mod periodic;
pub mod visibility;
pub mod watchdog;
pub mod worker_pool;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, WardenBuilder, WardenInstance};
pub use self::config::{WardenConfig, WatchdogSettings};
pub use self::defrag::{DefragWatchdog, LoggingUnitHandler};
pub use self::fanout::{FanOutCoordinator, FanOutOutcome, UnitPlanner};
pub use self::lease_manager::LeaseManager;
pub use self::log_consumer::{
    InvisibleHistoryCleanupWatchdog, LogCursor, SubscriptionDispatchWatchdog, TransactionConsumer,
};
pub use self::periodic::{PeriodicBody, PeriodicRunner, RunnerState};
pub use self::visibility::{TransactionVisibilityCoordinator, TransactionWatchdog, VisibilityReport};
pub use self::watchdog::{TickOutcome, Watchdog, WatchdogHandle, WatchdogRunner, WatchdogStatus};
pub use self::worker_pool::{JobHandler, PoolReport, WorkerPool};
