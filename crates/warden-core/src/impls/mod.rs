//! Impls - port の実装
//!
//! # 含まれる実装
//! - **InMemoryCoordinationStore**: 開発・テスト用の coordination store（全 port を 1 つの Mutex で直列化）
//! - **RetryingStore**: TransientStore エラーを指数バックオフでリトライする decorator
//!
//! # 本番用実装
//! リレーショナル store を使う実装は別クレートに置く想定（port の signature だけに依存する）。

pub mod memory;
pub mod retrying;

pub use self::memory::InMemoryCoordinationStore;
pub use self::retrying::{with_retry, RetryPolicy, RetryingStore};
