//! ConfigStore port - store 上の名前付き設定
//!
//! 再デプロイなしで外部から書き換えられる値。watchdog は毎 tick 読み直す。

use async_trait::async_trait;

use crate::domain::{ConfigParameter, ConfigValue, Result};

/// 名前付き設定行の読み書き。行は外部（運用者）からも書き換えられる
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Inserts the row unless one with the same id exists. Returns whether it inserted.
    async fn insert_parameter_if_absent(&self, parameter: &ConfigParameter) -> Result<bool>;

    async fn get_parameter(&self, id: &str) -> Result<Option<ConfigValue>>;

    /// 上書き（upsert）
    async fn set_parameter(&self, parameter: &ConfigParameter) -> Result<()>;
}
