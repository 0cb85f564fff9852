//! Named configuration parameters kept in the coordination store.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 秒数で表す設定値の上限（1 年）。これを超える行は壊れた値として扱う。
pub const MAX_CONFIG_SECONDS: f64 = 365.0 * 24.0 * 3600.0;

/// Value of a parameter row. Exactly one column is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ConfigValue {
    Number(f64),
    String(String),
    Bigint(i64),
}

impl ConfigValue {
    /// 数値列として読む。Bigint 列も f64 に広げて返す
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ConfigValue::Number(v) => Some(*v),
            ConfigValue::Bigint(v) => Some(*v as f64),
            ConfigValue::String(_) => None,
        }
    }

    /// 整数列として読む。Number 列は小数部を切り捨てる
    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            ConfigValue::Bigint(v) => Some(*v),
            ConfigValue::Number(v) => Some(*v as i64),
            ConfigValue::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(v) => Some(v),
            _ => None,
        }
    }
}

/// 設定テーブルの 1 行（`<watchdog>.<suffix>` をキーにする）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigParameter {
    pub id: String,
    pub value: ConfigValue,
}

impl ConfigParameter {
    pub fn new(id: impl Into<String>, value: ConfigValue) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }

    pub fn number(id: impl Into<String>, value: f64) -> Self {
        Self::new(id, ConfigValue::Number(value))
    }

    pub fn bigint(id: impl Into<String>, value: i64) -> Self {
        Self::new(id, ConfigValue::Bigint(value))
    }
}

/// `<watchdog>.<suffix>` row id.
pub fn parameter_id(namespace: &str, suffix: &str) -> String {
    format!("{namespace}.{suffix}")
}

/// 秒数の設定値を `Duration` にする。
///
/// 正の有限値で [`MAX_CONFIG_SECONDS`] 以下のときだけ `Some`。NaN は `None`。
pub fn config_seconds(secs: f64) -> Option<Duration> {
    if !(secs > 0.0 && secs <= MAX_CONFIG_SECONDS) {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}
