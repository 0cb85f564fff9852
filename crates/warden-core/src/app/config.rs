//! WardenConfig - process-level settings, loaded from TOML.
//!
//! Per-tick tunables (period, lease period, enabled) live in the store as
//! `ConfigParameter` rows; the values here are only the defaults those rows
//! are bootstrapped with.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::domain::{config_seconds, Result, WardenError, MAX_CONFIG_SECONDS};
use crate::impls::RetryPolicy;

/// プロセス単位の設定（TOML）。store 上の設定行とは別物で、起動時に一度だけ読む
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WardenConfig {
    /// Prefix of every worker id this process hands out.
    pub instance_name: String,
    pub lease_timeout_factor: f64,
    pub worker_pool_size: usize,
    pub heartbeat_timeout_sec: u64,
    /// Multiple of the transaction watchdog period after which an open
    /// transaction counts as stuck.
    pub stuck_transaction_factor: f64,
    pub store_retry: StoreRetryConfig,
    pub watchdogs: BTreeMap<String, WatchdogConfig>,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            instance_name: "warden".to_string(),
            lease_timeout_factor: 0.25,
            worker_pool_size: 4,
            heartbeat_timeout_sec: 600,
            stuck_transaction_factor: 6.0,
            store_retry: StoreRetryConfig::default(),
            watchdogs: BTreeMap::new(),
        }
    }
}

/// store 呼び出しのリトライ設定
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreRetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for StoreRetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            max_attempts: policy.max_attempts,
        }
    }
}

impl StoreRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_attempts: self.max_attempts,
        }
    }
}

/// Overrides for one watchdog; unset fields fall back to the watchdog's own defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchdogConfig {
    pub period_sec: Option<f64>,
    pub lease_period_sec: Option<f64>,
    pub allow_rebalance: bool,
    pub enabled: Option<bool>,
}

/// Effective settings after merging overrides with a watchdog's defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchdogSettings {
    pub period: Duration,
    pub lease_period: Duration,
    pub allow_rebalance: bool,
    pub enabled: bool,
}

impl WardenConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| WardenError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| WardenError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// 範囲外の値は起動時に弾く（秒数は [`MAX_CONFIG_SECONDS`] まで）
    pub fn validate(&self) -> Result<()> {
        if !(self.lease_timeout_factor > 0.0 && self.lease_timeout_factor < 1.0) {
            return Err(WardenError::Config(format!(
                "lease_timeout_factor must be in (0, 1), got {}",
                self.lease_timeout_factor
            )));
        }
        if self.worker_pool_size == 0 {
            return Err(WardenError::Config("worker_pool_size must be > 0".into()));
        }
        if config_seconds(self.heartbeat_timeout_sec as f64).is_none() {
            return Err(WardenError::Config(format!(
                "heartbeat_timeout_sec must be in (0, {MAX_CONFIG_SECONDS}], got {}",
                self.heartbeat_timeout_sec
            )));
        }
        if !(self.stuck_transaction_factor.is_finite() && self.stuck_transaction_factor > 0.0) {
            return Err(WardenError::Config(
                "stuck_transaction_factor must be > 0".into(),
            ));
        }
        if self.store_retry.max_attempts == 0 {
            return Err(WardenError::Config("store_retry.max_attempts must be > 0".into()));
        }
        for (name, wd) in &self.watchdogs {
            for (field, value) in [
                ("period_sec", wd.period_sec),
                ("lease_period_sec", wd.lease_period_sec),
            ] {
                match value {
                    Some(v) if config_seconds(v).is_none() => {
                        return Err(WardenError::Config(format!(
                            "watchdogs.{name}.{field} must be in (0, {MAX_CONFIG_SECONDS}], got {v}"
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_sec)
    }

    /// Settings for `name`, using the given defaults where nothing is configured.
    pub fn watchdog(
        &self,
        name: &str,
        default_period: Duration,
        default_lease_period: Duration,
    ) -> WatchdogSettings {
        let overrides = self.watchdogs.get(name).cloned().unwrap_or_default();
        WatchdogSettings {
            period: overrides
                .period_sec
                .and_then(config_seconds)
                .unwrap_or(default_period),
            lease_period: overrides
                .lease_period_sec
                .and_then(config_seconds)
                .unwrap_or(default_lease_period),
            allow_rebalance: overrides.allow_rebalance,
            enabled: overrides.enabled.unwrap_or(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_document_gives_defaults() {
        let config = WardenConfig::from_toml_str("").unwrap();
        assert_eq!(config, WardenConfig::default());
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.lease_timeout_factor, 0.25);
    }

    #[test]
    fn watchdog_table_overrides_defaults() {
        let config = WardenConfig::from_toml_str(
            r#"
            instance_name = "node-a"

            [store_retry]
            max_attempts = 3

            [watchdogs.Defrag]
            period_sec = 5
            lease_period_sec = 20
            allow_rebalance = true
            "#,
        )
        .unwrap();

        let defrag = config.watchdog("Defrag", Duration::from_secs(60), Duration::from_secs(90));
        assert_eq!(defrag.period, Duration::from_secs(5));
        assert_eq!(defrag.lease_period, Duration::from_secs(20));
        assert!(defrag.allow_rebalance);
        assert!(defrag.enabled);
        assert_eq!(config.store_retry.policy().max_attempts, 3);

        let other = config.watchdog("Stats", Duration::from_secs(60), Duration::from_secs(90));
        assert_eq!(other.period, Duration::from_secs(60));
    }

    #[rstest]
    #[case::factor_zero("lease_timeout_factor = 0.0")]
    #[case::factor_one("lease_timeout_factor = 1.0")]
    #[case::empty_pool("worker_pool_size = 0")]
    #[case::negative_period("[watchdogs.Defrag]\nperiod_sec = -1")]
    #[case::huge_period("[watchdogs.Defrag]\nperiod_sec = 1e30")]
    #[case::huge_lease("[watchdogs.Defrag]\nlease_period_sec = 1e300")]
    #[case::nan_factor("stuck_transaction_factor = nan")]
    #[case::huge_heartbeat("heartbeat_timeout_sec = 99999999999")]
    #[case::unknown_field("lease_timeout = 3")]
    fn invalid_documents_are_rejected(#[case] doc: &str) {
        let err = WardenConfig::from_toml_str(doc).unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }
}
