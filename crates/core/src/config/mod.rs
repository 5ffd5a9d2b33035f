//! Scheduler configuration
//!
//! Load order:
//! 1. Built-in defaults ([`SchedulerConfig::default`])
//! 2. Optional TOML file
//! 3. Environment overrides with the `SINGLETON_` prefix, e.g.
//!    `SINGLETON_MAX_WAIT_TIME_POST_CANCEL_MS=5000`
//!
//! The result is validated before it is returned.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use ::config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Fallback when the store cannot report its session timeout.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Deployed version; scopes done markers so mixed-version clusters stay apart.
    pub service_version: String,
    pub default_group_name: String,
    pub default_group_capacity: usize,
    /// Upper bound for one cancellation cleanup attempt and for a blocked re-`schedule`.
    pub max_wait_time_post_cancel_ms: u64,
    pub cancel_check_interval_ms: u64,
    /// Period of the ownership reconcile loop.
    pub expiry_check_interval_ms: u64,
    /// Added to the session timeout before an expiry check runs.
    pub session_defer_margin_ms: u64,
    pub default_session_timeout_ms: u64,
    /// Non-positive disables weight publishing and balancing.
    pub weight_balance_period_ms: i64,
    pub weight_tolerance: u32,
    /// How long an owner waits for a stealer before reclaiming.
    pub steal_grace_ms: u64,
    /// Terminate the process on a confirmed session expiry.
    pub halt_on_store_lost: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            service_version: "1.0.0".to_string(),
            default_group_name: "default".to_string(),
            default_group_capacity: 4,
            max_wait_time_post_cancel_ms: 10_000,
            cancel_check_interval_ms: 100,
            expiry_check_interval_ms: 1_000,
            session_defer_margin_ms: 2_000,
            default_session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            weight_balance_period_ms: 0,
            weight_tolerance: 2,
            steal_grace_ms: 5_000,
            halt_on_store_lost: false,
        }
    }
}

impl SchedulerConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder()
            .add_source(ConfigBuilder::try_from(&Self::default()).context("加载默认配置失败")?);

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(Environment::with_prefix("SINGLETON").try_parsing(true));

        let config: SchedulerConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: SchedulerConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_version.trim().is_empty() {
            return Err(anyhow::anyhow!("service_version must not be empty"));
        }
        if self.service_version.contains('/') {
            return Err(anyhow::anyhow!(
                "service_version must not contain '/': {}",
                self.service_version
            ));
        }
        if self.default_group_name.trim().is_empty() {
            return Err(anyhow::anyhow!("default_group_name must not be empty"));
        }
        if self.default_group_capacity == 0 {
            return Err(anyhow::anyhow!("default_group_capacity must be greater than 0"));
        }
        if self.cancel_check_interval_ms == 0 {
            return Err(anyhow::anyhow!("cancel_check_interval_ms must be greater than 0"));
        }
        if self.expiry_check_interval_ms == 0 {
            return Err(anyhow::anyhow!("expiry_check_interval_ms must be greater than 0"));
        }
        if self.max_wait_time_post_cancel_ms == 0 {
            return Err(anyhow::anyhow!("max_wait_time_post_cancel_ms must be greater than 0"));
        }
        Ok(())
    }

    pub fn max_wait_time_post_cancel(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_post_cancel_ms)
    }

    pub fn cancel_check_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_check_interval_ms)
    }

    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_check_interval_ms)
    }

    pub fn session_defer_margin(&self) -> Duration {
        Duration::from_millis(self.session_defer_margin_ms)
    }

    pub fn default_session_timeout(&self) -> Duration {
        Duration::from_millis(self.default_session_timeout_ms)
    }

    pub fn steal_grace(&self) -> Duration {
        Duration::from_millis(self.steal_grace_ms)
    }

    /// `None` when balancing is disabled.
    pub fn weight_balance_period(&self) -> Option<Duration> {
        (self.weight_balance_period_ms > 0)
            .then(|| Duration::from_millis(self.weight_balance_period_ms as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_wait_time_post_cancel(), Duration::from_secs(10));
        assert_eq!(config.weight_balance_period(), None);
    }

    #[test]
    fn test_from_toml_overrides_defaults() {
        let config = SchedulerConfig::from_toml(
            r#"
            service_version = "25.1.0"
            default_group_capacity = 8
            weight_balance_period_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.service_version, "25.1.0");
        assert_eq!(config.default_group_capacity, 8);
        assert_eq!(config.default_group_name, "default");
        assert_eq!(config.weight_balance_period(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = SchedulerConfig::default();
        config.default_group_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.service_version = "a/b".to_string();
        assert!(config.validate().is_err());

        assert!(SchedulerConfig::from_toml("default_group_name = \"\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "service_version = \"2.0.0\"").unwrap();
        writeln!(file, "expiry_check_interval_ms = 250").unwrap();

        let config = SchedulerConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.service_version, "2.0.0");
        assert_eq!(config.expiry_check_interval(), Duration::from_millis(250));
        assert_eq!(config.steal_grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(SchedulerConfig::load(Some("/nonexistent/singleton.toml")).is_err());
    }

    #[test]
    fn test_toml_round_trip_preserves_values() {
        let mut config = SchedulerConfig::default();
        config.halt_on_store_lost = true;
        let parsed = SchedulerConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }
}
