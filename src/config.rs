use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};
use crate::interval::Interval;

/// Main configuration for the billing engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub billing: BillingConfig,
    pub logging: LoggingConfig,
}

/// Settlement and sweep policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BillingConfig {
    /// Ordered retry delays applied after failed settlement attempts.
    ///
    /// An invoice whose `attempts_made` exceeds the table length has its
    /// subscription deactivated instead of being retried again.
    #[serde(default = "default_retry_delays")]
    pub retry_delays: Vec<Interval>,

    /// Age past which a transaction still pending is reported as stalled.
    #[serde(default = "default_stalled_after")]
    pub stalled_after: Interval,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            billing: BillingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            retry_delays: default_retry_delays(),
            stalled_after: default_stalled_after(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

fn default_retry_delays() -> Vec<Interval> {
    vec![Interval::DAY, Interval::days(3), Interval::days(7)]
}

fn default_stalled_after() -> Interval {
    Interval::DAY
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("REBILL_{}", name)).ok()
}

/// Builder for [`Config`] with environment variable support.
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    /// Replace the settlement retry-delay table.
    pub fn with_retry_delays(mut self, delays: Vec<Interval>) -> Self {
        self.config.billing.retry_delays = delays;
        self
    }

    /// Set the stalled-transaction reporting cutoff.
    pub fn with_stalled_after(mut self, age: Interval) -> Self {
        self.config.billing.stalled_after = age;
        self
    }

    /// Load configuration from environment variables with the REBILL_ prefix.
    ///
    /// `REBILL_RETRY_DELAYS` is a comma-separated list of compact intervals,
    /// e.g. `"1d,3d,7d"`. Unparseable values are left at their defaults and
    /// caught by `build()` validation where relevant.
    pub fn from_env(mut self) -> Self {
        if let Some(level) = env_var("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = env_var("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }
        if let Some(delays) = env_var("RETRY_DELAYS") {
            let parsed: Vec<Interval> = delays
                .split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect();
            if !parsed.is_empty() {
                self.config.billing.retry_delays = parsed;
            }
        }
        if let Some(age) = env_var("STALLED_AFTER") {
            if let Ok(interval) = age.parse() {
                self.config.billing.stalled_after = interval;
            }
        }
        self
    }

    /// Build the configuration, validating all settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the log level is unknown, the retry-delay table is
    /// empty or contains a zero delay, or the stalled cutoff is zero.
    pub fn build(self) -> Result<Config> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(BillingError::validation(format!(
                "invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        if self.config.billing.retry_delays.is_empty() {
            return Err(BillingError::validation(
                "retry delay table must not be empty",
            ));
        }
        if self.config.billing.retry_delays.iter().any(Interval::is_zero) {
            return Err(BillingError::bad_interval(
                "retry delays must not contain a zero interval",
            ));
        }
        if self.config.billing.stalled_after.is_zero() {
            return Err(BillingError::bad_interval(
                "stalled_after must not be zero",
            ));
        }

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_table() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(
            config.billing.retry_delays,
            vec![Interval::days(1), Interval::days(3), Interval::days(7)]
        );
        assert_eq!(config.billing.stalled_after, Interval::DAY);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_builder_overrides() {
        let config = ConfigBuilder::new()
            .with_log_level("debug")
            .with_json_logging(true)
            .with_retry_delays(vec![Interval::hours(1)])
            .with_stalled_after(Interval::hours(6))
            .build()
            .unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.billing.retry_delays, vec![Interval::hours(1)]);
        assert_eq!(config.billing.stalled_after, Interval::hours(6));
    }

    #[test]
    fn test_deserializes_with_field_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "billing": { "retry_delays": [{ "days": 2 }, { "weeks": 1 }] },
                "logging": { "level": "debug" }
            }"#,
        )
        .unwrap();
        assert_eq!(
            config.billing.retry_delays,
            vec![Interval::days(2), Interval::WEEK]
        );
        assert_eq!(config.billing.stalled_after, Interval::DAY);
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_build_rejects_invalid_settings() {
        assert!(ConfigBuilder::new().with_log_level("noisy").build().is_err());
        assert!(ConfigBuilder::new()
            .with_retry_delays(vec![])
            .build()
            .is_err());
        assert!(ConfigBuilder::new()
            .with_retry_delays(vec![Interval::NONE])
            .build()
            .is_err());
        assert!(ConfigBuilder::new()
            .with_stalled_after(Interval::NONE)
            .build()
            .is_err());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: Config = serde_json::from_str(r#"{"billing": {}, "logging": {}}"#).unwrap();
        assert_eq!(config.billing.retry_delays.len(), 3);
        assert_eq!(config.logging.level, "info");
    }
}
