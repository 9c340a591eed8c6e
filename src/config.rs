//! Configuration management for Bucketgate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GateError, Result};
use crate::ratelimit::{AttachPolicy, CustomRateLimitConfig, HeaderScheme, LimiterSettings};

/// Prefix of environment variables that override file configuration.
pub const ENV_PREFIX: &str = "BUCKETGATE";

/// Main configuration for Bucketgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Rate limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Load simulation configuration
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Margin added to header-derived reset times, in milliseconds
    #[serde(default = "default_safety_margin")]
    pub safety_margin_ms: u64,

    /// Priority between overlapping custom rate limit suffixes
    #[serde(default)]
    pub attach_policy: AttachPolicy,

    /// Response header names
    #[serde(default)]
    pub headers: HeaderScheme,

    /// Custom rate limits, first match wins
    #[serde(default)]
    pub custom_rate_limits: Vec<CustomRateLimitConfig>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            safety_margin_ms: default_safety_margin(),
            attach_policy: AttachPolicy::default(),
            headers: HeaderScheme::default(),
            custom_rate_limits: Vec::new(),
        }
    }
}

fn default_safety_margin() -> u64 {
    250
}

impl LimiterConfig {
    /// Check every custom rate limit.
    pub fn validate(&self) -> Result<()> {
        for rule in &self.custom_rate_limits {
            rule.validate()?;
        }
        Ok(())
    }
}

impl From<&LimiterConfig> for LimiterSettings {
    fn from(config: &LimiterConfig) -> Self {
        Self {
            headers: config.headers.clone(),
            safety_margin: Duration::from_millis(config.safety_margin_ms),
            attach_policy: config.attach_policy,
            custom_rate_limits: config.custom_rate_limits.clone(),
        }
    }
}

/// Settings for the `simulate` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Bucket keys requests are spread over
    #[serde(default = "default_keys")]
    pub keys: Vec<String>,

    /// Total requests to send
    #[serde(default = "default_requests")]
    pub requests: usize,

    /// Concurrent senders
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Requests the fake server allows per key and window
    #[serde(default = "default_server_quota")]
    pub server_quota: i64,

    /// Fake server window length in milliseconds
    #[serde(default = "default_window")]
    pub window_ms: u64,

    /// Simulated round trip time in milliseconds
    #[serde(default = "default_latency")]
    pub latency_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            keys: default_keys(),
            requests: default_requests(),
            concurrency: default_concurrency(),
            server_quota: default_server_quota(),
            window_ms: default_window(),
            latency_ms: default_latency(),
        }
    }
}

fn default_keys() -> Vec<String> {
    vec![
        "channels/1/messages".to_string(),
        "channels/2/messages".to_string(),
    ]
}

fn default_requests() -> usize {
    20
}

fn default_concurrency() -> usize {
    4
}

fn default_server_quota() -> i64 {
    5
}

fn default_window() -> u64 {
    1000
}

fn default_latency() -> u64 {
    20
}

impl GateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, overridden by environment
    /// variables such as `BUCKETGATE__LIMITER__SAFETY_MARGIN_MS`.
    pub fn load(path: Option<&str>, env_prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let config: GateConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()?;
        if self.simulation.concurrency == 0 {
            return Err(GateError::Config(
                "simulation concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GateConfig::default();
        assert_eq!(config.limiter.safety_margin_ms, 250);
        assert_eq!(config.limiter.attach_policy, AttachPolicy::LastWins);
        assert!(config.limiter.custom_rate_limits.is_empty());
        assert_eq!(config.simulation.concurrency, 4);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
limiter:
  safety_margin_ms: 500
  attach_policy: first_registered
  headers:
    remaining: X-Quota-Remaining
  custom_rate_limits:
    - suffix: "//reactions//"
      requests: 1
      reset_ms: 250
"#;
        let config = GateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.safety_margin_ms, 500);
        assert_eq!(config.limiter.attach_policy, AttachPolicy::FirstRegistered);
        assert_eq!(config.limiter.headers.remaining, "X-Quota-Remaining");
        assert_eq!(config.limiter.headers.reset, "X-RateLimit-Reset");
        assert_eq!(config.limiter.custom_rate_limits[0].suffix, "//reactions//");

        let settings = LimiterSettings::from(&config.limiter);
        assert_eq!(settings.safety_margin, Duration::from_millis(500));
        assert_eq!(settings.custom_rate_limits.len(), 1);
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let yaml = r#"
limiter:
  custom_rate_limits:
    - suffix: "/typing"
      requests: 0
      reset_ms: 1000
"#;
        assert!(matches!(
            GateConfig::from_yaml(yaml),
            Err(GateError::Config(_))
        ));
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            GateConfig::from_yaml("limiter: [unclosed"),
            Err(GateError::Config(_))
        ));
    }

    #[test]
    fn test_load_file_with_env_override() {
        let path = std::env::temp_dir().join(format!(
            "bucketgate-config-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "limiter:\n  safety_margin_ms: 100\nsimulation:\n  requests: 7\n",
        )
        .unwrap();

        std::env::set_var("BUCKETGATE_CONFIG_TEST__SIMULATION__REQUESTS", "9");
        let config = GateConfig::load(path.to_str(), "BUCKETGATE_CONFIG_TEST").unwrap();
        std::env::remove_var("BUCKETGATE_CONFIG_TEST__SIMULATION__REQUESTS");
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.limiter.safety_margin_ms, 100);
        assert_eq!(config.simulation.requests, 9);
    }

    #[test]
    fn test_from_missing_file() {
        assert!(matches!(
            GateConfig::from_file("/nonexistent/bucketgate.yaml"),
            Err(GateError::Io(_))
        ));
    }
}
