use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::utils::parse_duration_or_warn;

pub const DEFAULT_FOLLOW_DEPTH: u32 = 10;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Per-VU runtime settings shared by every VU a `Runner` creates.
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct RuntimeConfig {
    /// Maximum number of redirects followed per request (default: 10)
    #[serde(alias = "followDepth")]
    pub follow_depth: Option<u32>,
    /// Per-request timeout (e.g., "30s", "500ms"). Default: "60s". "0" disables the timeout.
    pub timeout: Option<String>,
    /// Maximum idle connections kept per host (default: unlimited)
    #[serde(alias = "maxIdlePerHost")]
    pub max_idle_per_host: Option<usize>,
    /// How long an idle pooled connection is kept (default: "90s")
    #[serde(alias = "poolIdleTimeout")]
    pub pool_idle_timeout: Option<String>,
    /// Read response bodies to completion but discard them instead of storing them.
    /// `response.body` is then an empty string.
    #[serde(alias = "responseSink")]
    pub response_sink: Option<bool>,
    /// User-Agent sent when the script does not set one (default: "volley/<version>")
    #[serde(alias = "userAgent")]
    pub user_agent: Option<String>,
    /// JavaScript heap limit per VU in bytes (default: unlimited)
    #[serde(alias = "memoryLimit")]
    pub memory_limit: Option<usize>,
    /// Tags attached to every sample emitted by the VU
    pub tags: Option<HashMap<String, String>>,
}

impl RuntimeConfig {
    pub fn follow_depth(&self) -> u32 {
        self.follow_depth.unwrap_or(DEFAULT_FOLLOW_DEPTH)
    }

    /// `None` when the timeout is disabled.
    pub fn timeout(&self) -> Option<Duration> {
        let timeout = match self.timeout.as_deref() {
            Some(s) => parse_duration_or_warn(s, DEFAULT_TIMEOUT, "timeout"),
            None => DEFAULT_TIMEOUT,
        };
        (!timeout.is_zero()).then_some(timeout)
    }

    pub fn max_idle_per_host(&self) -> usize {
        self.max_idle_per_host.unwrap_or(usize::MAX)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        match self.pool_idle_timeout.as_deref() {
            Some(s) => parse_duration_or_warn(s, DEFAULT_POOL_IDLE_TIMEOUT, "pool_idle_timeout"),
            None => DEFAULT_POOL_IDLE_TIMEOUT,
        }
    }

    pub fn response_sink(&self) -> bool {
        self.response_sink.unwrap_or(false)
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| concat!("volley/", env!("CARGO_PKG_VERSION")).to_string())
    }

    pub fn tags(&self) -> HashMap<String, String> {
        self.tags.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::schema_for;

    #[test]
    fn test_config_schema() {
        let schema = schema_for!(RuntimeConfig);
        let schema_json = serde_json::to_string(&schema).unwrap();
        assert!(schema_json.contains("follow_depth"));
        assert!(schema_json.contains("timeout"));
        assert!(schema_json.contains("max_idle_per_host"));
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.follow_depth(), 10);
        assert_eq!(config.timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.max_idle_per_host(), usize::MAX);
        assert_eq!(config.pool_idle_timeout(), Duration::from_secs(90));
        assert!(!config.response_sink());
        assert!(config.user_agent().starts_with("volley/"));
        assert!(config.tags().is_empty());
    }

    #[test]
    fn test_config_deserialize_yaml_camel_case() {
        let yaml = r#"
followDepth: 3
timeout: "5s"
maxIdlePerHost: 16
responseSink: true
userAgent: "probe/1.0"
tags:
  env: staging
"#;
        let config: RuntimeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.follow_depth(), 3);
        assert_eq!(config.timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.max_idle_per_host(), 16);
        assert!(config.response_sink());
        assert_eq!(config.user_agent(), "probe/1.0");
        assert_eq!(config.tags().get("env").map(String::as_str), Some("staging"));
    }

    #[test]
    fn test_config_deserialize_json_snake_case() {
        let json = r#"{"follow_depth": 0, "pool_idle_timeout": "1m", "memory_limit": 1048576}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.follow_depth(), 0);
        assert_eq!(config.pool_idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.memory_limit, Some(1_048_576));
    }

    #[test]
    fn test_zero_timeout_disables() {
        let config = RuntimeConfig {
            timeout: Some("0".to_string()),
            ..Default::default()
        };
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn test_invalid_timeout_uses_default() {
        let config = RuntimeConfig {
            timeout: Some("whenever".to_string()),
            ..Default::default()
        };
        assert_eq!(config.timeout(), Some(DEFAULT_TIMEOUT));
    }
}
