use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("invalid global config value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    #[default]
    RoundRobin,
    FillFirst,
}

/// Behavior when a credential hits an upstream quota limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct QuotaBehavior {
    /// Retry the request on a sibling credential.
    pub switch_project: bool,
    /// When all credentials for the model are exhausted, retry a preview
    /// sibling of the requested model.
    pub switch_preview_model: bool,
}

impl Default for QuotaBehavior {
    fn default() -> Self {
        Self {
            switch_project: true,
            switch_preview_model: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RoutingConfig {
    pub strategy: RoutingStrategy,
    pub quota_exceeded: QuotaBehavior,
    /// Upstream attempts per request for transient failures.
    pub request_retry: u32,
    /// Cap on the sleep between retry attempts, seconds.
    pub max_retry_interval: u64,
    /// Model classes tried, in order, when a caller asks for exactly "auto".
    pub auto_preference: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::default(),
            quota_exceeded: QuotaBehavior::default(),
            request_retry: 3,
            max_retry_interval: 30,
            auto_preference: vec![
                "gemini-2.5-pro".to_string(),
                "claude-sonnet-4-5".to_string(),
                "gpt-5".to_string(),
            ],
        }
    }
}

impl RoutingConfig {
    pub fn max_retry_interval_duration(&self) -> Duration {
        Duration::from_secs(self.max_retry_interval)
    }
}

/// Knobs for the per-credential rate limiter. All durations in milliseconds
/// except the daily cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RateLimitConfig {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub daily_max_requests: u32,
    pub jitter_percent: f64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub suspend_cooldown_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1_000,
            max_interval_ms: 2_000,
            daily_max_requests: 500,
            jitter_percent: 0.3,
            backoff_base_ms: 30_000,
            backoff_max_ms: 300_000,
            backoff_multiplier: 1.5,
            suspend_cooldown_ms: 3_600_000,
        }
    }
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Directory holding one JSON file per persisted credential.
    pub auth_dir: String,
    /// Inbound API keys accepted by the gateway.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Key guarding the /v0/management surface.
    pub management_key: Option<String>,
    /// Optional outbound proxy for upstream egress.
    pub proxy: Option<String>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub auth_dir: Option<String>,
    pub api_keys: Option<Vec<String>>,
    pub management_key: Option<String>,
    pub proxy: Option<String>,
    pub routing: Option<RoutingConfig>,
    pub rate_limit: Option<RateLimitConfig>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.auth_dir.is_some() {
            self.auth_dir = other.auth_dir;
        }
        if other.api_keys.is_some() {
            self.api_keys = other.api_keys;
        }
        if other.management_key.is_some() {
            self.management_key = other.management_key;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.routing.is_some() {
            self.routing = other.routing;
        }
        if other.rate_limit.is_some() {
            self.rate_limit = other.rate_limit;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let rate_limit = self.rate_limit.unwrap_or_default();
        if rate_limit.min_interval_ms > rate_limit.max_interval_ms {
            return Err(GlobalConfigError::InvalidValue {
                field: "rate-limit.min-interval-ms",
                message: "min interval exceeds max interval".to_string(),
            });
        }
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8317),
            auth_dir: self.auth_dir.ok_or(GlobalConfigError::MissingField("auth_dir"))?,
            api_keys: self.api_keys.unwrap_or_default(),
            management_key: self.management_key,
            proxy: self.proxy,
            routing: self.routing.unwrap_or_default(),
            rate_limit,
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            auth_dir: Some(value.auth_dir),
            api_keys: Some(value.api_keys),
            management_key: value.management_key,
            proxy: value.proxy,
            routing: Some(value.routing),
            rate_limit: Some(value.rate_limit),
        }
    }
}
