use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use thiserror::Error;

use crate::auth::AuthConfig;
use crate::gossip::{ForwardConfig, GossipConfig};
use crate::rate_limit::RateLimitConfig;
use crate::seen::DedupConfig;

/// Room for the relay JSON and the original's headers on top of the
/// hex-encoded body.
const RELAY_OVERHEAD_BYTES: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// File holding the hex Ed25519 seed this node signs with.
    pub signing_key_path: Option<PathBuf>,
    pub roster_path: Option<PathBuf>,
    pub roster_refresh_secs: u64,

    pub max_body_bytes: usize,
    /// Body limit on `/gossip`. Defaults to twice `max_body_bytes` plus
    /// relay overhead.
    pub max_gossip_body_bytes: Option<usize>,
    pub queue_capacity: usize,

    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub dedup: DedupConfig,
    pub gossip: GossipConfig,
    pub forward: ForwardConfig,

    // Graceful shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8091)),
            signing_key_path: None,
            roster_path: None,
            roster_refresh_secs: 300,
            max_body_bytes: 64 * 1024, // 64KB
            max_gossip_body_bytes: None,
            queue_capacity: 10_000,
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            dedup: DedupConfig::default(),
            gossip: GossipConfig::default(),
            forward: ForwardConfig::default(),
            shutdown_timeout_secs: 30,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
        Err(_) => Ok(None),
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = env_parse("VRELAY_BIND_ADDR")? {
            config.bind_addr = addr;
        }

        if let Ok(path) = std::env::var("VRELAY_SIGNING_KEY_PATH") {
            config.signing_key_path = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("VRELAY_ROSTER_PATH") {
            config.roster_path = Some(PathBuf::from(path));
        }

        if let Some(secs) = env_parse("VRELAY_ROSTER_REFRESH_SECS")? {
            config.roster_refresh_secs = secs;
        }

        if let Some(size) = env_parse("VRELAY_MAX_BODY_BYTES")? {
            config.max_body_bytes = size;
        }

        if let Some(size) = env_parse("VRELAY_MAX_GOSSIP_BODY_BYTES")? {
            config.max_gossip_body_bytes = Some(size);
        }

        if let Some(capacity) = env_parse("VRELAY_QUEUE_CAPACITY")? {
            config.queue_capacity = capacity;
        }

        if let Some(skew) = env_parse("VRELAY_ALLOWED_SKEW_MS")? {
            config.auth.allowed_skew_ms = skew;
        }

        if let Some(skew) = env_parse("VRELAY_MAX_FUTURE_SKEW_MS")? {
            config.auth.max_future_skew_ms = skew;
        }

        if let Some(required) = env_parse("VRELAY_REQUIRE_SECRET_BINDING")? {
            config.auth.require_secret_binding = required;
        }

        if let Some(base) = env_parse("VRELAY_RATE_LIMIT_BASE")? {
            config.rate_limit.base_limit = base;
        }

        if let Some(max) = env_parse("VRELAY_RATE_LIMIT_MAX")? {
            config.rate_limit.max_limit = max;
        }

        if let Some(ttl) = env_parse("VRELAY_DEDUP_TTL_SECS")? {
            config.dedup.ttl_secs = ttl;
        }

        if let Some(enabled) = env_parse("VRELAY_GOSSIP_ENABLED")? {
            config.gossip.enabled = enabled;
        }

        if let Some(timeout) = env_parse("VRELAY_GOSSIP_TIMEOUT_MS")? {
            config.gossip.timeout_ms = timeout;
        }

        if let Some(enabled) = env_parse("VRELAY_FORWARD_ENABLED")? {
            config.forward.enabled = enabled;
        }

        if let Some(secs) = env_parse("VRELAY_FORWARD_INTERVAL_SECS")? {
            config.forward.per_ip_interval_secs = secs;
        }

        Ok(config)
    }

    /// `VRELAY_CONFIG_PATH` if set, else defaults overridden by the environment.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var("VRELAY_CONFIG_PATH") {
            Ok(path) => Self::from_toml(path),
            Err(_) => Self::from_env(),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_toml(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.max_body_bytes == 0 {
            return invalid("max_body_bytes must be > 0");
        }

        if self.gossip_body_limit() < self.min_gossip_body_bytes() {
            return invalid("max_gossip_body_bytes must hold a relayed max_body_bytes submission");
        }

        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be > 0");
        }

        if self.rate_limit.base_limit == 0 {
            return invalid("rate_limit.base_limit must be > 0");
        }

        if self.rate_limit.max_limit < self.rate_limit.base_limit {
            return invalid("rate_limit.max_limit must be >= rate_limit.base_limit");
        }

        if self.rate_limit.reference_stake <= 1.0 || !self.rate_limit.reference_stake.is_finite() {
            return invalid("rate_limit.reference_stake must be > 1");
        }

        if self.rate_limit.window_secs == 0 || self.rate_limit.cleanup_interval_secs == 0 {
            return invalid("rate_limit window and cleanup interval must be > 0");
        }

        if self.dedup.ttl_secs == 0 || self.dedup.cleanup_interval_secs == 0 {
            return invalid("dedup ttl and cleanup interval must be > 0");
        }

        if self.gossip.timeout_ms == 0 {
            return invalid("gossip.timeout_ms must be > 0");
        }

        if self.forward.enabled && self.forward.per_ip_interval_secs == 0 {
            return invalid("forward.per_ip_interval_secs must be > 0");
        }

        if self.auth.gossip_inner_max_age_ms < self.auth.allowed_skew_ms {
            return invalid("auth.gossip_inner_max_age_ms must be >= auth.allowed_skew_ms");
        }

        if self.roster_path.is_some() && self.roster_refresh_secs == 0 {
            return invalid("roster_refresh_secs must be > 0");
        }

        Ok(())
    }

    /// A relay carries the original body hex-encoded, doubling its size.
    fn min_gossip_body_bytes(&self) -> usize {
        self.max_body_bytes
            .saturating_mul(2)
            .saturating_add(RELAY_OVERHEAD_BYTES)
    }

    pub fn gossip_body_limit(&self) -> usize {
        self.max_gossip_body_bytes
            .unwrap_or_else(|| self.min_gossip_body_bytes())
    }

    pub fn roster_refresh(&self) -> Duration {
        Duration::from_secs(self.roster_refresh_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.auth.allowed_skew_ms, 8_000);
        assert_eq!(config.rate_limit.base_limit, 10);
        assert_eq!(config.dedup.ttl_secs, 86_400);
        assert_eq!(config.gossip.timeout_ms, 5_000);
        assert_eq!(config.gossip_body_limit(), 2 * 64 * 1024 + 16 * 1024);
        assert!(config.forward.enabled);
        assert_eq!(config.forward.per_ip_interval_secs, 600);
    }

    #[test]
    fn test_gossip_body_limit_follows_submit_limit() {
        let mut config = ServerConfig::default();
        config.max_body_bytes = 1024 * 1024;
        assert_eq!(config.gossip_body_limit(), 2 * 1024 * 1024 + 16 * 1024);
        config.validate().unwrap();

        // an explicit limit too small to carry a relayed submission
        config.max_gossip_body_bytes = Some(config.max_body_bytes);
        assert!(config.validate().is_err());

        config.max_gossip_body_bytes = Some(4 * 1024 * 1024);
        assert_eq!(config.gossip_body_limit(), 4 * 1024 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ServerConfig::from_toml_str(
            r#"
bind_addr = "127.0.0.1:9000"
roster_path = "/etc/vrelay/roster.toml"

[rate_limit]
max_limit = 50

[gossip]
enabled = false
"#,
        )
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.rate_limit.max_limit, 50);
        assert_eq!(config.rate_limit.base_limit, 10);
        assert!(!config.gossip.enabled);
        assert_eq!(config.gossip.timeout_ms, 5_000);
        assert!(config.auth.require_secret_binding);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_inverted_limits() {
        let mut config = ServerConfig::default();
        config.rate_limit.max_limit = 5;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.auth.gossip_inner_max_age_ms = 1_000;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.forward.per_ip_interval_secs = 0;
        assert!(config.validate().is_err());
        config.forward.enabled = false;
        config.validate().unwrap();
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vrelay.toml");
        std::fs::write(&path, "queue_capacity = 12\n").unwrap();
        assert_eq!(ServerConfig::from_toml(&path).unwrap().queue_capacity, 12);
        assert!(ServerConfig::from_toml(dir.path().join("missing.toml")).is_err());
    }
}
