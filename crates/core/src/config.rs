//! Session configuration
//!
//! Loaded from `huddle.toml`. Every field is optional; missing fields fall
//! back to the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Config file name inside the platform config directory
pub const CONFIG_FILE: &str = "huddle.toml";

/// Timeouts, retry budgets and housekeeping intervals for a room session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long to wait for the rendezvous identity claim
    pub election_timeout_ms: u64,
    /// Per-attempt wait for the hub channel to open
    pub hub_join_timeout_ms: u64,
    /// Total attempts to reach the hub
    pub hub_join_attempts: u32,
    /// Backoff base between hub attempts
    pub hub_join_base_delay_ms: u64,
    /// Automatic reconnects per peer after transient failures
    pub peer_max_retries: u32,
    /// Backoff base between peer reconnects
    pub peer_retry_base_delay_ms: u64,
    /// PING interval on mesh channels (0 disables)
    pub heartbeat_interval_ms: u64,
    /// Seconds alone in a room before the idle notice (0 disables)
    pub idle_timeout_secs: u64,
    /// Relay broker used by the TCP transport
    pub broker_addr: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: 5000,
            hub_join_timeout_ms: 15000,
            hub_join_attempts: 3,
            hub_join_base_delay_ms: 1000,
            peer_max_retries: 3,
            peer_retry_base_delay_ms: 1000,
            heartbeat_interval_ms: 10000,
            idle_timeout_secs: 600,
            broker_addr: "127.0.0.1:7331".to_string(),
        }
    }
}

impl SessionConfig {
    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: SessionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load from the platform config directory
    pub fn load_default() -> Result<Self> {
        match default_config_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.hub_join_attempts == 0 {
            return Err(Error::Config("hub_join_attempts must be at least 1".into()));
        }
        if self.election_timeout_ms == 0 || self.hub_join_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn hub_join_timeout(&self) -> Duration {
        Duration::from_millis(self.hub_join_timeout_ms)
    }

    pub fn hub_join_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.hub_join_attempts, self.hub_join_base_delay_ms)
    }

    pub fn peer_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.peer_max_retries, self.peer_retry_base_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// `<config dir>/huddle.toml` for the current platform
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("dev", "huddle", "huddle").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

/// Bounded exponential backoff: delay k is `base * 2^k`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts (hub join) or retries (peer links), depending on the caller
    pub limit: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(limit: u32, base_delay_ms: u64) -> Self {
        Self {
            limit,
            base_delay_ms,
        }
    }

    /// Delay before retry number `k` (zero-based)
    pub fn delay(&self, k: u32) -> Duration {
        let factor = 1u64.checked_shl(k).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.election_timeout(), Duration::from_secs(5));
        assert_eq!(config.hub_join_attempts, 3);
        assert_eq!(config.peer_max_retries, 3);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_partial_toml() {
        let config = SessionConfig::from_toml(
            r#"
            hub_join_timeout_ms = 20000
            heartbeat_interval_ms = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.hub_join_timeout(), Duration::from_secs(20));
        assert_eq!(config.heartbeat_interval(), None);
        assert_eq!(config.peer_retry_base_delay_ms, 1000);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(SessionConfig::from_toml("hub_join_attempts = \"three\"").is_err());
        assert!(SessionConfig::from_toml("hub_join_attempts = 0").is_err());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let missing = SessionConfig::load(&path).unwrap();
        assert_eq!(missing, SessionConfig::default());

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "broker_addr = \"10.0.0.2:9000\"").unwrap();
        let loaded = SessionConfig::load(&path).unwrap();
        assert_eq!(loaded.broker_addr, "10.0.0.2:9000");
    }

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy::new(3, 1000);
        assert_eq!(policy.delay(0), Duration::from_millis(1000));
        assert_eq!(policy.delay(1), Duration::from_millis(2000));
        assert_eq!(policy.delay(2), Duration::from_millis(4000));
        assert_eq!(policy.delay(70), Duration::from_millis(u64::MAX));
    }
}
