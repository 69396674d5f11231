// Engine configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::output::errors::{BatchError, Result};

/// Tunables shared by the pool, retry policy and coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// TCP connect + handshake timeout
    pub connect_timeout_secs: u64,
    /// Sessions opened per distinct fingerprint; further callers wait for one
    pub max_sessions_per_host: usize,
    /// Idle sessions older than this are closed by the reaper
    pub idle_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    /// Exponential base applied between retries
    pub backoff_multiplier: f64,
    /// Upper bound on a single backoff wait
    pub max_retry_delay_secs: u64,
    /// Cap on concurrently dispatched hosts in parallel mode; unset means
    /// every host is dispatched at once
    pub max_parallel_hosts: Option<usize>,
    /// Username used when the inventory does not name one
    pub default_user: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            connect_timeout_secs: 30,
            max_sessions_per_host: 5,
            idle_timeout_secs: 300,
            reaper_interval_secs: 60,
            backoff_multiplier: 1.5,
            max_retry_delay_secs: 600,
            max_parallel_hosts: None,
            default_user: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a YAML file; missing keys take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| BatchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)
            .map_err(|e| BatchError::Config(format!("Invalid config YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sessions_per_host == 0 {
            return Err(BatchError::Config(
                "max_sessions_per_host must be at least 1".into(),
            ));
        }
        if !(self.backoff_multiplier >= 1.0 && self.backoff_multiplier.is_finite()) {
            return Err(BatchError::Config(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_parallel_hosts == Some(0) {
            return Err(BatchError::Config("max_parallel_hosts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_max_sessions_per_host(mut self, max: usize) -> Self {
        self.max_sessions_per_host = max;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_max_parallel_hosts(mut self, max: usize) -> Self {
        self.max_parallel_hosts = Some(max);
        self
    }

    pub fn with_default_user(mut self, user: String) -> Self {
        self.default_user = Some(user);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.backoff_multiplier, 1.5);
        assert_eq!(config.max_parallel_hosts, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml("max_parallel_hosts: 8\nidle_timeout_secs: 30\n").unwrap();
        assert_eq!(config.max_parallel_hosts, Some(8));
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.connect_timeout_secs, 30);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(EngineConfig::from_yaml("backoff_multiplier: 0.5\n").is_err());
        assert!(EngineConfig::from_yaml("max_sessions_per_host: 0\n").is_err());
        assert!(EngineConfig::from_yaml("no_such_key: 1\n").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_user: deploy").unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.default_user.as_deref(), Some("deploy"));
    }
}
