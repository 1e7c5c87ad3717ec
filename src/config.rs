use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the tunnelmon agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Session and traffic store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// How often every server's status file is read. Default: 60s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// History retention configuration.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Query pagination configuration.
    #[serde(default)]
    pub query: QueryConfig,

    /// Monitored servers. At least one is required.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// Session and traffic store configuration.
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. Default: "tunnelmon.db".
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// History retention configuration.
///
/// Traffic samples age out before sessions do; the session horizon bounds
/// the traffic horizon so per-identity rollups never rest on traffic history
/// that outlived its sessions.
#[derive(Debug, Deserialize)]
pub struct RetentionConfig {
    /// How long closed sessions are kept. Default: 90 days.
    #[serde(default = "default_sessions_retention", with = "humantime_serde")]
    pub sessions: Duration,

    /// How long traffic samples are kept. Default: 30 days.
    #[serde(default = "default_traffic_retention", with = "humantime_serde")]
    pub traffic: Duration,

    /// How often the retention sweep runs. Default: 24h.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

/// Pagination bounds for query accessors.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QueryConfig {
    /// Page size when the caller does not ask for one. Default: 50.
    #[serde(default = "default_query_limit")]
    pub default_limit: u32,

    /// Hard cap on requested page sizes. Default: 500.
    #[serde(default = "default_query_max_limit")]
    pub max_limit: u32,
}

/// One monitored concentrator.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server name used in stored rows, logs and metric labels.
    pub name: String,

    /// Path to the server's status file.
    pub status_file: PathBuf,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("tunnelmon.db")
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_sessions_retention() -> Duration {
    Duration::from_secs(90 * 24 * 60 * 60)
}

fn default_traffic_retention() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_query_limit() -> u32 {
    50
}

fn default_query_max_limit() -> u32 {
    500
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            store: StoreConfig::default(),
            health: HealthConfig::default(),
            poll_interval: default_poll_interval(),
            retention: RetentionConfig::default(),
            query: QueryConfig::default(),
            servers: Vec::new(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sessions: default_sessions_retention(),
            traffic: default_traffic_retention(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_query_limit(),
            max_limit: default_query_max_limit(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.store.path.as_os_str().is_empty() {
            bail!("store.path is required");
        }

        if self.poll_interval.is_zero() {
            bail!("poll_interval must be positive");
        }

        if self.retention.sessions.is_zero() {
            bail!("retention.sessions must be positive");
        }
        if self.retention.traffic.is_zero() {
            bail!("retention.traffic must be positive");
        }
        if self.retention.sweep_interval.is_zero() {
            bail!("retention.sweep_interval must be positive");
        }
        if self.retention.traffic > self.retention.sessions {
            bail!("retention.traffic must not exceed retention.sessions");
        }

        if self.query.default_limit == 0 {
            bail!("query.default_limit must be positive");
        }
        if self.query.default_limit > self.query.max_limit {
            bail!("query.default_limit must not exceed query.max_limit");
        }

        if self.servers.is_empty() {
            bail!("at least one server is required");
        }

        let mut names = HashSet::new();
        for (idx, server) in self.servers.iter().enumerate() {
            if server.name.is_empty() {
                bail!("servers[{idx}].name is required");
            }
            if server.status_file.as_os_str().is_empty() {
                bail!("servers[{idx}].status_file is required");
            }
            if !names.insert(server.name.as_str()) {
                bail!("duplicate server name: {}", server.name);
            }
        }

        Ok(())
    }
}
