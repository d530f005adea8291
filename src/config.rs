use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// =============================================================================
// Time-related constants
// =============================================================================

/// Default artifact TTL in seconds (1 hour)
pub const DEFAULT_TTL_ARTIFACT_SECS: u64 = 3600;

/// Default version-record TTL in seconds (1 hour)
pub const DEFAULT_TTL_VERSION_SECS: u64 = 3600;

/// Interval between background sweeps in seconds (1 hour)
pub const SWEEP_INTERVAL_SECS: u64 = 3600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid bind address: {0}")]
    BindAddr(String),
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub upstream: UpstreamConfig,
    pub user_agent: UserAgentConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Root of the on-disk artifact tree; the version registry database
    /// lives inside it as `versions.db`
    pub storage_root: PathBuf,
    /// Artifact TTL in seconds
    pub ttl_artifact: u64,
    /// Version-record TTL in seconds, independent from the artifact TTL
    pub ttl_version: u64,
    /// Serve a stale entry instead of failing when upstream transport
    /// errors occur
    pub stale_on_upstream_error: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            storage_root: data_dir().join("cache"),
            ttl_artifact: DEFAULT_TTL_ARTIFACT_SECS,
            ttl_version: DEFAULT_TTL_VERSION_SECS,
            stale_on_upstream_error: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    pub registry_url: String,
    /// Optional chained HTTP/SOCKS proxy for reaching upstream
    pub proxy_url: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            registry_url: "https://crates.io".to_string(),
            proxy_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct UserAgentConfig {
    pub value: String,
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        Self {
            value: "Mozilla/5.0 (compatible; crates-proxy/0.3.0)".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.bind_addr.contains(':') {
            return Err(ConfigError::BindAddr(
                "bind address must include a port".to_string(),
            ));
        }
        fs::create_dir_all(&self.cache.storage_root)?;
        Ok(())
    }

    pub fn ttl_artifact_ms(&self) -> i64 {
        (self.cache.ttl_artifact * 1000) as i64
    }

    pub fn ttl_version_ms(&self) -> i64 {
        (self.cache.ttl_version * 1000) as i64
    }

    pub fn db_path(&self) -> PathBuf {
        self.cache.storage_root.join("versions.db")
    }
}

/// Returns the path to the data directory for crates-proxy.
/// Uses $XDG_DATA_HOME/crates-proxy if XDG_DATA_HOME is set,
/// otherwise falls back to ~/.local/share/crates-proxy,
/// or ./crates-proxy if neither is available.
pub fn data_dir() -> PathBuf {
    data_dir_with_env(std::env::var("XDG_DATA_HOME").ok(), dirs::home_dir())
}

/// Returns the path to the log file.
pub fn log_path() -> PathBuf {
    data_dir().join("crates-proxy.log")
}

fn data_dir_with_env(xdg_data_home: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    let data_dir = xdg_data_home
        .map(PathBuf::from)
        .or_else(|| home_dir.map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));

    data_dir.join("crates-proxy")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_file_uses_defaults_for_missing_fields() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            ttl_artifact = 120
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.ttl_artifact, 120);
        assert_eq!(config.cache.ttl_version, DEFAULT_TTL_VERSION_SECS);
        assert_eq!(config.server, ServerConfig::default());
        assert!(!config.cache.stale_on_upstream_error);
    }

    #[test]
    fn full_config_file_parses_all_fields() {
        let config: Config = toml::from_str(
            r#"
            [server]
            bind_addr = "0.0.0.0:9000"

            [cache]
            storage_root = "/var/cache/crates-proxy"
            ttl_artifact = 7200
            ttl_version = 600
            stale_on_upstream_error = true

            [upstream]
            registry_url = "https://crates.io"
            proxy_url = "socks5://127.0.0.1:1080"

            [user_agent]
            value = "my-agent"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
        assert_eq!(
            config.cache.storage_root,
            PathBuf::from("/var/cache/crates-proxy")
        );
        assert_eq!(config.ttl_artifact_ms(), 7_200_000);
        assert_eq!(config.ttl_version_ms(), 600_000);
        assert!(config.cache.stale_on_upstream_error);
        assert_eq!(
            config.upstream.proxy_url,
            Some("socks5://127.0.0.1:1080".to_string())
        );
        assert_eq!(config.user_agent.value, "my-agent");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn validate_rejects_bind_addr_without_port() {
        let mut config = Config::default();
        config.server.bind_addr = "127.0.0.1".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::BindAddr(_))));
    }

    #[test]
    fn db_path_lives_inside_storage_root() {
        let mut config = Config::default();
        config.cache.storage_root = PathBuf::from("/tmp/proxy-cache");
        assert_eq!(
            config.db_path(),
            PathBuf::from("/tmp/proxy-cache/versions.db")
        );
    }

    #[test]
    fn data_dir_with_env_uses_xdg_data_home_when_set() {
        let path = data_dir_with_env(
            Some("/tmp/test-data".to_string()),
            Some(PathBuf::from("/home/user")),
        );

        assert_eq!(path, PathBuf::from("/tmp/test-data/crates-proxy"));
    }

    #[test]
    fn data_dir_with_env_falls_back_to_home_local_share() {
        let path = data_dir_with_env(None, Some(PathBuf::from("/home/user")));

        assert_eq!(path, PathBuf::from("/home/user/.local/share/crates-proxy"));
    }

    #[test]
    fn data_dir_with_env_falls_back_to_current_dir_when_no_dirs_available() {
        let path = data_dir_with_env(None, None);
        assert_eq!(path, PathBuf::from("./crates-proxy"));
    }
}
