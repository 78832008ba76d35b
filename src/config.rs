use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::ProxyError;

/// Env var that overrides the default config path.
pub const CONFIG_PATH_ENV_VAR: &str = "NEWZNAB_PROXY_CONFIG_PATH";

/// Default config path, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".my.config.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebConfig {
    /// Host clients use to reach the proxy; baked into rewritten links.
    #[serde(default = "default_external_host")]
    pub external_host: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    /// Allow-list of accepted API keys. Absent means no key validation.
    #[serde(default)]
    pub api_keys: Option<Vec<String>>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            external_host: default_external_host(),
            listen_addr: default_listen_addr(),
            port: default_port(),
            tls: false,
            api_keys: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Reserved for an on-disk NZB cache; parsed but not consumed.
    #[serde(default)]
    pub nzb_dir: Option<PathBuf>,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            nzb_dir: None,
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub rss: Option<RssConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RssConfig {
    pub rss_path: String,
    /// Query params shared by every feed of this backend.
    #[serde(default)]
    pub rss_query_params: BTreeMap<String, String>,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedConfig {
    pub name: String,
    #[serde(deserialize_with = "de_duration")]
    pub poll_interval: Duration,
    /// Feed-level params; win over the backend's on key conflicts.
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchConfig {
    /// When true (the default, matching upstream behaviour), any local match
    /// for the raw query is served without consulting the backends. When
    /// false, the negative-cache-gated fan-out always runs and local matches
    /// are merged in first.
    #[serde(default = "default_true")]
    pub cache_first: bool,
    /// How long a hit/miss cache entry suppresses re-querying a backend.
    #[serde(default = "default_requery_window", deserialize_with = "de_duration")]
    pub requery_window: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            cache_first: true,
            requery_window: default_requery_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

fn default_external_host() -> String {
    "localhost".to_string()
}
fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}
const fn default_port() -> u16 {
    8080
}
fn default_db_path() -> PathBuf {
    PathBuf::from("nzbmux.db")
}
const fn default_true() -> bool {
    true
}
const fn default_requery_window() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}
fn default_log_level() -> String {
    "info".to_string()
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl Config {
    /// The effective config path: `NEWZNAB_PROXY_CONFIG_PATH` when set,
    /// otherwise the default.
    pub fn default_path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Address the HTTP listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.web.listen_addr, self.web.port)
    }

    fn validate(&self) -> Result<(), ProxyError> {
        let mut names = HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() {
                return Err(ProxyError::Config("backend with empty name".to_string()));
            }
            if backend.base_url.is_empty() {
                return Err(ProxyError::Config(format!(
                    "backend {} has no baseUrl",
                    backend.name
                )));
            }
            if !names.insert(backend.name.as_str()) {
                return Err(ProxyError::Config(format!(
                    "duplicate backend name {}",
                    backend.name
                )));
            }
            if let Some(rss) = &backend.rss {
                for feed in &rss.feeds {
                    if feed.poll_interval.is_zero() {
                        return Err(ProxyError::Config(format!(
                            "feed {} of backend {} has a zero pollInterval",
                            feed.name, backend.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web: WebConfig::default(),
            storage: StorageConfig::default(),
            backends: Vec::new(),
            search: SearchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
