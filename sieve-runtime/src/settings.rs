//! Main settings file
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below. Paths are taken relative to the working directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use sieve_agents::{load_toml, ConfigError};
use sieve_core::DEFAULT_DISTANCE;
use sieve_net::ProbeConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub store: StoreSettings,
    pub probe: ProbeSettings,
    pub scan: ScanSettings,
    pub crawl: CrawlSettings,
    pub checker: CheckerSettings,
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Settings = load_toml(path)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks that do not depend on which loops will run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.backend == StoreBackend::Redis && self.store.url.is_empty() {
            return Err(ConfigError::Invalid("store.url is required for redis".into()));
        }
        if self.scan.ports.is_empty() {
            return Err(ConfigError::Invalid("scan.ports must not be empty".into()));
        }
        if self.checker.history.check_urls.iter().any(|u| u.trim().is_empty()) {
            return Err(ConfigError::Invalid("checker.history.check_urls has an empty entry".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub url: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            url: "redis://127.0.0.1:6379/0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Default for every loop; per-loop and per-rule agents override it
    pub user_agent: String,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        let config = ProbeConfig::default();
        Self {
            timeout_secs: config.timeout_secs,
            connect_timeout_secs: config.connect_timeout_secs,
            user_agent: config.user_agent,
        }
    }
}

impl From<&ProbeSettings> for ProbeConfig {
    fn from(settings: &ProbeSettings) -> Self {
        ProbeConfig {
            timeout_secs: settings.timeout_secs,
            connect_timeout_secs: settings.connect_timeout_secs,
            user_agent: settings.user_agent.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub workers: usize,
    pub queue_size: usize,
    pub ports: Vec<u16>,
    /// Connectivity check rules
    pub rules: PathBuf,
    /// Fallback user agent for rules without one; `probe.user_agent` when unset
    pub user_agent: Option<String>,
    /// Backlog length above which it is re-merged before a cycle
    pub merge_threshold: usize,
    pub idle_secs: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            workers: 3,
            queue_size: 1024,
            ports: vec![80, 8080, 3128],
            rules: PathBuf::from("conf/rules.toml"),
            user_agent: None,
            merge_threshold: sieve_core::BACKLOG_MERGE_THRESHOLD,
            idle_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlSettings {
    pub tasks: PathBuf,
    /// Directory holding `<name>.toml` templates
    pub templates: PathBuf,
    pub user_agent: Option<String>,
    /// Third-octet gap tolerated when merging ranges
    pub distance: u8,
    pub interval_secs: u64,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            tasks: PathBuf::from("conf/tasks.toml"),
            templates: PathBuf::from("conf/templates"),
            user_agent: None,
            distance: DEFAULT_DISTANCE,
            interval_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerSettings {
    pub anony: AnonySettings,
    pub history: HistorySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnonySettings {
    /// Echo page that reveals forwarded client headers
    pub check_url: String,
    pub workers: usize,
    pub queue_size: usize,
    pub user_agent: Option<String>,
    pub max_body_bytes: usize,
    pub backoff_secs: u64,
}

impl Default for AnonySettings {
    fn default() -> Self {
        Self {
            check_url: String::new(),
            workers: 10,
            queue_size: 100,
            user_agent: None,
            max_body_bytes: 64 * 1024,
            backoff_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    pub workers: usize,
    pub queue_size: usize,
    pub user_agent: Option<String>,
    pub check_urls: Vec<String>,
    pub interval_secs: u64,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_size: 100,
            user_agent: None,
            check_urls: Vec::new(),
            interval_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.store.backend, StoreBackend::Redis);
        assert_eq!(settings.scan.workers, 3);
        assert_eq!(settings.checker.anony.workers, 10);
        assert_eq!(settings.checker.anony.queue_size, 100);
        assert_eq!(settings.checker.history.workers, 10);
        assert_eq!(settings.crawl.interval_secs, 1800);
        assert_eq!(settings.crawl.distance, 3);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_sections() {
        let settings: Settings = toml::from_str(
            r#"
            [store]
            backend = "memory"

            [probe]
            user_agent = "sieve/0.1"

            [scan]
            ports = [8888]

            [checker.anony]
            check_url = "http://echo.test/anony"

            [checker.history]
            check_urls = ["http://a.test/", "http://b.test/"]
            user_agent = "sieve"
            "#,
        )
        .unwrap();

        assert_eq!(settings.store.backend, StoreBackend::Memory);
        assert_eq!(settings.probe.user_agent, "sieve/0.1");
        assert_eq!(settings.probe.timeout_secs, 10);
        assert_eq!(settings.scan.ports, vec![8888]);
        assert_eq!(settings.scan.workers, 3);
        assert_eq!(settings.checker.anony.check_url, "http://echo.test/anony");
        assert_eq!(settings.checker.anony.max_body_bytes, 65536);
        assert_eq!(settings.checker.history.check_urls.len(), 2);
        assert_eq!(settings.checker.history.user_agent.as_deref(), Some("sieve"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.scan.ports.clear();
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        let mut settings = Settings::default();
        settings.store.url.clear();
        assert!(settings.validate().is_err());
        settings.store.backend = StoreBackend::Memory;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_unknown_backend_is_a_parse_error() {
        let dir = std::env::temp_dir().join(format!("sieve-settings-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("proxy-sieve.toml");
        std::fs::write(&path, "[store]\nbackend = \"etcd\"\n").unwrap();

        assert!(matches!(Settings::load(&path), Err(ConfigError::Parse { .. })));

        std::fs::remove_dir_all(dir).unwrap();
    }
}
