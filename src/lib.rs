//! Rewards Harvester
//!
//! Automated point collection for the Bing rewards program: per-account
//! desktop and mobile search campaigns driven over CDP, fed by trending
//! queries, with per-account proxies.

pub mod bot;
pub mod browser;
pub mod dashboard;
pub mod proxy;
pub mod search;
pub mod stats;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use proxy::ProxySettings;
use search::SearchSettings;
use stats::RunStats;

/// One roster entry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub proxy: Option<ProxySettings>,
}

/// Which device passes to run per account.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workers {
    #[serde(default = "default_true")]
    pub do_desktop_search: bool,
    #[serde(default = "default_true")]
    pub do_mobile_search: bool,
}

impl Default for Workers {
    fn default() -> Self {
        Self {
            do_desktop_search: true,
            do_mobile_search: true,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// How many account chunks run in parallel
    #[serde(default = "default_clusters")]
    pub clusters: usize,

    #[serde(default = "default_true")]
    pub headless: bool,

    /// Keep searching even when the dashboard reports nothing earnable
    #[serde(default)]
    pub run_on_zero_points: bool,

    /// Explicit Chrome/Chromium executable; auto-detected when absent
    #[serde(default)]
    pub chrome_path: Option<String>,

    #[serde(default)]
    pub workers: Workers,

    #[serde(default)]
    pub search_settings: SearchSettings,

    #[serde(default)]
    pub accounts: Vec<Account>,
}

fn default_clusters() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            clusters: default_clusters(),
            headless: true,
            run_on_zero_points: false,
            chrome_path: None,
            workers: Workers::default(),
            search_settings: SearchSettings::default(),
            accounts: vec![],
        }
    }
}

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("rewards-harvester").join("logs"))
}

impl AppConfig {
    /// Get config file path
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("rewards-harvester").join("config.json"))
    }

    /// Load config from file. A missing file gets the default written out so
    /// there is something to fill in.
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str(&content) {
                        Ok(config) => {
                            info!("Loaded config from {:?}", path);
                            return config;
                        }
                        Err(e) => {
                            warn!("Failed to parse config file: {}", e);
                        }
                    },
                    Err(e) => {
                        warn!("Failed to read config file: {}", e);
                    }
                }
            } else {
                let defaults = Self::default();
                defaults.save();
                info!("Wrote default config to {:?}", path);
                return defaults;
            }
        }
        Self::default()
    }

    /// Save config to file
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Failed to create config directory: {}", e);
                    return;
                }
            }

            match serde_json::to_string_pretty(self) {
                Ok(content) => {
                    if let Err(e) = std::fs::write(&path, content) {
                        error!("Failed to save config: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to serialize config: {}", e);
                }
            }
        }
    }
}

/// Application state shared across the run
pub struct AppState {
    /// Application configuration
    pub config: Arc<RwLock<AppConfig>>,
    /// Run statistics
    pub stats: Arc<RunStats>,
    /// Cleared by Ctrl-C; checked between accounts and passes
    pub is_running: Arc<std::sync::atomic::AtomicBool>,
}

impl AppState {
    /// Create new application state with loaded config
    pub fn new() -> Self {
        Self {
            config: Arc::new(RwLock::new(AppConfig::load())),
            stats: Arc::new(RunStats::new()),
            is_running: Arc::new(std::sync::atomic::AtomicBool::new(true)),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize logging
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "rewards-harvester.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.clusters, 1);
        assert!(config.headless);
        assert!(!config.run_on_zero_points);
        assert!(config.workers.do_desktop_search);
        assert!(config.workers.do_mobile_search);
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn test_roster_entry_parses_with_optional_proxy() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "accounts": [
                    {"email": "a@x.com", "password": "pw"},
                    {
                        "email": "b@x.com",
                        "password": "pw2",
                        "proxy": {"url": "10.0.0.9", "port": 8080,
                                  "username": "u", "password": "p"}
                    }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.accounts.len(), 2);
        assert!(config.accounts[0].proxy.is_none());
        let proxy = config.accounts[1].proxy.as_ref().unwrap();
        assert!(proxy.has_credentials());
        assert_eq!(proxy.upstream_addr(), "10.0.0.9:8080");
    }
}
