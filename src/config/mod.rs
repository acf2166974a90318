use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::event_bus::hybrid::{HybridConfig, DEFAULT_DEDUP_WINDOW};
use crate::event_bus::local::LocalBusConfig;
use crate::event_bus::manager::ManagerConfig;
use crate::event_bus::remote::RemoteConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub service_name: String,
    pub component: String,

    pub enable_remote: bool,
    pub fallback_to_local: bool,
    pub remote: RemoteSettings,

    /// TTL of each remote history list, refreshed on every write
    pub event_ttl_seconds: u64,
    pub enable_event_history: bool,
    /// Entries kept per remote history list
    pub max_history_size: usize,
    /// Entries kept in the in-process history ring
    pub local_history_capacity: usize,

    pub health_check_interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RemoteSettings {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    pub password: Option<String>,
    pub database: i64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// Per-command bound once connected
    pub response_timeout_ms: u64,
    /// Defaults to a random id per process
    pub instance_id: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_name: "hybrid-eventbus".to_string(),
            component: "event-bus".to_string(),
            enable_remote: false,
            fallback_to_local: true,
            remote: RemoteSettings::default(),
            event_ttl_seconds: 3600,
            enable_event_history: true,
            max_history_size: 1000,
            local_history_capacity: 1000,
            health_check_interval_ms: 30_000,
        }
    }
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: None,
            port: 6379,
            password: None,
            database: 0,
            max_retries: 3,
            retry_delay_ms: 500,
            connect_timeout_ms: 5_000,
            response_timeout_ms: 3_000,
            instance_id: None,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with defaults
            .add_source(File::with_name("config/default").required(false))
            // Add environment-specific file
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add local configuration file (not tracked by git)
            .add_source(File::with_name("config/local").required(false))
            // EVENTBUS_ENABLE_REMOTE=true, EVENTBUS_REMOTE__HOST=redis, ...
            .add_source(
                Environment::with_prefix("EVENTBUS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    /// Parse settings from a TOML document, on top of the defaults
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn remote_config(&self) -> RemoteConfig {
        let defaults = RemoteConfig::default();
        RemoteConfig {
            url: self.remote.url.clone(),
            host: self.remote.host.clone(),
            port: self.remote.port,
            password: self.remote.password.clone(),
            database: self.remote.database,
            max_retries: self.remote.max_retries,
            retry_delay: Duration::from_millis(self.remote.retry_delay_ms),
            connect_timeout: Duration::from_millis(self.remote.connect_timeout_ms),
            response_timeout: Duration::from_millis(self.remote.response_timeout_ms),
            event_ttl: Duration::from_secs(self.event_ttl_seconds),
            enable_event_history: self.enable_event_history,
            max_history_size: self.max_history_size,
            instance_id: self.remote.instance_id.clone().unwrap_or(defaults.instance_id),
        }
    }

    pub fn hybrid_config(&self) -> HybridConfig {
        HybridConfig {
            enable_remote: self.enable_remote,
            fallback_to_local: self.fallback_to_local,
            remote: self.enable_remote.then(|| self.remote_config()),
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            local: LocalBusConfig {
                history_capacity: self.local_history_capacity,
                enable_history: self.enable_event_history,
            },
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            service_name: self.service_name.clone(),
            component: self.component.clone(),
        }
    }
}
