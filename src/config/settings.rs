/*
* Engine Connection Settings
* --------------------------
* @project: ovirt-affinity-labels
*
* Where we find the engine and how we log into it.
*
* Configuration Hierarchy (from lowest to highest priority):
* -----------------------------------------------------
* 1. Hardcoded defaults
* 2. <CONFIG_PATH>/default.toml (optional, `init` writes one)
* 3. <CONFIG_PATH>/local.toml (optional, keep your passwords here, not in git)
* 4. OVIRT_ prefixed environment variables, `__` separated
*    (OVIRT_ENGINE__URL, OVIRT_ENGINE__INSECURE, OVIRT_LOGGING__LEVEL)
* 5. Per-invocation `auth` parameters
*
* The plain OVIRT_URL / OVIRT_USERNAME / OVIRT_PASSWORD / OVIRT_TOKEN variables
* that every oVirt playbook already exports are honoured as fallbacks when the
* layers above leave a value empty.
*/

use serde::{Deserialize, Serialize};
use config::{Config, ConfigError, Environment, File};
use std::path::{Path, PathBuf};

use crate::errors::LabelResult;
use crate::module::AuthParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub engine: EngineSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineSettings {
    /// API root, e.g. https://engine.example.com/ovirt-engine/api
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub insecure: bool,
    /// Request timeout, 0 leaves it to the transport.
    #[serde(default)]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl Settings {
    /// Where `new()` reads its files from.
    pub fn config_path() -> String {
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string())
    }

    pub fn new() -> LabelResult<Self> {
        let config_path = Self::config_path();
        let config = Self::builder()?
            .add_source(File::with_name(&format!("{}/default", config_path)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_path)).required(false))
            .add_source(Self::env_source())
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings.with_env_fallbacks(|key| std::env::var(key).ok()))
    }

    pub fn new_from_file(path: &Path) -> LabelResult<Self> {
        let config = Self::builder()?
            .add_source(File::from(path))
            .add_source(Self::env_source())
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings.with_env_fallbacks(|key| std::env::var(key).ok()))
    }

    fn env_source() -> Environment {
        Environment::with_prefix("OVIRT")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .set_default("engine.url", "")?
            .set_default("engine.insecure", false)?
            .set_default("engine.timeout_seconds", 0)?
            .set_default("logging.level", "warn")
    }

    /// Fills empty engine fields from the conventional OVIRT_* variables.
    pub fn with_env_fallbacks<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let engine = &mut self.engine;
        if engine.url.is_empty() {
            if let Some(url) = lookup("OVIRT_URL") {
                engine.url = url;
            }
        }
        if engine.username.is_none() {
            engine.username = lookup("OVIRT_USERNAME");
        }
        if engine.password.is_none() {
            engine.password = lookup("OVIRT_PASSWORD");
        }
        if engine.token.is_none() {
            engine.token = lookup("OVIRT_TOKEN");
        }
        self
    }
}

impl EngineSettings {
    /// Per-invocation auth parameters win over configured values.
    pub fn merged(&self, auth: Option<&AuthParams>) -> EngineSettings {
        let mut merged = self.clone();
        let Some(auth) = auth else {
            return merged;
        };

        if let Some(url) = &auth.url {
            merged.url = url.clone();
        }
        if auth.username.is_some() {
            merged.username = auth.username.clone();
        }
        if auth.password.is_some() {
            merged.password = auth.password.clone();
        }
        if auth.token.is_some() {
            merged.token = auth.token.clone();
        }
        if auth.ca_file.is_some() {
            merged.ca_file = auth.ca_file.clone();
        }
        if let Some(insecure) = auth.insecure {
            merged.insecure = insecure;
        }
        if let Some(timeout) = auth.timeout {
            merged.timeout_seconds = timeout;
        }
        merged
    }
}

pub fn generate_default_config() -> Settings {
    Settings {
        engine: EngineSettings {
            url: "https://engine.example.com/ovirt-engine/api".to_string(),
            username: Some("admin@internal".to_string()),
            password: None,
            token: None,
            ca_file: Some(PathBuf::from("/etc/pki/ovirt-engine/ca.pem")),
            insecure: false,
            timeout_seconds: 0,
        },
        logging: LoggingSettings::default(),
    }
}
