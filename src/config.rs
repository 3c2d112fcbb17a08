use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_CORE_PORT: u16 = 8083;
pub const DEFAULT_SERVICE_NAME: &str = "dispatchx";

/// Static service configuration. Dynamic settings (the enable flag, the
/// log level, the worker count, filter categories) live in the external
/// configuration store; this file only carries what is needed to reach
/// the core and to come up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub name: String,
    pub core_address: String,
    pub core_port: u16,
    pub listen_address: String,
    /// 0 picks an ephemeral port, reported to the registry after bind.
    pub listen_port: u16,
    pub data_dir: PathBuf,
    pub auth_enabled: bool,
    pub outbound_timeout_secs: u64,
    pub log_level: String,
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: DEFAULT_SERVICE_NAME.to_string(),
            core_address: "localhost".to_string(),
            core_port: DEFAULT_CORE_PORT,
            listen_address: "0.0.0.0".to_string(),
            listen_port: 0,
            data_dir: default_data_dir(),
            auth_enabled: false,
            outbound_timeout_secs: 5,
            log_level: "warning".to_string(),
            token: None,
        }
    }
}

/// CLI overrides applied on top of the file for this run only.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub name: Option<String>,
    pub core_address: Option<String>,
    pub core_port: Option<u16>,
    pub log_level: Option<String>,
    pub token: Option<String>,
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = match dirs::home_dir() {
        Some(home) => home.join(".dispatchx"),
        None => env::current_dir()?.join(".dispatchx"),
    };
    path.push("config.toml");
    Ok(path)
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&contents)?;
        config.ensure_data_dir()?;
        Ok((config, config_path))
    } else {
        let config = Config::default();
        config.ensure_data_dir()?;
        config.save(&config_path)?;
        Ok((config, config_path))
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(address) = update.core_address {
            self.core_address = address;
        }
        if let Some(port) = update.core_port {
            self.core_port = port;
        }
        if let Some(level) = update.log_level {
            self.log_level = level;
        }
        if let Some(token) = update.token {
            self.token = Some(token);
        }
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.data_dir.join("dispatchx.pid")
    }
}

fn default_data_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".dispatchx"),
        None => PathBuf::from(".dispatchx"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_and_reloads_the_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let (mut config, saved_path) = load_or_default(Some(path.clone())).unwrap();
        assert_eq!(saved_path, path);
        assert!(path.exists());
        assert_eq!(config.core_port, DEFAULT_CORE_PORT);

        config.core_port = 9999;
        config.save(&path).unwrap();

        let (reloaded, _) = load_or_default(Some(path)).unwrap();
        assert_eq!(reloaded.core_port, 9999);
    }

    #[test]
    fn updates_override_only_what_is_set() {
        let mut config = Config::default();
        config.apply_update(ConfigUpdate {
            name: Some("edge-dispatcher".into()),
            core_port: Some(9000),
            ..ConfigUpdate::default()
        });
        assert_eq!(config.name, "edge-dispatcher");
        assert_eq!(config.core_port, 9000);
        assert_eq!(config.core_address, "localhost");
    }
}
