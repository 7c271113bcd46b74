//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.
//! The file deserializes straight into the core [`Config`]; the overrides
//! cover the handful of knobs deployments change per host.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use embercast_core::Config;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Engine configuration, passed through to the core.
    #[serde(flatten)]
    pub core: Config,
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides. No path means defaults everywhere.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: Self = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config
            .core
            .validate()
            .map_err(anyhow::Error::msg)
            .context("configuration is invalid")?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("EMBERCAST_HOSTNAME") {
            self.core.hostname = val;
        }

        if let Ok(val) = std::env::var("EMBERCAST_CLIENT_LIMIT") {
            if let Ok(limit) = val.parse() {
                self.core.client_limit = limit;
            }
        }

        if let Ok(val) = std::env::var("EMBERCAST_WEBROOT") {
            self.core.webroot = Some(val.into());
        }

        // Note: EMBERCAST_BIND_PORT is handled by clap via #[arg(env = ...)] in main.rs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_yields_defaults() {
        let config = ServerConfig::load(None).unwrap();
        assert_eq!(config.core.client_limit, Config::default().client_limit);
        assert_eq!(config.core.listen.len(), 1);
    }

    #[test]
    fn yaml_maps_into_core_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yaml");
        std::fs::write(
            &path,
            "hostname: radio.example\n\
             client_limit: 32\n\
             listen:\n\
             - port: 9000\n\
             mounts:\n\
             - mount_name: /live\n\
             \x20\x20max_listeners: 10\n",
        )
        .unwrap();

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.core.hostname, "radio.example");
        assert_eq!(config.core.client_limit, 32);
        assert_eq!(config.core.listen[0].port, 9000);
        assert_eq!(config.core.mounts[0].max_listeners, Some(10));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yaml");
        std::fs::write(&path, "handler_threads: 0\n").unwrap();
        assert!(ServerConfig::load(Some(&path)).is_err());
    }
}
