use super::{Config, ConnectionConfigFile};
use crate::errors::ConfigError;
use glob::glob;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

pub struct ConfigManager {
    current_config: Arc<Config>,
}

impl ConfigManager {
    pub async fn new(config_dir: String) -> Result<Self, ConfigError> {
        let config = Self::load_configuration(&config_dir).await?;
        Ok(Self {
            current_config: Arc::new(config),
        })
    }

    pub fn get_current_config(&self) -> Arc<Config> {
        self.current_config.clone()
    }

    async fn load_configuration(config_dir: &str) -> Result<Config, ConfigError> {
        let main_config_path = format!("{}/main.toml", config_dir);
        let main_config_content =
            fs::read_to_string(&main_config_path)
                .await
                .map_err(|e| ConfigError::LoadFailed {
                    path: main_config_path.clone(),
                    reason: e.to_string(),
                })?;

        let mut config: Config =
            toml::from_str(&main_config_content).map_err(|e| ConfigError::ParseError {
                path: main_config_path.clone(),
                reason: e.to_string(),
            })?;
        config.validate()?;

        // One file per connection, named after the connection
        let pattern = format!("{}/*.toml", config_dir);
        let mut connections = HashMap::new();

        let entries = glob(&pattern).map_err(|e| ConfigError::LoadFailed {
            path: pattern.clone(),
            reason: e.to_string(),
        })?;

        for entry in entries {
            let path = entry.map_err(|e| ConfigError::LoadFailed {
                path: pattern.clone(),
                reason: e.to_string(),
            })?;
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| ConfigError::LoadFailed {
                    path: path.display().to_string(),
                    reason: "invalid filename".to_string(),
                })?;

            if filename == "main.toml" {
                continue;
            }

            let Some(connection_name) = filename.strip_suffix(".toml") else {
                continue;
            };

            debug!("Loading connection config: {}", path.display());

            let content = fs::read_to_string(&path)
                .await
                .map_err(|e| ConfigError::LoadFailed {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;

            let file: ConnectionConfigFile =
                toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;

            if file.connection.host.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.host", connection_name),
                    reason: "must not be empty".to_string(),
                });
            }

            connections.insert(connection_name.to_string(), file.connection);
        }

        config.connections = connections;

        info!("Loaded {} connections", config.connections.len());

        Ok(config)
    }
}
