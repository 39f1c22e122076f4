use std::path::{Path, PathBuf};

use tern_common::{Error, Result};
use tracing::info;

use crate::model::AppConfig;

/// Loads `AppConfig` from a TOML file with environment overrides.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from the given path, or defaults if the file does
    /// not exist. `TERN_HOST`, `TERN_PORT` and `TERN_DB_PATH` override the
    /// file.
    pub fn load(path: Option<&Path>) -> Result<AppConfig> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_path);

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
            let config: AppConfig = toml::from_str(&raw)
                .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
            info!("loaded configuration from {}", path.display());
            config
        } else {
            info!("no config file at {}, using defaults", path.display());
            AppConfig::default()
        };

        if let Ok(host) = std::env::var("TERN_HOST") {
            config.gateway.host = host;
        }
        if let Ok(port) = std::env::var("TERN_PORT") {
            config.gateway.port = port
                .parse()
                .map_err(|_| Error::Config(format!("TERN_PORT is not a port number: {port}")))?;
        }
        if let Ok(db) = std::env::var("TERN_DB_PATH") {
            config.database.chat_path = db;
        }

        Ok(config)
    }

    pub fn default_config_path() -> PathBuf {
        PathBuf::from("tern.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = ConfigLoader::load(Some(Path::new("/nonexistent/tern.toml"))).unwrap();
        assert_eq!(config.gateway.port, 3990);
        assert_eq!(config.limits.max_memory_facts, 500);
        assert_eq!(config.limits.max_tool_rounds, 10);
    }

    #[test]
    fn file_values_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tern.toml");
        std::fs::write(
            &path,
            "[gateway]\nport = 4000\n\n[limits]\nhistory_window = 20\n",
        )
        .unwrap();

        let config = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(config.gateway.port, 4000);
        assert_eq!(config.limits.history_window, 20);
        // untouched sections keep their defaults
        assert_eq!(config.limits.max_fact_chars, 1000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tern.toml");
        std::fs::write(&path, "not valid toml [[[").unwrap();
        assert!(ConfigLoader::load(Some(&path)).is_err());
    }
}
