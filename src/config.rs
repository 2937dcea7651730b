//! Optional TOML configuration layer. Anything here can also be set on
//! the command line; a CLI flag always overrides its config-file
//! counterpart. A missing config file falls back to these defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TftpError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub datastore: PathBuf,
    pub username: String,
    pub logging: LoggingConfig,
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            datastore: PathBuf::from("/tftpboot"),
            username: "nobody".to_string(),
            logging: LoggingConfig::default(),
            max_sessions: crate::reactor::MAX_SESSIONS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: PathBuf::from("/var/log/tundra-tftpd.log"),
        }
    }
}

/// Loads `path` if it exists, otherwise returns the built-in defaults.
pub fn load_config(path: &std::path::Path) -> Result<ServerConfig> {
    if !path.exists() {
        return Ok(ServerConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .map_err(|e| TftpError::Tftp(format!("failed to read config {}: {e}", path.display())))?;
    let config: ServerConfig =
        toml::from_str(&text).map_err(|e| TftpError::Tftp(format!("invalid config {}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

pub fn write_default_config(path: &std::path::Path) -> Result<()> {
    let text = toml::to_string_pretty(&ServerConfig::default())
        .map_err(|e| TftpError::Tftp(format!("failed to serialize default config: {e}")))?;
    std::fs::write(path, text)
        .map_err(|e| TftpError::Tftp(format!("failed to write {}: {e}", path.display())))?;
    Ok(())
}

fn validate_config(config: &ServerConfig) -> Result<()> {
    if config.max_sessions == 0 || config.max_sessions > crate::reactor::MAX_SESSIONS {
        return Err(TftpError::Tftp(format!(
            "max_sessions must be in 1..={}",
            crate::reactor::MAX_SESSIONS
        )));
    }
    if config.username.is_empty() {
        return Err(TftpError::Tftp("username must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.username, "nobody");
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tundra-tftpd.toml");
        write_default_config(&path).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.datastore, ServerConfig::default().datastore);
    }

    #[test]
    fn rejects_oversized_max_sessions() {
        let mut config = ServerConfig::default();
        config.max_sessions = crate::reactor::MAX_SESSIONS + 1;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_empty_username() {
        let mut config = ServerConfig::default();
        config.username = String::new();
        assert!(validate_config(&config).is_err());
    }
}
