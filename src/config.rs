//! Daemon configuration and bus socket path resolution.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment override for the bus socket location.
pub const SOCKET_PATH_ENV: &str = "SAFTBUS_SOCKET_PATH";

/// Built-in bus socket location.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/saftbus/saftbus";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("socket path is empty")]
    EmptySocketPath,
    #[error("socket path {0:?} is not absolute")]
    RelativeSocketPath(PathBuf),
    #[error("cannot read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Absolute path of the listening socket.
    pub socket_path: PathBuf,
    /// Mode bits applied to the socket file; this is the only access
    /// control on the bus.
    pub socket_mode: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            socket_mode: 0o666,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(SOCKET_PATH_ENV) {
            if !path.is_empty() {
                self.socket_path = PathBuf::from(path);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_socket_path(&self.socket_path)
    }
}

pub fn validate_socket_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::EmptySocketPath);
    }
    if !path.is_absolute() {
        return Err(ConfigError::RelativeSocketPath(path.to_path_buf()));
    }
    Ok(())
}

/// Client-side socket resolution: explicit path, then `SAFTBUS_SOCKET_PATH`,
/// then the built-in default.
pub fn resolve_socket_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match std::env::var(SOCKET_PATH_ENV) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from(DEFAULT_SOCKET_PATH),
        },
    };
    validate_socket_path(&path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.socket_mode, 0o666);
    }

    #[test]
    fn relative_and_empty_paths_are_rejected() {
        assert!(matches!(
            validate_socket_path(Path::new("")),
            Err(ConfigError::EmptySocketPath)
        ));
        assert!(matches!(
            validate_socket_path(Path::new("relative/bus")),
            Err(ConfigError::RelativeSocketPath(_))
        ));
    }

    #[test]
    fn config_file_roundtrip() {
        let config = DaemonConfig {
            socket_path: PathBuf::from("/tmp/bus"),
            socket_mode: 0o600,
        };
        let text = toml::to_string(&config).expect("serialize config");
        let parsed: DaemonConfig = toml::from_str(&text).expect("parse config");
        assert_eq!(parsed.socket_path, config.socket_path);
        assert_eq!(parsed.socket_mode, 0o600);
    }

    #[test]
    fn explicit_path_wins_resolution() {
        let path = resolve_socket_path(Some(Path::new("/tmp/other"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/other"));
    }
}
