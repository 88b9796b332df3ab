//! Configuration loading from disk.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::schema::{BrokerConfig, ListenerConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "IO error reading {}: {}", path.display(), e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<BrokerConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<BrokerConfig, ConfigError> {
    let config: BrokerConfig = toml::from_str(content).map_err(ConfigError::Parse)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Produces the configuration the broker should run with.
///
/// Called once at startup and again on every reload.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<BrokerConfig, ConfigError>;

    /// File to watch for changes, if any.
    fn watch_path(&self) -> Option<&Path> {
        None
    }
}

/// Command line overrides layered over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Replace the configured listeners with plain MQTT listeners on these ports.
    pub ports: Vec<u16>,
    /// Force daemon mode on.
    pub daemon: bool,
}

/// Configuration read from an optional TOML file plus command line overrides.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: Option<PathBuf>,
    overrides: Overrides,
}

impl FileSource {
    pub fn new(path: Option<PathBuf>, overrides: Overrides) -> Self {
        Self { path, overrides }
    }
}

impl ConfigSource for FileSource {
    fn load(&self) -> Result<BrokerConfig, ConfigError> {
        let mut config = match &self.path {
            Some(path) => load_config(path)?,
            None => BrokerConfig::default(),
        };

        if !self.overrides.ports.is_empty() {
            // Without a config file, -p listeners stay on loopback.
            let host = if self.path.is_none() { Some("127.0.0.1") } else { None };
            config.listeners = self
                .overrides
                .ports
                .iter()
                .map(|&port| ListenerConfig::tcp(host, port))
                .collect();
            validate_config(&config).map_err(ConfigError::Validation)?;
        }
        if self.overrides.daemon {
            config.daemon = true;
        }
        Ok(config)
    }

    fn watch_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// A fixed configuration, swapped programmatically. Useful when embedding.
#[derive(Debug, Default)]
pub struct StaticSource {
    config: std::sync::RwLock<BrokerConfig>,
}

impl StaticSource {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config: std::sync::RwLock::new(config),
        }
    }

    /// Replace the configuration returned by the next `load`.
    pub fn set(&self, config: BrokerConfig) {
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}

impl ConfigSource for StaticSource {
    fn load(&self) -> Result<BrokerConfig, ConfigError> {
        let config = match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn port_overrides_replace_listeners() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[listeners]]\nunix_socket_path = \"/tmp/x.sock\"").unwrap();
        let source = FileSource::new(
            Some(file.path().to_path_buf()),
            Overrides {
                ports: vec![1884, 1885],
                daemon: true,
            },
        );
        let config = source.load().unwrap();
        assert!(config.daemon);
        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[0].bind_port, Some(1884));
        assert_eq!(config.listeners[0].bind_host, None);
    }

    #[test]
    fn ports_without_file_stay_on_loopback() {
        let source = FileSource::new(
            None,
            Overrides {
                ports: vec![1884],
                daemon: false,
            },
        );
        let config = source.load().unwrap();
        assert_eq!(config.listeners[0].bind_host.as_deref(), Some("127.0.0.1"));
        assert!(source.watch_path().is_none());
    }

    #[test]
    fn invalid_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[listeners]]\nprotocol = \"mqtt\"").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("exactly one of bind_port"));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_config(Path::new("/nonexistent/mqttd.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/mqttd.toml"));
    }
}
