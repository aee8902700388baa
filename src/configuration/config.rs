use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::configuration::types::StorageBackend;
use crate::error_handling::types::ConfigError;

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_file_path() -> PathBuf {
    PathBuf::from("file.json")
}

/// Raw TOML shape of the configuration file, before validation.
#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    /// Address the API server binds to.
    #[serde(default = "default_bind_address")]
    bind_address: String,
    /// Port the API server listens on.
    #[serde(default = "default_port")]
    port: u16,
    /// Backend selector: `"file"` or `"db"`.
    storage_backend: String,
    /// Snapshot path for the file backend.
    file_path: Option<PathBuf>,
    /// Connection URL for the database backend.
    database_url: Option<String>,
}

/// Validated runtime configuration.
///
/// Backend selection is resolved here, at startup, into a typed
/// [`StorageBackend`]; nothing downstream ever branches on a backend
/// name string.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub backend: StorageBackend,
}

impl Config {
    /// Read and validate a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path)?;
        let raw: RawConfig =
            toml::from_str(&content).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        raw.validate()
    }
}

impl RawConfig {
    fn validate(self) -> Result<Config, ConfigError> {
        let backend = match self.storage_backend.as_str() {
            "file" => StorageBackend::File {
                path: self.file_path.unwrap_or_else(default_file_path),
            },
            "db" => StorageBackend::Database {
                url: self.database_url.ok_or(ConfigError::MissingDatabaseUrl)?,
            },
            other => return Err(ConfigError::UnknownBackend(other.to_string())),
        };
        let addr = format!("{}:{}", self.bind_address, self.port);
        let bind_address: SocketAddr = addr
            .parse()
            .map_err(|_| ConfigError::BadAddress(addr.clone()))?;
        Ok(Config {
            bind_address,
            backend,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config_from(content: &str) -> Result<Config, ConfigError> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        Config::from_file(file.path())
    }

    #[test]
    fn test_file_backend_with_defaults() {
        let config = config_from("storage_backend = \"file\"\n").unwrap();
        assert_eq!(config.bind_address.port(), 5000);
        assert_eq!(
            config.backend,
            StorageBackend::File {
                path: PathBuf::from("file.json")
            }
        );
    }

    #[test]
    fn test_db_backend_requires_url() {
        let err = config_from("storage_backend = \"db\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingDatabaseUrl));

        let config = config_from(
            "storage_backend = \"db\"\ndatabase_url = \"sqlite://roost.sqlite3?mode=rwc\"\n",
        )
        .unwrap();
        assert_eq!(
            config.backend,
            StorageBackend::Database {
                url: "sqlite://roost.sqlite3?mode=rwc".into()
            }
        );
    }

    #[test]
    fn test_unknown_backend_is_fatal() {
        let err = config_from("storage_backend = \"carrier-pigeon\"\n").unwrap_err();
        match err {
            ConfigError::UnknownBackend(name) => assert_eq!(name, "carrier-pigeon"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_explicit_address_and_port() {
        let config = config_from(
            "storage_backend = \"file\"\nbind_address = \"127.0.0.1\"\nport = 8080\n",
        )
        .unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn test_bad_toml_reports_parse_error() {
        let err = config_from("storage_backend = [broken\n").unwrap_err();
        assert!(matches!(err, ConfigError::TomlError(_)));
    }
}
