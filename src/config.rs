use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// Top-level gateway configuration, loaded once at startup.
///
/// Runtime-tunable load-balancing settings live in a separate JSON document
/// (see `settings.rs`) so that they can be updated over the admin API without
/// restarting the process.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: ApiConfig,
    #[serde(default)]
    pub stores: StoreConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    pub bind_address: Option<SocketAddr>,
    pub prometheus_address: Option<SocketAddr>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// JSON document holding the configured model instances. Reloadable at
    /// any time via the admin refresh path.
    pub instances: Option<PathBuf>,
    /// JSON document the runtime settings are persisted to (best-effort).
    pub settings: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdempotencyConfig {
    #[serde(default)]
    pub mode: IdempotencyMode,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyMode {
    #[default]
    Memory,
    Disabled,
}

/// Deserialize a TOML table into `Config`
impl TryFrom<toml::Table> for Config {
    type Error = Error;

    fn try_from(table: toml::Table) -> Result<Self, Self::Error> {
        match table.try_into() {
            Ok(config) => Ok(config),
            Err(e) => Err(Error::Config {
                message: format!("Failed to parse config:\n{e}"),
            }),
        }
    }
}

impl Config {
    /// Load and validate the gateway config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
        let config_table = Config::read_toml_config(path.as_ref())?;
        Config::try_from(config_table)
    }

    /// Read a file from the file system and parse it as TOML
    fn read_toml_config(path: &Path) -> Result<toml::Table, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("Failed to read config file `{}`: {e}", path.display()),
        })?;
        contents.parse::<toml::Table>().map_err(|e| Error::Config {
            message: format!("Failed to parse config file `{}`: {e}", path.display()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let table = r#"
            [gateway]
            bind_address = "127.0.0.1:3000"
            prometheus_address = "127.0.0.1:9090"

            [stores]
            instances = "instances.json"
            settings = "settings.json"

            [idempotency]
            mode = "memory"
        "#
        .parse::<toml::Table>()
        .unwrap();

        let config = Config::try_from(table).unwrap();
        assert_eq!(
            config.gateway.bind_address,
            Some("127.0.0.1:3000".parse().unwrap())
        );
        assert_eq!(config.stores.instances, Some(PathBuf::from("instances.json")));
        assert_eq!(config.idempotency.mode, IdempotencyMode::Memory);
    }

    #[test]
    fn test_parse_empty_config() {
        let table = "".parse::<toml::Table>().unwrap();
        let config = Config::try_from(table).unwrap();
        assert!(config.gateway.bind_address.is_none());
        assert_eq!(config.idempotency.mode, IdempotencyMode::Memory);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let table = r#"
            [gateway]
            bind_addres = "127.0.0.1:3000"
        "#
        .parse::<toml::Table>()
        .unwrap();
        assert!(Config::try_from(table).is_err());
    }
}
