//! Configuration for the volkeep CSI controller.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or no
//! file at all) yields a working in-memory controller on the standard CSI
//! socket.

use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use volkeep_dial::Endpoint;

use crate::csi::controller_service_capability::rpc::Type as RpcType;

pub const DRIVER_NAME: &str = "volkeep.csi.volkeep.dev";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_ENDPOINT: &str = "unix:///var/run/csi/csi.sock";

/// Bytes per MiB.
pub const BYTES_PER_MIB: i64 = 1 << 20;
/// Bytes per GiB.
pub const BYTES_PER_GIB: i64 = 1 << 30;

/// CSI limits plugin names to 63 characters.
const DRIVER_NAME_MAX_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] volkeep_dial::DialError),

    #[error("unknown controller capability: {name}")]
    UnknownCapability { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: default_version(),
            endpoint: default_endpoint(),
            controller: ControllerConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Upper bound on waiting for a contended volume lock. Unset means wait
    /// as long as the request deadline allows (forever without one).
    pub lock_wait_timeout_ms: Option<u64>,
    /// RPC capabilities reported by ControllerGetCapabilities, by CSI name.
    pub capabilities: Vec<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout_ms: None,
            capabilities: vec![RpcType::CreateDeleteVolume.as_str_name().to_string()],
        }
    }
}

impl ControllerConfig {
    pub fn lock_wait_timeout(&self) -> Option<Duration> {
        self.lock_wait_timeout_ms.map(Duration::from_millis)
    }

    /// Resolve the configured capability names.
    pub fn rpc_capabilities(&self) -> Result<Vec<RpcType>, ConfigError> {
        self.capabilities
            .iter()
            .map(|name| match RpcType::from_str_name(name) {
                Some(RpcType::Unknown) | None => Err(ConfigError::UnknownCapability {
                    name: name.clone(),
                }),
                Some(t) => Ok(t),
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_wait_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "controller.lock_wait_timeout_ms",
                reason: "must be > 0 when set",
            });
        }
        self.rpc_capabilities()?;
        Ok(())
    }
}

/// Settings for the in-memory reference backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Size allocated when a request carries no capacity range.
    pub default_volume_bytes: i64,
    /// Allocations are rounded up to a multiple of this.
    pub allocation_unit_bytes: i64,
    /// Total bytes the backend may hand out. Unset means unlimited.
    pub capacity_bytes: Option<i64>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            default_volume_bytes: BYTES_PER_GIB,
            allocation_unit_bytes: BYTES_PER_MIB,
            capacity_bytes: None,
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_volume_bytes <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "backend.default_volume_bytes",
                reason: "must be > 0",
            });
        }
        if self.allocation_unit_bytes <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "backend.allocation_unit_bytes",
                reason: "must be > 0",
            });
        }
        if matches!(self.capacity_bytes, Some(c) if c <= 0) {
            return Err(ConfigError::InvalidValue {
                field: "backend.capacity_bytes",
                reason: "must be > 0 when set",
            });
        }
        Ok(())
    }
}

fn default_name() -> String {
    DRIVER_NAME.to_string()
}

fn default_version() -> String {
    DRIVER_VERSION.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "name",
                reason: "must not be empty",
            });
        }
        if self.name.len() > DRIVER_NAME_MAX_LEN {
            return Err(ConfigError::InvalidValue {
                field: "name",
                reason: "must be 63 characters or less",
            });
        }
        if self.version.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "version",
                reason: "must not be empty",
            });
        }
        Endpoint::parse(&self.endpoint)?;
        self.controller.validate()?;
        self.backend.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(
            config.controller.rpc_capabilities().unwrap(),
            vec![RpcType::CreateDeleteVolume]
        );
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.name, DRIVER_NAME);
        assert_eq!(config.backend.default_volume_bytes, BYTES_PER_GIB);
        assert_eq!(config.controller.lock_wait_timeout(), None);
    }

    #[test]
    fn parse_full_config() {
        let config = Config::parse(
            r#"
            name = "blk.example.com"
            endpoint = "tcp://127.0.0.1:10000"

            [controller]
            lock_wait_timeout_ms = 2500
            capabilities = ["CREATE_DELETE_VOLUME", "LIST_VOLUMES"]

            [backend]
            default_volume_bytes = 2147483648
            allocation_unit_bytes = 4096
            capacity_bytes = 10737418240
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "blk.example.com");
        assert_eq!(
            config.controller.lock_wait_timeout(),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(config.controller.rpc_capabilities().unwrap().len(), 2);
        assert_eq!(config.backend.allocation_unit_bytes, 4096);
        assert_eq!(config.backend.capacity_bytes, Some(10 * BYTES_PER_GIB));
    }

    #[test]
    fn rejects_invalid_endpoint() {
        let result = Config::parse(r#"endpoint = "http://localhost:80""#);
        assert!(matches!(result, Err(ConfigError::InvalidEndpoint(_))));
    }

    #[test]
    fn rejects_unknown_capability() {
        let result = Config::parse(
            r#"
            [controller]
            capabilities = ["TELEPORT_VOLUME"]
            "#,
        );
        assert!(matches!(result, Err(ConfigError::UnknownCapability { .. })));
    }

    #[test]
    fn rejects_zero_allocation_unit() {
        let config = BackendConfig {
            allocation_unit_bytes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_long_name() {
        let config = Config {
            name: "x".repeat(64),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "name", .. })
        ));
    }

    #[test]
    fn rejects_unparseable_toml() {
        let result = Config::parse("name = ");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
