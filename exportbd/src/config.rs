//! Configuration for exportbd.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Highest partition number `--partition` accepts: four primaries plus
/// one level of logical partitions.
pub const MAX_PARTITION: u32 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the raw image being exported.
    pub image: PathBuf,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub serve: ServeConfig,
    /// Local NBD device to attach the export to (e.g. `/dev/nbd0`).
    #[serde(default)]
    pub attach: Option<PathBuf>,
}

impl Config {
    pub fn new(image: PathBuf) -> Self {
        Self {
            image,
            export: ExportConfig::default(),
            listen: ListenConfig::default(),
            serve: ServeConfig::default(),
            attach: None,
        }
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.export.validate()?;
        self.listen.validate()?;
        self.serve.validate()?;
        Ok(())
    }
}

/// What slice of the image is exported, and how.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExportConfig {
    /// Export name clients negotiate; empty selects the default export.
    pub name: String,
    /// Byte offset into the image. Ignored when `partition` is set.
    pub offset: u64,
    /// 1-based MBR partition number to export instead of the whole image.
    pub partition: Option<u32>,
    pub read_only: bool,
}

impl ExportConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(partition) = self.partition {
            if !(1..=MAX_PARTITION).contains(&partition) {
                return Err(ConfigError::InvalidValue {
                    field: "export.partition",
                    reason: "must be between 1 and 8",
                });
            }
            if self.offset != 0 {
                return Err(ConfigError::InvalidValue {
                    field: "export.offset",
                    reason: "cannot be combined with a partition number",
                });
            }
        }
        Ok(())
    }
}

/// Where the server listens: a Unix socket path or a TCP endpoint,
/// mutually exclusive.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ListenConfig {
    pub socket: Option<PathBuf>,
    pub bind: Option<String>,
    pub port: Option<u16>,
}

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 10809;

impl ListenConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref socket) = self.socket {
            if !socket.is_absolute() {
                return Err(ConfigError::InvalidValue {
                    field: "listen.socket",
                    reason: "socket path must be absolute",
                });
            }
            if self.bind.is_some() || self.port.is_some() {
                return Err(ConfigError::InvalidValue {
                    field: "listen",
                    reason: "socket and bind/port are mutually exclusive",
                });
            }
        }
        Ok(())
    }

    pub fn rendezvous(&self) -> Result<Rendezvous, ConfigError> {
        if let Some(ref socket) = self.socket {
            return Ok(Rendezvous::Unix(socket.clone()));
        }
        let bind = self.bind.as_deref().unwrap_or(DEFAULT_BIND);
        let port = self.port.unwrap_or(DEFAULT_PORT);
        let addr: SocketAddr =
            format!("{bind}:{port}")
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    field: "listen.bind",
                    reason: "not a valid address",
                })?;
        Ok(Rendezvous::Tcp(addr))
    }
}

/// A resolved listening endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendezvous {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// How many clients may be connected at once (`--shared`).
    pub shared: usize,
    /// Keep serving after the last client disconnects (`--persistent`).
    pub persistent: bool,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            shared: 1,
            persistent: false,
        }
    }
}

impl ServeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.shared == 0 {
            return Err(ConfigError::InvalidValue {
                field: "serve.shared",
                reason: "must be >= 1",
            });
        }
        Ok(())
    }
}
