//! exportbd: serve a disk image, or one MBR partition of it, as an NBD
//! export, optionally attached to a local kernel block device.
//!
//! # Library Usage
//!
//! The primary API is the [`Daemon`] struct:
//!
//! ```ignore
//! use exportbd::{Config, Daemon};
//! use tokio::net::TcpListener;
//!
//! let daemon = Daemon::from_config(config).await?;
//! let listener = TcpListener::bind("127.0.0.1:10809").await?;
//! daemon.run(listener).await?;
//! ```

pub mod attach;
pub mod backend;
pub mod config;
pub mod daemon;
pub mod error;
pub mod nbd;
pub mod partition;
pub mod state;

pub use backend::ImageBackend;
pub use config::{Config, ExportConfig, ListenConfig, Rendezvous, ServeConfig};
pub use daemon::Daemon;
pub use error::{ConfigError, Error, NbdError, PartitionError, Result};
pub use nbd::{Export, ImageIo, IoHandler, Listener, Server, StreamListener};
pub use partition::{PartitionRecord, SectorRead, locate};
pub use state::ServerState;
