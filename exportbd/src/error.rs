//! Error types for exportbd.

use std::io;
use thiserror::Error;

// Re-export NbdError from the nbd crate
pub use nbd::NbdError;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("partition lookup failed: {0}")]
    Partition(#[from] PartitionError),

    #[error("nbd protocol error: {0}")]
    Nbd(#[from] NbdError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("local attach failed: {0}")]
    Attach(#[source] NbdError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Partition locator errors.
#[derive(Debug, Error)]
pub enum PartitionError {
    /// Sector 0 does not end in the 0x55 0xAA boot signature.
    #[error("no master boot record: missing 0x55aa boot signature")]
    InvalidLayout,

    #[error("partition {0} not found")]
    NotFound(u32),

    #[error("failed to read partition table: {0}")]
    Io(#[from] io::Error),
}

/// Configuration errors.
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = PartitionError::NotFound(6);
        assert!(err.to_string().contains('6'));

        let err = Error::from(PartitionError::InvalidLayout);
        assert!(err.to_string().contains("boot signature"));
    }
}
