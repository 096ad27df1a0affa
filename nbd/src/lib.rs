//! NBD (Network Block Device) protocol support.
//!
//! Wire constants and codecs for the fixed-newstyle handshake and the
//! simple-reply transmission phase, plus a small client used for testing
//! servers and for handing a negotiated socket to the Linux kernel.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! # Features
//!
//! - `device` - Linux kernel NBD device support (requires root)

mod client;
mod protocol;

#[cfg(all(feature = "device", unix))]
mod device;

pub use client::{ExportInfo, NbdClient, negotiate};
pub use protocol::*;

#[cfg(all(feature = "device", unix))]
pub use device::{KernelDevice, disconnect_device, trigger_partition_rescan};
