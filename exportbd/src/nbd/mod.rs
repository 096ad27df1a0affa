//! The NBD-facing half of the daemon.
//!
//! - [`Server`] drives a single connection (handshake, negotiation,
//!   transmission) against an [`IoHandler`]
//! - [`ImageIo`] translates export-relative I/O into the backing image's
//!   byte space, honoring the partition/offset window
//! - [`Listener`] abstracts over TCP, Unix, and in-memory connection
//!   sources; the accept loop in [`crate::daemon`] consumes it

mod handler;
mod listener;
mod server;

pub use handler::{ImageIo, IoHandler};
pub use listener::{Listener, StreamListener};
pub use server::{Export, Server};
