//! NBD wire constants and message codecs.
//!
//! Only the parts of the protocol exportbd speaks are modeled: the
//! fixed-newstyle handshake, the EXPORT_NAME/LIST/ABORT option set, and
//! simple replies. Structured replies and extended headers are not
//! implemented.

#![allow(dead_code)]

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// "NBDMAGIC", first 8 bytes of the server greeting.
pub const NBD_MAGIC: u64 = 0x4e42_444d_4147_4943;
/// "IHAVEOPT", second 8 bytes of the greeting and the option-header magic.
pub const NBD_OPTS_MAGIC: u64 = 0x4948_4156_454f_5054;
pub const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;
pub const NBD_OPTION_REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;

// Handshake flags (server -> client)
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;

// Client flags (client -> server)
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;
pub const NBD_FLAG_C_NO_ZEROES: u32 = 1 << 1;

// Transmission flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;

// Options
pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;

// Option reply types
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_ERR_UNSUP: u32 = 0x8000_0001;
pub const NBD_REP_ERR_INVALID: u32 = 0x8000_0003;
pub const NBD_REP_ERR_UNKNOWN: u32 = 0x8000_0006;

// Transmission commands
pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISC: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_TRIM: u16 = 4;

// Simple-reply error values (a subset of errno)
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;

/// Largest READ/WRITE payload the server will honor (32 MiB).
///
/// Bounds buffer allocation against misbehaving clients. TRIM carries no
/// payload and is not subject to this limit.
pub const NBD_MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024;

/// Largest option-data blob accepted during negotiation.
pub const NBD_MAX_OPTION_SIZE: u32 = 64 * 1024;

/// NBD protocol errors.
#[derive(Debug, Error)]
pub enum NbdError {
    #[error("bad magic: expected 0x{expected:x}, found 0x{found:x}")]
    BadMagic { expected: u64, found: u64 },

    #[error("handshake failed: {reason}")]
    Handshake { reason: &'static str },

    #[error("oversized transfer: {length} bytes (limit {limit})")]
    Oversize { length: u32, limit: u32 },

    #[error("server refused export {name:?}")]
    ExportRefused { name: String },

    #[error("server replied with error {errno}")]
    ErrorReply { errno: u32 },

    #[error("reply handle {found} does not match request handle {expected}")]
    HandleMismatch { expected: u64, found: u64 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Transmission commands exportbd understands.
///
/// Anything else on the wire is answered with an EINVAL simple reply; see
/// [`Request::command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Read,
    Write,
    Disconnect,
    Flush,
    Trim,
}

impl Command {
    pub fn from_wire(raw: u16) -> Option<Self> {
        match raw {
            NBD_CMD_READ => Some(Self::Read),
            NBD_CMD_WRITE => Some(Self::Write),
            NBD_CMD_DISC => Some(Self::Disconnect),
            NBD_CMD_FLUSH => Some(Self::Flush),
            NBD_CMD_TRIM => Some(Self::Trim),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            Self::Read => NBD_CMD_READ,
            Self::Write => NBD_CMD_WRITE,
            Self::Disconnect => NBD_CMD_DISC,
            Self::Flush => NBD_CMD_FLUSH,
            Self::Trim => NBD_CMD_TRIM,
        }
    }
}

/// A transmission request header (28 bytes on the wire).
///
/// The raw command word is kept as received so a server can reply to an
/// unsupported command instead of tearing the connection down.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub flags: u16,
    pub raw_command: u16,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

impl Request {
    pub const WIRE_SIZE: usize = 28;

    pub fn new(command: Command, handle: u64, offset: u64, length: u32) -> Self {
        Self {
            flags: 0,
            raw_command: command.to_wire(),
            handle,
            offset,
            length,
        }
    }

    /// The decoded command, or `None` for a command this server does not speak.
    pub fn command(&self) -> Option<Command> {
        Command::from_wire(self.raw_command)
    }

    pub fn decode(buf: &[u8; Self::WIRE_SIZE]) -> Result<Self, NbdError> {
        let mut buf = &buf[..];
        let magic = buf.get_u32();
        if magic != NBD_REQUEST_MAGIC {
            return Err(NbdError::BadMagic {
                expected: NBD_REQUEST_MAGIC as u64,
                found: magic as u64,
            });
        }
        Ok(Self {
            flags: buf.get_u16(),
            raw_command: buf.get_u16(),
            handle: buf.get_u64(),
            offset: buf.get_u64(),
            length: buf.get_u32(),
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::WIRE_SIZE);
        buf.put_u32(NBD_REQUEST_MAGIC);
        buf.put_u16(self.flags);
        buf.put_u16(self.raw_command);
        buf.put_u64(self.handle);
        buf.put_u64(self.offset);
        buf.put_u32(self.length);
        buf
    }
}

/// A simple reply header (16 bytes on the wire).
#[derive(Debug, Clone, Copy)]
pub struct SimpleReply {
    pub errno: u32,
    pub handle: u64,
}

impl SimpleReply {
    pub const WIRE_SIZE: usize = 16;

    pub fn ok(handle: u64) -> Self {
        Self {
            errno: NBD_OK,
            handle,
        }
    }

    pub fn error(handle: u64, errno: u32) -> Self {
        Self { errno, handle }
    }

    pub fn decode(buf: &[u8; Self::WIRE_SIZE]) -> Result<Self, NbdError> {
        let mut buf = &buf[..];
        let magic = buf.get_u32();
        if magic != NBD_SIMPLE_REPLY_MAGIC {
            return Err(NbdError::BadMagic {
                expected: NBD_SIMPLE_REPLY_MAGIC as u64,
                found: magic as u64,
            });
        }
        Ok(Self {
            errno: buf.get_u32(),
            handle: buf.get_u64(),
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::WIRE_SIZE);
        buf.put_u32(NBD_SIMPLE_REPLY_MAGIC);
        buf.put_u32(self.errno);
        buf.put_u64(self.handle);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = Request::new(Command::Write, 7, 4096, 512);
        let wire = req.encode();
        let decoded = Request::decode(wire.as_ref().try_into().unwrap()).unwrap();
        assert_eq!(decoded.command(), Some(Command::Write));
        assert_eq!(decoded.handle, 7);
        assert_eq!(decoded.offset, 4096);
        assert_eq!(decoded.length, 512);
    }

    #[test]
    fn request_rejects_bad_magic() {
        let mut wire = Request::new(Command::Read, 1, 0, 512).encode();
        wire[0] ^= 0xff;
        let err = Request::decode(wire.as_ref().try_into().unwrap()).unwrap_err();
        assert!(matches!(err, NbdError::BadMagic { .. }));
    }

    #[test]
    fn unknown_command_survives_decoding() {
        let mut req = Request::new(Command::Read, 1, 0, 0);
        req.raw_command = 0x77;
        let wire = req.encode();
        let decoded = Request::decode(wire.as_ref().try_into().unwrap()).unwrap();
        assert_eq!(decoded.command(), None);
        assert_eq!(decoded.raw_command, 0x77);
    }

    #[test]
    fn reply_roundtrip() {
        let wire = SimpleReply::error(42, NBD_EIO).encode();
        let decoded = SimpleReply::decode(wire.as_ref().try_into().unwrap()).unwrap();
        assert_eq!(decoded.handle, 42);
        assert_eq!(decoded.errno, NBD_EIO);
    }
}
