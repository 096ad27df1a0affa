//! NBD client side: handshake negotiation and simple-reply transmission.
//!
//! The client is deliberately small. It speaks the fixed-newstyle
//! handshake via the EXPORT_NAME option only, which is all the kernel
//! attach path and the test suite need.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::*;

/// What the server advertised for the negotiated export.
#[derive(Debug, Clone, Copy)]
pub struct ExportInfo {
    pub size: u64,
    pub transmission_flags: u16,
}

impl ExportInfo {
    pub fn read_only(&self) -> bool {
        self.transmission_flags & NBD_FLAG_READ_ONLY != 0
    }
}

/// Negotiate an export over an already-connected stream.
///
/// On success the stream is in transmission mode and may be driven either
/// by [`NbdClient`] or handed to the kernel via the `device` feature.
pub async fn negotiate<S>(stream: &mut S, export_name: &str) -> Result<ExportInfo, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 18];
    stream.read_exact(&mut greeting).await?;
    let mut cursor = &greeting[..];

    let magic = cursor.get_u64();
    if magic != NBD_MAGIC {
        return Err(NbdError::BadMagic {
            expected: NBD_MAGIC,
            found: magic,
        });
    }
    let opts_magic = cursor.get_u64();
    if opts_magic != NBD_OPTS_MAGIC {
        return Err(NbdError::BadMagic {
            expected: NBD_OPTS_MAGIC,
            found: opts_magic,
        });
    }
    let handshake_flags = cursor.get_u16();
    if handshake_flags & NBD_FLAG_FIXED_NEWSTYLE == 0 {
        return Err(NbdError::Handshake {
            reason: "server does not offer fixed newstyle",
        });
    }
    let no_zeroes = handshake_flags & NBD_FLAG_NO_ZEROES != 0;

    let mut client_flags = NBD_FLAG_C_FIXED_NEWSTYLE;
    if no_zeroes {
        client_flags |= NBD_FLAG_C_NO_ZEROES;
    }
    stream.write_all(&client_flags.to_be_bytes()).await?;

    let name = export_name.as_bytes();
    let mut option = BytesMut::with_capacity(16 + name.len());
    option.put_u64(NBD_OPTS_MAGIC);
    option.put_u32(NBD_OPT_EXPORT_NAME);
    option.put_u32(name.len() as u32);
    option.put_slice(name);
    stream.write_all(&option).await?;

    // EXPORT_NAME has no option reply; the server either sends the export
    // block or drops the connection.
    let mut block = [0u8; 10];
    stream.read_exact(&mut block).await?;
    let mut cursor = &block[..];
    let size = cursor.get_u64();
    let transmission_flags = cursor.get_u16();

    if !no_zeroes {
        let mut pad = [0u8; 124];
        stream.read_exact(&mut pad).await?;
    }

    Ok(ExportInfo {
        size,
        transmission_flags,
    })
}

/// A connected NBD client in transmission mode.
#[derive(Debug)]
pub struct NbdClient<S> {
    stream: S,
    info: ExportInfo,
    next_handle: u64,
}

impl<S> NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Connect and negotiate the named export.
    pub async fn connect(mut stream: S, export_name: &str) -> Result<Self, NbdError> {
        let info = negotiate(&mut stream, export_name).await?;
        Ok(Self {
            stream,
            info,
            next_handle: 1,
        })
    }

    pub fn size(&self) -> u64 {
        self.info.size
    }

    pub fn info(&self) -> ExportInfo {
        self.info
    }

    /// Read `length` bytes starting at `offset`.
    pub async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes, NbdError> {
        let handle = self.send(Command::Read, offset, length, None).await?;
        self.expect_ok(handle).await?;
        let mut data = BytesMut::zeroed(length as usize);
        self.stream.read_exact(&mut data).await?;
        Ok(data.freeze())
    }

    /// Write `data` starting at `offset`.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), NbdError> {
        let handle = self
            .send(Command::Write, offset, data.len() as u32, Some(data))
            .await?;
        self.expect_ok(handle).await
    }

    pub async fn flush(&mut self) -> Result<(), NbdError> {
        let handle = self.send(Command::Flush, 0, 0, None).await?;
        self.expect_ok(handle).await
    }

    pub async fn trim(&mut self, offset: u64, length: u32) -> Result<(), NbdError> {
        let handle = self.send(Command::Trim, offset, length, None).await?;
        self.expect_ok(handle).await
    }

    /// Send DISC and consume the client. The server sends no reply.
    pub async fn disconnect(mut self) -> Result<(), NbdError> {
        self.send(Command::Disconnect, 0, 0, None).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn send(
        &mut self,
        command: Command,
        offset: u64,
        length: u32,
        payload: Option<&[u8]>,
    ) -> Result<u64, NbdError> {
        let handle = self.next_handle;
        self.next_handle += 1;

        let req = Request::new(command, handle, offset, length);
        self.stream.write_all(&req.encode()).await?;
        if let Some(payload) = payload {
            self.stream.write_all(payload).await?;
        }
        Ok(handle)
    }

    async fn expect_ok(&mut self, handle: u64) -> Result<(), NbdError> {
        let mut buf = [0u8; SimpleReply::WIRE_SIZE];
        self.stream.read_exact(&mut buf).await?;
        let reply = SimpleReply::decode(&buf)?;
        if reply.handle != handle {
            return Err(NbdError::HandleMismatch {
                expected: handle,
                found: reply.handle,
            });
        }
        if reply.errno != NBD_OK {
            return Err(NbdError::ErrorReply { errno: reply.errno });
        }
        Ok(())
    }
}
