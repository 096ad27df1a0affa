//! Per-connection NBD server.
//!
//! Fixed-newstyle handshake, the EXPORT_NAME/LIST/ABORT option set, and
//! simple replies in the transmission phase. One `Server::serve` call
//! handles exactly one connection; accepting and admission live in
//! [`crate::daemon`].

use std::io;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use nbd::*;

use super::handler::IoHandler;

/// The one export this server publishes.
#[derive(Debug, Clone)]
pub struct Export {
    /// Negotiated name; the empty string is the default export, which
    /// every client name request is also allowed to select.
    pub name: String,
    pub size: u64,
    pub read_only: bool,
}

impl Export {
    fn transmission_flags(&self) -> u16 {
        let mut flags = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH | NBD_FLAG_SEND_TRIM;
        if self.read_only {
            flags |= NBD_FLAG_READ_ONLY;
        }
        flags
    }

    fn accepts_name(&self, requested: &[u8]) -> bool {
        requested.is_empty() || requested == self.name.as_bytes()
    }
}

/// Serves one connection at a time against an [`IoHandler`].
#[derive(Clone)]
pub struct Server {
    handler: Arc<dyn IoHandler>,
    export: Export,
}

impl Server {
    pub fn new(handler: Arc<dyn IoHandler>, export: Export) -> Self {
        Self { handler, export }
    }

    pub fn export(&self) -> &Export {
        &self.export
    }

    /// Drive a single connection to completion.
    ///
    /// Returns `Ok(())` on a clean disconnect, including a client that
    /// aborts during negotiation or goes away between requests.
    pub async fn serve<S>(&self, mut stream: S) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let no_zeroes = self.handshake(&mut stream).await?;
        if !self.negotiate(&mut stream, no_zeroes).await? {
            return Ok(());
        }
        self.transmission(&mut stream).await
    }

    async fn handshake<S>(&self, stream: &mut S) -> Result<bool, NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut greeting = BytesMut::with_capacity(18);
        greeting.put_u64(NBD_MAGIC);
        greeting.put_u64(NBD_OPTS_MAGIC);
        greeting.put_u16(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES);
        stream.write_all(&greeting).await?;

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await?;
        let client_flags = u32::from_be_bytes(buf);
        if client_flags & NBD_FLAG_C_FIXED_NEWSTYLE == 0 {
            return Err(NbdError::Handshake {
                reason: "client must speak fixed newstyle",
            });
        }
        Ok(client_flags & NBD_FLAG_C_NO_ZEROES != 0)
    }

    /// Run the option phase. Returns `false` when the client left without
    /// entering transmission (ABORT or an export-name mismatch).
    async fn negotiate<S>(&self, stream: &mut S, no_zeroes: bool) -> Result<bool, NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let mut header = [0u8; 16];
            stream.read_exact(&mut header).await?;
            let mut cursor = &header[..];

            let magic = cursor.get_u64();
            if magic != NBD_OPTS_MAGIC {
                return Err(NbdError::BadMagic {
                    expected: NBD_OPTS_MAGIC,
                    found: magic,
                });
            }
            let option = cursor.get_u32();
            let length = cursor.get_u32();
            if length > NBD_MAX_OPTION_SIZE {
                return Err(NbdError::Oversize {
                    length,
                    limit: NBD_MAX_OPTION_SIZE,
                });
            }

            let mut data = vec![0u8; length as usize];
            stream.read_exact(&mut data).await?;
            debug!(option, length, "client option");

            match option {
                NBD_OPT_EXPORT_NAME => {
                    if !self.export.accepts_name(&data) {
                        // EXPORT_NAME has no error reply; the connection
                        // is simply closed.
                        return Ok(false);
                    }
                    let mut block = BytesMut::with_capacity(10);
                    block.put_u64(self.export.size);
                    block.put_u16(self.export.transmission_flags());
                    stream.write_all(&block).await?;
                    if !no_zeroes {
                        stream.write_all(&[0u8; 124]).await?;
                    }
                    return Ok(true);
                }
                NBD_OPT_LIST => {
                    let name = self.export.name.as_bytes();
                    let mut entry = BytesMut::with_capacity(4 + name.len());
                    entry.put_u32(name.len() as u32);
                    entry.put_slice(name);
                    option_reply(stream, option, NBD_REP_SERVER, &entry).await?;
                    option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                }
                NBD_OPT_ABORT => {
                    option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                    return Ok(false);
                }
                _ => {
                    option_reply(stream, option, NBD_REP_ERR_UNSUP, &[]).await?;
                }
            }
        }
    }

    async fn transmission<S>(&self, stream: &mut S) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut header = [0u8; Request::WIRE_SIZE];

        loop {
            match stream.read_exact(&mut header).await {
                Ok(_) => {}
                // A client that simply goes away is a normal end.
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            let request = Request::decode(&header)?;

            let command = match request.command() {
                Some(command) => command,
                None => {
                    warn!(command = request.raw_command, "unsupported command");
                    reply(stream, SimpleReply::error(request.handle, NBD_EINVAL)).await?;
                    continue;
                }
            };

            match command {
                Command::Read => {
                    if request.length > NBD_MAX_PAYLOAD_SIZE {
                        reply(stream, SimpleReply::error(request.handle, NBD_EINVAL)).await?;
                        continue;
                    }
                    match self
                        .handler
                        .read_at(request.offset, request.length as usize)
                        .await
                    {
                        Ok(data) => {
                            reply(stream, SimpleReply::ok(request.handle)).await?;
                            stream.write_all(&data).await?;
                        }
                        Err(e) => {
                            warn!(error = %e, offset = request.offset, "read failed");
                            reply(stream, SimpleReply::error(request.handle, errno_for(&e)))
                                .await?;
                        }
                    }
                }
                Command::Write => {
                    if request.length > NBD_MAX_PAYLOAD_SIZE {
                        // The payload cannot be skipped without reading
                        // it; refusing to allocate means giving up on the
                        // stream.
                        return Err(NbdError::Oversize {
                            length: request.length,
                            limit: NBD_MAX_PAYLOAD_SIZE,
                        });
                    }
                    let mut data = BytesMut::zeroed(request.length as usize);
                    stream.read_exact(&mut data).await?;

                    let status = if self.export.read_only {
                        NBD_EPERM
                    } else {
                        match self.handler.write_at(request.offset, data.freeze()).await {
                            Ok(()) => NBD_OK,
                            Err(e) => {
                                warn!(error = %e, offset = request.offset, "write failed");
                                errno_for(&e)
                            }
                        }
                    };
                    reply(stream, SimpleReply::error(request.handle, status)).await?;
                }
                Command::Disconnect => return Ok(()),
                Command::Flush => {
                    let status = match self.handler.flush().await {
                        Ok(()) => NBD_OK,
                        Err(e) => {
                            warn!(error = %e, "flush failed");
                            errno_for(&e)
                        }
                    };
                    reply(stream, SimpleReply::error(request.handle, status)).await?;
                }
                Command::Trim => {
                    let status = if self.export.read_only {
                        NBD_EPERM
                    } else {
                        match self
                            .handler
                            .trim(request.offset, request.length as u64)
                            .await
                        {
                            Ok(()) => NBD_OK,
                            Err(e) => {
                                warn!(error = %e, offset = request.offset, "trim failed");
                                errno_for(&e)
                            }
                        }
                    };
                    reply(stream, SimpleReply::error(request.handle, status)).await?;
                }
            }
        }
    }
}

async fn option_reply<S>(
    stream: &mut S,
    option: u32,
    reply_type: u32,
    data: &[u8],
) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    let mut header = BytesMut::with_capacity(20 + data.len());
    header.put_u64(NBD_OPTION_REPLY_MAGIC);
    header.put_u32(option);
    header.put_u32(reply_type);
    header.put_u32(data.len() as u32);
    header.put_slice(data);
    stream.write_all(&header).await?;
    Ok(())
}

async fn reply<S>(stream: &mut S, reply: SimpleReply) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&reply.encode()).await?;
    Ok(())
}

fn errno_for(e: &io::Error) -> u32 {
    match e.kind() {
        io::ErrorKind::InvalidInput => NBD_EINVAL,
        io::ErrorKind::PermissionDenied => NBD_EPERM,
        io::ErrorKind::StorageFull => NBD_ENOSPC,
        _ => NBD_EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ImageBackend;
    use crate::nbd::ImageIo;
    use nbd::NbdClient;
    use std::io::Write;
    use tokio::io::duplex;

    fn test_server(content: &[u8], read_only: bool) -> (tempfile::NamedTempFile, Server) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        let backend = Arc::new(ImageBackend::open(file.path(), read_only).unwrap());
        let len = backend.len();
        let handler = Arc::new(ImageIo::new(backend, 0, len));
        let export = Export {
            name: String::new(),
            size: len,
            read_only,
        };
        (file, Server::new(handler, export))
    }

    #[tokio::test]
    async fn negotiates_and_serves_reads_and_writes() {
        let (_file, server) = test_server(&[0u8; 4096], false);
        let (client_stream, server_stream) = duplex(1 << 16);
        let server_task = tokio::spawn(async move { server.serve(server_stream).await });

        let mut client = NbdClient::connect(client_stream, "").await.unwrap();
        assert_eq!(client.size(), 4096);

        client.write(512, b"hello exportbd").await.unwrap();
        client.flush().await.unwrap();
        let data = client.read(512, 14).await.unwrap();
        assert_eq!(&data[..], b"hello exportbd");

        client.disconnect().await.unwrap();
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn read_only_export_refuses_writes() {
        let (_file, server) = test_server(&[0u8; 1024], true);
        let (client_stream, server_stream) = duplex(1 << 16);
        let server_task = tokio::spawn(async move { server.serve(server_stream).await });

        let mut client = NbdClient::connect(client_stream, "").await.unwrap();
        assert!(client.info().read_only());

        let err = client.write(0, b"nope").await.unwrap_err();
        assert!(matches!(err, NbdError::ErrorReply { errno: NBD_EPERM }));

        // The connection survives the refused write.
        let data = client.read(0, 4).await.unwrap();
        assert_eq!(&data[..], &[0u8; 4]);

        client.disconnect().await.unwrap();
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn out_of_range_read_gets_einval() {
        let (_file, server) = test_server(&[0u8; 1024], false);
        let (client_stream, server_stream) = duplex(1 << 16);
        let server_task = tokio::spawn(async move { server.serve(server_stream).await });

        let mut client = NbdClient::connect(client_stream, "").await.unwrap();
        let err = client.read(1020, 8).await.unwrap_err();
        assert!(matches!(err, NbdError::ErrorReply { errno: NBD_EINVAL }));

        client.disconnect().await.unwrap();
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn mismatched_export_name_closes_cleanly() {
        let (_file, server) = {
            let (file, mut server) = test_server(&[0u8; 1024], false);
            server.export.name = "disk0".to_string();
            (file, server)
        };
        let (client_stream, server_stream) = duplex(1 << 16);
        let server_task = tokio::spawn(async move { server.serve(server_stream).await });

        let err = NbdClient::connect(client_stream, "other").await.unwrap_err();
        assert!(matches!(err, NbdError::Io(_)));
        server_task.await.unwrap().unwrap();
    }
}
