//! Connection sources for the accept loop.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;

/// Something the accept loop can take connections from.
///
/// Implemented for `TcpListener`, `UnixListener`, and the channel-backed
/// [`StreamListener`] used in tests.
#[async_trait]
pub trait Listener: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for and return the next incoming connection.
    async fn accept(&mut self) -> std::io::Result<Self::Stream>;
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> std::io::Result<Self::Stream> {
        let (stream, _addr) = TcpListener::accept(self).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Listener for UnixListener {
    type Stream = UnixStream;

    async fn accept(&mut self) -> std::io::Result<Self::Stream> {
        let (stream, _addr) = UnixListener::accept(self).await?;
        Ok(stream)
    }
}

/// Accepts whatever streams are pushed into a channel.
///
/// Tests pair this with `tokio::io::duplex` so clients never need a real
/// socket. Once every sender is gone the accept stays pending forever,
/// like an idle socket listener; shutdown comes from the lifecycle, not
/// from the connection source.
pub struct StreamListener<S> {
    rx: mpsc::Receiver<S>,
}

impl<S> StreamListener<S> {
    pub fn new(capacity: usize) -> (mpsc::Sender<S>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl<S> Listener for StreamListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    async fn accept(&mut self) -> std::io::Result<Self::Stream> {
        match self.rx.recv().await {
            Some(stream) => Ok(stream),
            // Every sender has been dropped; nothing will ever arrive.
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    #[tokio::test]
    async fn stream_listener_yields_in_order_then_parks_on_close() {
        let (tx, mut listener) = StreamListener::new(2);

        let (_a, server_a) = duplex(64);
        let (_b, server_b) = duplex(64);
        tx.send(server_a).await.unwrap();
        tx.send(server_b).await.unwrap();
        drop(tx);

        listener.accept().await.unwrap();
        listener.accept().await.unwrap();

        // An exhausted source never errors; it behaves like a listener
        // with no pending connections.
        assert!(
            timeout(Duration::from_millis(100), listener.accept())
                .await
                .is_err()
        );
    }
}
