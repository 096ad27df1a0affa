//! The running daemon: export resolution, the admission-gated accept
//! loop, and the shutdown sequence.
//!
//! # Example
//!
//! ```ignore
//! use exportbd::{Config, Daemon};
//! use tokio::net::TcpListener;
//!
//! let daemon = Daemon::from_config(config).await?;
//! let listener = TcpListener::bind("127.0.0.1:10809").await?;
//! daemon.run(listener).await?;
//! ```

use std::io;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::backend::ImageBackend;
use crate::config::{Config, Rendezvous};
use crate::error::{ConfigError, Error};
use crate::nbd::{Export, ImageIo, Listener, Server};
use crate::partition;
use crate::state::ServerState;

/// A configured exportbd instance.
#[derive(Clone)]
pub struct Daemon {
    server: Server,
    state: Arc<ServerState>,
    config: Arc<Config>,
}

impl Daemon {
    /// Open the image and resolve the exported window.
    ///
    /// A partition number is resolved through the MBR locator here, at
    /// startup; failure means the export is never published.
    pub async fn from_config(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let backend = Arc::new(ImageBackend::open(&config.image, config.export.read_only)?);

        let (window_offset, window_len) = match config.export.partition {
            Some(number) => {
                let (offset, len) = partition::locate(backend.as_ref(), number).await?;
                info!(
                    partition = number,
                    offset,
                    len,
                    "resolved partition to byte range"
                );
                (offset, len)
            }
            None => {
                let offset = config.export.offset;
                if offset > backend.len() {
                    return Err(ConfigError::InvalidValue {
                        field: "export.offset",
                        reason: "past the end of the image",
                    }
                    .into());
                }
                (offset, backend.len() - offset)
            }
        };

        let export = Export {
            name: config.export.name.clone(),
            size: window_len,
            read_only: config.export.read_only,
        };
        let handler = Arc::new(ImageIo::new(backend, window_offset, window_len));
        let state = Arc::new(ServerState::new(
            config.serve.shared,
            config.serve.persistent,
        ));

        Ok(Self {
            server: Server::new(handler, export),
            state,
            config: Arc::new(config),
        })
    }

    /// Shared state handle, for wiring up signal handling.
    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn export_size(&self) -> u64 {
        self.server.export().size
    }

    /// Serve until the lifecycle says stop, then shut down in order.
    ///
    /// The accept loop and, with `--connect`, the local-attach worker run
    /// concurrently. Accept failures are absorbed; the attach worker's
    /// failure is the only error this returns, surfacing as the process's
    /// exit status.
    pub async fn run<L>(&self, listener: L) -> Result<(), Error>
    where
        L: Listener + 'static,
    {
        info!(
            export = %self.server.export().name,
            size = self.server.export().size,
            read_only = self.server.export().read_only,
            "serving export"
        );

        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.server.clone(),
            Arc::clone(&self.state),
        ));

        let attach_task = self.config.attach.clone().map(|device| {
            let state = Arc::clone(&self.state);
            let rendezvous = self.config.listen.rendezvous();
            let export_name = self.server.export().name.clone();
            tokio::spawn(async move {
                let result = match rendezvous {
                    Ok(rendezvous) => {
                        crate::attach::run_local_attach(&device, &rendezvous, &export_name).await
                    }
                    Err(e) => Err(nbd::NbdError::Io(io::Error::other(e))),
                };
                if let Err(ref e) = result {
                    error!(error = %e, device = %device.display(), "local attach failed");
                }
                // The attach is this process's reason to exist; when it
                // ends, so does the server.
                state.request_termination();
                result
            })
        });

        self.state.wait_exit().await;

        // Draining: stop admitting, let the accept loop wind down, and
        // drop the listener with it.
        self.state.request_termination();
        let _ = accept_task.await;

        if let Ok(Rendezvous::Unix(path)) = self.config.listen.rendezvous() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(error = %e, path = %path.display(), "failed to remove socket");
                }
            }
        }

        if let Some(task) = attach_task {
            task.await
                .map_err(|e| Error::Io(io::Error::other(e)))?
                .map_err(Error::Attach)?;
        }

        info!("export closed");
        Ok(())
    }
}

/// Admission-gated accept loop.
///
/// The listener is only polled again while the gate holds; when the
/// server is full, new readiness is left unarmed until a client leaves.
/// The gate check and the accept are not atomic, so a connection that
/// does complete its accept is always counted and served.
async fn accept_loop<L>(mut listener: L, server: Server, state: Arc<ServerState>)
where
    L: Listener,
{
    loop {
        if !state.admission_ready().await {
            return;
        }

        let stream = tokio::select! {
            result = listener.accept() => match result {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = state.terminated() => return,
        };

        state.on_accepted();
        debug!(active = state.active_clients(), "client connected");

        let server = server.clone();
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = server.serve(stream).await {
                warn!(error = %e, "connection ended with error");
            }
            // Exactly one close notification per counted connection.
            state.on_closed();
            debug!(active = state.active_clients(), "client disconnected");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nbd::StreamListener;
    use nbd::NbdClient;
    use std::io::Write;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    async fn test_daemon(
        persistent: bool,
        shared: usize,
    ) -> (tempfile::NamedTempFile, Daemon) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; 64 * 1024]).unwrap();
        file.flush().unwrap();

        let mut config = Config::new(file.path().to_path_buf());
        config.serve.persistent = persistent;
        config.serve.shared = shared;
        let daemon = Daemon::from_config(config).await.unwrap();
        (file, daemon)
    }

    #[tokio::test]
    async fn non_persistent_run_ends_when_drained() {
        let (_image, daemon) = test_daemon(false, 1).await;
        let (tx, listener) = StreamListener::new(4);

        let run = tokio::spawn({
            let daemon = daemon.clone();
            async move { daemon.run(listener).await }
        });

        let (client_stream, server_stream) = duplex(1 << 16);
        tx.send(server_stream).await.unwrap();

        let mut client = NbdClient::connect(client_stream, "").await.unwrap();
        assert_eq!(client.size(), 64 * 1024);
        let data = client.read(0, 512).await.unwrap();
        assert_eq!(data.len(), 512);
        client.disconnect().await.unwrap();

        // No interrupt needed: served once and drained.
        timeout(Duration::from_secs(5), run)
            .await
            .expect("daemon should exit after the last client")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn persistent_run_waits_for_termination() {
        let (_image, daemon) = test_daemon(true, 1).await;
        let (tx, listener) = StreamListener::new(4);
        let state = daemon.state();

        let run = tokio::spawn({
            let daemon = daemon.clone();
            async move { daemon.run(listener).await }
        });

        let (client_stream, server_stream) = duplex(1 << 16);
        tx.send(server_stream).await.unwrap();
        let client = NbdClient::connect(client_stream, "").await.unwrap();
        client.disconnect().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!run.is_finished(), "persistent daemon must keep serving");

        state.request_termination();
        timeout(Duration::from_secs(5), run)
            .await
            .expect("daemon should exit once termination is requested")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn full_gate_leaves_next_connection_unaccepted() {
        let (_image, daemon) = test_daemon(true, 1).await;
        let (tx, listener) = StreamListener::new(4);
        let state = daemon.state();

        let run = tokio::spawn({
            let daemon = daemon.clone();
            async move { daemon.run(listener).await }
        });

        let (first_stream, server_stream) = duplex(1 << 16);
        tx.send(server_stream).await.unwrap();
        let first = NbdClient::connect(first_stream, "").await.unwrap();

        // Second connection is queued but the listener is not re-armed
        // while the gate is full, so its handshake never starts.
        let (second_stream, server_stream) = duplex(1 << 16);
        tx.send(server_stream).await.unwrap();
        let mut pending = Box::pin(NbdClient::connect(second_stream, ""));
        assert!(
            timeout(Duration::from_millis(100), pending.as_mut())
                .await
                .is_err(),
            "second client must not be admitted while the first is active"
        );

        // Freeing the slot lets the queued connection through.
        first.disconnect().await.unwrap();
        let second = timeout(Duration::from_secs(5), pending)
            .await
            .expect("second client should be admitted after the close")
            .unwrap();

        second.disconnect().await.unwrap();
        state.request_termination();
        timeout(Duration::from_secs(5), run)
            .await
            .expect("daemon should exit")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn attach_failure_terminates_run_with_attach_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; 64 * 1024]).unwrap();
        file.flush().unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // The negotiation against our own listener succeeds; opening the
        // device node does not. Even persistent, the server must come
        // down with the worker and report its failure.
        let device_dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(file.path().to_path_buf());
        config.serve.persistent = true;
        config.listen.bind = Some("127.0.0.1".to_string());
        config.listen.port = Some(port);
        config.attach = Some(device_dir.path().join("nbd0"));

        let daemon = Daemon::from_config(config).await.unwrap();
        let err = timeout(Duration::from_secs(5), daemon.run(listener))
            .await
            .expect("a failed attach worker must bring the server down")
            .unwrap_err();
        assert!(matches!(err, Error::Attach(_)));
    }
}
