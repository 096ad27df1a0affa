//! Local-attach worker: connect the export to a kernel NBD device.
//!
//! The worker dials our own listening socket as an ordinary NBD client,
//! negotiates the export, then hands the connected socket to the kernel
//! driver and blocks until the device is disconnected. Whatever way it
//! ends, the daemon shuts down with it; attaching is the only job of a
//! process started with `--connect`.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use tokio::net::{TcpStream, UnixStream};
use tokio::task;
use tracing::info;

use nbd::{ExportInfo, KernelDevice, NbdError, negotiate, trigger_partition_rescan};

use crate::config::Rendezvous;

/// Attach `device` to the export served at `rendezvous` and block until
/// the device is disconnected.
pub async fn run_local_attach(
    device: &Path,
    rendezvous: &Rendezvous,
    export_name: &str,
) -> Result<(), NbdError> {
    let (socket, info) = connect_and_negotiate(rendezvous, export_name).await?;
    let device = device.to_path_buf();
    task::spawn_blocking(move || serve_device(&device, socket, info))
        .await
        .map_err(|e| NbdError::Io(io::Error::other(e)))?
}

async fn connect_and_negotiate(
    rendezvous: &Rendezvous,
    export_name: &str,
) -> Result<(OwnedFd, ExportInfo), NbdError> {
    match rendezvous {
        Rendezvous::Unix(path) => {
            let mut stream = UnixStream::connect(path).await?;
            let info = negotiate(&mut stream, export_name).await?;
            let stream = stream.into_std()?;
            stream.set_nonblocking(false)?;
            Ok((stream.into(), info))
        }
        Rendezvous::Tcp(addr) => {
            let mut addr = *addr;
            if addr.ip().is_unspecified() {
                // We are dialing ourselves; a wildcard bind address is
                // not a dialable one.
                addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
            }
            let mut stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            let info = negotiate(&mut stream, export_name).await?;
            let stream = stream.into_std()?;
            stream.set_nonblocking(false)?;
            Ok((stream.into(), info))
        }
    }
}

fn serve_device(device: &Path, socket: OwnedFd, info: ExportInfo) -> Result<(), NbdError> {
    let kernel = KernelDevice::open(device)?;
    kernel.configure(socket.as_raw_fd(), info.size, info.transmission_flags)?;

    // An open/close from another thread makes the kernel re-read the
    // device's partition table once it is live.
    let rescan_path = device.to_path_buf();
    std::thread::spawn(move || trigger_partition_rescan(&rescan_path));

    info!(device = %device.display(), size = info.size, "NBD device connected");

    // Blocks in the kernel until disconnect; the socket fd must stay
    // open for the whole time, so it is dropped only afterwards.
    let result = kernel.serve();
    drop(socket);
    result.map_err(NbdError::Io)
}
