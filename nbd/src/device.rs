//! Linux kernel NBD device plumbing.
//!
//! Hands a negotiated socket to the kernel `nbd` driver via ioctls and
//! runs `NBD_DO_IT`, which blocks in the kernel until the device is
//! disconnected. The module replaces what `nbd-client` does for us.
//!
//! The driver must be loaded with `max_part` set for partition scanning:
//! `modprobe nbd max_part=63`.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::libc;

// From linux/nbd.h; architecture-independent values.
const NBD_SET_SOCK: libc::c_ulong = 0xab00;
const NBD_SET_BLKSIZE: libc::c_ulong = 0xab01;
const NBD_DO_IT: libc::c_ulong = 0xab03;
const NBD_CLEAR_SOCK: libc::c_ulong = 0xab04;
const NBD_SET_SIZE_BLOCKS: libc::c_ulong = 0xab07;
const NBD_DISCONNECT: libc::c_ulong = 0xab08;
const NBD_SET_FLAGS: libc::c_ulong = 0xab0a;

/// Sector size the kernel device is configured with.
const DEVICE_BLOCK_SIZE: u64 = 512;

fn ioctl(fd: RawFd, request: libc::c_ulong, arg: libc::c_ulong) -> io::Result<()> {
    // Safety: all NBD ioctls used here take an integer argument.
    if unsafe { libc::ioctl(fd, request, arg) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// An open `/dev/nbdX` node.
pub struct KernelDevice {
    file: File,
    path: PathBuf,
}

impl KernelDevice {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point the device at a negotiated NBD socket.
    ///
    /// `size` and `flags` are what the server advertised during the
    /// handshake. The socket must stay open for as long as [`serve`]
    /// runs; the caller keeps ownership of it.
    ///
    /// [`serve`]: KernelDevice::serve
    pub fn configure(&self, socket: RawFd, size: u64, flags: u16) -> io::Result<()> {
        let fd = self.file.as_raw_fd();

        // A previous client may have left the device configured.
        let _ = ioctl(fd, NBD_CLEAR_SOCK, 0);

        ioctl(fd, NBD_SET_BLKSIZE, DEVICE_BLOCK_SIZE as libc::c_ulong)?;
        ioctl(
            fd,
            NBD_SET_SIZE_BLOCKS,
            (size / DEVICE_BLOCK_SIZE) as libc::c_ulong,
        )?;
        ioctl(fd, NBD_SET_FLAGS, flags as libc::c_ulong)?;
        ioctl(fd, NBD_SET_SOCK, socket as libc::c_ulong)?;
        Ok(())
    }

    /// Run the kernel transmission loop.
    ///
    /// Blocks until the device is disconnected, either by
    /// [`disconnect_device`] or by the server going away. ENOTCONN after
    /// a disconnect is the normal exit and is not reported as an error.
    pub fn serve(&self) -> io::Result<()> {
        match ioctl(self.file.as_raw_fd(), NBD_DO_IT, 0) {
            Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(()),
            other => other,
        }
    }
}

/// Disconnect a device by path, as `nbd-client -d` does.
///
/// Opens the node fresh rather than reusing the fd blocked in
/// `NBD_DO_IT`, then sends DISCONNECT followed by CLEAR_SOCK. Errors
/// from the ioctls are ignored; the device may already be down.
pub fn disconnect_device(path: impl AsRef<Path>) -> io::Result<()> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let fd = file.as_raw_fd();
    let _ = ioctl(fd, NBD_DISCONNECT, 0);
    let _ = ioctl(fd, NBD_CLEAR_SOCK, 0);
    Ok(())
}

/// Make the kernel re-read the device's partition table.
///
/// A plain open/close cycle is enough to trigger the rescan.
pub fn trigger_partition_rescan(path: impl AsRef<Path>) {
    if let Ok(file) = OpenOptions::new().read(true).write(true).open(path) {
        drop(file);
    }
}
