//! Transmission-phase I/O handling.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::backend::ImageBackend;

/// Handles the I/O side of NBD transmission commands.
///
/// Offsets are export-relative; implementations decide what they map to.
#[async_trait]
pub trait IoHandler: Send + Sync {
    async fn read_at(&self, offset: u64, length: usize) -> io::Result<Bytes>;

    async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<()>;

    /// Discard a byte range. Advisory; a handler may do nothing.
    async fn trim(&self, offset: u64, length: u64) -> io::Result<()>;

    /// Flush pending writes to stable storage.
    async fn flush(&self) -> io::Result<()>;
}

/// I/O against a byte window of the backing image.
///
/// The window is the whole image, an `--offset` tail, or the range the
/// partition locator resolved. Requests outside the window fail with
/// `InvalidInput`, which the server reports as EINVAL.
pub struct ImageIo {
    backend: Arc<ImageBackend>,
    window_offset: u64,
    window_len: u64,
}

impl ImageIo {
    pub fn new(backend: Arc<ImageBackend>, window_offset: u64, window_len: u64) -> Self {
        Self {
            backend,
            window_offset,
            window_len,
        }
    }

    pub fn window_len(&self) -> u64 {
        self.window_len
    }

    /// Map an export-relative range onto the image, bounds-checked
    /// against the window.
    fn translate(&self, offset: u64, length: u64) -> io::Result<u64> {
        let end = offset.checked_add(length).ok_or_else(out_of_window)?;
        if end > self.window_len {
            return Err(out_of_window());
        }
        Ok(self.window_offset + offset)
    }
}

fn out_of_window() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "request outside the export")
}

#[async_trait]
impl IoHandler for ImageIo {
    async fn read_at(&self, offset: u64, length: usize) -> io::Result<Bytes> {
        let at = self.translate(offset, length as u64)?;
        self.backend.read_at(at, length).await
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<()> {
        let at = self.translate(offset, data.len() as u64)?;
        self.backend.write_at(at, data).await
    }

    async fn trim(&self, offset: u64, length: u64) -> io::Result<()> {
        // Raw files have nothing to discard; still validate the range.
        self.translate(offset, length)?;
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        self.backend.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn windowed(content: &[u8], offset: u64, len: u64) -> (tempfile::NamedTempFile, ImageIo) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        let backend = Arc::new(ImageBackend::open(file.path(), false).unwrap());
        (file, ImageIo::new(backend, offset, len))
    }

    #[tokio::test]
    async fn window_translates_offsets() {
        let mut content = vec![0u8; 2048];
        content[1024 + 7] = 0x5a;
        let (_file, io) = windowed(&content, 1024, 512);

        let data = io.read_at(0, 16).await.unwrap();
        assert_eq!(data[7], 0x5a);

        io.write_at(100, Bytes::from_static(b"xyz")).await.unwrap();
        let data = io.read_at(100, 3).await.unwrap();
        assert_eq!(&data[..], b"xyz");
    }

    #[tokio::test]
    async fn rejects_io_past_the_window() {
        let (_file, io) = windowed(&vec![0u8; 2048], 1024, 512);

        let err = io.read_at(508, 8).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = io
            .write_at(512, Bytes::from_static(b"a"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        // Offset overflow must not wrap around.
        let err = io.read_at(u64::MAX, 2).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        assert!(io.trim(0, 512).await.is_ok());
        assert!(io.trim(0, 513).await.is_err());
    }
}
