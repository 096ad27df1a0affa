//! Raw image backend.
//!
//! Positional file I/O over the backing image, off the async threads via
//! `spawn_blocking`. The backend covers the whole image; restricting the
//! export to a partition window happens in [`crate::nbd::ImageIo`].

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task;

use crate::partition::{SECTOR_SIZE, SectorRead};

pub struct ImageBackend {
    file: Arc<File>,
    len: u64,
    read_only: bool,
}

impl ImageBackend {
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            read_only,
        })
    }

    /// Image length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub async fn read_at(&self, offset: u64, length: usize) -> io::Result<Bytes> {
        let file = Arc::clone(&self.file);
        run_blocking(move || {
            let mut buf = vec![0u8; length];
            file.read_exact_at(&mut buf, offset)?;
            Ok(Bytes::from(buf))
        })
        .await
    }

    pub async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        run_blocking(move || file.write_all_at(&data, offset)).await
    }

    pub async fn flush(&self) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        run_blocking(move || file.sync_data()).await
    }
}

#[async_trait]
impl SectorRead for ImageBackend {
    async fn read_sector(&self, lba: u64) -> io::Result<[u8; SECTOR_SIZE]> {
        let file = Arc::clone(&self.file);
        run_blocking(move || {
            let mut sector = [0u8; SECTOR_SIZE];
            file.read_exact_at(&mut sector, lba * SECTOR_SIZE as u64)?;
            Ok(sector)
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    task::spawn_blocking(f).await.map_err(io::Error::other)?
}
