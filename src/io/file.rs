//! File-backed block device
//!
//! Runs file operations on tokio's blocking pool. Used where the
//! backing device is a regular file or a block special file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::error::{IoError, IoResult};
use super::traits::Backend;

/// File-backed implementation of [`Backend`]
pub struct FileBackend {
    file: Arc<Mutex<File>>,
    write_through: bool,
}

impl FileBackend {
    /// Open a file as a writeback backing device
    pub fn open(path: &Path, create: bool) -> IoResult<Self> {
        Self::open_mode(path, create, false)
    }

    /// Open a file in write-through mode
    ///
    /// Every write is followed by a data sync, and the open-flags probe
    /// reports write-through so a queue layered above bypasses itself.
    pub fn open_write_through(path: &Path, create: bool) -> IoResult<Self> {
        Self::open_mode(path, create, true)
    }

    fn open_mode(path: &Path, create: bool, write_through: bool) -> IoResult<Self> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);

        if create {
            opts.create(true);
        }

        let file = opts.open(path)?;

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            write_through,
        })
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> IoResult<()> {
        let file = self.file.clone();
        let len = buf.len();

        // Read into a temporary buffer in the blocking task
        let data = tokio::task::spawn_blocking(move || {
            let mut file = file.lock();
            file.seek(SeekFrom::Start(offset))?;

            let mut temp = vec![0u8; len];
            let mut read = 0;
            while read < len {
                match file.read(&mut temp[read..]) {
                    // Past EOF reads as zeroes
                    Ok(0) => break,
                    Ok(n) => read += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }

            Ok::<Vec<u8>, std::io::Error>(temp)
        })
        .await
        .map_err(|e| IoError::Io(std::io::Error::other(e.to_string())))??;

        buf.copy_from_slice(&data);
        Ok(())
    }

    async fn write_at(&self, offset: u64, buf: &[u8]) -> IoResult<()> {
        let file = self.file.clone();
        // Copy the data to avoid lifetime issues with spawn_blocking
        let data = buf.to_vec();
        let write_through = self.write_through;

        tokio::task::spawn_blocking(move || {
            let mut file = file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&data)?;
            if write_through {
                file.sync_data()?;
            }
            Ok::<(), std::io::Error>(())
        })
        .await
        .map_err(|e| IoError::Io(std::io::Error::other(e.to_string())))??;

        Ok(())
    }

    async fn flush(&self) -> IoResult<()> {
        let file = self.file.clone();

        tokio::task::spawn_blocking(move || {
            let file = file.lock();
            file.sync_all()
        })
        .await
        .map_err(|e| IoError::Io(std::io::Error::other(e.to_string())))?
        .map_err(IoError::from)
    }

    fn write_through(&self) -> bool {
        self.write_through
    }
}
