//! In-memory backing device
//!
//! Backs unit tests and examples. The device is fixed-size like a real
//! block device: writes past the end fail with no-space. Supports
//! prefilling with a byte pattern and counts flushes so ordering tests
//! can observe them.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::error::{IoError, IoResult};
use super::traits::Backend;

/// In-memory implementation of [`Backend`]
pub struct MemBackend {
    data: Mutex<Vec<u8>>,
    flushes: AtomicU64,
    write_through: bool,
}

impl MemBackend {
    /// Create a zero-filled device of `len` bytes
    pub fn new(len: usize) -> Self {
        Self::with_fill(len, 0)
    }

    /// Create a device of `len` bytes filled with `pattern`
    pub fn with_fill(len: usize, pattern: u8) -> Self {
        Self {
            data: Mutex::new(vec![pattern; len]),
            flushes: AtomicU64::new(0),
            write_through: false,
        }
    }

    /// Mark the device as opened in write-through mode
    pub fn with_write_through(mut self, enabled: bool) -> Self {
        self.write_through = enabled;
        self
    }

    /// Number of flushes issued so far
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Copy of the raw device contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

#[async_trait]
impl Backend for MemBackend {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> IoResult<()> {
        let data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let end = (start + buf.len()).min(data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&data[start..end]);
        buf[n..].fill(0);
        Ok(())
    }

    async fn write_at(&self, offset: u64, buf: &[u8]) -> IoResult<()> {
        let mut data = self.data.lock();
        let end = offset as usize + buf.len();
        if end > data.len() {
            return Err(IoError::NoSpace);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    async fn flush(&self) -> IoResult<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_through(&self) -> bool {
        self.write_through
    }
}
