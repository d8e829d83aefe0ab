//! Backend adapter trait for the backing block device

use async_trait::async_trait;

use super::error::IoResult;

/// Sector size of the backing device (bytes)
///
/// Offsets handed to a backend are byte offsets; the device only
/// guarantees atomicity at sector granularity.
pub const SECTOR_SIZE: usize = 512;

/// Capability set of a backing block device
///
/// The queue drives a device through exactly four operations: a
/// synchronous-style read, an asynchronous write, an asynchronous cache
/// flush and an open-flags probe. Completion callbacks of classic AIO
/// interfaces are expressed as the returned futures resolving.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Read `buf.len()` bytes at `offset`.
    ///
    /// Reads past the end of the device fill the remainder with zeroes.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> IoResult<()>;

    /// Write the whole buffer at `offset`.
    async fn write_at(&self, offset: u64, buf: &[u8]) -> IoResult<()>;

    /// Flush the device cache.
    ///
    /// Writes that completed before this resolves are durable afterwards.
    async fn flush(&self) -> IoResult<()>;

    /// Whether the device was opened in write-through mode.
    ///
    /// Every completed write on a write-through device is already
    /// durable, so a queue layered above bypasses itself entirely.
    fn write_through(&self) -> bool {
        false
    }
}
