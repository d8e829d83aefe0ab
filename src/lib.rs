//! blkqueue - an in-memory write-back block queue
//!
//! Features:
//! - Per-producer barrier sections with cross-producer merging
//! - Read-through resolution against queued and in-flight writes
//! - Asynchronous submission with retry/fail-fast error policies
//! - Writeback table cache with inter-cache flush dependencies

pub mod cache;
pub mod io;
pub mod queue;
