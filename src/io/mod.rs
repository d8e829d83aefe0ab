//! Backend adapter layer
//!
//! The queue talks to its backing device through the [`Backend`] trait:
//! a synchronous-style read, asynchronous write and flush, and an
//! open-flags probe for write-through mode. Two implementations ship
//! with the crate: a file backend on tokio's blocking pool and an
//! in-memory backend for tests.

pub mod error;
pub mod file;
pub mod mem;
pub mod traits;

pub use error::{IoError, IoResult};
pub use file::FileBackend;
pub use mem::MemBackend;
pub use traits::{Backend, SECTOR_SIZE};
