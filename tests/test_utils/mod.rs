//! Shared test utilities
//!
//! Note: clippy reports false-positive dead_code warnings because it
//! can't trace usage across test binaries. These utilities are used by
//! multiple tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use blkqueue::cache::TableIo;
use blkqueue::io::{Backend, IoError, IoResult, MemBackend};
use blkqueue::queue::{BlockQueue, ErrorAction, ErrorHandler, QueueError, QueueResult};

/// Initialize tracing for debug output; safe to call from every test
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("blkqueue=debug")
        .try_init();
}

/// Error handler that always fails fast
pub fn fail_fast() -> ErrorHandler {
    Box::new(|_| ErrorAction::Fail)
}

/// Poll until the queue has drained both lists
pub async fn wait_until_empty(queue: &BlockQueue) {
    for _ in 0..400 {
        if queue.is_empty() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("queue did not drain");
}

/// Backend wrapper that fails planned operations
///
/// Each entry in the plan aborts one upcoming write or flush with the
/// given error kind; once the plan is exhausted everything passes
/// through to the inner device.
pub struct FlakyBackend {
    inner: MemBackend,
    plan: Mutex<VecDeque<std::io::ErrorKind>>,
    failures: AtomicU64,
}

impl FlakyBackend {
    pub fn new(inner: MemBackend) -> Self {
        Self {
            inner,
            plan: Mutex::new(VecDeque::new()),
            failures: AtomicU64::new(0),
        }
    }

    /// Fail the next write or flush with `kind`
    pub fn fail_next(&self, kind: std::io::ErrorKind) {
        self.plan.lock().push_back(kind);
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn inner(&self) -> &MemBackend {
        &self.inner
    }

    fn planned(&self) -> Option<std::io::ErrorKind> {
        let kind = self.plan.lock().pop_front();
        if kind.is_some() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        kind
    }
}

#[async_trait]
impl Backend for FlakyBackend {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> IoResult<()> {
        self.inner.read_at(offset, buf).await
    }

    async fn write_at(&self, offset: u64, buf: &[u8]) -> IoResult<()> {
        if let Some(kind) = self.planned() {
            return Err(IoError::Io(kind.into()));
        }
        self.inner.write_at(offset, buf).await
    }

    async fn flush(&self) -> IoResult<()> {
        if let Some(kind) = self.planned() {
            return Err(IoError::Io(kind.into()));
        }
        self.inner.flush().await
    }
}

/// What a [`RecordingStore`] saw, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Read(u64),
    Write(u64),
    Flush,
}

/// Table store recording operation order, with optional gating so a
/// test can hold a read or write open while it interferes
pub struct RecordingStore {
    tables: Mutex<HashMap<u64, Vec<u8>>>,
    ops: Mutex<Vec<StoreOp>>,
    gate_writes: AtomicBool,
    gate_reads: AtomicBool,
    /// One permit released per gated write once it is inside the store
    pub write_entered: Arc<Semaphore>,
    /// Add a permit to let a gated write finish
    pub write_resume: Arc<Semaphore>,
    /// One permit released per gated read once it is inside the store
    pub read_entered: Arc<Semaphore>,
    /// Add a permit to let a gated read finish
    pub read_resume: Arc<Semaphore>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(HashMap::new()),
            ops: Mutex::new(Vec::new()),
            gate_writes: AtomicBool::new(false),
            gate_reads: AtomicBool::new(false),
            write_entered: Arc::new(Semaphore::new(0)),
            write_resume: Arc::new(Semaphore::new(0)),
            read_entered: Arc::new(Semaphore::new(0)),
            read_resume: Arc::new(Semaphore::new(0)),
        })
    }

    pub fn gate_writes(&self, enabled: bool) {
        self.gate_writes.store(enabled, Ordering::Relaxed);
    }

    pub fn gate_reads(&self, enabled: bool) {
        self.gate_reads.store(enabled, Ordering::Relaxed);
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.ops.lock().clone()
    }

    pub fn table(&self, offset: u64) -> Option<Vec<u8>> {
        self.tables.lock().get(&offset).cloned()
    }

    pub fn insert_table(&self, offset: u64, data: Vec<u8>) {
        self.tables.lock().insert(offset, data);
    }
}

#[async_trait]
impl TableIo for RecordingStore {
    async fn read_table(&self, offset: u64, buf: &mut [u8]) -> QueueResult<()> {
        self.ops.lock().push(StoreOp::Read(offset));
        if self.gate_reads.load(Ordering::Relaxed) {
            self.read_entered.add_permits(1);
            let permit = self
                .read_resume
                .acquire()
                .await
                .map_err(|_| QueueError::Shutdown)?;
            permit.forget();
        }
        match self.tables.lock().get(&offset) {
            Some(data) => buf.copy_from_slice(&data[..buf.len()]),
            None => buf.fill(0),
        }
        Ok(())
    }

    async fn write_table(&self, offset: u64, buf: &[u8]) -> QueueResult<()> {
        self.ops.lock().push(StoreOp::Write(offset));
        if self.gate_writes.load(Ordering::Relaxed) {
            self.write_entered.add_permits(1);
            let permit = self
                .write_resume
                .acquire()
                .await
                .map_err(|_| QueueError::Shutdown)?;
            permit.forget();
        }
        self.tables.lock().insert(offset, buf.to_vec());
        Ok(())
    }

    async fn flush(&self) -> QueueResult<()> {
        self.ops.lock().push(StoreOp::Flush);
        Ok(())
    }
}
