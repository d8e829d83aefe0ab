//! Writeback table cache
//!
//! A bounded set of fixed-size metadata tables addressed by store
//! offset, with refcount pinning, hit-count eviction and inter-cache
//! flush dependencies. Deployments point it at a queue context so table
//! writeback is ordered against data writes by barriers rather than by
//! device flushes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::io::Backend;
use crate::queue::{QueueContext, QueueError, QueueResult};

/// Hit count given to freshly loaded tables so they are not evicted
/// before their first real use. The number is arbitrary.
const FRESH_TABLE_HITS: u32 = 32;

/// Byte store the cache reads and writes tables through
///
/// Implemented by [`BackendTableIo`] for raw device access and by
/// [`QueueContext`] to route table writeback through the queue.
#[async_trait]
pub trait TableIo: Send + Sync {
    /// Read a whole table at `offset`
    async fn read_table(&self, offset: u64, buf: &mut [u8]) -> QueueResult<()>;

    /// Write a whole table at `offset`
    async fn write_table(&self, offset: u64, buf: &[u8]) -> QueueResult<()>;

    /// Order previously written tables before anything written next
    async fn flush(&self) -> QueueResult<()>;
}

/// Raw-device [`TableIo`]
pub struct BackendTableIo {
    backend: Arc<dyn Backend>,
}

impl BackendTableIo {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl TableIo for BackendTableIo {
    async fn read_table(&self, offset: u64, buf: &mut [u8]) -> QueueResult<()> {
        self.backend.read_at(offset, buf).await.map_err(Into::into)
    }

    async fn write_table(&self, offset: u64, buf: &[u8]) -> QueueResult<()> {
        self.backend.write_at(offset, buf).await.map_err(Into::into)
    }

    async fn flush(&self) -> QueueResult<()> {
        self.backend.flush().await.map_err(Into::into)
    }
}

#[async_trait]
impl TableIo for QueueContext {
    async fn read_table(&self, offset: u64, buf: &mut [u8]) -> QueueResult<()> {
        self.pread(offset, buf).await
    }

    async fn write_table(&self, offset: u64, buf: &[u8]) -> QueueResult<()> {
        self.pwrite(offset, buf).await
    }

    /// A barrier closes the section instead of forcing a device flush;
    /// the queue orders metadata writeback against data writes.
    async fn flush(&self) -> QueueResult<()> {
        self.barrier().await
    }
}

enum ReadStatus {
    Ready,
    InProgress,
    Failed(QueueError),
}

struct TableEntry {
    table: Vec<u8>,
    offset: Option<u64>,
    cache_hits: u32,
    refcount: u32,
    dirty: bool,
    /// Set when the table is re-dirtied during its own writeback so the
    /// flush does not clear a dirty bit it no longer owns
    keep_dirty: bool,
    read_status: ReadStatus,
    read_waiters: Vec<oneshot::Sender<()>>,
}

struct CacheInner<IO: TableIo> {
    entries: Vec<TableEntry>,
    /// Fetchers waiting for any entry to become unpinned
    alloc_waiters: Vec<oneshot::Sender<()>>,
    /// Cache that must be flushed before this one
    depends: Option<Arc<TableCache<IO>>>,
    /// A plain store flush must precede the next entry writeback
    depends_on_flush: bool,
}

/// A pinned reference to a cached table
///
/// Return it with [`TableCache::put`]; it is not cloneable so a pin
/// cannot be released twice.
#[derive(Debug)]
pub struct TableRef {
    index: usize,
}

/// Bounded writeback cache of fixed-size tables
pub struct TableCache<IO: TableIo> {
    io: Arc<IO>,
    table_size: usize,
    writethrough: bool,
    inner: Mutex<CacheInner<IO>>,
}

enum GetAction {
    Hit(usize),
    WaitRead(usize, oneshot::Receiver<()>),
    WaitSlot(oneshot::Receiver<()>),
    Evict(usize),
    Fail(QueueError),
}

impl<IO: TableIo + 'static> TableCache<IO> {
    /// Create a cache of `num_tables` slots of `table_size` bytes each.
    ///
    /// A write-through cache flushes an entry on every [`put`](Self::put).
    pub fn new(io: Arc<IO>, num_tables: usize, table_size: usize, writethrough: bool) -> Arc<Self> {
        let entries = (0..num_tables)
            .map(|_| TableEntry {
                table: vec![0u8; table_size],
                offset: None,
                cache_hits: 0,
                refcount: 0,
                dirty: false,
                keep_dirty: false,
                read_status: ReadStatus::Ready,
                read_waiters: Vec::new(),
            })
            .collect();

        Arc::new(Self {
            io,
            table_size,
            writethrough,
            inner: Mutex::new(CacheInner {
                entries,
                alloc_waiters: Vec::new(),
                depends: None,
                depends_on_flush: false,
            }),
        })
    }

    /// Size of one cached table in bytes
    pub fn table_size(&self) -> usize {
        self.table_size
    }

    /// Pin the table at `offset`, reading it from the store on a miss.
    ///
    /// Waits when a concurrent fetcher is still reading the same table,
    /// or when every slot is pinned.
    pub async fn get(&self, offset: u64) -> QueueResult<TableRef> {
        self.do_get(offset, true).await
    }

    /// Pin a zeroed slot for `offset` without reading the store; for
    /// tables the caller is about to initialize.
    pub async fn get_empty(&self, offset: u64) -> QueueResult<TableRef> {
        self.do_get(offset, false).await
    }

    async fn do_get(&self, offset: u64, read_from_store: bool) -> QueueResult<TableRef> {
        loop {
            let action = {
                let mut inner = self.inner.lock();
                if let Some(i) = inner.entries.iter().position(|e| e.offset == Some(offset)) {
                    inner.entries[i].refcount += 1;
                    match &inner.entries[i].read_status {
                        ReadStatus::Ready => {
                            inner.entries[i].cache_hits += 1;
                            GetAction::Hit(i)
                        }
                        ReadStatus::InProgress => {
                            let (tx, rx) = oneshot::channel();
                            inner.entries[i].read_waiters.push(tx);
                            GetAction::WaitRead(i, rx)
                        }
                        ReadStatus::Failed(e) => {
                            let e = e.clone();
                            inner.entries[i].refcount -= 1;
                            GetAction::Fail(e)
                        }
                    }
                } else {
                    match find_entry_to_replace(&mut inner.entries) {
                        Some(i) => {
                            // Pin early so the slot survives the flush below
                            inner.entries[i].refcount += 1;
                            GetAction::Evict(i)
                        }
                        None => {
                            let (tx, rx) = oneshot::channel();
                            inner.alloc_waiters.push(tx);
                            GetAction::WaitSlot(rx)
                        }
                    }
                }
            };

            match action {
                GetAction::Hit(i) => return Ok(TableRef { index: i }),
                GetAction::Fail(e) => return Err(e),
                GetAction::WaitSlot(rx) => {
                    let _ = rx.await;
                }
                GetAction::WaitRead(i, rx) => {
                    let _ = rx.await;
                    let mut inner = self.inner.lock();
                    match &inner.entries[i].read_status {
                        ReadStatus::Ready => {
                            inner.entries[i].cache_hits += 1;
                            return Ok(TableRef { index: i });
                        }
                        ReadStatus::Failed(e) => {
                            let e = e.clone();
                            inner.entries[i].refcount -= 1;
                            return Err(e);
                        }
                        ReadStatus::InProgress => {
                            // Spurious wake; drop the pin and retry
                            inner.entries[i].refcount -= 1;
                        }
                    }
                }
                GetAction::Evict(i) => {
                    if let Some(tref) = self.load_into(i, offset, read_from_store).await? {
                        return Ok(tref);
                    }
                }
            }
        }
    }

    /// Flush the victim slot and read the new table into it. Returns
    /// `None` when the slot was reused during the flush and the whole
    /// lookup must start over.
    async fn load_into(
        &self,
        i: usize,
        offset: u64,
        read_from_store: bool,
    ) -> QueueResult<Option<TableRef>> {
        if let Err(e) = self.flush_entry(i).await {
            self.inner.lock().entries[i].refcount -= 1;
            return Err(e);
        }

        {
            let mut inner = self.inner.lock();
            // The flush may have yielded; if the slot was re-pinned or
            // re-dirtied meanwhile, start the lookup over
            if inner.entries[i].refcount != 1 || inner.entries[i].dirty {
                inner.entries[i].refcount -= 1;
                return Ok(None);
            }

            let entry = &mut inner.entries[i];
            if entry.offset.is_some() {
                debug!(old = entry.offset.unwrap(), new = offset, "evicting cached table");
            }
            entry.offset = Some(offset);
            entry.cache_hits = 0;
            entry.keep_dirty = false;

            if !read_from_store {
                entry.table.fill(0);
                entry.cache_hits = FRESH_TABLE_HITS;
                entry.read_status = ReadStatus::Ready;
                return Ok(Some(TableRef { index: i }));
            }
            entry.read_status = ReadStatus::InProgress;
        }

        // Read the table in while the slot stays pinned; the in-progress
        // status keeps everyone else off the buffer
        let mut buf = std::mem::take(&mut self.inner.lock().entries[i].table);
        let ret = self.io.read_table(offset, &mut buf).await;

        let mut inner = self.inner.lock();
        inner.entries[i].table = buf;
        let waiters = std::mem::take(&mut inner.entries[i].read_waiters);
        match ret {
            Ok(()) => {
                inner.entries[i].cache_hits = FRESH_TABLE_HITS;
                inner.entries[i].read_status = ReadStatus::Ready;
                for w in waiters {
                    let _ = w.send(());
                }
                Ok(Some(TableRef { index: i }))
            }
            Err(e) => {
                inner.entries[i].read_status = ReadStatus::Failed(e.clone());
                inner.entries[i].offset = None;
                inner.entries[i].refcount -= 1;
                for w in waiters {
                    let _ = w.send(());
                }
                Err(e)
            }
        }
    }

    /// Release a pin taken by [`get`](Self::get).
    ///
    /// Write-through caches flush the entry first. Dropping the
    /// refcount to zero wakes one fetcher waiting for a free slot.
    pub async fn put(&self, table: TableRef) -> QueueResult<()> {
        let flush_ret = if self.writethrough {
            self.flush_entry(table.index).await
        } else {
            Ok(())
        };

        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[table.index];
        debug_assert!(entry.refcount > 0, "table pin released twice");
        entry.refcount -= 1;
        if entry.refcount == 0 {
            if let Some(w) = inner.alloc_waiters.pop() {
                let _ = w.send(());
            }
        }

        flush_ret
    }

    /// Mark a pinned table dirty.
    ///
    /// Also sets keep-dirty, so a writeback racing with this update
    /// does not clear the bit.
    pub fn mark_dirty(&self, table: &TableRef) {
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[table.index];
        entry.dirty = true;
        entry.keep_dirty = true;
    }

    /// Read access to a pinned table
    pub fn with_table<R>(&self, table: &TableRef, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.lock();
        f(&inner.entries[table.index].table)
    }

    /// Write access to a pinned table; call
    /// [`mark_dirty`](Self::mark_dirty) after changing it.
    pub fn with_table_mut<R>(&self, table: &TableRef, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.lock();
        f(&mut inner.entries[table.index].table)
    }

    /// Write back one entry if it is dirty, resolving flush
    /// dependencies first.
    async fn flush_entry(&self, i: usize) -> QueueResult<()> {
        {
            let inner = self.inner.lock();
            let entry = &inner.entries[i];
            if !entry.dirty || entry.offset.is_none() {
                return Ok(());
            }
        }

        let dep = self.inner.lock().depends.clone();
        if let Some(dep) = dep {
            flush_boxed(dep).await?;
            let mut inner = self.inner.lock();
            inner.depends = None;
            inner.depends_on_flush = false;
        } else if self.inner.lock().depends_on_flush {
            self.io.flush().await?;
            self.inner.lock().depends_on_flush = false;
        }

        let (offset, data) = {
            let mut inner = self.inner.lock();
            let entry = &mut inner.entries[i];
            let Some(offset) = entry.offset else {
                return Ok(());
            };
            entry.keep_dirty = false;
            (offset, entry.table.clone())
        };

        self.io.write_table(offset, &data).await?;

        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[i];
        // Keep the dirty bit if the buffer was written to again while
        // the writeback was in flight
        entry.dirty = entry.keep_dirty;
        Ok(())
    }

    /// Write back every dirty entry, then flush the store.
    ///
    /// A no-space error is kept over later errors so the first
    /// meaningful failure is the one reported.
    pub async fn flush(&self) -> QueueResult<()> {
        let n = self.inner.lock().entries.len();

        let mut result: QueueResult<()> = Ok(());
        for i in 0..n {
            if let Err(e) = self.flush_entry(i).await {
                if !matches!(result, Err(ref r) if r.is_no_space()) {
                    result = Err(e);
                }
            }
        }

        if result.is_ok() {
            self.io.flush().await?;
        }
        result
    }

    /// Require `dependency` to be flushed before this cache.
    ///
    /// A different existing dependency is flushed out first, as is the
    /// dependency's own dependency, so chains stay one level deep per
    /// cache but resolve transitively.
    pub async fn set_dependency(
        self: &Arc<Self>,
        dependency: &Arc<TableCache<IO>>,
    ) -> QueueResult<()> {
        let nested = dependency.inner.lock().depends.clone();
        if let Some(nested) = nested {
            flush_boxed(nested).await?;
            let mut inner = dependency.inner.lock();
            inner.depends = None;
            inner.depends_on_flush = false;
        }

        let existing = self.inner.lock().depends.clone();
        if let Some(existing) = existing {
            if !Arc::ptr_eq(&existing, dependency) {
                flush_boxed(existing).await?;
                let mut inner = self.inner.lock();
                inner.depends = None;
                inner.depends_on_flush = false;
            }
        }

        self.inner.lock().depends = Some(Arc::clone(dependency));
        Ok(())
    }

    /// Require a plain store flush before the next entry writeback
    pub fn depends_on_flush(&self) {
        self.inner.lock().depends_on_flush = true;
    }
}

impl<IO: TableIo> Drop for TableCache<IO> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for entry in &inner.entries {
            debug_assert_eq!(entry.refcount, 0, "cached table still pinned at drop");
        }
    }
}

/// Pick the unpinned entry with the fewest hits, aging every candidate
/// as we scan so stale popularity decays.
fn find_entry_to_replace(entries: &mut [TableEntry]) -> Option<usize> {
    let mut min_hits = u32::MAX;
    let mut victim = None;

    for (i, entry) in entries.iter_mut().enumerate() {
        if entry.refcount > 0 {
            continue;
        }
        if entry.cache_hits < min_hits {
            min_hits = entry.cache_hits;
            victim = Some(i);
        }
        entry.cache_hits /= 2;
    }

    victim
}

/// Boxed so the dependency chain can recurse through `flush`
fn flush_boxed<IO: TableIo + 'static>(
    cache: Arc<TableCache<IO>>,
) -> Pin<Box<dyn Future<Output = QueueResult<()>> + Send>> {
    Box::pin(async move { cache.flush().await })
}
