//! Public queue surface: `BlockQueue`, `QueueContext`, `FlushHandle`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::debug;

use super::config::QueueConfig;
use super::driver;
use super::error::{QueueError, QueueResult};
use super::request::FlushWaiter;
use super::state::QueueState;
use super::{ErrorHandler, QueueStats};
use crate::io::Backend;

/// State shared between the public handles and the driver task
pub(crate) struct QueueInner {
    pub backend: Arc<dyn Backend>,
    pub config: QueueConfig,
    pub state: Mutex<QueueState>,
    /// Wakes the driver when work arrives or a mode changes
    pub kick: Notify,
    /// Wakes flush callers when the queue drains or stops
    pub idle: Notify,
    pub error_handler: ErrorHandler,
}

impl QueueInner {
    pub(crate) async fn flush(&self) -> QueueResult<()> {
        {
            let mut st = self.state.lock();
            st.flushing += 1;
        }
        let ret = self.wait_drained().await;
        {
            let mut st = self.state.lock();
            st.flushing -= 1;
        }
        ret
    }

    async fn wait_drained(&self) -> QueueResult<()> {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.state.lock();
                if st.paused {
                    // Retry policy: the queue is kept intact, the caller
                    // resumes and flushes again
                    return Err(QueueError::Paused);
                }
                if let Some(err) = st.error.clone() {
                    // Fail-fast latched: nothing submits any more, so the
                    // remaining writes are dropped here; waiters attached
                    // since the failure complete with the error
                    let waiters = st.take_all_waiters();
                    st.pending.clear();
                    st.sections.clear();
                    for w in waiters {
                        w.complete(Err(err.clone()));
                    }
                    debug!(error = %err, "flush dropping queued requests");
                    return Err(err);
                }
                if st.is_idle() {
                    return Ok(());
                }
                if st.shutdown {
                    return Err(QueueError::Shutdown);
                }
            }

            self.kick.notify_one();
            notified.await;
        }
    }
}

/// Write-back queue in front of one backing device
///
/// Create it inside a tokio runtime; a driver task is spawned alongside
/// and lives until the queue is closed or dropped.
pub struct BlockQueue {
    inner: Arc<QueueInner>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BlockQueue {
    /// Create a queue over `backend`.
    ///
    /// The error handler is consulted on every failed backend
    /// completion and picks between retry and fail-fast.
    pub fn new(backend: Arc<dyn Backend>, config: QueueConfig, error_handler: ErrorHandler) -> Self {
        let inner = Arc::new(QueueInner {
            backend,
            config,
            state: Mutex::new(QueueState::new()),
            kick: Notify::new(),
            idle: Notify::new(),
            error_handler,
        });

        let driver = tokio::spawn(driver::run(Arc::clone(&inner)));

        Self {
            inner,
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Open a producer context; its section counter starts at zero
    pub fn context(&self) -> QueueContext {
        QueueContext {
            inner: Arc::clone(&self.inner),
            section: AtomicU64::new(0),
        }
    }

    /// Whether both the pending and in-flight lists are empty
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().is_idle()
    }

    /// Counter snapshot
    pub fn stats(&self) -> QueueStats {
        self.inner.state.lock().stats()
    }

    /// Drive the queue until both lists are empty.
    ///
    /// Returns the latched error instead when the queue stopped on a
    /// backend failure: [`QueueError::Paused`] under the retry policy
    /// (resume and flush again), or the failure itself under fail-fast,
    /// in which case the remaining writes have been dropped.
    pub async fn flush(&self) -> QueueResult<()> {
        self.inner.flush().await
    }

    /// Resume submission after an error handled with
    /// [`ErrorAction::Retry`](super::ErrorAction::Retry)
    pub fn resume(&self) {
        {
            let mut st = self.inner.state.lock();
            st.paused = false;
        }
        debug!("queue resumed");
        self.inner.kick.notify_one();
    }

    /// Flush and shut the queue down.
    ///
    /// The caller must ensure no more producer calls arrive. On a clean
    /// flush both lists are asserted empty.
    pub async fn close(self) -> QueueResult<()> {
        let ret = self.inner.flush().await;

        {
            let mut st = self.inner.state.lock();
            st.shutdown = true;
        }
        self.inner.kick.notify_waiters();
        if let Some(handle) = self.driver.lock().take() {
            let _ = handle.await;
        }

        if ret.is_ok() {
            assert!(
                self.inner.state.lock().is_idle(),
                "queue closed while requests are queued"
            );
        }
        ret
    }
}

impl Drop for BlockQueue {
    fn drop(&mut self) {
        self.inner.state.lock().shutdown = true;
        self.inner.kick.notify_waiters();
    }
}

/// Per-producer view onto a queue
///
/// The context carries the producer's current ordering epoch; barriers
/// advance it, and reads advance it past any newer section they observe.
pub struct QueueContext {
    inner: Arc<QueueInner>,
    section: AtomicU64,
}

impl QueueContext {
    /// The producer's current section
    pub fn section(&self) -> u64 {
        self.section.load(Ordering::Relaxed)
    }

    /// Queue a write of `data` at `offset`.
    ///
    /// Overlaps with queued writes of the same or a later section are
    /// absorbed in place; anything else is queued behind the producer's
    /// open section. Write-through backends are written directly.
    pub async fn pwrite(&self, offset: u64, data: &[u8]) -> QueueResult<()> {
        if self.inner.backend.write_through() {
            return self
                .inner
                .backend
                .write_at(offset, data)
                .await
                .map_err(Into::into);
        }

        {
            let mut st = self.inner.state.lock();
            if st.shutdown {
                return Err(QueueError::Shutdown);
            }
            let mut section = self.section.load(Ordering::Relaxed);
            st.enqueue_write(&mut section, offset, data);
            self.section.fetch_max(section, Ordering::Relaxed);
        }
        self.inner.kick.notify_one();
        Ok(())
    }

    /// Read `out.len()` bytes at `offset`, observing queued writes.
    ///
    /// Whatever the queues cannot serve is read from the backend.
    pub async fn pread(&self, offset: u64, out: &mut [u8]) -> QueueResult<()> {
        let remain = {
            let st = self.inner.state.lock();
            let mut section = self.section.load(Ordering::Relaxed);
            let remain = st.resolve_read(&mut section, offset, out);
            self.section.fetch_max(section, Ordering::Relaxed);
            remain
        };

        for (dev_offset, range) in remain {
            self.inner.backend.read_at(dev_offset, &mut out[range]).await?;
        }
        Ok(())
    }

    /// Close the producer's current section.
    ///
    /// All writes queued so far by this producer complete before any
    /// write it queues afterwards. Write-through backends flush
    /// directly instead.
    pub async fn barrier(&self) -> QueueResult<()> {
        if self.inner.backend.write_through() {
            return self.inner.backend.flush().await.map_err(Into::into);
        }

        {
            let mut st = self.inner.state.lock();
            if st.shutdown {
                return Err(QueueError::Shutdown);
            }
            let mut section = self.section.load(Ordering::Relaxed);
            st.enqueue_barrier(&mut section);
            self.section.fetch_max(section, Ordering::Relaxed);
        }
        self.inner.kick.notify_one();
        Ok(())
    }

    /// Queue a flush without blocking.
    ///
    /// The returned handle resolves once the closing barrier completes,
    /// or with the latched error if the queue fails first. The barrier
    /// is placed (or merged) at the queue tail so the handle observes
    /// the entire queue draining.
    pub fn aio_flush(&self) -> FlushHandle {
        let (tx, rx) = oneshot::channel();

        if self.inner.backend.write_through() {
            let backend = Arc::clone(&self.inner.backend);
            tokio::spawn(async move {
                let _ = tx.send(backend.flush().await.map_err(Into::into));
            });
            return FlushHandle { rx, waiter: None };
        }

        {
            let mut st = self.inner.state.lock();
            if st.shutdown {
                let _ = tx.send(Err(QueueError::Shutdown));
                return FlushHandle { rx, waiter: None };
            }
            if !st.paused {
                if let Some(err) = st.error.clone() {
                    // Fail-fast latched: nothing will be submitted again
                    let _ = tx.send(Err(err));
                    return FlushHandle { rx, waiter: None };
                }
            }

            let waiter_id = st.new_waiter_id();
            let mut section = self.section.load(Ordering::Relaxed);
            st.enqueue_aio_barrier(&mut section, FlushWaiter { id: waiter_id, tx });
            self.section.fetch_max(section, Ordering::Relaxed);

            self.inner.kick.notify_one();
            FlushHandle {
                rx,
                waiter: Some((Arc::clone(&self.inner), waiter_id)),
            }
        }
    }
}

/// Completion handle returned by [`QueueContext::aio_flush`]
///
/// Await [`wait`](Self::wait) for the result, or [`cancel`](Self::cancel)
/// to unhook the completion; the underlying barrier runs either way.
pub struct FlushHandle {
    rx: oneshot::Receiver<QueueResult<()>>,
    waiter: Option<(Arc<QueueInner>, u64)>,
}

impl FlushHandle {
    /// Wait for the flush to complete
    pub async fn wait(self) -> QueueResult<()> {
        match self.rx.await {
            Ok(ret) => ret,
            Err(_) => Err(QueueError::Shutdown),
        }
    }

    /// Drop the completion; the barrier itself still runs
    pub fn cancel(self) {
        if let Some((inner, waiter_id)) = self.waiter {
            inner.state.lock().remove_waiter(waiter_id);
        }
    }
}
