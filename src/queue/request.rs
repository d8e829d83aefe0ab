//! Queued request model

use tokio::sync::oneshot;

use super::error::QueueResult;

/// Identifies a request within its queue's lists
pub(crate) type RequestId = u64;

/// What a request does when it reaches the backend
#[derive(Debug)]
pub(crate) enum Payload {
    /// Buffered write of `buf` at `offset`
    Write { offset: u64, buf: Vec<u8> },
    /// Ordering barrier, materialized as a backend flush
    Barrier,
}

/// A queued write or barrier
#[derive(Debug)]
pub(crate) struct Request {
    pub id: RequestId,
    /// Ordering epoch of the producer that queued this request
    pub section: u64,
    pub payload: Payload,
    /// Completions fired when this request completes; only barriers
    /// carry waiters.
    pub waiters: Vec<FlushWaiter>,
}

impl Request {
    pub fn write(id: RequestId, section: u64, offset: u64, buf: Vec<u8>) -> Self {
        Self {
            id,
            section,
            payload: Payload::Write { offset, buf },
            waiters: Vec::new(),
        }
    }

    pub fn barrier(id: RequestId, section: u64) -> Self {
        Self {
            id,
            section,
            payload: Payload::Barrier,
            waiters: Vec::new(),
        }
    }

    pub fn is_barrier(&self) -> bool {
        matches!(self.payload, Payload::Barrier)
    }
}

/// Sending half of an aio-flush completion
///
/// The receiving half lives in a [`FlushHandle`](super::FlushHandle);
/// a canceled handle just drops the result.
#[derive(Debug)]
pub(crate) struct FlushWaiter {
    pub id: u64,
    pub tx: oneshot::Sender<QueueResult<()>>,
}

impl FlushWaiter {
    pub fn complete(self, result: QueueResult<()>) {
        let _ = self.tx.send(result);
    }
}
