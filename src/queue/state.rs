//! Queue state: pending and in-flight lists, section index, merging
//!
//! All of the ordering logic lives here as plain synchronous code; the
//! surrounding [`BlockQueue`](super::BlockQueue) serializes access and
//! the driver task moves requests through the backend.

use std::collections::VecDeque;

use super::error::QueueError;
use super::request::{FlushWaiter, Request, RequestId};
use super::resolver::{self, Unresolved};
use super::QueueStats;

pub(crate) struct QueueState {
    /// Requests not yet handed to the backend. Insertion order reflects
    /// submission order, except that new writes are inserted before the
    /// barrier that closes their section.
    pub pending: VecDeque<Request>,
    /// Requests handed to the backend, awaiting completion
    pub in_flight: VecDeque<Request>,
    /// Barrier index over `pending`: `(request id, section)`, in the
    /// same relative order as the barriers appear in `pending`
    pub sections: VecDeque<(RequestId, u64)>,
    next_request_id: RequestId,
    next_waiter_id: u64,
    /// Outstanding aio-flush waiters across the whole queue
    pub num_waiting_for_cb: usize,
    pub barriers_requested: u64,
    pub barriers_submitted: u64,
    pub writes_queued: u64,
    pub writes_merged: u64,
    /// Depth of active `flush()` calls; barriers submit regardless of
    /// the batch threshold while nonzero
    pub flushing: u32,
    /// Submission paused after a handled error, awaiting resume
    pub paused: bool,
    /// Latched backend error
    pub error: Option<QueueError>,
    pub shutdown: bool,
}

impl QueueState {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            sections: VecDeque::new(),
            next_request_id: 0,
            next_waiter_id: 0,
            num_waiting_for_cb: 0,
            barriers_requested: 0,
            barriers_submitted: 0,
            writes_queued: 0,
            writes_merged: 0,
            flushing: 0,
            paused: false,
            error: None,
            shutdown: false,
        }
    }

    fn next_request_id(&mut self) -> RequestId {
        self.next_request_id += 1;
        self.next_request_id
    }

    pub fn new_waiter_id(&mut self) -> u64 {
        self.next_waiter_id += 1;
        self.next_waiter_id
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.pending.len(),
            in_flight: self.in_flight.len(),
            barriers_requested: self.barriers_requested,
            barriers_submitted: self.barriers_submitted,
            writes_queued: self.writes_queued,
            writes_merged: self.writes_merged,
        }
    }

    /// Enqueue a write, absorbing it into queued writes of the same or
    /// a later section where they overlap. `ctx_section` advances past
    /// every write merged into.
    pub fn enqueue_write(&mut self, ctx_section: &mut u64, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let min_section = *ctx_section;
        let newest = self.pending.len();
        let leftover = resolver::merge_write(
            &mut self.pending,
            newest,
            min_section,
            ctx_section,
            offset,
            data,
            0,
        );

        if leftover.is_empty() {
            self.writes_merged += 1;
            return;
        }
        for (dev_offset, range) in leftover {
            let buf = data[range].to_vec();
            self.insert_write(*ctx_section, dev_offset, buf);
        }
    }

    /// Insert a fresh write immediately before the first barrier whose
    /// section is at least the write's; at the tail if there is none.
    fn insert_write(&mut self, section: u64, offset: u64, buf: Vec<u8>) {
        let id = self.next_request_id();
        let req = Request::write(id, section, offset, buf);

        let pos = self
            .pending
            .iter()
            .position(|r| r.is_barrier() && r.section >= section);
        match pos {
            Some(i) => self.pending.insert(i, req),
            None => self.pending.push_back(req),
        }
        self.writes_queued += 1;
    }

    /// Close the producer's current section.
    ///
    /// Merges with the first barrier whose section is at least the
    /// producer's; failing that, a trailing barrier with nothing queued
    /// after it already orders everything the producer has issued, so
    /// no new request is allocated either. Only otherwise is a fresh
    /// barrier appended.
    pub fn enqueue_barrier(&mut self, ctx_section: &mut u64) {
        self.barriers_requested += 1;

        if let Some(&(_, section)) = self.sections.iter().find(|&&(_, s)| s >= *ctx_section) {
            *ctx_section = section + 1;
            return;
        }
        if let Some(last) = self.pending.back() {
            if last.is_barrier() {
                *ctx_section = (*ctx_section).max(last.section + 1);
                return;
            }
        }

        let id = self.next_request_id();
        let section = *ctx_section;
        self.pending.push_back(Request::barrier(id, section));
        self.sections.push_back((id, section));
        *ctx_section = section + 1;
    }

    /// Close the producer's section with a waiter attached.
    ///
    /// Unlike a plain barrier this refuses to merge with any barrier
    /// that is not the last entry of the queue, so the waiter fires
    /// only once the entire queue has drained. An appended barrier
    /// takes the tail request's section when that is later than the
    /// producer's, keeping sections non-decreasing along the queue.
    pub fn enqueue_aio_barrier(&mut self, ctx_section: &mut u64, waiter: FlushWaiter) {
        self.barriers_requested += 1;
        self.num_waiting_for_cb += 1;

        if let Some(last) = self.pending.back_mut() {
            if last.is_barrier() && last.section >= *ctx_section {
                let section = last.section;
                last.waiters.push(waiter);
                *ctx_section = section + 1;
                return;
            }
        }

        let tail_section = self.pending.back().map(|r| r.section).unwrap_or(0);
        let section = (*ctx_section).max(tail_section);
        let id = self.next_request_id();
        let mut req = Request::barrier(id, section);
        req.waiters.push(waiter);
        self.pending.push_back(req);
        self.sections.push_back((id, section));
        *ctx_section = section + 1;
    }

    /// Remove the head of `pending`; a barrier must also head the
    /// section index.
    pub fn pop(&mut self) -> Option<Request> {
        let req = self.pending.pop_front()?;
        if req.is_barrier() {
            let (id, _) = self
                .sections
                .pop_front()
                .expect("barrier not indexed in sections");
            assert_eq!(id, req.id, "section index out of order");
        }
        Some(req)
    }

    /// Put a failed request back at the head for a retry
    pub fn reinsert_front(&mut self, req: Request) {
        if req.is_barrier() {
            self.sections.push_front((req.id, req.section));
        }
        self.pending.push_front(req);
    }

    /// Detach every flush waiter in the queue
    pub fn take_all_waiters(&mut self) -> Vec<FlushWaiter> {
        let mut waiters = Vec::new();
        for req in self.pending.iter_mut().chain(self.in_flight.iter_mut()) {
            waiters.append(&mut req.waiters);
        }
        self.num_waiting_for_cb = 0;
        waiters
    }

    /// Drop a single waiter by id; the barrier it was attached to
    /// proceeds regardless.
    pub fn remove_waiter(&mut self, waiter_id: u64) {
        for req in self.pending.iter_mut().chain(self.in_flight.iter_mut()) {
            if let Some(i) = req.waiters.iter().position(|w| w.id == waiter_id) {
                req.waiters.remove(i);
                self.num_waiting_for_cb -= 1;
                return;
            }
        }
    }

    /// Serve a read from the queued writes, pending first, then
    /// in-flight. Returns what must still be read from the backend.
    pub fn resolve_read(
        &self,
        ctx_section: &mut u64,
        offset: u64,
        out: &mut [u8],
    ) -> Vec<Unresolved> {
        let first = resolver::resolve_read(&self.pending, ctx_section, offset, out, 0);
        let mut remain = Vec::new();
        for (dev_offset, range) in first {
            let base = range.start;
            remain.extend(resolver::resolve_read(
                &self.in_flight,
                ctx_section,
                dev_offset,
                &mut out[range],
                base,
            ));
        }
        remain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::request::Payload;

    fn queue_write(st: &mut QueueState, section: &mut u64, offset: u64, len: usize, pattern: u8) {
        st.enqueue_write(section, offset, &vec![pattern; len]);
    }

    fn pop_write(st: &mut QueueState, offset: u64, len: usize, pattern: u8, section: u64) {
        let req = st.pop().expect("queue empty");
        assert_eq!(req.section, section, "wrong section for write @{offset}");
        match req.payload {
            Payload::Write { offset: o, buf } => {
                assert_eq!(o, offset);
                assert_eq!(buf, vec![pattern; len]);
            }
            Payload::Barrier => panic!("expected write @{offset}, got barrier"),
        }
    }

    fn pop_barrier(st: &mut QueueState, section: u64) {
        let req = st.pop().expect("queue empty");
        assert!(req.is_barrier(), "expected barrier");
        assert_eq!(req.section, section);
    }

    fn check_invariants(st: &QueueState) {
        // Section index is exactly the barrier subsequence of pending
        let barriers: Vec<_> = st
            .pending
            .iter()
            .filter(|r| r.is_barrier())
            .map(|r| (r.id, r.section))
            .collect();
        assert_eq!(barriers, Vec::from(st.sections.clone()));
        // Sections never decrease along the queue
        let mut last = 0;
        for req in &st.pending {
            assert!(req.section >= last, "section order violated");
            last = req.section;
        }
        // At most one barrier per section
        let mut seen = std::collections::HashSet::new();
        for &(_, s) in &st.sections {
            assert!(seen.insert(s), "duplicate barrier for section {s}");
        }
    }

    #[test]
    fn basic_enqueue_and_pop() {
        let mut st = QueueState::new();
        let mut ctx = 0;

        queue_write(&mut st, &mut ctx, 0, 512, 0x12);
        queue_write(&mut st, &mut ctx, 512, 42, 0x34);
        st.enqueue_barrier(&mut ctx);
        queue_write(&mut st, &mut ctx, 678, 42, 0x56);
        check_invariants(&st);

        pop_write(&mut st, 0, 512, 0x12, 0);
        pop_write(&mut st, 512, 42, 0x34, 0);
        pop_barrier(&mut st, 0);
        pop_write(&mut st, 678, 42, 0x56, 1);
        assert!(st.pop().is_none());
    }

    #[test]
    fn cross_context_barrier_merging() {
        let mut st = QueueState::new();
        let mut c1 = 0;
        let mut c2 = 0;

        queue_write(&mut st, &mut c1, 0, 512, 0x12);
        st.enqueue_barrier(&mut c1);
        queue_write(&mut st, &mut c2, 512, 42, 0x34);
        queue_write(&mut st, &mut c1, 1024, 512, 0x12);
        // c2 is still in section 0, so this merges with the first barrier
        st.enqueue_barrier(&mut c2);
        queue_write(&mut st, &mut c2, 1536, 42, 0x34);
        check_invariants(&st);

        pop_write(&mut st, 0, 512, 0x12, 0);
        pop_write(&mut st, 512, 42, 0x34, 0);
        pop_barrier(&mut st, 0);
        pop_write(&mut st, 1024, 512, 0x12, 1);
        pop_write(&mut st, 1536, 42, 0x34, 1);
        assert!(st.pop().is_none());
    }

    #[test]
    fn interleaved_contexts_share_sections() {
        let mut st = QueueState::new();
        let mut c1 = 0;
        let mut c2 = 0;

        st.enqueue_barrier(&mut c2);
        queue_write(&mut st, &mut c2, 512, 42, 0x34);
        queue_write(&mut st, &mut c2, 12, 20, 0x45);
        st.enqueue_barrier(&mut c2);
        queue_write(&mut st, &mut c2, 2892, 142, 0x56);

        queue_write(&mut st, &mut c1, 0, 8, 0x12);
        st.enqueue_barrier(&mut c1);
        queue_write(&mut st, &mut c1, 1024, 512, 0x12);
        st.enqueue_barrier(&mut c1);
        queue_write(&mut st, &mut c1, 2512, 42, 0x34);
        st.enqueue_barrier(&mut c1);
        check_invariants(&st);

        pop_write(&mut st, 0, 8, 0x12, 0);
        pop_barrier(&mut st, 0);
        pop_write(&mut st, 512, 42, 0x34, 1);
        pop_write(&mut st, 12, 20, 0x45, 1);
        pop_write(&mut st, 1024, 512, 0x12, 1);
        pop_barrier(&mut st, 1);
        pop_write(&mut st, 2892, 142, 0x56, 2);
        pop_write(&mut st, 2512, 42, 0x34, 2);
        pop_barrier(&mut st, 2);
        assert!(st.pop().is_none());
    }

    #[test]
    fn read_records_section_dependency() {
        let mut st = QueueState::new();
        let mut c1 = 0;
        let mut c2 = 0;

        queue_write(&mut st, &mut c1, 25, 5, 0x44);
        st.enqueue_barrier(&mut c1);
        queue_write(&mut st, &mut c1, 5, 5, 0x12);
        st.enqueue_barrier(&mut c1);
        queue_write(&mut st, &mut c2, 10, 5, 0x34);

        let mut out = vec![0u8; 20];
        let unresolved = st.resolve_read(&mut c2, 0, &mut out);
        assert_eq!(&out[5..10], &[0x12; 5]);
        assert_eq!(&out[10..15], &[0x34; 5]);
        assert!(!unresolved.is_empty());
        // Reading c1's section-1 write pulls c2 forward
        assert_eq!(c2, 1);

        queue_write(&mut st, &mut c2, 0, 10, 0x34);
        st.enqueue_barrier(&mut c2);
        check_invariants(&st);

        pop_write(&mut st, 25, 5, 0x44, 0);
        pop_write(&mut st, 10, 5, 0x34, 0);
        pop_barrier(&mut st, 0);
        pop_write(&mut st, 5, 5, 0x34, 1);
        pop_write(&mut st, 0, 5, 0x34, 1);
        pop_barrier(&mut st, 1);
        assert!(st.pop().is_none());
    }

    #[test]
    fn same_section_write_is_absorbed() {
        let mut st = QueueState::new();

        let mut c1 = 0;
        queue_write(&mut st, &mut c1, 0, 512, 0x12);
        st.enqueue_barrier(&mut c1);
        queue_write(&mut st, &mut c1, 512, 512, 0x56);

        let mut c2 = 0;
        queue_write(&mut st, &mut c2, 512, 512, 0x34);
        assert_eq!(c2, 1);
        assert_eq!(st.stats().writes_merged, 1);
        check_invariants(&st);

        pop_write(&mut st, 0, 512, 0x12, 0);
        pop_barrier(&mut st, 0);
        pop_write(&mut st, 512, 512, 0x34, 1);
        assert!(st.pop().is_none());
    }

    #[test]
    fn never_merges_into_earlier_section() {
        let mut st = QueueState::new();

        let mut c1 = 0;
        queue_write(&mut st, &mut c1, 0, 512, 0x12);

        let mut c2 = 0;
        queue_write(&mut st, &mut c2, 512, 512, 0x34);
        st.enqueue_barrier(&mut c2);
        queue_write(&mut st, &mut c2, 0, 512, 0x56);
        check_invariants(&st);

        pop_write(&mut st, 0, 512, 0x12, 0);
        pop_write(&mut st, 512, 512, 0x34, 0);
        pop_barrier(&mut st, 0);
        pop_write(&mut st, 0, 512, 0x56, 1);
        assert!(st.pop().is_none());
    }

    #[test]
    fn repeated_barrier_allocates_nothing() {
        let mut st = QueueState::new();
        let mut ctx = 0;

        queue_write(&mut st, &mut ctx, 0, 16, 0x12);
        st.enqueue_barrier(&mut ctx);
        assert_eq!(ctx, 1);
        let len = st.pending.len();

        st.enqueue_barrier(&mut ctx);
        assert_eq!(ctx, 1);
        assert_eq!(st.pending.len(), len);
        assert_eq!(st.sections.len(), 1);
    }

    #[test]
    fn aio_barrier_refuses_non_tail_merge() {
        let mut st = QueueState::new();
        let mut ctx = 0;

        queue_write(&mut st, &mut ctx, 25, 5, 0x44);
        st.enqueue_barrier(&mut ctx);

        let (tx, _rx) = tokio::sync::oneshot::channel();
        let id = st.new_waiter_id();
        st.enqueue_aio_barrier(&mut ctx, FlushWaiter { id, tx });
        check_invariants(&st);

        // A second barrier was appended after the existing one
        assert_eq!(st.sections.len(), 2);
        assert_eq!(st.num_waiting_for_cb, 1);

        pop_write(&mut st, 25, 5, 0x44, 0);
        pop_barrier(&mut st, 0);
        let tail = st.pop().expect("aio barrier missing");
        assert!(tail.is_barrier());
        assert_eq!(tail.section, 1);
        assert_eq!(tail.waiters.len(), 1);
    }

    #[test]
    fn aio_barrier_merges_with_tail_barrier() {
        let mut st = QueueState::new();
        let mut ctx = 0;

        queue_write(&mut st, &mut ctx, 0, 16, 0x12);
        st.enqueue_barrier(&mut ctx);

        // A producer still in section 0 flushes; the section-0 barrier
        // is the queue tail, so the waiter attaches to it
        let mut other = 0;
        let (tx, _rx) = tokio::sync::oneshot::channel();
        let id = st.new_waiter_id();
        st.enqueue_aio_barrier(&mut other, FlushWaiter { id, tx });

        assert_eq!(st.sections.len(), 1);
        assert_eq!(other, 1);
        assert_eq!(st.pending.back().unwrap().waiters.len(), 1);
    }

    #[test]
    fn waiter_can_be_removed() {
        let mut st = QueueState::new();
        let mut ctx = 0;

        let (tx, _rx) = tokio::sync::oneshot::channel();
        let id = st.new_waiter_id();
        st.enqueue_aio_barrier(&mut ctx, FlushWaiter { id, tx });
        assert_eq!(st.num_waiting_for_cb, 1);

        st.remove_waiter(id);
        assert_eq!(st.num_waiting_for_cb, 0);
        assert!(st.pending.back().unwrap().waiters.is_empty());
    }
}
