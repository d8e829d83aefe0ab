//! Completion driver
//!
//! One task per queue owns submission: it serializes requests into the
//! backend, routes completions back into the queue and runs the
//! error/flush state machine. Submissions serialize behind whatever is
//! in flight, which is what keeps writes from crossing a barrier in
//! either direction.

use std::sync::Arc;

use tracing::{debug, warn};

use super::error::QueueError;
use super::queue::QueueInner;
use super::request::Payload;
use super::ErrorAction;

/// What the driver found when it looked at the queue head
enum NextStep {
    /// A request moved to in-flight and must be dispatched
    Submit(Job),
    /// Nothing submittable right now
    Idle,
    /// The queue is shutting down
    Stop,
}

/// Dispatch data copied out of the state lock
enum Job {
    Write { offset: u64, data: Vec<u8> },
    Barrier,
}

pub(crate) async fn run(inner: Arc<QueueInner>) {
    loop {
        let notified = inner.kick.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match next_step(&inner) {
            NextStep::Submit(job) => {
                let ret = dispatch(&inner, &job).await;
                complete(&inner, ret);
            }
            NextStep::Idle => notified.await,
            NextStep::Stop => break,
        }
    }
    debug!("queue driver stopped");
}

fn next_step(inner: &QueueInner) -> NextStep {
    let mut st = inner.state.lock();

    if st.shutdown {
        return NextStep::Stop;
    }
    if st.error.is_some() || st.paused || !st.in_flight.is_empty() {
        return NextStep::Idle;
    }
    let Some(head) = st.pending.front() else {
        return NextStep::Idle;
    };
    if head.is_barrier()
        && st.pending.len() < inner.config.barrier_threshold
        && st.flushing == 0
        && st.num_waiting_for_cb == 0
    {
        // Small batch: let more writes accumulate before paying for a flush
        return NextStep::Idle;
    }

    let req = st.pop().expect("queue head vanished");
    let job = match &req.payload {
        Payload::Write { offset, buf } => Job::Write {
            offset: *offset,
            data: buf.clone(),
        },
        Payload::Barrier => {
            st.barriers_submitted += 1;
            Job::Barrier
        }
    };
    st.in_flight.push_back(req);
    NextStep::Submit(job)
}

/// Hand the request to the backend. An error return is the completion
/// error; there is no separate submit-failure path.
async fn dispatch(inner: &QueueInner, job: &Job) -> Result<(), QueueError> {
    let ret = match job {
        Job::Write { offset, data } => inner.backend.write_at(*offset, data).await,
        Job::Barrier => inner.backend.flush().await,
    };
    ret.map_err(Into::into)
}

fn complete(inner: &QueueInner, ret: Result<(), QueueError>) {
    let (request, latched) = {
        let mut st = inner.state.lock();
        let mut req = st
            .in_flight
            .pop_front()
            .expect("completion without in-flight request");

        if let Err(e) = &ret {
            // An earlier no-space error stays latched; it is the
            // meaningful one
            if !st.error.as_ref().is_some_and(|l| l.is_no_space()) {
                st.error = Some(e.clone());
            }
        }
        let latched = st.error.clone();

        // The request's own waiters fire exactly once, error or not
        let waiters = std::mem::take(&mut req.waiters);
        st.num_waiting_for_cb -= waiters.len();
        let result = match &latched {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        };
        for w in waiters {
            w.complete(result.clone());
        }

        (req, latched)
    };

    if ret.is_err() {
        let err = latched.expect("error completion without latched error");
        let action = (inner.error_handler)(&err);
        warn!(error = %err, ?action, "backend completion failed");

        let mut st = inner.state.lock();
        match action {
            ErrorAction::Retry => {
                st.reinsert_front(request);
                st.error = None;
                st.paused = true;
            }
            ErrorAction::Fail => {
                // Drop the request; every remaining waiter in the queue
                // sees the error, the writes stay for flush() to drop
                let waiters = st.take_all_waiters();
                for w in waiters {
                    w.complete(Err(err.clone()));
                }
            }
        }
    }

    inner.idle.notify_waiters();
}
