//! Read/write overlap resolution
//!
//! Reads must observe queued writes, and new writes may be absorbed in
//! place by queued writes of the same or a later section. Both walk a
//! request list newest-first so the latest overlapping write wins, and
//! both record a section dependency on every overlapping write they
//! touch.

use std::collections::VecDeque;
use std::ops::Range;

use super::request::{Payload, Request};

/// A sub-range the scan could not serve: device offset plus the
/// matching range within the original caller buffer.
pub(crate) type Unresolved = (u64, Range<usize>);

/// Resolve a read of `out.len()` bytes at `offset` against `reqs`.
///
/// Overlapping bytes are copied from queued writes into `out` and
/// `ctx_section` advances to the newest section read from. Returns the
/// sub-ranges no queued write covers; `base` is `out`'s position within
/// the original caller buffer and offsets the returned ranges.
pub(crate) fn resolve_read(
    reqs: &VecDeque<Request>,
    ctx_section: &mut u64,
    offset: u64,
    out: &mut [u8],
    base: usize,
) -> Vec<Unresolved> {
    scan_read(reqs, reqs.len(), ctx_section, offset, out, base)
}

fn scan_read(
    reqs: &VecDeque<Request>,
    newest: usize,
    ctx_section: &mut u64,
    offset: u64,
    out: &mut [u8],
    base: usize,
) -> Vec<Unresolved> {
    let mut r0 = offset;
    let mut r1 = offset + out.len() as u64;
    let mut unresolved = Vec::new();

    let mut idx = newest;
    while idx > 0 && r0 < r1 {
        idx -= 1;

        let req = &reqs[idx];
        let Payload::Write { offset: w0, buf } = &req.payload else {
            continue;
        };
        let w0 = *w0;
        let w1 = w0 + buf.len() as u64;
        if w1 <= r0 || w0 >= r1 {
            continue;
        }

        // Record the read dependency on the write's section
        *ctx_section = (*ctx_section).max(req.section);

        let dst = |a: u64, b: u64| (a - offset) as usize..(b - offset) as usize;

        if w0 <= r0 && w1 >= r1 {
            // The write covers the whole remaining range
            out[dst(r0, r1)].copy_from_slice(&buf[(r0 - w0) as usize..(r1 - w0) as usize]);
            return unresolved;
        } else if w0 <= r0 {
            // Head of the range is inside the write
            out[dst(r0, w1)].copy_from_slice(&buf[(r0 - w0) as usize..]);
            r0 = w1;
        } else if w1 >= r1 {
            // Tail of the range is inside the write
            out[dst(w0, r1)].copy_from_slice(&buf[..(r1 - w0) as usize]);
            r1 = w0;
        } else {
            // The write sits strictly inside: serve the middle, resolve
            // the suffix against older requests, keep scanning the prefix
            out[dst(w0, w1)].copy_from_slice(buf);
            let tail = dst(w1, r1);
            let tail_base = base + tail.start;
            let sub = scan_read(reqs, idx, ctx_section, w1, &mut out[tail], tail_base);
            unresolved.extend(sub);
            r1 = w0;
        }
    }

    if r0 < r1 {
        unresolved.push((
            r0,
            base + (r0 - offset) as usize..base + (r1 - offset) as usize,
        ));
    }
    unresolved
}

/// Absorb `data` into queued writes of section `>= min_section`.
///
/// Overlapped queued bytes are overwritten in place and `ctx_section`
/// advances past every write merged into; writes below the section
/// floor are skipped entirely so older epochs are never retroactively
/// mutated. Returns the sub-ranges of `data` nothing absorbed.
pub(crate) fn merge_write(
    reqs: &mut VecDeque<Request>,
    newest: usize,
    min_section: u64,
    ctx_section: &mut u64,
    offset: u64,
    data: &[u8],
    base: usize,
) -> Vec<Unresolved> {
    let mut r0 = offset;
    let mut r1 = offset + data.len() as u64;
    let mut leftover = Vec::new();

    let mut idx = newest;
    while idx > 0 && r0 < r1 {
        idx -= 1;

        let section = reqs[idx].section;
        if section < min_section {
            continue;
        }
        let Payload::Write { offset: w0, buf } = &mut reqs[idx].payload else {
            continue;
        };
        let w0 = *w0;
        let w1 = w0 + buf.len() as u64;
        if w1 <= r0 || w0 >= r1 {
            continue;
        }

        *ctx_section = (*ctx_section).max(section);

        let src = |a: u64, b: u64| (a - offset) as usize..(b - offset) as usize;

        if w0 <= r0 && w1 >= r1 {
            // The queued write absorbs the whole remaining range
            buf[(r0 - w0) as usize..(r1 - w0) as usize].copy_from_slice(&data[src(r0, r1)]);
            return leftover;
        } else if w0 <= r0 {
            buf[(r0 - w0) as usize..].copy_from_slice(&data[src(r0, w1)]);
            r0 = w1;
        } else if w1 >= r1 {
            buf[..(r1 - w0) as usize].copy_from_slice(&data[src(w0, r1)]);
            r1 = w0;
        } else {
            // The queued write sits strictly inside the incoming range:
            // overwrite it whole, recurse for the suffix
            buf.copy_from_slice(&data[src(w0, w1)]);
            let tail = src(w1, r1);
            let tail_base = base + tail.start;
            let sub = merge_write(
                reqs,
                idx,
                min_section,
                ctx_section,
                w1,
                &data[tail],
                tail_base,
            );
            leftover.extend(sub);
            r1 = w0;
        }
    }

    if r0 < r1 {
        leftover.push((
            r0,
            base + (r0 - offset) as usize..base + (r1 - offset) as usize,
        ));
    }
    leftover
}
