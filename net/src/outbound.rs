//! Per-connection outbound write queue.
//!
//! Writes enter the queue as entries, are promoted to the flushed region by
//! [`OutboundBuffer::mark_flush`], projected into scatter-gather vectors by
//! [`OutboundBuffer::gather_views`], and consumed by byte count with
//! [`OutboundBuffer::remove_bytes`] as the socket accepts them.
//!
//! Pending-byte accounting drives the writability signal: crossing above
//! the high-water mark sets the water-mark bit of an atomic mask shared
//! with off-thread observers, dropping below the low-water mark clears it.
//! Each transition of the whole mask between zero and non-zero is reported
//! exactly once so the channel can fire a writability-changed event.

use crate::error::NetError;
use crate::message::Message;
use crate::metrics::WRITES_COMPLETED;
use crate::promise::Promise;
use riptide_buffer::ByteBuf;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Bit index of the water mark in the unwritable mask; bits 1..=31 are
/// user-defined.
const WATER_MARK_BIT: u32 = 0;

/// Upper bound on views collected per gather pass.
pub const MAX_GATHER_VIEWS: usize = 1024;

/// Inline capacity of the gather scratch vector.
const GATHER_INLINE: usize = 32;

pub type GatherVec<'a> = SmallVec<[IoSlice<'a>; GATHER_INLINE]>;

/// Writability state shared with threads outside the event loop.
#[derive(Debug, Default)]
pub struct OutboundShared {
    pending_bytes: AtomicUsize,
    unwritable: AtomicU32,
}

impl OutboundShared {
    /// Sum of `pending_size` over live entries.
    #[inline]
    pub fn total_pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::Acquire)
    }

    /// Writable iff no unwritable bit (water mark or user) is set.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.unwritable.load(Ordering::Acquire) == 0
    }

    /// Set or clear one bit of the mask. Returns `Some(now_writable)` when
    /// the whole mask transitioned between zero and non-zero.
    fn update_bit(&self, bit: u32, set: bool) -> Option<bool> {
        let mask = 1u32 << bit;
        let prev = if set {
            self.unwritable.fetch_or(mask, Ordering::AcqRel)
        } else {
            self.unwritable.fetch_and(!mask, Ordering::AcqRel)
        };
        if set && prev == 0 {
            Some(false)
        } else if !set && prev == mask {
            Some(true)
        } else {
            None
        }
    }
}

struct WriteEntry {
    msg: Message,
    /// Payload plus fixed per-entry overhead, the amount charged against
    /// the water marks.
    pending_size: usize,
    /// Total payload bytes at enqueue time.
    total: usize,
    /// Payload bytes already written to the socket.
    progress: usize,
    promise: Promise,
    cancelled: bool,
}

impl WriteEntry {
    #[inline]
    fn remaining(&self) -> usize {
        self.total - self.progress
    }
}

/// The outbound write queue for one channel.
///
/// Entries form one queue with a flushed prefix: `entries[..flushed]` are
/// promoted and eligible for transmission, `entries[flushed..]` await the
/// next `mark_flush`.
pub struct OutboundBuffer {
    entries: VecDeque<WriteEntry>,
    flushed: usize,
    shared: Arc<OutboundShared>,
    entry_overhead: usize,
    high_water_mark: usize,
    low_water_mark: usize,
    /// Reentrancy guard for `fail_flushed`.
    in_fail: bool,
}

impl OutboundBuffer {
    pub fn new(entry_overhead: usize, high_water_mark: usize, low_water_mark: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            flushed: 0,
            shared: Arc::new(OutboundShared::default()),
            entry_overhead,
            high_water_mark,
            low_water_mark,
            in_fail: false,
        }
    }

    /// The atomic state handed to off-thread observers.
    pub fn shared(&self) -> Arc<OutboundShared> {
        self.shared.clone()
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.shared.is_writable()
    }

    #[inline]
    pub fn total_pending_bytes(&self) -> usize {
        self.shared.total_pending_bytes()
    }

    /// Live (non-cancelled) entries in the flushed region.
    pub fn flushed_count(&self) -> usize {
        self.entries
            .iter()
            .take(self.flushed)
            .filter(|e| !e.cancelled)
            .count()
    }

    #[inline]
    pub fn has_flushed(&self) -> bool {
        self.flushed > 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a write. `size` is the payload byte count used for water-mark
    /// accounting. Returns `Some(now_writable)` on a writability flip.
    pub fn add_message(&mut self, msg: Message, size: usize, promise: Promise) -> Option<bool> {
        let pending_size = size + self.entry_overhead;
        self.entries.push_back(WriteEntry {
            msg,
            pending_size,
            total: size,
            progress: 0,
            promise,
            cancelled: false,
        });
        self.increment_pending(pending_size)
    }

    /// Promote every unflushed entry into the flushed region, disabling
    /// cancellation of each completion token. Entries whose token was
    /// already cancelled release their payload here and come off the
    /// pending-byte total. Idempotent between writes: a second call with no
    /// intervening `add_message` promotes nothing.
    pub fn mark_flush(&mut self) -> Option<bool> {
        let mut flip = None;
        for i in self.flushed..self.entries.len() {
            let cancelled_size = {
                let entry = &mut self.entries[i];
                if entry.promise.set_uncancellable() {
                    None
                } else {
                    entry.cancelled = true;
                    entry.msg = Message::Buf(ByteBuf::with_capacity(0));
                    Some(entry.pending_size)
                }
            };
            if let Some(size) = cancelled_size {
                flip = combine(flip, self.shared_decrement(size, true));
            }
        }
        self.flushed = self.entries.len();
        flip
    }

    /// The first flushed entry's message, if any.
    pub fn current(&self) -> Option<&Message> {
        self.entries
            .iter()
            .take(self.flushed)
            .find(|e| !e.cancelled)
            .map(|e| &e.msg)
    }

    /// `(progress, total)` of the first flushed entry.
    pub fn current_progress(&self) -> Option<(u64, u64)> {
        self.entries
            .iter()
            .take(self.flushed)
            .find(|e| !e.cancelled)
            .map(|e| (e.progress as u64, e.total as u64))
    }

    /// Project flushed byte payloads into a scatter-gather vector.
    ///
    /// Collection stops at `max_count` views or once adding another entry
    /// would exceed `max_bytes` - except that the first entry is always
    /// included, so a single oversized message cannot stall the queue.
    /// Returns the views and their total byte count.
    pub fn gather_views(&self, max_count: usize, max_bytes: usize) -> (GatherVec<'_>, usize) {
        let max_count = max_count.min(MAX_GATHER_VIEWS);
        let mut views = GatherVec::new();
        let mut total = 0usize;
        for entry in self.entries.iter().take(self.flushed) {
            if entry.cancelled {
                continue;
            }
            let Message::Buf(buf) = &entry.msg else {
                continue;
            };
            let readable = buf.readable_bytes();
            if readable == 0 {
                continue;
            }
            if views.len() >= max_count {
                break;
            }
            if total + readable > max_bytes && !views.is_empty() {
                break;
            }
            views.push(buf.readable_io_slice());
            total += readable;
        }
        (views, total)
    }

    /// Consume `n` bytes from the front of the flushed region, completing
    /// entries as they fully drain. Pending-byte accounting is released as
    /// bytes leave the queue, with each entry's fixed overhead released at
    /// completion. Returns `Some(now_writable)` on a writability flip.
    pub fn remove_bytes(&mut self, mut n: usize) -> Option<bool> {
        let mut flip = None;
        while self.flushed > 0 {
            let entry = self.entries.front_mut().expect("flushed entries present");
            if entry.cancelled {
                // Accounted for at cancellation; just drop the husk.
                self.entries.pop_front();
                self.flushed -= 1;
                continue;
            }
            let remaining = entry.remaining();
            if remaining > n {
                if n > 0 {
                    if let Some(buf) = entry.msg.as_buf_mut() {
                        buf.skip(n).expect("progress within readable bytes");
                    }
                    entry.progress += n;
                    entry.promise.notify_progress(entry.progress as u64, entry.total as u64);
                    flip = combine(flip, self.shared_decrement(n, true));
                }
                break;
            }
            n -= remaining;
            // Bytes not yet released by partial progress, plus the entry's
            // bookkeeping overhead.
            let release = entry.pending_size - entry.progress;
            entry.progress = entry.total;
            entry
                .promise
                .notify_progress(entry.total as u64, entry.total as u64);
            entry.promise.try_success();
            WRITES_COMPLETED.increment();
            // Dropping the entry releases its reference on the payload.
            self.entries.pop_front();
            self.flushed -= 1;
            flip = combine(flip, self.shared_decrement(release, true));
        }
        flip
    }

    /// Fail every flushed entry. Reentrant calls (a failure listener
    /// triggering another failure) are ignored.
    pub fn fail_flushed(&mut self, cause: Arc<NetError>, notify: bool) -> Option<bool> {
        if self.in_fail {
            return None;
        }
        self.in_fail = true;
        let mut flip = None;
        while self.flushed > 0 {
            let entry = self.entries.pop_front().expect("flushed entries present");
            self.flushed -= 1;
            if entry.cancelled {
                continue;
            }
            entry.promise.try_failure(cause.clone());
            let release = entry.pending_size - entry.progress;
            flip = combine(flip, self.shared_decrement(release, notify));
        }
        self.in_fail = false;
        flip
    }

    /// Release every remaining (unflushed) entry with a failure. Only valid
    /// once the flushed region is empty; never re-fires water-mark
    /// notifications since the channel is going away.
    pub fn close(&mut self, cause: Arc<NetError>) {
        debug_assert_eq!(self.flushed, 0, "close with flushed entries pending");
        while let Some(entry) = self.entries.pop_front() {
            if entry.cancelled {
                continue;
            }
            entry.promise.try_failure(cause.clone());
            self.shared_decrement(entry.pending_size - entry.progress, false);
        }
        self.flushed = 0;
    }

    /// Set or clear a user-defined unwritable bit (1..=31). Returns
    /// `Some(now_writable)` on a whole-mask flip.
    pub fn set_user_writability(&mut self, bit: u32, writable: bool) -> Option<bool> {
        assert!((1..32).contains(&bit), "user bits are 1..=31");
        self.shared.update_bit(bit, !writable)
    }

    fn increment_pending(&self, size: usize) -> Option<bool> {
        let prev = self.shared.pending_bytes.fetch_add(size, Ordering::AcqRel);
        let total = prev + size;
        if total > self.high_water_mark && prev <= self.high_water_mark {
            return self.shared.update_bit(WATER_MARK_BIT, true);
        }
        None
    }

    fn shared_decrement(&self, size: usize, notify: bool) -> Option<bool> {
        let prev = self.shared.pending_bytes.fetch_sub(size, Ordering::AcqRel);
        debug_assert!(prev >= size, "pending byte underflow");
        let total = prev - size;
        if total < self.low_water_mark && prev >= self.low_water_mark {
            let flip = self.shared.update_bit(WATER_MARK_BIT, false);
            if notify {
                return flip;
            }
        }
        None
    }
}

fn combine(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    // Later transitions supersede earlier ones within one operation.
    b.or(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::Outcome;
    use std::sync::atomic::AtomicU32;

    fn buf_msg(len: usize) -> Message {
        let mut buf = ByteBuf::with_capacity(len);
        buf.put_slice(&vec![b'x'; len]).unwrap();
        Message::Buf(buf)
    }

    /// Queue with zero entry overhead so byte math is exact.
    fn queue(high: usize, low: usize) -> OutboundBuffer {
        OutboundBuffer::new(0, high, low)
    }

    #[test]
    fn test_add_flush_remove_drains_to_zero() {
        let mut q = queue(usize::MAX, 0);
        let promises: Vec<Promise> = (0..3).map(|_| Promise::new()).collect();
        for (i, p) in promises.iter().enumerate() {
            let size = (i + 1) * 10;
            q.add_message(buf_msg(size), size, p.clone());
        }
        assert_eq!(q.total_pending_bytes(), 60);
        assert_eq!(q.flushed_count(), 0);

        q.mark_flush();
        assert_eq!(q.flushed_count(), 3);

        q.remove_bytes(60);
        assert_eq!(q.total_pending_bytes(), 0);
        assert!(q.is_empty());
        for p in &promises {
            assert!(p.outcome().unwrap().is_success());
        }
    }

    #[test]
    fn test_partial_remove_reports_progress() {
        let mut q = queue(usize::MAX, 0);
        let p = Promise::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = seen.clone();
        p.on_progress(move |progress, total| s.lock().push((progress, total)));

        q.add_message(buf_msg(100), 100, p.clone());
        q.mark_flush();

        q.remove_bytes(30);
        assert!(!p.is_done());
        assert_eq!(q.current_progress(), Some((30, 100)));

        q.remove_bytes(70);
        assert!(p.outcome().unwrap().is_success());
        assert_eq!(&*seen.lock(), &[(30, 100), (100, 100)]);
    }

    #[test]
    fn test_mark_flush_idempotent() {
        let mut q = queue(usize::MAX, 0);
        q.add_message(buf_msg(10), 10, Promise::new());
        q.mark_flush();
        assert_eq!(q.flushed_count(), 1);

        q.mark_flush();
        assert_eq!(q.flushed_count(), 1);
        assert_eq!(q.total_pending_bytes(), 10);
    }

    #[test]
    fn test_water_mark_transitions_fire_once() {
        // Scenario: high=1024, low=512, messages of 800 and 400 bytes.
        let mut q = queue(1024, 512);

        assert_eq!(q.add_message(buf_msg(800), 800, Promise::new()), None);
        assert!(q.is_writable());

        // 1200 > 1024: one unwritable transition.
        let flip = q.add_message(buf_msg(400), 400, Promise::new());
        assert_eq!(flip, Some(false));
        assert!(!q.is_writable());

        q.mark_flush();

        // 1200 -> 500 < 512: exactly one writable transition.
        let flip = q.remove_bytes(700);
        assert_eq!(flip, Some(true));
        assert!(q.is_writable());

        let flip = q.remove_bytes(500);
        assert_eq!(flip, None);
        assert_eq!(q.total_pending_bytes(), 0);
    }

    #[test]
    fn test_entry_overhead_counts_against_water_mark() {
        let mut q = OutboundBuffer::new(96, 100, 50);
        let flip = q.add_message(buf_msg(10), 10, Promise::new());
        // 10 + 96 = 106 > 100.
        assert_eq!(flip, Some(false));
        assert_eq!(q.total_pending_bytes(), 106);
    }

    #[test]
    fn test_cancel_before_flush_releases_entry() {
        // Scenario: three messages, B cancelled before mark_flush.
        let mut q = queue(usize::MAX, 0);
        let pa = Promise::new();
        let pb = Promise::new();
        let pc = Promise::new();
        q.add_message(buf_msg(10), 10, pa.clone());
        q.add_message(buf_msg(20), 20, pb.clone());
        q.add_message(buf_msg(30), 30, pc.clone());

        assert!(pb.cancel());
        q.mark_flush();

        // Only A and C remain visible.
        assert_eq!(q.flushed_count(), 2);
        assert_eq!(q.total_pending_bytes(), 40);

        let (views, bytes) = q.gather_views(16, usize::MAX);
        assert_eq!(views.len(), 2);
        assert_eq!(bytes, 40);
        assert_eq!(views[0].len(), 10);
        assert_eq!(views[1].len(), 30);
        drop(views);

        q.remove_bytes(40);
        assert!(pa.outcome().unwrap().is_success());
        assert!(pb.is_cancelled());
        assert!(pc.outcome().unwrap().is_success());
        assert_eq!(q.total_pending_bytes(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_cancel_after_flush_is_ignored() {
        let mut q = queue(usize::MAX, 0);
        let p = Promise::new();
        q.add_message(buf_msg(10), 10, p.clone());
        q.mark_flush();

        assert!(!p.cancel());
        assert_eq!(q.flushed_count(), 1);
        q.remove_bytes(10);
        assert!(p.outcome().unwrap().is_success());
    }

    #[test]
    fn test_gather_respects_max_bytes_but_guarantees_progress() {
        let mut q = queue(usize::MAX, 0);
        q.add_message(buf_msg(1000), 1000, Promise::new());
        q.add_message(buf_msg(1000), 1000, Promise::new());
        q.mark_flush();

        // A single entry bigger than max_bytes is still returned.
        let (views, bytes) = q.gather_views(16, 100);
        assert_eq!(views.len(), 1);
        assert_eq!(bytes, 1000);
        drop(views);

        // The cap applies once at least one view was taken.
        let (views, bytes) = q.gather_views(16, 1500);
        assert_eq!(views.len(), 1);
        assert_eq!(bytes, 1000);
        drop(views);

        let (views, bytes) = q.gather_views(16, 2000);
        assert_eq!(views.len(), 2);
        assert_eq!(bytes, 2000);
    }

    #[test]
    fn test_gather_respects_max_count() {
        let mut q = queue(usize::MAX, 0);
        for _ in 0..8 {
            q.add_message(buf_msg(8), 8, Promise::new());
        }
        q.mark_flush();

        let (views, bytes) = q.gather_views(3, usize::MAX);
        assert_eq!(views.len(), 3);
        assert_eq!(bytes, 24);
    }

    #[test]
    fn test_gather_skips_non_buffer_messages() {
        let mut q = queue(usize::MAX, 0);
        q.add_message(buf_msg(10), 10, Promise::new());
        q.add_message(Message::Custom(Box::new(42u32)), 0, Promise::new());
        q.add_message(buf_msg(20), 20, Promise::new());
        q.mark_flush();

        let (views, bytes) = q.gather_views(16, usize::MAX);
        assert_eq!(views.len(), 2);
        assert_eq!(bytes, 30);
        drop(views);

        // The zero-size entry completes as soon as the queue drains to it.
        let flip = q.remove_bytes(30);
        assert!(flip.is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn test_fail_flushed_fails_each_token_once() {
        let mut q = queue(usize::MAX, 0);
        let promises: Vec<Promise> = (0..3).map(|_| Promise::new()).collect();
        for p in &promises {
            q.add_message(buf_msg(10), 10, p.clone());
        }
        q.mark_flush();

        let fired = Arc::new(AtomicU32::new(0));
        for p in &promises {
            let f = fired.clone();
            p.on_complete(move |o| {
                assert!(matches!(o, Outcome::Failed(_)));
                f.fetch_add(1, Ordering::SeqCst);
            });
        }

        q.fail_flushed(Arc::new(NetError::ClosedChannel), true);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(q.flushed_count(), 0);
        assert_eq!(q.total_pending_bytes(), 0);
    }

    #[test]
    fn test_fail_flushed_reentrancy_guarded() {
        // A completion listener failing the queue again must not recurse.
        let mut q = queue(usize::MAX, 0);
        let p = Promise::new();
        q.add_message(buf_msg(10), 10, p.clone());
        q.mark_flush();
        q.add_message(buf_msg(5), 5, Promise::new());

        // Directly simulate the guard: a nested call is a no-op.
        q.in_fail = true;
        assert!(q.fail_flushed(Arc::new(NetError::ClosedChannel), true).is_none());
        assert_eq!(q.flushed_count(), 1);
        q.in_fail = false;

        q.fail_flushed(Arc::new(NetError::ClosedChannel), true);
        assert_eq!(q.flushed_count(), 0);
    }

    #[test]
    fn test_close_fails_unflushed_without_notifications() {
        let mut q = queue(100, 50);
        let p1 = Promise::new();
        let p2 = Promise::new();
        q.add_message(buf_msg(80), 80, p1.clone());
        q.add_message(buf_msg(80), 80, p2.clone());
        assert!(!q.is_writable());

        let flip = q.fail_flushed(Arc::new(NetError::ClosedChannel), false);
        assert!(flip.is_none());

        q.close(Arc::new(NetError::ClosedChannel));
        assert_eq!(q.total_pending_bytes(), 0);
        assert!(matches!(p1.outcome().unwrap(), Outcome::Failed(_)));
        assert!(matches!(p2.outcome().unwrap(), Outcome::Failed(_)));
    }

    #[test]
    fn test_user_writability_bits() {
        let mut q = queue(usize::MAX, 0);
        assert!(q.is_writable());

        assert_eq!(q.set_user_writability(1, false), Some(false));
        assert!(!q.is_writable());

        // A second bit keeps the mask non-zero: no flip either way.
        assert_eq!(q.set_user_writability(2, false), None);
        assert_eq!(q.set_user_writability(1, true), None);
        assert!(!q.is_writable());

        assert_eq!(q.set_user_writability(2, true), Some(true));
        assert!(q.is_writable());
    }

    #[test]
    fn test_current_reports_first_flushed() {
        let mut q = queue(usize::MAX, 0);
        q.add_message(buf_msg(5), 5, Promise::new());
        assert!(q.current().is_none());

        q.mark_flush();
        assert_eq!(q.current().unwrap().readable_bytes(), 5);
        assert_eq!(q.current_progress(), Some((0, 5)));
    }
}
