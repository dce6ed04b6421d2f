// crates/kino-core/src/frame_queue.rs
//
// Bounded ring of decoded frames between a decoder thread and its consumer.
// With keep_last, the most recently consumed frame stays queue-owned and
// re-peekable: the refresh loop needs it to compute the current frame's
// duration (next.pts - current.pts) and to redraw on demand while paused.
//
// Peeks are closure-scoped borrows; with owned frames the consumer does its
// work under the peek and then advances, instead of the original C trick of
// advancing first and keeping a pointer to the kept slot.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::packet_queue::EpochRef;

struct Ring<F> {
    slots:     Vec<Option<F>>,
    rindex:    usize,
    windex:    usize,
    size:      usize,
    shown:     bool,
    keep_last: bool,
}

impl<F> Ring<F> {
    fn max_size(&self) -> usize {
        self.slots.len()
    }

    fn remaining(&self) -> usize {
        self.size - usize::from(self.shown)
    }
}

pub struct FrameQueue<F: Send> {
    ring:  Mutex<Ring<F>>,
    cond:  Condvar,
    epoch: Arc<EpochRef>,
}

impl<F: Send> FrameQueue<F> {
    /// `epoch` is the feeding packet queue's epoch handle; its abort flag
    /// unblocks every waiter here.
    pub fn new(epoch: Arc<EpochRef>, max_size: usize, keep_last: bool) -> Self {
        let mut slots = Vec::with_capacity(max_size);
        slots.resize_with(max_size, || None);
        Self {
            ring: Mutex::new(Ring {
                slots,
                rindex: 0,
                windex: 0,
                size: 0,
                shown: false,
                keep_last,
            }),
            cond: Condvar::new(),
            epoch,
        }
    }

    /// Wake all waiters (used after aborting the packet queue).
    pub fn signal(&self) {
        self.cond.notify_all();
    }

    /// Number of frames not yet shown.
    pub fn nb_remaining(&self) -> usize {
        self.ring.lock().remaining()
    }

    /// True once a frame has been consumed and is being kept for re-peek.
    pub fn rindex_shown(&self) -> bool {
        self.ring.lock().shown
    }

    /// Block until a slot is free, then enqueue. Returns false (dropping the
    /// frame) when the feeding queue was aborted.
    pub fn push(&self, frame: F) -> bool {
        let mut ring = self.ring.lock();
        while ring.size >= ring.max_size() {
            if self.epoch.is_aborted() {
                return false;
            }
            self.cond.wait(&mut ring);
        }
        if self.epoch.is_aborted() {
            return false;
        }
        let windex = ring.windex;
        ring.slots[windex] = Some(frame);
        ring.windex = (ring.windex + 1) % ring.max_size();
        ring.size += 1;
        self.cond.notify_all();
        true
    }

    /// Borrow the next frame to show, if any.
    pub fn peek_with<R>(&self, f: impl FnOnce(&F) -> R) -> Option<R> {
        let ring = self.ring.lock();
        if ring.remaining() == 0 {
            return None;
        }
        let idx = (ring.rindex + usize::from(ring.shown)) % ring.max_size();
        ring.slots[idx].as_ref().map(f)
    }

    /// Borrow the frame after the next one (needs two unshown frames).
    pub fn peek_next_with<R>(&self, f: impl FnOnce(&F) -> R) -> Option<R> {
        let ring = self.ring.lock();
        if ring.remaining() < 2 {
            return None;
        }
        let idx = (ring.rindex + usize::from(ring.shown) + 1) % ring.max_size();
        ring.slots[idx].as_ref().map(f)
    }

    /// Borrow the last shown frame (or the next to show when nothing has
    /// been consumed yet).
    pub fn peek_last_with<R>(&self, f: impl FnOnce(&F) -> R) -> Option<R> {
        let ring = self.ring.lock();
        if ring.size == 0 {
            return None;
        }
        ring.slots[ring.rindex].as_ref().map(f)
    }

    /// Block until an unshown frame is available and borrow it. Returns None
    /// when the feeding queue was aborted.
    pub fn peek_readable_with<R>(&self, f: impl FnOnce(&F) -> R) -> Option<R> {
        let mut ring = self.ring.lock();
        while ring.remaining() == 0 {
            if self.epoch.is_aborted() {
                return None;
            }
            self.cond.wait(&mut ring);
        }
        let idx = (ring.rindex + usize::from(ring.shown)) % ring.max_size();
        ring.slots[idx].as_ref().map(f)
    }

    /// Bounded variant for the audio callback, which must emit silence
    /// rather than stall the device when the decoder falls behind.
    pub fn peek_readable_for<R>(&self, timeout: Duration, f: impl FnOnce(&F) -> R) -> Option<R> {
        let deadline = std::time::Instant::now() + timeout;
        let mut ring = self.ring.lock();
        while ring.remaining() == 0 {
            if self.epoch.is_aborted() {
                return None;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = self.cond.wait_for(&mut ring, deadline - now);
        }
        let idx = (ring.rindex + usize::from(ring.shown)) % ring.max_size();
        ring.slots[idx].as_ref().map(f)
    }

    /// Consume the frame at the read cursor. The first call on a keep_last
    /// queue only marks it shown; the slot stays valid for peek_last.
    pub fn next(&self) {
        let mut ring = self.ring.lock();
        if ring.keep_last && !ring.shown {
            ring.shown = true;
            return;
        }
        let rindex = ring.rindex;
        ring.slots[rindex] = None;
        ring.rindex = (ring.rindex + 1) % ring.max_size();
        ring.size -= 1;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_queue::{PacketLike, PacketQueue};

    struct NoPkt;
    impl PacketLike for NoPkt {
        fn byte_size(&self) -> usize {
            0
        }
        fn duration_units(&self) -> i64 {
            0
        }
    }

    fn queue(max_size: usize, keep_last: bool) -> (PacketQueue<NoPkt>, FrameQueue<u32>) {
        let pq = PacketQueue::new();
        pq.start();
        let fq = FrameQueue::new(pq.epoch(), max_size, keep_last);
        (pq, fq)
    }

    #[test]
    fn fills_up_to_capacity_and_reads_in_order() {
        let (_pq, fq) = queue(3, false);
        for i in 0..3 {
            assert!(fq.push(i));
        }
        assert_eq!(fq.nb_remaining(), 3);
        for i in 0..3 {
            assert_eq!(fq.peek_with(|v| *v), Some(i));
            fq.next();
        }
        assert_eq!(fq.nb_remaining(), 0);
        assert_eq!(fq.peek_with(|v| *v), None);
    }

    #[test]
    fn keep_last_retains_the_shown_frame() {
        let (_pq, fq) = queue(3, true);
        fq.push(7);
        fq.push(8);

        // First next() only marks the head shown.
        assert_eq!(fq.nb_remaining(), 2);
        fq.next();
        assert_eq!(fq.nb_remaining(), 1);
        assert!(fq.rindex_shown());
        assert_eq!(fq.peek_last_with(|v| *v), Some(7));
        assert_eq!(fq.peek_with(|v| *v), Some(8));

        // Advancing again frees 7 and keeps 8 as the shown frame.
        fq.next();
        assert_eq!(fq.nb_remaining(), 0);
        assert_eq!(fq.peek_last_with(|v| *v), Some(8));
    }

    #[test]
    fn ring_invariant_holds_across_wraparound() {
        let (_pq, fq) = queue(3, true);
        for i in 0..3 {
            fq.push(i);
        }
        fq.next(); // mark shown
        for _ in 0..2 {
            fq.next();
            fq.push(99);
        }
        let ring = fq.ring.lock();
        assert!(ring.size <= ring.max_size());
        assert_eq!((ring.rindex + ring.size) % ring.max_size(), ring.windex);
    }

    #[test]
    fn push_blocks_until_a_slot_frees() {
        let (_pq, fq) = queue(2, false);
        let fq = std::sync::Arc::new(fq);
        fq.push(1);
        fq.push(2);
        let fq2 = std::sync::Arc::clone(&fq);
        let t = std::thread::spawn(move || fq2.push(3));
        std::thread::sleep(std::time::Duration::from_millis(20));
        fq.next();
        assert!(t.join().unwrap());
        assert_eq!(fq.nb_remaining(), 2);
    }

    #[test]
    fn abort_unblocks_reader_and_writer() {
        let (pq, fq) = queue(1, false);
        let fq = std::sync::Arc::new(fq);
        let r = {
            let fq = std::sync::Arc::clone(&fq);
            std::thread::spawn(move || fq.peek_readable_with(|v| *v))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        pq.abort();
        fq.signal();
        assert_eq!(r.join().unwrap(), None);
        assert!(!fq.push(1));
    }

    #[test]
    fn bounded_peek_gives_up_when_starved() {
        let (_pq, fq) = queue(2, true);
        let got = fq.peek_readable_for(Duration::from_millis(10), |v| *v);
        assert_eq!(got, None);
    }
}
