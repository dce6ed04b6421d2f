// crates/kino-core/src/packet_queue.rs
//
// Serial-tagged FIFO of compressed packets (one per elementary stream).
// Producers must start() the queue before putting; flush() and start() open
// a new serial "epoch" so consumers can discard anything produced before a
// seek without ever stopping their threads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// What a packet queue needs to know about its payload for accounting.
pub trait PacketLike: Send {
    /// Payload size in bytes (counts toward the demuxer's byte budget).
    fn byte_size(&self) -> usize;
    /// Duration in stream time-base units, 0 when unknown.
    fn duration_units(&self) -> i64;
}

/// Lock-free view of a queue's epoch: current serial and abort flag.
///
/// Frame queues and clocks hold one of these instead of a reference into the
/// queue itself, so a clock read never takes the packet-queue mutex.
pub struct EpochRef {
    serial:  AtomicU64,
    aborted: AtomicBool,
}

impl EpochRef {
    fn new() -> Self {
        Self {
            serial:  AtomicU64::new(0),
            aborted: AtomicBool::new(true),
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

struct Entry<P> {
    /// `None` is the end-of-stream sentinel. Queues are per-stream, so the
    /// sentinel does not need to carry a stream index of its own.
    pkt:    Option<P>,
    serial: u64,
}

struct Inner<P> {
    items:    VecDeque<Entry<P>>,
    size:     usize,
    duration: i64,
    serial:   u64,
    aborted:  bool,
}

/// Result of [`PacketQueue::get`].
pub enum PacketGet<P> {
    /// The queue was aborted; the consumer thread should wind down.
    Aborted,
    /// Nothing queued (non-blocking gets only).
    Empty,
    /// A packet (or the EOS sentinel) and the serial it was put under.
    Item { pkt: Option<P>, serial: u64 },
}

pub struct PacketQueue<P: PacketLike> {
    inner: Mutex<Inner<P>>,
    cond:  Condvar,
    epoch: Arc<EpochRef>,
}

impl<P: PacketLike> PacketQueue<P> {
    /// A new queue starts out aborted: `start()` is required before use.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items:    VecDeque::new(),
                size:     0,
                duration: 0,
                serial:   0,
                aborted:  true,
            }),
            cond:  Condvar::new(),
            epoch: Arc::new(EpochRef::new()),
        }
    }

    /// Shared epoch handle for the frame queue and clock tracking this queue.
    pub fn epoch(&self) -> Arc<EpochRef> {
        Arc::clone(&self.epoch)
    }

    /// Clear the abort flag and open a new epoch.
    pub fn start(&self) {
        let mut q = self.inner.lock();
        q.aborted = false;
        q.serial += 1;
        self.epoch.serial.store(q.serial, Ordering::Release);
        self.epoch.aborted.store(false, Ordering::Release);
        self.cond.notify_all();
    }

    /// Wake every waiter and make all subsequent gets fail.
    pub fn abort(&self) {
        let mut q = self.inner.lock();
        q.aborted = true;
        self.epoch.aborted.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Drop everything held and open a new epoch.
    pub fn flush(&self) {
        let mut q = self.inner.lock();
        q.items.clear();
        q.size = 0;
        q.duration = 0;
        q.serial += 1;
        self.epoch.serial.store(q.serial, Ordering::Release);
        self.cond.notify_all();
    }

    /// Append a packet under the current serial. Returns false (dropping the
    /// packet) when the queue is aborted.
    pub fn put(&self, pkt: P) -> bool {
        let mut q = self.inner.lock();
        if q.aborted {
            return false;
        }
        q.size += pkt.byte_size();
        q.duration += pkt.duration_units();
        let serial = q.serial;
        q.items.push_back(Entry { pkt: Some(pkt), serial });
        self.cond.notify_one();
        true
    }

    /// Append the end-of-stream sentinel for this stream.
    pub fn put_null(&self) -> bool {
        let mut q = self.inner.lock();
        if q.aborted {
            return false;
        }
        let serial = q.serial;
        q.items.push_back(Entry { pkt: None, serial });
        self.cond.notify_one();
        true
    }

    /// Pop the oldest entry. A blocking get only ever returns `Item` or
    /// `Aborted`; a non-blocking get may also return `Empty`.
    pub fn get(&self, block: bool) -> PacketGet<P> {
        let mut q = self.inner.lock();
        loop {
            if q.aborted {
                return PacketGet::Aborted;
            }
            if let Some(entry) = q.items.pop_front() {
                if let Some(pkt) = &entry.pkt {
                    q.size -= pkt.byte_size();
                    q.duration -= pkt.duration_units();
                }
                return PacketGet::Item {
                    pkt:    entry.pkt,
                    serial: entry.serial,
                };
            }
            if !block {
                return PacketGet::Empty;
            }
            self.cond.wait(&mut q);
        }
    }

    pub fn nb_packets(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Aggregate payload bytes currently held.
    pub fn byte_size(&self) -> usize {
        self.inner.lock().size
    }

    /// Aggregate duration (stream time-base units) currently held.
    pub fn duration(&self) -> i64 {
        self.inner.lock().duration
    }

    pub fn serial(&self) -> u64 {
        self.epoch.serial()
    }

    pub fn is_aborted(&self) -> bool {
        self.epoch.is_aborted()
    }
}

impl<P: PacketLike> Default for PacketQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakePkt {
        bytes: usize,
        dur:   i64,
    }

    impl PacketLike for FakePkt {
        fn byte_size(&self) -> usize {
            self.bytes
        }
        fn duration_units(&self) -> i64 {
            self.dur
        }
    }

    fn pkt(bytes: usize, dur: i64) -> FakePkt {
        FakePkt { bytes, dur }
    }

    #[test]
    fn starts_aborted_and_rejects_puts() {
        let q = PacketQueue::new();
        assert!(!q.put(pkt(10, 1)));
        assert!(matches!(q.get(false), PacketGet::Aborted));
        q.start();
        assert!(q.put(pkt(10, 1)));
    }

    #[test]
    fn accounting_tracks_held_packets_exactly() {
        let q = PacketQueue::new();
        q.start();
        q.put(pkt(100, 3));
        q.put(pkt(50, 2));
        q.put_null();
        assert_eq!(q.nb_packets(), 3);
        assert_eq!(q.byte_size(), 150);
        assert_eq!(q.duration(), 5);

        match q.get(true) {
            PacketGet::Item { pkt: Some(_), .. } => {}
            _ => panic!("expected a packet"),
        }
        assert_eq!(q.nb_packets(), 2);
        assert_eq!(q.byte_size(), 50);
        assert_eq!(q.duration(), 2);

        q.get(true);
        q.get(true); // sentinel
        assert_eq!(q.nb_packets(), 0);
        assert_eq!(q.byte_size(), 0);
        assert_eq!(q.duration(), 0);
    }

    #[test]
    fn flush_increments_serial_by_one_and_empties() {
        let q = PacketQueue::new();
        q.start();
        let before = q.serial();
        q.put(pkt(10, 1));
        q.put(pkt(10, 1));
        q.flush();
        assert_eq!(q.serial(), before + 1);
        assert_eq!(q.nb_packets(), 0);
        assert_eq!(q.byte_size(), 0);
        assert!(matches!(q.get(false), PacketGet::Empty));
    }

    #[test]
    fn packets_carry_the_serial_of_their_epoch() {
        let q = PacketQueue::new();
        q.start();
        q.put(pkt(1, 0));
        q.flush();
        q.put(pkt(2, 0));

        // The pre-flush packet was dropped by flush; only the new epoch's
        // packet comes out, tagged with the new serial.
        match q.get(true) {
            PacketGet::Item { pkt: Some(p), serial } => {
                assert_eq!(p.bytes, 2);
                assert_eq!(serial, q.serial());
            }
            _ => panic!("expected a packet"),
        }
    }

    #[test]
    fn abort_wakes_blocked_getter() {
        let q = std::sync::Arc::new(PacketQueue::<FakePkt>::new());
        q.start();
        let q2 = std::sync::Arc::clone(&q);
        let t = std::thread::spawn(move || matches!(q2.get(true), PacketGet::Aborted));
        std::thread::sleep(std::time::Duration::from_millis(20));
        q.abort();
        assert!(t.join().unwrap());
    }

    #[test]
    fn start_after_abort_opens_a_new_epoch() {
        let q = PacketQueue::<FakePkt>::new();
        q.start();
        let first = q.serial();
        q.abort();
        q.start();
        assert_eq!(q.serial(), first + 1);
        assert!(!q.is_aborted());
    }
}
