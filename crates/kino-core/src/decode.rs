// crates/kino-core/src/decode.rs
//
// DecoderPump: the packet-side bookkeeping shared by the three decoder
// threads. It tracks which serial epoch the codec is operating under,
// holds back a packet the codec refused (EAGAIN / partial subtitle
// decode) for re-delivery, and records the epoch at which the codec
// drained so the demuxer can detect end of stream.

use crate::notify::Notify;
use crate::packet_queue::{PacketGet, PacketLike, PacketQueue};

/// Outcome of pulling the next packet to feed into a codec.
pub enum PumpFetch<P> {
    /// The feeding queue was aborted; the decoder thread should exit.
    Aborted,
    /// First packet of a new epoch: flush codec buffers and reset
    /// timestamp fill-in state before sending. `None` is end of stream.
    Fresh { pkt: Option<P> },
    /// A packet within the current epoch. `None` is end of stream.
    Packet { pkt: Option<P> },
}

pub struct DecoderPump<P> {
    pkt_serial: u64,
    finished:   u64,
    pending:    Option<P>,
}

impl<P: PacketLike> DecoderPump<P> {
    pub fn new() -> Self {
        Self {
            pkt_serial: u64::MAX, // forces Fresh on the first packet
            finished:   0,
            pending:    None,
        }
    }

    /// Serial the codec is currently operating under.
    pub fn serial(&self) -> u64 {
        self.pkt_serial
    }

    /// The receive side should only be drained while the codec's epoch is
    /// still the queue's current one; otherwise its buffered frames are
    /// pre-seek leftovers.
    pub fn can_receive(&self, q: &PacketQueue<P>) -> bool {
        q.serial() == self.pkt_serial
    }

    /// Record that the codec returned end-of-stream for this epoch.
    pub fn mark_finished(&mut self) {
        self.finished = self.pkt_serial;
    }

    /// Epoch at which the codec drained (0 = never).
    pub fn finished_serial(&self) -> u64 {
        self.finished
    }

    /// Stash a packet the codec refused; it is re-delivered by the next
    /// `next_packet` call (and dropped if a flush lands in between).
    pub fn set_pending(&mut self, pkt: P) {
        self.pending = Some(pkt);
    }

    /// Pull the next packet to feed, skipping entire stale epochs. Signals
    /// `on_empty` whenever the queue runs dry so the demuxer can wake from
    /// its backpressure sleep.
    pub fn next_packet(&mut self, q: &PacketQueue<P>, on_empty: &Notify) -> PumpFetch<P> {
        loop {
            if q.nb_packets() == 0 {
                on_empty.notify();
            }
            let (pkt, serial) = match self.pending.take() {
                Some(p) => (Some(p), self.pkt_serial),
                None => match q.get(true) {
                    PacketGet::Aborted => return PumpFetch::Aborted,
                    PacketGet::Empty => continue,
                    PacketGet::Item { pkt, serial } => (pkt, serial),
                },
            };
            if q.serial() != serial {
                // Stale epoch (a flush raced us): drop and keep fetching.
                continue;
            }
            if serial != self.pkt_serial {
                self.pkt_serial = serial;
                self.finished = 0;
                return PumpFetch::Fresh { pkt };
            }
            return PumpFetch::Packet { pkt };
        }
    }
}

impl<P: PacketLike> Default for DecoderPump<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakePkt(u32);
    impl PacketLike for FakePkt {
        fn byte_size(&self) -> usize {
            4
        }
        fn duration_units(&self) -> i64 {
            1
        }
    }

    #[test]
    fn first_packet_of_each_epoch_is_fresh() {
        let q = PacketQueue::new();
        let n = Notify::new();
        q.start();
        q.put(FakePkt(1));
        q.put(FakePkt(2));

        let mut pump = DecoderPump::new();
        assert!(matches!(
            pump.next_packet(&q, &n),
            PumpFetch::Fresh { pkt: Some(FakePkt(1)) }
        ));
        assert!(matches!(
            pump.next_packet(&q, &n),
            PumpFetch::Packet { pkt: Some(FakePkt(2)) }
        ));
    }

    #[test]
    fn pre_flush_packets_are_never_delivered() {
        let q = PacketQueue::new();
        let n = Notify::new();
        q.start();
        let mut pump = DecoderPump::new();

        q.put(FakePkt(1));
        match pump.next_packet(&q, &n) {
            PumpFetch::Fresh { pkt: Some(FakePkt(1)) } => {}
            _ => panic!("expected first packet"),
        }

        // Flush drops queued packets and bumps the serial; the next
        // delivery is a Fresh from the new epoch.
        q.put(FakePkt(2));
        q.flush();
        q.put(FakePkt(3));
        match pump.next_packet(&q, &n) {
            PumpFetch::Fresh { pkt: Some(FakePkt(3)) } => {}
            _ => panic!("expected packet from the new epoch"),
        }
        assert!(pump.can_receive(&q));
    }

    #[test]
    fn pending_packet_is_redelivered_once() {
        let q = PacketQueue::new();
        let n = Notify::new();
        q.start();
        q.put(FakePkt(1));
        q.put(FakePkt(2));

        let mut pump = DecoderPump::new();
        let first = match pump.next_packet(&q, &n) {
            PumpFetch::Fresh { pkt: Some(p) } => p,
            _ => panic!("expected first packet"),
        };
        pump.set_pending(first);
        assert!(matches!(
            pump.next_packet(&q, &n),
            PumpFetch::Packet { pkt: Some(FakePkt(1)) }
        ));
        assert!(matches!(
            pump.next_packet(&q, &n),
            PumpFetch::Packet { pkt: Some(FakePkt(2)) }
        ));
    }

    #[test]
    fn pending_packet_is_dropped_by_a_flush() {
        let q = PacketQueue::new();
        let n = Notify::new();
        q.start();
        q.put(FakePkt(1));

        let mut pump = DecoderPump::new();
        let first = match pump.next_packet(&q, &n) {
            PumpFetch::Fresh { pkt: Some(p) } => p,
            _ => panic!("expected first packet"),
        };
        pump.set_pending(first);
        q.flush();
        q.put(FakePkt(9));
        match pump.next_packet(&q, &n) {
            PumpFetch::Fresh { pkt: Some(FakePkt(9)) } => {}
            _ => panic!("pending pre-flush packet must not survive"),
        }
    }

    #[test]
    fn eos_sentinel_passes_through() {
        let q = PacketQueue::<FakePkt>::new();
        let n = Notify::new();
        q.start();
        q.put_null();

        let mut pump = DecoderPump::new();
        assert!(matches!(pump.next_packet(&q, &n), PumpFetch::Fresh { pkt: None }));
        pump.mark_finished();
        assert_eq!(pump.finished_serial(), q.serial());
    }

    #[test]
    fn abort_terminates_the_fetch() {
        let q = PacketQueue::<FakePkt>::new();
        let n = Notify::new();
        q.start();
        q.abort();
        let mut pump = DecoderPump::new();
        assert!(matches!(pump.next_packet(&q, &n), PumpFetch::Aborted));
    }
}
