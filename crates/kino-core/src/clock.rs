// crates/kino-core/src/clock.rs
//
// Drift-based playback clocks. A clock stores an anchor (pts at a known
// wallclock time) and extrapolates; it reports NaN once the packet queue it
// tracks has moved to a new serial epoch, so stale time never leaks across
// a seek. Explicit-time entry points (get_at / set_at) exist so the clock
// laws are testable without sleeping.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

use parking_lot::Mutex;

use crate::packet_queue::EpochRef;
use crate::sync::AV_NOSYNC_THRESHOLD;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic seconds since the process first asked for the time.
pub fn now() -> f64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

#[derive(Clone, Copy)]
struct State {
    pts:          f64,
    pts_drift:    f64,
    last_updated: f64,
    speed:        f64,
    paused:       bool,
    serial:       u64,
}

pub struct Clock {
    state: Mutex<State>,
    /// Epoch of the tracked packet queue. None for the external clock,
    /// which tracks nothing and is never serial-stale.
    queue: Option<Arc<EpochRef>>,
}

impl Clock {
    pub fn new(queue: Option<Arc<EpochRef>>) -> Self {
        let t = now();
        Self {
            state: Mutex::new(State {
                pts:          f64::NAN,
                pts_drift:    f64::NAN,
                last_updated: t,
                speed:        1.0,
                paused:       false,
                serial:       u64::MAX, // never set
            }),
            queue,
        }
    }

    pub fn get(&self) -> f64 {
        self.get_at(now())
    }

    pub fn get_at(&self, time: f64) -> f64 {
        let s = self.state.lock();
        if let Some(q) = &self.queue {
            if s.serial != q.serial() {
                return f64::NAN;
            }
        }
        if s.paused {
            s.pts
        } else {
            s.pts_drift + time - (time - s.last_updated) * (1.0 - s.speed)
        }
    }

    pub fn set_at(&self, pts: f64, serial: u64, time: f64) {
        let mut s = self.state.lock();
        s.pts = pts;
        s.last_updated = time;
        s.pts_drift = pts - time;
        s.serial = serial;
    }

    pub fn set(&self, pts: f64, serial: u64) {
        self.set_at(pts, serial, now());
    }

    /// Change speed without a jump: re-anchor at the currently observed
    /// value, then mutate.
    pub fn set_speed(&self, speed: f64) {
        self.set_speed_at(speed, now());
    }

    pub fn set_speed_at(&self, speed: f64, time: f64) {
        let value = self.get_at(time);
        let serial = self.serial();
        self.set_at(value, serial, time);
        self.state.lock().speed = speed;
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().speed
    }

    pub fn paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
    }

    pub fn serial(&self) -> u64 {
        self.state.lock().serial
    }

    /// Raw anchor pts, without drift extrapolation.
    pub fn pts(&self) -> f64 {
        self.state.lock().pts
    }

    pub fn last_updated(&self) -> f64 {
        self.state.lock().last_updated
    }
}

/// Pull `clock` onto `slave` when it has drifted out of range or holds no
/// usable value.
pub fn sync_clock_to_slave(clock: &Clock, slave: &Clock) {
    let c = clock.get();
    let s = slave.get();
    if !s.is_nan() && (c.is_nan() || (c - s).abs() > AV_NOSYNC_THRESHOLD) {
        clock.set(s, slave.serial());
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

    const EPS: f64 = 1e-9;

    #[test]
    fn advances_at_wallclock_rate() {
        let c = Clock::new(None);
        c.set_at(5.0, 1, 100.0);
        assert!((c.get_at(100.0) - 5.0).abs() < EPS);
        assert!((c.get_at(103.5) - 8.5).abs() < EPS);
    }

    #[test]
    fn advances_at_speed_times_wallclock() {
        let c = Clock::new(None);
        c.set_at(0.0, 1, 10.0);
        c.set_speed_at(2.0, 10.0);
        // 4 wallclock seconds at 2x -> 8 clock seconds.
        assert!((c.get_at(14.0) - 8.0).abs() < EPS);
    }

    #[test]
    fn set_speed_does_not_jump_the_observed_value() {
        let c = Clock::new(None);
        c.set_at(20.0, 1, 50.0);
        let before = c.get_at(60.0);
        c.set_speed_at(0.5, 60.0);
        let after = c.get_at(60.0);
        assert!((before - after).abs() < EPS);
    }

    #[test]
    fn paused_clock_reports_its_anchor() {
        let c = Clock::new(None);
        c.set_at(7.0, 1, 0.0);
        c.set_paused(true);
        assert!((c.get_at(99.0) - 7.0).abs() < EPS);
    }

    #[test]
    fn stale_serial_reads_nan_until_reset() {
        let pq = PacketQueue::<NoPkt>::new();
        pq.start();
        let c = Clock::new(Some(pq.epoch()));
        c.set_at(1.0, pq.serial(), 0.0);
        assert!(!c.get_at(0.5).is_nan());

        pq.flush(); // serial += 1
        assert!(c.get_at(0.6).is_nan());

        c.set_at(2.0, pq.serial(), 0.7);
        assert!(!c.get_at(0.8).is_nan());
    }

    #[test]
    fn slave_sync_copies_on_nan_or_large_drift() {
        let master = Clock::new(None);
        let slave = Clock::new(None);
        slave.set(100.0, 3);

        // master unset (NaN) -> adopt slave
        sync_clock_to_slave(&master, &slave);
        assert!((master.get() - slave.get()).abs() < 0.05);
        assert_eq!(master.serial(), 3);

        // small drift -> untouched
        master.set(slave.get() + 0.5, 3);
        sync_clock_to_slave(&master, &slave);
        assert!((master.get() - slave.get() - 0.5).abs() < 0.05);

        // drift beyond the nosync threshold -> snapped back
        master.set(slave.get() + 100.0, 3);
        sync_clock_to_slave(&master, &slave);
        assert!((master.get() - slave.get()).abs() < 0.05);
    }
}
