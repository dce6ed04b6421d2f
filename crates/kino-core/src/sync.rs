// crates/kino-core/src/sync.rs
//
// A/V synchronization math: master-clock selection, the video delay
// correction, the audio sample-count compensation filter and the
// external-clock rubber-band. All pure so every rule is unit-testable.

/// Below this, video is resynced hard instead of corrected smoothly.
pub const AV_SYNC_THRESHOLD_MIN: f64 = 0.04;
/// Above this, video is always corrected.
pub const AV_SYNC_THRESHOLD_MAX: f64 = 0.1;
/// Frames longer than this are extended rather than duplicated.
pub const AV_SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;
/// Beyond this, clocks are considered unrelated and no correction applies.
pub const AV_NOSYNC_THRESHOLD: f64 = 10.0;

/// Maximum audio speed change per frame from sample-count compensation.
pub const SAMPLE_CORRECTION_PERCENT_MAX: f64 = 10.0;
/// Measurements averaged before audio compensation kicks in.
pub const AUDIO_DIFF_AVG_NB: usize = 20;

pub const EXTERNAL_CLOCK_SPEED_MIN: f64 = 0.900;
pub const EXTERNAL_CLOCK_SPEED_MAX: f64 = 1.010;
pub const EXTERNAL_CLOCK_SPEED_STEP: f64 = 0.001;
/// Fewer queued packets than this on any active stream: starving.
pub const EXTERNAL_CLOCK_MIN_FRAMES: usize = 2;
/// More queued packets than this on all active streams: overflowing.
pub const EXTERNAL_CLOCK_MAX_FRAMES: usize = 10;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncMaster {
    Audio,
    Video,
    External,
}

/// Resolve the configured master against the streams actually present.
pub fn master_for(configured: SyncMaster, has_video: bool, has_audio: bool) -> SyncMaster {
    match configured {
        SyncMaster::Video if has_video => SyncMaster::Video,
        SyncMaster::Video | SyncMaster::Audio if has_audio => SyncMaster::Audio,
        _ => SyncMaster::External,
    }
}

/// Adjust the wait before presenting the next video frame.
///
/// `delay` is the nominal frame duration, `diff` the video clock minus the
/// master clock. Late video shortens the wait (dropping to zero), early
/// video doubles it (frame duplication) or, for long frames, extends it by
/// the drift.
pub fn compute_target_delay(delay: f64, diff: f64, max_frame_duration: f64) -> f64 {
    let sync_threshold = delay.clamp(AV_SYNC_THRESHOLD_MIN, AV_SYNC_THRESHOLD_MAX);
    if diff.is_nan() || diff.abs() >= max_frame_duration {
        // Timestamps are unusable or wildly off: do not correct from them.
        return delay;
    }
    if diff <= -sync_threshold {
        (delay + diff).max(0.0)
    } else if diff >= sync_threshold && delay > AV_SYNC_FRAMEDUP_THRESHOLD {
        delay + diff
    } else if diff >= sync_threshold {
        2.0 * delay
    } else {
        delay
    }
}

/// Exponential average of the audio/master clock difference, driving the
/// resampler's sample-count compensation.
pub struct AudioDiffFilter {
    cum:       f64,
    coef:      f64,
    count:     usize,
    threshold: f64,
}

impl AudioDiffFilter {
    /// `threshold` is roughly one hardware buffer expressed in seconds;
    /// corrections smaller than that are inaudible jitter.
    pub fn new(threshold: f64) -> Self {
        Self {
            cum: 0.0,
            coef: ((0.01f64).ln() / AUDIO_DIFF_AVG_NB as f64).exp(),
            count: 0,
            threshold,
        }
    }

    pub fn reset(&mut self) {
        self.cum = 0.0;
        self.count = 0;
    }

    /// Number of samples this frame should be stretched or squeezed to.
    /// Returns `nb_samples` unchanged while the average is warming up or
    /// the drift is below the threshold.
    pub fn wanted_samples(&mut self, nb_samples: usize, diff: f64, src_rate: u32) -> usize {
        if diff.is_nan() || diff.abs() >= AV_NOSYNC_THRESHOLD {
            // Too far gone for gentle correction; the clocks will be
            // stepped elsewhere.
            self.reset();
            return nb_samples;
        }
        self.cum = diff + self.coef * self.cum;
        if self.count < AUDIO_DIFF_AVG_NB {
            self.count += 1;
            return nb_samples;
        }
        let avg = self.cum * (1.0 - self.coef);
        if avg.abs() < self.threshold {
            return nb_samples;
        }
        let wanted = nb_samples as f64 + diff * f64::from(src_rate);
        let min = nb_samples as f64 * (100.0 - SAMPLE_CORRECTION_PERCENT_MAX) / 100.0;
        let max = nb_samples as f64 * (100.0 + SAMPLE_CORRECTION_PERCENT_MAX) / 100.0;
        wanted.clamp(min, max) as usize
    }
}

/// One rubber-band step for the external clock, from the buffer state of
/// the active streams.
pub fn external_clock_speed_step(speed: f64, starving: bool, overflowing: bool) -> f64 {
    if starving {
        (speed - EXTERNAL_CLOCK_SPEED_STEP).max(EXTERNAL_CLOCK_SPEED_MIN)
    } else if overflowing {
        (speed + EXTERNAL_CLOCK_SPEED_STEP).min(EXTERNAL_CLOCK_SPEED_MAX)
    } else if speed != 1.0 {
        speed + EXTERNAL_CLOCK_SPEED_STEP * (1.0 - speed) / (1.0 - speed).abs()
    } else {
        speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_FRAME: f64 = 3600.0;

    #[test]
    fn master_selection_table() {
        use SyncMaster::*;
        assert_eq!(master_for(Video, true, true), Video);
        assert_eq!(master_for(Video, true, false), Video);
        assert_eq!(master_for(Video, false, true), Audio);
        assert_eq!(master_for(Video, false, false), External);
        assert_eq!(master_for(Audio, true, true), Audio);
        assert_eq!(master_for(Audio, false, false), External);
        assert_eq!(master_for(External, true, true), External);
    }

    #[test]
    fn in_sync_video_keeps_its_delay() {
        assert_eq!(compute_target_delay(0.05, 0.0, MAX_FRAME), 0.05);
    }

    #[test]
    fn late_video_shrinks_delay_to_zero() {
        // diff = -2*threshold, delay = 2*threshold -> 0
        let threshold = AV_SYNC_THRESHOLD_MAX;
        let delay = 2.0 * threshold;
        assert_eq!(compute_target_delay(delay, -2.0 * threshold, MAX_FRAME), 0.0);
    }

    #[test]
    fn early_short_frame_is_duplicated() {
        // diff = 2*threshold, delay = threshold (< framedup) -> 2*delay
        let threshold = AV_SYNC_THRESHOLD_MIN;
        let d = compute_target_delay(threshold, 2.0 * threshold, MAX_FRAME);
        assert_eq!(d, 2.0 * threshold);
    }

    #[test]
    fn early_long_frame_is_extended_by_the_drift() {
        let delay = 0.2; // > framedup threshold
        let diff = 0.15;
        assert!((compute_target_delay(delay, diff, MAX_FRAME) - 0.35).abs() < 1e-12);
    }

    #[test]
    fn wild_or_nan_diff_is_ignored() {
        assert_eq!(compute_target_delay(0.04, f64::NAN, MAX_FRAME), 0.04);
        assert_eq!(compute_target_delay(0.04, MAX_FRAME + 1.0, MAX_FRAME), 0.04);
    }

    #[test]
    fn audio_filter_warms_up_before_correcting() {
        let mut f = AudioDiffFilter::new(0.002);
        for _ in 0..AUDIO_DIFF_AVG_NB {
            assert_eq!(f.wanted_samples(1024, 0.5, 48000), 1024);
        }
        // After warmup a persistent 0.5 s drift wants more samples, clamped
        // to +10%.
        let wanted = f.wanted_samples(1024, 0.5, 48000);
        assert_eq!(wanted, (1024.0 * 1.1) as usize);
    }

    #[test]
    fn audio_filter_ignores_sub_threshold_drift() {
        let mut f = AudioDiffFilter::new(0.1);
        for _ in 0..(AUDIO_DIFF_AVG_NB + 5) {
            assert_eq!(f.wanted_samples(1024, 0.0001, 48000), 1024);
        }
    }

    #[test]
    fn audio_filter_resets_on_nosync_drift() {
        let mut f = AudioDiffFilter::new(0.002);
        for _ in 0..(AUDIO_DIFF_AVG_NB + 1) {
            f.wanted_samples(1024, 0.5, 48000);
        }
        assert_eq!(f.wanted_samples(1024, AV_NOSYNC_THRESHOLD, 48000), 1024);
        // Back under threshold: the average must warm up again.
        assert_eq!(f.wanted_samples(1024, 0.5, 48000), 1024);
    }

    #[test]
    fn starvation_decays_speed_to_the_floor() {
        let mut speed = 1.0;
        for _ in 0..200 {
            speed = external_clock_speed_step(speed, true, false);
        }
        assert!((speed - EXTERNAL_CLOCK_SPEED_MIN).abs() < 1e-12);
    }

    #[test]
    fn overflow_raises_speed_to_the_ceiling() {
        let mut speed = EXTERNAL_CLOCK_SPEED_MIN;
        for _ in 0..200 {
            speed = external_clock_speed_step(speed, false, true);
        }
        assert!((speed - EXTERNAL_CLOCK_SPEED_MAX).abs() < 1e-12);
    }

    #[test]
    fn balanced_buffers_converge_back_to_unity() {
        let mut speed = EXTERNAL_CLOCK_SPEED_MAX;
        for _ in 0..20 {
            speed = external_clock_speed_step(speed, false, false);
        }
        assert!((speed - 1.0).abs() <= EXTERNAL_CLOCK_SPEED_STEP + 1e-9);
    }
}
