// crates/kino-media/src/video.rs
//
// The video refresh loop: called from the UI (or headless) loop at least
// every REFRESH_RATE seconds. It decides whether the next frame is due,
// shortens or stretches the wait against the master clock, drops frames
// that are already late, purges expired subtitles, and tells the caller
// when to actually repaint and how long it may sleep.

use std::sync::atomic::Ordering;

use tracing::debug;

use kino_core::clock::{self, sync_clock_to_slave};
use kino_core::sync::{
    self, SyncMaster, AV_SYNC_THRESHOLD_MAX, EXTERNAL_CLOCK_MAX_FRAMES, EXTERNAL_CLOCK_MIN_FRAMES,
};

use crate::frames::VideoPicture;
use crate::player::Player;

#[derive(Clone, Copy)]
struct FrameInfo {
    serial:   u64,
    pts:      f64,
    duration: f64,
}

impl FrameInfo {
    fn of(vp: &VideoPicture) -> Self {
        Self {
            serial:   vp.serial,
            pts:      vp.pts,
            duration: vp.duration,
        }
    }
}

/// Time the frame `cur` should stay on screen, from its successor's pts
/// when both belong to the same epoch, else from its nominal duration.
fn vp_duration(cur: &FrameInfo, next: &FrameInfo, max_frame_duration: f64) -> f64 {
    if cur.serial == next.serial {
        let d = next.pts - cur.pts;
        if d.is_nan() || d <= 0.0 || d > max_frame_duration {
            cur.duration
        } else {
            d
        }
    } else {
        0.0
    }
}

impl Player {
    /// One refresh pass. Lowers `remaining_time` to when the next frame is
    /// due; returns true when the caller should repaint the current frame.
    pub fn video_refresh(&self, remaining_time: &mut f64) -> bool {
        if !self.paused()
            && self.master_sync_type() == SyncMaster::External
            && self.streams.lock().realtime
        {
            self.check_external_clock_speed();
        }

        self.maybe_log_status();

        let mut redraw = false;
        if !self.has_video() {
            return false;
        }

        'retry: loop {
            if self.pictq.nb_remaining() == 0 {
                break;
            }
            let last = self.pictq.peek_last_with(|f| FrameInfo::of(f));
            let cur = self.pictq.peek_with(|f| FrameInfo::of(f));
            let (Some(last), Some(cur)) = (last, cur) else {
                break;
            };

            if cur.serial != self.videoq.serial() {
                self.pictq.next();
                continue 'retry;
            }

            if last.serial != cur.serial {
                self.refresh.lock().frame_timer = clock::now();
            }
            if self.paused() {
                break;
            }

            let max_frame_duration = self.streams.lock().max_frame_duration;
            let last_duration = vp_duration(&last, &cur, max_frame_duration);
            let delay = self.compute_target_delay_for(last_duration);
            let time = clock::now();

            {
                let mut refresh = self.refresh.lock();
                if time < refresh.frame_timer + delay {
                    *remaining_time = (refresh.frame_timer + delay - time).min(*remaining_time);
                    break;
                }
                refresh.frame_timer += delay;
                if delay > 0.0 && time - refresh.frame_timer > AV_SYNC_THRESHOLD_MAX {
                    // Pathologically behind: resynchronize instead of
                    // fast-forwarding frame by frame.
                    refresh.frame_timer = time;
                }
            }

            if !cur.pts.is_nan() {
                self.vidclk.set(cur.pts, cur.serial);
                sync_clock_to_slave(&self.extclk, &self.vidclk);
            }

            // The frame after next is already due: drop instead of falling
            // further behind. Never when stepping or when video is master.
            if self.pictq.nb_remaining() > 1 {
                if let Some(next) = self.pictq.peek_next_with(|f| FrameInfo::of(f)) {
                    let duration = vp_duration(&cur, &next, max_frame_duration);
                    let drop_policy = self.opts.framedrop > 0
                        || (self.opts.framedrop != 0
                            && self.master_sync_type() != SyncMaster::Video);
                    if !self.stepping()
                        && drop_policy
                        && time > self.refresh.lock().frame_timer + duration
                    {
                        self.frame_drops_late.fetch_add(1, Ordering::Relaxed);
                        self.pictq.next();
                        continue 'retry;
                    }
                }
            }

            self.purge_expired_subtitles();

            self.pictq.next();
            self.refresh.lock().force_refresh = true;

            if self.stepping() && !self.paused() {
                self.stream_toggle_pause();
            }
            break;
        }

        {
            let mut refresh = self.refresh.lock();
            if refresh.force_refresh && self.pictq.rindex_shown() {
                redraw = true;
            }
            refresh.force_refresh = false;
        }
        redraw
    }

    fn compute_target_delay_for(&self, delay: f64) -> f64 {
        if self.master_sync_type() == SyncMaster::Video {
            return delay;
        }
        let diff = self.vidclk.get() - self.master_clock();
        let max_frame_duration = self.streams.lock().max_frame_duration;
        sync::compute_target_delay(delay, diff, max_frame_duration)
    }

    /// Drop subtitles whose display window has passed (or whose successor
    /// is already due) relative to the video clock.
    fn purge_expired_subtitles(&self) {
        if self.streams.lock().subtitle.is_none() {
            return;
        }
        while self.subpq.nb_remaining() > 0 {
            let Some((serial, end_time)) = self.subpq.peek_with(|sp| (sp.serial, sp.end_time()))
            else {
                break;
            };
            let next_start = self.subpq.peek_next_with(|sp| sp.start_time());
            let vid_pts = self.vidclk.pts();
            let expired = serial != self.subtitleq.serial()
                || (!vid_pts.is_nan() && vid_pts > end_time)
                || next_start.is_some_and(|s| !vid_pts.is_nan() && vid_pts > s);
            if expired {
                self.subpq.next();
            } else {
                break;
            }
        }
    }

    /// Rubber-band the external clock against packet-queue fullness:
    /// starving slows it down toward 0.9x, overflow speeds it up toward
    /// 1.01x, otherwise it creeps back to 1.0.
    fn check_external_clock_speed(&self) {
        let (has_video, has_audio) = {
            let s = self.streams.lock();
            (s.video.is_some(), s.audio.is_some())
        };
        let starving = (has_video && self.videoq.nb_packets() < EXTERNAL_CLOCK_MIN_FRAMES)
            || (has_audio && self.audioq.nb_packets() < EXTERNAL_CLOCK_MIN_FRAMES);
        let overflowing = (!has_video || self.videoq.nb_packets() > EXTERNAL_CLOCK_MAX_FRAMES)
            && (!has_audio || self.audioq.nb_packets() > EXTERNAL_CLOCK_MAX_FRAMES);
        let speed = self.extclk.speed();
        let adjusted = sync::external_clock_speed_step(speed, starving, overflowing);
        if adjusted != speed {
            self.extclk.set_speed(adjusted);
        }
    }

    /// Once-per-second playback status line.
    fn maybe_log_status(&self) {
        let now = clock::now();
        {
            let mut refresh = self.refresh.lock();
            if now - refresh.last_status < 1.0 {
                return;
            }
            refresh.last_status = now;
        }
        let (has_audio, has_video) = {
            let s = self.streams.lock();
            (s.audio.is_some(), s.video.is_some())
        };
        let (label, diff) = match (has_audio, has_video) {
            (true, true) => ("A-V", self.audclk.get() - self.vidclk.get()),
            (false, true) => ("M-V", self.master_clock() - self.vidclk.get()),
            (true, false) => ("M-A", self.master_clock() - self.audclk.get()),
            (false, false) => ("   ", 0.0),
        };
        debug!(
            "{:7.2} {label}:{diff:+7.3} fd={}/{} aq={}KB vq={}KB sq={}B",
            self.master_clock(),
            self.frame_drops_early.load(Ordering::Relaxed),
            self.frame_drops_late.load(Ordering::Relaxed),
            self.audioq.byte_size() / 1024,
            self.videoq.byte_size() / 1024,
            self.subtitleq.byte_size(),
        );
    }
}
