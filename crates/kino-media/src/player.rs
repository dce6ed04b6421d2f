// crates/kino-media/src/player.rs
//
// Player: the composite that owns the three packet queues, three frame
// queues and three clocks, routes control requests (seek, pause, stream
// cycling, volume) from the UI thread, and carries the shared flags the
// demuxer/decoder/audio threads coordinate through. Requests that need the
// format context (seek, cycle) are executed by the demuxer thread, which
// owns it; everything here only records them and pings continue_read.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, Sender};
use ffmpeg_the_third as ffmpeg;
use parking_lot::Mutex;

use kino_core::clock::{self, Clock};
use kino_core::frame_queue::FrameQueue;
use kino_core::notify::Notify;
use kino_core::packet_queue::PacketQueue;
use kino_core::sync::{self, SyncMaster};

use crate::audio::AudioRender;
use crate::demux;
use crate::frames::{AudioSample, SubPicture, VideoPicture};
use crate::packet::DemuxPacket;

/// Byte budget across all packet queues before the demuxer backs off.
pub(crate) const MAX_QUEUE_SIZE: usize = 15 * 1024 * 1024;
/// A stream with more packets than this (and over a second buffered) is full.
pub(crate) const MIN_FRAMES: usize = 25;

/// Poll no less often than this from the UI loop, seconds.
pub const REFRESH_RATE: f64 = 0.01;

pub(crate) const VIDEO_PICTURE_QUEUE_SIZE: usize = 3;
pub(crate) const SUBPICTURE_QUEUE_SIZE: usize = 16;
pub(crate) const SAMPLE_QUEUE_SIZE: usize = 9;

/// Full scale of the software mixer.
pub const MAX_VOLUME: i32 = 128;
/// Volume key step, decibels.
pub const VOLUME_STEP_DB: f64 = 0.75;

pub(crate) const AV_TIME_BASE: f64 = ffmpeg::ffi::AV_TIME_BASE as f64;

/// Flags that shape the engine, filled from the CLI by kino-ui.
#[derive(Clone)]
pub struct PlayerOptions {
    pub input:            String,
    /// Start position in seconds (`-ss`).
    pub start_time:       Option<f64>,
    /// Play-range length in seconds (`-t`).
    pub play_duration:    Option<f64>,
    /// Seek by bytes: 0 never, 1 always, -1 by container kind.
    pub seek_by_bytes:    i32,
    pub seek_interval:    f64,
    pub sync:             SyncMaster,
    /// Allow non-spec-compliant codec speedups.
    pub fast:             bool,
    /// Let the demuxer generate missing pts.
    pub genpts:           bool,
    /// Video pts source: 1 decoder reorder, 0 packet dts, -1 best effort.
    pub reorder_pts:      i32,
    /// Number of times to play (0 = forever).
    pub loop_count:       i32,
    /// Drop late video frames: 1 always, 0 never, -1 when video is slaved.
    pub framedrop:        i32,
    /// Ignore buffer limits: 1 yes, 0 no, -1 for realtime sources.
    pub infinite_buffer:  i32,
    /// Startup volume 0..100.
    pub volume:           i32,
    pub autoexit:         bool,
    pub audio_disable:    bool,
    pub video_disable:    bool,
    pub subtitle_disable: bool,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            input:            String::new(),
            start_time:       None,
            play_duration:    None,
            seek_by_bytes:    -1,
            seek_interval:    10.0,
            sync:             SyncMaster::Audio,
            fast:             false,
            genpts:           false,
            reorder_pts:      -1,
            loop_count:       1,
            framedrop:        -1,
            infinite_buffer:  -1,
            volume:           100,
            autoexit:         false,
            audio_disable:    false,
            video_disable:    false,
            subtitle_disable: false,
        }
    }
}

/// Engine-to-UI notifications.
pub enum PlayerEvent {
    /// Orderly end: autoexit, fatal open failure, or loop exhaustion.
    Quit,
}

pub(crate) struct SeekRequest {
    pub target:   i64,
    pub rel:      i64,
    pub by_bytes: bool,
}

/// Snapshot of what the demuxer discovered at open time, plus which
/// streams are currently open. Everything the UI thread may ask about
/// lives here so it never touches the format context.
pub(crate) struct StreamSet {
    pub audio:              Option<usize>,
    pub video:              Option<usize>,
    pub subtitle:           Option<usize>,
    pub max_frame_duration: f64,
    pub realtime:           bool,
    pub seek_by_bytes:      bool,
    /// Media duration in seconds, <= 0 when unknown.
    pub duration:           f64,
    /// Container start time in seconds, if declared.
    pub start_time:         Option<f64>,
    pub bit_rate:           i64,
    pub file_size:          i64,
    /// Chapter start times in AV_TIME_BASE units.
    pub chapters:           Vec<i64>,
}

impl StreamSet {
    fn empty() -> Self {
        Self {
            audio:              None,
            video:              None,
            subtitle:           None,
            max_frame_duration: 3600.0,
            realtime:           false,
            seek_by_bytes:      false,
            duration:           0.0,
            start_time:         None,
            bit_rate:           0,
            file_size:          -1,
            chapters:           Vec::new(),
        }
    }
}

pub(crate) struct RefreshState {
    pub frame_timer:   f64,
    pub force_refresh: bool,
    pub last_status:   f64,
}

pub struct Player {
    pub opts: PlayerOptions,

    pub(crate) audioq:    PacketQueue<DemuxPacket>,
    pub(crate) videoq:    PacketQueue<DemuxPacket>,
    pub(crate) subtitleq: PacketQueue<DemuxPacket>,

    pub(crate) pictq: FrameQueue<VideoPicture>,
    pub(crate) sampq: FrameQueue<AudioSample>,
    pub(crate) subpq: FrameQueue<SubPicture>,

    pub(crate) audclk: Clock,
    pub(crate) vidclk: Clock,
    pub(crate) extclk: Clock,

    pub(crate) continue_read: Notify,

    abort:  AtomicBool,
    paused: AtomicBool,
    step:   AtomicBool,
    muted:  AtomicBool,
    volume: AtomicI32,
    /// av_read_pause returned "unsupported" for this input.
    pub(crate) read_pause_unsupported: AtomicBool,

    pub(crate) frame_drops_early: AtomicU64,
    pub(crate) frame_drops_late:  AtomicU64,
    /// Serial at which each decoder drained (0 = still going).
    pub(crate) audio_finished: AtomicU64,
    pub(crate) video_finished: AtomicU64,
    /// Byte position of the last demuxed packet (byte-seek fallback).
    pub(crate) last_read_pos: AtomicI64,
    /// Last requested seek target, AV_TIME_BASE units.
    last_seek_target: AtomicI64,

    pub(crate) seek_req:  Mutex<Option<SeekRequest>>,
    pub(crate) cycle_req: Mutex<Vec<ffmpeg::media::Type>>,
    pub(crate) streams:   Mutex<StreamSet>,
    pub(crate) refresh:   Mutex<RefreshState>,
    pub(crate) audio:     Mutex<Option<AudioRender>>,

    events: Sender<PlayerEvent>,
    demux:  Mutex<Option<JoinHandle<()>>>,
}

impl Player {
    /// Build the engine and start the demuxer thread. Events arrive on the
    /// returned channel; frames arrive through `video_refresh` and the
    /// audio device callback.
    pub fn open(opts: PlayerOptions) -> Result<(Arc<Self>, Receiver<PlayerEvent>)> {
        let (events, rx) = bounded(16);

        let audioq = PacketQueue::new();
        let videoq = PacketQueue::new();
        let subtitleq = PacketQueue::new();

        let pictq = FrameQueue::new(videoq.epoch(), VIDEO_PICTURE_QUEUE_SIZE, true);
        let sampq = FrameQueue::new(audioq.epoch(), SAMPLE_QUEUE_SIZE, true);
        let subpq = FrameQueue::new(subtitleq.epoch(), SUBPICTURE_QUEUE_SIZE, false);

        let audclk = Clock::new(Some(audioq.epoch()));
        let vidclk = Clock::new(Some(videoq.epoch()));
        let extclk = Clock::new(None);

        let start_volume = (opts.volume.clamp(0, 100) * MAX_VOLUME) / 100;

        let player = Arc::new(Self {
            opts,
            audioq,
            videoq,
            subtitleq,
            pictq,
            sampq,
            subpq,
            audclk,
            vidclk,
            extclk,
            continue_read: Notify::new(),
            abort: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            step: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            volume: AtomicI32::new(start_volume),
            read_pause_unsupported: AtomicBool::new(false),
            frame_drops_early: AtomicU64::new(0),
            frame_drops_late: AtomicU64::new(0),
            audio_finished: AtomicU64::new(0),
            video_finished: AtomicU64::new(0),
            last_read_pos: AtomicI64::new(-1),
            last_seek_target: AtomicI64::new(0),
            seek_req: Mutex::new(None),
            cycle_req: Mutex::new(Vec::new()),
            streams: Mutex::new(StreamSet::empty()),
            refresh: Mutex::new(RefreshState {
                frame_timer:   0.0,
                force_refresh: false,
                last_status:   0.0,
            }),
            audio: Mutex::new(None),
            events,
            demux: Mutex::new(None),
        });

        let handle = thread::Builder::new()
            .name("kino-demux".into())
            .spawn({
                let player = Arc::clone(&player);
                move || demux::read_loop(player)
            })?;
        *player.demux.lock() = Some(handle);

        Ok((player, rx))
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    /// Request teardown without blocking; safe from any thread (including
    /// the signal handler).
    pub fn request_stop(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.audioq.abort();
        self.videoq.abort();
        self.subtitleq.abort();
        self.pictq.signal();
        self.sampq.signal();
        self.subpq.signal();
        self.continue_read.notify();
    }

    /// Stop and join the demuxer (which in turn joins the decoder threads
    /// and closes the audio device).
    pub fn shutdown(&self) {
        self.request_stop();
        if let Some(handle) = self.demux.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub(crate) fn send_event(&self, ev: PlayerEvent) {
        let _ = self.events.try_send(ev);
    }

    // ── Pause / step ─────────────────────────────────────────────────────

    /// Re-anchor the video and external clocks at their observed values,
    /// then flip paused on the state and all three clocks, so `get_clock`
    /// is continuous across the transition.
    pub(crate) fn stream_toggle_pause(&self) {
        let was_paused = self.paused.load(Ordering::SeqCst);
        if was_paused {
            {
                let mut r = self.refresh.lock();
                r.frame_timer += clock::now() - self.vidclk.last_updated();
            }
            if !self.read_pause_unsupported.load(Ordering::Relaxed) {
                self.vidclk.set_paused(false);
            }
            self.vidclk.set(self.vidclk.get(), self.vidclk.serial());
        }
        self.extclk.set(self.extclk.get(), self.extclk.serial());
        let paused = !was_paused;
        self.paused.store(paused, Ordering::SeqCst);
        self.audclk.set_paused(paused);
        self.vidclk.set_paused(paused);
        self.extclk.set_paused(paused);
    }

    pub fn toggle_pause(&self) {
        self.stream_toggle_pause();
        self.step.store(false, Ordering::SeqCst);
    }

    /// Advance exactly one video frame; the refresh loop re-pauses after
    /// presenting it.
    pub fn step_to_next_frame(&self) {
        if self.paused.load(Ordering::SeqCst) {
            self.stream_toggle_pause();
        }
        self.step.store(true, Ordering::SeqCst);
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn stepping(&self) -> bool {
        self.step.load(Ordering::SeqCst)
    }

    // ── Seeking ──────────────────────────────────────────────────────────

    /// Record a seek for the demuxer thread. Ignored while one is pending.
    pub fn stream_seek(&self, target: i64, rel: i64, by_bytes: bool) {
        let mut req = self.seek_req.lock();
        if req.is_none() {
            *req = Some(SeekRequest { target, rel, by_bytes });
            if !by_bytes {
                self.last_seek_target.store(target, Ordering::Relaxed);
            }
            drop(req);
            self.continue_read.notify();
        }
    }

    /// Seek forward/backward by `incr` seconds (or the byte equivalent for
    /// containers that only seek reliably by position).
    pub fn seek_relative(&self, incr: f64) {
        let (by_bytes, bit_rate, start_time) = {
            let s = self.streams.lock();
            (s.seek_by_bytes, s.bit_rate, s.start_time)
        };
        if by_bytes {
            let pos = self
                .last_shown_video_pos()
                .or_else(|| self.last_shown_audio_pos())
                .unwrap_or_else(|| self.last_read_pos.load(Ordering::Relaxed));
            let scale = if bit_rate > 0 { bit_rate as f64 / 8.0 } else { 180_000.0 };
            let byte_incr = incr * scale;
            let target = pos.max(0) as f64 + byte_incr;
            self.stream_seek(target as i64, byte_incr as i64, true);
        } else {
            let mut pos = self.master_clock();
            if pos.is_nan() {
                pos = self.last_seek_target.load(Ordering::Relaxed) as f64 / AV_TIME_BASE;
            }
            pos += incr;
            if let Some(start) = start_time {
                if pos < start {
                    pos = start;
                }
            }
            self.stream_seek((pos * AV_TIME_BASE) as i64, (incr * AV_TIME_BASE) as i64, false);
        }
    }

    /// Seek to a fraction of the whole file (mouse seek).
    pub fn seek_to_fraction(&self, frac: f64) {
        let frac = frac.clamp(0.0, 1.0);
        let s = self.streams.lock();
        if s.seek_by_bytes || s.duration <= 0.0 {
            if s.file_size > 0 {
                self.stream_seek((frac * s.file_size as f64) as i64, 0, true);
            }
        } else {
            let ts = frac * s.duration + s.start_time.unwrap_or(0.0);
            self.stream_seek((ts * AV_TIME_BASE) as i64, 0, false);
        }
    }

    /// Jump to the previous/next chapter. Returns false when the input has
    /// at most one chapter (callers fall back to a long relative seek).
    pub fn seek_chapter(&self, incr: i32) -> bool {
        let chapters = self.streams.lock().chapters.clone();
        if chapters.len() <= 1 {
            return false;
        }
        let pos = {
            let c = self.master_clock();
            if c.is_nan() { 0 } else { (c * AV_TIME_BASE) as i64 }
        };
        let mut idx = chapters.iter().take_while(|&&start| pos >= start).count() as i32 - 1;
        idx += incr;
        if idx < 0 {
            idx = 0;
        }
        if let Some(&start) = chapters.get(idx as usize) {
            tracing::debug!("seeking to chapter {idx}");
            self.stream_seek(start, 0, false);
        }
        true
    }

    fn last_shown_video_pos(&self) -> Option<i64> {
        if !self.pictq.rindex_shown() {
            return None;
        }
        self.pictq
            .peek_last_with(|vp| (vp.pos, vp.serial))
            .and_then(|(pos, serial)| (serial == self.videoq.serial() && pos >= 0).then_some(pos))
    }

    fn last_shown_audio_pos(&self) -> Option<i64> {
        if !self.sampq.rindex_shown() {
            return None;
        }
        self.sampq
            .peek_last_with(|af| (af.pos, af.serial))
            .and_then(|(pos, serial)| (serial == self.audioq.serial() && pos >= 0).then_some(pos))
    }

    // ── Stream cycling ───────────────────────────────────────────────────

    /// Ask the demuxer to switch to the next stream of this kind.
    pub fn cycle_stream(&self, kind: ffmpeg::media::Type) {
        self.cycle_req.lock().push(kind);
        self.continue_read.notify();
    }

    pub fn cycle_all_streams(&self) {
        use ffmpeg::media::Type;
        let mut req = self.cycle_req.lock();
        req.extend([Type::Video, Type::Audio, Type::Subtitle]);
        drop(req);
        self.continue_read.notify();
    }

    // ── Volume / mute ────────────────────────────────────────────────────

    /// Nudge the volume by `sign * step_db` decibels.
    pub fn update_volume(&self, sign: i32, step_db: f64) {
        let cur = self.volume.load(Ordering::Relaxed);
        let level = if cur > 0 {
            20.0 * (f64::from(cur) / f64::from(MAX_VOLUME)).log10()
        } else {
            -1000.0
        };
        let new = (f64::from(MAX_VOLUME) * 10f64.powf((level + f64::from(sign) * step_db) / 20.0))
            .round() as i32;
        // A sub-step dB change can round back to the same integer volume;
        // force at least one tick so the key always does something.
        let next = if new == cur { cur + sign } else { new };
        self.volume.store(next.clamp(0, MAX_VOLUME), Ordering::Relaxed);
    }

    pub fn toggle_mute(&self) {
        self.muted.fetch_xor(true, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Mixer volume, 0..=MAX_VOLUME.
    pub fn volume(&self) -> i32 {
        self.volume.load(Ordering::Relaxed)
    }

    // ── Clocks / sync ────────────────────────────────────────────────────

    pub fn master_sync_type(&self) -> SyncMaster {
        let s = self.streams.lock();
        sync::master_for(self.opts.sync, s.video.is_some(), s.audio.is_some())
    }

    pub fn master_clock(&self) -> f64 {
        match self.master_sync_type() {
            SyncMaster::Audio => self.audclk.get(),
            SyncMaster::Video => self.vidclk.get(),
            SyncMaster::External => self.extclk.get(),
        }
    }

    // ── UI queries ───────────────────────────────────────────────────────

    pub fn has_video(&self) -> bool {
        self.streams.lock().video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.streams.lock().audio.is_some()
    }

    pub fn duration(&self) -> f64 {
        self.streams.lock().duration
    }

    /// Borrow the current (last shown) video picture for texture upload.
    pub fn with_current_picture<R>(&self, f: impl FnOnce(&VideoPicture) -> R) -> Option<R> {
        if !self.pictq.rindex_shown() {
            return None;
        }
        self.pictq.peek_last_with(f)
    }

    /// Borrow the subtitle that should currently be on screen, if any.
    pub fn with_current_subtitle<R>(&self, f: impl FnOnce(&SubPicture) -> R) -> Option<R> {
        let clock = self.vidclk.pts();
        if clock.is_nan() {
            return None;
        }
        let serial = self.subtitleq.serial();
        self.subpq
            .peek_with(|sp| {
                (sp.serial == serial && sp.visible_at(clock) && !sp.lines.is_empty())
                    .then(|| f(sp))
            })
            .flatten()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        // Normal paths call shutdown() first; this is the backstop.
        self.request_stop();
        if let Some(handle) = self.demux.get_mut().take() {
            let _ = handle.join();
        }
    }
}
