// crates/kino-media/src/demux.rs
//
// The demuxer thread: opens the input, selects and opens stream
// components, then loops reading packets into the per-stream queues with
// backpressure, executing seek and stream-cycle requests, draining at EOF
// and looping or autoexiting. This thread owns the format context and the
// cpal stream handle; every request that needs either is executed here.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use cpal::traits::StreamTrait;
use ffmpeg_the_third as ffmpeg;
use ffmpeg::media::Type;
use ffmpeg::{Rational, Rescale};
use tracing::{debug, info, warn};

use crate::audio::{self, AudioRender};
use crate::decoder;
use crate::packet::{self, DemuxPacket};
use crate::player::{
    Player, PlayerEvent, SeekRequest, AV_TIME_BASE, MAX_QUEUE_SIZE, MIN_FRAMES,
};

fn q2d(r: Rational) -> f64 {
    if r.denominator() == 0 {
        0.0
    } else {
        f64::from(r.numerator()) / f64::from(r.denominator())
    }
}

/// One open stream component: its decoder thread plus what the demux loop
/// needs to route and account for its packets. The cpal stream handle is
/// kept here because it is not Send — the device dies with the component.
struct OpenStream {
    index:        usize,
    kind:         Type,
    handle:       Option<JoinHandle<()>>,
    time_base:    Rational,
    attached_pic: bool,
    device:       Option<cpal::Stream>,
}

#[derive(Default)]
struct Components {
    audio:    Option<OpenStream>,
    video:    Option<OpenStream>,
    subtitle: Option<OpenStream>,
}

pub(crate) fn read_loop(player: Arc<Player>) {
    match open_and_run(&player) {
        Ok(()) => info!("demuxer finished"),
        Err(e) => {
            warn!("playback failed: {e:#}");
            player.send_event(PlayerEvent::Quit);
        }
    }
}

fn open_and_run(player: &Arc<Player>) -> Result<()> {
    let opts = player.opts.clone();

    let mut ictx = ffmpeg::format::input(&opts.input)
        .with_context(|| format!("cannot open {}", opts.input))?;
    if opts.genpts {
        unsafe {
            (*ictx.as_mut_ptr()).flags |= ffmpeg::ffi::AVFMT_FLAG_GENPTS as i32;
        }
    }

    let format_name = ictx.format().name().to_string();
    let ts_discont = unsafe {
        ((*(*ictx.as_ptr()).iformat).flags & ffmpeg::ffi::AVFMT_TS_DISCONT as i32) != 0
    };
    let realtime = matches!(format_name.as_str(), "rtp" | "rtsp" | "sdp")
        || opts.input.starts_with("rtp:")
        || opts.input.starts_with("udp:");

    // Snapshot everything the UI thread may ask about, so it never has to
    // touch the format context.
    {
        let mut s = player.streams.lock();
        s.realtime = realtime;
        s.max_frame_duration = if ts_discont { 10.0 } else { 3600.0 };
        s.seek_by_bytes = match opts.seek_by_bytes {
            0 => false,
            x if x > 0 => true,
            _ => ts_discont && format_name != "ogg",
        };
        let duration = ictx.duration();
        s.duration = if duration > 0 {
            duration as f64 / AV_TIME_BASE
        } else {
            0.0
        };
        let start = unsafe { (*ictx.as_ptr()).start_time };
        s.start_time =
            (start != ffmpeg::ffi::AV_NOPTS_VALUE).then(|| start as f64 / AV_TIME_BASE);
        s.bit_rate = ictx.bit_rate();
        s.file_size = unsafe {
            let pb = (*ictx.as_ptr()).pb;
            if pb.is_null() {
                -1
            } else {
                ffmpeg::ffi::avio_size(pb)
            }
        };
        s.chapters = ictx
            .chapters()
            .map(|ch| {
                ch.start().rescale(
                    ch.time_base(),
                    Rational::new(1, ffmpeg::ffi::AV_TIME_BASE as i32),
                )
            })
            .collect();
    }

    // Start-position seek before anything is queued.
    if let Some(ss) = opts.start_time {
        let mut timestamp = (ss * AV_TIME_BASE) as i64;
        let container_start = unsafe { (*ictx.as_ptr()).start_time };
        if container_start != ffmpeg::ffi::AV_NOPTS_VALUE {
            timestamp += container_start;
        }
        let ret = unsafe {
            ffmpeg::ffi::avformat_seek_file(
                ictx.as_mut_ptr(),
                -1,
                i64::MIN,
                timestamp,
                i64::MAX,
                0,
            )
        };
        if ret < 0 {
            warn!("could not seek to start position {ss:.3}s");
        }
    }

    let video_idx = (!opts.video_disable)
        .then(|| ictx.streams().best(Type::Video).map(|s| s.index()))
        .flatten();
    let audio_idx = (!opts.audio_disable)
        .then(|| ictx.streams().best(Type::Audio).map(|s| s.index()))
        .flatten();
    let subtitle_idx = (!opts.subtitle_disable)
        .then(|| ictx.streams().best(Type::Subtitle).map(|s| s.index()))
        .flatten();
    if video_idx.is_none() && audio_idx.is_none() {
        bail!("no audio or video stream in {}", opts.input);
    }

    let mut components = Components::default();
    if let Some(i) = audio_idx {
        match stream_component_open(player, &mut ictx, i) {
            Ok(c) => components.audio = Some(c),
            Err(e) => warn!("audio stream disabled: {e:#}"),
        }
    }
    if let Some(i) = video_idx {
        match stream_component_open(player, &mut ictx, i) {
            Ok(c) => components.video = Some(c),
            Err(e) => warn!("video stream disabled: {e:#}"),
        }
    }
    if let Some(i) = subtitle_idx {
        match stream_component_open(player, &mut ictx, i) {
            Ok(c) => components.subtitle = Some(c),
            Err(e) => warn!("subtitle stream disabled: {e:#}"),
        }
    }
    if components.audio.is_none() && components.video.is_none() {
        bail!("could not open any stream component");
    }

    let infinite = opts.infinite_buffer == 1 || (opts.infinite_buffer < 0 && realtime);
    let mut queue_attachments = components
        .video
        .as_ref()
        .is_some_and(|v| v.attached_pic);
    let mut last_paused = false;
    let mut eof = false;
    let mut loops_left = opts.loop_count;
    let mut autoexit_hit = false;

    loop {
        if player.aborted() {
            break;
        }

        let paused = player.paused();
        if paused != last_paused {
            last_paused = paused;
            if paused {
                if ictx.pause().is_err() {
                    // Unsupported for this input; remembered so unpausing
                    // skips the network-clock adjustment.
                    player.read_pause_unsupported.store(true, Ordering::Relaxed);
                }
            } else {
                let _ = ictx.play();
            }
        }

        let pending_seek = player.seek_req.lock().take();
        if let Some(req) = pending_seek {
            execute_seek(player, &mut ictx, &req, &components);
            eof = false;
            if components.video.as_ref().is_some_and(|v| v.attached_pic) {
                queue_attachments = true;
            }
        }

        if queue_attachments {
            if let Some(v) = &components.video {
                if v.attached_pic {
                    if let Some(stream) = ictx.stream(v.index) {
                        if let Some(pkt) = packet::attached_picture(&stream) {
                            player.videoq.put(pkt);
                            player.videoq.put_null();
                        }
                    }
                }
            }
            queue_attachments = false;
        }

        let cycles: Vec<Type> = std::mem::take(&mut *player.cycle_req.lock());
        for kind in cycles {
            if cycle_stream(player, &mut ictx, &mut components, kind) {
                queue_attachments = true;
            }
        }

        // Backpressure: bounded bytes across all queues, or every open
        // stream already has enough buffered.
        let queued_bytes = player.audioq.byte_size()
            + player.videoq.byte_size()
            + player.subtitleq.byte_size();
        if !infinite
            && (queued_bytes > MAX_QUEUE_SIZE
                || (has_enough_packets(&player.audioq, components.audio.as_ref())
                    && has_enough_packets(&player.videoq, components.video.as_ref())
                    && has_enough_packets(&player.subtitleq, components.subtitle.as_ref())))
        {
            player.continue_read.wait_timeout(Duration::from_millis(10));
            continue;
        }

        // Fully drained: decoders finished at the current serials and the
        // frame queues are empty.
        let audio_drained = components.audio.as_ref().map_or(true, |_| {
            player.audio_finished.load(Ordering::SeqCst) == player.audioq.serial()
                && player.sampq.nb_remaining() == 0
        });
        let video_drained = components.video.as_ref().map_or(true, |_| {
            player.video_finished.load(Ordering::SeqCst) == player.videoq.serial()
                && player.pictq.nb_remaining() == 0
        });
        if !paused && audio_drained && video_drained {
            if loops_left != 1 {
                if loops_left > 1 {
                    loops_left -= 1;
                }
                let start = player
                    .streams
                    .lock()
                    .start_time
                    .map_or(0, |s| (s * AV_TIME_BASE) as i64);
                player.stream_seek(start, 0, false);
            } else if opts.autoexit {
                autoexit_hit = true;
                break;
            }
        }

        match ictx.packets().next() {
            Some(Ok((stream, pkt))) => {
                if pkt.position() >= 0 {
                    player
                        .last_read_pos
                        .store(pkt.position() as i64, Ordering::Relaxed);
                }
                let idx = stream.index();
                let in_range = in_play_range(&opts, &stream, &pkt);
                if components.audio.as_ref().is_some_and(|c| c.index == idx) && in_range {
                    player.audioq.put(DemuxPacket(pkt));
                } else if components
                    .video
                    .as_ref()
                    .is_some_and(|c| c.index == idx && !c.attached_pic)
                    && in_range
                {
                    player.videoq.put(DemuxPacket(pkt));
                } else if components.subtitle.as_ref().is_some_and(|c| c.index == idx) && in_range
                {
                    player.subtitleq.put(DemuxPacket(pkt));
                }
            }
            None | Some(Err(ffmpeg::Error::Eof)) => {
                if !eof {
                    if components.video.is_some() {
                        player.videoq.put_null();
                    }
                    if components.audio.is_some() {
                        player.audioq.put_null();
                    }
                    if components.subtitle.is_some() {
                        player.subtitleq.put_null();
                    }
                    eof = true;
                }
                player.continue_read.wait_timeout(Duration::from_millis(10));
            }
            Some(Err(e)) => {
                warn!("read error: {e}");
                if opts.autoexit {
                    autoexit_hit = true;
                    break;
                }
                player.continue_read.wait_timeout(Duration::from_millis(10));
            }
        }
    }

    for comp in [
        components.audio.take(),
        components.video.take(),
        components.subtitle.take(),
    ]
    .into_iter()
    .flatten()
    {
        stream_component_close(player, comp);
    }

    if autoexit_hit {
        player.send_event(PlayerEvent::Quit);
    }
    Ok(())
}

/// "Enough" packets for one stream: absent, aborted, a one-shot attached
/// picture, or comfortably more than a second of buffered input.
fn has_enough_packets(
    q: &kino_core::packet_queue::PacketQueue<DemuxPacket>,
    comp: Option<&OpenStream>,
) -> bool {
    let Some(c) = comp else { return true };
    q.is_aborted()
        || c.attached_pic
        || (q.nb_packets() > MIN_FRAMES
            && (q.duration() == 0 || q.duration() as f64 * q2d(c.time_base) > 1.0))
}

fn in_play_range(
    opts: &crate::player::PlayerOptions,
    stream: &ffmpeg::format::stream::Stream,
    pkt: &ffmpeg::Packet,
) -> bool {
    let Some(play_duration) = opts.play_duration else {
        return true;
    };
    let Some(ts) = pkt.pts().or_else(|| pkt.dts()) else {
        return true;
    };
    let stream_start = stream.start_time();
    let base = if stream_start != ffmpeg::ffi::AV_NOPTS_VALUE {
        stream_start
    } else {
        0
    };
    let secs = (ts - base) as f64 * q2d(stream.time_base());
    secs - opts.start_time.unwrap_or(0.0) <= play_duration
}

/// Range-seek the input and flush every open queue into a new epoch. The
/// ±2 adjustments on the bounds compensate rounding in how seek targets
/// and increments are generated; a known heuristic carried as-is.
fn execute_seek(
    player: &Arc<Player>,
    ictx: &mut ffmpeg::format::context::Input,
    req: &SeekRequest,
    components: &Components,
) {
    let target = req.target;
    let seek_min = if req.rel > 0 { target - req.rel + 2 } else { i64::MIN };
    let seek_max = if req.rel < 0 { target - req.rel - 2 } else { i64::MAX };
    let flags = if req.by_bytes {
        ffmpeg::ffi::AVSEEK_FLAG_BYTE as i32
    } else {
        0
    };

    let ret = unsafe {
        ffmpeg::ffi::avformat_seek_file(ictx.as_mut_ptr(), -1, seek_min, target, seek_max, flags)
    };
    if ret < 0 {
        // Decoding resumes from the current position; consumers' pts
        // filtering copes with whatever comes out.
        warn!("seek to {target} soft-failed");
    } else {
        if components.audio.is_some() {
            player.audioq.flush();
        }
        if components.subtitle.is_some() {
            player.subtitleq.flush();
        }
        if components.video.is_some() {
            player.videoq.flush();
        }
        if req.by_bytes {
            player.extclk.set(f64::NAN, 0);
        } else {
            player.extclk.set(target as f64 / AV_TIME_BASE, 0);
        }
        debug!("seek to {target} done (bytes: {})", req.by_bytes);
    }
    if player.paused() {
        player.step_to_next_frame();
    }
}

/// Open one stream's codec, device (for audio) and decoder thread.
fn stream_component_open(
    player: &Arc<Player>,
    ictx: &mut ffmpeg::format::context::Input,
    index: usize,
) -> Result<OpenStream> {
    let (kind, tb, frame_rate, start_time, attached_pic, params) = {
        let stream = ictx.stream(index).context("stream vanished")?;
        (
            stream.parameters().medium(),
            stream.time_base(),
            stream.avg_frame_rate(),
            stream.start_time(),
            packet::is_attached_pic(&stream),
            stream.parameters(),
        )
    };

    let mut codec_ctx = ffmpeg::codec::context::Context::from_parameters(params)?;
    unsafe {
        // Timestamps entering the codec are in the stream's time base.
        (*codec_ctx.as_mut_ptr()).pkt_timebase = tb.into();
        if player.opts.fast {
            (*codec_ctx.as_mut_ptr()).flags2 |= ffmpeg::ffi::AV_CODEC_FLAG2_FAST as i32;
        }
    }

    match kind {
        Type::Audio => {
            let dec = codec_ctx.decoder().audio()?;
            let (device, tgt, hw_buf_size) =
                audio::open_device(player, dec.rate(), dec.channels())?;
            *player.audio.lock() = Some(AudioRender::new(tgt, hw_buf_size));

            // Formats without timestamps (raw elementary streams) get the
            // stream start time as the baseline for pts synthesis.
            let no_timestamps = unsafe {
                ((*(*ictx.as_ptr()).iformat).flags
                    & ffmpeg::ffi::AVFMT_NOTIMESTAMPS as i32)
                    != 0
            };
            let start_pts = (no_timestamps && start_time != ffmpeg::ffi::AV_NOPTS_VALUE)
                .then_some(start_time);

            player.audioq.start();
            let handle = thread::Builder::new()
                .name("kino-audio-dec".into())
                .spawn({
                    let p = Arc::clone(player);
                    move || decoder::audio_thread(p, dec, tb, start_pts)
                })?;
            device.play().context("cannot start audio device")?;
            player.streams.lock().audio = Some(index);
            info!("audio stream #{index} open");
            Ok(OpenStream {
                index,
                kind,
                handle: Some(handle),
                time_base: tb,
                attached_pic: false,
                device: Some(device),
            })
        }
        Type::Video => {
            let dec = codec_ctx.decoder().video()?;
            player.videoq.start();
            let handle = thread::Builder::new()
                .name("kino-video-dec".into())
                .spawn({
                    let p = Arc::clone(player);
                    move || decoder::video_thread(p, dec, tb, frame_rate)
                })?;
            player.streams.lock().video = Some(index);
            info!("video stream #{index} open");
            Ok(OpenStream {
                index,
                kind,
                handle: Some(handle),
                time_base: tb,
                attached_pic,
                device: None,
            })
        }
        Type::Subtitle => {
            let dec = codec_ctx.decoder().subtitle()?;
            player.subtitleq.start();
            let handle = thread::Builder::new()
                .name("kino-subtitle-dec".into())
                .spawn({
                    let p = Arc::clone(player);
                    move || decoder::subtitle_thread(p, dec)
                })?;
            player.streams.lock().subtitle = Some(index);
            info!("subtitle stream #{index} open");
            Ok(OpenStream {
                index,
                kind,
                handle: Some(handle),
                time_base: tb,
                attached_pic: false,
                device: None,
            })
        }
        other => bail!("unsupported stream kind {other:?}"),
    }
}

/// Abort the queue, wake the frame ring, join the decoder thread and drop
/// the device. The frame queue contents die with their stale serial.
fn stream_component_close(player: &Arc<Player>, mut comp: OpenStream) {
    match comp.kind {
        Type::Audio => {
            player.audioq.abort();
            player.sampq.signal();
            if let Some(h) = comp.handle.take() {
                let _ = h.join();
            }
            player.audioq.flush();
            drop(comp.device.take());
            *player.audio.lock() = None;
            player.streams.lock().audio = None;
        }
        Type::Video => {
            player.videoq.abort();
            player.pictq.signal();
            if let Some(h) = comp.handle.take() {
                let _ = h.join();
            }
            player.videoq.flush();
            player.streams.lock().video = None;
        }
        Type::Subtitle => {
            player.subtitleq.abort();
            player.subpq.signal();
            if let Some(h) = comp.handle.take() {
                let _ = h.join();
            }
            player.subtitleq.flush();
            player.streams.lock().subtitle = None;
        }
        _ => {}
    }
    info!("{:?} stream #{} closed", comp.kind, comp.index);
}

/// Switch to the next stream of `kind`. Audio/video wrap around; cycling
/// past the last subtitle disables subtitles until cycled again. Returns
/// true when a video component (possibly with an attached picture) was
/// opened.
fn cycle_stream(
    player: &Arc<Player>,
    ictx: &mut ffmpeg::format::context::Input,
    components: &mut Components,
    kind: Type,
) -> bool {
    let candidates: Vec<usize> = ictx
        .streams()
        .filter(|s| s.parameters().medium() == kind)
        .map(|s| s.index())
        .collect();
    if candidates.is_empty() {
        return false;
    }

    let slot = match kind {
        Type::Audio => &mut components.audio,
        Type::Video => &mut components.video,
        Type::Subtitle => &mut components.subtitle,
        _ => return false,
    };
    let current = slot.as_ref().map(|c| c.index);

    let next = match current {
        None => candidates.first().copied(),
        Some(cur) => match candidates.iter().position(|&i| i == cur) {
            Some(p) if p + 1 < candidates.len() => Some(candidates[p + 1]),
            // Past the end: subtitles switch off, audio/video wrap.
            _ if kind == Type::Subtitle => None,
            _ => candidates.first().copied(),
        },
    };
    if next == current {
        return false;
    }

    if let Some(comp) = slot.take() {
        stream_component_close(player, comp);
    }
    let Some(next) = next else {
        debug!("{kind:?} stream switched off");
        return false;
    };

    match stream_component_open(player, ictx, next) {
        Ok(comp) => {
            debug!("switched {kind:?} stream to #{next}");
            let opened_video = comp.kind == Type::Video;
            match kind {
                Type::Audio => components.audio = Some(comp),
                Type::Video => components.video = Some(comp),
                Type::Subtitle => components.subtitle = Some(comp),
                _ => {}
            }
            opened_video
        }
        Err(e) => {
            warn!("cannot open {kind:?} stream #{next}: {e:#}");
            false
        }
    }
}
