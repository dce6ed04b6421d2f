// crates/kino-media/src/audio.rs
//
// Audio output: device negotiation, the device-thread fill callback, and
// per-frame resampling with sync-derived sample-count compensation. The
// callback never blocks on I/O; when the decoder cannot keep up it waits at
// most half a hardware buffer and then emits silence.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use cpal::traits::{DeviceTrait, HostTrait};
use ffmpeg_the_third as ffmpeg;
use ffmpeg::ChannelLayout;
use tracing::{debug, warn};

use kino_core::clock::{self, sync_clock_to_slave};
use kino_core::sync::{AudioDiffFilter, SyncMaster};

use crate::frames::AudioSample;
use crate::player::{Player, MAX_VOLUME};

/// Smallest callback buffer we ask for, in samples per channel.
pub(crate) const AUDIO_MIN_BUFFER_SIZE: usize = 512;
/// Callback cadence ceiling used to size the buffer from the sample rate.
pub(crate) const AUDIO_MAX_CALLBACKS_PER_SEC: usize = 30;

/// Channel-count fallback walk: 7→6, 5→6, 4→6, 3→6, 2→1, then give up.
const NEXT_NB_CHANNELS: [u16; 8] = [0, 0, 1, 6, 2, 6, 4, 6];
/// Sample-rate fallbacks, tried below the source rate, high to low.
const NEXT_SAMPLE_RATES: [u32; 4] = [44100, 48000, 96000, 192000];

/// The negotiated device format. Output is always interleaved s16.
#[derive(Clone, Copy)]
pub struct AudioParams {
    pub freq:          u32,
    pub channels:      u16,
    /// Bytes per interleaved sample group.
    pub frame_size:    usize,
    pub bytes_per_sec: usize,
}

impl AudioParams {
    fn new(freq: u32, channels: u16) -> Self {
        let frame_size = usize::from(channels) * 2;
        Self {
            freq,
            channels,
            frame_size,
            bytes_per_sec: freq as usize * frame_size,
        }
    }
}

/// The swr context only ever runs on the device callback thread; the
/// wrapper lets it live inside the Player-held render state.
struct Resampler(ffmpeg::software::resampling::Context);

// Safety: guarded by the `Player::audio` mutex and touched by one thread.
unsafe impl Send for Resampler {}

/// Callback-side state: staging buffer, resampler, and the audio clock
/// value of the last decoded frame. Lives behind `Player::audio` and is
/// only ever touched from the device thread once playback starts.
pub(crate) struct AudioRender {
    /// Format of the frames most recently seen from the decoder; a change
    /// rebuilds the resampler.
    src_rate:   u32,
    src_format: ffmpeg::format::Sample,
    src_layout: ChannelLayout,

    pub tgt:         AudioParams,
    pub hw_buf_size: usize,

    resampler: Option<Resampler>,
    buf:       Vec<u8>,
    buf_index: usize,

    /// Stream time at the *end* of the last decoded frame.
    clock:        f64,
    clock_serial: u64,

    filter: AudioDiffFilter,
}

impl AudioRender {
    pub(crate) fn new(tgt: AudioParams, hw_buf_size: usize) -> Self {
        Self {
            src_rate:     tgt.freq,
            src_format:   ffmpeg::format::Sample::I16(ffmpeg::format::sample::Type::Packed),
            src_layout:   ChannelLayout::default(i32::from(tgt.channels)),
            tgt,
            hw_buf_size,
            resampler:    None,
            buf:          Vec::new(),
            buf_index:    0,
            clock:        f64::NAN,
            clock_serial: 0,
            filter:       AudioDiffFilter::new(hw_buf_size as f64 / tgt.bytes_per_sec as f64),
        }
    }
}

fn callback_samples(freq: u32) -> usize {
    let per_callback = freq as usize / AUDIO_MAX_CALLBACKS_PER_SEC;
    let mut samples = AUDIO_MIN_BUFFER_SIZE;
    while samples < per_callback {
        samples <<= 1;
    }
    samples
}

/// Open the default output device for interleaved s16, walking the
/// channel/rate fallback tables until something is accepted. Returns the
/// running stream handle (owned by the demuxer thread) plus the accepted
/// format and hardware buffer size in bytes.
pub(crate) fn open_device(
    player: &Arc<Player>,
    wanted_rate: u32,
    wanted_channels: u16,
) -> Result<(cpal::Stream, AudioParams, usize)> {
    if wanted_rate == 0 || wanted_channels == 0 {
        bail!("invalid sample rate or channel count");
    }
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .context("no audio output device")?;

    let mut fallback_rates = NEXT_SAMPLE_RATES
        .iter()
        .rev()
        .copied()
        .filter(|&r| r < wanted_rate);

    let mut freq = wanted_rate;
    let mut channels = wanted_channels;
    loop {
        match try_open(&device, freq, channels, player) {
            Ok(opened) => {
                debug!("audio device open: {freq} Hz, {channels} ch");
                return Ok(opened);
            }
            Err(e) => debug!("audio open {freq} Hz {channels} ch refused: {e}"),
        }
        channels = NEXT_NB_CHANNELS[usize::from(channels.min(7))];
        if channels == 0 {
            match fallback_rates.next() {
                Some(rate) => {
                    freq = rate;
                    channels = wanted_channels;
                }
                None => bail!("no usable audio format, audio disabled"),
            }
        }
    }
}

fn try_open(
    device: &cpal::Device,
    freq: u32,
    channels: u16,
    player: &Arc<Player>,
) -> Result<(cpal::Stream, AudioParams, usize)> {
    let samples = callback_samples(freq);
    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(freq),
        buffer_size: cpal::BufferSize::Fixed(samples as u32),
    };
    // Some backends refuse fixed buffer sizes outright; retry once with the
    // backend's own sizing before falling down the format ladder.
    let stream = build_stream(device, &config, player).or_else(|_| {
        let config = cpal::StreamConfig {
            buffer_size: cpal::BufferSize::Default,
            ..config
        };
        build_stream(device, &config, player)
    })?;
    let tgt = AudioParams::new(freq, channels);
    let hw_buf_size = samples * tgt.frame_size;
    Ok((stream, tgt, hw_buf_size))
}

fn build_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    player: &Arc<Player>,
) -> Result<cpal::Stream, cpal::BuildStreamError> {
    let player = Arc::clone(player);
    device.build_output_stream(
        config,
        move |data: &mut [i16], _: &cpal::OutputCallbackInfo| player.audio_fill(data),
        |err| warn!("audio stream error: {err}"),
        None,
    )
}

impl Player {
    /// Device callback body: deliver exactly `out.len()` samples, mixing
    /// with attenuation, then re-anchor the audio clock at what the device
    /// is about to play.
    pub(crate) fn audio_fill(&self, out: &mut [i16]) {
        let callback_time = clock::now();

        let mut guard = self.audio.lock();
        let Some(render) = guard.as_mut() else {
            out.fill(0);
            return;
        };

        let volume = self.volume();
        let muted = self.is_muted();

        let mut di = 0usize;
        while di < out.len() {
            if render.buf_index >= render.buf.len() {
                if self.audio_decode_frame(render).is_none() {
                    // Starved or paused: hand the device a small aligned
                    // chunk of silence and keep the clock math consistent.
                    let frame = render.tgt.frame_size;
                    let bytes = ((AUDIO_MIN_BUFFER_SIZE / frame) * frame).max(frame);
                    render.buf.clear();
                    render.buf.resize(bytes, 0);
                    render.buf_index = 0;
                }
            }
            let avail = render.buf.len() - render.buf_index;
            let want = (out.len() - di) * 2;
            let n = avail.min(want);
            let src = &render.buf[render.buf_index..render.buf_index + n];
            for (o, pair) in out[di..di + n / 2].iter_mut().zip(src.chunks_exact(2)) {
                let s = i16::from_ne_bytes([pair[0], pair[1]]);
                *o = if muted {
                    0
                } else if volume >= MAX_VOLUME {
                    s
                } else {
                    ((i32::from(s) * volume) / MAX_VOLUME) as i16
                };
            }
            di += n / 2;
            render.buf_index += n;
        }

        if !render.clock.is_nan() {
            let write_buf = render.buf.len() - render.buf_index;
            let latency =
                (2 * render.hw_buf_size + write_buf) as f64 / render.tgt.bytes_per_sec as f64;
            self.audclk
                .set_at(render.clock - latency, render.clock_serial, callback_time);
            sync_clock_to_slave(&self.extclk, &self.audclk);
        }
    }

    /// Pull one matching-serial frame from the sample queue, resample it
    /// into the staging buffer and advance the frame clock. None = emit
    /// silence this round.
    fn audio_decode_frame(&self, render: &mut AudioRender) -> Option<()> {
        if self.paused() {
            return None;
        }
        // Never stall the device thread: bounded wait, then silence.
        let max_wait = Duration::from_secs_f64(
            render.hw_buf_size as f64 / render.tgt.bytes_per_sec as f64 / 2.0,
        );
        loop {
            let fresh = self
                .sampq
                .peek_readable_for(max_wait, |af| af.serial == self.audioq.serial())?;
            if fresh {
                break;
            }
            self.sampq.next();
        }
        let done = self
            .sampq
            .peek_readable_with(|af| self.render_audio_frame(render, af))?;
        self.sampq.next();
        done
    }

    fn render_audio_frame(&self, render: &mut AudioRender, af: &AudioSample) -> Option<()> {
        let frame = &af.frame;
        let nb_samples = frame.samples();
        let wanted = self.synchronize_audio(render, nb_samples);

        let layout = if !frame.channel_layout().is_empty()
            && frame.channel_layout().channels() == i32::from(frame.channels())
        {
            frame.channel_layout()
        } else {
            ChannelLayout::default(i32::from(frame.channels()))
        };

        let rebuild = frame.format() != render.src_format
            || layout != render.src_layout
            || frame.rate() != render.src_rate
            || (wanted != nb_samples && render.resampler.is_none());
        if rebuild {
            render.resampler = None;
            let tgt_layout = ChannelLayout::default(i32::from(render.tgt.channels));
            let tgt_format =
                ffmpeg::format::Sample::I16(ffmpeg::format::sample::Type::Packed);
            match ffmpeg::software::resampling::Context::get(
                frame.format(),
                layout,
                frame.rate(),
                tgt_format,
                tgt_layout,
                render.tgt.freq,
            ) {
                Ok(ctx) => render.resampler = Some(Resampler(ctx)),
                Err(e) => {
                    warn!(
                        "cannot build resampler for {:?} {} Hz: {e}",
                        frame.format(),
                        frame.rate()
                    );
                    return None;
                }
            }
            render.src_format = frame.format();
            render.src_layout = layout;
            render.src_rate = frame.rate();
        }

        if let Some(Resampler(swr)) = render.resampler.as_mut() {
            if wanted != nb_samples {
                // Fractional rate adjustment: spread the sample delta over
                // this frame's worth of output.
                let delta = ((wanted as i64 - nb_samples as i64) * i64::from(render.tgt.freq))
                    / i64::from(frame.rate());
                let distance =
                    (wanted as i64 * i64::from(render.tgt.freq)) / i64::from(frame.rate());
                let ret = unsafe {
                    ffmpeg::ffi::swr_set_compensation(
                        swr.as_mut_ptr(),
                        delta as std::os::raw::c_int,
                        distance as std::os::raw::c_int,
                    )
                };
                if ret < 0 {
                    warn!("resampler compensation rejected (delta {delta})");
                    return None;
                }
            }
            let mut converted = ffmpeg::frame::Audio::empty();
            if let Err(e) = swr.run(frame, &mut converted) {
                warn!("resample failed: {e}");
                return None;
            }
            let bytes = converted.samples() * render.tgt.frame_size;
            render.buf.clear();
            render.buf.extend_from_slice(&converted.data(0)[..bytes]);
        } else {
            // Source already matches the device format.
            let bytes = nb_samples * render.tgt.frame_size;
            render.buf.clear();
            render.buf.extend_from_slice(&frame.data(0)[..bytes]);
        }
        render.buf_index = 0;

        render.clock = if af.pts.is_nan() {
            f64::NAN
        } else {
            af.pts + nb_samples as f64 / f64::from(frame.rate())
        };
        render.clock_serial = af.serial;
        Some(())
    }

    /// Sample count this frame should occupy to pull the audio clock
    /// toward the master. Identity when audio is the master.
    fn synchronize_audio(&self, render: &mut AudioRender, nb_samples: usize) -> usize {
        if self.master_sync_type() == SyncMaster::Audio {
            return nb_samples;
        }
        let diff = self.audclk.get() - self.master_clock();
        render.filter.wanted_samples(nb_samples, diff, render.src_rate)
    }
}
