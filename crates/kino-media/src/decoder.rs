// crates/kino-media/src/decoder.rs
//
// The three decoder threads. Each pairs a DecoderPump (serial bookkeeping,
// pending-packet redelivery) with its codec: receive frames while the
// codec's epoch is current, fix up timestamps, convert, and push into the
// frame queue; then feed the next packet, flushing codec state whenever a
// new epoch begins. Codec hiccups are absorbed as "need more input" so the
// pipeline never stops on a corrupt packet.

use std::ops::DerefMut;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};
use ffmpeg::{Rational, Rescale};
use libc::EAGAIN;
use tracing::{debug, trace, warn};

use kino_core::decode::{DecoderPump, PumpFetch};
use kino_core::sync::{SyncMaster, AV_NOSYNC_THRESHOLD};

use crate::frames::{AudioSample, SubPicture, VideoPicture};
use crate::packet::DemuxPacket;
use crate::player::Player;

fn q2d(r: Rational) -> f64 {
    if r.denominator() == 0 {
        0.0
    } else {
        f64::from(r.numerator()) / f64::from(r.denominator())
    }
}

/// Feed one packet (or EOS) into a codec; packets the codec refuses with
/// EAGAIN are parked in the pump for redelivery after the next receive.
fn feed<D>(dec: &mut D, pump: &mut DecoderPump<DemuxPacket>, pkt: Option<DemuxPacket>)
where
    D: DerefMut<Target = ffmpeg::decoder::Opened>,
{
    match pkt {
        Some(p) => match dec.send_packet(&p.0) {
            Ok(()) => {}
            Err(ffmpeg::Error::Other { errno: EAGAIN }) => pump.set_pending(p),
            Err(e) => debug!("send_packet: {e}"),
        },
        None => {
            let _ = dec.send_eof();
        }
    }
}

// ── Audio ─────────────────────────────────────────────────────────────────

pub(crate) fn audio_thread(
    player: Arc<Player>,
    mut dec: ffmpeg::decoder::Audio,
    pkt_tb: Rational,
    start_pts: Option<i64>,
) {
    let mut pump: DecoderPump<DemuxPacket> = DecoderPump::new();
    // Fill-in pts for frames the container left untimed, advanced by each
    // decoded frame's sample count (carried with its own time base).
    let mut next_pts: Option<i64> = None;
    let mut next_pts_tb = pkt_tb;

    'main: loop {
        if pump.can_receive(&player.audioq) {
            loop {
                let mut frame = ffmpeg::frame::Audio::empty();
                match dec.receive_frame(&mut frame) {
                    Ok(()) => {
                        let rate = frame.rate();
                        let tb = Rational::new(1, rate as i32);
                        let pts_units = match frame.pts() {
                            Some(p) => Some(p.rescale(pkt_tb, tb)),
                            None => next_pts.map(|p| p.rescale(next_pts_tb, tb)),
                        };
                        if let Some(p) = pts_units {
                            next_pts = Some(p + frame.samples() as i64);
                            next_pts_tb = tb;
                        }
                        let pts = pts_units
                            .map(|p| p as f64 * q2d(tb))
                            .unwrap_or(f64::NAN);
                        let duration = frame.samples() as f64 / f64::from(rate);
                        let pos = unsafe { (*frame.as_ptr()).pkt_pos };
                        let sample = AudioSample {
                            frame,
                            pts,
                            duration,
                            pos,
                            serial: pump.serial(),
                        };
                        if !player.sampq.push(sample) {
                            break 'main;
                        }
                    }
                    Err(ffmpeg::Error::Eof) => {
                        pump.mark_finished();
                        player
                            .audio_finished
                            .store(pump.finished_serial(), Ordering::SeqCst);
                        dec.flush();
                        break;
                    }
                    Err(_) => break, // needs another packet
                }
            }
        }
        match pump.next_packet(&player.audioq, &player.continue_read) {
            PumpFetch::Aborted => break 'main,
            PumpFetch::Fresh { pkt } => {
                dec.flush();
                next_pts = start_pts;
                next_pts_tb = pkt_tb;
                feed(&mut dec, &mut pump, pkt);
            }
            PumpFetch::Packet { pkt } => feed(&mut dec, &mut pump, pkt),
        }
    }
    trace!("audio decoder thread exiting");
}

// ── Video ─────────────────────────────────────────────────────────────────

struct RgbaScaler {
    ctx:    SwsContext,
    width:  u32,
    height: u32,
    format: ffmpeg::format::Pixel,
}

impl RgbaScaler {
    fn for_frame(frame: &ffmpeg::frame::Video) -> Result<Self, ffmpeg::Error> {
        let ctx = SwsContext::get(
            frame.format(),
            frame.width(),
            frame.height(),
            ffmpeg::format::Pixel::RGBA,
            frame.width(),
            frame.height(),
            Flags::BILINEAR,
        )?;
        Ok(Self {
            ctx,
            width:  frame.width(),
            height: frame.height(),
            format: frame.format(),
        })
    }

    fn matches(&self, frame: &ffmpeg::frame::Video) -> bool {
        self.width == frame.width() && self.height == frame.height() && self.format == frame.format()
    }

    /// Convert to RGBA and copy out only visible pixels, not stride padding.
    fn run(&mut self, frame: &ffmpeg::frame::Video) -> Result<Vec<u8>, ffmpeg::Error> {
        let mut out = ffmpeg::frame::Video::empty();
        self.ctx.run(frame, &mut out)?;
        let stride = out.stride(0);
        let raw = out.data(0);
        let row_bytes = self.width as usize * 4;
        let data: Vec<u8> = (0..self.height as usize)
            .flat_map(|row| &raw[row * stride..row * stride + row_bytes])
            .copied()
            .collect();
        Ok(data)
    }
}

pub(crate) fn video_thread(
    player: Arc<Player>,
    mut dec: ffmpeg::decoder::Video,
    pkt_tb: Rational,
    frame_rate: Rational,
) {
    let mut pump: DecoderPump<DemuxPacket> = DecoderPump::new();
    let mut scaler: Option<RgbaScaler> = None;
    let nominal_duration = if frame_rate.numerator() != 0 {
        f64::from(frame_rate.denominator()) / f64::from(frame_rate.numerator())
    } else {
        0.0
    };

    'main: loop {
        if pump.can_receive(&player.videoq) {
            loop {
                let mut frame = ffmpeg::frame::Video::empty();
                match dec.receive_frame(&mut frame) {
                    Ok(()) => {
                        let pts_units = match player.opts.reorder_pts {
                            // Decoder-reordered pts as-is.
                            1 => frame.pts(),
                            // Trust the packet dts instead.
                            0 => {
                                let dts = unsafe { (*frame.as_ptr()).pkt_dts };
                                (dts != ffmpeg::ffi::AV_NOPTS_VALUE).then_some(dts)
                            }
                            // Default: the decoder's best-effort estimate.
                            _ => frame.timestamp(),
                        };
                        let pts = pts_units
                            .map(|p| p as f64 * q2d(pkt_tb))
                            .unwrap_or(f64::NAN);
                        let pos = unsafe { (*frame.as_ptr()).pkt_pos };

                        if should_drop_early(&player, &pump, pts) {
                            player.frame_drops_early.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }

                        if !scaler.as_ref().is_some_and(|s| s.matches(&frame)) {
                            match RgbaScaler::for_frame(&frame) {
                                Ok(s) => scaler = Some(s),
                                Err(e) => {
                                    warn!("cannot build RGBA scaler: {e}");
                                    continue;
                                }
                            }
                        }
                        let Some(sc) = scaler.as_mut() else { continue };
                        let data = match sc.run(&frame) {
                            Ok(d) => d,
                            Err(e) => {
                                warn!("scale failed: {e}");
                                continue;
                            }
                        };
                        let picture = VideoPicture {
                            data,
                            width: frame.width(),
                            height: frame.height(),
                            pts,
                            duration: nominal_duration,
                            pos,
                            serial: pump.serial(),
                        };
                        if !player.pictq.push(picture) {
                            break 'main;
                        }
                    }
                    Err(ffmpeg::Error::Eof) => {
                        pump.mark_finished();
                        player
                            .video_finished
                            .store(pump.finished_serial(), Ordering::SeqCst);
                        dec.flush();
                        break;
                    }
                    Err(_) => break,
                }
            }
        }
        match pump.next_packet(&player.videoq, &player.continue_read) {
            PumpFetch::Aborted => break 'main,
            PumpFetch::Fresh { pkt } => {
                dec.flush();
                feed(&mut dec, &mut pump, pkt);
            }
            PumpFetch::Packet { pkt } => feed(&mut dec, &mut pump, pkt),
        }
    }
    trace!("video decoder thread exiting");
}

/// Drop a frame before scaling when it is already behind the master clock
/// and more input is waiting. Disabled when video is the master.
fn should_drop_early(player: &Player, pump: &DecoderPump<DemuxPacket>, pts: f64) -> bool {
    let policy = player.opts.framedrop > 0
        || (player.opts.framedrop != 0 && player.master_sync_type() != SyncMaster::Video);
    if !policy || pts.is_nan() {
        return false;
    }
    let diff = pts - player.master_clock();
    !diff.is_nan()
        && diff.abs() < AV_NOSYNC_THRESHOLD
        && diff < 0.0
        && pump.serial() == player.vidclk.serial()
        && player.videoq.nb_packets() > 0
}

// ── Subtitles ─────────────────────────────────────────────────────────────

pub(crate) fn subtitle_thread(player: Arc<Player>, mut dec: ffmpeg::decoder::Subtitle) {
    let mut pump: DecoderPump<DemuxPacket> = DecoderPump::new();

    'main: loop {
        let fetched = match pump.next_packet(&player.subtitleq, &player.continue_read) {
            PumpFetch::Aborted => break,
            PumpFetch::Fresh { pkt } => {
                dec.flush();
                pkt
            }
            PumpFetch::Packet { pkt } => pkt,
        };
        // The subtitle path decodes synchronously; end of stream drains the
        // codec with an empty packet, redelivered until it yields nothing
        // (the codec may hold several buffered rects across flush calls).
        let (pkt, is_eos) = match fetched {
            Some(p) => (p.0, false),
            None => (ffmpeg::Packet::empty(), true),
        };

        loop {
            let mut sub = ffmpeg::codec::subtitle::Subtitle::new();
            match dec.decode(&pkt, &mut sub) {
                Ok(true) => {
                    let pts = sub
                        .pts()
                        .map(|p| p as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE))
                        .unwrap_or(f64::NAN);
                    let lines: Vec<String> = sub
                        .rects()
                        .filter_map(|rect| match rect {
                            ffmpeg::codec::subtitle::Rect::Text(t) => Some(t.get().to_owned()),
                            ffmpeg::codec::subtitle::Rect::Ass(a) => {
                                Some(ass_dialogue_text(a.get()))
                            }
                            // Bitmap subtitles need a rasterizer we don't carry.
                            _ => None,
                        })
                        .collect();
                    let picture = SubPicture {
                        pts,
                        start: f64::from(sub.start()) / 1000.0,
                        end: f64::from(sub.end()) / 1000.0,
                        serial: pump.serial(),
                        lines,
                    };
                    if !player.subpq.push(picture) {
                        break 'main;
                    }
                    if !is_eos {
                        break;
                    }
                    // Drain packet: go around again with the same packet.
                }
                Ok(false) => {
                    if is_eos {
                        pump.mark_finished();
                    }
                    break;
                }
                Err(e) => {
                    debug!("subtitle decode: {e}");
                    break;
                }
            }
        }
    }
    trace!("subtitle decoder thread exiting");
}

/// Pull the dialogue text out of an ASS event line; the leading fields are
/// layer/style/margins metadata.
fn ass_dialogue_text(event: &str) -> String {
    event
        .splitn(9, ',')
        .nth(8)
        .unwrap_or(event)
        .replace("\\N", " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ass_event_reduces_to_dialogue_text() {
        let ev = "0,0,Default,,0,0,0,,Hello there\\Nfriend";
        assert_eq!(ass_dialogue_text(ev), "Hello there friend");
    }

    #[test]
    fn malformed_ass_event_passes_through() {
        assert_eq!(ass_dialogue_text("just text"), "just text");
    }
}
