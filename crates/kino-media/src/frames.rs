// crates/kino-media/src/frames.rs
//
// What flows through the frame queues. Video is converted to RGBA on the
// decode thread (scaler output is destrided there), so the refresh loop and
// the UI only ever see plain bytes; audio keeps the decoded FFmpeg frame
// because the resampler consumes it as-is in the callback.

use ffmpeg_the_third as ffmpeg;

/// A decoded, RGBA-converted video frame ready for texture upload.
pub struct VideoPicture {
    pub data:     Vec<u8>,
    pub width:    u32,
    pub height:   u32,
    /// Presentation time in seconds; NaN when the container had none.
    pub pts:      f64,
    /// Nominal duration from the stream frame rate (0 when unknown).
    pub duration: f64,
    /// Byte position of the originating packet (byte-seek anchor).
    pub pos:      i64,
    pub serial:   u64,
}

/// A decoded audio frame awaiting resampling in the device callback.
pub struct AudioSample {
    pub frame:    ffmpeg::frame::Audio,
    pub pts:      f64,
    pub duration: f64,
    pub pos:      i64,
    pub serial:   u64,
}

/// A decoded subtitle: text/ASS lines with a display window relative to
/// `pts`. Bitmap regions are dropped (rasterization is out of scope).
pub struct SubPicture {
    pub pts:    f64,
    /// Display window start offset, seconds after `pts`.
    pub start:  f64,
    /// Display window end offset, seconds after `pts`.
    pub end:    f64,
    pub serial: u64,
    pub lines:  Vec<String>,
}

impl SubPicture {
    /// True while `clock` (video clock seconds) is inside the display window.
    pub fn visible_at(&self, clock: f64) -> bool {
        let base = if self.pts.is_nan() { 0.0 } else { self.pts };
        clock >= base + self.start && clock < base + self.end
    }

    /// Moment after which this subtitle can be purged.
    pub fn end_time(&self) -> f64 {
        let base = if self.pts.is_nan() { 0.0 } else { self.pts };
        base + self.end
    }

    pub fn start_time(&self) -> f64 {
        let base = if self.pts.is_nan() { 0.0 } else { self.pts };
        base + self.start
    }
}
