// crates/kino-ui/src/opts.rs
//
// CLI surface. Everything that shapes the engine is converted into a
// PlayerOptions; the handful of display-only flags stay here.

use clap::{Parser, ValueEnum};

use kino_core::sync::SyncMaster;
use kino_media::PlayerOptions;

#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum)]
pub enum SyncArg {
    Audio,
    Video,
    Ext,
}

#[derive(Parser, Debug)]
#[command(name = "kino", version, about = "Minimal media player")]
pub struct Cli {
    /// File path or URL to play.
    pub input: String,

    /// Start playing at this many seconds into the stream.
    #[arg(long = "ss", value_name = "SECONDS")]
    pub start_time: Option<f64>,

    /// Play only this many seconds.
    #[arg(short = 't', value_name = "SECONDS")]
    pub play_duration: Option<f64>,

    /// Seek by bytes: 0 never, 1 always, -1 decide from the container.
    #[arg(long = "bytes", default_value_t = -1, allow_hyphen_values = true)]
    pub seek_by_bytes: i32,

    /// Left/right arrow seek step in seconds.
    #[arg(long, default_value_t = 10.0, value_name = "SECONDS")]
    pub seek_interval: f64,

    /// Master clock for A/V synchronization.
    #[arg(long, value_enum, default_value = "audio")]
    pub sync: SyncArg,

    /// Allow non-spec-compliant codec speedups.
    #[arg(long)]
    pub fast: bool,

    /// Generate missing pts in the demuxer.
    #[arg(long)]
    pub genpts: bool,

    /// Video pts source: 1 decoder order, 0 packet dts, -1 best effort.
    #[arg(long = "drp", default_value_t = -1, allow_hyphen_values = true)]
    pub reorder_pts: i32,

    /// Play the input this many times (0 = forever).
    #[arg(long = "loop", default_value_t = 1, value_name = "COUNT")]
    pub loop_count: i32,

    /// Always drop late video frames (default: only when video is slaved).
    #[arg(long)]
    pub framedrop: bool,

    /// Never drop late video frames.
    #[arg(long, conflicts_with = "framedrop")]
    pub noframedrop: bool,

    /// Ignore packet-queue size limits (default on for realtime sources).
    #[arg(long)]
    pub infbuf: bool,

    /// Startup volume, 0..100.
    #[arg(long, default_value_t = 100)]
    pub volume: i32,

    /// Exit once playback finishes.
    #[arg(long)]
    pub autoexit: bool,

    /// Disable audio.
    #[arg(long = "an")]
    pub no_audio: bool,

    /// Disable video.
    #[arg(long = "vn")]
    pub no_video: bool,

    /// Disable subtitles.
    #[arg(long = "sn")]
    pub no_subtitles: bool,

    /// Run without a window (audio only).
    #[arg(long)]
    pub nodisp: bool,

    /// Start fullscreen.
    #[arg(long)]
    pub fs: bool,

    /// Window title (defaults to the input name).
    #[arg(long)]
    pub window_title: Option<String>,
}

impl Cli {
    pub fn to_player_options(&self) -> PlayerOptions {
        PlayerOptions {
            input:            self.input.clone(),
            start_time:       self.start_time,
            play_duration:    self.play_duration,
            seek_by_bytes:    self.seek_by_bytes,
            seek_interval:    self.seek_interval,
            sync:             match self.sync {
                SyncArg::Audio => SyncMaster::Audio,
                SyncArg::Video => SyncMaster::Video,
                SyncArg::Ext => SyncMaster::External,
            },
            fast:             self.fast,
            genpts:           self.genpts,
            reorder_pts:      self.reorder_pts,
            loop_count:       self.loop_count,
            framedrop:        if self.framedrop {
                1
            } else if self.noframedrop {
                0
            } else {
                -1
            },
            infinite_buffer:  if self.infbuf { 1 } else { -1 },
            volume:           self.volume.clamp(0, 100),
            autoexit:         self.autoexit,
            audio_disable:    self.no_audio,
            video_disable:    self.no_video,
            subtitle_disable: self.no_subtitles,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_map_to_auto_policies() {
        let cli = Cli::parse_from(["kino", "movie.mkv"]);
        let opts = cli.to_player_options();
        assert_eq!(opts.framedrop, -1);
        assert_eq!(opts.infinite_buffer, -1);
        assert_eq!(opts.seek_by_bytes, -1);
        assert_eq!(opts.loop_count, 1);
        assert_eq!(opts.volume, 100);
        assert_eq!(opts.sync, SyncMaster::Audio);
    }

    #[test]
    fn explicit_flags_override() {
        let cli = Cli::parse_from([
            "kino", "in.mp4", "--ss", "12.5", "-t", "3", "--sync", "video", "--framedrop",
            "--loop", "0", "--volume", "250",
        ]);
        let opts = cli.to_player_options();
        assert_eq!(opts.start_time, Some(12.5));
        assert_eq!(opts.play_duration, Some(3.0));
        assert_eq!(opts.sync, SyncMaster::Video);
        assert_eq!(opts.framedrop, 1);
        assert_eq!(opts.loop_count, 0);
        assert_eq!(opts.volume, 100); // clamped
    }
}
