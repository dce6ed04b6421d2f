// crates/kino-media/src/lib.rs
//
// The playback engine: demuxer thread, decoder threads, audio device and
// callback, video refresh timing, and the Player orchestrator that owns the
// queues and clocks. kino-ui drives this through Player and nothing else.

pub mod audio;
pub mod decoder;
pub mod demux;
pub mod frames;
pub mod packet;
pub mod player;
pub mod video;

pub use frames::{AudioSample, SubPicture, VideoPicture};
pub use player::{Player, PlayerEvent, PlayerOptions};
