// crates/kino-core/src/lib.rs
//
// Playback primitives shared by the engine: serial-tagged packet queues,
// keep-last frame rings, drift clocks, the decoder packet pump and the
// pure A/V sync math. No FFmpeg, no device code — everything here is
// exercised by plain unit tests.

pub mod clock;
pub mod decode;
pub mod frame_queue;
pub mod notify;
pub mod packet_queue;
pub mod sync;

pub use clock::{now, sync_clock_to_slave, Clock};
pub use decode::{DecoderPump, PumpFetch};
pub use frame_queue::FrameQueue;
pub use notify::Notify;
pub use packet_queue::{EpochRef, PacketGet, PacketLike, PacketQueue};
pub use sync::SyncMaster;
