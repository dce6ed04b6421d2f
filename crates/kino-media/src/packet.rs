// crates/kino-media/src/packet.rs
//
// The queue payload: an owned FFmpeg packet with the accounting the queue
// needs, plus the attached-picture copy used to show album art for audio
// files.

use ffmpeg_the_third as ffmpeg;

use kino_core::packet_queue::PacketLike;

/// An owned compressed packet as it travels demuxer → packet queue →
/// decoder thread.
pub struct DemuxPacket(pub ffmpeg::Packet);

impl PacketLike for DemuxPacket {
    fn byte_size(&self) -> usize {
        self.0.size()
    }

    fn duration_units(&self) -> i64 {
        self.0.duration()
    }
}

/// Copy a stream's attached picture (e.g. embedded album art), if any.
/// The returned packet owns its own reference to the payload.
pub fn attached_picture(stream: &ffmpeg::format::stream::Stream) -> Option<DemuxPacket> {
    if !is_attached_pic(stream) {
        return None;
    }
    let mut pkt = ffmpeg::Packet::empty();
    // attached_pic is not surfaced by the safe wrapper; take a reference
    // straight off the AVStream.
    let ret =
        unsafe { ffmpeg::ffi::av_packet_ref(pkt.as_mut_ptr(), &(*stream.as_ptr()).attached_pic) };
    if ret < 0 {
        return None;
    }
    Some(DemuxPacket(pkt))
}

/// Whether this stream is a still picture delivered once (never part of the
/// normal packet flow).
pub fn is_attached_pic(stream: &ffmpeg::format::stream::Stream) -> bool {
    stream
        .disposition()
        .contains(ffmpeg::format::stream::Disposition::ATTACHED_PIC)
}
