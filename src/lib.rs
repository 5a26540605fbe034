/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! # Video Packet Buffer
//!
//! A packet reassembly buffer for a real-time video receiver. Media packets
//! arriving out of order over a lossy transport are stored in a bounded
//! circular slot table keyed by sequence number; whenever a contiguous
//! same-timestamp run of packets ends in a frame-end marker, the buffer
//! assembles the encoded frame and hands it to a downstream sink.
//!
//! Keyframe classification is codec aware: generic codecs trust the
//! depacketizer's markers, while H.264 frames are classified from the NAL
//! units actually seen (SPS/PPS/IDR). The buffer also maintains a
//! missing-packet view for retransmission prompting and counts distinct
//! frames by RTP timestamp.

pub mod buffer;
pub mod clock;
pub mod error;
pub mod frame;
pub mod packet;
pub mod seq;

pub use buffer::{PacketBuffer, PacketBufferConfig};
pub use clock::{Clock, SimulatedClock, SystemClock};
pub use error::{PacketBufferError, Result};
pub use frame::{AssembledFrame, FrameSink};
pub use packet::{
    CodecHeader, ColorSpace, FrameType, H264PacketHeader, NaluType, PacketInfo, VideoCodec,
    VideoPacket, VideoRotation, MAX_NALUS_PER_PACKET,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct NullSink;

    impl FrameSink for NullSink {
        fn on_assembled_frame(&self, _frame: AssembledFrame) {}
    }

    #[test]
    fn basic_functionality() {
        let clock = Arc::new(SimulatedClock::new(0));
        let buffer =
            PacketBuffer::new(clock, PacketBufferConfig::default(), Box::new(NullSink)).unwrap();

        assert_eq!(buffer.unique_frames_seen(), 0);
        assert!(buffer.last_received_packet_ms().is_none());
        assert!(buffer.last_received_keyframe_packet_ms().is_none());
    }
}
