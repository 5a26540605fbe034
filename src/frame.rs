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

//! The assembled-frame record and the downstream sink contract.

use serde::{Deserialize, Serialize};

use crate::packet::{ColorSpace, FrameType, PacketInfo, VideoCodec, VideoRotation};
use crate::seq::forward_diff;

/// A complete encoded frame reassembled from one or more packets.
///
/// The payload is a fresh contiguous copy of the packet payloads in sequence
/// order; metadata is aggregated over the packets or forwarded from the
/// first/last packet of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledFrame {
    /// Sequence number of the first packet.
    pub first_seq_num: u16,
    /// Sequence number of the last packet.
    pub last_seq_num: u16,
    /// RTP timestamp shared by all packets of the frame.
    pub timestamp: u32,
    /// Key or delta, after codec-specific classification.
    pub frame_type: FrameType,
    pub codec: VideoCodec,
    /// Frame width, zero when not signalled.
    pub width: u32,
    /// Frame height, zero when not signalled.
    pub height: u32,
    /// RTP marker bit of the last packet.
    pub marker_bit: bool,
    pub payload_type: u8,
    /// Maximum NACK count over the frame's packets, -1 if never NACKed.
    pub times_nacked: i32,
    /// Earliest packet receive time in the frame.
    pub min_receive_time_ms: i64,
    /// Latest packet receive time in the frame.
    pub max_receive_time_ms: i64,
    /// NTP capture time of the first packet, -1 when unknown.
    pub ntp_time_ms: i64,
    pub rotation: VideoRotation,
    pub color_space: Option<ColorSpace>,
    /// Per-packet receive records in sequence order.
    pub packet_infos: Vec<PacketInfo>,
    /// Concatenated encoded payload.
    pub data: Vec<u8>,
}

impl AssembledFrame {
    /// Total payload size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_keyframe(&self) -> bool {
        self.frame_type == FrameType::KeyFrame
    }

    /// Number of packets the frame spans.
    pub fn num_packets(&self) -> usize {
        forward_diff(self.first_seq_num, self.last_seq_num) as usize + 1
    }
}

/// Downstream consumer of assembled frames.
///
/// Invoked on the thread that called `insert_packet` or `padding_received`,
/// after the buffer lock has been released, in the order frames were
/// assembled during that call.
pub trait FrameSink: Send + Sync {
    fn on_assembled_frame(&self, frame: AssembledFrame);
}
