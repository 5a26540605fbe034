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

//! Packet-level data model consumed by the reassembly buffer.

use serde::{Deserialize, Serialize};

/// Upper bound on the NAL units a single packet may report. A packet at or
/// above this count is treated as malformed and aborts frame assembly.
pub const MAX_NALUS_PER_PACKET: usize = 10;

/// Dependency class of an encoded video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    /// A KeyFrame (or I-frame) can be decoded independently of any other frame.
    KeyFrame,
    /// A DeltaFrame (or P-frame) can only be decoded if the preceding frame has been decoded.
    DeltaFrame,
}

/// H.264 NAL unit classes relevant to keyframe detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NaluType {
    /// Coded slice of a non-IDR picture.
    Slice,
    /// Instant decoder refresh.
    Idr,
    /// Supplemental enhancement information.
    Sei,
    /// Sequence parameter set.
    Sps,
    /// Picture parameter set.
    Pps,
    /// Access unit delimiter.
    Aud,
}

/// Rotation to apply to the decoded frame before display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoRotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

/// Color space signalling forwarded verbatim to the assembled frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorSpace {
    pub primaries: u8,
    pub transfer: u8,
    pub matrix: u8,
    pub range: u8,
}

/// Receive-path metadata for one packet, collected into the assembled frame
/// in sequence order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketInfo {
    /// Synchronization source the packet arrived on.
    pub ssrc: u32,
    /// RTP timestamp carried by the packet.
    pub rtp_timestamp: u32,
    /// Local receive time in milliseconds.
    pub receive_time_ms: i64,
}

/// Codec identifier, derived from the codec-specific header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    Generic,
    H264,
}

/// Parsed H.264 payload header: the NAL units this packet carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct H264PacketHeader {
    pub nalus: Vec<NaluType>,
}

/// Codec-specific part of the packet header. Codecs with reliable
/// frame-begin markers use `Generic`; H.264 carries its NAL list so the
/// buffer can classify keyframes itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecHeader {
    Generic,
    H264(H264PacketHeader),
}

/// One depacketized media packet handed to the buffer. The buffer owns the
/// payload from the moment `insert_packet` is called.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoPacket {
    /// RTP sequence number, modular 16-bit.
    pub seq_num: u16,
    /// RTP timestamp; packets of one frame share it.
    pub timestamp: u32,
    /// Frame-type hint from the depacketizer. For H.264 the buffer rewrites
    /// this on the first packet of each assembled frame.
    pub frame_type: FrameType,
    /// First-packet-of-frame marker. Unreliable for H.264.
    pub is_first_packet_in_frame: bool,
    /// Last-packet-of-frame marker.
    pub is_last_packet_in_frame: bool,
    /// RTP marker bit.
    pub marker_bit: bool,
    /// RTP payload type.
    pub payload_type: u8,
    /// Encoded payload bytes, owned by the buffer once inserted.
    pub payload: Vec<u8>,
    /// Codec-specific header.
    pub codec_header: CodecHeader,
    /// Frame width when carried (SPS/IDR packets), zero otherwise.
    pub width: u32,
    /// Frame height when carried, zero otherwise.
    pub height: u32,
    /// Temporal layer id; `None` when no temporal scalability is signalled.
    pub temporal_id: Option<u8>,
    /// How many times this packet was NACKed, -1 if never.
    pub times_nacked: i32,
    /// NTP capture time in milliseconds, -1 when unknown.
    pub ntp_time_ms: i64,
    /// Display rotation.
    pub rotation: VideoRotation,
    /// Color space, when signalled.
    pub color_space: Option<ColorSpace>,
    /// Receive-path record forwarded into the assembled frame.
    pub packet_info: PacketInfo,
}

impl Default for VideoPacket {
    fn default() -> Self {
        Self {
            seq_num: 0,
            timestamp: 0,
            frame_type: FrameType::DeltaFrame,
            is_first_packet_in_frame: false,
            is_last_packet_in_frame: false,
            marker_bit: false,
            payload_type: 0,
            payload: Vec::new(),
            codec_header: CodecHeader::Generic,
            width: 0,
            height: 0,
            temporal_id: None,
            times_nacked: -1,
            ntp_time_ms: -1,
            rotation: VideoRotation::Deg0,
            color_space: None,
            packet_info: PacketInfo::default(),
        }
    }
}

impl VideoPacket {
    /// The codec this packet belongs to.
    pub fn codec(&self) -> VideoCodec {
        match self.codec_header {
            CodecHeader::Generic => VideoCodec::Generic,
            CodecHeader::H264(_) => VideoCodec::H264,
        }
    }

    /// Whether the depacketizer flagged this packet as part of a keyframe.
    pub fn is_keyframe(&self) -> bool {
        self.frame_type == FrameType::KeyFrame
    }

    /// Size of the payload in bytes.
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}
