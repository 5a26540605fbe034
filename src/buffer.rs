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

//! The packet reassembly buffer: accepts media packets arriving out of
//! order, stores them in a bounded circular slot table, and emits complete
//! encoded frames to the frame sink.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::Clock;
use crate::error::{PacketBufferError, Result};
use crate::frame::{AssembledFrame, FrameSink};
use crate::packet::{
    CodecHeader, FrameType, NaluType, PacketInfo, VideoCodec, VideoPacket, MAX_NALUS_PER_PACKET,
};
use crate::seq::{ahead_of, forward_diff, SeqNum};

/// Missing-set entries older than `newest - MAX_MISSING_PACKET_AGE` are
/// dropped when the sequence space jumps forward, bounding the set on large
/// gaps.
const MAX_MISSING_PACKET_AGE: u16 = 1000;

/// Bound on the distinct-timestamp history backing the unique-frame counter.
const MAX_TIMESTAMP_HISTORY: usize = 1000;

/// Configuration for the packet buffer
#[derive(Debug, Clone)]
pub struct PacketBufferConfig {
    /// Initial slot-table capacity. Must be a power of two.
    pub start_size: usize,
    /// Capacity ceiling for expansion. Must be a power of two and at least
    /// `start_size`.
    pub max_size: usize,
    /// Require SPS and PPS alongside an IDR before classifying an H.264
    /// frame as a keyframe. Captured once at construction.
    pub sps_pps_idr_is_h264_keyframe: bool,
}

impl Default for PacketBufferConfig {
    fn default() -> Self {
        Self {
            start_size: 512,
            max_size: 2048,
            sps_pps_idr_is_h264_keyframe: false,
        }
    }
}

/// A used slot: one stored packet plus its continuity bit.
#[derive(Debug)]
struct StoredPacket {
    /// All preceding packets of the same frame chain have been inserted.
    continuous: bool,
    packet: VideoPacket,
}

/// Packet reassembly buffer for a real-time video receiver.
///
/// A single mutex guards all state; insertion, clearing, and queries may be
/// invoked from any thread. Assembled frames are collected under the lock
/// and handed to the sink after it is released.
pub struct PacketBuffer {
    clock: Arc<dyn Clock>,
    sink: Box<dyn FrameSink>,
    state: Mutex<BufferState>,
}

struct BufferState {
    /// Slot table indexed by `seq_num % capacity`; capacity is always a
    /// power of two.
    slots: Vec<Option<StoredPacket>>,
    max_size: usize,
    /// Oldest sequence number of interest; rewound by older arrivals until
    /// `clear_to` turns it into a stale-drop threshold.
    first_seq_num: u16,
    first_packet_received: bool,
    is_cleared_to_first_seq_num: bool,
    last_received_packet_ms: Option<i64>,
    last_received_keyframe_packet_ms: Option<i64>,
    newest_inserted_seq_num: Option<u16>,
    /// Known gaps between the oldest tracked and newest inserted sequence
    /// number, exposed to the retransmission controller.
    missing_packets: BTreeSet<SeqNum>,
    unique_frames_seen: u64,
    /// Recently seen distinct RTP timestamps, for the unique-frame counter.
    timestamps_history_set: HashSet<u32>,
    /// The same timestamps in insertion order, for eviction.
    timestamps_history_queue: VecDeque<u32>,
    sps_pps_idr_is_h264_keyframe: bool,
}

impl PacketBuffer {
    /// Create a new packet buffer delivering assembled frames to `sink`.
    pub fn new(
        clock: Arc<dyn Clock>,
        config: PacketBufferConfig,
        sink: Box<dyn FrameSink>,
    ) -> Result<Self> {
        if !config.start_size.is_power_of_two() {
            return Err(PacketBufferError::InvalidConfig(format!(
                "start_size {} is not a power of two",
                config.start_size
            )));
        }
        if !config.max_size.is_power_of_two() {
            return Err(PacketBufferError::InvalidConfig(format!(
                "max_size {} is not a power of two",
                config.max_size
            )));
        }
        if config.start_size > config.max_size {
            return Err(PacketBufferError::InvalidConfig(format!(
                "start_size {} exceeds max_size {}",
                config.start_size, config.max_size
            )));
        }

        Ok(Self {
            clock,
            sink,
            state: Mutex::new(BufferState {
                slots: (0..config.start_size).map(|_| None).collect(),
                max_size: config.max_size,
                first_seq_num: 0,
                first_packet_received: false,
                is_cleared_to_first_seq_num: false,
                last_received_packet_ms: None,
                last_received_keyframe_packet_ms: None,
                newest_inserted_seq_num: None,
                missing_packets: BTreeSet::new(),
                unique_frames_seen: 0,
                timestamps_history_set: HashSet::new(),
                timestamps_history_queue: VecDeque::new(),
                sps_pps_idr_is_h264_keyframe: config.sps_pps_idr_is_h264_keyframe,
            }),
        })
    }

    /// Insert one packet. The buffer takes ownership of the payload on every
    /// path. Returns `false` only when the buffer was saturated, could not
    /// grow, and had to be cleared; the caller should then request a fresh
    /// keyframe. Duplicates and stale packets are dropped and return `true`.
    pub fn insert_packet(&self, packet: VideoPacket) -> bool {
        let now_ms = self.clock.time_in_milliseconds();
        let (accepted, frames) = self.lock_state().insert(packet, now_ms);
        for frame in frames {
            self.sink.on_assembled_frame(frame);
        }
        accepted
    }

    /// Release every stored payload and reset all trackers except the
    /// unique-frame history.
    pub fn clear(&self) {
        self.lock_state().clear();
    }

    /// Drop everything at or behind `seq_num`; later arrivals behind that
    /// point are silently discarded.
    pub fn clear_to(&self, seq_num: u16) {
        self.lock_state().clear_to(seq_num);
    }

    /// Note a padding-only packet at `seq_num` (not stored) and retry
    /// assembly from the following sequence number.
    pub fn padding_received(&self, seq_num: u16) {
        let frames = {
            let mut state = self.lock_state();
            state.update_missing_packets(seq_num);
            state.find_frames(seq_num.wrapping_add(1))
        };
        for frame in frames {
            self.sink.on_assembled_frame(frame);
        }
    }

    /// Local receive time of the most recent packet, if any.
    pub fn last_received_packet_ms(&self) -> Option<i64> {
        self.lock_state().last_received_packet_ms
    }

    /// Local receive time of the most recent keyframe packet, if any.
    pub fn last_received_keyframe_packet_ms(&self) -> Option<i64> {
        self.lock_state().last_received_keyframe_packet_ms
    }

    /// Number of distinct frames observed, by RTP timestamp, modulo the
    /// bounded-history eviction policy.
    pub fn unique_frames_seen(&self) -> u64 {
        self.lock_state().unique_frames_seen
    }

    fn lock_state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().expect("packet buffer lock poisoned")
    }
}

impl BufferState {
    fn insert(&mut self, packet: VideoPacket, now_ms: i64) -> (bool, Vec<AssembledFrame>) {
        self.on_timestamp_received(packet.timestamp);

        let seq_num = packet.seq_num;
        let mut index = seq_num as usize % self.slots.len();

        if !self.first_packet_received {
            self.first_seq_num = seq_num;
            self.first_packet_received = true;
        } else if ahead_of(self.first_seq_num, seq_num) {
            // Explicitly cleared past this packet; drop it silently.
            if self.is_cleared_to_first_seq_num {
                log::debug!("Dropping stale packet {seq_num} behind the cleared-to point");
                return (true, Vec::new());
            }
            self.first_seq_num = seq_num;
        }

        let occupied_by_other = match &self.slots[index] {
            Some(entry) if entry.packet.seq_num == seq_num => {
                log::debug!("Dropping duplicate packet {seq_num}");
                return (true, Vec::new());
            }
            Some(_) => true,
            None => false,
        };

        if occupied_by_other {
            // The slot collides with a different live sequence number; the
            // table is effectively full. Double until the slot frees up or
            // the ceiling is hit.
            while self.expand() && self.slots[seq_num as usize % self.slots.len()].is_some() {}
            index = seq_num as usize % self.slots.len();

            if self.slots[index].is_some() {
                log::warn!("Packet buffer saturated; clearing and requesting a keyframe");
                self.clear();
                return (false, Vec::new());
            }
        }

        let is_keyframe = packet.is_keyframe();
        self.slots[index] = Some(StoredPacket {
            continuous: false,
            packet,
        });

        self.update_missing_packets(seq_num);

        self.last_received_packet_ms = Some(now_ms);
        if is_keyframe {
            self.last_received_keyframe_packet_ms = Some(now_ms);
        }

        (true, self.find_frames(seq_num))
    }

    /// Double the slot table, rehashing every stored packet into its new
    /// position. Returns `false` without touching anything when already at
    /// the ceiling. Expansion never evicts.
    fn expand(&mut self) -> bool {
        let current_size = self.slots.len();
        if current_size == self.max_size {
            log::warn!("Packet buffer is already at max size ({current_size}), failed to expand");
            return false;
        }

        let new_size = self.max_size.min(2 * current_size);
        let mut new_slots: Vec<Option<StoredPacket>> = (0..new_size).map(|_| None).collect();
        for entry in self.slots.drain(..).flatten() {
            let index = entry.packet.seq_num as usize % new_size;
            new_slots[index] = Some(entry);
        }
        self.slots = new_slots;
        log::info!("Packet buffer expanded to {new_size} slots");
        true
    }

    /// Whether the packet at `seq_num` extends a continuous frame chain:
    /// either it carries the frame-begin marker, or its predecessor slot
    /// holds `seq_num - 1` of the same frame and is itself continuous.
    fn potential_new_frame(&self, seq_num: u16) -> bool {
        let size = self.slots.len();
        let index = seq_num as usize % size;
        let prev_index = if index > 0 { index - 1 } else { size - 1 };

        let Some(entry) = &self.slots[index] else {
            return false;
        };
        if entry.packet.seq_num != seq_num {
            return false;
        }
        if entry.packet.is_first_packet_in_frame {
            return true;
        }
        let Some(prev_entry) = &self.slots[prev_index] else {
            return false;
        };
        prev_entry.packet.seq_num == seq_num.wrapping_sub(1)
            && prev_entry.packet.timestamp == entry.packet.timestamp
            && prev_entry.continuous
    }

    /// Walk forward from `seq_num`, marking continuity; whenever a
    /// continuous run ends in a frame-end marker, materialize the frame and
    /// free its slots. Returns the frames assembled during this pass.
    fn find_frames(&mut self, mut seq_num: u16) -> Vec<AssembledFrame> {
        let mut found_frames = Vec::new();
        for _ in 0..self.slots.len() {
            if !self.potential_new_frame(seq_num) {
                break;
            }
            let index = seq_num as usize % self.slots.len();
            let frame_end = {
                let Some(entry) = self.slots[index].as_mut() else {
                    break;
                };
                entry.continuous = true;
                entry.packet.is_last_packet_in_frame
            };

            if frame_end && !self.assemble_frame(seq_num, &mut found_frames) {
                return found_frames;
            }
            seq_num = seq_num.wrapping_add(1);
        }
        found_frames
    }

    /// Materialize the frame ending at `seq_num` by walking backward to its
    /// first packet. Returns `false` when the whole pass must be aborted
    /// (malformed NAL list, or a delta frame with a dependency gap).
    fn assemble_frame(&mut self, seq_num: u16, found_frames: &mut Vec<AssembledFrame>) -> bool {
        let size = self.slots.len();
        let end_index = seq_num as usize % size;

        let (frame_timestamp, is_h264, end_receive_time_ms) = match &self.slots[end_index] {
            Some(end) => (
                end.packet.timestamp,
                end.packet.codec() == VideoCodec::H264,
                end.packet.packet_info.receive_time_ms,
            ),
            None => {
                debug_assert!(false, "frame end slot must be used");
                return true;
            }
        };

        let mut frame_size = 0usize;
        let mut max_nack_count = -1i32;
        let mut min_receive_time_ms = end_receive_time_ms;
        let mut max_receive_time_ms = end_receive_time_ms;
        let mut start_seq_num = seq_num;
        let mut start_index = end_index;
        let mut tested_packets = 0usize;
        let mut packet_infos: Vec<PacketInfo> = Vec::new();

        // H.264 keyframes are identified by the NAL units seen in the frame.
        let mut has_h264_sps = false;
        let mut has_h264_pps = false;
        let mut has_h264_idr = false;
        let mut is_h264_keyframe = false;
        // Resolution of the smallest-index packet that carries one,
        // typically the SPS or IDR packet.
        let mut keyframe_resolution: Option<(u32, u32)> = None;

        loop {
            let Some(entry) = &self.slots[start_index] else {
                debug_assert!(false, "frame walk crossed an empty slot");
                return true;
            };
            tested_packets += 1;
            frame_size += entry.packet.payload.len();
            max_nack_count = max_nack_count.max(entry.packet.times_nacked);
            min_receive_time_ms = min_receive_time_ms.min(entry.packet.packet_info.receive_time_ms);
            max_receive_time_ms = max_receive_time_ms.max(entry.packet.packet_info.receive_time_ms);
            // Pushed in reverse while walking backward; order is fixed up
            // after the loop.
            packet_infos.push(entry.packet.packet_info);

            if !is_h264 && entry.packet.is_first_packet_in_frame {
                break;
            }

            if is_h264 {
                let CodecHeader::H264(h264_header) = &entry.packet.codec_header else {
                    return false;
                };
                if h264_header.nalus.len() >= MAX_NALUS_PER_PACKET {
                    return false;
                }
                for nalu in &h264_header.nalus {
                    match nalu {
                        NaluType::Sps => has_h264_sps = true,
                        NaluType::Pps => has_h264_pps = true,
                        NaluType::Idr => has_h264_idr = true,
                        _ => {}
                    }
                }
                if (self.sps_pps_idr_is_h264_keyframe
                    && has_h264_idr
                    && has_h264_sps
                    && has_h264_pps)
                    || (!self.sps_pps_idr_is_h264_keyframe && has_h264_idr)
                {
                    is_h264_keyframe = true;
                    if entry.packet.width > 0 && entry.packet.height > 0 {
                        keyframe_resolution = Some((entry.packet.width, entry.packet.height));
                    }
                }
            }

            if tested_packets == size {
                break;
            }

            start_index = if start_index > 0 { start_index - 1 } else { size - 1 };

            // H.264 frame-begin markers are unreliable, so the walk stops
            // when the previous slot is empty or belongs to a different
            // timestamp. Same-timestamp runs spanning a lost boundary can
            // therefore hand out incomplete frames; downstream owns
            // reference validation.
            if is_h264 {
                match &self.slots[start_index] {
                    Some(prev) if prev.packet.timestamp == frame_timestamp => {}
                    _ => break,
                }
            }

            start_seq_num = start_seq_num.wrapping_sub(1);
        }

        packet_infos.reverse();

        if is_h264 {
            if has_h264_idr && (!has_h264_sps || !has_h264_pps) {
                log::warn!(
                    "Received H.264 IDR frame (sps: {has_h264_sps}, pps: {has_h264_pps}); treating as {} frame",
                    if self.sps_pps_idr_is_h264_keyframe { "delta" } else { "key" }
                );
            }

            // The classification decided here overrides the depacketizer's
            // frame-type hint on the first packet.
            let first_packet_index = start_seq_num as usize % size;
            let mut first_temporal_id = None;
            if let Some(first) = self.slots[first_packet_index].as_mut() {
                first_temporal_id = first.packet.temporal_id;
                if is_h264_keyframe {
                    first.packet.frame_type = FrameType::KeyFrame;
                    if let Some((width, height)) = keyframe_resolution {
                        first.packet.width = width;
                        first.packet.height = height;
                    }
                } else {
                    first.packet.frame_type = FrameType::DeltaFrame;
                }
            }

            // A base-layer delta frame with sequence gaps before its first
            // packet may reference a frame that never arrived; hold it back.
            if first_temporal_id.is_none()
                && !is_h264_keyframe
                && self
                    .missing_packets
                    .range(..=SeqNum(start_seq_num))
                    .next()
                    .is_some()
            {
                return false;
            }
        }

        // Gaps covered by this frame are no longer missing.
        let mut still_missing = self.missing_packets.split_off(&SeqNum(seq_num));
        still_missing.remove(&SeqNum(seq_num));
        self.missing_packets = still_missing;

        let data = self.assemble_payload(frame_size, start_seq_num, seq_num);

        let frame = {
            let Some(first) = self.get_packet(start_seq_num) else {
                debug_assert!(false, "first packet of assembled frame must be stored");
                return true;
            };
            let Some(last) = self.get_packet(seq_num) else {
                debug_assert!(false, "last packet of assembled frame must be stored");
                return true;
            };
            AssembledFrame {
                first_seq_num: start_seq_num,
                last_seq_num: seq_num,
                timestamp: first.timestamp,
                frame_type: first.frame_type,
                codec: first.codec(),
                width: first.width,
                height: first.height,
                marker_bit: last.marker_bit,
                payload_type: first.payload_type,
                times_nacked: max_nack_count,
                min_receive_time_ms,
                max_receive_time_ms,
                ntp_time_ms: first.ntp_time_ms,
                rotation: last.rotation,
                color_space: last.color_space,
                packet_infos,
                data,
            }
        };
        found_frames.push(frame);

        self.clear_interval(start_seq_num, seq_num);
        true
    }

    /// Copy the payloads of `[first_seq_num ..= last_seq_num]` into one
    /// contiguous buffer in sequence order.
    fn assemble_payload(&self, frame_size: usize, first_seq_num: u16, last_seq_num: u16) -> Vec<u8> {
        let size = self.slots.len();
        let mut index = first_seq_num as usize % size;
        let end = (last_seq_num as usize + 1) % size;

        let mut data = Vec::with_capacity(frame_size);
        loop {
            match &self.slots[index] {
                Some(entry) => data.extend_from_slice(&entry.packet.payload),
                None => debug_assert!(false, "assembling payload from an empty slot"),
            }
            index = (index + 1) % size;
            if index == end {
                break;
            }
        }
        debug_assert_eq!(data.len(), frame_size);
        data
    }

    fn get_packet(&self, seq_num: u16) -> Option<&VideoPacket> {
        let entry = self.slots[seq_num as usize % self.slots.len()].as_ref()?;
        (entry.packet.seq_num == seq_num).then_some(&entry.packet)
    }

    /// Free the slots holding `[start_seq_num ..= stop_seq_num]`.
    fn clear_interval(&mut self, start_seq_num: u16, stop_seq_num: u16) {
        let size = self.slots.len();
        let iterations = forward_diff(start_seq_num, stop_seq_num.wrapping_add(1)) as usize;
        debug_assert!(iterations <= size);

        let mut seq_num = start_seq_num;
        for _ in 0..iterations {
            let index = seq_num as usize % size;
            debug_assert!(self.slots[index]
                .as_ref()
                .is_some_and(|entry| entry.packet.seq_num == seq_num));
            self.slots[index] = None;
            seq_num = seq_num.wrapping_add(1);
        }
    }

    fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.first_packet_received = false;
        self.is_cleared_to_first_seq_num = false;
        self.last_received_packet_ms = None;
        self.last_received_keyframe_packet_ms = None;
        self.newest_inserted_seq_num = None;
        self.missing_packets.clear();
        // The unique-frame history survives a clear on purpose.
    }

    fn clear_to(&mut self, seq_num: u16) {
        // Already cleared past this point.
        if self.is_cleared_to_first_seq_num && ahead_of(self.first_seq_num, seq_num) {
            return;
        }
        // A clear can race a frame being created and returned.
        if !self.first_packet_received {
            return;
        }

        // Everything up to and including seq_num goes.
        let seq_num = seq_num.wrapping_add(1);
        let size = self.slots.len();
        let diff = forward_diff(self.first_seq_num, seq_num) as usize;
        let iterations = diff.min(size);
        for _ in 0..iterations {
            let index = self.first_seq_num as usize % size;
            let is_stale = self.slots[index]
                .as_ref()
                .is_some_and(|entry| ahead_of(seq_num, entry.packet.seq_num));
            if is_stale {
                self.slots[index] = None;
            }
            self.first_seq_num = self.first_seq_num.wrapping_add(1);
        }
        // When the distance exceeds the capacity the loop above stops short;
        // jump the rest of the way. Anything stale that escaped the pass is
        // evicted naturally on slot collision.
        self.first_seq_num = seq_num;

        self.is_cleared_to_first_seq_num = true;

        // Drop cleared missing entries, but keep the newest one at or below
        // the cleared-to point so the gap right at the boundary stays
        // visible to the retransmission controller.
        let cleared: Vec<SeqNum> = self
            .missing_packets
            .range(..=SeqNum(seq_num))
            .copied()
            .collect();
        if let Some((_, rest)) = cleared.split_last() {
            for entry in rest {
                self.missing_packets.remove(entry);
            }
        }
    }

    fn update_missing_packets(&mut self, seq_num: u16) {
        let Some(newest) = self.newest_inserted_seq_num else {
            self.newest_inserted_seq_num = Some(seq_num);
            return;
        };

        if ahead_of(seq_num, newest) {
            // On a large forward jump, drop entries that fell behind the age
            // horizon and fast-forward instead of enumerating the whole gap.
            let old_seq_num = seq_num.wrapping_sub(MAX_MISSING_PACKET_AGE);
            let kept = self.missing_packets.split_off(&SeqNum(old_seq_num));
            self.missing_packets = kept;

            let mut next = if ahead_of(old_seq_num, newest) {
                old_seq_num
            } else {
                newest
            };
            next = next.wrapping_add(1);
            while ahead_of(seq_num, next) {
                self.missing_packets.insert(SeqNum(next));
                next = next.wrapping_add(1);
            }
            self.newest_inserted_seq_num = Some(seq_num);
        } else {
            // An older packet filled a gap (or was a duplicate).
            self.missing_packets.remove(&SeqNum(seq_num));
        }
    }

    fn on_timestamp_received(&mut self, rtp_timestamp: u32) {
        if self.timestamps_history_set.insert(rtp_timestamp) {
            self.timestamps_history_queue.push_back(rtp_timestamp);
            self.unique_frames_seen += 1;
            if self.timestamps_history_set.len() > MAX_TIMESTAMP_HISTORY {
                if let Some(discarded) = self.timestamps_history_queue.pop_front() {
                    self.timestamps_history_set.remove(&discarded);
                }
            }
        }
    }
}
