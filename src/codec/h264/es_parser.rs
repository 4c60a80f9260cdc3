// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Streaming parser for H.264 Annex B elementary streams.
//!
//! Input bytes are scanned for start codes, NALUs are assembled into access
//! units, and finished frames come out length-prefixed with picture-order
//! based timestamps and backward/forward reference deltas.

use std::collections::VecDeque;
use std::rc::Rc;

use byteorder::BigEndian;
use byteorder::WriteBytesExt;

use crate::bitstream_utils::BitReader;
use crate::codec::h264::parser::NaluHeader;
use crate::codec::h264::parser::NaluType;
use crate::codec::h264::parser::Parser;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::Sps;

const NALU_START_CODE: u32 = 0x0000_0001;

/// Fallback field duration when neither the bitstream nor the caller
/// provides timing information (25 frames per second).
const DEFAULT_FIELD_DURATION: i64 = 20_000_000;

const RECOVERY_POINT_SEI: u32 = 6;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameKind {
    I = 0,
    #[default]
    P = 1,
    B = 2,
}

/// A finished access unit with its length-prefixed payload and timing.
///
/// `ref1` is the delta from this frame's start to the start of the previous
/// I or P frame, `ref2` (B frames only) the delta to the next non-B frame.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    pub data: Vec<u8>,
    pub keyframe: bool,
    pub kind: FrameKind,
    /// Byte position, in the elementary stream, of the start code preceding
    /// the first slice NALU.
    pub position: u64,
    pub start: i64,
    pub end: i64,
    pub ref1: i64,
    pub ref2: i64,

    has_provided_timestamp: bool,
    presentation_order: i64,
    decode_order: u32,
    slice: SliceHeader,
}

/// Diagnostic counters. `num_frames_out` is indexed by [`FrameKind`].
#[derive(Clone, Debug, Default)]
pub struct Stats {
    pub num_frames_out: [u64; 3],
    pub num_timestamps_provided: u64,
    pub num_timestamps_generated: u64,
    pub num_sei_nalus: u64,
    pub num_idr_slices: u64,
    pub num_field_slices: u64,
    pub num_frame_slices: u64,
}

struct ParameterSet<T> {
    nalu: Vec<u8>,
    checksum: u32,
    set: Rc<T>,
}

pub struct EsParser {
    parser: Parser,

    nalu_size_length: usize,
    keep_ar_info: bool,
    fix_bitstream_frame_rate: bool,

    forced_default_duration: Option<i64>,
    container_default_duration: Option<i64>,
    stream_default_duration: Option<i64>,

    configuration_record_ready: bool,
    configuration_record_changed: bool,

    spses: Vec<ParameterSet<Sps>>,
    ppses: Vec<ParameterSet<Pps>>,
    /// Length-prefixed non-slice NALUs waiting to be attached to the next
    /// frame start.
    extra_data: Vec<Vec<u8>>,

    unparsed_buffer: Vec<u8>,
    stream_position: u64,
    parsed_position: u64,

    /// Slice NALUs received before the first SPS+PPS pair, replayed once
    /// the configuration record is ready.
    unhandled_nalus: VecDeque<(Vec<u8>, u64)>,

    incomplete_frame: Option<Frame>,
    frames: Vec<Frame>,
    frames_out: VecDeque<Frame>,

    /// Caller-provided timestamps tagged with the stream position at which
    /// they were supplied.
    provided_timestamps: VecDeque<(i64, u64)>,
    max_timestamp: i64,
    previous_i_p_start: i64,

    recovery_point_valid: bool,
    all_i_slices_are_key_frames: bool,
    current_key_frame_bottom_field: Option<bool>,

    par: Option<(u32, u32)>,

    stats: Stats,
}

impl Default for EsParser {
    fn default() -> Self {
        Self {
            parser: Parser::default(),
            nalu_size_length: 4,
            keep_ar_info: true,
            fix_bitstream_frame_rate: false,
            forced_default_duration: None,
            container_default_duration: None,
            stream_default_duration: None,
            configuration_record_ready: false,
            configuration_record_changed: false,
            spses: vec![],
            ppses: vec![],
            extra_data: vec![],
            unparsed_buffer: vec![],
            stream_position: 0,
            parsed_position: 0,
            unhandled_nalus: VecDeque::new(),
            incomplete_frame: None,
            frames: vec![],
            frames_out: VecDeque::new(),
            provided_timestamps: VecDeque::new(),
            max_timestamp: 0,
            previous_i_p_start: 0,
            recovery_point_valid: false,
            all_i_slices_are_key_frames: false,
            current_key_frame_bottom_field: None,
            par: None,
            stats: Stats::default(),
        }
    }
}

impl EsParser {
    pub fn new() -> Self {
        Default::default()
    }

    /// Length of the size prefix written in front of each output NALU.
    pub fn set_nalu_size_length(&mut self, nalu_size_length: usize) {
        self.nalu_size_length = nalu_size_length;
    }

    /// Overrides all other duration sources with a fixed field duration.
    pub fn force_default_duration(&mut self, duration: i64) {
        self.forced_default_duration = Some(duration);
    }

    /// Field duration to fall back to when the bitstream carries no timing
    /// information.
    pub fn set_container_default_duration(&mut self, duration: i64) {
        self.container_default_duration = Some(duration);
    }

    /// Whether aspect ratio information is extracted from SPS NALUs.
    pub fn set_keep_ar_info(&mut self, keep: bool) {
        self.keep_ar_info = keep;
    }

    /// When set, the container default duration takes precedence over the
    /// timing information found in the bitstream.
    pub fn set_fix_bitstream_frame_rate(&mut self, fix: bool) {
        self.fix_bitstream_frame_rate = fix;
    }

    /// Treat every I slice as a keyframe. Off by default; only sound for
    /// streams whose I slices all start random access points.
    pub fn set_all_i_slices_are_key_frames(&mut self, enable: bool) {
        self.all_i_slices_are_key_frames = enable;
    }

    /// Records a timestamp for the frame that starts at or after the current
    /// stream position.
    pub fn add_timestamp(&mut self, timestamp: i64) {
        self.provided_timestamps
            .push_back((timestamp, self.stream_position));
        self.stats.num_timestamps_provided += 1;
    }

    pub fn frame_available(&self) -> bool {
        !self.frames_out.is_empty()
    }

    pub fn get_frame(&mut self) -> Option<Frame> {
        self.frames_out.pop_front()
    }

    pub fn headers_parsed(&self) -> bool {
        self.configuration_record_ready
            && self.spses.first().is_some_and(|entry| {
                let (width, height) = entry.set.visible_dimensions();
                width > 0 && height > 0
            })
    }

    pub fn width(&self) -> Option<u32> {
        self.spses
            .first()
            .map(|entry| entry.set.visible_dimensions().0)
    }

    pub fn height(&self) -> Option<u32> {
        self.spses
            .first()
            .map(|entry| entry.set.visible_dimensions().1)
    }

    pub fn par(&self) -> Option<(u32, u32)> {
        self.par
    }

    pub fn has_stream_default_duration(&self) -> bool {
        self.stream_default_duration.is_some()
    }

    /// Field duration derived from the first SPS carrying valid VUI timing.
    pub fn stream_default_duration(&self) -> Option<i64> {
        self.stream_default_duration
    }

    /// Whether a parameter set was added or replaced since the last keyframe
    /// re-seeded the extra data.
    pub fn configuration_record_changed(&self) -> bool {
        self.configuration_record_changed
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Feeds elementary stream bytes. Complete NALUs are dispatched, the
    /// tail from the last start code onwards is retained for the next call.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        let mut data = std::mem::take(&mut self.unparsed_buffer);
        data.extend_from_slice(bytes);

        let previous_parsed_pos = self.parsed_position;
        let mut previous_pos: Option<usize> = None;
        let mut previous_marker_size = 0usize;

        if data.len() >= 3 {
            let mut marker: u32 = (1 << 24)
                | (u32::from(data[0]) << 16)
                | (u32::from(data[1]) << 8)
                | u32::from(data[2]);
            let mut pos = 3;

            loop {
                let marker_size = if marker == NALU_START_CODE {
                    4
                } else if marker & 0x00ff_ffff == NALU_START_CODE {
                    3
                } else {
                    0
                };

                if marker_size != 0 {
                    if let Some(prev) = previous_pos {
                        let start = prev + previous_marker_size;
                        self.parsed_position = previous_parsed_pos + prev as u64;

                        // Trailing zero bytes belong to the next start code.
                        let mut end = pos - marker_size;
                        while end > start && data[end - 1] == 0 {
                            end -= 1;
                        }
                        if end > start {
                            let position = self.parsed_position;
                            self.handle_nalu(&data[start..end], position);
                        }
                    }
                    previous_pos = Some(pos - marker_size);
                    previous_marker_size = marker_size;
                }

                if pos >= data.len() {
                    break;
                }
                marker = (marker << 8) | u32::from(data[pos]);
                pos += 1;
            }
        }

        let tail_start = previous_pos.unwrap_or(0);
        self.stream_position += bytes.len() as u64;
        self.parsed_position = previous_parsed_pos + tail_start as u64;
        self.unparsed_buffer = data[tail_start..].to_vec();
    }

    /// Treats the retained tail as a final NALU, completes the pending frame
    /// and runs a final cleanup pass.
    pub fn flush(&mut self) {
        let buffer = std::mem::take(&mut self.unparsed_buffer);
        if buffer.len() >= 5 {
            self.parsed_position += buffer.len() as u64;
            let marker_size = if buffer[0..4] == [0, 0, 0, 1] { 4 } else { 3 };
            let position = self.parsed_position - buffer.len() as u64;
            self.handle_nalu(&buffer[marker_size..], position);
        }

        if let Some(frame) = self.incomplete_frame.take() {
            self.frames.push(frame);
        }

        self.cleanup();
    }

    /// AVCDecoderConfigurationRecord built from the tracked parameter sets.
    pub fn avcc(&self) -> Option<Vec<u8>> {
        let first = self.spses.first()?;
        if first.nalu.len() < 4 {
            return None;
        }

        let write = || -> std::io::Result<Vec<u8>> {
            let mut out = Vec::new();
            out.write_u8(1)?;
            out.write_u8(first.nalu[1])?; // profile_idc
            out.write_u8(first.nalu[2])?; // constraint flags
            out.write_u8(first.nalu[3])?; // level_idc
            out.write_u8(0xfc | (self.nalu_size_length as u8 - 1))?;
            out.write_u8(0xe0 | (self.spses.len() as u8 & 0x1f))?;
            for entry in &self.spses {
                out.write_u16::<BigEndian>(entry.nalu.len() as u16)?;
                out.extend_from_slice(&entry.nalu);
            }
            out.write_u8(self.ppses.len() as u8)?;
            for entry in &self.ppses {
                out.write_u16::<BigEndian>(entry.nalu.len() as u16)?;
                out.extend_from_slice(&entry.nalu);
            }
            Ok(out)
        };

        write().ok()
    }

    fn length_prefixed(&self, nalu: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.nalu_size_length + nalu.len());
        for i in (0..self.nalu_size_length).rev() {
            out.push((nalu.len() >> (8 * i)) as u8);
        }
        out.extend_from_slice(nalu);
        out
    }

    fn handle_nalu(&mut self, nalu: &[u8], position: u64) {
        let first_byte = match nalu.first() {
            Some(byte) => *byte,
            None => return,
        };
        let header = match NaluHeader::parse(first_byte) {
            Ok(header) => header,
            Err(err) => {
                log::debug!("dropping NALU with invalid header: {}", err);
                return;
            }
        };

        match header.type_ {
            NaluType::Sps => self.handle_sps_nalu(nalu),
            NaluType::Pps => self.handle_pps_nalu(nalu),

            NaluType::AuDelimiter | NaluType::SeqEnd | NaluType::StreamEnd => {
                self.flush_incomplete_frame();
            }

            NaluType::FillerData => {}

            NaluType::Slice
            | NaluType::SliceDpa
            | NaluType::SliceDpb
            | NaluType::SliceDpc
            | NaluType::SliceIdr => {
                if !self.configuration_record_ready
                    && !self.spses.is_empty()
                    && !self.ppses.is_empty()
                {
                    self.configuration_record_ready = true;
                    self.flush_unhandled_nalus();
                }
                self.handle_slice_nalu(nalu, position);
            }

            _ => {
                self.flush_incomplete_frame();
                if !self.configuration_record_ready
                    && !self.spses.is_empty()
                    && !self.ppses.is_empty()
                {
                    self.configuration_record_ready = true;
                    self.flush_unhandled_nalus();
                }
                let prefixed = self.length_prefixed(nalu);
                self.extra_data.push(prefixed);
                if matches!(header.type_, NaluType::Sei) {
                    self.handle_sei_nalu(nalu);
                }
            }
        }
    }

    fn flush_unhandled_nalus(&mut self) {
        let queued = std::mem::take(&mut self.unhandled_nalus);
        for (nalu, position) in queued {
            self.handle_nalu(&nalu, position);
        }
    }

    fn handle_sps_nalu(&mut self, nalu: &[u8]) {
        let sps = match self.parser.parse_sps(nalu) {
            Ok(sps) => sps,
            Err(err) => {
                log::debug!("dropping unparseable SPS: {}", err);
                return;
            }
        };

        let checksum = crc32fast::hash(nalu);
        let mut use_sps = true;

        match self
            .spses
            .iter()
            .position(|entry| entry.set.seq_parameter_set_id == sps.seq_parameter_set_id)
        {
            None => {
                self.spses.push(ParameterSet {
                    nalu: nalu.to_vec(),
                    checksum,
                    set: Rc::clone(&sps),
                });
                if self.configuration_record_ready {
                    self.configuration_record_changed = true;
                }
            }
            Some(idx) if self.spses[idx].checksum != checksum => {
                log::debug!(
                    "SPS {} changed, completing the pending frame group",
                    sps.seq_parameter_set_id
                );
                self.cleanup();
                self.spses[idx] = ParameterSet {
                    nalu: nalu.to_vec(),
                    checksum,
                    set: Rc::clone(&sps),
                };
                if self.configuration_record_ready {
                    self.configuration_record_changed = true;
                }
            }
            // Retransmission of a known SPS.
            Some(_) => use_sps = false,
        }

        let prefixed = self.length_prefixed(nalu);
        self.extra_data.push(prefixed);

        if !use_sps {
            return;
        }

        if self.stream_default_duration.is_none() && sps.timing_info_valid() {
            self.stream_default_duration = Some(sps.field_duration() as i64);
        }
        if self.keep_ar_info && self.par.is_none() {
            self.par = sps.pixel_aspect_ratio();
        }
    }

    fn handle_pps_nalu(&mut self, nalu: &[u8]) {
        let pps = match self.parser.parse_pps(nalu) {
            Ok(pps) => pps,
            Err(err) => {
                log::debug!("dropping unparseable PPS: {}", err);
                return;
            }
        };

        let checksum = crc32fast::hash(nalu);

        match self
            .ppses
            .iter()
            .position(|entry| entry.set.pic_parameter_set_id == pps.pic_parameter_set_id)
        {
            None => {
                self.ppses.push(ParameterSet {
                    nalu: nalu.to_vec(),
                    checksum,
                    set: Rc::clone(&pps),
                });
                if self.configuration_record_ready {
                    self.configuration_record_changed = true;
                }
            }
            Some(idx) if self.ppses[idx].checksum != checksum => {
                if self.ppses[idx].set.seq_parameter_set_id != pps.seq_parameter_set_id {
                    self.cleanup();
                }
                self.ppses[idx] = ParameterSet {
                    nalu: nalu.to_vec(),
                    checksum,
                    set: Rc::clone(&pps),
                };
                if self.configuration_record_ready {
                    self.configuration_record_changed = true;
                }
            }
            Some(_) => {}
        }

        let prefixed = self.length_prefixed(nalu);
        self.extra_data.push(prefixed);
    }

    fn handle_sei_nalu(&mut self, nalu: &[u8]) {
        self.stats.num_sei_nalus += 1;

        let mut recovery_point = false;
        let mut r = BitReader::new(nalu, true);
        let mut walk = || -> Result<(), String> {
            r.skip_bits(8)?;
            while r.has_more_rsbp_data() {
                let mut payload_type: u32 = 0;
                loop {
                    let byte: u32 = r.read_bits(8)?;
                    payload_type += byte;
                    if byte != 0xff {
                        break;
                    }
                }
                if payload_type == RECOVERY_POINT_SEI {
                    recovery_point = true;
                    return Ok(());
                }

                let mut payload_size: usize = 0;
                loop {
                    let byte: u32 = r.read_bits(8)?;
                    payload_size += byte as usize;
                    if byte != 0xff {
                        break;
                    }
                }
                r.skip_bits(payload_size * 8)?;
            }
            Ok(())
        };

        if let Err(err) = walk() {
            log::debug!("stopping SEI walk: {}", err);
        }
        if recovery_point {
            self.recovery_point_valid = true;
        }
    }

    fn handle_slice_nalu(&mut self, nalu: &[u8], position: u64) {
        if !self.configuration_record_ready {
            self.unhandled_nalus.push_back((nalu.to_vec(), position));
            return;
        }

        let si = match self.parser.parse_slice_header(nalu) {
            Ok(si) => si,
            Err(err) => {
                log::debug!("dropping unparseable slice: {}", err);
                return;
            }
        };

        if si.is_idr() {
            self.stats.num_idr_slices += 1;
        }

        let must_flush = self
            .incomplete_frame
            .as_ref()
            .is_some_and(|frame| Self::flush_decision(&si, &frame.slice));
        if must_flush {
            self.flush_incomplete_frame();
        }

        let prefixed = self.length_prefixed(nalu);
        if let Some(frame) = self.incomplete_frame.as_mut() {
            // Another slice of the same picture.
            frame.data.extend_from_slice(&prefixed);
            return;
        }

        let is_i = si.is_i_slice();
        let keyframe = self.recovery_point_valid
            || (is_i && si.is_idr())
            || (is_i && self.all_i_slices_are_key_frames);
        self.recovery_point_valid = false;

        let kind = if keyframe {
            FrameKind::I
        } else if si.is_b_slice() {
            FrameKind::B
        } else {
            FrameKind::P
        };

        if keyframe {
            // The second field of a key picture must not complete the
            // pending group.
            if !si.field_pic_flag
                || self.current_key_frame_bottom_field.is_none()
                || self.current_key_frame_bottom_field == Some(si.bottom_field_flag)
            {
                self.cleanup();
                if self.configuration_record_changed {
                    self.add_sps_and_pps_to_extra_data();
                    self.configuration_record_changed = false;
                }
            }

            if !si.field_pic_flag {
                self.current_key_frame_bottom_field = None;
            } else if self.current_key_frame_bottom_field.is_some()
                && self.current_key_frame_bottom_field != Some(si.bottom_field_flag)
            {
                self.current_key_frame_bottom_field = None;
            } else {
                self.current_key_frame_bottom_field = Some(si.bottom_field_flag);
            }
        }

        let mut data: Vec<u8> = self.extra_data.drain(..).flatten().collect();
        data.extend_from_slice(&prefixed);

        self.incomplete_frame = Some(Frame {
            data,
            keyframe,
            kind,
            position,
            slice: si,
            ..Default::default()
        });
    }

    /// Whether `si` starts a new access unit relative to the pending one.
    /// See 7.4.1.2.4.
    fn flush_decision(si: &SliceHeader, pending: &SliceHeader) -> bool {
        if si.is_idr() {
            if si.first_mb_in_slice != 0 {
                return false;
            }
            if !pending.is_idr() || si.idr_pic_id != pending.idr_pic_id {
                return true;
            }
        }

        if si.frame_num != pending.frame_num {
            return true;
        }
        if si.field_pic_flag != pending.field_pic_flag {
            return true;
        }
        if (si.nal_ref_idc == 0) != (pending.nal_ref_idc == 0) {
            return true;
        }

        if si.pic_order_cnt_type == 0 && pending.pic_order_cnt_type == 0 {
            if si.pic_order_cnt_lsb != pending.pic_order_cnt_lsb
                || si.delta_pic_order_cnt_bottom != pending.delta_pic_order_cnt_bottom
            {
                return true;
            }
        } else if si.pic_order_cnt_type == 1
            && pending.pic_order_cnt_type == 1
            && si.delta_pic_order_cnt != pending.delta_pic_order_cnt
        {
            return true;
        }

        false
    }

    fn flush_incomplete_frame(&mut self) {
        if !self.configuration_record_ready {
            return;
        }
        if let Some(frame) = self.incomplete_frame.take() {
            self.frames.push(frame);
        }
    }

    /// Replaces all parameter-set entries in the extra data with the current
    /// SPS and PPS lists.
    fn add_sps_and_pps_to_extra_data(&mut self) {
        let nalu_size_length = self.nalu_size_length;
        self.extra_data.retain(|data| {
            data.get(nalu_size_length)
                .map(|byte| !matches!(byte & 0x1f, 7 | 8))
                .unwrap_or(true)
        });

        let mut seeded =
            Vec::with_capacity(self.spses.len() + self.ppses.len() + self.extra_data.len());
        for idx in 0..self.spses.len() {
            seeded.push(self.length_prefixed(&self.spses[idx].nalu));
        }
        for idx in 0..self.ppses.len() {
            seeded.push(self.length_prefixed(&self.ppses[idx].nalu));
        }
        seeded.append(&mut self.extra_data);
        self.extra_data = seeded;
    }

    /// Orders, timestamps and moves the finished frame group to the output
    /// queue.
    fn cleanup(&mut self) {
        if self.frames.is_empty() {
            return;
        }

        let simple = self.calculate_frame_order();
        self.calculate_frame_timestamps_and_references(simple);

        for frame in self.frames.drain(..) {
            self.stats.num_frames_out[frame.kind as usize] += 1;
            if frame.slice.field_pic_flag {
                self.stats.num_field_slices += 1;
            } else {
                self.stats.num_frame_slices += 1;
            }
            self.frames_out.push_back(frame);
        }
    }

    /// Computes presentation order from POC LSB unwrapping. Returns true if
    /// decode order must be treated as presentation order.
    fn calculate_frame_order(&mut self) -> bool {
        for (idx, frame) in self.frames.iter_mut().enumerate() {
            frame.decode_order = idx as u32;
        }

        let first = self.frames[0].slice.clone();
        if !first.is_i_slice() || first.nal_ref_idc == 0 || first.pic_order_cnt_type != 0 {
            return true;
        }

        let max_pic_order_cnt_lsb = 1i64 << first.log2_max_pic_order_cnt_lsb;
        let mut prev_lsb: i64 = 0;
        let mut prev_msb: i64 = 0;

        for frame in self.frames.iter_mut() {
            let si = &frame.slice;
            if si.seq_parameter_set_id != first.seq_parameter_set_id || si.pic_order_cnt_type != 0
            {
                return true;
            }

            let lsb = i64::from(si.pic_order_cnt_lsb);
            let msb = if lsb < prev_lsb && prev_lsb - lsb >= max_pic_order_cnt_lsb / 2 {
                prev_msb + max_pic_order_cnt_lsb
            } else if lsb > prev_lsb && lsb - prev_lsb > max_pic_order_cnt_lsb / 2 {
                prev_msb - max_pic_order_cnt_lsb
            } else {
                prev_msb
            };

            frame.presentation_order = msb + lsb;

            // Only reference pictures update the POC prediction state.
            if si.nal_ref_idc != 0 {
                prev_lsb = lsb;
                prev_msb = msb;
            }
        }

        false
    }

    /// Claims provided timestamps against the decode-ordered frames. The
    /// claimed set is sorted ascending for assignment in presentation order.
    fn calculate_provided_timestamps_to_use(&mut self) -> Vec<i64> {
        let mut to_use = Vec::with_capacity(self.frames.len());
        let mut provided_idx = 0;

        for frame in self.frames.iter_mut() {
            let mut timestamp = None;
            while provided_idx < self.provided_timestamps.len()
                && frame.position >= self.provided_timestamps[provided_idx].1
            {
                timestamp = Some(self.provided_timestamps[provided_idx].0);
                provided_idx += 1;
            }
            if let Some(timestamp) = timestamp {
                to_use.push(timestamp);
                frame.has_provided_timestamp = true;
            }
        }

        self.provided_timestamps.drain(..provided_idx);
        to_use.sort_unstable();
        to_use
    }

    fn calculate_frame_timestamps_and_references(&mut self, simple: bool) {
        let provided = self.calculate_provided_timestamps_to_use();

        if !simple {
            self.frames.sort_by_key(|frame| frame.presentation_order);
        }

        let mut provided_iter = provided.into_iter();
        for idx in 0..self.frames.len() {
            let start = if self.frames[idx].has_provided_timestamp {
                let timestamp = provided_iter.next().unwrap_or(self.max_timestamp);
                if idx > 0 {
                    self.frames[idx - 1].end = timestamp;
                }
                timestamp
            } else {
                self.stats.num_timestamps_generated += 1;
                if idx == 0 {
                    self.max_timestamp
                } else {
                    self.frames[idx - 1].end
                }
            };

            let duration = self.duration_for(&self.frames[idx].slice);
            self.frames[idx].start = start;
            self.frames[idx].end = start + duration;
        }

        if let Some(last) = self.frames.last() {
            self.max_timestamp = last.end;
        }

        for idx in 0..self.frames.len() {
            let start = self.frames[idx].start;
            match self.frames[idx].kind {
                FrameKind::I => self.previous_i_p_start = start,
                FrameKind::P => {
                    self.frames[idx].ref1 = self.previous_i_p_start - start;
                    self.previous_i_p_start = start;
                }
                FrameKind::B => {
                    self.frames[idx].ref1 = self.previous_i_p_start - start;
                    let forward = self.frames[idx + 1..]
                        .iter()
                        .find(|frame| frame.kind != FrameKind::B)
                        .map(|frame| frame.start)
                        .unwrap_or(self.max_timestamp);
                    self.frames[idx].ref2 = forward - start;
                }
            }
        }

        if !simple {
            self.frames.sort_by_key(|frame| frame.decode_order);
        }
    }

    /// The duration of the picture described by `si`, in nanoseconds.
    fn duration_for(&self, si: &SliceHeader) -> i64 {
        let sps_timing = self
            .spses
            .iter()
            .find(|entry| entry.set.seq_parameter_set_id == si.seq_parameter_set_id)
            .filter(|entry| entry.set.timing_info_valid())
            .map(|entry| entry.set.field_duration() as i64);

        let field_duration = self
            .forced_default_duration
            .or(if self.fix_bitstream_frame_rate {
                self.container_default_duration
            } else {
                None
            })
            .or(sps_timing)
            .or(self.stream_default_duration)
            .or(self.container_default_duration)
            .unwrap_or(DEFAULT_FIELD_DURATION);

        if si.field_pic_flag {
            field_duration
        } else {
            field_duration * 2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::parser::tests::IDR_SLICE_NALU;
    use crate::codec::h264::parser::tests::IDR_SLICE_NALU_PIC_ID_1;
    use crate::codec::h264::parser::tests::PPS_NALU;
    use crate::codec::h264::parser::tests::P_SLICE_NALU;
    use crate::codec::h264::parser::tests::SPS_NALU;

    // Second slice of the same IDR picture: first_mb_in_slice 1, otherwise
    // identical to IDR_SLICE_NALU.
    const IDR_CONTINUATION_NALU: [u8; 4] = [0x65, 0x42, 0x21, 0x08];
    // Non-IDR I slice, frame_num 0, pic_order_cnt_lsb 0.
    const I_SLICE_NON_IDR_NALU: [u8; 4] = [0x61, 0x88, 0x80, 0x40];
    // SEI with a recovery point payload (type 6, size 1).
    const SEI_RECOVERY_POINT_NALU: [u8; 5] = [0x06, 0x06, 0x01, 0x00, 0x80];
    // Access unit delimiter, primary_pic_type 0.
    const AU_DELIMITER_NALU: [u8; 2] = [0x09, 0x10];
    const FILLER_NALU: [u8; 2] = [0x0c, 0x80];
    // SPS_NALU with VUI timing info: num_units_in_tick 1, time_scale 50
    // (20ms fields), with one emulation prevention byte on the wire.
    const SPS_TIMING_NALU: [u8; 17] = [
        0x67, 0x42, 0x00, 0x1e, 0xf4, 0x21, 0x24, 0x20, 0x00, 0x00, 0x03, 0x00, 0x20, 0x00, 0x00,
        0x06, 0x58,
    ];
    // SPS_NALU with a different level_idc, same id.
    const SPS_CHANGED_NALU: [u8; 7] = [0x67, 0x42, 0x00, 0x28, 0xf4, 0x21, 0x22];

    fn annex_b(nalus: &[&[u8]]) -> Vec<u8> {
        let mut out = vec![];
        for nalu in nalus {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nalu);
        }
        out
    }

    fn prefixed(nalu: &[u8]) -> Vec<u8> {
        let mut out = (nalu.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(nalu);
        out
    }

    fn parse_all(nalus: &[&[u8]]) -> EsParser {
        let mut parser = EsParser::new();
        parser.add_bytes(&annex_b(nalus));
        parser.flush();
        parser
    }

    fn white_box_frame(kind: FrameKind, nal_ref_idc: u8, pic_order_cnt_lsb: u32) -> Frame {
        Frame {
            kind,
            slice: SliceHeader {
                slice_type: match kind {
                    FrameKind::I => 7,
                    FrameKind::P => 0,
                    FrameKind::B => 1,
                },
                nal_ref_idc,
                pic_order_cnt_type: 0,
                log2_max_pic_order_cnt_lsb: 4,
                pic_order_cnt_lsb,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn single_keyframe_stream() {
        let mut parser = parse_all(&[&SPS_NALU, &PPS_NALU, &IDR_SLICE_NALU]);

        assert!(parser.headers_parsed());
        assert_eq!(parser.width(), Some(64));
        assert_eq!(parser.height(), Some(64));
        assert!(parser.frame_available());

        let frame = parser.get_frame().unwrap();
        assert!(frame.keyframe);
        assert_eq!(frame.kind, FrameKind::I);
        assert_eq!(frame.start, 0);
        assert_eq!(frame.end, 40_000_000);

        let mut expected = prefixed(&SPS_NALU);
        expected.extend(prefixed(&PPS_NALU));
        expected.extend(prefixed(&IDR_SLICE_NALU));
        assert_eq!(frame.data, expected);

        assert!(parser.get_frame().is_none());
        assert_eq!(parser.stats().num_frames_out, [1, 0, 0]);
        assert_eq!(parser.stats().num_idr_slices, 1);
    }

    #[test]
    fn avcc_record() {
        let parser = parse_all(&[&SPS_NALU, &PPS_NALU, &IDR_SLICE_NALU]);

        let mut expected = vec![0x01, 0x42, 0x00, 0x1e, 0xff, 0xe1, 0x00, 0x07];
        expected.extend_from_slice(&SPS_NALU);
        expected.extend_from_slice(&[0x01, 0x00, 0x02]);
        expected.extend_from_slice(&PPS_NALU);
        assert_eq!(parser.avcc().unwrap(), expected);
    }

    #[test]
    fn idr_pic_id_change_starts_new_access_unit() {
        let mut parser = parse_all(&[
            &SPS_NALU,
            &PPS_NALU,
            &IDR_SLICE_NALU,
            &IDR_SLICE_NALU_PIC_ID_1,
        ]);

        let first = parser.get_frame().unwrap();
        let second = parser.get_frame().unwrap();
        assert!(first.keyframe && second.keyframe);
        assert_eq!(first.start, 0);
        assert_eq!(second.start, 40_000_000);
        assert_eq!(second.data, prefixed(&IDR_SLICE_NALU_PIC_ID_1));
        assert!(parser.get_frame().is_none());
    }

    #[test]
    fn additional_slice_of_same_picture_is_appended() {
        let mut parser = parse_all(&[
            &SPS_NALU,
            &PPS_NALU,
            &IDR_SLICE_NALU,
            &IDR_CONTINUATION_NALU,
        ]);

        let frame = parser.get_frame().unwrap();
        assert!(parser.get_frame().is_none());

        let mut expected = prefixed(&SPS_NALU);
        expected.extend(prefixed(&PPS_NALU));
        expected.extend(prefixed(&IDR_SLICE_NALU));
        expected.extend(prefixed(&IDR_CONTINUATION_NALU));
        assert_eq!(frame.data, expected);

        // Picture statistics count the emitted frame, not its slices.
        assert_eq!(parser.stats().num_frame_slices, 1);
        assert_eq!(parser.stats().num_field_slices, 0);
    }

    #[test]
    fn non_idr_i_slice_without_recovery_point_is_not_a_keyframe() {
        let mut parser = parse_all(&[
            &SPS_NALU,
            &PPS_NALU,
            &IDR_SLICE_NALU,
            &AU_DELIMITER_NALU,
            &I_SLICE_NON_IDR_NALU,
        ]);

        let keyframe = parser.get_frame().unwrap();
        assert!(keyframe.keyframe);
        assert_eq!(keyframe.kind, FrameKind::I);

        // A plain I slice references the preceding keyframe like any P.
        let second = parser.get_frame().unwrap();
        assert!(!second.keyframe);
        assert_eq!(second.kind, FrameKind::P);
        assert_eq!(second.ref1, -40_000_000);
        assert_eq!(parser.stats().num_frames_out, [1, 1, 0]);
    }

    #[test]
    fn all_i_slices_mode_marks_i_slices_as_keyframes() {
        let mut parser = EsParser::new();
        parser.set_all_i_slices_are_key_frames(true);
        parser.add_bytes(&annex_b(&[&SPS_NALU, &PPS_NALU, &I_SLICE_NON_IDR_NALU]));
        parser.flush();

        let frame = parser.get_frame().unwrap();
        assert!(frame.keyframe);
        assert_eq!(frame.kind, FrameKind::I);
    }

    #[test]
    fn frame_num_change_flushes() {
        let mut parser = parse_all(&[&SPS_NALU, &PPS_NALU, &IDR_SLICE_NALU, &P_SLICE_NALU]);

        let keyframe = parser.get_frame().unwrap();
        assert_eq!(keyframe.kind, FrameKind::I);
        assert_eq!(keyframe.start, 0);

        let p_frame = parser.get_frame().unwrap();
        assert_eq!(p_frame.kind, FrameKind::P);
        assert!(!p_frame.keyframe);
        assert_eq!(p_frame.start, 40_000_000);
        assert_eq!(p_frame.end, 80_000_000);
        assert_eq!(p_frame.ref1, -40_000_000);
    }

    #[test]
    fn slices_before_parameter_sets_are_replayed() {
        let mut parser = parse_all(&[
            &IDR_SLICE_NALU,
            &SPS_NALU,
            &PPS_NALU,
            &IDR_SLICE_NALU_PIC_ID_1,
        ]);

        let first = parser.get_frame().unwrap();
        let second = parser.get_frame().unwrap();

        let mut expected = prefixed(&SPS_NALU);
        expected.extend(prefixed(&PPS_NALU));
        expected.extend(prefixed(&IDR_SLICE_NALU));
        assert_eq!(first.data, expected);
        assert_eq!(second.data, prefixed(&IDR_SLICE_NALU_PIC_ID_1));
    }

    #[test]
    fn sps_change_flushes_and_reseeds_extra_data() {
        let mut parser = parse_all(&[
            &SPS_NALU,
            &PPS_NALU,
            &IDR_SLICE_NALU,
            &SPS_CHANGED_NALU,
            &IDR_SLICE_NALU_PIC_ID_1,
        ]);

        let first = parser.get_frame().unwrap();
        let mut expected = prefixed(&SPS_NALU);
        expected.extend(prefixed(&PPS_NALU));
        expected.extend(prefixed(&IDR_SLICE_NALU));
        assert_eq!(first.data, expected);

        // The second keyframe is re-seeded with the replacement SPS.
        let second = parser.get_frame().unwrap();
        let mut expected = prefixed(&SPS_CHANGED_NALU);
        expected.extend(prefixed(&PPS_NALU));
        expected.extend(prefixed(&IDR_SLICE_NALU_PIC_ID_1));
        assert_eq!(second.data, expected);

        assert!(!parser.configuration_record_changed());
        // The record reflects the replacement, not a second list entry.
        let avcc = parser.avcc().unwrap();
        assert_eq!(avcc[3], 0x28);
        assert_eq!(avcc[5], 0xe1);
    }

    #[test]
    fn sps_retransmission_has_no_side_effects() {
        let mut parser = parse_all(&[
            &SPS_NALU,
            &PPS_NALU,
            &IDR_SLICE_NALU,
            &SPS_NALU,
            &IDR_SLICE_NALU_PIC_ID_1,
        ]);

        assert!(!parser.configuration_record_changed());
        let _ = parser.get_frame().unwrap();
        // The retransmitted SPS still travels with the next frame.
        let second = parser.get_frame().unwrap();
        let mut expected = prefixed(&SPS_NALU);
        expected.extend(prefixed(&IDR_SLICE_NALU_PIC_ID_1));
        assert_eq!(second.data, expected);
    }

    #[test]
    fn recovery_point_sei_marks_keyframe() {
        let mut parser = parse_all(&[
            &SPS_NALU,
            &PPS_NALU,
            &SEI_RECOVERY_POINT_NALU,
            &I_SLICE_NON_IDR_NALU,
        ]);

        let frame = parser.get_frame().unwrap();
        assert!(frame.keyframe);
        assert_eq!(frame.kind, FrameKind::I);
        assert_eq!(parser.stats().num_sei_nalus, 1);
        assert_eq!(parser.stats().num_idr_slices, 0);

        let mut expected = prefixed(&SPS_NALU);
        expected.extend(prefixed(&PPS_NALU));
        expected.extend(prefixed(&SEI_RECOVERY_POINT_NALU));
        expected.extend(prefixed(&I_SLICE_NON_IDR_NALU));
        assert_eq!(frame.data, expected);

        // A recovery point on a P slice still makes a keyframe, without a
        // backward reference.
        let mut parser = parse_all(&[
            &SPS_NALU,
            &PPS_NALU,
            &SEI_RECOVERY_POINT_NALU,
            &P_SLICE_NALU,
        ]);
        let frame = parser.get_frame().unwrap();
        assert!(frame.keyframe);
        assert_eq!(frame.kind, FrameKind::I);
        assert_eq!(frame.ref1, 0);
    }

    #[test]
    fn delimiter_completes_access_unit_and_filler_is_dropped() {
        let mut parser = parse_all(&[
            &SPS_NALU,
            &PPS_NALU,
            &IDR_SLICE_NALU,
            &AU_DELIMITER_NALU,
            &IDR_SLICE_NALU,
            &FILLER_NALU,
        ]);

        let first = parser.get_frame().unwrap();
        let second = parser.get_frame().unwrap();
        assert!(parser.get_frame().is_none());
        assert_eq!(second.data, prefixed(&IDR_SLICE_NALU));
        assert_ne!(first.start, second.start);
    }

    #[test]
    fn split_input_matches_single_call() {
        let _ = env_logger::builder().is_test(true).try_init();

        let stream = annex_b(&[&SPS_NALU, &PPS_NALU, &IDR_SLICE_NALU, &P_SLICE_NALU]);

        let mut whole = EsParser::new();
        whole.add_bytes(&stream);
        whole.flush();

        let mut split = EsParser::new();
        for byte in &stream {
            split.add_bytes(std::slice::from_ref(byte));
        }
        split.flush();

        loop {
            let a = whole.get_frame();
            let b = split.get_frame();
            match (a, b) {
                (None, None) => break,
                (Some(a), Some(b)) => {
                    assert_eq!(a.data, b.data);
                    assert_eq!(a.keyframe, b.keyframe);
                    assert_eq!(a.start, b.start);
                    assert_eq!(a.end, b.end);
                }
                _ => panic!("parsers produced different frame counts"),
            }
        }
    }

    #[test]
    fn provided_timestamps_are_claimed_by_position() {
        let mut parser = EsParser::new();

        parser.add_timestamp(1_000_000_000);
        parser.add_bytes(&annex_b(&[&SPS_NALU, &PPS_NALU, &IDR_SLICE_NALU]));
        parser.add_timestamp(2_000_000_000);
        parser.add_bytes(&annex_b(&[&P_SLICE_NALU]));
        parser.flush();

        let keyframe = parser.get_frame().unwrap();
        assert_eq!(keyframe.start, 1_000_000_000);
        // The next provided timestamp backfills the previous frame's end.
        assert_eq!(keyframe.end, 2_000_000_000);

        let p_frame = parser.get_frame().unwrap();
        assert_eq!(p_frame.start, 2_000_000_000);
        assert_eq!(p_frame.end, 2_040_000_000);

        assert_eq!(parser.stats().num_timestamps_provided, 2);
        assert_eq!(parser.stats().num_timestamps_generated, 0);
    }

    #[test]
    fn timestamp_tagged_past_the_start_code_waits_for_the_next_frame() {
        let mut parser = EsParser::new();
        parser.add_bytes(&annex_b(&[&SPS_NALU, &PPS_NALU]));

        // The slice's start code is already consumed when the timestamp
        // arrives, so the slice must not claim it.
        parser.add_bytes(&[0, 0, 0, 1]);
        parser.add_timestamp(5_000_000_000);
        parser.add_bytes(&IDR_SLICE_NALU);
        parser.flush();

        let frame = parser.get_frame().unwrap();
        assert_eq!(frame.start, 0);
        assert_eq!(parser.stats().num_timestamps_generated, 1);
    }

    #[test]
    fn stream_timing_info_drives_durations() {
        let mut parser = parse_all(&[&SPS_TIMING_NALU, &PPS_NALU, &IDR_SLICE_NALU]);

        assert!(parser.has_stream_default_duration());
        assert_eq!(parser.stream_default_duration(), Some(20_000_000));

        let frame = parser.get_frame().unwrap();
        assert_eq!(frame.end - frame.start, 40_000_000);
    }

    #[test]
    fn forced_duration_overrides_stream_timing() {
        let mut parser = EsParser::new();
        parser.force_default_duration(10_000_000);
        parser.add_bytes(&annex_b(&[&SPS_TIMING_NALU, &PPS_NALU, &IDR_SLICE_NALU]));
        parser.flush();

        let frame = parser.get_frame().unwrap();
        assert_eq!(frame.end - frame.start, 20_000_000);
    }

    #[test]
    fn frame_rate_fix_prefers_container_duration() {
        let mut parser = EsParser::new();
        parser.set_container_default_duration(25_000_000);
        parser.set_fix_bitstream_frame_rate(true);
        parser.add_bytes(&annex_b(&[&SPS_TIMING_NALU, &PPS_NALU, &IDR_SLICE_NALU]));
        parser.flush();

        let frame = parser.get_frame().unwrap();
        assert_eq!(frame.end - frame.start, 50_000_000);
    }

    #[test]
    fn b_frame_reordering_assigns_presentation_timestamps() {
        let mut parser = EsParser::new();
        parser.frames = vec![
            white_box_frame(FrameKind::I, 3, 0),
            white_box_frame(FrameKind::P, 3, 4),
            white_box_frame(FrameKind::B, 0, 2),
        ];
        parser.cleanup();

        // Output stays in decode order.
        let i = parser.get_frame().unwrap();
        let p = parser.get_frame().unwrap();
        let b = parser.get_frame().unwrap();

        assert_eq!(i.start, 0);
        assert_eq!(p.start, 80_000_000);
        assert_eq!(b.start, 40_000_000);

        assert_eq!(p.ref1, -80_000_000);
        assert_eq!(b.ref1, -40_000_000);
        assert_eq!(b.ref2, 40_000_000);
    }

    #[test]
    fn poc_lsb_wraparound_is_unwrapped() {
        let mut parser = EsParser::new();
        parser.frames = vec![
            white_box_frame(FrameKind::I, 3, 14),
            white_box_frame(FrameKind::P, 3, 2),
        ];
        parser.cleanup();

        // lsb 2 wraps past lsb 14, so decode and presentation order agree.
        let first = parser.get_frame().unwrap();
        let second = parser.get_frame().unwrap();
        assert_eq!(first.kind, FrameKind::I);
        assert_eq!(first.start, 0);
        assert_eq!(second.start, first.end);
    }

    #[test]
    fn poc_lsb_backward_jump_reorders() {
        let mut parser = EsParser::new();
        parser.frames = vec![
            white_box_frame(FrameKind::I, 3, 2),
            white_box_frame(FrameKind::P, 3, 14),
        ];
        parser.cleanup();

        // lsb 14 unwraps to a negative order, so it is presented first but
        // still delivered in decode order.
        let i = parser.get_frame().unwrap();
        let p = parser.get_frame().unwrap();
        assert_eq!(i.kind, FrameKind::I);
        assert_eq!(i.start, 40_000_000);
        assert_eq!(p.start, 0);
    }
}
