// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::anyhow;
use enumn::N;

use crate::bitstream_utils::BitWriter;
use crate::codec::av1::reader::Reader;
use crate::Resolution;

pub const MAX_NUM_SPATIAL_LAYERS: usize = 4;
pub const MAX_NUM_TEMPORAL_LAYERS: usize = 8;
pub const MAX_NUM_OPERATING_POINTS: usize = MAX_NUM_SPATIAL_LAYERS * MAX_NUM_TEMPORAL_LAYERS;
pub const SELECT_SCREEN_CONTENT_TOOLS: usize = 2;
pub const SELECT_INTEGER_MV: usize = 2;

/// 25 fps, used when neither the caller nor the bitstream provides a frame
/// duration.
pub const DEFAULT_FRAME_DURATION: u64 = 40_000_000;

pub enum ParsedObu<'a> {
    /// We should process the OBU normally.
    Process(Obu<'a>),
    /// We should drop this OBU and advance to the next one. The usize is how
    /// much we should advance.
    Drop(usize),
    /// The OBU's declared size exceeds the bytes buffered so far. Retry once
    /// more data has been fed.
    NotEnoughData,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObuType {
    #[default]
    Reserved = 0,
    SequenceHeader = 1,
    TemporalDelimiter = 2,
    FrameHeader = 3,
    TileGroup = 4,
    Metadata = 5,
    Frame = 6,
    RedundantFrameHeader = 7,
    TileList = 8,
    Reserved2 = 9,
    Reserved3 = 10,
    Reserved4 = 11,
    Reserved5 = 12,
    Reserved6 = 13,
    Reserved7 = 14,
    Padding = 15,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Profile {
    #[default]
    Profile0 = 0,
    Profile1 = 1,
    Profile2 = 2,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameType {
    #[default]
    KeyFrame = 0,
    InterFrame = 1,
    IntraOnlyFrame = 2,
    SwitchFrame = 3,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObuHeader {
    pub obu_type: ObuType,
    pub extension_flag: bool,
    pub has_size_field: bool,
    pub temporal_id: u32,
    pub spatial_id: u32,
}

impl ObuHeader {
    /// Length in bytes
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        if self.extension_flag {
            2
        } else {
            1
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Obu<'a> {
    /// The OBU header.
    pub header: ObuHeader,
    /// The data backing the OBU, including the header and size field.
    pub data: Cow<'a, [u8]>,
    /// Where the OBU payload starts, after the size has been read.
    pub start_offset: usize,
    /// The OBU size as per the specification after `start_offset`.
    pub size: usize,
}

impl<'a> AsRef<[u8]> for Obu<'a> {
    fn as_ref(&self) -> &[u8] {
        &self.data[self.start_offset..self.start_offset + self.size]
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperatingPoint {
    /// Specifies the level that the coded video sequence conforms to when
    /// operating point i is selected.
    pub seq_level_idx: u32,
    /// Specifies the tier that the coded video sequence conforms to when
    /// operating point i is selected.
    pub seq_tier: u32,
    /// Specifies the value of operating_point_idc for the selected operating
    /// point.
    pub idc: u32,
    /// If set, indicates that there is a decoder model associated with
    /// operating point i.
    pub decoder_model_present_for_this_op: bool,
    /// Specifies the time interval between the arrival of the first bit in the
    /// smoothing buffer and the subsequent removal of the data that belongs to
    /// the first coded frame for operating point op, measured in units of
    /// 1/90000 seconds.
    pub decoder_buffer_delay: u32,
    /// Specifies, in combination with decoder_buffer_delay, the first bit
    /// arrival time of frames to be decoded to the smoothing buffer, in units
    /// of 1/90000 seconds.
    pub encoder_buffer_delay: u32,
    /// If set, indicates that the smoothing buffer operates in low-delay mode
    /// for operating point op.
    pub low_delay_mode_flag: bool,
    /// If set, indicates that initial_display_delay_minus_1 is specified for
    /// operating point i.
    pub initial_display_delay_present_for_this_op: bool,
    /// Plus 1 specifies, for operating point i, the number of decoded frames
    /// that should be present in the buffer pool before the first presentable
    /// frame is displayed.
    pub initial_display_delay_minus_1: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimingInfo {
    /// The number of time units of a clock operating at the frequency
    /// time_scale Hz that corresponds to one increment of a clock tick
    /// counter.
    pub num_units_in_display_tick: u32,
    /// The number of time units that pass in one second.
    pub time_scale: u32,
    /// If set, indicates that pictures should be displayed according to their
    /// output order with the number of ticks between two consecutive pictures
    /// specified by num_ticks_per_picture_minus_1 + 1.
    pub equal_picture_interval: bool,
    /// Plus 1 specifies the number of clock ticks corresponding to output time
    /// between two consecutive pictures in the output order.
    pub num_ticks_per_picture_minus_1: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecoderModelInfo {
    /// Plus 1 specifies the length of the decoder_buffer_delay and the
    /// encoder_buffer_delay syntax elements, in bits.
    pub buffer_delay_length_minus_1: u32,
    /// The number of time units of a decoding clock operating at the frequency
    /// time_scale Hz that corresponds to one increment of a clock tick
    /// counter.
    pub num_units_in_decoding_tick: u32,
    /// Plus 1 specifies the length of the buffer_removal_time syntax element,
    /// in bits.
    pub buffer_removal_time_length_minus_1: u32,
    /// Plus 1 specifies the length of the frame_presentation_time syntax
    /// element, in bits.
    pub frame_presentation_time_length_minus_1: u32,
}

/// Defined by the “Color primaries” section of ISO/IEC 23091-4/ITU-T H.273
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ColorPrimaries {
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Bt470M = 4,
    Bt470bg = 5,
    Bt601 = 6,
    Smpte240 = 7,
    GenericFilm = 8,
    Bt2020 = 9,
    Xyz = 10,
    Smpte431 = 11,
    Smpte432 = 12,
    Ebu3213 = 22,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransferCharacteristics {
    Reserved0 = 0,
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Reserved3 = 3,
    Bt470m = 4,
    Bt470bg = 5,
    Bt601 = 6,
    Smpte240 = 7,
    Linear = 8,
    Log100 = 9,
    Log100Sqrt10 = 10,
    Iec61966 = 11,
    Bt1361 = 12,
    Srgb = 13,
    Bt202010Bit = 14,
    Bt202012Bit = 15,
    Smpte2084 = 16,
    Smpte428 = 17,
    Hlg = 18,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum BitDepth {
    #[default]
    Depth8,
    Depth10,
    Depth12,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatrixCoefficients {
    Identity = 0,
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Reserved3 = 3,
    Fcc = 4,
    Bt470bg = 5,
    Bt601 = 6,
    Smpte240 = 7,
    Ycgco = 8,
    Bt2020Ncl = 9,
    Bt2020Cl = 10,
    Smpte2085 = 11,
    ChromaDerivedNcl = 12,
    ChromaDerivedCl = 13,
    Ictcp = 14,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChromaSamplePosition {
    #[default]
    Unknown = 0,
    Vertical = 1,
    Colocated = 2,
    Reserved = 3,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColorConfig {
    /// Syntax elements which, together with seq_profile, determine the bit
    /// depth.
    pub high_bitdepth: bool,
    /// Syntax elements which, together with seq_profile, determine the bit
    /// depth.
    pub twelve_bit: bool,
    /// If set, indicates that the video does not contain U and V color planes.
    pub mono_chrome: bool,
    /// If set, specifies that color_primaries, transfer_characteristics, and
    /// matrix_coefficients are present.
    pub color_description_present_flag: bool,
    /// Defined by the “Color primaries” section of ISO/IEC 23091-4/ITU-T H.273.
    pub color_primaries: ColorPrimaries,
    /// Defined by the “Transfer characteristics” section of ISO/IEC
    /// 23091-4/ITU-T H.273.
    pub transfer_characteristics: TransferCharacteristics,
    /// Defined by the “Matrix coefficients” section of ISO/IEC 23091-4/ITU-T
    /// H.273.
    pub matrix_coefficients: MatrixCoefficients,
    /// Binary value associated with the VideoFullRangeFlag variable specified
    /// in ISO/IEC 23091-4/ITU-T H.273.
    pub color_range: bool,
    /// Specify the chroma subsampling format
    pub subsampling_x: bool,
    /// Specify the chroma subsampling format
    pub subsampling_y: bool,
    /// Specifies the sample position for subsampled streams
    pub chroma_sample_position: ChromaSamplePosition,
    /// If set, indicates that the U and V planes may have separate delta
    /// quantizer values.
    pub separate_uv_delta_q: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceHeaderObu {
    /// The OBU header from the OBU that generated this sequence.
    pub obu_header: ObuHeader,
    /// Specifies the features that can be used in the coded video sequence.
    pub seq_profile: Profile,
    /// If set, specifies that the coded video sequence contains only one coded
    /// frame.
    pub still_picture: bool,
    /// Specifies that the syntax elements not needed by a still picture are
    /// omitted.
    pub reduced_still_picture_header: bool,

    pub timing_info_present_flag: bool,
    pub timing_info: TimingInfo,
    pub decoder_model_info_present_flag: bool,
    pub decoder_model_info: DecoderModelInfo,
    pub initial_display_delay_present_flag: bool,
    pub operating_points_cnt_minus_1: u32,
    pub operating_points: [OperatingPoint; MAX_NUM_OPERATING_POINTS],

    /// Specifies the number of bits minus 1 used for transmitting the frame
    /// width syntax elements.
    pub frame_width_bits_minus_1: u32,
    /// Specifies the number of bits minus 1 used for transmitting the frame
    /// height syntax elements.
    pub frame_height_bits_minus_1: u32,
    /// Specifies the maximum frame width minus 1 for the frames represented by
    /// this sequence header.
    pub max_frame_width_minus_1: u32,
    /// Specifies the maximum frame height minus 1 for the frames represented
    /// by this sequence header.
    pub max_frame_height_minus_1: u32,
    /// Specifies whether frame id numbers are present in the coded video
    /// sequence.
    pub frame_id_numbers_present_flag: bool,
    /// Specifies the number of bits minus 2 used to encode delta_frame_id
    /// syntax elements.
    pub delta_frame_id_length_minus_2: u32,
    /// Used to calculate the number of bits used to encode the frame_id syntax
    /// element.
    pub additional_frame_id_length_minus_1: u32,

    pub use_128x128_superblock: bool,
    pub enable_filter_intra: bool,
    pub enable_intra_edge_filter: bool,
    pub enable_interintra_compound: bool,
    pub enable_masked_compound: bool,
    pub enable_warped_motion: bool,
    pub enable_order_hint: bool,
    pub enable_dual_filter: bool,
    pub enable_jnt_comp: bool,
    pub enable_ref_frame_mvs: bool,
    pub seq_choose_screen_content_tools: bool,
    pub seq_force_screen_content_tools: u32,
    pub seq_choose_integer_mv: bool,
    pub seq_force_integer_mv: u32,
    pub order_hint_bits: u32,
    pub enable_superres: bool,
    pub enable_cdef: bool,
    pub enable_restoration: bool,

    /// The bit depth derived from the color config and profile.
    pub bit_depth: BitDepth,
    /// 1 for monochrome streams, 3 otherwise.
    pub num_planes: u32,
    pub color_config: ColorConfig,
    pub film_grain_params_present: bool,
}

/// A frame cut from the stream at temporal-delimiter boundaries, ready to be
/// written into a container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    /// The verbatim bytes of all retained OBUs for this frame, with the
    /// sequence header OBU prepended for keyframes that did not carry one.
    pub data: Vec<u8>,
    pub keyframe: bool,
    /// Synthetic timestamp in nanoseconds.
    pub timestamp: u64,
}

#[derive(Default)]
struct CurrentFrame {
    data: Vec<u8>,
    keyframe: bool,
    contains_sequence_header: bool,
}

/// A streaming parser for AV1 elementary streams in low-overhead bitstream
/// format.
///
/// Callers feed arbitrary chunks of data with [`Parser::parse`] and drain
/// finished frames with [`Parser::next_frame`]. Incomplete trailing bytes are
/// retained across calls.
#[derive(Default)]
pub struct Parser {
    /// Unconsumed bytes carried over between `parse` calls.
    buffer: Vec<u8>,

    sequence_header: Option<Rc<SequenceHeaderObu>>,
    /// The verbatim bytes of the last sequence header OBU seen.
    sequence_header_obu_bytes: Option<Vec<u8>>,
    /// Metadata OBUs seen before the first frame, replayed in `av1c()`.
    metadata_obus: Vec<Vec<u8>>,

    current_frame: CurrentFrame,
    frames: VecDeque<Frame>,
    /// Number of frames flushed so far, used for synthetic timestamps.
    frame_number: u64,

    frame_found: bool,
    operating_point_idc: u32,

    forced_default_duration: Option<u64>,
    parse_sequence_header_obus_only: bool,
}

impl Parser {
    pub fn new() -> Self {
        Default::default()
    }

    /// Overrides the frame duration used for synthetic timestamps.
    pub fn set_default_duration(&mut self, duration: u64) {
        self.forced_default_duration = Some(duration);
    }

    /// Only track sequence headers, do not accumulate frames. Useful when
    /// probing a stream for its parameters.
    pub fn set_parse_sequence_header_obus_only(&mut self, enable: bool) {
        self.parse_sequence_header_obus_only = enable;
    }

    pub fn sequence_header(&self) -> Option<&Rc<SequenceHeaderObu>> {
        self.sequence_header.as_ref()
    }

    /// Whether enough of the stream has been seen to describe it: a sequence
    /// header and at least one frame.
    pub fn headers_parsed(&self) -> bool {
        self.sequence_header.is_some() && self.frame_found
    }

    pub fn frame_available(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn next_frame(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    pub fn pixel_dimensions(&self) -> Option<Resolution> {
        self.sequence_header.as_ref().map(|s| Resolution {
            width: s.max_frame_width_minus_1 + 1,
            height: s.max_frame_height_minus_1 + 1,
        })
    }

    /// The frame duration signalled by the bitstream's timing info, if any.
    pub fn frame_duration(&self) -> Option<u64> {
        let s = self.sequence_header.as_ref()?;
        let ti = &s.timing_info;
        if !s.timing_info_present_flag || !ti.equal_picture_interval || ti.time_scale == 0 {
            return None;
        }

        let duration = 1_000_000_000u128
            * u128::from(ti.num_units_in_display_tick)
            * u128::from(ti.num_ticks_per_picture_minus_1 + 1)
            / u128::from(ti.time_scale);
        Some(duration as u64)
    }

    /// The duration used for synthetic timestamps: a forced value if set, the
    /// bitstream timing info if present, 25 fps otherwise.
    pub fn default_duration(&self) -> u64 {
        self.forced_default_duration
            .or_else(|| self.frame_duration())
            .unwrap_or(DEFAULT_FRAME_DURATION)
    }

    /// Feeds `bytes` to the parser. Completed frames become available through
    /// [`Parser::next_frame`]; trailing bytes that do not yet form a complete
    /// OBU are retained for the next call. Malformed input ends the pass
    /// without consuming the offending bytes.
    pub fn parse(&mut self, bytes: &[u8]) {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(bytes);

        let mut pos = 0;
        while pos < buffer.len() {
            match self.next_obu(&buffer[pos..]) {
                Ok(ParsedObu::NotEnoughData) => break,
                Ok(ParsedObu::Drop(len)) => pos += len,
                Ok(ParsedObu::Process(obu)) => {
                    let len = obu.start_offset + obu.size;
                    match self.process_obu(&obu) {
                        Ok(true) => pos += len,
                        Ok(false) => break,
                        Err(err) => {
                            log::debug!("stopping parse pass: {}", err);
                            break;
                        }
                    }
                }
                Err(err) => {
                    log::debug!("stopping parse pass: {}", err);
                    break;
                }
            }
        }

        buffer.drain(..pos);
        self.buffer = buffer;
    }

    /// Completes the pending frame, if any. Call at end of stream, where no
    /// further temporal delimiter will arrive.
    pub fn flush(&mut self) {
        self.flush_current_frame();
    }

    fn parse_obu_header(r: &mut Reader) -> anyhow::Result<ObuHeader> {
        let obu_forbidden_bit = r.read_bit()?;
        if obu_forbidden_bit {
            return Err(anyhow!("forbidden bit set in OBU header"));
        }

        let mut header = ObuHeader {
            obu_type: ObuType::n(r.read_bits::<u32>(4)?).ok_or(anyhow!("Invalid OBU type"))?,
            extension_flag: r.read_bit()?,
            has_size_field: r.read_bit()?,
            temporal_id: Default::default(),
            spatial_id: Default::default(),
        };

        let _obu_reserved_1bit = r.read_bit()?;

        if header.extension_flag {
            header.temporal_id = r.read_bits(3)?;
            header.spatial_id = r.read_bits(2)?;
            let _ = r.read_bits::<u32>(3)?;
        }

        Ok(header)
    }

    /// Extracts the next OBU from the start of `data` without consuming it.
    fn next_obu<'a>(&mut self, data: &'a [u8]) -> anyhow::Result<ParsedObu<'a>> {
        let first = match data.first() {
            None => return Ok(ParsedObu::NotEnoughData),
            Some(byte) => *byte,
        };

        if first & 0x80 != 0 {
            return Err(anyhow!("forbidden bit set in OBU header"));
        }
        if first & 0x02 == 0 {
            return Err(anyhow!("OBU without a size field is not supported"));
        }

        // Make sure the header and the whole leb128 size field are buffered
        // before handing them to the bit reader.
        let header_len = 1 + usize::from(first & 0x04 != 0);
        let mut size_field_len = 0;
        loop {
            if size_field_len == 8 {
                return Err(anyhow!("obu_size leb128 spans more than 8 bytes"));
            }
            match data.get(header_len + size_field_len) {
                None => return Ok(ParsedObu::NotEnoughData),
                Some(byte) => {
                    size_field_len += 1;
                    if byte & 0x80 == 0 {
                        break;
                    }
                }
            }
        }

        let mut reader = Reader::new(data);
        let header = Self::parse_obu_header(&mut reader)?;
        let obu_size = reader.read_leb128()? as usize;

        assert!(reader.position() % 8 == 0);
        let start_offset = (reader.position() / 8) as usize;

        if data.len() < start_offset + obu_size {
            return Ok(ParsedObu::NotEnoughData);
        }

        if header.obu_type != ObuType::SequenceHeader
            && header.obu_type != ObuType::TemporalDelimiter
            && self.operating_point_idc != 0
            && header.extension_flag
        {
            let in_temporal_layer = ((self.operating_point_idc >> header.temporal_id) & 1) != 0;
            let in_spatial_layer = ((self.operating_point_idc >> (header.spatial_id + 8)) & 1) != 0;
            if !in_temporal_layer || !in_spatial_layer {
                log::debug!("dropping OBU for an unselected scalability layer");
                return Ok(ParsedObu::Drop(start_offset + obu_size));
            }
        }

        Ok(ParsedObu::Process(Obu {
            header,
            data: Cow::from(&data[..start_offset + obu_size]),
            start_offset,
            size: obu_size,
        }))
    }

    /// Updates the parser state with one complete OBU. Returns `Ok(false)` if
    /// the OBU cannot be processed yet and the pass must stop without
    /// consuming it.
    fn process_obu(&mut self, obu: &Obu) -> anyhow::Result<bool> {
        log::debug!("OBU type {:?}, size {}", obu.header.obu_type, obu.size);

        if self.parse_sequence_header_obus_only {
            if matches!(obu.header.obu_type, ObuType::SequenceHeader) {
                self.parse_sequence_header_obu(obu)?;
            }
            return Ok(true);
        }

        let mut keep_obu = true;
        match obu.header.obu_type {
            ObuType::TemporalDelimiter => {
                self.flush_current_frame();
                keep_obu = false;
            }
            ObuType::Padding | ObuType::RedundantFrameHeader => keep_obu = false,
            ObuType::SequenceHeader => {
                self.parse_sequence_header_obu(obu)?;
                self.current_frame.contains_sequence_header = true;
            }
            ObuType::FrameHeader | ObuType::Frame => {
                if self.sequence_header.is_none() {
                    log::debug!("frame data before a sequence header");
                    return Ok(false);
                }
                // The last frame header in the temporal unit decides the
                // frame type.
                self.current_frame.keyframe = self.frame_is_keyframe(obu.as_ref())?;
                self.frame_found = true;
            }
            ObuType::Metadata => {
                if !self.frame_found {
                    self.metadata_obus.push(obu.data.to_vec());
                }
            }
            _ => (),
        }

        if keep_obu {
            self.current_frame.data.extend_from_slice(&obu.data);
        }
        Ok(true)
    }

    /// Reads just enough of a frame header to classify the frame.
    fn frame_is_keyframe(&self, payload: &[u8]) -> anyhow::Result<bool> {
        let reduced = self
            .sequence_header
            .as_ref()
            .map(|s| s.reduced_still_picture_header)
            .unwrap_or(false);
        if reduced {
            // frame_type is implied to be KEY_FRAME.
            return Ok(true);
        }

        let mut r = Reader::new(payload);
        let show_existing_frame = r.read_bit()?;
        if show_existing_frame {
            return Ok(false);
        }

        let frame_type: u32 = r.read_bits(2)?;
        Ok(frame_type == FrameType::KeyFrame as u32)
    }

    fn flush_current_frame(&mut self) {
        if self.current_frame.data.is_empty() {
            return;
        }

        let current = std::mem::take(&mut self.current_frame);

        let mut data = Vec::new();
        if current.keyframe && !current.contains_sequence_header {
            // Keyframes must be decodable on their own.
            if let Some(seq_obu) = &self.sequence_header_obu_bytes {
                data.extend_from_slice(seq_obu);
            }
        }
        data.extend_from_slice(&current.data);

        let timestamp = self.default_duration() * self.frame_number;
        self.frame_number += 1;

        self.frames.push_back(Frame {
            data,
            keyframe: current.keyframe,
            timestamp,
        });
    }

    fn parse_color_config(s: &mut SequenceHeaderObu, r: &mut Reader) -> anyhow::Result<()> {
        let cc = &mut s.color_config;

        cc.high_bitdepth = r.read_bit()?;
        if s.seq_profile as u32 == 2 && cc.high_bitdepth {
            cc.twelve_bit = r.read_bit()?;
            if cc.twelve_bit {
                s.bit_depth = BitDepth::Depth12;
            } else {
                s.bit_depth = BitDepth::Depth10;
            }
        } else if s.seq_profile as u32 <= 2 {
            s.bit_depth = if cc.high_bitdepth {
                BitDepth::Depth10
            } else {
                BitDepth::Depth8
            };
        }

        if s.seq_profile as u32 == 1 {
            cc.mono_chrome = false;
        } else {
            cc.mono_chrome = r.read_bit()?;
        }

        if cc.mono_chrome {
            s.num_planes = 1;
        } else {
            s.num_planes = 3;
        }

        cc.color_description_present_flag = r.read_bit()?;
        if cc.color_description_present_flag {
            cc.color_primaries = ColorPrimaries::n(r.read_bits::<u32>(8)?)
                .ok_or(anyhow!("Invalid color_primaries"))?;
            cc.transfer_characteristics = TransferCharacteristics::n(r.read_bits::<u32>(8)?)
                .ok_or(anyhow!("Invalid transfer_characteristics"))?;
            cc.matrix_coefficients = MatrixCoefficients::n(r.read_bits::<u32>(8)?)
                .ok_or(anyhow!("Invalid matrix_coefficients"))?;
        } else {
            cc.color_primaries = ColorPrimaries::Unspecified;
            cc.transfer_characteristics = TransferCharacteristics::Unspecified;
            cc.matrix_coefficients = MatrixCoefficients::Unspecified;
        }

        if cc.mono_chrome {
            cc.color_range = r.read_bit()?;
            cc.subsampling_x = true;
            cc.subsampling_y = true;
            cc.chroma_sample_position = ChromaSamplePosition::Unknown;
            cc.separate_uv_delta_q = false;
            return Ok(());
        } else if matches!(cc.color_primaries, ColorPrimaries::Bt709)
            && matches!(cc.transfer_characteristics, TransferCharacteristics::Srgb)
            && matches!(cc.matrix_coefficients, MatrixCoefficients::Identity)
        {
            cc.color_range = true;
            cc.subsampling_x = false;
            cc.subsampling_y = false;
        } else {
            cc.color_range = r.read_bit()?;
            if s.seq_profile as u32 == 0 {
                cc.subsampling_x = true;
                cc.subsampling_y = true;
            } else if s.seq_profile as u32 == 1 {
                cc.subsampling_x = false;
                cc.subsampling_y = false;
            } else if matches!(s.bit_depth, BitDepth::Depth12) {
                cc.subsampling_x = r.read_bit()?;
                if cc.subsampling_x {
                    cc.subsampling_y = r.read_bit()?;
                } else {
                    cc.subsampling_y = false;
                }
            } else {
                cc.subsampling_x = true;
                cc.subsampling_y = false;
            }

            if cc.subsampling_x && cc.subsampling_y {
                cc.chroma_sample_position = ChromaSamplePosition::n(r.read_bits::<u32>(2)?)
                    .ok_or(anyhow!("Invalid chroma_sample_position"))?;
            }
        }

        cc.separate_uv_delta_q = r.read_bit()?;

        Ok(())
    }

    fn parse_operating_parameters_info(
        opi: &mut OperatingPoint,
        r: &mut Reader,
        buffer_delay_length_minus_1: u32,
    ) -> anyhow::Result<()> {
        let n = usize::try_from(buffer_delay_length_minus_1 + 1)?;
        opi.decoder_buffer_delay = r.read_bits(n)?;
        opi.encoder_buffer_delay = r.read_bits(n)?;
        opi.low_delay_mode_flag = r.read_bit()?;
        Ok(())
    }

    fn parse_decoder_model_info(dmi: &mut DecoderModelInfo, r: &mut Reader) -> anyhow::Result<()> {
        dmi.buffer_delay_length_minus_1 = r.read_bits(5)?;
        dmi.num_units_in_decoding_tick = r.read_bits(32)?;
        dmi.buffer_removal_time_length_minus_1 = r.read_bits(5)?;
        dmi.frame_presentation_time_length_minus_1 = r.read_bits(5)?;
        Ok(())
    }

    fn parse_timing_info(ti: &mut TimingInfo, r: &mut Reader) -> anyhow::Result<()> {
        ti.num_units_in_display_tick = r.read_bits(32)?;
        ti.time_scale = r.read_bits(32)?;
        ti.equal_picture_interval = r.read_bit()?;
        if ti.equal_picture_interval {
            ti.num_ticks_per_picture_minus_1 = r.read_uvlc()?;
        }
        Ok(())
    }

    pub fn parse_sequence_header_obu(
        &mut self,
        obu: &Obu,
    ) -> anyhow::Result<Rc<SequenceHeaderObu>> {
        if !matches!(obu.header.obu_type, ObuType::SequenceHeader) {
            return Err(anyhow!(
                "Expected a SequenceHeaderOBU, got {:?}",
                obu.header.obu_type
            ));
        }

        let mut s = SequenceHeaderObu {
            obu_header: obu.header.clone(),
            ..Default::default()
        };

        let mut r = Reader::new(obu.as_ref());
        let profile = r.read_bits::<u32>(3)?;

        s.seq_profile = Profile::n(profile).ok_or(anyhow!("Invalid profile {}", profile))?;
        s.still_picture = r.read_bit()?;
        s.reduced_still_picture_header = r.read_bit()?;

        if s.reduced_still_picture_header {
            s.timing_info_present_flag = false;
            s.decoder_model_info_present_flag = false;
            s.initial_display_delay_present_flag = false;
            s.operating_points_cnt_minus_1 = 0;
            s.operating_points[0].idc = 0;
            s.operating_points[0].seq_level_idx = r.read_bits(5)?;
            s.operating_points[0].seq_tier = 0;
            s.operating_points[0].decoder_model_present_for_this_op = false;
            s.operating_points[0].initial_display_delay_present_for_this_op = false;
        } else {
            s.timing_info_present_flag = r.read_bit()?;
            if s.timing_info_present_flag {
                Self::parse_timing_info(&mut s.timing_info, &mut r)?;
                s.decoder_model_info_present_flag = r.read_bit()?;
                if s.decoder_model_info_present_flag {
                    Self::parse_decoder_model_info(&mut s.decoder_model_info, &mut r)?;
                }
            } else {
                s.decoder_model_info_present_flag = false;
            }

            s.initial_display_delay_present_flag = r.read_bit()?;
            s.operating_points_cnt_minus_1 = r.read_bits(5)?;
            if s.operating_points_cnt_minus_1 >= MAX_NUM_OPERATING_POINTS as u32 {
                return Err(anyhow!(
                    "Invalid operating_points_cnt_minus_1 {}",
                    s.operating_points_cnt_minus_1
                ));
            }

            for i in 0..=s.operating_points_cnt_minus_1 as usize {
                s.operating_points[i].idc = r.read_bits(12)?;
                s.operating_points[i].seq_level_idx = r.read_bits(5)?;
                if s.operating_points[i].seq_level_idx > 7 {
                    s.operating_points[i].seq_tier = u32::from(r.read_bit()?);
                } else {
                    s.operating_points[i].seq_tier = 0;
                }
                if s.decoder_model_info_present_flag {
                    s.operating_points[i].decoder_model_present_for_this_op = r.read_bit()?;
                    if s.operating_points[i].decoder_model_present_for_this_op {
                        let buffer_delay_length_minus_1 =
                            s.decoder_model_info.buffer_delay_length_minus_1;
                        Self::parse_operating_parameters_info(
                            &mut s.operating_points[i],
                            &mut r,
                            buffer_delay_length_minus_1,
                        )?;
                    }
                } else {
                    s.operating_points[i].decoder_model_present_for_this_op = false;
                }

                if s.initial_display_delay_present_flag {
                    s.operating_points[i].initial_display_delay_present_for_this_op =
                        r.read_bit()?;
                    if s.operating_points[i].initial_display_delay_present_for_this_op {
                        s.operating_points[i].initial_display_delay_minus_1 = r.read_bits(4)?;
                    }
                }
            }
        }

        s.frame_width_bits_minus_1 = r.read_bits(4)?;
        s.frame_height_bits_minus_1 = r.read_bits(4)?;
        s.max_frame_width_minus_1 =
            r.read_bits(s.frame_width_bits_minus_1 as usize + 1)?;
        s.max_frame_height_minus_1 =
            r.read_bits(s.frame_height_bits_minus_1 as usize + 1)?;
        if s.reduced_still_picture_header {
            s.frame_id_numbers_present_flag = false;
        } else {
            s.frame_id_numbers_present_flag = r.read_bit()?;
        }
        if s.frame_id_numbers_present_flag {
            s.delta_frame_id_length_minus_2 = r.read_bits(4)?;
            s.additional_frame_id_length_minus_1 = r.read_bits(3)?;
            let frame_id_length =
                s.additional_frame_id_length_minus_1 + s.delta_frame_id_length_minus_2 + 3;
            if frame_id_length > 16 {
                return Err(anyhow!("Invalid frame_id_length {}", frame_id_length));
            }
        }

        s.use_128x128_superblock = r.read_bit()?;
        s.enable_filter_intra = r.read_bit()?;
        s.enable_intra_edge_filter = r.read_bit()?;
        if s.reduced_still_picture_header {
            s.enable_interintra_compound = false;
            s.enable_masked_compound = false;
            s.enable_warped_motion = false;
            s.enable_dual_filter = false;
            s.enable_order_hint = false;
            s.enable_jnt_comp = false;
            s.enable_ref_frame_mvs = false;
            s.seq_force_screen_content_tools = SELECT_SCREEN_CONTENT_TOOLS as _;
            s.seq_force_integer_mv = SELECT_INTEGER_MV as _;
            s.order_hint_bits = 0;
        } else {
            s.enable_interintra_compound = r.read_bit()?;
            s.enable_masked_compound = r.read_bit()?;
            s.enable_warped_motion = r.read_bit()?;
            s.enable_dual_filter = r.read_bit()?;
            s.enable_order_hint = r.read_bit()?;
            if s.enable_order_hint {
                s.enable_jnt_comp = r.read_bit()?;
                s.enable_ref_frame_mvs = r.read_bit()?;
            } else {
                s.enable_jnt_comp = false;
                s.enable_ref_frame_mvs = false;
            }
            s.seq_choose_screen_content_tools = r.read_bit()?;
            if s.seq_choose_screen_content_tools {
                s.seq_force_screen_content_tools = SELECT_SCREEN_CONTENT_TOOLS as _;
            } else {
                s.seq_force_screen_content_tools = r.read_bit()? as _;
            }
            if s.seq_force_screen_content_tools > 0 {
                s.seq_choose_integer_mv = r.read_bit()?;
                if s.seq_choose_integer_mv {
                    s.seq_force_integer_mv = SELECT_INTEGER_MV as _;
                } else {
                    s.seq_force_integer_mv = r.read_bit()? as _;
                }
            } else {
                s.seq_force_integer_mv = SELECT_INTEGER_MV as _;
            }

            if s.enable_order_hint {
                s.order_hint_bits = r.read_bits::<u32>(3)? + 1;
            } else {
                s.order_hint_bits = 0;
            }
        }

        s.enable_superres = r.read_bit()?;
        s.enable_cdef = r.read_bit()?;
        s.enable_restoration = r.read_bit()?;

        Self::parse_color_config(&mut s, &mut r)?;

        s.film_grain_params_present = r.read_bit()?;

        // Only operating point 0 is selected for layer filtering.
        self.operating_point_idc = s.operating_points[0].idc;

        let rc = Rc::new(s);
        self.sequence_header = Some(rc.clone());
        self.sequence_header_obu_bytes = Some(obu.data.to_vec());

        Ok(rc)
    }

    /// Classifies already-emitted frame bytes, without touching the streaming
    /// state. show_existing_frame and non-KEY frame types are not keyframes.
    pub fn is_keyframe(&self, data: &[u8]) -> bool {
        let reduced = self
            .sequence_header
            .as_ref()
            .map(|s| s.reduced_still_picture_header)
            .unwrap_or(false);

        let mut walk = || -> anyhow::Result<bool> {
            let mut r = Reader::new(data);
            while r.more_data_in_bitstream() {
                let header = Self::parse_obu_header(&mut r)?;
                if !header.has_size_field {
                    return Err(anyhow!("OBU without a size field"));
                }
                let size = r.read_leb128()? as usize;

                match header.obu_type {
                    ObuType::Frame | ObuType::FrameHeader => {
                        if reduced {
                            return Ok(true);
                        }
                        let show_existing_frame = r.read_bit()?;
                        if show_existing_frame {
                            return Ok(false);
                        }
                        let frame_type: u32 = r.read_bits(2)?;
                        return Ok(frame_type == FrameType::KeyFrame as u32);
                    }
                    _ => r.skip_bits(size * 8)?,
                }
            }
            Ok(false)
        };

        walk().unwrap_or(false)
    }

    /// Builds the AV1CodecConfigurationRecord for the stream: the 4-byte
    /// fixed header followed by the verbatim sequence header OBU and any
    /// metadata OBUs seen before the first frame. `None` until a sequence
    /// header has been parsed.
    pub fn av1c(&self) -> Option<Vec<u8>> {
        let s = self.sequence_header.as_ref()?;
        let seq_obu = self.sequence_header_obu_bytes.as_ref()?;

        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            let mut write = || -> crate::bitstream_utils::BitWriterResult<()> {
                w.write_f(1, 1u32)?; // marker
                w.write_f(7, 1u32)?; // version
                w.write_f(3, s.seq_profile as u32)?;
                w.write_f(5, s.operating_points[0].seq_level_idx)?;
                w.write_f(1, s.operating_points[0].seq_tier)?;
                w.write_bit(s.color_config.high_bitdepth)?;
                w.write_bit(s.color_config.twelve_bit)?;
                w.write_bit(s.color_config.mono_chrome)?;
                w.write_bit(s.color_config.subsampling_x)?;
                w.write_bit(s.color_config.subsampling_y)?;
                w.write_f(2, s.color_config.chroma_sample_position as u32)?;
                w.write_f(3, 0u32)?; // reserved
                w.write_f(1, 0u32)?; // initial_presentation_delay_present
                w.write_f(4, 0u32)?; // reserved
                w.flush()?;
                Ok(())
            };
            write().ok()?;
        }

        buf.extend_from_slice(seq_obu);
        for metadata in &self.metadata_obus {
            buf.extend_from_slice(metadata);
        }

        Some(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Profile 0, no timing info, one operating point with idc 0, 64x64,
    // 8-bit 4:2:0.
    const SEQUENCE_HEADER_OBU: [u8; 11] = [
        0x0a, 0x09, 0x00, 0x00, 0x00, 0x02, 0xaf, 0xff, 0x80, 0x00, 0x00,
    ];
    // Same sequence header, but operating point 0 declares
    // operating_point_idc 0x101 (temporal layer 0, spatial layer 0 only).
    const SEQUENCE_HEADER_OBU_SCALABLE: [u8; 11] = [
        0x0a, 0x09, 0x00, 0x01, 0x01, 0x02, 0xaf, 0xff, 0x80, 0x00, 0x00,
    ];
    const TEMPORAL_DELIMITER_OBU: [u8; 2] = [0x12, 0x00];
    // frame_type KEY_FRAME, show_existing_frame unset.
    const KEY_FRAME_OBU: [u8; 4] = [0x32, 0x02, 0x10, 0x00];
    // frame_type INTER_FRAME.
    const INTER_FRAME_OBU: [u8; 4] = [0x32, 0x02, 0x30, 0x00];

    fn minimal_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend_from_slice(&TEMPORAL_DELIMITER_OBU);
        stream.extend_from_slice(&SEQUENCE_HEADER_OBU);
        stream.extend_from_slice(&KEY_FRAME_OBU);
        stream.extend_from_slice(&TEMPORAL_DELIMITER_OBU);
        stream
    }

    #[test]
    fn parse_minimal_stream() {
        let mut parser = Parser::new();
        parser.parse(&minimal_stream());

        assert!(parser.headers_parsed());
        assert!(parser.frame_available());

        let frame = parser.next_frame().unwrap();
        assert!(frame.keyframe);
        assert_eq!(frame.timestamp, 0);

        // The frame holds the sequence header and frame OBUs, byte for byte.
        let mut expected = Vec::new();
        expected.extend_from_slice(&SEQUENCE_HEADER_OBU);
        expected.extend_from_slice(&KEY_FRAME_OBU);
        assert_eq!(frame.data, expected);

        assert_eq!(
            parser.pixel_dimensions().unwrap(),
            Resolution {
                width: 64,
                height: 64
            }
        );

        let sequence = parser.sequence_header().unwrap();
        assert_eq!(sequence.seq_profile, Profile::Profile0);
        assert_eq!(sequence.bit_depth, BitDepth::Depth8);
        assert!(sequence.color_config.subsampling_x);
        assert!(sequence.color_config.subsampling_y);
    }

    #[test]
    fn synthetic_timestamps() {
        let mut parser = Parser::new();
        let mut stream = minimal_stream();
        stream.extend_from_slice(&INTER_FRAME_OBU);
        stream.extend_from_slice(&TEMPORAL_DELIMITER_OBU);
        parser.parse(&stream);

        // 25 fps fallback.
        assert_eq!(parser.next_frame().unwrap().timestamp, 0);
        let second = parser.next_frame().unwrap();
        assert!(!second.keyframe);
        assert_eq!(second.timestamp, 40_000_000);

        let mut parser = Parser::new();
        parser.set_default_duration(10_000_000);
        parser.parse(&stream);
        parser.next_frame().unwrap();
        assert_eq!(parser.next_frame().unwrap().timestamp, 10_000_000);
    }

    #[test]
    fn partial_input() {
        let stream = minimal_stream();

        for split in 0..stream.len() {
            let mut parser = Parser::new();
            parser.parse(&stream[..split]);
            parser.parse(&stream[split..]);

            let frame = parser.next_frame().expect("no frame for split input");
            assert!(frame.keyframe);
            let mut expected = Vec::new();
            expected.extend_from_slice(&SEQUENCE_HEADER_OBU);
            expected.extend_from_slice(&KEY_FRAME_OBU);
            assert_eq!(frame.data, expected, "split at {}", split);
        }
    }

    #[test]
    fn frame_before_sequence_header_is_retained() {
        let mut parser = Parser::new();
        parser.parse(&TEMPORAL_DELIMITER_OBU);
        // A frame with no sequence header yet cannot be processed.
        parser.parse(&KEY_FRAME_OBU);
        assert!(!parser.frame_available());

        // The sequence header cannot heal this stream since it arrives after
        // the retained frame bytes, but parsing must not panic or lose the
        // ability to report state.
        parser.parse(&TEMPORAL_DELIMITER_OBU);
        assert!(!parser.headers_parsed());
    }

    #[test]
    fn keyframe_without_sequence_header_gets_one_prepended() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&TEMPORAL_DELIMITER_OBU);
        stream.extend_from_slice(&SEQUENCE_HEADER_OBU);
        stream.extend_from_slice(&INTER_FRAME_OBU);
        stream.extend_from_slice(&TEMPORAL_DELIMITER_OBU);
        // Second keyframe comes without its own sequence header.
        stream.extend_from_slice(&KEY_FRAME_OBU);
        stream.extend_from_slice(&TEMPORAL_DELIMITER_OBU);

        let mut parser = Parser::new();
        parser.parse(&stream);

        let first = parser.next_frame().unwrap();
        assert!(!first.keyframe);

        let second = parser.next_frame().unwrap();
        assert!(second.keyframe);
        let mut expected = Vec::new();
        expected.extend_from_slice(&SEQUENCE_HEADER_OBU);
        expected.extend_from_slice(&KEY_FRAME_OBU);
        assert_eq!(second.data, expected);
    }

    #[test]
    fn last_frame_header_in_temporal_unit_wins() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&TEMPORAL_DELIMITER_OBU);
        stream.extend_from_slice(&SEQUENCE_HEADER_OBU);
        stream.extend_from_slice(&KEY_FRAME_OBU);
        stream.extend_from_slice(&INTER_FRAME_OBU);
        stream.extend_from_slice(&TEMPORAL_DELIMITER_OBU);

        let mut parser = Parser::new();
        parser.parse(&stream);

        let frame = parser.next_frame().unwrap();
        assert!(!frame.keyframe);

        let mut expected = Vec::new();
        expected.extend_from_slice(&SEQUENCE_HEADER_OBU);
        expected.extend_from_slice(&KEY_FRAME_OBU);
        expected.extend_from_slice(&INTER_FRAME_OBU);
        assert_eq!(frame.data, expected);
    }

    #[test]
    fn structural_errors_end_the_pass() {
        // Forbidden bit set.
        let mut parser = Parser::new();
        parser.parse(&[0x80, 0x00]);
        assert!(!parser.frame_available());

        // OBU without a size field.
        let mut parser = Parser::new();
        parser.parse(&[0x30, 0x00]);
        assert!(!parser.frame_available());
    }

    #[test]
    fn truncated_obu_is_retained() {
        let stream = minimal_stream();
        let mut parser = Parser::new();

        // Cut in the middle of the sequence header payload.
        parser.parse(&stream[..8]);
        assert!(parser.sequence_header().is_none());

        parser.parse(&stream[8..]);
        assert!(parser.headers_parsed());
        assert!(parser.frame_available());
    }

    #[test]
    fn scalability_layers_are_filtered() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&TEMPORAL_DELIMITER_OBU);
        stream.extend_from_slice(&SEQUENCE_HEADER_OBU_SCALABLE);
        stream.extend_from_slice(&KEY_FRAME_OBU);
        // Frame OBU with an extension header selecting temporal_id 1, which
        // operating_point_idc 0x101 does not include.
        stream.extend_from_slice(&[0x36, 0x20, 0x02, 0x30, 0x00]);
        stream.extend_from_slice(&TEMPORAL_DELIMITER_OBU);

        let mut parser = Parser::new();
        parser.parse(&stream);

        let frame = parser.next_frame().unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&SEQUENCE_HEADER_OBU_SCALABLE);
        expected.extend_from_slice(&KEY_FRAME_OBU);
        assert_eq!(frame.data, expected);
        assert!(parser.next_frame().is_none());
    }

    #[test]
    fn is_keyframe_classifies_frame_bytes() {
        let mut parser = Parser::new();
        parser.parse(&minimal_stream());
        let frame = parser.next_frame().unwrap();
        assert!(parser.is_keyframe(&frame.data));

        let mut inter = Vec::new();
        inter.extend_from_slice(&INTER_FRAME_OBU);
        assert!(!parser.is_keyframe(&inter));

        // Garbage is never a keyframe.
        assert!(!parser.is_keyframe(&[0xff, 0xff]));
    }

    #[test]
    fn av1c_record() {
        let mut parser = Parser::new();
        assert!(parser.av1c().is_none());

        parser.parse(&minimal_stream());
        let av1c = parser.av1c().unwrap();

        // marker/version, profile 0 + level 0, flags: 4:2:0 subsampling.
        assert_eq!(&av1c[..4], &[0x81, 0x00, 0x0c, 0x00]);
        assert_eq!(&av1c[4..], &SEQUENCE_HEADER_OBU[..]);
    }

    #[test]
    fn color_config_srgb_special_case() {
        // high_bitdepth 0, mono_chrome 0, color description BT.709 + sRGB +
        // identity matrix: the subsampling and chroma position bits are not
        // coded.
        let data = [0x20, 0x21, 0xa0, 0x00];
        let mut r = Reader::new(&data);
        let mut s = SequenceHeaderObu::default();

        Parser::parse_color_config(&mut s, &mut r).unwrap();

        assert_eq!(r.position(), 28);
        assert!(s.color_config.color_range);
        assert!(!s.color_config.subsampling_x);
        assert!(!s.color_config.subsampling_y);
        assert_eq!(
            s.color_config.chroma_sample_position,
            ChromaSamplePosition::Unknown
        );
    }

    #[test]
    fn flush_emits_pending_frame() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&TEMPORAL_DELIMITER_OBU);
        stream.extend_from_slice(&SEQUENCE_HEADER_OBU);
        stream.extend_from_slice(&KEY_FRAME_OBU);

        let mut parser = Parser::new();
        parser.parse(&stream);
        // No trailing temporal delimiter yet.
        assert!(!parser.frame_available());

        parser.flush();
        assert!(parser.frame_available());
    }

    #[test]
    fn sequence_header_only_mode() {
        let mut parser = Parser::new();
        parser.set_parse_sequence_header_obus_only(true);
        parser.parse(&minimal_stream());

        assert!(parser.sequence_header().is_some());
        assert!(!parser.frame_available());
        parser.flush();
        assert!(!parser.frame_available());
    }
}
