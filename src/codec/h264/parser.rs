// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;
use std::rc::Rc;

use enumn::N;

use crate::bitstream_utils::BitReader;

const MAX_SPS_COUNT: u32 = 32;
const MAX_PPS_COUNT: u32 = 256;

/// Table E-1, predefined sample aspect ratios by aspect_ratio_idc.
const PREDEFINED_PARS: [(u32, u32); 17] = [
    (0, 0),
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

#[derive(N, Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum NaluType {
    #[default]
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
}

impl NaluHeader {
    /// Parses the one-byte NALU header. The forbidden bit must be unset.
    pub fn parse(byte: u8) -> Result<NaluHeader, String> {
        if byte & 0x80 != 0 {
            return Err("forbidden_zero_bit set in NALU header".into());
        }

        Ok(NaluHeader {
            ref_idc: (byte >> 5) & 0x3,
            type_: NaluType::n(byte & 0x1f).unwrap_or(NaluType::Unknown),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    /* if aspect_ratio_idc == 255 */
    pub sar_width: u16,
    pub sar_height: u16,

    pub timing_info_present_flag: bool,
    /* if timing_info_present_flag */
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    /// Identifies the sequence parameter set that is referred to by picture
    /// parameter sets.
    pub seq_parameter_set_id: u8,

    /// Profile to which the coded video sequence conforms.
    pub profile_idc: u8,
    /// The raw byte carrying constraint_set0_flag..constraint_set5_flag and
    /// the reserved bits, as needed for the configuration record.
    pub constraint_set_flags: u8,
    /// Level to which the coded video sequence conforms.
    pub level_idc: u8,

    /// Specifies the chroma sampling relative to the luma sampling as
    /// specified in clause 6.2.
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,

    /// MaxFrameNum = 2 ^ (log2_max_frame_num_minus4 + 4).
    pub log2_max_frame_num_minus4: u8,

    /// Specifies the method to decode picture order count (clause 8.2.1).
    pub pic_order_cnt_type: u8,
    /// MaxPicOrderCntLsb = 2 ^ (log2_max_pic_order_cnt_lsb_minus4 + 4).
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    /// If true, `delta_pic_order_cnt[..]` are not present in slice headers.
    pub delta_pic_order_always_zero_flag: bool,

    pub max_num_ref_frames: u8,

    /// Plus 1 specifies the width of each decoded picture in macroblocks.
    pub pic_width_in_mbs_minus1: u16,
    /// Plus 1 specifies the height in slice group map units of a decoded
    /// frame or field.
    pub pic_height_in_map_units_minus1: u16,

    /// If true, every coded picture of the sequence is a frame containing
    /// only frame macroblocks.
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Sps {
    /// Returns the coded width of the stream. See 7-13 through 7-17.
    pub const fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * 16
    }

    /// Returns the coded height of the stream. See 7-13 through 7-17.
    pub const fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 as u32 + 1)
            * 16
            * (2 - self.frame_mbs_only_flag as u32)
    }

    pub const fn chroma_array_type(&self) -> u8 {
        match self.separate_colour_plane_flag {
            false => self.chroma_format_idc,
            true => 0,
        }
    }

    /// Returns `SubWidthC` and `SubHeightC`. See table 6-1.
    const fn sub_width_height_c(&self) -> (u32, u32) {
        match (self.chroma_format_idc, self.separate_colour_plane_flag) {
            (1, false) => (2, 2),
            (2, false) => (2, 1),
            (3, false) => (1, 1),
            // Undefined for monochrome and separate colour planes.
            _ => (1, 1),
        }
    }

    /// Returns `CropUnitX` and `CropUnitY`. See 7-19 through 7-22.
    const fn crop_unit_x_y(&self) -> (u32, u32) {
        match self.chroma_array_type() {
            0 => (1, 2 - self.frame_mbs_only_flag as u32),
            _ => {
                let (sub_width_c, sub_height_c) = self.sub_width_height_c();
                (
                    sub_width_c,
                    sub_height_c * (2 - self.frame_mbs_only_flag as u32),
                )
            }
        }
    }

    /// The display dimensions after frame cropping is applied.
    pub fn visible_dimensions(&self) -> (u32, u32) {
        if !self.frame_cropping_flag {
            return (self.width(), self.height());
        }

        let (crop_unit_x, crop_unit_y) = self.crop_unit_x_y();
        let crop_x = crop_unit_x * (self.frame_crop_left_offset + self.frame_crop_right_offset);
        let crop_y = crop_unit_y * (self.frame_crop_top_offset + self.frame_crop_bottom_offset);

        (
            self.width().saturating_sub(crop_x),
            self.height().saturating_sub(crop_y),
        )
    }

    /// Same as MaxFrameNum. See 7-10.
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    pub fn log2_max_frame_num(&self) -> u8 {
        self.log2_max_frame_num_minus4 + 4
    }

    pub fn log2_max_pic_order_cnt_lsb(&self) -> u8 {
        self.log2_max_pic_order_cnt_lsb_minus4 + 4
    }

    /// Whether the VUI carries usable timing information.
    pub fn timing_info_valid(&self) -> bool {
        self.vui_parameters_present_flag
            && self.vui_parameters.timing_info_present_flag
            && self.vui_parameters.num_units_in_tick != 0
            && self.vui_parameters.time_scale != 0
    }

    /// The duration of one field in nanoseconds, derived from the VUI timing
    /// info. Only meaningful when [`Sps::timing_info_valid`] returns true.
    pub fn field_duration(&self) -> u64 {
        let vui = &self.vui_parameters;
        1_000_000_000u64 * u64::from(vui.num_units_in_tick) / u64::from(vui.time_scale)
    }

    /// The pixel aspect ratio signalled by the VUI, if any.
    pub fn pixel_aspect_ratio(&self) -> Option<(u32, u32)> {
        if !self.vui_parameters_present_flag || !self.vui_parameters.aspect_ratio_info_present_flag
        {
            return None;
        }

        let vui = &self.vui_parameters;
        match usize::from(vui.aspect_ratio_idc) {
            255 => Some((u32::from(vui.sar_width), u32::from(vui.sar_height))),
            idc @ 1..=16 => Some(PREDEFINED_PARS[idc]),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub entropy_coding_mode_flag: bool,
    /// Whether pic_order_cnt related syntax elements are present in slice
    /// headers (pic_order_present_flag in older editions).
    pub bottom_field_pic_order_in_frame_present_flag: bool,
}

/// The slice header fields needed for access-unit boundary and picture-order
/// decisions. Parsing stops after the picture order count syntax elements.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub nalu_type: NaluType,
    pub nal_ref_idc: u8,

    pub first_mb_in_slice: u32,
    pub slice_type: u8,
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub frame_num: u32,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u32,
    pub pic_order_cnt_lsb: u32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],

    /// Copied from the referenced SPS so ordering decisions do not need to
    /// resolve the parameter-set tables again.
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb: u8,
}

impl SliceHeader {
    pub fn is_i_slice(&self) -> bool {
        matches!(self.slice_type, 2 | 4 | 7 | 9)
    }

    pub fn is_b_slice(&self) -> bool {
        matches!(self.slice_type, 1 | 6)
    }

    pub fn is_idr(&self) -> bool {
        matches!(self.nalu_type, NaluType::SliceIdr)
    }
}

/// Parses SPS, PPS and slice header syntax from NALU payloads, keeping the
/// active parameter sets for slice resolution.
#[derive(Default)]
pub struct Parser {
    active_spses: BTreeMap<u8, Rc<Sps>>,
    active_ppses: BTreeMap<u8, Rc<Pps>>,
}

impl Parser {
    pub fn get_sps(&self, sps_id: u8) -> Option<&Rc<Sps>> {
        self.active_spses.get(&sps_id)
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Rc<Pps>> {
        self.active_ppses.get(&pps_id)
    }

    /// Implements the scaling_list() syntax of 7.3.2.1.1.1, discarding the
    /// coefficients. Only the reader position matters here.
    fn skip_scaling_list(r: &mut BitReader, size: usize) -> Result<(), String> {
        let mut last_scale = 8i32;
        let mut next_scale = 8i32;

        for _ in 0..size {
            if next_scale != 0 {
                let delta_scale: i32 = r.read_se()?;
                next_scale = (last_scale + delta_scale + 256) % 256;
            }
            if next_scale != 0 {
                last_scale = next_scale;
            }
        }

        Ok(())
    }

    fn skip_scaling_lists(r: &mut BitReader, chroma_format_idc: u8) -> Result<(), String> {
        let num_lists = if chroma_format_idc == 3 { 12 } else { 8 };

        for i in 0..num_lists {
            let seq_scaling_list_present_flag = r.read_bit()?;
            if seq_scaling_list_present_flag {
                Self::skip_scaling_list(r, if i < 6 { 16 } else { 64 })?;
            }
        }

        Ok(())
    }

    fn parse_vui(r: &mut BitReader, sps: &mut Sps) -> Result<(), String> {
        let vui = &mut sps.vui_parameters;

        vui.aspect_ratio_info_present_flag = r.read_bit()?;
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8)?;
            if vui.aspect_ratio_idc == 255 {
                vui.sar_width = r.read_bits(16)?;
                vui.sar_height = r.read_bits(16)?;
            }
        }

        let overscan_info_present_flag = r.read_bit()?;
        if overscan_info_present_flag {
            r.skip_bits(1)?; // overscan_appropriate_flag
        }

        let video_signal_type_present_flag = r.read_bit()?;
        if video_signal_type_present_flag {
            r.skip_bits(4)?; // video_format, video_full_range_flag
            let colour_description_present_flag = r.read_bit()?;
            if colour_description_present_flag {
                r.skip_bits(24)?;
            }
        }

        let chroma_loc_info_present_flag = r.read_bit()?;
        if chroma_loc_info_present_flag {
            let _: u32 = r.read_ue_max(5)?; // chroma_sample_loc_type_top_field
            let _: u32 = r.read_ue_max(5)?; // chroma_sample_loc_type_bottom_field
        }

        vui.timing_info_present_flag = r.read_bit()?;
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = r.read_bits::<u32>(16)? << 16;
            vui.num_units_in_tick |= r.read_bits::<u32>(16)?;
            vui.time_scale = r.read_bits::<u32>(16)? << 16;
            vui.time_scale |= r.read_bits::<u32>(16)?;
            vui.fixed_frame_rate_flag = r.read_bit()?;
        }

        // Nothing past the timing info is needed.
        Ok(())
    }

    /// Parses an SPS NALU (header byte included) and adds it to the active
    /// set.
    pub fn parse_sps(&mut self, nalu: &[u8]) -> Result<Rc<Sps>, String> {
        let header = NaluHeader::parse(*nalu.first().ok_or("empty NALU")?)?;
        if !matches!(header.type_, NaluType::Sps) {
            return Err(format!("expected an SPS NALU, got {:?}", header.type_));
        }

        let mut r = BitReader::new(&nalu[1..], true);
        let mut sps = Sps {
            profile_idc: r.read_bits(8)?,
            constraint_set_flags: r.read_bits(8)?,
            level_idc: r.read_bits(8)?,
            ..Default::default()
        };

        sps.seq_parameter_set_id = r.read_ue_max(MAX_SPS_COUNT - 1)?;

        if matches!(
            sps.profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            sps.chroma_format_idc = r.read_ue_max(3)?;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = r.read_bit()?;
            }

            let _: u8 = r.read_ue_max(6)?; // bit_depth_luma_minus8
            let _: u8 = r.read_ue_max(6)?; // bit_depth_chroma_minus8
            r.skip_bits(1)?; // qpprime_y_zero_transform_bypass_flag

            let seq_scaling_matrix_present_flag = r.read_bit()?;
            if seq_scaling_matrix_present_flag {
                Self::skip_scaling_lists(&mut r, sps.chroma_format_idc)?;
            }
        } else {
            sps.chroma_format_idc = 1;
        }

        sps.log2_max_frame_num_minus4 = r.read_ue_max(12)?;
        sps.pic_order_cnt_type = r.read_ue_max(2)?;

        if sps.pic_order_cnt_type == 0 {
            sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;
        } else if sps.pic_order_cnt_type == 1 {
            sps.delta_pic_order_always_zero_flag = r.read_bit()?;
            let _: i32 = r.read_se()?; // offset_for_non_ref_pic
            let _: i32 = r.read_se()?; // offset_for_top_to_bottom_field
            let num_ref_frames_in_pic_order_cnt_cycle: u32 = r.read_ue_max(254)?;
            for _ in 0..num_ref_frames_in_pic_order_cnt_cycle {
                let _: i32 = r.read_se()?; // offset_for_ref_frame[i]
            }
        }

        sps.max_num_ref_frames = r.read_ue_max(16)?;
        r.skip_bits(1)?; // gaps_in_frame_num_value_allowed_flag
        sps.pic_width_in_mbs_minus1 = r.read_ue()?;
        sps.pic_height_in_map_units_minus1 = r.read_ue()?;
        sps.frame_mbs_only_flag = r.read_bit()?;

        if !sps.frame_mbs_only_flag {
            sps.mb_adaptive_frame_field_flag = r.read_bit()?;
        }

        r.skip_bits(1)?; // direct_8x8_inference_flag
        sps.frame_cropping_flag = r.read_bit()?;

        if sps.frame_cropping_flag {
            sps.frame_crop_left_offset = r.read_ue()?;
            sps.frame_crop_right_offset = r.read_ue()?;
            sps.frame_crop_top_offset = r.read_ue()?;
            sps.frame_crop_bottom_offset = r.read_ue()?;

            let (crop_unit_x, crop_unit_y) = sps.crop_unit_x_y();
            sps.frame_crop_left_offset
                .checked_add(sps.frame_crop_right_offset)
                .and_then(|c| c.checked_mul(crop_unit_x))
                .and_then(|c| sps.width().checked_sub(c))
                .ok_or("invalid frame crop width")?;
            sps.frame_crop_top_offset
                .checked_add(sps.frame_crop_bottom_offset)
                .and_then(|c| c.checked_mul(crop_unit_y))
                .and_then(|c| sps.height().checked_sub(c))
                .ok_or("invalid frame crop height")?;
        }

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            Self::parse_vui(&mut r, &mut sps)?;
        }

        let key = sps.seq_parameter_set_id;
        let sps = Rc::new(sps);
        self.active_spses.insert(key, Rc::clone(&sps));
        Ok(sps)
    }

    /// Parses the leading fields of a PPS NALU (header byte included) and
    /// adds it to the active set. Only the fields consulted by slice parsing
    /// and access-unit boundary decisions are read.
    pub fn parse_pps(&mut self, nalu: &[u8]) -> Result<Rc<Pps>, String> {
        let header = NaluHeader::parse(*nalu.first().ok_or("empty NALU")?)?;
        if !matches!(header.type_, NaluType::Pps) {
            return Err(format!("expected a PPS NALU, got {:?}", header.type_));
        }

        let mut r = BitReader::new(&nalu[1..], true);
        let pic_parameter_set_id = r.read_ue_max::<u32>(MAX_PPS_COUNT - 1)? as u8;
        let seq_parameter_set_id = r.read_ue_max(MAX_SPS_COUNT - 1)?;

        if self.get_sps(seq_parameter_set_id).is_none() {
            return Err(format!(
                "PPS references SPS {} which has not been parsed",
                seq_parameter_set_id
            ));
        }

        let pps = Pps {
            pic_parameter_set_id,
            seq_parameter_set_id,
            entropy_coding_mode_flag: r.read_bit()?,
            bottom_field_pic_order_in_frame_present_flag: r.read_bit()?,
        };

        let key = pps.pic_parameter_set_id;
        let pps = Rc::new(pps);
        self.active_ppses.insert(key, Rc::clone(&pps));
        Ok(pps)
    }

    /// Parses a slice header (NALU header byte included) up to and including
    /// the picture order count fields. Slices referencing unknown parameter
    /// sets, and NALU types that are not independently-parseable slices, are
    /// errors.
    pub fn parse_slice_header(&self, nalu: &[u8]) -> Result<SliceHeader, String> {
        let header = NaluHeader::parse(*nalu.first().ok_or("empty NALU")?)?;
        if !matches!(
            header.type_,
            NaluType::Slice | NaluType::SliceDpa | NaluType::SliceIdr
        ) {
            return Err(format!("not a parseable slice: {:?}", header.type_));
        }

        let mut r = BitReader::new(&nalu[1..], true);
        let mut sh = SliceHeader {
            nalu_type: header.type_,
            nal_ref_idc: header.ref_idc,
            first_mb_in_slice: r.read_ue()?,
            slice_type: r.read_ue()?,
            ..Default::default()
        };

        if sh.slice_type > 9 {
            return Err(format!("invalid slice_type {}", sh.slice_type));
        }

        sh.pic_parameter_set_id = r.read_ue_max::<u32>(MAX_PPS_COUNT - 1)? as u8;
        let pps = self
            .get_pps(sh.pic_parameter_set_id)
            .ok_or_else(|| format!("slice references unknown PPS {}", sh.pic_parameter_set_id))?;
        let sps = self
            .get_sps(pps.seq_parameter_set_id)
            .ok_or_else(|| format!("PPS references unknown SPS {}", pps.seq_parameter_set_id))?;

        sh.seq_parameter_set_id = sps.seq_parameter_set_id;
        sh.pic_order_cnt_type = sps.pic_order_cnt_type;
        sh.log2_max_pic_order_cnt_lsb = sps.log2_max_pic_order_cnt_lsb();

        sh.frame_num = r.read_bits(usize::from(sps.log2_max_frame_num()))?;

        if !sps.frame_mbs_only_flag {
            sh.field_pic_flag = r.read_bit()?;
            if sh.field_pic_flag {
                sh.bottom_field_flag = r.read_bit()?;
            }
        }

        if sh.is_idr() {
            sh.idr_pic_id = r.read_ue_max(0xffff)?;
        }

        if sps.pic_order_cnt_type == 0 {
            sh.pic_order_cnt_lsb = r.read_bits(usize::from(sps.log2_max_pic_order_cnt_lsb()))?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !sh.field_pic_flag {
                sh.delta_pic_order_cnt_bottom = r.read_se()?;
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            sh.delta_pic_order_cnt[0] = r.read_se()?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !sh.field_pic_flag {
                sh.delta_pic_order_cnt[1] = r.read_se()?;
            }
        }

        Ok(sh)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    // Baseline profile, level 3.0, 64x64, frame_mbs_only, poc type 0,
    // log2_max_frame_num = log2_max_pic_order_cnt_lsb = 4, no VUI.
    pub(crate) const SPS_NALU: [u8; 7] = [0x67, 0x42, 0x00, 0x1e, 0xf4, 0x21, 0x22];
    // PPS id 0 referencing SPS 0, no flags set.
    pub(crate) const PPS_NALU: [u8; 2] = [0x68, 0xc8];
    // IDR slice, first_mb 0, slice_type 7 (I), frame_num 0, idr_pic_id 0.
    pub(crate) const IDR_SLICE_NALU: [u8; 4] = [0x65, 0x88, 0x84, 0x20];
    // Same, but idr_pic_id 1.
    pub(crate) const IDR_SLICE_NALU_PIC_ID_1: [u8; 4] = [0x65, 0x88, 0x82, 0x08];
    // P slice, frame_num 1, pic_order_cnt_lsb 2.
    pub(crate) const P_SLICE_NALU: [u8; 3] = [0x41, 0xe2, 0x50];

    fn parser_with_sps_pps() -> Parser {
        let mut parser = Parser::default();
        parser.parse_sps(&SPS_NALU).unwrap();
        parser.parse_pps(&PPS_NALU).unwrap();
        parser
    }

    #[test]
    fn parse_sps() {
        let mut parser = Parser::default();
        let sps = parser.parse_sps(&SPS_NALU).unwrap();

        assert_eq!(sps.seq_parameter_set_id, 0);
        assert_eq!(sps.profile_idc, 66);
        assert_eq!(sps.level_idc, 30);
        assert_eq!(sps.chroma_format_idc, 1);
        assert_eq!(sps.width(), 64);
        assert_eq!(sps.height(), 64);
        assert_eq!(sps.visible_dimensions(), (64, 64));
        assert_eq!(sps.log2_max_frame_num(), 4);
        assert_eq!(sps.pic_order_cnt_type, 0);
        assert_eq!(sps.log2_max_pic_order_cnt_lsb(), 4);
        assert!(sps.frame_mbs_only_flag);
        assert!(!sps.timing_info_valid());
        assert!(sps.pixel_aspect_ratio().is_none());
    }

    #[test]
    fn parse_pps() {
        let parser = parser_with_sps_pps();
        let pps = parser.get_pps(0).unwrap();

        assert_eq!(pps.pic_parameter_set_id, 0);
        assert_eq!(pps.seq_parameter_set_id, 0);
        assert!(!pps.bottom_field_pic_order_in_frame_present_flag);
    }

    #[test]
    fn pps_requires_sps() {
        let mut parser = Parser::default();
        assert!(parser.parse_pps(&PPS_NALU).is_err());
    }

    #[test]
    fn parse_idr_slice_header() {
        let parser = parser_with_sps_pps();
        let sh = parser.parse_slice_header(&IDR_SLICE_NALU).unwrap();

        assert_eq!(sh.nalu_type, NaluType::SliceIdr);
        assert_eq!(sh.nal_ref_idc, 3);
        assert_eq!(sh.first_mb_in_slice, 0);
        assert_eq!(sh.slice_type, 7);
        assert!(sh.is_i_slice());
        assert!(!sh.is_b_slice());
        assert_eq!(sh.frame_num, 0);
        assert_eq!(sh.idr_pic_id, 0);
        assert_eq!(sh.pic_order_cnt_lsb, 0);

        let sh = parser.parse_slice_header(&IDR_SLICE_NALU_PIC_ID_1).unwrap();
        assert_eq!(sh.idr_pic_id, 1);
    }

    #[test]
    fn parse_p_slice_header() {
        let parser = parser_with_sps_pps();
        let sh = parser.parse_slice_header(&P_SLICE_NALU).unwrap();

        assert_eq!(sh.nalu_type, NaluType::Slice);
        assert_eq!(sh.nal_ref_idc, 2);
        assert_eq!(sh.slice_type, 0);
        assert!(!sh.is_i_slice());
        assert_eq!(sh.frame_num, 1);
        assert_eq!(sh.pic_order_cnt_lsb, 2);
    }

    #[test]
    fn slice_without_parameter_sets_is_rejected() {
        let parser = Parser::default();
        assert!(parser.parse_slice_header(&IDR_SLICE_NALU).is_err());
    }

    #[test]
    fn non_slice_nalu_is_rejected() {
        let parser = parser_with_sps_pps();
        assert!(parser.parse_slice_header(&SPS_NALU).is_err());
    }
}
