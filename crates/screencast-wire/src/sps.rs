//! H.264 sequence parameter set parsing.
//!
//! The decode side needs the coded dimensions and the codec profile
//! string before the first frame can be handed to a decoder, and the
//! only authoritative source is the SPS NAL unit inside the encoder's
//! first access unit. This module reads the seq_parameter_set_data
//! grammar far enough to derive both; everything after the cropping
//! window (VUI and beyond) is ignored.
//!
//! The bit reader strips emulation-prevention bytes (`00 00 03`) on the
//! fly, so it can run directly over NAL payloads as they appear in the
//! stream.

use crate::error::WireError;
use crate::nal::{find_nal, NalUnitType};
use crate::WireResult;

/// Profiles whose SPS carries the chroma format block (ITU-T H.264
/// table in section 7.3.2.1.1).
const EXTENDED_PROFILE_IDCS: [u32; 13] =
    [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// Largest coded dimension this parser accepts.
const MAX_CODED_DIM: u64 = 16384;

/// Stream parameters extracted from an SPS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpsInfo {
    /// Display width in pixels, cropping applied.
    pub width: u32,

    /// Display height in pixels, cropping applied.
    pub height: u32,

    /// Codec profile string, e.g. "avc1.640028".
    pub codec: String,
}

/// Big-endian bit reader over an RBSP with emulation-prevention
/// unescaping.
struct BitReader<'a> {
    data: &'a [u8],
    byte: usize,
    bit: u8,
    zero_run: u8,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte: 0,
            bit: 0,
            zero_run: 0,
        }
    }

    fn read_bit(&mut self) -> WireResult<u32> {
        if self.byte >= self.data.len() {
            return Err(WireError::BitstreamEof);
        }
        let bit = (self.data[self.byte] >> (7 - self.bit)) & 1;
        self.bit += 1;
        if self.bit == 8 {
            self.advance_byte();
        }
        Ok(u32::from(bit))
    }

    fn read_bits(&mut self, count: u32) -> WireResult<u32> {
        debug_assert!(count <= 32);
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()?;
        }
        Ok(value)
    }

    /// Unsigned Exp-Golomb code: leading zeros, a one bit, then as many
    /// suffix bits as there were zeros.
    fn read_ue(&mut self) -> WireResult<u32> {
        let mut zeros = 0u32;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return Err(WireError::InvalidExpGolomb);
            }
        }
        if zeros == 0 {
            return Ok(0);
        }
        let suffix = self.read_bits(zeros)?;
        Ok((1u32 << zeros) - 1 + suffix)
    }

    /// Signed Exp-Golomb code.
    fn read_se(&mut self) -> WireResult<i32> {
        let ue = self.read_ue()?;
        if ue & 1 == 1 {
            Ok(((ue >> 1) + 1) as i32)
        } else {
            Ok(-((ue >> 1) as i32))
        }
    }

    fn advance_byte(&mut self) {
        if self.data[self.byte] == 0 {
            self.zero_run += 1;
        } else {
            self.zero_run = 0;
        }
        self.byte += 1;
        self.bit = 0;
        if self.zero_run >= 2 && self.byte < self.data.len() && self.data[self.byte] == 3 {
            self.byte += 1;
            self.zero_run = 0;
        }
    }
}

/// Parse an SPS NAL unit (header byte included, start code excluded).
pub fn parse_sps(nal: &[u8]) -> WireResult<SpsInfo> {
    let (&header, rbsp) = nal.split_first().ok_or(WireError::Truncated {
        needed: 1,
        actual: 0,
    })?;
    if NalUnitType::from(header) != NalUnitType::Sps {
        return Err(WireError::SpsNotFound);
    }

    let mut reader = BitReader::new(rbsp);

    let profile_idc = reader.read_bits(8)?;
    let constraint_flags = reader.read_bits(8)?;
    let level_idc = reader.read_bits(8)?;
    let _seq_parameter_set_id = reader.read_ue()?;

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    if EXTENDED_PROFILE_IDCS.contains(&profile_idc) {
        chroma_format_idc = reader.read_ue()?;
        if chroma_format_idc > 3 {
            return Err(WireError::Unsupported(format!(
                "chroma_format_idc {chroma_format_idc}"
            )));
        }
        if chroma_format_idc == 3 {
            separate_colour_plane = reader.read_bit()? == 1;
        }
        let _bit_depth_luma_minus8 = reader.read_ue()?;
        let _bit_depth_chroma_minus8 = reader.read_ue()?;
        let _qpprime_y_zero_transform_bypass = reader.read_bit()?;
        if reader.read_bit()? == 1 {
            let list_count = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..list_count {
                if reader.read_bit()? == 1 {
                    skip_scaling_list(&mut reader, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let _log2_max_frame_num_minus4 = reader.read_ue()?;
    let pic_order_cnt_type = reader.read_ue()?;
    match pic_order_cnt_type {
        0 => {
            let _log2_max_pic_order_cnt_lsb_minus4 = reader.read_ue()?;
        }
        1 => {
            let _delta_pic_order_always_zero = reader.read_bit()?;
            let _offset_for_non_ref_pic = reader.read_se()?;
            let _offset_for_top_to_bottom_field = reader.read_se()?;
            let cycle_len = reader.read_ue()?;
            for _ in 0..cycle_len {
                let _offset_for_ref_frame = reader.read_se()?;
            }
        }
        _ => {}
    }

    let _max_num_ref_frames = reader.read_ue()?;
    let _gaps_in_frame_num_allowed = reader.read_bit()?;

    let pic_width_in_mbs_minus1 = reader.read_ue()?;
    let pic_height_in_map_units_minus1 = reader.read_ue()?;
    let frame_mbs_only = reader.read_bit()?;
    if frame_mbs_only == 0 {
        let _mb_adaptive_frame_field = reader.read_bit()?;
    }
    let _direct_8x8_inference = reader.read_bit()?;

    let mut crop_left = 0u64;
    let mut crop_right = 0u64;
    let mut crop_top = 0u64;
    let mut crop_bottom = 0u64;
    if reader.read_bit()? == 1 {
        crop_left = u64::from(reader.read_ue()?);
        crop_right = u64::from(reader.read_ue()?);
        crop_top = u64::from(reader.read_ue()?);
        crop_bottom = u64::from(reader.read_ue()?);
    }

    // Crop offsets are in chroma-dependent units (H.264 section 7.4.2.1.1).
    let chroma_array_type = if separate_colour_plane { 0 } else { chroma_format_idc };
    let height_fields = 2 - u64::from(frame_mbs_only);
    let (crop_unit_x, crop_unit_y) = match chroma_array_type {
        0 => (1, height_fields),
        1 => (2, 2 * height_fields),
        2 => (2, height_fields),
        _ => (1, height_fields),
    };

    let raw_width = (u64::from(pic_width_in_mbs_minus1) + 1) * 16;
    let raw_height = height_fields * (u64::from(pic_height_in_map_units_minus1) + 1) * 16;
    if raw_width > MAX_CODED_DIM || raw_height > MAX_CODED_DIM {
        return Err(WireError::Unsupported(format!(
            "implausible coded size {raw_width}x{raw_height}"
        )));
    }

    let width = raw_width
        .checked_sub((crop_left + crop_right) * crop_unit_x)
        .filter(|w| *w > 0)
        .ok_or_else(|| WireError::Unsupported("cropping exceeds coded width".into()))?;
    let height = raw_height
        .checked_sub((crop_top + crop_bottom) * crop_unit_y)
        .filter(|h| *h > 0)
        .ok_or_else(|| WireError::Unsupported("cropping exceeds coded height".into()))?;

    Ok(SpsInfo {
        width: width as u32,
        height: height as u32,
        codec: format!("avc1.{profile_idc:02X}{constraint_flags:02X}{level_idc:02X}"),
    })
}

/// Locate the SPS in an Annex B access unit and parse it.
pub fn find_stream_info(access_unit: &[u8]) -> WireResult<SpsInfo> {
    let sps = find_nal(access_unit, NalUnitType::Sps).ok_or(WireError::SpsNotFound)?;
    parse_sps(&sps.data)
}

fn skip_scaling_list(reader: &mut BitReader<'_>, size: usize) -> WireResult<()> {
    let mut last_scale: i32 = 8;
    let mut next_scale: i32 = 8;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = reader.read_se()?;
            next_scale = (last_scale + delta).rem_euclid(256);
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// MSB-first bit assembler producing escaped NAL payloads.
    struct BitWriter {
        bits: Vec<bool>,
    }

    impl BitWriter {
        fn new() -> Self {
            Self { bits: Vec::new() }
        }

        fn put_bit(&mut self, bit: u32) {
            self.bits.push(bit != 0);
        }

        fn put_bits(&mut self, value: u32, count: u32) {
            for i in (0..count).rev() {
                self.put_bit((value >> i) & 1);
            }
        }

        fn put_ue(&mut self, value: u32) {
            let coded = value + 1;
            let len = 32 - coded.leading_zeros();
            for _ in 0..len - 1 {
                self.put_bit(0);
            }
            self.put_bits(coded, len);
        }

        fn put_se(&mut self, value: i32) {
            let ue = if value > 0 {
                (value as u32) * 2 - 1
            } else {
                value.unsigned_abs() * 2
            };
            self.put_ue(ue);
        }

        /// Add the RBSP stop bit, pad, escape, and prepend the NAL header.
        fn into_nal(mut self, header: u8) -> Vec<u8> {
            self.put_bit(1);
            while self.bits.len() % 8 != 0 {
                self.put_bit(0);
            }

            let mut raw = Vec::with_capacity(self.bits.len() / 8);
            for chunk in self.bits.chunks(8) {
                let mut byte = 0u8;
                for &bit in chunk {
                    byte = (byte << 1) | u8::from(bit);
                }
                raw.push(byte);
            }

            let mut nal = vec![header];
            let mut zero_run = 0;
            for byte in raw {
                if zero_run >= 2 && byte <= 3 {
                    nal.push(3);
                    zero_run = 0;
                }
                if byte == 0 {
                    zero_run += 1;
                } else {
                    zero_run = 0;
                }
                nal.push(byte);
            }
            nal
        }
    }

    fn reader_over(data: &[u8]) -> BitReader<'_> {
        BitReader::new(data)
    }

    #[test]
    fn test_read_ue_known_values() {
        // 1 | 010 | 011 | 00100 -> 0, 1, 2, 3
        let mut reader = reader_over(&[0xA6, 0x40]);
        assert_eq!(reader.read_ue().unwrap(), 0);
        assert_eq!(reader.read_ue().unwrap(), 1);
        assert_eq!(reader.read_ue().unwrap(), 2);
        assert_eq!(reader.read_ue().unwrap(), 3);
    }

    #[test]
    fn test_read_se_known_values() {
        // ue 0,1,2,3,4 -> se 0,1,-1,2,-2
        let mut reader = reader_over(&[0xA6, 0x42, 0x80]);
        assert_eq!(reader.read_se().unwrap(), 0);
        assert_eq!(reader.read_se().unwrap(), 1);
        assert_eq!(reader.read_se().unwrap(), -1);
        assert_eq!(reader.read_se().unwrap(), 2);
        assert_eq!(reader.read_se().unwrap(), -2);
    }

    #[test]
    fn test_emulation_prevention_skip() {
        let mut reader = reader_over(&[0x00, 0x00, 0x03, 0x01]);
        assert_eq!(reader.read_bits(8).unwrap(), 0);
        assert_eq!(reader.read_bits(8).unwrap(), 0);
        assert_eq!(reader.read_bits(8).unwrap(), 1);
        assert!(reader.read_bit().is_err());
    }

    #[test]
    fn test_exp_golomb_guard() {
        // 40 zero bits: no terminating one within range.
        let mut reader = reader_over(&[0u8; 5]);
        assert!(matches!(reader.read_ue(), Err(WireError::InvalidExpGolomb)));
    }

    #[test]
    fn test_exp_golomb_eof() {
        let mut reader = reader_over(&[0x00]);
        assert!(matches!(reader.read_ue(), Err(WireError::BitstreamEof)));
    }

    // High profile, level 4.0: 1088 coded lines cropped to 1080.
    // Reference bitstream as produced by x264.
    const SPS_1080P_HIGH: [u8; 26] = [
        0x67, 0x64, 0x00, 0x28, 0xAC, 0xD9, 0x40, 0x78, 0x02, 0x27, 0xE5, 0x84, 0x00, 0x00, 0x03,
        0x00, 0x04, 0x00, 0x00, 0x03, 0x00, 0xF0, 0x3C, 0x60, 0xC6, 0x58,
    ];

    #[test]
    fn test_parse_real_1080p_sps() {
        let info = parse_sps(&SPS_1080P_HIGH).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.codec, "avc1.640028");
    }

    #[test]
    fn test_truncated_sps() {
        assert!(matches!(
            parse_sps(&SPS_1080P_HIGH[..6]),
            Err(WireError::BitstreamEof)
        ));
    }

    fn write_baseline_sps(
        width_mbs_minus1: u32,
        height_units_minus1: u32,
        crop: Option<[u32; 4]>,
    ) -> Vec<u8> {
        let mut writer = BitWriter::new();
        writer.put_bits(66, 8); // profile_idc: baseline
        writer.put_bits(0xC0, 8); // constraint flags
        writer.put_bits(50, 8); // level_idc: 5.0
        writer.put_ue(0); // seq_parameter_set_id
        writer.put_ue(0); // log2_max_frame_num_minus4
        writer.put_ue(2); // pic_order_cnt_type
        writer.put_ue(1); // max_num_ref_frames
        writer.put_bit(0); // gaps_in_frame_num_value_allowed
        writer.put_ue(width_mbs_minus1);
        writer.put_ue(height_units_minus1);
        writer.put_bit(1); // frame_mbs_only
        writer.put_bit(1); // direct_8x8_inference
        match crop {
            Some([left, right, top, bottom]) => {
                writer.put_bit(1);
                writer.put_ue(left);
                writer.put_ue(right);
                writer.put_ue(top);
                writer.put_ue(bottom);
            }
            None => writer.put_bit(0),
        }
        writer.put_bit(0); // vui_parameters_present
        writer.into_nal(0x67)
    }

    #[test]
    fn test_parse_ultrawide_sps() {
        let nal = write_baseline_sps(214, 86, None);
        let info = parse_sps(&nal).unwrap();
        assert_eq!(info.width, 3440);
        assert_eq!(info.height, 1392);
        assert_eq!(info.codec, "avc1.42C032");
    }

    #[test]
    fn test_right_crop_in_chroma_units() {
        // 216 macroblocks wide; an 8-unit right crop at 4:2:0 removes
        // 16 pixels: 3456 - 16 = 3440.
        let cropped = parse_sps(&write_baseline_sps(215, 86, Some([0, 8, 0, 0]))).unwrap();
        let full = parse_sps(&write_baseline_sps(215, 86, None)).unwrap();
        assert_eq!(full.width, 3456);
        assert_eq!(cropped.width, 3440);
        assert_eq!(full.width - cropped.width, 16);
        assert_eq!(cropped.height, 1392);
    }

    #[test]
    fn test_high_profile_scaling_matrix() {
        let mut writer = BitWriter::new();
        writer.put_bits(100, 8); // profile_idc: high
        writer.put_bits(0x00, 8);
        writer.put_bits(40, 8);
        writer.put_ue(0); // seq_parameter_set_id
        writer.put_ue(1); // chroma_format_idc: 4:2:0
        writer.put_ue(0); // bit_depth_luma_minus8
        writer.put_ue(0); // bit_depth_chroma_minus8
        writer.put_bit(0); // qpprime_y_zero_transform_bypass
        writer.put_bit(1); // seq_scaling_matrix_present
        writer.put_bit(1); // list 0 present
        writer.put_se(-8); // delta_scale: next_scale hits 0, rest skipped
        for _ in 0..7 {
            writer.put_bit(0); // remaining lists absent
        }
        writer.put_ue(0); // log2_max_frame_num_minus4
        writer.put_ue(0); // pic_order_cnt_type
        writer.put_ue(4); // log2_max_pic_order_cnt_lsb_minus4
        writer.put_ue(2); // max_num_ref_frames
        writer.put_bit(0); // gaps_in_frame_num_value_allowed
        writer.put_ue(79); // 1280 wide
        writer.put_ue(44); // 720 tall
        writer.put_bit(1); // frame_mbs_only
        writer.put_bit(1); // direct_8x8_inference
        writer.put_bit(0); // frame_cropping
        writer.put_bit(0); // vui_parameters_present

        let info = parse_sps(&writer.into_nal(0x67)).unwrap();
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert_eq!(info.codec, "avc1.640028");
    }

    #[test]
    fn test_poc_type_one_offset_list() {
        let mut writer = BitWriter::new();
        writer.put_bits(66, 8);
        writer.put_bits(0x00, 8);
        writer.put_bits(30, 8);
        writer.put_ue(0); // seq_parameter_set_id
        writer.put_ue(0); // log2_max_frame_num_minus4
        writer.put_ue(1); // pic_order_cnt_type
        writer.put_bit(0); // delta_pic_order_always_zero
        writer.put_se(-1); // offset_for_non_ref_pic
        writer.put_se(0); // offset_for_top_to_bottom_field
        writer.put_ue(2); // num_ref_frames_in_pic_order_cnt_cycle
        writer.put_se(1);
        writer.put_se(1);
        writer.put_ue(1); // max_num_ref_frames
        writer.put_bit(0); // gaps_in_frame_num_value_allowed
        writer.put_ue(39); // 640 wide
        writer.put_ue(29); // 480 tall
        writer.put_bit(1); // frame_mbs_only
        writer.put_bit(1); // direct_8x8_inference
        writer.put_bit(0); // frame_cropping
        writer.put_bit(0); // vui_parameters_present

        let info = parse_sps(&writer.into_nal(0x67)).unwrap();
        assert_eq!(info.width, 640);
        assert_eq!(info.height, 480);
    }

    #[test]
    fn test_interlaced_height_and_crop_units() {
        let mut writer = BitWriter::new();
        writer.put_bits(66, 8);
        writer.put_bits(0x00, 8);
        writer.put_bits(30, 8);
        writer.put_ue(0);
        writer.put_ue(0);
        writer.put_ue(2); // pic_order_cnt_type
        writer.put_ue(1);
        writer.put_bit(0);
        writer.put_ue(44); // 720 wide
        writer.put_ue(16); // 17 map units, two fields each
        writer.put_bit(0); // frame_mbs_only: interlaced
        writer.put_bit(0); // mb_adaptive_frame_field
        writer.put_bit(1); // direct_8x8_inference
        writer.put_bit(1); // frame_cropping
        writer.put_ue(0);
        writer.put_ue(0);
        writer.put_ue(0);
        writer.put_ue(1); // bottom crop: 1 unit = 4 lines when interlaced
        writer.put_bit(0);

        let info = parse_sps(&writer.into_nal(0x67)).unwrap();
        assert_eq!(info.width, 720);
        // 17 * 16 * 2 = 544 coded lines, minus one 4:2:0 field crop unit.
        assert_eq!(info.height, 540);
    }

    #[test]
    fn test_sps_nal_type_checked() {
        assert!(matches!(
            parse_sps(&[0x68, 0xCE, 0x3C, 0x80]),
            Err(WireError::SpsNotFound)
        ));
    }

    #[test]
    fn test_find_stream_info_requires_sps() {
        let au = [0x00, 0x00, 0x01, 0x68, 0xCE, 0x3C, 0x80];
        assert!(matches!(
            find_stream_info(&au),
            Err(WireError::SpsNotFound)
        ));

        let mut au = vec![0x00, 0x00, 0x00, 0x01];
        au.extend_from_slice(&SPS_1080P_HIGH);
        let info = find_stream_info(&au).unwrap();
        assert_eq!(info.width, 1920);
    }
}
