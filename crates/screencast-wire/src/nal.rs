//! Annex B NAL unit scanning.
//!
//! H.264 encoders emit access units in Annex B format: NAL units
//! separated by start codes (0x000001 or 0x00000001). This module splits
//! an access unit into its NAL units so the pipeline can classify frames
//! and locate parameter sets. Payloads keep their emulation-prevention
//! bytes; the bitstream reader strips them during parsing.

use bytes::Bytes;

/// NAL unit types relevant for H.264.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NalUnitType {
    /// Non-IDR slice (P/B frame).
    NonIdrSlice = 1,
    /// IDR slice (keyframe).
    IdrSlice = 5,
    /// Supplemental Enhancement Information.
    Sei = 6,
    /// Sequence Parameter Set.
    Sps = 7,
    /// Picture Parameter Set.
    Pps = 8,
    /// Access Unit Delimiter.
    Aud = 9,
    /// Other/unknown NAL type.
    Other = 0,
}

impl From<u8> for NalUnitType {
    fn from(byte: u8) -> Self {
        match byte & 0x1F {
            1 => NalUnitType::NonIdrSlice,
            5 => NalUnitType::IdrSlice,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            _ => NalUnitType::Other,
        }
    }
}

/// A single NAL unit extracted from an Annex B stream.
#[derive(Debug, Clone)]
pub struct NalUnit {
    /// The NAL unit type.
    pub nal_type: NalUnitType,
    /// The NAL unit data (header byte included, start code excluded).
    pub data: Bytes,
}

/// Locate the start code at or after `from`. Returns the offset of the
/// start code and its length.
fn next_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let len = data.len();
    let mut i = from;
    while i + 3 <= len {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if i + 4 <= len && data[i + 2] == 0 && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Parse an Annex B byte stream into individual NAL units.
pub fn parse_annex_b(data: &[u8]) -> Vec<NalUnit> {
    let mut nals = Vec::new();

    let Some((first, first_len)) = next_start_code(data, 0) else {
        return nals;
    };

    let mut nal_start = first + first_len;
    loop {
        let (nal_end, next) = match next_start_code(data, nal_start) {
            Some((offset, code_len)) => (offset, Some(offset + code_len)),
            None => (data.len(), None),
        };

        if nal_end > nal_start {
            let payload = &data[nal_start..nal_end];
            nals.push(NalUnit {
                nal_type: NalUnitType::from(payload[0]),
                data: Bytes::copy_from_slice(payload),
            });
        }

        match next {
            Some(start) => nal_start = start,
            None => break,
        }
    }

    nals
}

/// Returns true if the access unit contains an IDR slice.
pub fn is_keyframe(access_unit: &[u8]) -> bool {
    parse_annex_b(access_unit)
        .iter()
        .any(|nal| nal.nal_type == NalUnitType::IdrSlice)
}

/// Find the first NAL unit of the given type in an access unit.
pub fn find_nal(access_unit: &[u8], nal_type: NalUnitType) -> Option<NalUnit> {
    parse_annex_b(access_unit)
        .into_iter()
        .find(|nal| nal.nal_type == nal_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_annex_b_3byte_start_code() {
        let data = [0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E]; // SPS
        let nals = parse_annex_b(&data);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].nal_type, NalUnitType::Sps);
        assert_eq!(nals[0].data.as_ref(), &[0x67, 0x42, 0x00, 0x1E]);
    }

    #[test]
    fn test_parse_annex_b_4byte_start_code() {
        let data = [0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x3C, 0x80]; // PPS
        let nals = parse_annex_b(&data);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].nal_type, NalUnitType::Pps);
    }

    #[test]
    fn test_parse_annex_b_multiple_nals() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E, // SPS
            0x00, 0x00, 0x01, 0x68, 0xCE, 0x3C, 0x80, // PPS
            0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, // IDR
        ];
        let nals = parse_annex_b(&data);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[0].nal_type, NalUnitType::Sps);
        assert_eq!(nals[1].nal_type, NalUnitType::Pps);
        assert_eq!(nals[2].nal_type, NalUnitType::IdrSlice);
    }

    #[test]
    fn test_parse_annex_b_no_start_code() {
        assert!(parse_annex_b(&[0x67, 0x42, 0x00]).is_empty());
        assert!(parse_annex_b(&[]).is_empty());
    }

    #[test]
    fn test_keyframe_detection() {
        let idr = [0x00, 0x00, 0x01, 0x65, 0x88, 0x84];
        let non_idr = [0x00, 0x00, 0x01, 0x41, 0x9A, 0x02];
        assert!(is_keyframe(&idr));
        assert!(!is_keyframe(&non_idr));
    }

    #[test]
    fn test_find_nal() {
        let data = [
            0x00, 0x00, 0x01, 0x68, 0xCE, 0x3C, 0x80, // PPS
            0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E, // SPS
        ];
        let sps = find_nal(&data, NalUnitType::Sps).unwrap();
        assert_eq!(sps.data[0], 0x67);
        assert!(find_nal(&data, NalUnitType::IdrSlice).is_none());
    }
}
