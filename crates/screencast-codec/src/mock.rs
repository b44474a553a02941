//! Deterministic mock encoder and decoder for pipeline tests.
//!
//! The mock encoder emits well-formed Annex B access units (a real 1080p
//! High-profile SPS, a PPS, and a slice NAL whose payload encodes the
//! frame number), so everything downstream of a real encoder (stream info
//! parsing, keyframe classification, packet framing) runs the same code
//! paths it would in production.

use bytes::{BufMut, Bytes, BytesMut};

use screencast_wire::nal::{find_nal, NalUnitType};

use crate::error::CodecError;
use crate::{CodecResult, DecodedFrame, EncodedVideoPacket, VideoDecoder, VideoEncoder};

/// 1920x1080 High-profile SPS ("avc1.640028").
const MOCK_SPS: [u8; 26] = [
    0x67, 0x64, 0x00, 0x28, 0xAC, 0xD9, 0x40, 0x78, 0x02, 0x27, 0xE5, 0x84, 0x00, 0x00, 0x03,
    0x00, 0x04, 0x00, 0x00, 0x03, 0x00, 0xF0, 0x3C, 0x60, 0xC6, 0x58,
];

const MOCK_PPS: [u8; 6] = [0x68, 0xEB, 0xE3, 0xCB, 0x22, 0xC0];

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Slice payload prefix that makes [`MockDecoder`] fail the access unit.
pub const POISON_PAYLOAD: [u8; 2] = [0xF0, 0xF1];

/// Mock encoder with a fixed frame cadence.
pub struct MockEncoder {
    frame_count: u64,
    keyframe_interval: u64,
    force_keyframe: bool,
}

impl MockEncoder {
    /// Create a mock encoder that emits a keyframe every
    /// `keyframe_interval` frames, starting with the first.
    pub fn new(keyframe_interval: u64) -> Self {
        Self {
            frame_count: 0,
            keyframe_interval: keyframe_interval.max(1),
            force_keyframe: false,
        }
    }
}

impl VideoEncoder for MockEncoder {
    fn encode(
        &mut self,
        _frame: &[u8],
        pts_100ns: u64,
    ) -> CodecResult<Option<EncodedVideoPacket>> {
        let is_keyframe = self.force_keyframe || self.frame_count % self.keyframe_interval == 0;
        if self.force_keyframe {
            self.force_keyframe = false;
            self.frame_count = 0;
        }

        let mut au = BytesMut::new();
        if is_keyframe {
            au.put_slice(&START_CODE);
            au.put_slice(&MOCK_SPS);
            au.put_slice(&START_CODE);
            au.put_slice(&MOCK_PPS);
        }
        au.put_slice(&START_CODE);
        au.put_u8(if is_keyframe { 0x65 } else { 0x41 });
        au.put_slice(&encode_marker(self.frame_count));

        self.frame_count += 1;

        Ok(Some(EncodedVideoPacket {
            data: au.freeze(),
            pts_100ns,
            dts_100ns: pts_100ns,
            is_keyframe,
        }))
    }

    fn flush(&mut self) -> CodecResult<Vec<EncodedVideoPacket>> {
        Ok(Vec::new())
    }

    fn request_keyframe(&mut self) {
        self.force_keyframe = true;
    }

    fn headers(&self) -> Option<Bytes> {
        None
    }

    fn is_hardware_accelerated(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Mock decoder that rejects deltas with no reference frame and poisoned
/// payloads, mirroring how a real decoder surfaces faults.
pub struct MockDecoder {
    seen_keyframe: bool,
    frames_decoded: u64,
}

impl MockDecoder {
    pub fn new() -> Self {
        Self {
            seen_keyframe: false,
            frames_decoded: 0,
        }
    }

    /// Frames successfully decoded so far.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }
}

impl Default for MockDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoDecoder for MockDecoder {
    fn decode(
        &mut self,
        access_unit: &[u8],
        pts_100ns: u64,
    ) -> CodecResult<Option<DecodedFrame>> {
        let slice = find_nal(access_unit, NalUnitType::IdrSlice)
            .or_else(|| find_nal(access_unit, NalUnitType::NonIdrSlice))
            .ok_or_else(|| CodecError::Decoding("no slice NAL in access unit".into()))?;

        let payload = &slice.data[1..];
        if payload.starts_with(&POISON_PAYLOAD) {
            return Err(CodecError::Decoding("poisoned test access unit".into()));
        }

        match slice.nal_type {
            NalUnitType::IdrSlice => self.seen_keyframe = true,
            _ if !self.seen_keyframe => {
                return Err(CodecError::Decoding("delta frame with no reference".into()));
            }
            _ => {}
        }

        let frame_number = decode_marker(payload)
            .ok_or_else(|| CodecError::Decoding("malformed mock slice payload".into()))?;

        self.frames_decoded += 1;

        Ok(Some(DecodedFrame {
            data: Bytes::copy_from_slice(&frame_number.to_be_bytes()),
            width: 1920,
            height: 1080,
            pts_100ns,
        }))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Expand a frame number into nibble-marked bytes that can never contain
/// zeroes, so slice payloads never alias an Annex B start code.
fn encode_marker(value: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, byte) in value.to_be_bytes().into_iter().enumerate() {
        out[i * 2] = 0xA0 | (byte >> 4);
        out[i * 2 + 1] = 0xA0 | (byte & 0x0F);
    }
    out
}

fn decode_marker(payload: &[u8]) -> Option<u64> {
    if payload.len() != 16 {
        return None;
    }
    let mut bytes = [0u8; 8];
    for i in 0..8 {
        let hi = payload[i * 2];
        let lo = payload[i * 2 + 1];
        if hi & 0xF0 != 0xA0 || lo & 0xF0 != 0xA0 {
            return None;
        }
        bytes[i] = (hi & 0x0F) << 4 | (lo & 0x0F);
    }
    Some(u64::from_be_bytes(bytes))
}

/// Build a poisoned access unit that parses as a frame of the given kind
/// but fails inside [`MockDecoder`].
pub fn poisoned_access_unit(keyframe: bool) -> Bytes {
    let mut au = BytesMut::new();
    if keyframe {
        au.put_slice(&START_CODE);
        au.put_slice(&MOCK_SPS);
        au.put_slice(&START_CODE);
        au.put_slice(&MOCK_PPS);
    }
    au.put_slice(&START_CODE);
    au.put_u8(if keyframe { 0x65 } else { 0x41 });
    au.put_slice(&POISON_PAYLOAD);
    au.freeze()
}
