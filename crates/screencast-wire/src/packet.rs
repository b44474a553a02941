//! Media packet wire format.
//!
//! Every packet starts with a one-byte tag followed by fixed big-endian
//! header fields and a variable payload:
//!
//! - **Config** (`0x00`): `width: u16`, `height: u16`, then the codec
//!   profile string as UTF-8. Sent once, before any frame.
//! - **Keyframe** (`0x01`) / **Delta** (`0x02`): `timestamp: u32`,
//!   `duration: u32` (both microseconds), then the coded frame payload.
//!
//! Packets are immutable once built and carry no chunking information;
//! fragmentation is layered on top by the `chunk` module.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::WireResult;

const TAG_CONFIG: u8 = 0x00;
const TAG_KEYFRAME: u8 = 0x01;
const TAG_DELTA: u8 = 0x02;

/// Length of a frame packet header (tag + timestamp + duration).
pub const FRAME_HEADER_LEN: usize = 9;

/// Length of a config packet header (tag + width + height).
pub const CONFIG_HEADER_LEN: usize = 5;

/// A unit of the outgoing media stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaPacket {
    /// Stream parameters, sent exactly once before any frame.
    Config {
        /// Coded width in pixels.
        width: u16,
        /// Coded height in pixels.
        height: u16,
        /// Codec profile string (e.g. "avc1.640028").
        codec: String,
    },

    /// A self-contained coded frame.
    Keyframe {
        /// Presentation timestamp in microseconds.
        timestamp: u32,
        /// Frame duration in microseconds.
        duration: u32,
        /// Coded frame payload.
        data: Bytes,
    },

    /// A coded frame that depends on prior frames.
    Delta {
        /// Presentation timestamp in microseconds.
        timestamp: u32,
        /// Frame duration in microseconds.
        duration: u32,
        /// Coded frame payload.
        data: Bytes,
    },
}

impl MediaPacket {
    /// Build a frame packet with the given dependency class.
    pub fn frame(keyframe: bool, timestamp: u32, duration: u32, data: Bytes) -> Self {
        if keyframe {
            Self::Keyframe {
                timestamp,
                duration,
                data,
            }
        } else {
            Self::Delta {
                timestamp,
                duration,
                data,
            }
        }
    }

    /// Returns true for config packets.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Returns true for keyframe packets.
    pub fn is_keyframe(&self) -> bool {
        matches!(self, Self::Keyframe { .. })
    }

    /// Serialize into the wire layout.
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Config {
                width,
                height,
                codec,
            } => {
                let mut buf = BytesMut::with_capacity(CONFIG_HEADER_LEN + codec.len());
                buf.put_u8(TAG_CONFIG);
                buf.put_u16(*width);
                buf.put_u16(*height);
                buf.put_slice(codec.as_bytes());
                buf.freeze()
            }
            Self::Keyframe {
                timestamp,
                duration,
                data,
            } => encode_frame(TAG_KEYFRAME, *timestamp, *duration, data),
            Self::Delta {
                timestamp,
                duration,
                data,
            } => encode_frame(TAG_DELTA, *timestamp, *duration, data),
        }
    }

    /// Parse a packet from its wire layout.
    pub fn decode(buf: &[u8]) -> WireResult<Self> {
        let (&tag, rest) = buf.split_first().ok_or(WireError::Truncated {
            needed: 1,
            actual: 0,
        })?;

        match tag {
            TAG_CONFIG => {
                if rest.len() < 4 {
                    return Err(WireError::Truncated {
                        needed: CONFIG_HEADER_LEN,
                        actual: buf.len(),
                    });
                }
                let width = u16::from_be_bytes([rest[0], rest[1]]);
                let height = u16::from_be_bytes([rest[2], rest[3]]);
                let codec = std::str::from_utf8(&rest[4..])?.to_owned();
                Ok(Self::Config {
                    width,
                    height,
                    codec,
                })
            }
            TAG_KEYFRAME | TAG_DELTA => {
                if rest.len() < 8 {
                    return Err(WireError::Truncated {
                        needed: FRAME_HEADER_LEN,
                        actual: buf.len(),
                    });
                }
                let timestamp = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
                let duration = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
                let data = Bytes::copy_from_slice(&rest[8..]);
                Ok(Self::frame(tag == TAG_KEYFRAME, timestamp, duration, data))
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

fn encode_frame(tag: u8, timestamp: u32, duration: u32, data: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + data.len());
    buf.put_u8(tag);
    buf.put_u32(timestamp);
    buf.put_u32(duration);
    buf.put_slice(data);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_encodes_byte_exact() {
        let packet = MediaPacket::Config {
            width: 1920,
            height: 1080,
            codec: "avc1.640028".into(),
        };
        let wire = packet.encode();

        assert_eq!(wire[0], 0x00);
        assert_eq!(&wire[1..3], &[0x07, 0x80]); // 1920
        assert_eq!(&wire[3..5], &[0x04, 0x38]); // 1080
        assert_eq!(&wire[5..], b"avc1.640028");
    }

    #[test]
    fn test_frame_encodes_byte_exact() {
        let packet = MediaPacket::Keyframe {
            timestamp: 0x0102_0304,
            duration: 33_333,
            data: Bytes::from_static(&[0xAA, 0xBB]),
        };
        let wire = packet.encode();

        assert_eq!(wire[0], 0x01);
        assert_eq!(&wire[1..5], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&wire[5..9], &33_333u32.to_be_bytes());
        assert_eq!(&wire[9..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_delta_tag() {
        let packet = MediaPacket::frame(false, 0, 0, Bytes::new());
        assert_eq!(packet.encode()[0], 0x02);
        assert!(!packet.is_keyframe());
    }

    #[test]
    fn test_round_trip() {
        let packets = vec![
            MediaPacket::Config {
                width: 3440,
                height: 1392,
                codec: "avc1.42E01E".into(),
            },
            MediaPacket::Keyframe {
                timestamp: 1_000_000,
                duration: 33_333,
                data: Bytes::from_static(&[1, 2, 3, 4, 5]),
            },
            MediaPacket::Delta {
                timestamp: 1_033_333,
                duration: 33_333,
                data: Bytes::new(),
            },
        ];

        for packet in packets {
            let decoded = MediaPacket::decode(&packet.encode()).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_decode_rejects_empty() {
        assert!(matches!(
            MediaPacket::decode(&[]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        assert!(matches!(
            MediaPacket::decode(&[0x07, 0, 0, 0, 0]),
            Err(WireError::UnknownTag(0x07))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_headers() {
        assert!(matches!(
            MediaPacket::decode(&[0x00, 0x07, 0x80]),
            Err(WireError::Truncated { .. })
        ));
        assert!(matches!(
            MediaPacket::decode(&[0x01, 0, 0, 0, 0, 0, 0]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_bad_codec_string() {
        let wire = [0x00, 0x00, 0x10, 0x00, 0x10, 0xFF, 0xFE];
        assert!(matches!(
            MediaPacket::decode(&wire),
            Err(WireError::InvalidCodec(_))
        ));
    }
}
