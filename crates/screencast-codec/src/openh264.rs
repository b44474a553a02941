//! openh264 software video decoder.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, instrument, trace};

use crate::error::CodecError;
use crate::{CodecResult, DecodedFrame, VideoDecoder};

/// openh264 software decoder wrapper.
pub struct OpenH264Decoder {
    decoder: openh264::decoder::Decoder,
    frame_count: u64,
}

impl OpenH264Decoder {
    /// Create a new openh264 decoder.
    #[instrument(name = "openh264_new", skip_all)]
    pub fn new() -> CodecResult<Self> {
        let decoder = openh264::decoder::Decoder::new()
            .map_err(|e| CodecError::Initialization(format!("openh264 setup failed: {e}")))?;

        debug!("openh264 decoder initialized");

        Ok(Self {
            decoder,
            frame_count: 0,
        })
    }
}

impl VideoDecoder for OpenH264Decoder {
    #[instrument(name = "openh264_decode", skip(self, access_unit))]
    fn decode(
        &mut self,
        access_unit: &[u8],
        pts_100ns: u64,
    ) -> CodecResult<Option<DecodedFrame>> {
        let decoded = self
            .decoder
            .decode(access_unit)
            .map_err(|e| CodecError::Decoding(format!("openh264 decode failed: {e}")))?;

        let Some(yuv) = decoded else {
            trace!(frame = self.frame_count, "Decoder buffering, no frame out");
            return Ok(None);
        };

        let (width, height) = yuv.dimensions();
        let (y_stride, u_stride, v_stride) = yuv.strides_yuv();

        // Repack to tight I420, dropping the stride padding.
        let mut data = BytesMut::with_capacity(width * height * 3 / 2);
        copy_plane(&mut data, yuv.y(), y_stride, width, height);
        copy_plane(&mut data, yuv.u(), u_stride, width / 2, height / 2);
        copy_plane(&mut data, yuv.v(), v_stride, width / 2, height / 2);

        self.frame_count += 1;

        Ok(Some(DecodedFrame {
            data: data.freeze(),
            width: width as u16,
            height: height as u16,
            pts_100ns,
        }))
    }

    fn name(&self) -> &'static str {
        "openh264"
    }
}

fn copy_plane(out: &mut BytesMut, plane: &[u8], stride: usize, row_len: usize, rows: usize) {
    for row in 0..rows {
        let start = row * stride;
        out.put_slice(&plane[start..start + row_len]);
    }
}
