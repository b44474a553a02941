//! x264 software video encoder.

use bytes::Bytes;
use tracing::{debug, instrument, trace};

use crate::error::CodecError;
use crate::{CodecResult, EncodedVideoPacket, H264Profile, VideoEncoder, VideoEncoderConfig};

/// x264 software encoder wrapper.
pub struct X264Encoder {
    encoder: Option<x264::Encoder>,
    config: VideoEncoderConfig,
    frame_count: u64,
    /// Cached SPS/PPS header data.
    headers: Bytes,
}

impl X264Encoder {
    /// Create a new x264 encoder.
    #[instrument(name = "x264_new", skip_all)]
    pub fn new(config: VideoEncoderConfig) -> CodecResult<Self> {
        debug!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            bitrate_kbps = config.bitrate_kbps,
            "Initializing x264 encoder"
        );

        let keyframe_interval = (config.fps * config.keyframe_interval_secs) as i32;

        // Scenecut detection is disabled so keyframes land on the
        // configured interval and nowhere else.
        let mut setup = x264::Setup::preset(
            x264::Preset::Veryfast,
            x264::Tune::None,
            false, // fast_decode
            true,  // zero_latency
        )
        .fps(config.fps, 1)
        .bitrate(config.bitrate_kbps as i32)
        .max_keyframe_interval(keyframe_interval)
        .scenecut_threshold(0);

        setup = match config.profile {
            H264Profile::Baseline => setup.baseline(),
            H264Profile::Main => setup.main(),
            H264Profile::High => setup.high(),
        };

        let mut encoder = setup
            .build(
                x264::Colorspace::NV12,
                config.width as i32,
                config.height as i32,
            )
            .map_err(|e| CodecError::Initialization(format!("x264 setup failed: {:?}", e)))?;

        let headers = encoder
            .headers()
            .map_or_else(|_| Bytes::new(), |h| Bytes::from(h.entirety().to_vec()));

        debug!(header_size = headers.len(), "x264 encoder initialized");

        Ok(Self {
            encoder: Some(encoder),
            config,
            frame_count: 0,
            headers,
        })
    }
}

impl VideoEncoder for X264Encoder {
    #[instrument(name = "x264_encode", skip(self, frame))]
    fn encode(
        &mut self,
        frame: &[u8],
        pts_100ns: u64,
    ) -> CodecResult<Option<EncodedVideoPacket>> {
        let expected_size = (self.config.width * self.config.height * 3 / 2) as usize;
        if frame.len() != expected_size {
            return Err(CodecError::InvalidInput(format!(
                "Expected {} bytes ({}x{} NV12), got {}",
                expected_size,
                self.config.width,
                self.config.height,
                frame.len()
            )));
        }

        trace!(frame = self.frame_count, pts = pts_100ns, "Encoding frame");

        // NV12: Y plane followed by the interleaved UV plane, both at
        // width stride.
        let y_size = (self.config.width * self.config.height) as usize;
        let uv_size = y_size / 2;

        let image = x264::Image::new(
            x264::Colorspace::NV12,
            self.config.width as i32,
            self.config.height as i32,
            &[
                x264::Plane {
                    data: &frame[..y_size],
                    stride: self.config.width as i32,
                },
                x264::Plane {
                    data: &frame[y_size..y_size + uv_size],
                    stride: self.config.width as i32,
                },
            ],
        );

        // Convert 100ns units to the encoder timebase.
        let pts = (pts_100ns * self.config.fps as u64) / 10_000_000;

        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| CodecError::Encoding("Encoder has been flushed".to_string()))?;
        let (data, picture) = encoder
            .encode(pts as i64, image)
            .map_err(|e| CodecError::Encoding(format!("x264 encode failed: {:?}", e)))?;

        self.frame_count += 1;

        // No data means the frame is being buffered.
        if data.len() == 0 {
            return Ok(None);
        }

        let nal_data = data.entirety().to_vec();
        let is_keyframe = picture.keyframe();
        let dts_100ns = (picture.dts() as u64 * 10_000_000) / self.config.fps as u64;

        Ok(Some(EncodedVideoPacket {
            data: Bytes::from(nal_data),
            pts_100ns,
            dts_100ns,
            is_keyframe,
        }))
    }

    fn flush(&mut self) -> CodecResult<Vec<EncodedVideoPacket>> {
        debug!("Flushing x264 encoder");

        let mut packets = Vec::new();

        let encoder = match self.encoder.take() {
            Some(e) => e,
            None => return Ok(packets), // Already flushed
        };
        let mut flush = encoder.flush();

        while let Some(result) = flush.next() {
            match result {
                Ok((data, picture)) => {
                    if data.len() > 0 {
                        let pts_100ns =
                            (picture.pts() as u64 * 10_000_000) / self.config.fps as u64;
                        let dts_100ns =
                            (picture.dts() as u64 * 10_000_000) / self.config.fps as u64;

                        packets.push(EncodedVideoPacket {
                            data: Bytes::from(data.entirety().to_vec()),
                            pts_100ns,
                            dts_100ns,
                            is_keyframe: picture.keyframe(),
                        });
                    }
                }
                Err(e) => {
                    debug!("Flush iteration ended: {:?}", e);
                    break;
                }
            }
        }

        Ok(packets)
    }

    fn request_keyframe(&mut self) {
        // The safe x264 bindings expose no per-picture type forcing; the
        // short max_keyframe_interval bounds the wait instead.
        debug!(
            interval_secs = self.config.keyframe_interval_secs,
            "Keyframe requested, next one arrives on the configured interval"
        );
    }

    fn headers(&self) -> Option<Bytes> {
        if self.headers.is_empty() {
            None
        } else {
            Some(self.headers.clone())
        }
    }

    fn is_hardware_accelerated(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "x264"
    }
}

impl Drop for X264Encoder {
    fn drop(&mut self) {
        debug!("Closing x264 encoder");
    }
}

// SAFETY: x264::Encoder uses raw pointers internally but is designed for
// single-threaded use. The encoder is only accessed from one thread at a time.
unsafe impl Send for X264Encoder {}
