//! Video encode pipeline: raw frames in, wire messages out.
//!
//! A dedicated thread owns the encoder. The stream configuration is fixed
//! by the dimensions of the first submitted frame; a config packet derived
//! from the encoder's SPS goes out exactly once, before any frame packet.
//! Frames shed at two points when the pipeline falls behind: raw frames at
//! the submit boundary, and whole encoded packets at the message channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, info, instrument, trace, warn};

use screencast_ipc::EncodeSettings;
use screencast_wire::{chunk_packet, find_stream_info, MediaPacket, SpsInfo};

use crate::error::CodecError;
use crate::{
    create_video_encoder, CodecResult, RawFrame, VideoEncoder, VideoEncoderConfig,
    MAX_ENCODE_QUEUE_DEPTH, MESSAGE_CHANNEL_CAPACITY,
};

type EncoderFactory =
    Arc<dyn Fn(VideoEncoderConfig) -> CodecResult<Box<dyn VideoEncoder>> + Send + Sync>;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Counters {
    frames_encoded: AtomicU64,
    keyframes_encoded: AtomicU64,
    frames_dropped: AtomicU64,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Snapshot of the encode pipeline counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EncodeStats {
    pub frames_encoded: u64,
    pub keyframes_encoded: u64,
    pub frames_dropped: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub bytes_sent: u64,
}

/// Encode pipeline with a dedicated encoder thread.
pub struct EncodePipeline {
    settings: EncodeSettings,
    factory: EncoderFactory,
    frame_tx: Option<Sender<RawFrame>>,
    encode_thread: Option<JoinHandle<()>>,
    should_stop: Arc<AtomicBool>,
    keyframe_requested: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl EncodePipeline {
    /// Create a pipeline using the default encoder selection (hardware
    /// preferred, software fallback).
    pub fn new(settings: EncodeSettings) -> Self {
        Self::with_encoder_factory(settings, create_video_encoder)
    }

    /// Create a pipeline with a custom encoder factory.
    pub fn with_encoder_factory<F>(settings: EncodeSettings, factory: F) -> Self
    where
        F: Fn(VideoEncoderConfig) -> CodecResult<Box<dyn VideoEncoder>> + Send + Sync + 'static,
    {
        Self {
            settings,
            factory: Arc::new(factory),
            frame_tx: None,
            encode_thread: None,
            should_stop: Arc::new(AtomicBool::new(false)),
            keyframe_requested: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Start the encode thread. Returns the receiver for outgoing wire
    /// messages, each at most `max_message_len` bytes.
    #[instrument(name = "encode_start", skip(self))]
    pub fn start(&mut self) -> CodecResult<Receiver<Bytes>> {
        if self.encode_thread.is_some() {
            return Err(CodecError::AlreadyStarted);
        }

        let (frame_tx, frame_rx) = bounded::<RawFrame>(MAX_ENCODE_QUEUE_DEPTH);
        let (message_tx, message_rx) = bounded::<Bytes>(MESSAGE_CHANNEL_CAPACITY);

        self.should_stop.store(false, Ordering::SeqCst);
        self.keyframe_requested.store(false, Ordering::SeqCst);

        let settings = self.settings.clone();
        let factory = Arc::clone(&self.factory);
        let should_stop = Arc::clone(&self.should_stop);
        let keyframe_requested = Arc::clone(&self.keyframe_requested);
        let counters = Arc::clone(&self.counters);

        let handle = thread::Builder::new()
            .name("video-encode".into())
            .spawn(move || {
                encode_loop(
                    settings,
                    factory,
                    frame_rx,
                    message_tx,
                    should_stop,
                    keyframe_requested,
                    counters,
                );
            })?;

        self.frame_tx = Some(frame_tx);
        self.encode_thread = Some(handle);

        info!("Encode pipeline started");
        Ok(message_rx)
    }

    /// Submit a raw frame. Returns false when the frame was shed because
    /// the encoder is behind, or the pipeline is not running.
    pub fn submit_frame(&self, frame: RawFrame) -> bool {
        let Some(ref frame_tx) = self.frame_tx else {
            return false;
        };

        match frame_tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                trace!("Encoder behind, shedding frame");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Ask the encoder for a keyframe at the earliest opportunity.
    pub fn request_keyframe(&self) {
        self.keyframe_requested.store(true, Ordering::SeqCst);
    }

    /// Stop the encode thread, flushing any frames still in the encoder.
    #[instrument(name = "encode_stop", skip(self))]
    pub fn stop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);

        // Dropping the sender lets the thread drain frames it already
        // accepted, then exit without waiting out the receive timeout.
        self.frame_tx = None;

        if let Some(handle) = self.encode_thread.take() {
            let _ = handle.join();
        }

        debug!("Encode pipeline stopped");
    }

    /// Whether the encode thread is running.
    pub fn is_running(&self) -> bool {
        self.encode_thread.is_some()
    }

    pub fn stats(&self) -> EncodeStats {
        EncodeStats {
            frames_encoded: self.counters.frames_encoded.load(Ordering::Relaxed),
            keyframes_encoded: self.counters.keyframes_encoded.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.counters.messages_dropped.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

impl Drop for EncodePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn encode_loop(
    settings: EncodeSettings,
    factory: EncoderFactory,
    frame_rx: Receiver<RawFrame>,
    message_tx: Sender<Bytes>,
    should_stop: Arc<AtomicBool>,
    keyframe_requested: Arc<AtomicBool>,
    counters: Arc<Counters>,
) {
    debug!("Encode loop starting");

    let frame_duration_micros = 1_000_000 / settings.fps.max(1);
    let mut encoder: Option<Box<dyn VideoEncoder>> = None;
    let mut config_sent = false;
    let mut last_log_time = Instant::now();

    loop {
        // A closed channel still hands out frames that were accepted before
        // the sender dropped, so stopping never discards a submitted frame.
        let frame = match frame_rx.recv_timeout(RECV_TIMEOUT) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => {
                if should_stop.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Frame channel disconnected");
                break;
            }
        };

        if last_log_time.elapsed() >= STATS_INTERVAL {
            info!(
                "Encode stats: encoded={}, keyframes={}, shed={}, sent={}, dropped={}",
                counters.frames_encoded.load(Ordering::Relaxed),
                counters.keyframes_encoded.load(Ordering::Relaxed),
                counters.frames_dropped.load(Ordering::Relaxed),
                counters.messages_sent.load(Ordering::Relaxed),
                counters.messages_dropped.load(Ordering::Relaxed),
            );
            last_log_time = Instant::now();
        }

        // The first frame fixes the stream configuration.
        if encoder.is_none() {
            let config = VideoEncoderConfig::for_stream(frame.width, frame.height, &settings);
            match factory(config) {
                Ok(created) => {
                    info!(
                        encoder = created.name(),
                        hardware = created.is_hardware_accelerated(),
                        width = frame.width,
                        height = frame.height,
                        "Encoder ready"
                    );
                    encoder = Some(created);
                }
                Err(e) => {
                    error!("Encoder creation failed: {}", e);
                    break;
                }
            }
        }
        let Some(active) = encoder.as_mut() else {
            break;
        };

        if keyframe_requested.swap(false, Ordering::SeqCst) {
            active.request_keyframe();
        }

        let pts_100ns = u64::from(frame.timestamp_micros) * 10;
        match active.encode(&frame.data, pts_100ns) {
            Ok(Some(packet)) => {
                let payload = access_unit_payload(active.as_ref(), &packet);

                if !config_sent {
                    match find_stream_info(&payload) {
                        Ok(stream) => {
                            let Some(config) = stream_config_packet(&stream) else {
                                error!(
                                    width = stream.width,
                                    height = stream.height,
                                    "Stream dimensions exceed the wire format"
                                );
                                break;
                            };
                            info!(
                                width = stream.width,
                                height = stream.height,
                                codec = %stream.codec,
                                "Stream configured"
                            );
                            if !emit_packet(&config, &settings, &message_tx, &counters) {
                                break;
                            }
                            config_sent = true;
                        }
                        Err(e) => {
                            // Nothing can decode this frame without stream
                            // parameters, so hold frames until they show up.
                            warn!("No stream info in first access unit: {}", e);
                            continue;
                        }
                    }
                }

                counters.frames_encoded.fetch_add(1, Ordering::Relaxed);
                if packet.is_keyframe {
                    counters.keyframes_encoded.fetch_add(1, Ordering::Relaxed);
                }

                let media = MediaPacket::frame(
                    packet.is_keyframe,
                    (packet.pts_100ns / 10) as u32,
                    frame_duration_micros,
                    payload,
                );
                if !emit_packet(&media, &settings, &message_tx, &counters) {
                    break;
                }
            }
            Ok(None) => {
                // Encoder buffering, no output yet
            }
            Err(e) => {
                warn!("Encode error: {}", e);
            }
        }
    }

    // Drain the encoder before the message channel closes.
    if let Some(mut encoder) = encoder {
        if config_sent {
            match encoder.flush() {
                Ok(packets) => {
                    for packet in packets {
                        counters.frames_encoded.fetch_add(1, Ordering::Relaxed);
                        if packet.is_keyframe {
                            counters.keyframes_encoded.fetch_add(1, Ordering::Relaxed);
                        }
                        let payload = access_unit_payload(encoder.as_ref(), &packet);
                        let media = MediaPacket::frame(
                            packet.is_keyframe,
                            (packet.pts_100ns / 10) as u32,
                            frame_duration_micros,
                            payload,
                        );
                        if !emit_packet(&media, &settings, &message_tx, &counters) {
                            break;
                        }
                    }
                }
                Err(e) => warn!("Encoder flush failed: {}", e),
            }
        }
    }

    info!(
        "Encode loop stopped: encoded={}, keyframes={}, shed={}, sent={}, dropped={}",
        counters.frames_encoded.load(Ordering::Relaxed),
        counters.keyframes_encoded.load(Ordering::Relaxed),
        counters.frames_dropped.load(Ordering::Relaxed),
        counters.messages_sent.load(Ordering::Relaxed),
        counters.messages_dropped.load(Ordering::Relaxed),
    );
}

/// The config packet carries 16-bit dimensions on the wire. SPS parsing
/// already caps coded dimensions well below that, so this only returns
/// `None` for stream info a decoder could never handle anyway.
fn stream_config_packet(stream: &SpsInfo) -> Option<MediaPacket> {
    Some(MediaPacket::Config {
        width: u16::try_from(stream.width).ok()?,
        height: u16::try_from(stream.height).ok()?,
        codec: stream.codec.clone(),
    })
}

/// Keyframe access units must be self-contained, so out-of-band SPS/PPS
/// headers are prepended when the backend keeps them separate.
fn access_unit_payload(encoder: &dyn VideoEncoder, packet: &crate::EncodedVideoPacket) -> Bytes {
    if !packet.is_keyframe {
        return packet.data.clone();
    }
    match encoder.headers() {
        Some(headers) => {
            let mut payload = BytesMut::with_capacity(headers.len() + packet.data.len());
            payload.put_slice(&headers);
            payload.put_slice(&packet.data);
            payload.freeze()
        }
        None => packet.data.clone(),
    }
}

/// Send every chunk of one packet, or none of them. A packet that does not
/// fit in the channel's remaining capacity is dropped whole; a partially
/// sent frame would only poison reassembly on the far side.
fn emit_packet(
    packet: &MediaPacket,
    settings: &EncodeSettings,
    message_tx: &Sender<Bytes>,
    counters: &Counters,
) -> bool {
    let encoded = packet.encode();
    let chunks = match chunk_packet(&encoded, settings.max_message_len) {
        Ok(chunks) => chunks,
        Err(e) => {
            warn!("Packet exceeds chunk limits, dropping: {}", e);
            counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
            return true;
        }
    };

    // This thread is the only sender, so the free-slot check is accurate.
    let free = MESSAGE_CHANNEL_CAPACITY - message_tx.len();
    if chunks.len() > free {
        trace!(
            chunks = chunks.len(),
            free,
            "Transport behind, dropping packet"
        );
        counters
            .messages_dropped
            .fetch_add(chunks.len() as u64, Ordering::Relaxed);
        return true;
    }

    for chunk in chunks {
        let len = chunk.len() as u64;
        match message_tx.try_send(chunk) {
            Ok(()) => {
                counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Message channel disconnected");
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEncoder;
    use screencast_wire::Reassembler;

    fn mock_pipeline(settings: EncodeSettings) -> EncodePipeline {
        EncodePipeline::with_encoder_factory(settings, |config| {
            let interval =
                u64::from(config.fps) * u64::from(config.keyframe_interval_secs);
            Ok(Box::new(MockEncoder::new(interval)) as Box<dyn VideoEncoder>)
        })
    }

    fn test_frame(index: u32) -> RawFrame {
        RawFrame {
            data: Bytes::from_static(&[0u8; 64]),
            width: 1920,
            height: 1080,
            timestamp_micros: index * 33_333,
        }
    }

    fn submit_until_accepted(pipeline: &EncodePipeline, index: u32) {
        while !pipeline.submit_frame(test_frame(index)) {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn collect_packets(message_rx: &Receiver<Bytes>) -> Vec<MediaPacket> {
        let mut reassembler = Reassembler::new();
        let mut packets = Vec::new();
        while let Ok(message) = message_rx.try_recv() {
            if let Ok(Some(payload)) = reassembler.feed(&message) {
                if let Ok(packet) = MediaPacket::decode(&payload) {
                    packets.push(packet);
                }
            }
        }
        packets
    }

    #[test]
    fn emits_config_once_before_any_frame() {
        let mut pipeline = mock_pipeline(EncodeSettings::default());
        let message_rx = pipeline.start().unwrap();

        for i in 0..4 {
            submit_until_accepted(&pipeline, i);
        }
        pipeline.stop();

        let packets = collect_packets(&message_rx);
        assert!(packets.len() >= 2);
        assert!(packets[0].is_config());
        assert_eq!(
            packets.iter().filter(|p| p.is_config()).count(),
            1,
            "config must go out exactly once"
        );

        match &packets[0] {
            MediaPacket::Config {
                width,
                height,
                codec,
            } => {
                assert_eq!(*width, 1920);
                assert_eq!(*height, 1080);
                assert_eq!(codec, "avc1.640028");
            }
            _ => unreachable!(),
        }

        // First frame after config is a keyframe.
        assert!(packets[1].is_keyframe());
    }

    #[test]
    fn config_dimensions_fit_the_wire() {
        let stream = SpsInfo {
            width: 3440,
            height: 1392,
            codec: "avc1.640028".to_string(),
        };
        match stream_config_packet(&stream) {
            Some(MediaPacket::Config { width, height, .. }) => {
                assert_eq!(width, 3440);
                assert_eq!(height, 1392);
            }
            other => panic!("expected config, got {:?}", other),
        }

        let oversized = SpsInfo {
            width: 1 << 17,
            height: 1080,
            codec: "avc1.640028".to_string(),
        };
        assert!(stream_config_packet(&oversized).is_none());
    }

    #[test]
    fn stop_drains_accepted_frames() {
        let mut pipeline = mock_pipeline(EncodeSettings::default());
        let message_rx = pipeline.start().unwrap();

        // Fill the frame channel, then stop without waiting for the
        // encode thread to catch up.
        for i in 0..MAX_ENCODE_QUEUE_DEPTH as u32 {
            submit_until_accepted(&pipeline, i);
        }
        pipeline.stop();

        assert_eq!(
            pipeline.stats().frames_encoded,
            MAX_ENCODE_QUEUE_DEPTH as u64
        );
        let packets = collect_packets(&message_rx);
        let frames = packets.iter().filter(|p| !p.is_config()).count();
        assert_eq!(frames, MAX_ENCODE_QUEUE_DEPTH);
    }

    #[test]
    fn frame_timestamps_survive_the_pipeline() {
        let mut pipeline = mock_pipeline(EncodeSettings::default());
        let message_rx = pipeline.start().unwrap();

        submit_until_accepted(&pipeline, 3);
        pipeline.stop();

        let packets = collect_packets(&message_rx);
        let frame = packets
            .iter()
            .find(|p| !p.is_config())
            .expect("frame packet");
        match frame {
            MediaPacket::Keyframe {
                timestamp,
                duration,
                ..
            } => {
                assert_eq!(*timestamp, 3 * 33_333);
                assert_eq!(*duration, 1_000_000 / 30);
            }
            other => panic!("expected keyframe, got {:?}", other),
        }
    }

    #[test]
    fn large_frames_arrive_chunked() {
        // Small message cap forces every frame through the chunker.
        let settings = EncodeSettings {
            max_message_len: 32,
            ..Default::default()
        };
        let mut pipeline = mock_pipeline(settings);
        let message_rx = pipeline.start().unwrap();

        submit_until_accepted(&pipeline, 0);
        pipeline.stop();

        let mut messages = Vec::new();
        while let Ok(message) = message_rx.try_recv() {
            assert!(message.len() <= 32);
            messages.push(message);
        }
        // The keyframe access unit cannot fit one 32-byte message.
        assert!(messages.len() > 2);

        let mut reassembler = Reassembler::new();
        let mut packets = Vec::new();
        for message in &messages {
            if let Some(payload) = reassembler.feed(message).unwrap() {
                packets.push(MediaPacket::decode(&payload).unwrap());
            }
        }
        assert_eq!(packets.len(), 2);
        assert!(packets[0].is_config());
        assert!(packets[1].is_keyframe());
    }

    #[test]
    fn start_twice_fails() {
        let mut pipeline = mock_pipeline(EncodeSettings::default());
        let _message_rx = pipeline.start().unwrap();
        assert!(matches!(pipeline.start(), Err(CodecError::AlreadyStarted)));
        pipeline.stop();
    }

    #[test]
    fn submit_without_start_is_rejected() {
        let pipeline = mock_pipeline(EncodeSettings::default());
        assert!(!pipeline.submit_frame(test_frame(0)));
    }

    #[test]
    fn requested_keyframe_shows_up_on_the_wire() {
        let mut pipeline = mock_pipeline(EncodeSettings::default());
        let message_rx = pipeline.start().unwrap();

        submit_until_accepted(&pipeline, 0);
        submit_until_accepted(&pipeline, 1);

        // Wait for the queue to drain so the request lands before the
        // next frame is encoded.
        while pipeline.stats().frames_encoded < 2 {
            std::thread::sleep(Duration::from_millis(1));
        }
        pipeline.request_keyframe();
        submit_until_accepted(&pipeline, 2);
        pipeline.stop();

        let packets = collect_packets(&message_rx);
        let kinds: Vec<bool> = packets
            .iter()
            .filter(|p| !p.is_config())
            .map(|p| p.is_keyframe())
            .collect();
        assert_eq!(kinds, [true, false, true]);
    }

    #[test]
    fn stats_track_sent_messages() {
        let mut pipeline = mock_pipeline(EncodeSettings::default());
        let message_rx = pipeline.start().unwrap();

        for i in 0..3 {
            submit_until_accepted(&pipeline, i);
        }
        pipeline.stop();

        let received = message_rx.try_iter().count() as u64;
        let stats = pipeline.stats();
        assert_eq!(stats.messages_sent, received);
        assert_eq!(stats.frames_encoded, 3);
        assert!(stats.bytes_sent > 0);
    }
}
