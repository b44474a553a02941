//! Video decode pipeline: wire messages in, decoded frames out.
//!
//! Incoming transport messages pass through the reassembler on the
//! caller's thread; assembled packets cross a bounded channel to the
//! decode thread. The state machine gates what reaches the decoder:
//! nothing before a config, no deltas before the first keyframe, and
//! after a decode fault no deltas until the next keyframe. The output
//! side holds at most one pending frame; a newly decoded frame replaces
//! an undelivered one, so a slow sink sees the freshest frame instead of
//! a growing backlog.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use screencast_wire::{MediaPacket, Reassembler};

use crate::error::CodecError;
use crate::{
    create_video_decoder, CodecResult, DecodedFrame, VideoDecoder, MAX_DECODE_QUEUE_DEPTH,
};

type DecoderFactory = Arc<dyn Fn() -> CodecResult<Box<dyn VideoDecoder>> + Send + Sync>;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Decode state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// No stream config received yet; every frame is dropped.
    Unconfigured,
    /// Configured, waiting for a keyframe to start (or restart) from.
    AwaitingKeyframe,
    /// Decoding; deltas are accepted.
    Decoding,
}

#[derive(Debug, Default)]
struct Counters {
    frames_decoded: AtomicU64,
    deltas_dropped: AtomicU64,
    decode_errors: AtomicU64,
}

/// Snapshot of the decode pipeline counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecodeStats {
    pub frames_decoded: u64,
    pub deltas_dropped: u64,
    pub decode_errors: u64,
}

/// Decode pipeline with a dedicated decoder thread.
pub struct DecodePipeline {
    factory: DecoderFactory,
    reassembler: Mutex<Reassembler>,
    packet_tx: Option<Sender<MediaPacket>>,
    decode_thread: Option<JoinHandle<()>>,
    should_stop: Arc<AtomicBool>,
    state: Arc<Mutex<DecoderState>>,
    counters: Arc<Counters>,
}

impl DecodePipeline {
    /// Create a pipeline using the default decoder backend.
    pub fn new() -> Self {
        Self::with_decoder_factory(create_video_decoder)
    }

    /// Create a pipeline with a custom decoder factory.
    pub fn with_decoder_factory<F>(factory: F) -> Self
    where
        F: Fn() -> CodecResult<Box<dyn VideoDecoder>> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            reassembler: Mutex::new(Reassembler::new()),
            packet_tx: None,
            decode_thread: None,
            should_stop: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(DecoderState::Unconfigured)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Start the decode thread. Returns the receiver for decoded frames;
    /// it never holds more than one frame.
    #[instrument(name = "decode_start", skip(self))]
    pub fn start(&mut self) -> CodecResult<Receiver<DecodedFrame>> {
        if self.decode_thread.is_some() {
            return Err(CodecError::AlreadyStarted);
        }

        let (packet_tx, packet_rx) = bounded::<MediaPacket>(MAX_DECODE_QUEUE_DEPTH);
        let (output_tx, output_rx) = bounded::<DecodedFrame>(1);

        self.should_stop.store(false, Ordering::SeqCst);
        *self.state.lock() = DecoderState::Unconfigured;

        let mut worker = DecodeWorker {
            factory: Arc::clone(&self.factory),
            output_tx,
            output_drain: output_rx.clone(),
            state: Arc::clone(&self.state),
            counters: Arc::clone(&self.counters),
            decoder: None,
            current_config: None,
        };
        let should_stop = Arc::clone(&self.should_stop);

        let handle = thread::Builder::new()
            .name("video-decode".into())
            .spawn(move || worker.run(packet_rx, should_stop))?;

        self.packet_tx = Some(packet_tx);
        self.decode_thread = Some(handle);

        info!("Decode pipeline started");
        Ok(output_rx)
    }

    /// Feed one transport message. Completed packets are queued for the
    /// decode thread; delta frames are shed when the queue is full,
    /// config and keyframe packets never are.
    pub fn submit_message(&self, message: &[u8]) -> CodecResult<()> {
        let Some(ref packet_tx) = self.packet_tx else {
            return Err(CodecError::ChannelDisconnected);
        };

        let assembled = self.reassembler.lock().feed(message)?;
        let Some(payload) = assembled else {
            return Ok(());
        };
        let packet = MediaPacket::decode(&payload)?;

        match packet_tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(packet)) => {
                if packet.is_config() || packet.is_keyframe() {
                    // The decoder cannot restart without these.
                    packet_tx
                        .send(packet)
                        .map_err(|_| CodecError::ChannelDisconnected)
                } else {
                    self.counters.deltas_dropped.fetch_add(1, Ordering::Relaxed);
                    trace!("Decoder behind, shedding delta");
                    Ok(())
                }
            }
            Err(TrySendError::Disconnected(_)) => Err(CodecError::ChannelDisconnected),
        }
    }

    /// Current decode state.
    pub fn state(&self) -> DecoderState {
        *self.state.lock()
    }

    /// Stop the decode thread. No frames are delivered after this
    /// returns.
    #[instrument(name = "decode_stop", skip(self))]
    pub fn stop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        self.packet_tx = None;
        if let Some(handle) = self.decode_thread.take() {
            let _ = handle.join();
        }
        debug!("Decode pipeline stopped");
    }

    /// Whether the decode thread is running.
    pub fn is_running(&self) -> bool {
        self.decode_thread.is_some()
    }

    pub fn stats(&self) -> DecodeStats {
        DecodeStats {
            frames_decoded: self.counters.frames_decoded.load(Ordering::Relaxed),
            deltas_dropped: self.counters.deltas_dropped.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for DecodePipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DecodePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

struct DecodeWorker {
    factory: DecoderFactory,
    output_tx: Sender<DecodedFrame>,
    output_drain: Receiver<DecodedFrame>,
    state: Arc<Mutex<DecoderState>>,
    counters: Arc<Counters>,
    decoder: Option<Box<dyn VideoDecoder>>,
    current_config: Option<(u16, u16, String)>,
}

impl DecodeWorker {
    fn run(&mut self, packet_rx: Receiver<MediaPacket>, should_stop: Arc<AtomicBool>) {
        debug!("Decode loop starting");

        while !should_stop.load(Ordering::SeqCst) {
            let packet = match packet_rx.recv_timeout(RECV_TIMEOUT) {
                Ok(packet) => packet,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Packet channel disconnected");
                    break;
                }
            };

            let keep_going = match packet {
                MediaPacket::Config {
                    width,
                    height,
                    codec,
                } => {
                    self.handle_config(width, height, codec);
                    true
                }
                MediaPacket::Keyframe {
                    timestamp, data, ..
                } => self.handle_frame(true, timestamp, data),
                MediaPacket::Delta {
                    timestamp, data, ..
                } => self.handle_frame(false, timestamp, data),
            };
            if !keep_going {
                break;
            }
        }

        info!(
            "Decode loop stopped: decoded={}, deltas_dropped={}, errors={}",
            self.counters.frames_decoded.load(Ordering::Relaxed),
            self.counters.deltas_dropped.load(Ordering::Relaxed),
            self.counters.decode_errors.load(Ordering::Relaxed),
        );
    }

    fn handle_config(&mut self, width: u16, height: u16, codec: String) {
        let incoming = (width, height, codec);
        if self.decoder.is_some() && self.current_config.as_ref() == Some(&incoming) {
            debug!("Repeated stream config ignored");
            return;
        }

        match (self.factory)() {
            Ok(created) => {
                info!(
                    decoder = created.name(),
                    width,
                    height,
                    codec = %incoming.2,
                    "Decoder ready"
                );
                self.decoder = Some(created);
                self.current_config = Some(incoming);
                self.set_state(DecoderState::AwaitingKeyframe);
            }
            Err(e) => {
                error!("Decoder creation failed: {}", e);
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                self.decoder = None;
                self.current_config = None;
                self.set_state(DecoderState::Unconfigured);
            }
        }
    }

    fn handle_frame(&mut self, is_keyframe: bool, timestamp: u32, data: Bytes) -> bool {
        match *self.state.lock() {
            DecoderState::Unconfigured => {
                trace!("Frame before stream config, dropping");
                if !is_keyframe {
                    self.counters.deltas_dropped.fetch_add(1, Ordering::Relaxed);
                }
                return true;
            }
            DecoderState::AwaitingKeyframe if !is_keyframe => {
                self.counters.deltas_dropped.fetch_add(1, Ordering::Relaxed);
                trace!("Delta while awaiting keyframe, dropping");
                return true;
            }
            _ => {}
        }

        let Some(decoder) = self.decoder.as_mut() else {
            return true;
        };

        let pts_100ns = u64::from(timestamp) * 10;
        match decoder.decode(&data, pts_100ns) {
            Ok(output) => {
                if is_keyframe {
                    self.set_state(DecoderState::Decoding);
                }
                if let Some(frame) = output {
                    self.counters.frames_decoded.fetch_add(1, Ordering::Relaxed);
                    return self.deliver(frame);
                }
                true
            }
            Err(e) => {
                warn!("Decode failed, waiting for next keyframe: {}", e);
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                self.set_state(DecoderState::AwaitingKeyframe);
                true
            }
        }
    }

    /// Hand a frame to the sink. At most one frame is ever pending; if
    /// the sink has not taken the previous one, the newer frame wins.
    fn deliver(&self, frame: DecodedFrame) -> bool {
        match self.output_tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                let _ = self.output_drain.try_recv();
                trace!("Sink behind, replacing undelivered frame");
                match self.output_tx.try_send(frame) {
                    Ok(()) | Err(TrySendError::Full(_)) => true,
                    Err(TrySendError::Disconnected(_)) => false,
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Frame sink disconnected");
                false
            }
        }
    }

    fn set_state(&self, new_state: DecoderState) {
        let mut state = self.state.lock();
        if *state != new_state {
            debug!(previous = ?*state, current = ?new_state, "Decode state transition");
            *state = new_state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{poisoned_access_unit, MockDecoder, MockEncoder};
    use crate::VideoEncoder;
    use screencast_wire::{chunk_packet, DEFAULT_MAX_MESSAGE_LEN};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn mock_pipeline() -> DecodePipeline {
        DecodePipeline::with_decoder_factory(|| {
            Ok(Box::new(MockDecoder::new()) as Box<dyn VideoDecoder>)
        })
    }

    fn submit_packet(pipeline: &DecodePipeline, packet: &MediaPacket) {
        let encoded = packet.encode();
        for message in chunk_packet(&encoded, DEFAULT_MAX_MESSAGE_LEN).unwrap() {
            pipeline.submit_message(&message).unwrap();
        }
    }

    fn config_packet() -> MediaPacket {
        MediaPacket::Config {
            width: 1920,
            height: 1080,
            codec: "avc1.640028".into(),
        }
    }

    /// Mock access units for frames 0..n; frame 0 is the keyframe.
    fn mock_stream(n: u32) -> Vec<MediaPacket> {
        let mut encoder = MockEncoder::new(u64::from(n) + 1);
        (0..n)
            .map(|i| {
                let au = encoder.encode(&[], u64::from(i) * 10).unwrap().unwrap();
                MediaPacket::frame(au.is_keyframe, i * 33_333, 33_333, au.data)
            })
            .collect()
    }

    fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn delta_before_keyframe_produces_nothing() {
        let mut pipeline = mock_pipeline();
        let output_rx = pipeline.start().unwrap();
        let frames = mock_stream(3);

        submit_packet(&pipeline, &config_packet());
        submit_packet(&pipeline, &frames[1]);
        submit_packet(&pipeline, &frames[2]);

        assert!(wait_for(Duration::from_secs(2), || {
            pipeline.stats().deltas_dropped == 2
        }));
        assert_eq!(pipeline.stats().frames_decoded, 0);
        assert!(output_rx.try_recv().is_err());
        assert_eq!(pipeline.state(), DecoderState::AwaitingKeyframe);
        pipeline.stop();
    }

    #[test]
    fn undelivered_frame_is_replaced_by_newer_one() {
        let mut pipeline = mock_pipeline();
        let output_rx = pipeline.start().unwrap();
        let frames = mock_stream(3);

        // Config, early delta, keyframe, delta. Nothing is drained until
        // the end, so the keyframe's output gets displaced by the delta's.
        submit_packet(&pipeline, &config_packet());
        submit_packet(&pipeline, &frames[1]);
        submit_packet(&pipeline, &frames[0]);
        submit_packet(&pipeline, &frames[2]);

        assert!(wait_for(Duration::from_secs(2), || {
            pipeline.stats().frames_decoded == 2
        }));
        assert_eq!(pipeline.state(), DecoderState::Decoding);
        assert_eq!(pipeline.stats().deltas_dropped, 1);

        let frame = output_rx
            .recv_timeout(Duration::from_millis(500))
            .expect("one frame pending");
        assert_eq!(frame.data.as_ref(), 2u64.to_be_bytes());
        assert!(output_rx.try_recv().is_err(), "only one frame may pend");
        pipeline.stop();
    }

    #[test]
    fn keyframe_before_config_is_dropped() {
        let mut pipeline = mock_pipeline();
        let _output_rx = pipeline.start().unwrap();
        let frames = mock_stream(2);

        submit_packet(&pipeline, &frames[0]);
        submit_packet(&pipeline, &config_packet());
        assert!(wait_for(Duration::from_secs(2), || {
            pipeline.state() == DecoderState::AwaitingKeyframe
        }));
        assert_eq!(pipeline.stats().frames_decoded, 0);

        submit_packet(&pipeline, &frames[0]);
        assert!(wait_for(Duration::from_secs(2), || {
            pipeline.stats().frames_decoded == 1
        }));
        assert_eq!(pipeline.state(), DecoderState::Decoding);
        pipeline.stop();
    }

    #[test]
    fn decode_fault_waits_for_next_keyframe() {
        let mut pipeline = mock_pipeline();
        let output_rx = pipeline.start().unwrap();
        let frames = mock_stream(3);

        submit_packet(&pipeline, &config_packet());
        submit_packet(&pipeline, &frames[0]);
        assert!(wait_for(Duration::from_secs(2), || {
            pipeline.stats().frames_decoded == 1
        }));
        let _ = output_rx.try_recv();

        // Poisoned delta faults the decoder.
        let poisoned = MediaPacket::frame(false, 33_333, 33_333, poisoned_access_unit(false));
        submit_packet(&pipeline, &poisoned);
        assert!(wait_for(Duration::from_secs(2), || {
            pipeline.stats().decode_errors == 1
        }));
        assert_eq!(pipeline.state(), DecoderState::AwaitingKeyframe);

        // Good deltas are discarded until a keyframe lands.
        submit_packet(&pipeline, &frames[1]);
        assert!(wait_for(Duration::from_secs(2), || {
            pipeline.stats().deltas_dropped == 1
        }));
        assert_eq!(pipeline.stats().frames_decoded, 1);

        submit_packet(&pipeline, &frames[0]);
        assert!(wait_for(Duration::from_secs(2), || {
            pipeline.stats().frames_decoded == 2
        }));
        assert_eq!(pipeline.state(), DecoderState::Decoding);
        pipeline.stop();
    }

    #[test]
    fn repeated_config_keeps_the_decoder() {
        let created = Arc::new(AtomicUsize::new(0));
        let created_in_factory = Arc::clone(&created);
        let mut pipeline = DecodePipeline::with_decoder_factory(move || {
            created_in_factory.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockDecoder::new()) as Box<dyn VideoDecoder>)
        });
        let _output_rx = pipeline.start().unwrap();

        submit_packet(&pipeline, &config_packet());
        submit_packet(&pipeline, &config_packet());
        assert!(wait_for(Duration::from_secs(2), || {
            pipeline.state() == DecoderState::AwaitingKeyframe
        }));
        assert_eq!(created.load(Ordering::SeqCst), 1);

        // A different config rebuilds the decoder.
        let changed = MediaPacket::Config {
            width: 1280,
            height: 720,
            codec: "avc1.42c01f".into(),
        };
        submit_packet(&pipeline, &changed);
        assert!(wait_for(Duration::from_secs(2), || {
            created.load(Ordering::SeqCst) == 2
        }));
        assert_eq!(pipeline.state(), DecoderState::AwaitingKeyframe);
        pipeline.stop();
    }

    #[test]
    fn submit_without_start_fails() {
        let pipeline = mock_pipeline();
        let message = chunk_packet(&config_packet().encode(), DEFAULT_MAX_MESSAGE_LEN)
            .unwrap()
            .remove(0);
        assert!(matches!(
            pipeline.submit_message(&message),
            Err(CodecError::ChannelDisconnected)
        ));
    }

    #[test]
    fn malformed_message_is_rejected_without_killing_the_pipeline() {
        let mut pipeline = mock_pipeline();
        let _output_rx = pipeline.start().unwrap();

        assert!(pipeline.submit_message(&[7]).is_err());

        // The pipeline still works afterwards.
        submit_packet(&pipeline, &config_packet());
        assert!(wait_for(Duration::from_secs(2), || {
            pipeline.state() == DecoderState::AwaitingKeyframe
        }));
        pipeline.stop();
    }
}
