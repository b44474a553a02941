//! Share session orchestration.
//!
//! A `ShareSession` owns one end-to-end pipeline: the process-loopback
//! capture slot, the encode pipeline feeding the host's outgoing channel
//! through a pump thread, and the decode pipeline plus playback feed for
//! the receiving direction. The host pushes raw frames and inbound
//! messages in, and takes captured audio, decoded frames and the playback
//! feed out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, trace, warn};

use screencast_audio::{CapturedAudio, PlaybackFeed, ProcessCaptureSession};
use screencast_codec::{
    CodecResult, DecodePipeline, DecodedFrame, EncodePipeline, RawFrame, VideoDecoder,
    VideoEncoder, VideoEncoderConfig, create_video_decoder, create_video_encoder,
};
use screencast_ipc::{
    CaptureTarget, PipelineMetrics, SessionEvent, SessionState, ShareConfig,
};
use screencast_wire::{MediaPacket, CHUNK_HEADER_LEN};

use crate::metrics::MetricsCollector;

type EncoderFactory =
    Arc<dyn Fn(VideoEncoderConfig) -> CodecResult<Box<dyn VideoEncoder>> + Send + Sync>;
type DecoderFactory = Arc<dyn Fn() -> CodecResult<Box<dyn VideoDecoder>> + Send + Sync>;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Holds at most one live capture session. Starting a new capture stops
/// the previous one first, so two sessions never compete for the device.
pub struct CaptureSlot {
    session: Mutex<Option<ProcessCaptureSession>>,
}

impl CaptureSlot {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(None),
        }
    }

    /// Start capturing `target`, stopping any prior capture.
    pub fn start(
        &self,
        target: CaptureTarget,
    ) -> Result<Receiver<CapturedAudio>, screencast_audio::AudioError> {
        let mut slot = self.session.lock();
        if let Some(mut previous) = slot.take() {
            info!(
                process_id = previous.target().process_id,
                "Replacing existing capture session"
            );
            if let Err(e) = previous.stop() {
                warn!("Stopping previous capture failed: {}", e);
            }
        }

        let mut session = ProcessCaptureSession::new(target);
        let audio_rx = session.start()?;
        *slot = Some(session);
        Ok(audio_rx)
    }

    /// Stop and release the current capture, if any.
    pub fn stop(&self) {
        if let Some(mut session) = self.session.lock().take() {
            if let Err(e) = session.stop() {
                warn!("Capture stop failed: {}", e);
            }
        }
    }

    /// Whether a capture session is currently held and running.
    pub fn is_active(&self) -> bool {
        self.session.lock().as_ref().is_some_and(|s| s.is_active())
    }

    /// Packets delivered by the current capture session.
    pub fn packets_captured(&self) -> u64 {
        self.session
            .lock()
            .as_ref()
            .map_or(0, |s| s.packets_captured())
    }

    /// Last capture error, if the current session recorded one.
    pub fn last_error(&self) -> Option<String> {
        self.session.lock().as_ref().and_then(|s| s.last_error())
    }
}

impl Default for CaptureSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CaptureSlot {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The host-facing endpoints of a live session.
pub struct SessionStreams {
    /// Captured process audio to hand to the transport. `None` for a
    /// video-only share.
    pub audio_rx: Option<Receiver<CapturedAudio>>,

    /// Decoded frames from the receiving direction. Never holds more
    /// than one frame; take them promptly or only the newest survives.
    pub decoded_rx: Receiver<DecodedFrame>,

    /// Playback feed for the audio render callback. The host pushes
    /// remote samples in and renders out of it.
    pub playback: Arc<PlaybackFeed>,
}

/// One screen-share session, both directions.
pub struct ShareSession {
    event_tx: Sender<SessionEvent>,
    state: Arc<RwLock<SessionState>>,
    capture_slot: CaptureSlot,
    encoder_factory: EncoderFactory,
    decoder_factory: DecoderFactory,
    encode: Option<EncodePipeline>,
    decode: Option<DecodePipeline>,
    playback: Option<Arc<PlaybackFeed>>,
    pump_thread: Option<JoinHandle<()>>,
    collector: Arc<MetricsCollector>,
    decode_errors_seen: AtomicU64,
}

impl ShareSession {
    /// Create a session using the default codec backends.
    pub fn new(event_tx: Sender<SessionEvent>) -> Self {
        Self::with_codec_factories(event_tx, create_video_encoder, || create_video_decoder())
    }

    /// Create a session with custom codec factories.
    pub fn with_codec_factories<E, D>(
        event_tx: Sender<SessionEvent>,
        encoder_factory: E,
        decoder_factory: D,
    ) -> Self
    where
        E: Fn(VideoEncoderConfig) -> CodecResult<Box<dyn VideoEncoder>> + Send + Sync + 'static,
        D: Fn() -> CodecResult<Box<dyn VideoDecoder>> + Send + Sync + 'static,
    {
        Self {
            event_tx,
            state: Arc::new(RwLock::new(SessionState::Idle)),
            capture_slot: CaptureSlot::new(),
            encoder_factory: Arc::new(encoder_factory),
            decoder_factory: Arc::new(decoder_factory),
            encode: None,
            decode: None,
            playback: None,
            pump_thread: None,
            collector: Arc::new(MetricsCollector::new()),
            decode_errors_seen: AtomicU64::new(0),
        }
    }

    /// Start the session. Outgoing wire messages go to `outgoing`; the
    /// returned streams are the host's side of everything else.
    #[instrument(name = "session_start", skip(self, config, outgoing))]
    pub fn start(
        &mut self,
        config: ShareConfig,
        outgoing: Sender<Bytes>,
    ) -> Result<SessionStreams, String> {
        {
            let state = self.state.read();
            if !state.can_start() {
                debug!(state = state.name(), "Start refused in current state");
                return Err(format!("cannot start a session from state {}", state.name()));
            }
        }

        info!("Starting share session");
        self.transition(SessionState::Starting);

        match self.bring_up(&config, outgoing) {
            Ok(streams) => {
                self.transition(SessionState::Live { config });
                info!("Share session live");
                Ok(streams)
            }
            Err(message) => {
                error!("Session start failed: {}", message);
                self.tear_down();
                self.send_event(SessionEvent::Error {
                    recoverable: true,
                    message: message.clone(),
                });
                self.transition(SessionState::Error {
                    message: message.clone(),
                    recoverable: true,
                });
                Err(message)
            }
        }
    }

    fn bring_up(
        &mut self,
        config: &ShareConfig,
        outgoing: Sender<Bytes>,
    ) -> Result<SessionStreams, String> {
        let audio_rx = match config.capture {
            Some(target) => {
                let rx = self
                    .capture_slot
                    .start(target)
                    .map_err(|e| format!("Audio capture start failed: {}", e))?;
                self.send_event(SessionEvent::CaptureStarted {
                    process_id: target.process_id,
                });
                Some(rx)
            }
            None => None,
        };

        let mut encode = EncodePipeline::with_encoder_factory(config.encode.clone(), {
            let factory = Arc::clone(&self.encoder_factory);
            move |encoder_config| factory(encoder_config)
        });
        let message_rx = encode
            .start()
            .map_err(|e| format!("Encode pipeline start failed: {}", e))?;
        self.encode = Some(encode);

        let mut decode = DecodePipeline::with_decoder_factory({
            let factory = Arc::clone(&self.decoder_factory);
            move || factory()
        });
        let decoded_rx = decode
            .start()
            .map_err(|e| format!("Decode pipeline start failed: {}", e))?;
        self.decode = Some(decode);
        self.decode_errors_seen.store(0, Ordering::Relaxed);

        let playback = Arc::new(PlaybackFeed::new(config.playback.clone()));
        self.playback = Some(Arc::clone(&playback));

        let collector = Arc::new(MetricsCollector::new());
        collector.start();
        self.collector = Arc::clone(&collector);

        let event_tx = self.event_tx.clone();
        let handle = thread::Builder::new()
            .name("message-pump".into())
            .spawn(move || pump_loop(message_rx, outgoing, collector, event_tx))
            .map_err(|e| format!("Message pump spawn failed: {}", e))?;
        self.pump_thread = Some(handle);

        Ok(SessionStreams {
            audio_rx,
            decoded_rx,
            playback,
        })
    }

    /// Submit a raw video frame for encoding. Returns false when the
    /// frame was shed or no session is live.
    pub fn submit_frame(&self, frame: RawFrame) -> bool {
        self.encode
            .as_ref()
            .is_some_and(|encode| encode.submit_frame(frame))
    }

    /// Feed one inbound transport message to the decode side.
    pub fn submit_message(&self, message: &[u8]) {
        let Some(ref decode) = self.decode else {
            trace!("Inbound message with no live session, dropping");
            return;
        };

        if let Err(e) = decode.submit_message(message) {
            warn!("Inbound message rejected: {}", e);
        }

        let errors = decode.stats().decode_errors;
        let seen = self.decode_errors_seen.swap(errors, Ordering::Relaxed);
        if errors > seen {
            self.send_event(SessionEvent::DecodeRecovery {
                message: format!("{} decode fault(s), awaiting keyframe", errors),
            });
        }
    }

    /// Ask the encoder for a keyframe, e.g. when a viewer joins.
    pub fn request_keyframe(&self) {
        if let Some(ref encode) = self.encode {
            encode.request_keyframe();
        }
    }

    /// Stop the session and release everything. Idempotent.
    #[instrument(name = "session_stop", skip(self))]
    pub fn stop(&mut self) {
        {
            let state = self.state.read();
            if state.is_idle() || state.is_stopping() {
                debug!("Already idle or stopping, ignoring stop");
                return;
            }
        }

        info!("Stopping share session");
        self.transition(SessionState::Stopping);

        let final_metrics = self.tear_down();
        self.send_event(SessionEvent::Metrics(final_metrics));

        self.transition(SessionState::Idle);
        info!("Share session stopped");
    }

    /// Stop components in reverse bring-up order and return the final
    /// counter snapshot.
    fn tear_down(&mut self) -> PipelineMetrics {
        // Stopping the encoder closes the message channel; the pump
        // drains what is left and exits on its own.
        if let Some(encode) = self.encode.as_mut() {
            encode.stop();
        }
        if let Some(handle) = self.pump_thread.take() {
            let _ = handle.join();
        }
        if let Some(decode) = self.decode.as_mut() {
            decode.stop();
        }

        let snapshot = self.metrics();

        let had_capture = self.capture_slot.is_active();
        self.capture_slot.stop();
        if had_capture {
            self.send_event(SessionEvent::CaptureStopped);
        }

        if let Some(playback) = self.playback.take() {
            playback.reset();
        }
        self.collector.stop();
        self.encode = None;
        self.decode = None;

        snapshot
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    /// Point-in-time snapshot of every pipeline counter.
    pub fn metrics(&self) -> PipelineMetrics {
        let encode = self.encode.as_ref().map(|p| p.stats()).unwrap_or_default();
        let decode = self.decode.as_ref().map(|p| p.stats()).unwrap_or_default();
        let playback = self.playback.as_deref();

        PipelineMetrics {
            frames_encoded: encode.frames_encoded,
            keyframes_encoded: encode.keyframes_encoded,
            frames_dropped: encode.frames_dropped,
            messages_sent: self.collector.messages_forwarded(),
            messages_dropped: encode.messages_dropped + self.collector.host_messages_dropped(),
            bytes_sent: self.collector.bytes_forwarded(),
            frames_decoded: decode.frames_decoded,
            deltas_dropped: decode.deltas_dropped,
            decode_errors: decode.decode_errors,
            capture_packets: self.capture_slot.packets_captured(),
            ring_overrun_samples: playback.map_or(0, |p| p.overrun_samples()),
            ring_underruns: playback.map_or(0, |p| p.underruns()),
            drift_corrections: playback.map_or(0, |p| p.drift_corrections()),
            uptime_seconds: self.collector.uptime_seconds(),
        }
    }

    fn transition(&self, new_state: SessionState) {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, new_state.clone())
        };

        debug!(
            previous = previous.name(),
            current = new_state.name(),
            "Session state transition"
        );

        self.send_event(SessionEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(new_state),
        });
    }

    fn send_event(&self, event: SessionEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send session event: {}", e);
        }
    }
}

impl Drop for ShareSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Forward encoded wire messages to the host channel, shedding when the
/// host falls behind. Announces the stream configuration the first time
/// it passes through.
fn pump_loop(
    message_rx: Receiver<Bytes>,
    outgoing: Sender<Bytes>,
    collector: Arc<MetricsCollector>,
    event_tx: Sender<SessionEvent>,
) {
    debug!("Message pump starting");
    let mut stream_configured = false;

    loop {
        let message = match message_rx.recv_timeout(RECV_TIMEOUT) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if !stream_configured {
            if let Some((width, height, codec)) = peek_stream_config(&message) {
                info!(width, height, codec = %codec, "Outgoing stream configured");
                if event_tx
                    .try_send(SessionEvent::StreamConfigured {
                        width,
                        height,
                        codec,
                    })
                    .is_err()
                {
                    warn!("Failed to send stream-configured event");
                }
                stream_configured = true;
            }
        }

        let len = message.len() as u64;
        match outgoing.try_send(message) {
            Ok(()) => collector.record_forwarded(len),
            Err(TrySendError::Full(_)) => {
                collector.record_host_drop();
                trace!("Host channel full, dropping message");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Host channel disconnected");
                break;
            }
        }
    }

    debug!("Message pump stopped");
}

/// Config packets are tiny and never fragmented, so a single-chunk
/// message that parses as one carries the stream parameters.
fn peek_stream_config(message: &[u8]) -> Option<(u16, u16, String)> {
    if message.len() <= CHUNK_HEADER_LEN || message[0] != 1 {
        return None;
    }
    match MediaPacket::decode(&message[CHUNK_HEADER_LEN..]) {
        Ok(MediaPacket::Config {
            width,
            height,
            codec,
        }) => Some((width, height, codec)),
        _ => None,
    }
}
