//! Process-scoped audio capture using WASAPI loopback.
//!
//! Capture runs against the virtual process-loopback device, so only the
//! target process tree is heard. The device requires async activation and
//! works event-driven where the driver allows it, falling back to a polled
//! loop otherwise.

use crate::CHANNELS;

/// A packet of audio captured from the target process tree.
#[derive(Debug, Clone)]
pub struct CapturedAudio {
    /// Interleaved stereo samples.
    pub samples: Vec<f32>,

    /// Stereo frames in this packet.
    pub frames: u32,

    /// The device flagged this packet as silent.
    pub silent: bool,

    /// Monotonically increasing packet number.
    pub sequence: u64,
}

impl CapturedAudio {
    /// Number of samples across all channels.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Number of frames implied by the sample payload.
    pub fn frame_count(&self) -> usize {
        self.samples.len() / CHANNELS as usize
    }
}

#[cfg(windows)]
mod platform {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use std::time::Duration;

    use crossbeam_channel::{Receiver, Sender, TrySendError};
    use parking_lot::Mutex;
    use tracing::{debug, info, instrument, trace, warn};
    use windows::core::{implement, w, Interface, IUnknown, HRESULT, PCWSTR, PROPVARIANT};
    use windows::Win32::Foundation::{
        CloseHandle, BOOL, HANDLE, WAIT_EVENT, WAIT_OBJECT_0, WAIT_TIMEOUT,
    };
    use windows::Win32::Media::Audio::{
        ActivateAudioInterfaceAsync, IActivateAudioInterfaceAsyncOperation,
        IActivateAudioInterfaceCompletionHandler, IActivateAudioInterfaceCompletionHandler_Impl,
        IAudioCaptureClient, IAudioClient, AUDCLNT_BUFFERFLAGS_SILENT, AUDCLNT_SHAREMODE_SHARED,
        AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM, AUDCLNT_STREAMFLAGS_EVENTCALLBACK,
        AUDCLNT_STREAMFLAGS_LOOPBACK, AUDIOCLIENT_ACTIVATION_PARAMS,
        AUDIOCLIENT_ACTIVATION_PARAMS_0, AUDIOCLIENT_ACTIVATION_TYPE_PROCESS_LOOPBACK,
        AUDIOCLIENT_PROCESS_LOOPBACK_PARAMS, PROCESS_LOOPBACK_MODE_EXCLUDE_TARGET_PROCESS_TREE,
        PROCESS_LOOPBACK_MODE_INCLUDE_TARGET_PROCESS_TREE, VIRTUAL_AUDIO_DEVICE_PROCESS_LOOPBACK,
        WAVEFORMATEX,
    };
    use windows::Win32::System::Com::{CoInitializeEx, CoUninitialize, COINIT_MULTITHREADED};
    use windows::Win32::System::Threading::{
        AvSetMmThreadCharacteristicsW, CreateEventW, SetEvent, WaitForMultipleObjects,
        WaitForSingleObject,
    };
    use windows::Win32::System::Variant::VT_BLOB;

    use screencast_ipc::{CaptureScope, CaptureTarget};

    use super::CapturedAudio;
    use crate::error::AudioError;
    use crate::{AudioResult, CAPTURE_CHANNEL_CAPACITY, CHANNELS, SAMPLE_RATE};

    /// Hard bound on the async activation handshake.
    const ACTIVATION_TIMEOUT: Duration = Duration::from_secs(5);

    /// Requested device buffer, 200 ms in 100 ns units.
    const REQUEST_BUFFER_DURATION: i64 = 2_000_000;

    /// Wait bound in event mode; the loop re-checks the stop flag at least
    /// this often even when the device goes quiet.
    const EVENT_WAIT_MS: u32 = 200;

    /// Drain interval in polling mode.
    const POLL_WAIT_MS: u32 = 10;

    const FORMAT_TAG_IEEE_FLOAT: u16 = 0x0003;
    const BITS_PER_SAMPLE: u16 = 32;

    /// How the audio client was initialized.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    enum InitMode {
        Event,
        Polling,
    }

    enum InitFailure {
        Fatal(AudioError),
        EventRejected(AudioError),
    }

    struct CaptureShared {
        should_stop: AtomicBool,
        packets: AtomicU64,
        last_error: Mutex<Option<String>>,
    }

    /// Win32 event handle that closes with its owner.
    struct OwnedEvent(HANDLE);

    // SAFETY: event handles are kernel objects; signaling and waiting from
    // different threads is their intended use.
    unsafe impl Send for OwnedEvent {}
    unsafe impl Sync for OwnedEvent {}

    impl OwnedEvent {
        /// Manual-reset event; stays signaled once set.
        fn manual_reset() -> AudioResult<Self> {
            let handle =
                unsafe { CreateEventW(None, BOOL::from(true), BOOL::from(false), PCWSTR::null())? };
            Ok(Self(handle))
        }

        /// Auto-reset event for the device buffer callback.
        fn auto_reset() -> AudioResult<Self> {
            let handle = unsafe {
                CreateEventW(None, BOOL::from(false), BOOL::from(false), PCWSTR::null())?
            };
            Ok(Self(handle))
        }

        fn set(&self) {
            unsafe {
                let _ = SetEvent(self.0);
            }
        }
    }

    impl Drop for OwnedEvent {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }

    /// Balances `CoInitializeEx` when the capture thread exits.
    struct ComGuard;

    impl Drop for ComGuard {
        fn drop(&mut self) {
            unsafe { CoUninitialize() };
        }
    }

    /// Completion handler that wakes the capture thread when async
    /// activation finishes.
    #[implement(IActivateAudioInterfaceCompletionHandler)]
    struct ActivationHandler {
        done: Sender<()>,
    }

    impl IActivateAudioInterfaceCompletionHandler_Impl for ActivationHandler_Impl {
        fn ActivateCompleted(
            &self,
            _operation: Option<&IActivateAudioInterfaceAsyncOperation>,
        ) -> windows::core::Result<()> {
            let _ = self.done.try_send(());
            Ok(())
        }
    }

    /// `PROPVARIANT` overlay carrying a `VT_BLOB` pointer to the activation
    /// parameters. The field layout matches the Win32 struct, so a pointer
    /// cast hands it straight to `ActivateAudioInterfaceAsync`.
    #[repr(C)]
    struct ActivationPropVariant {
        vt: u16,
        reserved1: u16,
        reserved2: u16,
        reserved3: u16,
        blob_size: u32,
        blob_data: *const AUDIOCLIENT_ACTIVATION_PARAMS,
    }

    /// Capture session scoped to a single process tree.
    pub struct ProcessCaptureSession {
        target: CaptureTarget,
        shared: Arc<CaptureShared>,
        capture_thread: Mutex<Option<JoinHandle<()>>>,
        stop_event: Mutex<Option<Arc<OwnedEvent>>>,
        is_active: AtomicBool,
    }

    impl ProcessCaptureSession {
        /// Create a capture session for the given target.
        pub fn new(target: CaptureTarget) -> Self {
            Self {
                target,
                shared: Arc::new(CaptureShared {
                    should_stop: AtomicBool::new(false),
                    packets: AtomicU64::new(0),
                    last_error: Mutex::new(None),
                }),
                capture_thread: Mutex::new(None),
                stop_event: Mutex::new(None),
                is_active: AtomicBool::new(false),
            }
        }

        /// Start capturing audio from the target process tree.
        ///
        /// Blocks until the capture loop is delivering packets or the
        /// startup failed, and returns the channel packets arrive on.
        #[instrument(name = "process_capture_start", skip(self))]
        pub fn start(&mut self) -> AudioResult<Receiver<CapturedAudio>> {
            if self.is_active.load(Ordering::SeqCst) {
                return Err(AudioError::AlreadyStarted);
            }

            info!(
                process_id = self.target.process_id,
                scope = ?self.target.scope,
                "Starting process loopback capture"
            );

            let (sender, receiver) = crossbeam_channel::bounded(CAPTURE_CHANNEL_CAPACITY);
            let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

            let stop_event = Arc::new(OwnedEvent::manual_reset()?);
            let shared = Arc::clone(&self.shared);
            shared.should_stop.store(false, Ordering::SeqCst);
            shared.packets.store(0, Ordering::Relaxed);
            *shared.last_error.lock() = None;

            let target = self.target.clone();
            let thread_stop = Arc::clone(&stop_event);
            let handle = std::thread::Builder::new()
                .name("proc-loopback".into())
                .spawn(move || {
                    if let Err(e) = run_capture(&target, &sender, &shared, &thread_stop, &ready_tx)
                    {
                        warn!("Capture thread error: {e}");
                        *shared.last_error.lock() = Some(e.to_string());
                        let _ = ready_tx.try_send(Err(e));
                    }
                })?;

            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let _ = handle.join();
                    return Err(e);
                }
                Err(_) => {
                    let _ = handle.join();
                    let message = self
                        .shared
                        .last_error
                        .lock()
                        .clone()
                        .unwrap_or_else(|| "capture thread exited during startup".into());
                    return Err(AudioError::windows_api(message));
                }
            }

            *self.capture_thread.lock() = Some(handle);
            *self.stop_event.lock() = Some(stop_event);
            self.is_active.store(true, Ordering::SeqCst);

            Ok(receiver)
        }

        /// Stop capturing. Safe to call when already stopped.
        #[instrument(name = "process_capture_stop", skip(self))]
        pub fn stop(&mut self) -> AudioResult<()> {
            if !self.is_active.load(Ordering::SeqCst) {
                return Ok(());
            }

            info!("Stopping process loopback capture");

            self.shared.should_stop.store(true, Ordering::SeqCst);
            if let Some(event) = self.stop_event.lock().take() {
                event.set();
            }
            if let Some(handle) = self.capture_thread.lock().take() {
                let _ = handle.join();
            }
            self.is_active.store(false, Ordering::SeqCst);

            info!("Process loopback capture stopped");
            Ok(())
        }

        /// Check if capture is active.
        pub fn is_active(&self) -> bool {
            self.is_active.load(Ordering::SeqCst)
        }

        /// Cumulative packets delivered by the device since start.
        pub fn packets_captured(&self) -> u64 {
            self.shared.packets.load(Ordering::Relaxed)
        }

        /// Message of the most recent capture thread error, if any.
        pub fn last_error(&self) -> Option<String> {
            self.shared.last_error.lock().clone()
        }

        /// The process tree this session captures.
        pub fn target(&self) -> &CaptureTarget {
            &self.target
        }
    }

    impl Drop for ProcessCaptureSession {
        fn drop(&mut self) {
            let _ = self.stop();
        }
    }

    fn run_capture(
        target: &CaptureTarget,
        sender: &Sender<CapturedAudio>,
        shared: &CaptureShared,
        stop_event: &OwnedEvent,
        ready: &Sender<AudioResult<()>>,
    ) -> AudioResult<()> {
        unsafe { CoInitializeEx(None, COINIT_MULTITHREADED).ok()? };
        let _com = ComGuard;

        // Pro Audio scheduling; capture still works without it.
        unsafe {
            let mut task_index = 0u32;
            let _ = AvSetMmThreadCharacteristicsW(w!("Pro Audio"), &mut task_index);
        }

        let buffer_event = OwnedEvent::auto_reset()?;

        // A rejected event registration invalidates the whole client, so
        // the polling fallback re-runs activation from scratch.
        let mut mode = InitMode::Event;
        let (client, capture_client) = loop {
            match initialize_capture(target, mode, &buffer_event) {
                Ok(parts) => break parts,
                Err(InitFailure::EventRejected(e)) => {
                    warn!("Event-driven init rejected, re-activating for polling: {e}");
                    mode = InitMode::Polling;
                }
                Err(InitFailure::Fatal(e)) => return Err(e),
            }
        };

        unsafe { client.Start()? };
        info!(?mode, process_id = target.process_id, "Process loopback capture running");
        let _ = ready.send(Ok(()));

        let mut sequence = 0u64;
        let result = match mode {
            InitMode::Event => event_capture_loop(
                &capture_client,
                sender,
                shared,
                stop_event,
                &buffer_event,
                &mut sequence,
            ),
            InitMode::Polling => {
                polling_capture_loop(&capture_client, sender, shared, stop_event, &mut sequence)
            }
        };

        unsafe {
            let _ = client.Stop();
        }
        debug!(packets = sequence, "Capture loop exited");
        result
    }

    /// One full activation and initialization attempt in the given mode.
    fn initialize_capture(
        target: &CaptureTarget,
        mode: InitMode,
        buffer_event: &OwnedEvent,
    ) -> Result<(IAudioClient, IAudioCaptureClient), InitFailure> {
        let client = activate_loopback_client(target).map_err(InitFailure::Fatal)?;

        let mut flags = AUDCLNT_STREAMFLAGS_LOOPBACK | AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM;
        if mode == InitMode::Event {
            flags |= AUDCLNT_STREAMFLAGS_EVENTCALLBACK;
        }

        let format = capture_format();
        let initialized = unsafe {
            client.Initialize(
                AUDCLNT_SHAREMODE_SHARED,
                flags,
                REQUEST_BUFFER_DURATION,
                0,
                &format,
                None,
            )
        };
        if let Err(e) = initialized {
            return Err(reject_or_fatal(mode, e));
        }

        if mode == InitMode::Event {
            if let Err(e) = unsafe { client.SetEventHandle(buffer_event.0) } {
                return Err(reject_or_fatal(mode, e));
            }
        }

        let capture_client = unsafe { client.GetService::<IAudioCaptureClient>() }
            .map_err(|e| InitFailure::Fatal(e.into()))?;

        Ok((client, capture_client))
    }

    fn reject_or_fatal(mode: InitMode, err: windows::core::Error) -> InitFailure {
        match mode {
            InitMode::Event => InitFailure::EventRejected(err.into()),
            InitMode::Polling => InitFailure::Fatal(err.into()),
        }
    }

    /// Activate `IAudioClient` on the process-loopback virtual device and
    /// wait for the async handshake with a hard timeout.
    fn activate_loopback_client(target: &CaptureTarget) -> AudioResult<IAudioClient> {
        let loopback_mode = match target.scope {
            CaptureScope::IncludeTree => PROCESS_LOOPBACK_MODE_INCLUDE_TARGET_PROCESS_TREE,
            CaptureScope::ExcludeTree => PROCESS_LOOPBACK_MODE_EXCLUDE_TARGET_PROCESS_TREE,
        };

        // Both structs must stay alive until the handshake completes below.
        let params = AUDIOCLIENT_ACTIVATION_PARAMS {
            ActivationType: AUDIOCLIENT_ACTIVATION_TYPE_PROCESS_LOOPBACK,
            Anonymous: AUDIOCLIENT_ACTIVATION_PARAMS_0 {
                ProcessLoopbackParams: AUDIOCLIENT_PROCESS_LOOPBACK_PARAMS {
                    TargetProcessId: target.process_id,
                    ProcessLoopbackMode: loopback_mode,
                },
            },
        };
        let prop = ActivationPropVariant {
            vt: VT_BLOB.0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
            blob_size: std::mem::size_of::<AUDIOCLIENT_ACTIVATION_PARAMS>() as u32,
            blob_data: &params,
        };

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let handler: IActivateAudioInterfaceCompletionHandler =
            ActivationHandler { done: done_tx }.into();

        let operation = unsafe {
            ActivateAudioInterfaceAsync(
                VIRTUAL_AUDIO_DEVICE_PROCESS_LOOPBACK,
                &IAudioClient::IID,
                Some(&prop as *const ActivationPropVariant as *const PROPVARIANT),
                &handler,
            )?
        };

        if done_rx.recv_timeout(ACTIVATION_TIMEOUT).is_err() {
            return Err(AudioError::ActivationTimeout {
                waited_ms: ACTIVATION_TIMEOUT.as_millis() as u64,
            });
        }

        let mut activate_hr = HRESULT(0);
        let mut activated: Option<IUnknown> = None;
        unsafe { operation.GetActivateResult(&mut activate_hr, &mut activated)? };
        if let Err(e) = activate_hr.ok() {
            return Err(AudioError::ActivationFailed(e.message().to_string_lossy()));
        }

        let client = activated
            .ok_or_else(|| AudioError::ActivationFailed("no interface returned".into()))?;
        Ok(client.cast::<IAudioClient>()?)
    }

    /// Capture format requested from the engine. The virtual loopback
    /// device exposes no mix format, so the engine converts to this fixed
    /// layout.
    fn capture_format() -> WAVEFORMATEX {
        let block_align = CHANNELS * (BITS_PER_SAMPLE / 8);
        WAVEFORMATEX {
            wFormatTag: FORMAT_TAG_IEEE_FLOAT,
            nChannels: CHANNELS,
            nSamplesPerSec: SAMPLE_RATE,
            nAvgBytesPerSec: SAMPLE_RATE * u32::from(block_align),
            nBlockAlign: block_align,
            wBitsPerSample: BITS_PER_SAMPLE,
            cbSize: 0,
        }
    }

    fn event_capture_loop(
        capture_client: &IAudioCaptureClient,
        sender: &Sender<CapturedAudio>,
        shared: &CaptureShared,
        stop_event: &OwnedEvent,
        buffer_event: &OwnedEvent,
        sequence: &mut u64,
    ) -> AudioResult<()> {
        let buffer_signaled = WAIT_EVENT(WAIT_OBJECT_0.0 + 1);
        let handles = [stop_event.0, buffer_event.0];

        loop {
            if shared.should_stop.load(Ordering::SeqCst) {
                return Ok(());
            }

            let wait =
                unsafe { WaitForMultipleObjects(&handles, BOOL::from(false), EVENT_WAIT_MS) };
            if wait == WAIT_OBJECT_0 {
                return Ok(());
            }
            if wait == WAIT_TIMEOUT {
                continue;
            }
            if wait != buffer_signaled {
                return Err(AudioError::windows_api(format!(
                    "WaitForMultipleObjects returned {:?}",
                    wait
                )));
            }

            drain_device(capture_client, sender, shared, sequence)?;
        }
    }

    fn polling_capture_loop(
        capture_client: &IAudioCaptureClient,
        sender: &Sender<CapturedAudio>,
        shared: &CaptureShared,
        stop_event: &OwnedEvent,
        sequence: &mut u64,
    ) -> AudioResult<()> {
        loop {
            if shared.should_stop.load(Ordering::SeqCst) {
                return Ok(());
            }

            let wait = unsafe { WaitForSingleObject(stop_event.0, POLL_WAIT_MS) };
            if wait == WAIT_OBJECT_0 {
                return Ok(());
            }
            if wait != WAIT_TIMEOUT {
                return Err(AudioError::windows_api(format!(
                    "WaitForSingleObject returned {:?}",
                    wait
                )));
            }

            drain_device(capture_client, sender, shared, sequence)?;
        }
    }

    /// Pull every pending packet off the device and forward it.
    fn drain_device(
        capture_client: &IAudioCaptureClient,
        sender: &Sender<CapturedAudio>,
        shared: &CaptureShared,
        sequence: &mut u64,
    ) -> AudioResult<()> {
        loop {
            let packet_frames = unsafe { capture_client.GetNextPacketSize()? };
            if packet_frames == 0 {
                return Ok(());
            }

            let mut data_ptr = std::ptr::null_mut();
            let mut frames = 0u32;
            let mut flags = 0u32;
            unsafe {
                capture_client.GetBuffer(&mut data_ptr, &mut frames, &mut flags, None, None)?;
            }

            if frames == 0 {
                unsafe { capture_client.ReleaseBuffer(0)? };
                continue;
            }

            let sample_count = frames as usize * CHANNELS as usize;
            let silent = flags & (AUDCLNT_BUFFERFLAGS_SILENT.0 as u32) != 0;

            // A silent packet carries no valid data; substitute zeroes so
            // the delivered stream stays gapless.
            let samples = if silent {
                vec![0.0f32; sample_count]
            } else {
                unsafe { std::slice::from_raw_parts(data_ptr as *const f32, sample_count) }
                    .to_vec()
            };

            unsafe { capture_client.ReleaseBuffer(frames)? };

            let packet = CapturedAudio {
                samples,
                frames,
                silent,
                sequence: *sequence,
            };
            *sequence += 1;
            shared.packets.fetch_add(1, Ordering::Relaxed);

            match sender.try_send(packet) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    trace!("Audio channel full, dropping packet");
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(AudioError::ChannelDisconnected);
                }
            }
        }
    }

}

#[cfg(not(windows))]
mod platform {
    use crossbeam_channel::Receiver;

    use screencast_ipc::CaptureTarget;

    use super::CapturedAudio;
    use crate::error::AudioError;
    use crate::AudioResult;

    /// Capture session scoped to a single process tree.
    ///
    /// Process loopback only exists on Windows; this stub keeps the session
    /// API available so callers stay portable.
    pub struct ProcessCaptureSession {
        target: CaptureTarget,
    }

    impl ProcessCaptureSession {
        /// Create a capture session for the given target.
        pub fn new(target: CaptureTarget) -> Self {
            Self { target }
        }

        /// Always fails off Windows.
        pub fn start(&mut self) -> AudioResult<Receiver<CapturedAudio>> {
            Err(AudioError::NotSupported)
        }

        /// No-op off Windows.
        pub fn stop(&mut self) -> AudioResult<()> {
            Ok(())
        }

        pub fn is_active(&self) -> bool {
            false
        }

        pub fn packets_captured(&self) -> u64 {
            0
        }

        pub fn last_error(&self) -> Option<String> {
            None
        }

        pub fn target(&self) -> &CaptureTarget {
            &self.target
        }
    }
}

pub use platform::ProcessCaptureSession;
