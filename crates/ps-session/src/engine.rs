//! Session engine
//!
//! [`SessionEngine`] owns the single acquisition session. Its public API is
//! synchronous and safe to call from any thread; the session itself runs on a
//! dedicated worker thread with its own single-threaded tokio runtime:
//!
//! ```text
//!  caller ──start()──► worker thread "ps-session-<transport>"
//!                        │ connect, push gain, start, launch reader
//!                        │ ◄── ready ───────────────────────────┐
//!                        ▼                                      │
//!                      command loop ◄── Stop / SetGain ── caller│
//!                        │                                      │
//!                        ├─ SetGain: quiesce reader, stop,      │
//!                        │           set gain, start, relaunch  │
//!                        └─ Stop: quiesce reader, cleanup,      │
//!                                 export recording, go Idle ────┘
//! ```
//!
//! The worker exclusively owns the device handle. The engine lock guards
//! only phase transitions and is never held across device I/O.

use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use ps_detect::{list_devices, BleDeviceSummary, BleScanner};
use ps_protocol::{Frame, Gain, Transport};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::ble;
use crate::config::{BleSettings, SessionConfig};
use crate::device::{cleanup, DeviceConnector, SensorDevice};
use crate::error::{SessionError, SessionResult};
use crate::queue::BoundedQueue;
use crate::reader::{ReaderActivity, ReaderSink, ReaderStats};
use crate::recording::{RecordingBuffer, RecordingConfig};
use crate::state::{Phase, SessionState, SessionStatus, StopReport};
use crate::usb;

/// Configuration command consumed by the session's command loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
    SetGain(Gain),
}

/// Result of [`SessionEngine::start`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new session is streaming
    Started(SessionStatus),
    /// A session was already active; nothing was changed
    AlreadyRunning(SessionStatus),
}

impl StartOutcome {
    pub fn status(&self) -> &SessionStatus {
        match self {
            StartOutcome::Started(status) | StartOutcome::AlreadyRunning(status) => status,
        }
    }
}

/// Result of [`SessionEngine::stop`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// The session ended; `export` is the CSV written, if recording was on
    Stopped { export: Option<PathBuf> },
    /// Teardown outlasted the stop bound and finishes in the background;
    /// `export` is where the CSV will be written if anything was recorded
    Pending { export: Option<PathBuf> },
    AlreadyStopped,
}

/// Result of [`SessionEngine::set_gain`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainOutcome {
    /// No session was active; the gain will be pushed on the next connect
    Applied(Gain),
    /// Handed to the running session for reconfiguration
    Queued(Gain),
}

/// Unfiltered BLE listing together with the prefix it was matched against
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BleScanReport {
    pub prefix: String,
    pub devices: Vec<BleDeviceSummary>,
}

/// Connects real hardware through the USB and BLE drivers
#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareConnector;

#[async_trait]
impl DeviceConnector for HardwareConnector {
    async fn open(
        &self,
        transport: Transport,
        config: &SessionConfig,
    ) -> SessionResult<Box<dyn SensorDevice>> {
        match transport {
            // Port enumeration and open are quick blocking calls on the session thread
            Transport::Usb => Ok(Box::new(usb::auto_connect(&config.usb)?)),
            Transport::Ble => Ok(Box::new(ble::auto_connect(&config.ble).await?)),
        }
    }

    async fn list_ble_devices(&self, settings: &BleSettings) -> SessionResult<Vec<BleDeviceSummary>> {
        let scanner = BleScanner::new().await?;
        let table = scanner.scan(settings.scan_duration()).await?;
        Ok(list_devices(&table, &settings.name_prefix))
    }
}

struct Shared {
    config: SessionConfig,
    state: Mutex<SessionState>,
    frames: Arc<BoundedQueue<Frame>>,
    commands: BoundedQueue<Command>,
    recording: Arc<RecordingBuffer>,
    stats: Arc<ReaderStats>,
}

impl Shared {
    fn sink(&self) -> ReaderSink {
        ReaderSink {
            frames: Arc::clone(&self.frames),
            recording: Arc::clone(&self.recording),
            batch_size: self.config.recording_batch,
            stats: Arc::clone(&self.stats),
        }
    }
}

/// Returns the state to Idle however the worker exits
///
/// Everyone waiting on a stop receives the report set with
/// [`complete`](Self::complete).
struct SessionGuard {
    shared: Arc<Shared>,
    report: Option<StopReport>,
}

impl SessionGuard {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            report: None,
        }
    }

    fn complete(mut self, report: StopReport) {
        self.report = Some(report);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let report = self.report.take().unwrap_or_else(|| {
            error!("Session worker ended unexpectedly");
            Ok(None)
        });
        let waiters = {
            let mut state = self.shared.state.lock();
            // Gain changes the worker never got to still apply to the next session
            while let Some(command) = self.shared.commands.pop() {
                if let Command::SetGain(gain) = command {
                    info!("Keeping unapplied gain {} for the next session", gain);
                    state.set_gain(gain);
                }
            }
            state.finish()
        };
        for waiter in waiters {
            let _ = waiter.send(report.clone());
        }
        info!("Session ended");
    }
}

/// Owner of the process-wide acquisition session
pub struct SessionEngine {
    shared: Arc<Shared>,
    connector: Arc<dyn DeviceConnector>,
}

impl SessionEngine {
    pub fn new(config: SessionConfig, connector: Arc<dyn DeviceConnector>) -> Self {
        let shared = Shared {
            state: Mutex::new(SessionState::new(config.initial_gain)),
            frames: Arc::new(BoundedQueue::new(config.queues.usb_frames)),
            commands: BoundedQueue::new(config.queues.commands),
            recording: Arc::new(RecordingBuffer::new()),
            stats: Arc::new(ReaderStats::default()),
            config,
        };
        Self {
            shared: Arc::new(shared),
            connector,
        }
    }

    /// Engine driving real USB and BLE hardware
    pub fn with_hardware(config: SessionConfig) -> Self {
        Self::new(config, Arc::new(HardwareConnector))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Connect over `transport` and begin streaming
    ///
    /// Blocks until the device is streaming or the connect attempt failed.
    /// A failed start leaves the engine Idle and startable again. Starting
    /// while a session is active changes nothing and reports its status.
    pub fn start(&self, transport: Transport) -> SessionResult<StartOutcome> {
        let session_id = {
            let mut state = self.shared.state.lock();
            let Some(id) = state.begin_connect(transport) else {
                drop(state);
                info!("Session already active, ignoring start");
                return Ok(StartOutcome::AlreadyRunning(self.status()));
            };

            // Reset under the lock so a stop racing the connect is not cleared away
            let shared = &self.shared;
            shared.frames.clear();
            shared
                .frames
                .set_capacity(shared.config.queues.frames_for(transport));
            shared.frames.reset_metrics();
            shared.commands.clear();
            shared.recording.begin_session(id);
            shared.stats.reset();
            id
        };
        info!("Starting {} session #{}", transport, session_id);

        let (ready_tx, ready_rx) = mpsc::channel();
        let worker_shared = Arc::clone(&self.shared);
        let connector = Arc::clone(&self.connector);
        let spawned = std::thread::Builder::new()
            .name(format!("ps-session-{}", transport.name().to_lowercase()))
            .spawn(move || {
                let guard = SessionGuard::new(Arc::clone(&worker_shared));
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        guard.complete(Ok(None));
                        let _ = ready_tx.send(Err(SessionError::Runtime(e.to_string())));
                        return;
                    }
                };
                runtime.block_on(run_session(worker_shared, connector, transport, guard, ready_tx));
            });

        if let Err(e) = spawned {
            self.shared.state.lock().finish();
            return Err(SessionError::Runtime(format!(
                "failed to spawn session worker: {}",
                e
            )));
        }

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(StartOutcome::Started(self.status())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::Runtime(
                "session worker exited before reporting".to_string(),
            )),
        }
    }

    /// End the active session
    ///
    /// Waits up to the configured stop bound for teardown and export. On a
    /// timeout the teardown still completes in the background and the
    /// outcome is [`StopOutcome::Pending`].
    pub fn stop(&self) -> SessionResult<StopOutcome> {
        let waiter = {
            let mut state = self.shared.state.lock();
            if !state.phase().is_active() {
                return Ok(StopOutcome::AlreadyStopped);
            }
            state.add_stop_waiter()
        };
        let planned = self.shared.recording.plan_export();

        if let Err(cmd) = self.shared.commands.try_push(Command::Stop) {
            let dropped = self.shared.commands.clear();
            warn!("Command queue full, discarded {} pending command(s) to stop", dropped);
            self.shared.commands.push(cmd);
        }
        info!("Stop requested");

        let wait = self.shared.config.timing.stop_wait();
        match waiter.recv_timeout(wait) {
            Ok(Ok(export)) => Ok(StopOutcome::Stopped { export }),
            Ok(Err(msg)) => Err(SessionError::Recording(std::io::Error::other(msg))),
            Err(RecvTimeoutError::Timeout) => {
                warn!("Session did not stop within {:?}, teardown continues", wait);
                Ok(StopOutcome::Pending { export: planned })
            }
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::Runtime(
                "session worker vanished during stop".to_string(),
            )),
        }
    }

    /// Change the device gain
    ///
    /// Idle or stopping: stored and pushed on the next connect. Otherwise
    /// queued for the session, which reconfigures the device between frame
    /// batches. A queued gain the session ends before applying is kept for
    /// the next one.
    pub fn set_gain(&self, value: i64) -> SessionResult<GainOutcome> {
        let gain =
            Gain::try_from(value).map_err(|e| SessionError::InvalidArgument(e.to_string()))?;

        let mut state = self.shared.state.lock();
        if matches!(state.phase(), Phase::Idle | Phase::Stopping) {
            state.set_gain(gain);
            info!("Gain set to {} ({})", gain, state.phase());
            return Ok(GainOutcome::Applied(gain));
        }

        // Pushed under the state lock so the worker's exit drain cannot miss it
        self.shared
            .commands
            .try_push(Command::SetGain(gain))
            .map_err(|_| SessionError::CommandQueueFull)?;
        drop(state);
        info!("Gain {} queued", gain);
        Ok(GainOutcome::Queued(gain))
    }

    pub fn status(&self) -> SessionStatus {
        let snap = self.shared.state.lock().snapshot();
        let metrics = self.shared.frames.metrics();
        let stats = &self.shared.stats;
        SessionStatus {
            running: snap.phase.is_active(),
            phase: snap.phase,
            transport: snap.transport,
            gain: snap.gain.value(),
            device: snap.device,
            frame_queue: metrics.current_size,
            reader_alive: stats.is_alive(),
            frames_read: stats.frames_read(),
            protocol_errors: stats.protocol_errors(),
            frames_dropped: metrics.total_dropped,
        }
    }

    /// Next live frame, waiting up to `timeout`; `None` means no new data yet
    pub fn pop_frame(&self, timeout: Duration) -> Option<Frame> {
        self.shared.frames.pop_timeout(timeout)
    }

    pub async fn pop_frame_async(&self, timeout: Duration) -> Option<Frame> {
        self.shared.frames.pop_timeout_async(timeout).await
    }

    /// The distribution queue itself, for consumers that outlive a borrow
    pub fn frame_queue(&self) -> Arc<BoundedQueue<Frame>> {
        Arc::clone(&self.shared.frames)
    }

    pub fn reader_stats(&self) -> Arc<ReaderStats> {
        Arc::clone(&self.shared.stats)
    }

    /// Enable or disable recording; takes effect for frames read from now on
    pub fn configure_recording(&self, config: RecordingConfig) {
        self.shared.recording.configure(config);
    }

    pub fn recording_config(&self) -> RecordingConfig {
        self.shared.recording.config()
    }

    /// Scan for nearby BLE devices without filtering
    ///
    /// Runs on its own thread and runtime, so it is safe to call from inside
    /// an async context as well as from plain threads.
    pub fn list_ble_devices(&self) -> SessionResult<BleScanReport> {
        let connector = Arc::clone(&self.connector);
        let settings = self.shared.config.ble.clone();
        let handle = std::thread::Builder::new()
            .name("ps-ble-scan".to_string())
            .spawn(move || -> SessionResult<BleScanReport> {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| SessionError::Runtime(e.to_string()))?;
                let devices = runtime.block_on(connector.list_ble_devices(&settings))?;
                Ok(BleScanReport {
                    prefix: settings.name_prefix,
                    devices,
                })
            })
            .map_err(|e| SessionError::Runtime(e.to_string()))?;

        handle
            .join()
            .map_err(|_| SessionError::Runtime("BLE scan thread panicked".to_string()))?
    }
}

impl Drop for SessionEngine {
    fn drop(&mut self) {
        if self.shared.state.lock().phase().is_active() {
            warn!("Engine dropped with an active session, requesting stop");
            self.shared.commands.push(Command::Stop);
        }
    }
}

/// Connect, push the current gain, start and launch the reader
async fn open_session(
    shared: &Shared,
    connector: &dyn DeviceConnector,
    transport: Transport,
) -> SessionResult<(Box<dyn SensorDevice>, ReaderActivity)> {
    let mut device = connector.open(transport, &shared.config).await?;
    info!("Connected to {}", device.describe());

    let gain = shared.state.lock().gain();
    let started = begin_streaming(shared, device.as_mut(), gain).await;
    match started {
        Ok(reader) => Ok((device, reader)),
        Err(e) => {
            cleanup(device.as_mut(), &shared.config.timing).await;
            Err(e)
        }
    }
}

async fn begin_streaming(
    shared: &Shared,
    device: &mut dyn SensorDevice,
    gain: Gain,
) -> SessionResult<ReaderActivity> {
    device.set_gain(gain).await?;
    device.start().await?;
    ReaderActivity::launch(device.frames()?, shared.sink(), device.transport())
}

async fn run_session(
    shared: Arc<Shared>,
    connector: Arc<dyn DeviceConnector>,
    transport: Transport,
    guard: SessionGuard,
    ready: mpsc::Sender<SessionResult<()>>,
) {
    let (mut device, reader) = match open_session(&shared, connector.as_ref(), transport).await {
        Ok(opened) => opened,
        Err(e) => {
            warn!("Session start failed: {}", e);
            guard.complete(Ok(None));
            let _ = ready.send(Err(e));
            return;
        }
    };
    shared.state.lock().connected(device.describe());
    let _ = ready.send(Ok(()));
    info!("Streaming from {}", device.describe());

    let timing = &shared.config.timing;
    let mut reader = Some(reader);
    let mut reported_dead = false;
    loop {
        let Some(command) = shared.commands.pop_timeout_async(timing.command_poll()).await else {
            if !reported_dead && reader.as_ref().is_some_and(ReaderActivity::is_finished) {
                warn!("Frame reader exited on its own; session stays up until stopped");
                reported_dead = true;
            }
            continue;
        };
        match command {
            Command::Stop => break,
            Command::SetGain(gain) => {
                reader = reconfigure(&shared, device.as_mut(), reader.take(), gain).await;
                reported_dead = false;
            }
        }
    }

    shared.state.lock().begin_stop();
    info!("Stopping {}", device.describe());
    if let Some(reader) = reader.take() {
        reader.shutdown(timing.reader_join()).await;
    }
    cleanup(device.as_mut(), timing).await;
    drop(device);

    let report = shared.recording.finish().map_err(|e| {
        warn!("Recording export failed: {}", e);
        e.to_string()
    });
    guard.complete(report);
}

/// Apply a new gain without interleaving frames from both configurations
///
/// The reader is fully stopped before the device sees the new gain and is
/// relaunched only after the device restarted. Device errors are logged and
/// the sequence carries on.
async fn reconfigure(
    shared: &Shared,
    device: &mut dyn SensorDevice,
    reader: Option<ReaderActivity>,
    gain: Gain,
) -> Option<ReaderActivity> {
    shared.state.lock().begin_reconfigure();
    info!("Reconfiguring gain to {}", gain);
    let timing = &shared.config.timing;

    if let Some(reader) = reader {
        reader.shutdown(timing.reader_join()).await;
    }

    if let Err(e) = device.stop().await {
        warn!("Stop before gain change failed: {}", e);
    }
    tokio::time::sleep(timing.reconfigure_settle()).await;

    match device.set_gain(gain).await {
        Ok(()) => shared.state.lock().set_gain(gain),
        Err(e) => warn!("Writing gain {} failed: {}", gain, e),
    }
    tokio::time::sleep(timing.reconfigure_settle()).await;

    if let Err(e) = device.start().await {
        warn!("Restart after gain change failed: {}", e);
    }

    let reader = match device.frames() {
        Ok(source) => match ReaderActivity::launch(source, shared.sink(), device.transport()) {
            Ok(reader) => Some(reader),
            Err(e) => {
                warn!("Relaunching frame reader failed: {}", e);
                None
            }
        },
        Err(e) => {
            warn!("No frame source after gain change: {}", e);
            None
        }
    };

    shared.state.lock().finish_reconfigure();
    info!("Gain now {}", gain);
    reader
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Connector whose discovery never finds anything
    #[derive(Default)]
    struct NoDevices {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl DeviceConnector for NoDevices {
        async fn open(
            &self,
            transport: Transport,
            _config: &SessionConfig,
        ) -> SessionResult<Box<dyn SensorDevice>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::DeviceNotFound(format!("no {} sensor", transport)))
        }

        async fn list_ble_devices(&self, _settings: &BleSettings) -> SessionResult<Vec<BleDeviceSummary>> {
            Ok(vec![BleDeviceSummary {
                name: "PS02-LF-01".to_string(),
                address: "AA:BB:CC:DD:EE:FF".to_string(),
                rssi: Some(-60),
                matches_prefix: true,
            }])
        }
    }

    fn engine() -> (SessionEngine, Arc<NoDevices>) {
        let connector = Arc::new(NoDevices::default());
        let mut config = SessionConfig::default();
        config.timing = crate::config::TimingSettings::fast();
        (SessionEngine::new(config, connector.clone()), connector)
    }

    #[test]
    fn test_failed_start_returns_to_idle() {
        let (engine, connector) = engine();

        let err = engine.start(Transport::Usb).unwrap_err();
        assert!(matches!(err, SessionError::DeviceNotFound(_)));
        assert_eq!(engine.status().phase, Phase::Idle);
        assert!(!engine.status().running);

        assert!(engine.start(Transport::Ble).is_err());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_idle_gain_applies_immediately() {
        let (engine, _) = engine();
        assert_eq!(engine.set_gain(4).unwrap(), GainOutcome::Applied(Gain::new(4).unwrap()));
        assert_eq!(engine.status().gain, 4);
    }

    #[test]
    fn test_out_of_range_gain_rejected() {
        let (engine, _) = engine();
        for bad in [-1, 16, 255] {
            assert!(matches!(
                engine.set_gain(bad),
                Err(SessionError::InvalidArgument(_))
            ));
        }
        assert_eq!(engine.status().gain, 15);
    }

    #[test]
    fn test_stop_when_idle() {
        let (engine, _) = engine();
        assert_eq!(engine.stop().unwrap(), StopOutcome::AlreadyStopped);
    }

    #[test]
    fn test_ble_listing_carries_prefix() {
        let (engine, _) = engine();
        let report = engine.list_ble_devices().unwrap();
        assert_eq!(report.prefix, "PS02-LF");
        assert_eq!(report.devices.len(), 1);
        assert!(report.devices[0].matches_prefix);
    }
}
