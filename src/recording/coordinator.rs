// Recording coordinator: cameras, polling threads and the shared writer pool
//
// Each attached camera gets a polling thread that drains its device on a fixed
// cadence. The polling thread never touches disk or the encoder; it publishes
// the newest frame for preview and, while recording, hands the whole batch to
// the camera's serial queue on the shared writer pool. Stopping a recording is
// queued behind that camera's pending writes and the caller waits for it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;

use super::buffer::{FrameBatch, FrameBuffer};
use super::pool::{SerialQueue, WorkerPool};
use super::session::{RecordingError, RecordingSession, RecordingSettings, RecordingSummary, Result};
use super::RecordingStatus;
use crate::config::{CameraConfig, Config};
use crate::devices::{CameraDevice, DeviceError, DeviceInfo, Frame};
use crate::encoding::EncoderSettings;
use crate::session::SessionPaths;

/// Events buffered for a slow consumer before new ones are discarded
const EVENT_CAPACITY: usize = 1024;

const MIN_POLL_HZ: u32 = 1;
const MAX_POLL_HZ: u32 = 1000;

/// Coordinator-wide settings, derived from [`Config`]
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub poll_interval: Duration,
    pub worker_threads: usize,
    /// Pending write batches per camera that trigger a backpressure warning
    pub backpressure_threshold: usize,
    pub encoder: EncoderSettings,
}

impl CoordinatorSettings {
    /// Polling period for a rate in Hz, clamped to 1..=1000
    pub fn poll_interval_for(poll_hz: u32) -> Duration {
        let hz = poll_hz.clamp(MIN_POLL_HZ, MAX_POLL_HZ);
        Duration::from_secs_f64(1.0 / hz as f64)
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for CoordinatorSettings {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: Self::poll_interval_for(config.poll_hz),
            worker_threads: config.worker_threads.max(1),
            backpressure_threshold: config.backpressure_threshold.max(1),
            encoder: config.encoder.clone(),
        }
    }
}

/// Per-camera notifications for the operator
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CameraEvent {
    /// Sequence gap detected while draining; acquisition continues
    FramesDropped {
        camera_id: String,
        count: u64,
        total: u64,
    },
    /// Delivered frame rate is well below the requested rate
    FpsWarning {
        camera_id: String,
        actual_fps: f64,
        expected_fps: f64,
    },
    /// Writes are falling behind acquisition
    BackpressureWarning { camera_id: String, depth: usize },
    /// The device failed; its polling thread has stopped
    DeviceFault { camera_id: String, message: String },
    /// A recording was finalized, either on request or after a failure
    RecordingStopped {
        camera_id: String,
        summary: Option<RecordingSummary>,
        error: Option<String>,
    },
}

impl CameraEvent {
    pub fn camera_id(&self) -> &str {
        match self {
            CameraEvent::FramesDropped { camera_id, .. }
            | CameraEvent::FpsWarning { camera_id, .. }
            | CameraEvent::BackpressureWarning { camera_id, .. }
            | CameraEvent::DeviceFault { camera_id, .. }
            | CameraEvent::RecordingStopped { camera_id, .. } => camera_id,
        }
    }
}

/// Point-in-time counters for one camera
#[derive(Debug, Clone, Serialize)]
pub struct CameraStats {
    pub camera_id: String,
    pub connected: bool,
    pub status: RecordingStatus,
    /// Frames drained since the current device was attached
    pub frames_drained: u64,
    /// Frames lost since the current device was attached
    pub dropped_frames: u64,
    /// Frames written by the active recording
    pub recorded_frames: u64,
    /// Frames lost during the active recording
    pub session_dropped_frames: u64,
    /// Write batches waiting on the pool
    pub queue_depth: usize,
}

/// State shared between a camera's polling thread, its write jobs and the coordinator
struct CameraShared {
    id: String,
    config: CameraConfig,
    info: Mutex<DeviceInfo>,
    session: Mutex<RecordingSession>,
    queue: Arc<SerialQueue>,
    events: Sender<CameraEvent>,

    recording: AtomicBool,
    generation: AtomicU64,
    connected: AtomicBool,
    backpressure_warned: AtomicBool,
    preview: Mutex<Option<Frame>>,

    status: Mutex<RecordingStatus>,
    frames_drained: AtomicU64,
    dropped_frames: AtomicU64,
    recorded_frames: AtomicU64,
    session_dropped: AtomicU64,
    drop_reports: AtomicUsize,
}

impl CameraShared {
    fn emit(&self, event: CameraEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                log::debug!("[Coordinator] Event queue full, discarding {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Mirror session counters so stats never wait on the session lock
    fn sync_stats(&self, session: &RecordingSession) {
        *self.status.lock() = session.status();
        self.recorded_frames
            .store(session.recorded_frame_count(), Ordering::Relaxed);
        self.session_dropped
            .store(session.dropped_frame_count(), Ordering::Relaxed);
    }

    /// Generation that frames drained from now on belong to, if recording
    fn routing_generation(&self) -> Option<u64> {
        let recording = self.recording.load(Ordering::SeqCst);
        let generation = self.generation.load(Ordering::SeqCst);
        recording.then_some(generation)
    }
}

struct CameraHandle {
    shared: Arc<CameraShared>,
    poller: Option<Poller>,
}

struct Poller {
    stop: Sender<()>,
    thread: JoinHandle<Option<Box<dyn CameraDevice>>>,
}

/// A poller that never started, with the device it was given
type SpawnFailure = (RecordingError, Box<dyn CameraDevice>);

impl Poller {
    /// Stop the polling thread and take the device back
    fn stop(self) -> Option<Box<dyn CameraDevice>> {
        drop(self.stop);
        match self.thread.join() {
            Ok(device) => device,
            Err(_) => {
                log::error!("[Coordinator] Polling thread panicked");
                None
            }
        }
    }
}

/// Owns every attached camera and the writer pool they share
pub struct RecordingCoordinator {
    settings: CoordinatorSettings,
    pool: WorkerPool,
    cameras: Mutex<HashMap<String, CameraHandle>>,
    events_tx: Sender<CameraEvent>,
    events_rx: Receiver<CameraEvent>,
}

impl RecordingCoordinator {
    pub fn new(settings: CoordinatorSettings) -> Result<Self> {
        let pool = WorkerPool::new(settings.worker_threads).map_err(RecordingError::ThreadSpawn)?;
        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_CAPACITY);

        log::info!(
            "[Coordinator] Polling every {:?}, {} writer threads",
            settings.poll_interval,
            pool.threads()
        );

        Ok(Self {
            settings,
            pool,
            cameras: Mutex::new(HashMap::new()),
            events_tx,
            events_rx,
        })
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Start capturing on `device` and begin polling it
    pub fn attach_camera(&self, config: CameraConfig, mut device: Box<dyn CameraDevice>) -> Result<()> {
        config
            .validate()
            .map_err(|e| RecordingError::DeviceFault(DeviceError::Config(e)))?;

        // Device start-up can take seconds; other cameras stay usable meanwhile
        if self.cameras.lock().contains_key(&config.id) {
            return Err(RecordingError::DuplicateCamera(config.id));
        }

        device.begin_capturing()?;
        let info = device.info().clone();

        let shared = Arc::new(CameraShared {
            id: config.id.clone(),
            queue: self.pool.queue(config.id.clone()),
            info: Mutex::new(info.clone()),
            session: Mutex::new(RecordingSession::new()),
            events: self.events_tx.clone(),
            recording: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            connected: AtomicBool::new(true),
            backpressure_warned: AtomicBool::new(false),
            preview: Mutex::new(None),
            status: Mutex::new(RecordingStatus::Idle),
            frames_drained: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            recorded_frames: AtomicU64::new(0),
            session_dropped: AtomicU64::new(0),
            drop_reports: AtomicUsize::new(0),
            config,
        });

        let poller = self
            .spawn_poller(shared.clone(), device)
            .map_err(|(e, device)| {
                release_device(&shared.id, device);
                e
            })?;

        let mut cameras = self.cameras.lock();
        if cameras.contains_key(&shared.id) {
            drop(cameras);
            log::warn!("[Coordinator] {} was attached concurrently, releasing new device", shared.id);
            if let Some(device) = poller.stop() {
                release_device(&shared.id, device);
            }
            return Err(RecordingError::DuplicateCamera(shared.id.clone()));
        }

        log::info!(
            "[Coordinator] Attached {} ({} {}, {}x{}, {} GPIO lines)",
            shared.id,
            info.model,
            info.serial_number,
            info.width,
            info.height,
            info.n_gpio()
        );

        cameras.insert(
            shared.id.clone(),
            CameraHandle {
                shared,
                poller: Some(poller),
            },
        );
        Ok(())
    }

    /// Stop any active recording, stop polling and release the device
    pub fn detach_camera(&self, camera_id: &str) -> Result<Option<RecordingSummary>> {
        let handle = self
            .cameras
            .lock()
            .remove(camera_id)
            .ok_or_else(|| RecordingError::UnknownCamera(camera_id.to_string()))?;

        let stopped = stop_camera_recording(&handle.shared);

        if let Some(device) = handle.poller.and_then(Poller::stop) {
            release_device(camera_id, device);
        }
        handle.shared.connected.store(false, Ordering::SeqCst);

        log::info!("[Coordinator] Detached {}", camera_id);
        stopped
    }

    /// Swap the device behind an attached camera. Any active recording is
    /// stopped first; its summary is returned.
    pub fn replace_device(
        &self,
        camera_id: &str,
        mut device: Box<dyn CameraDevice>,
    ) -> Result<Option<RecordingSummary>> {
        let mut handle = self
            .cameras
            .lock()
            .remove(camera_id)
            .ok_or_else(|| RecordingError::UnknownCamera(camera_id.to_string()))?;
        let shared = handle.shared.clone();

        let stopped = stop_camera_recording(&shared);

        if let Some(old) = handle.poller.take().and_then(Poller::stop) {
            release_device(camera_id, old);
        }
        shared.connected.store(false, Ordering::SeqCst);

        let started = match device.begin_capturing() {
            Ok(()) => {
                *shared.info.lock() = device.info().clone();
                shared.connected.store(true, Ordering::SeqCst);
                *shared.preview.lock() = None;
                self.spawn_poller(shared.clone(), device).map_err(|(e, device)| {
                    release_device(camera_id, device);
                    e
                })
            }
            Err(e) => Err(RecordingError::from(e)),
        };

        let result = match started {
            Ok(poller) => {
                handle.poller = Some(poller);
                log::info!("[Coordinator] Replaced device for {}", camera_id);
                stopped
            }
            Err(e) => {
                shared.connected.store(false, Ordering::SeqCst);
                log::error!("[Coordinator] {}: replacement device failed: {}", camera_id, e);
                Err(e)
            }
        };

        self.cameras.lock().insert(camera_id.to_string(), handle);
        result
    }

    /// Open the output files for one camera and start recording its frames
    pub fn start_recording(&self, camera_id: &str, subject_id: &str, save_dir: &Path) -> Result<SessionPaths> {
        let shared = self.camera(camera_id)?;
        if !shared.connected.load(Ordering::SeqCst) {
            return Err(RecordingError::DeviceFault(DeviceError::Disconnected(
                camera_id.to_string(),
            )));
        }

        let settings = RecordingSettings::new(&shared.config, &shared.info.lock(), &self.settings.encoder);

        let mut session = shared.session.lock();
        let paths = session.start_recording(subject_id, save_dir, &settings)?;

        // Publish the generation before frames are routed to it
        shared.generation.store(session.generation(), Ordering::SeqCst);
        shared.backpressure_warned.store(false, Ordering::SeqCst);
        shared.recording.store(true, Ordering::SeqCst);
        shared.sync_stats(&session);

        log::info!("[Coordinator] {} recording to {}", camera_id, paths.video.display());
        Ok(paths)
    }

    /// Stop recording once every batch already queued for this camera is written.
    /// Returns `None` when the camera was not recording.
    pub fn stop_recording(&self, camera_id: &str) -> Result<Option<RecordingSummary>> {
        let shared = self.camera(camera_id)?;
        stop_camera_recording(&shared)
    }

    /// Newest frame drained from the camera, for preview
    pub fn latest_frame(&self, camera_id: &str) -> Option<Frame> {
        let shared = self.camera(camera_id).ok()?;
        let frame = shared.preview.lock().clone();
        frame
    }

    pub fn stats(&self, camera_id: &str) -> Option<CameraStats> {
        let shared = self.camera(camera_id).ok()?;
        let status = *shared.status.lock();
        Some(CameraStats {
            camera_id: shared.id.clone(),
            connected: shared.connected.load(Ordering::SeqCst),
            status,
            frames_drained: shared.frames_drained.load(Ordering::Relaxed),
            dropped_frames: shared.dropped_frames.load(Ordering::Relaxed),
            recorded_frames: shared.recorded_frames.load(Ordering::Relaxed),
            session_dropped_frames: shared.session_dropped.load(Ordering::Relaxed),
            queue_depth: shared.queue.depth(),
        })
    }

    /// Attached camera ids, sorted
    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cameras.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Receiver for camera events. Clones share one queue: each event is
    /// delivered to exactly one receiver.
    pub fn events(&self) -> Receiver<CameraEvent> {
        self.events_rx.clone()
    }

    /// Stop every recording, detach every camera and stop the writer pool
    pub fn shutdown(&mut self) {
        for camera_id in self.camera_ids() {
            if let Err(e) = self.detach_camera(&camera_id) {
                log::error!("[Coordinator] {}: {}", camera_id, e);
            }
        }
        self.pool.shutdown();
    }

    fn camera(&self, camera_id: &str) -> Result<Arc<CameraShared>> {
        self.cameras
            .lock()
            .get(camera_id)
            .map(|h| h.shared.clone())
            .ok_or_else(|| RecordingError::UnknownCamera(camera_id.to_string()))
    }

    /// Start the polling thread. The device is handed over only once the
    /// thread exists, so a failed spawn returns it to the caller.
    fn spawn_poller(
        &self,
        shared: Arc<CameraShared>,
        device: Box<dyn CameraDevice>,
    ) -> std::result::Result<Poller, SpawnFailure> {
        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let (handoff, handoff_rx) = crossbeam_channel::bounded::<Box<dyn CameraDevice>>(1);
        let interval = self.settings.poll_interval;
        let threshold = self.settings.backpressure_threshold;
        let name = format!("camrig-poll-{}", shared.id);

        let spawned = std::thread::Builder::new().name(name).spawn(move || {
            let Ok(device) = handoff_rx.recv() else {
                return None;
            };
            Some(poll_loop(shared, device, stop_rx, interval, threshold))
        });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => return Err((RecordingError::ThreadSpawn(e), device)),
        };

        handoff
            .send(device)
            .map_err(|e| (RecordingError::WorkerUnavailable, e.into_inner()))?;

        Ok(Poller { stop, thread })
    }
}

impl Drop for RecordingCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn release_device(camera_id: &str, mut device: Box<dyn CameraDevice>) {
    if let Err(e) = device.stop_capturing() {
        log::warn!("[Coordinator] {}: stop capturing failed: {}", camera_id, e);
    }
}

/// Body of a camera's polling thread. Returns the device when stopped.
fn poll_loop(
    shared: Arc<CameraShared>,
    mut device: Box<dyn CameraDevice>,
    stop: Receiver<()>,
    interval: Duration,
    threshold: usize,
) -> Box<dyn CameraDevice> {
    let mut buffer = FrameBuffer::new(shared.config.fps);
    log::debug!("[Camera] {} polling started", shared.id);

    loop {
        let tick = Instant::now();

        // Taken before draining: a batch never lands in a recording started after it
        let route = shared.routing_generation();

        match buffer.poll(device.as_mut()) {
            Ok(batch) => handle_batch(&shared, batch, buffer.dropped_frames(), route, threshold),
            Err(e) => {
                handle_fault(&shared, e);
                break;
            }
        }

        shared
            .frames_drained
            .store(buffer.frames_drained(), Ordering::Relaxed);
        shared
            .dropped_frames
            .store(buffer.dropped_frames(), Ordering::Relaxed);

        if let Some(actual_fps) = buffer.check_fps() {
            log::warn!(
                "[Camera] {}: delivering {:.1} fps, expected {:.1}",
                shared.id,
                actual_fps,
                shared.config.fps
            );
            shared.emit(CameraEvent::FpsWarning {
                camera_id: shared.id.clone(),
                actual_fps,
                expected_fps: shared.config.fps,
            });
        }

        // Re-arm the backpressure warning once the backlog has halved
        if shared.queue.depth() <= threshold / 2 {
            shared.backpressure_warned.store(false, Ordering::Relaxed);
        }

        match stop.recv_timeout(interval.saturating_sub(tick.elapsed())) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }

    log::debug!("[Camera] {} polling stopped", shared.id);
    device
}

fn handle_batch(
    shared: &Arc<CameraShared>,
    batch: FrameBatch,
    total_dropped: u64,
    route: Option<u64>,
    threshold: usize,
) {
    if let Some(newest) = batch.newest() {
        *shared.preview.lock() = Some(newest.clone());
    }

    if batch.newly_dropped > 0 {
        let reports = shared.drop_reports.fetch_add(1, Ordering::Relaxed) + 1;
        if reports == 1 || reports % 100 == 0 {
            log::warn!(
                "[Camera] {}: {} frames dropped ({} total)",
                shared.id,
                batch.newly_dropped,
                total_dropped
            );
        }
        shared.emit(CameraEvent::FramesDropped {
            camera_id: shared.id.clone(),
            count: batch.newly_dropped,
            total: total_dropped,
        });
    }

    let generation = match route {
        Some(generation) if !batch.is_empty() => generation,
        _ => return,
    };

    let job_shared = shared.clone();
    let FrameBatch { frames, newly_dropped } = batch;

    let submitted = shared.queue.submit(Box::new(move || {
        write_batch(&job_shared, generation, &frames, newly_dropped);
    }));

    match submitted {
        Ok(depth) if depth > threshold => {
            if !shared.backpressure_warned.swap(true, Ordering::Relaxed) {
                log::warn!(
                    "[Coordinator] {}: {} write batches pending, encoder is falling behind",
                    shared.id,
                    depth
                );
                shared.emit(CameraEvent::BackpressureWarning {
                    camera_id: shared.id.clone(),
                    depth,
                });
            }
        }
        Ok(_) => {}
        Err(e) => log::error!("[Coordinator] {}: {}", shared.id, e),
    }
}

/// Write job: runs on the pool, at most one per camera at a time
fn write_batch(shared: &CameraShared, generation: u64, frames: &[Frame], newly_dropped: u64) {
    let mut session = shared.session.lock();

    // Drained for a recording that has since ended
    if session.generation() != generation || !session.is_active() {
        return;
    }

    match session.write_frames(frames, newly_dropped) {
        Ok(_) => shared.sync_stats(&session),
        Err(e) => {
            shared.recording.store(false, Ordering::SeqCst);
            shared.sync_stats(&session);
            let summary = session.last_summary().cloned();
            drop(session);
            shared.emit(CameraEvent::RecordingStopped {
                camera_id: shared.id.clone(),
                summary,
                error: Some(e.to_string()),
            });
        }
    }
}

fn handle_fault(shared: &Arc<CameraShared>, error: DeviceError) {
    log::error!("[Camera] {} fault: {}", shared.id, error);
    shared.connected.store(false, Ordering::SeqCst);
    shared.emit(CameraEvent::DeviceFault {
        camera_id: shared.id.clone(),
        message: error.to_string(),
    });

    if !shared.recording.swap(false, Ordering::SeqCst) {
        return;
    }

    // Finish after the batches already queued, without blocking this thread
    let job_shared = shared.clone();
    let cause = RecordingError::DeviceFault(error);
    if let Err(e) = shared.queue.submit(Box::new(move || {
        let _ = close_recording(&job_shared, Some(cause));
    })) {
        log::error!("[Coordinator] {}: could not queue stop: {}", shared.id, e);
    }
}

/// Queue a stop behind this camera's pending writes and wait for it
fn stop_camera_recording(shared: &Arc<CameraShared>) -> Result<Option<RecordingSummary>> {
    shared.recording.store(false, Ordering::SeqCst);

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let job_shared = shared.clone();
    let submitted = shared.queue.submit(Box::new(move || {
        let _ = done_tx.send(close_recording(&job_shared, None));
    }));

    match submitted {
        Ok(_) => done_rx.recv().map_err(|_| RecordingError::WorkerUnavailable)?,
        // Pool already gone: nothing else can be writing, close inline
        Err(_) => close_recording(shared, None),
    }
}

/// Finalize the session (if active) and report it
fn close_recording(shared: &CameraShared, cause: Option<RecordingError>) -> Result<Option<RecordingSummary>> {
    let mut session = shared.session.lock();
    let result = match cause {
        None => session.stop_recording(),
        Some(cause) => session.abort(cause),
    };
    shared.sync_stats(&session);
    let last_summary = session.last_summary().cloned();
    drop(session);

    match &result {
        Ok(None) => {}
        Ok(Some(summary)) => shared.emit(CameraEvent::RecordingStopped {
            camera_id: shared.id.clone(),
            summary: Some(summary.clone()),
            error: None,
        }),
        Err(e) => shared.emit(CameraEvent::RecordingStopped {
            camera_id: shared.id.clone(),
            summary: last_summary,
            error: Some(e.to_string()),
        }),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{default_gpio_line_names, GpioState};
    use crate::encoding::PixelFormat;
    use std::collections::VecDeque;

    /// Device fed by the test; an empty script entry is an empty drain
    struct FedCamera {
        info: DeviceInfo,
        feed: Arc<Mutex<VecDeque<crate::devices::Result<Vec<Frame>>>>>,
    }

    impl CameraDevice for FedCamera {
        fn info(&self) -> &DeviceInfo {
            &self.info
        }
        fn begin_capturing(&mut self) -> crate::devices::Result<()> {
            Ok(())
        }
        fn stop_capturing(&mut self) -> crate::devices::Result<()> {
            Ok(())
        }
        fn drain(&mut self) -> crate::devices::Result<Vec<Frame>> {
            self.feed.lock().pop_front().unwrap_or(Ok(Vec::new()))
        }
    }

    type Feed = Arc<Mutex<VecDeque<crate::devices::Result<Vec<Frame>>>>>;

    fn fed_camera() -> (Box<dyn CameraDevice>, Feed) {
        let feed: Feed = Arc::new(Mutex::new(VecDeque::new()));
        let camera = FedCamera {
            info: DeviceInfo {
                model: "Fed".into(),
                serial_number: "F1".into(),
                width: 2,
                height: 2,
                pixel_format: PixelFormat::Gray8,
                gpio_lines: default_gpio_line_names(1),
            },
            feed: feed.clone(),
        };
        (Box::new(camera), feed)
    }

    fn frames(seqs: &[u64]) -> Vec<Frame> {
        seqs.iter()
            .map(|&s| Frame {
                sequence_number: s,
                timestamp_ns: s,
                pixels: Arc::from(vec![0u8; 4]),
                gpio: GpioState::from_bits(s as u32, 1),
            })
            .collect()
    }

    fn coordinator() -> RecordingCoordinator {
        coordinator_with(EncoderSettings::default())
    }

    fn coordinator_with(encoder: EncoderSettings) -> RecordingCoordinator {
        RecordingCoordinator::new(CoordinatorSettings {
            poll_interval: Duration::from_millis(5),
            worker_threads: 2,
            backpressure_threshold: 4,
            encoder,
        })
        .unwrap()
    }

    fn camera_config(id: &str) -> CameraConfig {
        CameraConfig {
            id: id.into(),
            name: id.into(),
            width: 2,
            height: 2,
            ..CameraConfig::default()
        }
    }

    fn wait_for<T>(rx: &Receiver<CameraEvent>, mut pick: impl FnMut(CameraEvent) -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = rx.recv_timeout(remaining).expect("timed out waiting for event");
            if let Some(value) = pick(event) {
                return value;
            }
        }
    }

    #[test]
    fn poll_rate_is_clamped() {
        assert_eq!(CoordinatorSettings::poll_interval_for(0), Duration::from_secs(1));
        assert_eq!(
            CoordinatorSettings::poll_interval_for(5000),
            Duration::from_millis(1)
        );
    }

    #[test]
    fn attach_publishes_preview_and_drop_events() {
        let coordinator = coordinator();
        let (device, feed) = fed_camera();
        feed.lock().push_back(Ok(frames(&[1, 2, 3])));
        feed.lock().push_back(Ok(frames(&[5, 6])));

        coordinator.attach_camera(camera_config("cam0"), device).unwrap();
        assert!(matches!(
            coordinator.attach_camera(camera_config("cam0"), fed_camera().0),
            Err(RecordingError::DuplicateCamera(_))
        ));

        let events = coordinator.events();
        let (count, total) = wait_for(&events, |e| match e {
            CameraEvent::FramesDropped { count, total, .. } => Some((count, total)),
            _ => None,
        });
        assert_eq!((count, total), (1, 1));

        let preview = coordinator.latest_frame("cam0").unwrap();
        assert_eq!(preview.sequence_number, 6);

        let stats = coordinator.stats("cam0").unwrap();
        assert!(stats.connected);
        assert_eq!(stats.status, RecordingStatus::Idle);
        assert_eq!(coordinator.camera_ids(), vec!["cam0".to_string()]);
    }

    #[test]
    fn unknown_camera_is_reported() {
        let coordinator = coordinator();
        assert!(matches!(
            coordinator.stop_recording("nope"),
            Err(RecordingError::UnknownCamera(_))
        ));
        assert!(coordinator.stats("nope").is_none());
        assert!(coordinator.latest_frame("nope").is_none());
    }

    #[test]
    fn device_fault_marks_camera_disconnected() {
        let coordinator = coordinator();
        let (device, feed) = fed_camera();
        feed.lock().push_back(Err(DeviceError::Disconnected("unplugged".into())));
        coordinator.attach_camera(camera_config("cam0"), device).unwrap();

        let events = coordinator.events();
        let message = wait_for(&events, |e| match e {
            CameraEvent::DeviceFault { message, .. } => Some(message),
            _ => None,
        });
        assert!(message.contains("unplugged"));
        assert!(!coordinator.stats("cam0").unwrap().connected);

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            coordinator.start_recording("cam0", "m1", dir.path()),
            Err(RecordingError::DeviceFault(_))
        ));
    }

    #[test]
    fn replace_device_restarts_polling() {
        let coordinator = coordinator();
        let (device, _feed) = fed_camera();
        coordinator.attach_camera(camera_config("cam0"), device).unwrap();

        let (replacement, feed) = fed_camera();
        feed.lock().push_back(Ok(frames(&[10, 11])));
        assert!(coordinator.replace_device("cam0", replacement).unwrap().is_none());

        let deadline = Instant::now() + Duration::from_secs(5);
        while coordinator.latest_frame("cam0").map(|f| f.sequence_number) != Some(11) {
            assert!(Instant::now() < deadline, "replacement frames never arrived");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(coordinator.stats("cam0").unwrap().connected);
    }

    #[test]
    fn detach_removes_camera() {
        let mut coordinator = coordinator();
        let (device, _feed) = fed_camera();
        coordinator.attach_camera(camera_config("cam0"), device).unwrap();

        assert!(coordinator.detach_camera("cam0").unwrap().is_none());
        assert!(coordinator.camera_ids().is_empty());
        assert!(matches!(
            coordinator.detach_camera("cam0"),
            Err(RecordingError::UnknownCamera(_))
        ));
        coordinator.shutdown();
    }

    #[cfg(unix)]
    #[test]
    fn batch_drained_before_restart_stays_out_of_new_recording() {
        use crate::session::SessionMetadata;

        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator_with(EncoderSettings {
            program: "sh".into(),
            program_args: vec![
                "-c".into(),
                r#"for last; do :; done; cat > "$last""#.into(),
                "encoder".into(),
            ],
            ..EncoderSettings::default()
        });
        let (device, feed) = fed_camera();
        coordinator.attach_camera(camera_config("cam0"), device).unwrap();
        let shared = coordinator.camera("cam0").unwrap();
        assert_eq!(shared.routing_generation(), None);

        let first = coordinator.start_recording("cam0", "m1", dir.path()).unwrap();
        let route = shared.routing_generation();
        assert_eq!(route, Some(1));

        // Drained while the first recording ran, handed over after a restart
        let stale = FrameBatch {
            frames: frames(&[1, 2, 3]),
            newly_dropped: 0,
        };
        coordinator.stop_recording("cam0").unwrap();
        assert_eq!(shared.routing_generation(), None);
        let second = coordinator.start_recording("cam0", "m2", dir.path()).unwrap();
        handle_batch(&shared, stale, 0, route, 4);

        std::thread::sleep(Duration::from_millis(50));
        feed.lock().push_back(Ok(frames(&[4])));
        let deadline = Instant::now() + Duration::from_secs(5);
        while coordinator.stats("cam0").unwrap().recorded_frames != 1 {
            assert!(Instant::now() < deadline, "frame 4 was never recorded");
            std::thread::sleep(Duration::from_millis(5));
        }

        let summary = coordinator.stop_recording("cam0").unwrap().unwrap();
        assert_eq!(summary.recorded_frame_count, 1);
        assert_eq!(SessionMetadata::read(&first.metadata).unwrap().recorded_frame_count, 0);
        assert_eq!(SessionMetadata::read(&second.metadata).unwrap().recorded_frame_count, 1);
    }
}
