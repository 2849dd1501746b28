//! Pipeline driver.
//!
//! One thread owns every stateful stage and runs them in a fixed order per
//! tick:
//!
//! ```text
//! activation sync -> retry queued writes -> poll camera
//!   -> tracker -> crossing detector -> debouncer -> occupancy + store
//!   -> annotate + encode -> publish frame and status -> periodic sweep
//! ```
//!
//! Nothing in a tick blocks on the camera: reconnect waits are deadlines
//! inside `CameraSource`, so a deactivation request is applied on the next
//! tick even in the middle of a backoff.

use anyhow::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::control::{Control, StatusSnapshot};
use crate::crossing::CrossingDetector;
use crate::debounce::{EventDebouncer, DEFAULT_DEBOUNCE_MS};
use crate::detect::Tracker;
use crate::frame::Frame;
use crate::ingest::{CameraSource, Capture};
use crate::occupancy::{CapacityMonitor, OccupancyState};
use crate::storage::{RecordOutcome, SessionStore};
use crate::transport::NotifyHandle;
use crate::{now_ms, CrossingEvent, EpochMillis, TrackedObject};

const SWEEP_INTERVAL_MS: EpochMillis = 1_000;

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Vertical pixel coordinate of the virtual crossing line.
    pub line_y: f32,
    pub debounce_ms: EpochMillis,
    /// Per-track state untouched for this long is dropped.
    pub track_ttl_ms: EpochMillis,
    pub max_tracks: usize,
    /// Zero disables capacity alerts.
    pub max_capacity: u64,
    pub frame_interval: Duration,
    /// Size of the offline placeholder frame.
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
    /// Warn once when this many events are waiting to be persisted.
    pub pending_warn_at: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            line_y: 250.0,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            track_ttl_ms: DEFAULT_DEBOUNCE_MS * 10,
            max_tracks: 4096,
            max_capacity: 50,
            frame_interval: Duration::from_millis(100),
            width: 640,
            height: 480,
            jpeg_quality: 80,
            pending_warn_at: 10_000,
        }
    }
}

pub struct PipelineDriver {
    source: CameraSource,
    tracker: Box<dyn Tracker>,
    detector: CrossingDetector,
    debouncer: EventDebouncer,
    store: Box<dyn SessionStore>,
    occupancy: OccupancyState,
    capacity: CapacityMonitor,
    notify: NotifyHandle,
    control: Arc<Control>,
    settings: PipelineSettings,
    /// Accepted events not yet durable, oldest first.
    pending: VecDeque<CrossingEvent>,
    last_persistence_error: Option<String>,
    backlog_warned: bool,
    placeholder: Option<Arc<Vec<u8>>>,
    frames: u64,
    last_sweep: EpochMillis,
}

impl PipelineDriver {
    /// Build a driver, seeding the live tally from the durable log.
    pub fn new(
        source: CameraSource,
        tracker: Box<dyn Tracker>,
        mut store: Box<dyn SessionStore>,
        control: Arc<Control>,
        notify: NotifyHandle,
        settings: PipelineSettings,
    ) -> Result<Self> {
        let occupancy =
            OccupancyState::from_log(store.occupancy_counts()?, store.open_session_count()?);
        log::info!(
            "occupancy seeded from log: inside={} entered={} exited={}",
            occupancy.inside,
            occupancy.entered,
            occupancy.exited
        );
        Ok(Self {
            source,
            tracker,
            detector: CrossingDetector::new(settings.line_y, settings.max_tracks),
            debouncer: EventDebouncer::new(settings.debounce_ms, settings.max_tracks),
            store,
            occupancy,
            capacity: CapacityMonitor::new(settings.max_capacity),
            notify,
            control,
            settings,
            pending: VecDeque::new(),
            last_persistence_error: None,
            backlog_warned: false,
            placeholder: None,
            frames: 0,
            last_sweep: EpochMillis::MIN,
        })
    }

    pub fn occupancy(&self) -> OccupancyState {
        self.occupancy
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    pub fn source(&self) -> &CameraSource {
        &self.source
    }

    /// Run one tick. `now` drives camera deadlines, `wall_ms` stamps events.
    pub fn step(&mut self, now: Instant, wall_ms: EpochMillis) -> Result<()> {
        self.sync_activation()?;
        self.flush_pending();

        let jpeg = match self.source.poll(now) {
            Capture::Frame(frame) => self.process_frame(frame, wall_ms),
            Capture::Offline => self.placeholder_jpeg(),
        };
        match jpeg {
            Ok(jpeg) => self.control.publish_frame(jpeg)?,
            Err(err) => log::warn!("failed to encode live frame: {}", err),
        }

        self.maybe_sweep(wall_ms);
        self.publish_status(wall_ms)
    }

    /// Tick until `shutdown` is set, then release the camera.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        log::info!(
            "pipeline running (tracker: {}, line_y: {}, debounce: {}ms)",
            self.tracker.name(),
            self.settings.line_y,
            self.settings.debounce_ms
        );
        while !shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();
            self.step(started, now_ms()?)?;
            let remaining = self.settings.frame_interval.saturating_sub(started.elapsed());
            self.control.wait_tick(remaining)?;
        }
        self.source.deactivate();
        self.control.acknowledge(false)?;
        self.flush_pending();
        if !self.pending.is_empty() {
            log::error!(
                "shutting down with {} unpersisted events",
                self.pending.len()
            );
        }
        self.publish_status(now_ms()?)?;
        log::info!("pipeline stopped");
        Ok(())
    }

    fn sync_activation(&mut self) -> Result<()> {
        let desired = self.control.desired_active()?;
        if desired && !self.source.is_active() {
            self.source.activate();
        } else if !desired && self.source.is_active() {
            self.source.deactivate();
        }
        self.control.acknowledge(desired)
    }

    fn process_frame(&mut self, mut frame: Frame, wall_ms: EpochMillis) -> Result<Arc<Vec<u8>>> {
        self.frames += 1;
        let objects = match self.tracker.track(&frame) {
            Ok(objects) => objects,
            Err(err) => {
                log::warn!("tracker {} failed on frame {}: {}", self.tracker.name(), frame.seq, err);
                Vec::new()
            }
        };
        for object in &objects {
            self.observe(object, wall_ms);
        }
        frame.annotate(&objects, self.settings.line_y);
        Ok(Arc::new(frame.encode_jpeg(self.settings.jpeg_quality)?))
    }

    fn observe(&mut self, object: &TrackedObject, wall_ms: EpochMillis) {
        let Some(event) =
            self.detector
                .observe(object.track_id, object.bbox.center_y(), wall_ms)
        else {
            return;
        };
        if !self.debouncer.accept(&event) {
            log::debug!(
                "debounced {} for track {} at {}",
                event.direction,
                event.track_id,
                event.observed_at
            );
            return;
        }

        log::info!("track {} {}", event.track_id, event.direction);
        self.occupancy.apply(event.direction);
        if let Some(alert) = self.capacity.check(self.occupancy.inside) {
            log::warn!("{}", alert.summary());
            self.notify.send(alert);
        }
        self.persist(event);
    }

    fn persist(&mut self, event: CrossingEvent) {
        if !self.pending.is_empty() {
            self.queue(event);
            return;
        }
        if let Err(err) = self.write(&event) {
            log::error!(
                "failed to persist {} for track {}: {:#}; queued for retry",
                event.direction,
                event.track_id,
                err
            );
            self.last_persistence_error = Some(format!("{:#}", err));
            self.queue(event);
        }
    }

    fn queue(&mut self, event: CrossingEvent) {
        self.pending.push_back(event);
        if !self.backlog_warned && self.pending.len() >= self.settings.pending_warn_at {
            log::warn!(
                "{} events waiting to be persisted; session log unavailable",
                self.pending.len()
            );
            self.backlog_warned = true;
        }
    }

    fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        while let Some(event) = self.pending.front().copied() {
            if let Err(err) = self.write(&event) {
                log::debug!("persistence still failing: {:#}", err);
                self.last_persistence_error = Some(format!("{:#}", err));
                return;
            }
            self.pending.pop_front();
        }
        log::info!("persistence recovered; retry queue drained");
        self.last_persistence_error = None;
        self.backlog_warned = false;
    }

    fn write(&mut self, event: &CrossingEvent) -> Result<()> {
        match self
            .store
            .record(event.track_id, event.direction, event.observed_at)?
        {
            RecordOutcome::Recorded => {}
            RecordOutcome::DuplicateSession => log::debug!(
                "track {} already has an open session; entry not logged",
                event.track_id
            ),
            RecordOutcome::NoOpenSession => log::debug!(
                "track {} has no open session; exit not logged",
                event.track_id
            ),
        }
        Ok(())
    }

    fn placeholder_jpeg(&mut self) -> Result<Arc<Vec<u8>>> {
        if let Some(jpeg) = &self.placeholder {
            return Ok(jpeg.clone());
        }
        let jpeg = Arc::new(
            Frame::placeholder(self.settings.width, self.settings.height)
                .encode_jpeg(self.settings.jpeg_quality)?,
        );
        self.placeholder = Some(jpeg.clone());
        Ok(jpeg)
    }

    fn maybe_sweep(&mut self, wall_ms: EpochMillis) {
        if wall_ms.saturating_sub(self.last_sweep) < SWEEP_INTERVAL_MS {
            return;
        }
        self.last_sweep = wall_ms;
        let ttl = self.settings.track_ttl_ms;
        let positions = self.detector.sweep(wall_ms, ttl);
        let records = self.debouncer.sweep(wall_ms, ttl);
        if positions + records > 0 {
            log::debug!(
                "swept {} stale positions and {} debounce records",
                positions,
                records
            );
        }
    }

    fn publish_status(&self, wall_ms: EpochMillis) -> Result<()> {
        self.control.publish_status(StatusSnapshot {
            camera: self.source.status(),
            active: self.source.is_active(),
            occupancy: self.occupancy,
            frames_processed: self.frames,
            pending_writes: self.pending.len(),
            last_persistence_error: self.last_persistence_error.clone(),
            updated_at: wall_ms,
        })
    }
}
