use anyhow::Result;
use std::collections::VecDeque;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use occupancy_kernel::ingest::DeviceConfig;
use occupancy_kernel::{
    shared_memory_uri, Backoff, BoundingBox, CameraSource, CameraStatus, Control, Direction,
    EpochMillis, Frame, LinkStatus, Notification, NotifyHandle, PipelineDriver, PipelineSettings,
    SessionStore, SqliteSessionStore, SyntheticDevice, TrackId, TrackedObject, Tracker,
};

/// Replays one observation list per frame, then reports nothing.
struct ScriptedTracker {
    frames: VecDeque<Vec<TrackedObject>>,
}

impl Tracker for ScriptedTracker {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn track(&mut self, _frame: &Frame) -> Result<Vec<TrackedObject>> {
        Ok(self.frames.pop_front().unwrap_or_default())
    }
}

fn person(track_id: TrackId, center_y: f32) -> TrackedObject {
    TrackedObject::new(
        track_id,
        BoundingBox::new(100.0, center_y - 50.0, 160.0, center_y + 50.0),
    )
}

struct Harness {
    driver: PipelineDriver,
    control: Arc<Control>,
    notifications: Receiver<Notification>,
    /// Second connection onto the same shared-memory database.
    log: SqliteSessionStore,
}

fn harness(
    device_url: &str,
    backoff: Backoff,
    script: Vec<Vec<TrackedObject>>,
    settings: PipelineSettings,
) -> Result<Harness> {
    let db = shared_memory_uri();
    let log = SqliteSessionStore::open(&db)?;
    let store = SqliteSessionStore::open(&db)?;
    let (notify, notifications) = NotifyHandle::channel();
    let device = SyntheticDevice::from_config(&DeviceConfig {
        url: device_url.to_string(),
        target_fps: 10,
        width: 64,
        height: 48,
    })?;
    let source = CameraSource::new(Box::new(device), backoff, None, notify.clone());
    let control = Arc::new(Control::new());
    let driver = PipelineDriver::new(
        source,
        Box::new(ScriptedTracker {
            frames: script.into(),
        }),
        Box::new(store),
        control.clone(),
        notify,
        PipelineSettings {
            width: 64,
            height: 48,
            ..settings
        },
    )?;
    control.set_active(true, Duration::ZERO)?;
    Ok(Harness {
        driver,
        control,
        notifications,
        log,
    })
}

fn run_script(h: &mut Harness, times: &[EpochMillis]) -> Result<()> {
    let t0 = Instant::now();
    for &ms in times {
        h.driver.step(t0, ms)?;
    }
    Ok(())
}

#[test]
fn single_visit_produces_one_session() -> Result<()> {
    let mut h = harness(
        "stub://door",
        Backoff::default(),
        vec![
            vec![person(7, 300.0)],
            vec![person(7, 240.0)],
            vec![person(7, 200.0)],
            vec![person(7, 260.0)],
        ],
        PipelineSettings::default(),
    )?;

    let t0 = Instant::now();
    h.driver.step(t0, 0)?;
    h.driver.step(t0, 100)?;
    assert_eq!(h.driver.occupancy().inside, 1);
    h.driver.step(t0, 200)?;
    assert_eq!(h.driver.occupancy().inside, 1);
    h.driver.step(t0, 4_100)?;

    let status = h.control.status()?;
    assert_eq!(status.occupancy.inside, 0);
    assert_eq!(status.occupancy.entered, 1);
    assert_eq!(status.occupancy.exited, 1);
    assert_eq!(status.frames_processed, 4);

    let events = h.log.events_between(0, EpochMillis::MAX)?;
    let actions: Vec<(TrackId, Direction, EpochMillis)> = events
        .iter()
        .map(|ev| (ev.track_id, ev.action, ev.timestamp))
        .collect();
    assert_eq!(
        actions,
        vec![(7, Direction::Entered, 100), (7, Direction::Exited, 4_100)]
    );

    let durations = h.log.durations(10_000)?;
    assert_eq!(durations.len(), 1);
    assert_eq!(durations[0].track_id, 7);
    assert_eq!(durations[0].closed_ms, 4_000);
    assert_eq!(durations[0].open_ms, None);
    assert_eq!(h.log.open_session_count()?, 0);
    Ok(())
}

#[test]
fn wobble_on_the_line_is_debounced() -> Result<()> {
    let mut h = harness(
        "stub://door",
        Backoff::default(),
        vec![
            vec![person(3, 300.0)],
            vec![person(3, 250.0)],
            vec![person(3, 300.0)],
            vec![person(3, 240.0)],
        ],
        PipelineSettings::default(),
    )?;
    run_script(&mut h, &[0, 100, 200, 300])?;

    assert_eq!(h.driver.occupancy().entered, 1);
    assert_eq!(h.driver.occupancy().inside, 1);
    assert_eq!(h.log.events_between(0, EpochMillis::MAX)?.len(), 1);
    Ok(())
}

#[test]
fn exit_without_entry_is_not_persisted() -> Result<()> {
    let mut h = harness(
        "stub://door",
        Backoff::default(),
        vec![vec![person(9, 200.0)], vec![person(9, 300.0)]],
        PipelineSettings::default(),
    )?;
    run_script(&mut h, &[0, 100])?;

    assert_eq!(h.driver.occupancy().inside, 0);
    assert_eq!(h.driver.occupancy().exited, 1);
    assert!(h.log.events_between(0, EpochMillis::MAX)?.is_empty());
    assert!(h.log.durations(1_000)?.is_empty());
    Ok(())
}

#[test]
fn open_session_counts_toward_duration() -> Result<()> {
    let mut h = harness(
        "stub://door",
        Backoff::default(),
        vec![vec![person(5, 300.0)], vec![person(5, 200.0)]],
        PipelineSettings::default(),
    )?;
    run_script(&mut h, &[1_000, 2_000])?;

    let durations = h.log.durations(9_000)?;
    assert_eq!(durations.len(), 1);
    assert_eq!(durations[0].open_ms, Some(7_000));
    assert_eq!(durations[0].total_ms, 7_000);
    Ok(())
}

#[test]
fn capacity_alert_fires_once_per_breach() -> Result<()> {
    let mut h = harness(
        "stub://door",
        Backoff::default(),
        vec![
            vec![person(1, 300.0), person(2, 300.0), person(3, 300.0)],
            vec![person(1, 200.0), person(2, 200.0), person(3, 200.0)],
        ],
        PipelineSettings {
            max_capacity: 1,
            ..PipelineSettings::default()
        },
    )?;
    run_script(&mut h, &[0, 100])?;

    let alerts: Vec<Notification> = h
        .notifications
        .try_iter()
        .filter(|n| matches!(n, Notification::CapacityExceeded { .. }))
        .collect();
    assert_eq!(
        alerts,
        vec![Notification::CapacityExceeded {
            inside: 2,
            capacity: 1
        }]
    );
    Ok(())
}

#[test]
fn camera_recovers_and_reports_each_attempt() -> Result<()> {
    let mut h = harness(
        "stub://door?fail_opens=2",
        Backoff::new(Duration::from_millis(10), Duration::from_millis(40)),
        Vec::new(),
        PipelineSettings::default(),
    )?;

    let t0 = Instant::now();
    h.driver.step(t0, 0)?;
    assert_eq!(
        h.control.status()?.camera,
        CameraStatus::Reconnecting { attempt: 1 }
    );
    let (_, placeholder) = h.control.latest_frame()?.expect("placeholder published");
    assert_eq!(&placeholder[..2], &[0xFF, 0xD8]);

    // Before the deadline nothing changes.
    h.driver.step(t0 + Duration::from_millis(5), 5)?;
    assert_eq!(
        h.control.status()?.camera,
        CameraStatus::Reconnecting { attempt: 1 }
    );

    h.driver.step(t0 + Duration::from_millis(10), 10)?;
    assert_eq!(
        h.control.status()?.camera,
        CameraStatus::Reconnecting { attempt: 2 }
    );

    h.driver.step(t0 + Duration::from_millis(30), 30)?;
    let status = h.control.status()?;
    assert_eq!(status.camera, CameraStatus::Streaming);
    assert_eq!(status.frames_processed, 1);

    let camera: Vec<LinkStatus> = h
        .notifications
        .try_iter()
        .filter_map(|n| match n {
            Notification::Camera { status } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(
        camera,
        vec![
            LinkStatus::Reconnecting { attempt: 1 },
            LinkStatus::Reconnecting { attempt: 2 },
            LinkStatus::Online,
        ]
    );
    Ok(())
}

#[test]
fn restart_reseeds_occupancy_from_the_log() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("occupancy.db");
    let db_path = db_path.to_string_lossy().to_string();
    {
        let mut store = SqliteSessionStore::open(&db_path)?;
        store.record_entry(1, 0)?;
        store.record_entry(2, 10)?;
        store.record_exit(1, 20)?;
    }

    let control = Arc::new(Control::new());
    let driver = PipelineDriver::new(
        CameraSource::new(
            Box::new(SyntheticDevice::new(64, 48)),
            Backoff::default(),
            None,
            NotifyHandle::disabled(),
        ),
        Box::new(ScriptedTracker {
            frames: VecDeque::new(),
        }),
        Box::new(SqliteSessionStore::open(&db_path)?),
        control,
        NotifyHandle::disabled(),
        PipelineSettings::default(),
    )?;
    let occupancy = driver.occupancy();
    assert_eq!(
        (occupancy.inside, occupancy.entered, occupancy.exited),
        (1, 2, 1)
    );
    Ok(())
}
