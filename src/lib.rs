//! Doorway Occupancy Kernel
//!
//! This crate turns a live camera feed into a clean stream of "entered" and
//! "exited" occupancy events for a single doorway with a fixed virtual
//! crossing line, keeps a running occupancy count, and persists per-individual
//! sessions for dwell-time analysis.
//!
//! # Architecture
//!
//! ```text
//! CameraSource -> Frame -> Tracker (external) -> TrackedObject*
//!     -> CrossingDetector -> CrossingEvent -> EventDebouncer
//!     -> SessionStore (persist) + OccupancyState (update)
//!     -> annotated Frame -> presentation (api)
//! ```
//!
//! The kernel holds two guarantees under continuous operation:
//!
//! 1. **Never stall**: device failures are recovered by the camera state
//!    machine; while offline the pipeline keeps emitting a placeholder frame.
//! 2. **Session consistency**: an exit only closes a session with a matching
//!    open entry; the durable log is append-only.
//!
//! # Module Structure
//!
//! - `ingest`: capture devices and the reconnecting `CameraSource`
//! - `detect`: the tracker collaborator interface
//! - `crossing`, `debounce`, `tracks`: track-to-event translation
//! - `storage`: durable session log
//! - `pipeline`: the driver loop; `control`: shared state
//! - `api`, `transport`: presentation and notification boundaries

use anyhow::{anyhow, Result};
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod api;
pub mod config;
pub mod control;
pub mod crossing;
pub mod debounce;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod occupancy;
pub mod pipeline;
pub mod storage;
pub mod tracks;
pub mod transport;

pub use control::{CameraStatus, Control, StatusSnapshot, SwitchOutcome};
pub use crossing::CrossingDetector;
pub use debounce::EventDebouncer;
pub use detect::{ReplayTracker, StubTracker, Tracker};
pub use frame::Frame;
pub use ingest::{
    Backoff, CameraSource, CameraState, Capture, CaptureDevice, DeviceConfig, SyntheticDevice,
};
pub use occupancy::{CapacityMonitor, OccupancyState};
pub use pipeline::{PipelineDriver, PipelineSettings};
pub use storage::{
    DwellSummary, InMemorySessionStore, OccupancyCounts, PersistedEvent, RecordOutcome,
    SessionStore, SqliteSessionStore,
};
pub use tracks::TrackTable;
pub use transport::{LinkStatus, Notification, NotificationDispatcher, Notifier, NotifyHandle};

/// Wall-clock timestamp in milliseconds since the Unix epoch.
pub type EpochMillis = i64;

/// Transient label the external tracker assigns to one physical object.
///
/// Stable only while the tracker keeps the object; after occlusion the same
/// value may be reassigned to somebody else.
pub type TrackId = i64;

pub fn now_ms() -> Result<EpochMillis> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
    i64::try_from(now.as_millis()).map_err(|_| anyhow!("system clock exceeds i64 millis"))
}

pub(crate) fn millis(duration: Duration) -> EpochMillis {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:occupancy_kernel_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    let conn = if db_path.starts_with("file:") {
        Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?
    } else {
        Connection::open(db_path)?
    };
    conn.busy_timeout(Duration::from_secs(2))?;
    Ok(conn)
}

// -------------------- Tracking Types --------------------

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center_y(&self) -> f32 {
        (self.y1 + self.y2) / 2.0
    }
}

/// One per-frame observation handed over by the tracker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrackedObject {
    pub track_id: TrackId,
    pub bbox: BoundingBox,
}

impl TrackedObject {
    pub fn new(track_id: TrackId, bbox: BoundingBox) -> Self {
        Self { track_id, bbox }
    }
}

// -------------------- Event Types --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Entered,
    Exited,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Entered => "entered",
            Direction::Exited => "exited",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "entered" => Ok(Direction::Entered),
            "exited" => Ok(Direction::Exited),
            other => Err(anyhow!("unknown direction '{}'", other)),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candidate event produced by the crossing detector. Never persisted as-is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrossingEvent {
    pub track_id: TrackId,
    pub direction: Direction,
    pub observed_at: EpochMillis,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_round_trips_through_str() -> Result<()> {
        assert_eq!(Direction::parse("entered")?, Direction::Entered);
        assert_eq!(Direction::parse(Direction::Exited.as_str())?, Direction::Exited);
        assert!(Direction::parse("inicio").is_err());
        Ok(())
    }

    #[test]
    fn bbox_center_is_vertical_midpoint() {
        let bbox = BoundingBox::new(10.0, 200.0, 50.0, 300.0);
        assert_eq!(bbox.center_y(), 250.0);
    }
}
