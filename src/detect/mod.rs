//! Detector/tracker collaborator.
//!
//! Person detection and multi-object tracking happen outside the kernel; this
//! module only defines the seam (`Tracker`) and ships two stand-ins that need
//! no model: a synthetic walker generator and a JSON-lines replay.

mod tracker;
mod trackers;

pub use tracker::Tracker;
pub use trackers::{ReplayTracker, StubTracker};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrackerBackend {
    #[default]
    Stub,
    Replay,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    pub backend: TrackerBackend,
    /// JSON-lines file consumed by the replay backend.
    pub replay_path: Option<PathBuf>,
}

/// Build the configured tracker for frames of `width`x`height`.
pub fn tracker_from_config(
    config: &TrackerConfig,
    width: u32,
    height: u32,
    line_y: f32,
) -> Result<Box<dyn Tracker>> {
    match config.backend {
        TrackerBackend::Stub => Ok(Box::new(StubTracker::new(width, height, line_y))),
        TrackerBackend::Replay => {
            let path = config
                .replay_path
                .as_ref()
                .ok_or_else(|| anyhow!("replay tracker requires replay_path"))?;
            Ok(Box::new(ReplayTracker::open(path)?))
        }
    }
}
