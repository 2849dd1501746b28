//! Line-crossing detection.
//!
//! The doorway is modelled as a horizontal line at `line_y`. A track moving
//! from below the line (larger y) to on-or-above it is an entry; moving from
//! above to on-or-below it is an exit. Equality counts as "has crossed" on
//! the side reached and never as the side left.

use crate::tracks::TrackTable;
use crate::{CrossingEvent, Direction, EpochMillis, TrackId};

/// Classify the move between two consecutive vertical centres.
pub fn classify_crossing(prev_y: f32, cy: f32, line_y: f32) -> Option<Direction> {
    if prev_y > line_y && cy <= line_y {
        Some(Direction::Entered)
    } else if prev_y < line_y && cy >= line_y {
        Some(Direction::Exited)
    } else {
        None
    }
}

/// Per-track positional memory plus the crossing rule.
pub struct CrossingDetector {
    line_y: f32,
    positions: TrackTable<f32>,
}

impl CrossingDetector {
    pub fn new(line_y: f32, max_tracks: usize) -> Self {
        Self {
            line_y,
            positions: TrackTable::with_capacity(max_tracks),
        }
    }

    pub fn line_y(&self) -> f32 {
        self.line_y
    }

    /// Record the current centre of `track_id` and report a crossing, if any.
    ///
    /// The first observation of an identifier only seeds its position.
    pub fn observe(
        &mut self,
        track_id: TrackId,
        cy: f32,
        observed_at: EpochMillis,
    ) -> Option<CrossingEvent> {
        let previous = self.positions.get(track_id).copied();
        self.positions.insert(track_id, cy, observed_at);

        let prev_y = previous?;
        classify_crossing(prev_y, cy, self.line_y).map(|direction| CrossingEvent {
            track_id,
            direction,
            observed_at,
        })
    }

    pub fn sweep(&mut self, now: EpochMillis, ttl_ms: EpochMillis) -> usize {
        self.positions.sweep(now, ttl_ms)
    }

    pub fn tracked(&self) -> usize {
        self.positions.len()
    }
}
