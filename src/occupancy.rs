//! Live occupancy counters and capacity alerting.

use serde::{Deserialize, Serialize};

use crate::storage::OccupancyCounts;
use crate::transport::Notification;
use crate::Direction;

/// Running tally of accepted events.
///
/// `inside` is clamped at zero: an exit nobody was seen entering still counts
/// as an exit but never drives the room negative.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OccupancyState {
    pub inside: u64,
    pub entered: u64,
    pub exited: u64,
}

impl OccupancyState {
    /// Seed the tally from the durable log: historical totals plus the number
    /// of sessions still open.
    pub fn from_log(counts: OccupancyCounts, open_sessions: u64) -> Self {
        Self {
            inside: open_sessions,
            entered: counts.entered,
            exited: counts.exited,
        }
    }

    pub fn apply(&mut self, direction: Direction) {
        match direction {
            Direction::Entered => {
                self.entered += 1;
                self.inside += 1;
            }
            Direction::Exited => {
                self.exited += 1;
                self.inside = self.inside.saturating_sub(1);
            }
        }
    }
}

/// Edge-triggered "over capacity" alarm.
#[derive(Clone, Debug)]
pub struct CapacityMonitor {
    max_capacity: u64,
    armed: bool,
}

impl CapacityMonitor {
    /// A `max_capacity` of zero disables the monitor.
    pub fn new(max_capacity: u64) -> Self {
        Self {
            max_capacity,
            armed: true,
        }
    }

    pub fn check(&mut self, inside: u64) -> Option<Notification> {
        if self.max_capacity == 0 {
            return None;
        }
        if inside <= self.max_capacity {
            self.armed = true;
            return None;
        }
        if !self.armed {
            return None;
        }
        self.armed = false;
        Some(Notification::CapacityExceeded {
            inside,
            capacity: self.max_capacity,
        })
    }
}
