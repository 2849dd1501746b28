//! Event debouncing.
//!
//! A person standing in the doorway wobbles a few pixels around the line.
//! Without a cooldown every wobble would be a fresh event; the debouncer
//! only lets a repeated same-direction event through once the window since
//! the last accepted one has elapsed.

use crate::tracks::TrackTable;
use crate::{CrossingEvent, Direction, EpochMillis};

/// Default cooldown between identical events for one track.
pub const DEFAULT_DEBOUNCE_MS: EpochMillis = 3_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LastEvent {
    direction: Direction,
    at: EpochMillis,
}

pub struct EventDebouncer {
    window_ms: EpochMillis,
    last: TrackTable<LastEvent>,
}

impl EventDebouncer {
    pub fn new(window_ms: EpochMillis, max_tracks: usize) -> Self {
        Self {
            window_ms,
            last: TrackTable::with_capacity(max_tracks),
        }
    }

    pub fn window_ms(&self) -> EpochMillis {
        self.window_ms
    }

    /// Returns true when `event` should be forwarded. Rejected events leave
    /// no trace.
    pub fn accept(&mut self, event: &CrossingEvent) -> bool {
        let accepted = match self.last.get(event.track_id) {
            None => true,
            Some(prior) => {
                prior.direction != event.direction
                    || event.observed_at.saturating_sub(prior.at) > self.window_ms
            }
        };
        if accepted {
            self.last.insert(
                event.track_id,
                LastEvent {
                    direction: event.direction,
                    at: event.observed_at,
                },
                event.observed_at,
            );
        }
        accepted
    }

    pub fn sweep(&mut self, now: EpochMillis, ttl_ms: EpochMillis) -> usize {
        self.last.sweep(now, ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(track_id: i64, direction: Direction, observed_at: EpochMillis) -> CrossingEvent {
        CrossingEvent {
            track_id,
            direction,
            observed_at,
        }
    }

    #[test]
    fn same_direction_inside_window_is_dropped() {
        let mut debouncer = EventDebouncer::new(DEFAULT_DEBOUNCE_MS, 16);
        assert!(debouncer.accept(&event(7, Direction::Entered, 0)));
        assert!(!debouncer.accept(&event(7, Direction::Entered, 1_500)));
        assert!(!debouncer.accept(&event(7, Direction::Entered, 3_000)));
    }

    #[test]
    fn same_direction_after_window_is_accepted() {
        let mut debouncer = EventDebouncer::new(DEFAULT_DEBOUNCE_MS, 16);
        assert!(debouncer.accept(&event(7, Direction::Entered, 0)));
        assert!(debouncer.accept(&event(7, Direction::Entered, 3_001)));
    }

    #[test]
    fn direction_change_is_always_accepted() {
        let mut debouncer = EventDebouncer::new(DEFAULT_DEBOUNCE_MS, 16);
        assert!(debouncer.accept(&event(7, Direction::Entered, 0)));
        assert!(debouncer.accept(&event(7, Direction::Exited, 10)));
        assert!(debouncer.accept(&event(7, Direction::Entered, 20)));
    }

    #[test]
    fn rejection_does_not_extend_the_window() {
        let mut debouncer = EventDebouncer::new(1_000, 16);
        assert!(debouncer.accept(&event(1, Direction::Exited, 0)));
        assert!(!debouncer.accept(&event(1, Direction::Exited, 900)));
        // Measured from the accepted event at 0, not the rejected one at 900.
        assert!(debouncer.accept(&event(1, Direction::Exited, 1_001)));
    }

    #[test]
    fn tracks_are_debounced_independently() {
        let mut debouncer = EventDebouncer::new(DEFAULT_DEBOUNCE_MS, 16);
        assert!(debouncer.accept(&event(1, Direction::Entered, 0)));
        assert!(debouncer.accept(&event(2, Direction::Entered, 10)));
    }
}
