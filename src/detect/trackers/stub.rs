use anyhow::Result;

use crate::detect::tracker::Tracker;
use crate::frame::Frame;
use crate::{BoundingBox, TrackId, TrackedObject};

const SPAWN_EVERY_FRAMES: u64 = 40;
const BOX_HALF_WIDTH: f32 = 30.0;
const BOX_HALF_HEIGHT: f32 = 60.0;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Phase {
    Approaching,
    Dwelling { frames_left: u32 },
    Leaving,
}

#[derive(Clone, Debug)]
struct Walker {
    id: TrackId,
    x: f32,
    y: f32,
    phase: Phase,
    dwell_frames: u32,
}

/// Synthetic tracker for demos and soak tests.
///
/// Ignores pixel content. Every few frames a walker appears below the line,
/// walks up across it, lingers inside for a while, then walks back out and
/// disappears. Each walker keeps one track id for its whole visit, so every
/// entry is followed by an exit of the same id.
pub struct StubTracker {
    width: f32,
    start_y: f32,
    stop_y: f32,
    step: f32,
    frames: u64,
    next_id: TrackId,
    walkers: Vec<Walker>,
}

impl StubTracker {
    pub fn new(width: u32, height: u32, line_y: f32) -> Self {
        let height = height.max(1) as f32;
        Self {
            width: width.max(1) as f32,
            start_y: (line_y + height) / 2.0,
            stop_y: line_y / 2.0,
            step: (height / 40.0).max(1.0),
            frames: 0,
            next_id: 1,
            walkers: Vec::new(),
        }
    }

    fn spawn(&mut self) {
        let id = self.next_id;
        self.next_id += 1;
        let lanes = 5.0;
        let lane = (id as f32) % lanes;
        self.walkers.push(Walker {
            id,
            x: self.width * (lane + 0.5) / lanes,
            y: self.start_y,
            phase: Phase::Approaching,
            dwell_frames: 20 + ((id as u32).wrapping_mul(37) % 60),
        });
    }

    fn advance(&mut self) {
        let (step, stop_y, start_y) = (self.step, self.stop_y, self.start_y);
        for walker in &mut self.walkers {
            walker.phase = match walker.phase {
                Phase::Approaching => {
                    walker.y = (walker.y - step).max(stop_y);
                    if walker.y <= stop_y {
                        Phase::Dwelling {
                            frames_left: walker.dwell_frames,
                        }
                    } else {
                        Phase::Approaching
                    }
                }
                Phase::Dwelling { frames_left: 0 } => Phase::Leaving,
                Phase::Dwelling { frames_left } => Phase::Dwelling {
                    frames_left: frames_left - 1,
                },
                Phase::Leaving => {
                    walker.y += step;
                    Phase::Leaving
                }
            };
        }
        self.walkers
            .retain(|w| !(w.phase == Phase::Leaving && w.y >= start_y));
    }
}

impl Tracker for StubTracker {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn track(&mut self, _frame: &Frame) -> Result<Vec<TrackedObject>> {
        if self.frames.is_multiple_of(SPAWN_EVERY_FRAMES) {
            self.spawn();
        }
        self.frames += 1;
        self.advance();

        Ok(self
            .walkers
            .iter()
            .map(|w| {
                TrackedObject::new(
                    w.id,
                    BoundingBox::new(
                        w.x - BOX_HALF_WIDTH,
                        w.y - BOX_HALF_HEIGHT,
                        w.x + BOX_HALF_WIDTH,
                        w.y + BOX_HALF_HEIGHT,
                    ),
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crossing::CrossingDetector;
    use crate::Direction;

    #[test]
    fn every_walker_enters_then_exits() -> Result<()> {
        let frame = Frame::placeholder(8, 8);
        let mut tracker = StubTracker::new(640, 480, 250.0);
        let mut detector = CrossingDetector::new(250.0, 64);
        let mut events = Vec::new();

        for t in 0..2_000 {
            for object in tracker.track(&frame)? {
                if let Some(event) = detector.observe(object.track_id, object.bbox.center_y(), t)
                {
                    events.push((event.track_id, event.direction));
                }
            }
        }

        let entered: Vec<TrackId> = events
            .iter()
            .filter(|(_, d)| *d == Direction::Entered)
            .map(|(id, _)| *id)
            .collect();
        assert!(entered.len() > 10);
        for id in &entered[..entered.len() - 4] {
            let first = events.iter().position(|e| *e == (*id, Direction::Entered));
            let exit = events.iter().position(|e| *e == (*id, Direction::Exited));
            assert!(exit.is_some(), "walker {} never left", id);
            assert!(first < exit);
        }
        Ok(())
    }
}
