use anyhow::Result;

use crate::frame::Frame;
use crate::TrackedObject;

/// External detector/tracker collaborator.
///
/// Given a frame, returns the objects visible in it, each with a transient
/// `track_id`. Ids are only meaningful while the tracker keeps the object;
/// callers must not assume they survive occlusion.
///
/// Implementations must treat the frame as read-only and must not retain it
/// beyond the call.
pub trait Tracker: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Observe one frame.
    fn track(&mut self, frame: &Frame) -> Result<Vec<TrackedObject>>;
}
