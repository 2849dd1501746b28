use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

use crate::detect::tracker::Tracker;
use crate::frame::Frame;
use crate::TrackedObject;

/// Replays recorded tracker output, one frame per line.
///
/// Each line is a JSON array of `TrackedObject`:
///
/// ```text
/// [{"track_id":7,"bbox":{"x1":0,"y1":260,"x2":40,"y2":340}}]
/// []
/// ```
///
/// Blank lines mean "nothing visible". Once the input is exhausted every
/// further frame yields an empty list.
pub struct ReplayTracker {
    lines: Box<dyn BufRead + Send>,
    line_no: usize,
    exhausted: bool,
}

impl ReplayTracker {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open replay file {}", path.display()))?;
        Ok(Self::from_reader(BufReader::new(file)))
    }

    pub fn from_reader<R: BufRead + Send + 'static>(reader: R) -> Self {
        Self {
            lines: Box::new(reader),
            line_no: 0,
            exhausted: false,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

impl Tracker for ReplayTracker {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn track(&mut self, _frame: &Frame) -> Result<Vec<TrackedObject>> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        let mut line = String::new();
        let read = self.lines.read_line(&mut line).context("read replay line")?;
        if read == 0 {
            log::info!("replay tracker exhausted after {} frames", self.line_no);
            self.exhausted = true;
            return Ok(Vec::new());
        }
        self.line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(line)
            .with_context(|| format!("replay line {} is not a tracked-object array", self.line_no))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn replays_lines_then_goes_quiet() -> Result<()> {
        let input = concat!(
            r#"[{"track_id":7,"bbox":{"x1":0,"y1":260,"x2":40,"y2":340}}]"#,
            "\n\n",
            r#"[{"track_id":7,"bbox":{"x1":0,"y1":200,"x2":40,"y2":280}},"#,
            r#"{"track_id":8,"bbox":{"x1":50,"y1":10,"x2":90,"y2":50}}]"#,
            "\n"
        );
        let frame = Frame::placeholder(4, 4);
        let mut tracker = ReplayTracker::from_reader(Cursor::new(input.to_string()));

        let first = tracker.track(&frame)?;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].track_id, 7);
        assert_eq!(first[0].bbox.center_y(), 300.0);

        assert!(tracker.track(&frame)?.is_empty());
        assert_eq!(tracker.track(&frame)?.len(), 2);
        assert!(tracker.track(&frame)?.is_empty());
        assert!(tracker.is_exhausted());
        assert!(tracker.track(&frame)?.is_empty());
        Ok(())
    }

    #[test]
    fn malformed_line_is_an_error_not_a_stop() -> Result<()> {
        let input = "not json\n[]\n";
        let frame = Frame::placeholder(4, 4);
        let mut tracker = ReplayTracker::from_reader(Cursor::new(input.to_string()));
        assert!(tracker.track(&frame).is_err());
        assert!(tracker.track(&frame)?.is_empty());
        assert!(!tracker.is_exhausted());
        Ok(())
    }
}
