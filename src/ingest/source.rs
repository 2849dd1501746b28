//! Reconnecting camera source.
//!
//! ```text
//! Closed --activate--> Opening --open ok--> Streaming
//!                         |                    |
//!                      open err            read err
//!                         v                    v
//!                   Reconnecting <------- Failed (handle released)
//!                     |      |
//!               retry ok    retry err, budget spent
//!                     v      v
//!                Streaming  GivenUp
//!
//! any state --deactivate--> Closed (handle released)
//! ```
//!
//! `poll` never sleeps. While reconnecting it returns `Capture::Offline`
//! until the retry deadline passes, so the driver keeps its own cadence and
//! can observe deactivation between polls.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::backoff::Backoff;
use super::device::CaptureDevice;
use crate::frame::Frame;
use crate::transport::{LinkStatus, Notification, NotifyHandle};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CameraState {
    Closed,
    Opening,
    Streaming,
    /// Transient: the handle is being released after a read failure.
    Failed,
    /// Waiting to make reconnect attempt number `attempt` (1-based).
    Reconnecting {
        attempt: u32,
        delay: Duration,
        retry_at: Instant,
    },
    /// Attempt budget spent; stays here until re-activated or deactivated.
    GivenUp,
}

/// Externally visible camera status.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CameraStatus {
    Closed,
    Opening,
    Streaming,
    Reconnecting { attempt: u32 },
    GivenUp,
}

impl CameraStatus {
    pub fn link(self) -> LinkStatus {
        match self {
            CameraStatus::Streaming => LinkStatus::Online,
            CameraStatus::Reconnecting { attempt } => LinkStatus::Reconnecting { attempt },
            CameraStatus::Closed | CameraStatus::Opening | CameraStatus::GivenUp => {
                LinkStatus::Offline
            }
        }
    }
}

pub enum Capture {
    Frame(Frame),
    /// No frame available; the caller substitutes the placeholder.
    Offline,
}

pub struct CameraSource {
    device: Box<dyn CaptureDevice>,
    state: CameraState,
    backoff: Backoff,
    max_attempts: Option<u32>,
    notify: NotifyHandle,
    published: LinkStatus,
    last_error: Option<String>,
}

impl CameraSource {
    /// `max_attempts` bounds reconnect attempts per outage; `None` retries forever.
    pub fn new(
        device: Box<dyn CaptureDevice>,
        backoff: Backoff,
        max_attempts: Option<u32>,
        notify: NotifyHandle,
    ) -> Self {
        Self {
            device,
            state: CameraState::Closed,
            backoff,
            max_attempts,
            notify,
            published: LinkStatus::Offline,
            last_error: None,
        }
    }

    pub fn state(&self) -> &CameraState {
        &self.state
    }

    pub fn status(&self) -> CameraStatus {
        match &self.state {
            CameraState::Closed => CameraStatus::Closed,
            CameraState::Opening => CameraStatus::Opening,
            CameraState::Streaming => CameraStatus::Streaming,
            CameraState::Failed => CameraStatus::Reconnecting { attempt: 1 },
            CameraState::Reconnecting { attempt, .. } => {
                CameraStatus::Reconnecting { attempt: *attempt }
            }
            CameraState::GivenUp => CameraStatus::GivenUp,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state != CameraState::Closed
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Start (or restart after giving up) acquisition.
    pub fn activate(&mut self) {
        match self.state {
            CameraState::Closed | CameraState::GivenUp => {
                log::info!("camera {}: activating", self.device.describe());
                self.backoff.reset();
                self.transition(CameraState::Opening);
            }
            _ => {}
        }
    }

    /// Release the device and stop, from any state.
    pub fn deactivate(&mut self) {
        if self.state == CameraState::Closed {
            return;
        }
        self.device.release();
        log::info!("camera {}: deactivated", self.device.describe());
        self.transition(CameraState::Closed);
    }

    /// Advance the state machine by at most one device operation.
    pub fn poll(&mut self, now: Instant) -> Capture {
        match self.state.clone() {
            CameraState::Closed | CameraState::GivenUp => Capture::Offline,
            CameraState::Opening => self.try_open(now, None),
            CameraState::Failed => {
                self.schedule_retry(now, 1);
                Capture::Offline
            }
            CameraState::Reconnecting {
                attempt, retry_at, ..
            } => {
                if now < retry_at {
                    Capture::Offline
                } else {
                    self.try_open(now, Some(attempt))
                }
            }
            CameraState::Streaming => self.read(now),
        }
    }

    fn try_open(&mut self, now: Instant, attempt: Option<u32>) -> Capture {
        match self.device.open() {
            Ok(()) => {
                log::info!("camera {}: online", self.device.describe());
                self.backoff.reset();
                self.last_error = None;
                self.transition(CameraState::Streaming);
                self.read(now)
            }
            Err(err) => {
                log::warn!(
                    "camera {}: open failed (attempt {}): {}",
                    self.device.describe(),
                    attempt.unwrap_or(0),
                    err
                );
                self.last_error = Some(err.to_string());
                self.device.release();
                match attempt {
                    None => self.schedule_retry(now, 1),
                    Some(attempt) if self.budget_spent(attempt) => {
                        log::error!(
                            "camera {}: giving up after {} reconnect attempts",
                            self.device.describe(),
                            attempt
                        );
                        self.transition(CameraState::GivenUp);
                    }
                    Some(attempt) => self.schedule_retry(now, attempt + 1),
                }
                Capture::Offline
            }
        }
    }

    fn read(&mut self, now: Instant) -> Capture {
        match self.device.read_frame() {
            Ok(frame) => Capture::Frame(frame),
            Err(err) => {
                log::warn!("camera {}: read failed: {}", self.device.describe(), err);
                self.last_error = Some(err.to_string());
                self.transition(CameraState::Failed);
                self.device.release();
                self.schedule_retry(now, 1);
                Capture::Offline
            }
        }
    }

    fn budget_spent(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }

    fn schedule_retry(&mut self, now: Instant, attempt: u32) {
        if self.max_attempts == Some(0) {
            self.transition(CameraState::GivenUp);
            return;
        }
        let delay = self.backoff.next_delay();
        log::info!(
            "camera {}: reconnect attempt {} in {:?}",
            self.device.describe(),
            attempt,
            delay
        );
        self.transition(CameraState::Reconnecting {
            attempt,
            delay,
            retry_at: now + delay,
        });
    }

    fn transition(&mut self, next: CameraState) {
        self.state = next;
        if self.state == CameraState::Failed {
            return;
        }
        let link = self.status().link();
        if link != self.published {
            self.published = link;
            self.notify.send(Notification::camera(link));
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.device.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct DeviceLog {
        opens: u32,
        releases: u32,
        held: bool,
    }

    /// Fails the first `fail_opens` opens; reads fail while `fail_reads` is set.
    struct FakeDevice {
        fail_opens: u32,
        fail_reads: Arc<Mutex<bool>>,
        log: Arc<Mutex<DeviceLog>>,
    }

    impl CaptureDevice for FakeDevice {
        fn describe(&self) -> String {
            "fake://door".to_string()
        }

        fn open(&mut self) -> Result<()> {
            let mut log = self.log.lock().unwrap();
            log.opens += 1;
            if self.fail_opens > 0 {
                self.fail_opens -= 1;
                return Err(anyhow!("no such device"));
            }
            log.held = true;
            Ok(())
        }

        fn read_frame(&mut self) -> Result<Frame> {
            if *self.fail_reads.lock().unwrap() {
                return Err(anyhow!("device unplugged"));
            }
            Frame::new(vec![0u8; 4 * 4 * 3], 4, 4, 1, 0)
        }

        fn release(&mut self) {
            let mut log = self.log.lock().unwrap();
            log.releases += 1;
            log.held = false;
        }
    }

    struct Harness {
        source: CameraSource,
        log: Arc<Mutex<DeviceLog>>,
        fail_reads: Arc<Mutex<bool>>,
        notifications: std::sync::mpsc::Receiver<Notification>,
    }

    fn harness(fail_opens: u32, max_attempts: Option<u32>) -> Harness {
        let log = Arc::new(Mutex::new(DeviceLog::default()));
        let fail_reads = Arc::new(Mutex::new(false));
        let (notify, notifications) = NotifyHandle::channel();
        let device = FakeDevice {
            fail_opens,
            fail_reads: fail_reads.clone(),
            log: log.clone(),
        };
        let source = CameraSource::new(
            Box::new(device),
            Backoff::new(Duration::from_secs(1), Duration::from_secs(16)),
            max_attempts,
            notify,
        );
        Harness {
            source,
            log,
            fail_reads,
            notifications,
        }
    }

    /// Poll, jumping straight to each retry deadline, until streaming.
    fn run_until_streaming(source: &mut CameraSource, mut now: Instant) -> Vec<Duration> {
        let mut delays = Vec::new();
        for _ in 0..64 {
            if let Capture::Frame(_) = source.poll(now) {
                return delays;
            }
            match source.state() {
                CameraState::Reconnecting {
                    delay, retry_at, ..
                } => {
                    delays.push(*delay);
                    now = *retry_at;
                }
                other => panic!("unexpected state {:?}", other),
            }
        }
        panic!("never reached streaming");
    }

    #[test]
    fn backoff_sequence_doubles_and_caps() {
        let mut h = harness(7, None);
        h.source.activate();
        let delays = run_until_streaming(&mut h.source, Instant::now());
        let secs: Vec<u64> = delays.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 16, 16]);
        assert_eq!(h.source.state(), &CameraState::Streaming);
    }

    #[test]
    fn success_resets_backoff() {
        let mut h = harness(3, None);
        h.source.activate();
        let now = Instant::now();
        run_until_streaming(&mut h.source, now);

        *h.fail_reads.lock().unwrap() = true;
        assert!(matches!(h.source.poll(now), Capture::Offline));
        match h.source.state() {
            CameraState::Reconnecting { attempt, delay, .. } => {
                assert_eq!(*attempt, 1);
                assert_eq!(*delay, Duration::from_secs(1));
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn two_failures_then_online_notifies_in_order() {
        let mut h = harness(2, None);
        assert_eq!(h.source.status().link(), LinkStatus::Offline);
        h.source.activate();
        run_until_streaming(&mut h.source, Instant::now());

        let seen: Vec<Notification> = h.notifications.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                Notification::camera(LinkStatus::Reconnecting { attempt: 1 }),
                Notification::camera(LinkStatus::Reconnecting { attempt: 2 }),
                Notification::camera(LinkStatus::Online),
            ]
        );
    }

    #[test]
    fn read_failure_releases_handle_before_retrying() {
        let mut h = harness(0, None);
        h.source.activate();
        let now = Instant::now();
        assert!(matches!(h.source.poll(now), Capture::Frame(_)));
        assert!(h.log.lock().unwrap().held);

        *h.fail_reads.lock().unwrap() = true;
        assert!(matches!(h.source.poll(now), Capture::Offline));
        assert!(!h.log.lock().unwrap().held);
        assert_eq!(h.source.status(), CameraStatus::Reconnecting { attempt: 1 });
    }

    #[test]
    fn no_open_attempt_before_deadline() {
        let mut h = harness(1, None);
        h.source.activate();
        let now = Instant::now();
        h.source.poll(now);
        assert_eq!(h.log.lock().unwrap().opens, 1);

        for step in 1..10 {
            let capture = h.source.poll(now + Duration::from_millis(step * 99));
            assert!(matches!(capture, Capture::Offline));
        }
        assert_eq!(h.log.lock().unwrap().opens, 1);

        assert!(matches!(
            h.source.poll(now + Duration::from_secs(1)),
            Capture::Frame(_)
        ));
        assert_eq!(h.log.lock().unwrap().opens, 2);
    }

    #[test]
    fn attempt_budget_ends_in_given_up() {
        let mut h = harness(10, Some(2));
        h.source.activate();
        let mut now = Instant::now();
        for _ in 0..3 {
            h.source.poll(now);
            if let CameraState::Reconnecting { retry_at, .. } = h.source.state() {
                now = *retry_at;
            }
        }
        assert_eq!(h.source.state(), &CameraState::GivenUp);
        assert_eq!(h.log.lock().unwrap().opens, 3);
        assert!(matches!(h.source.poll(now), Capture::Offline));
        assert_eq!(h.log.lock().unwrap().opens, 3);

        let last = h.notifications.try_iter().last();
        assert_eq!(last, Some(Notification::camera(LinkStatus::Offline)));

        h.source.activate();
        assert_eq!(h.source.state(), &CameraState::Opening);
    }

    #[test]
    fn deactivate_releases_from_any_state() {
        let mut h = harness(0, None);
        h.source.activate();
        let now = Instant::now();
        h.source.poll(now);
        h.source.deactivate();
        assert_eq!(h.source.state(), &CameraState::Closed);
        assert!(!h.log.lock().unwrap().held);

        let mut h = harness(5, None);
        h.source.activate();
        h.source.poll(now);
        assert!(matches!(h.source.state(), CameraState::Reconnecting { .. }));
        h.source.deactivate();
        assert_eq!(h.source.state(), &CameraState::Closed);
        assert!(matches!(h.source.poll(now + Duration::from_secs(60)), Capture::Offline));
        let last = h.notifications.try_iter().last();
        assert_eq!(last, Some(Notification::camera(LinkStatus::Offline)));
    }
}
