//! Notification transport.
//!
//! Camera status changes and capacity breaches are pushed to an external
//! collaborator (MQTT broker, log). Delivery is best-effort and lives in its
//! own failure domain: callers hand a `Notification` to a `NotifyHandle` and
//! move on; a worker thread owns the `Notifier` and swallows its errors.

mod mqtt;

pub use mqtt::{parse_mqtt_endpoint, MqttEndpoint, MqttNotifier, MqttSettings};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::JoinHandle;

const DISPATCH_QUEUE_DEPTH: usize = 64;

/// Link state reported for the camera.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkStatus {
    Online,
    Offline,
    Reconnecting { attempt: u32 },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Camera { status: LinkStatus },
    CapacityExceeded { inside: u64, capacity: u64 },
}

impl Notification {
    pub fn camera(status: LinkStatus) -> Self {
        Notification::Camera { status }
    }

    /// Human-readable line for logs and plain-text transports.
    pub fn summary(&self) -> String {
        match self {
            Notification::Camera {
                status: LinkStatus::Online,
            } => "camera online".to_string(),
            Notification::Camera {
                status: LinkStatus::Offline,
            } => "camera offline".to_string(),
            Notification::Camera {
                status: LinkStatus::Reconnecting { attempt },
            } => format!("camera reconnecting (attempt {})", attempt),
            Notification::CapacityExceeded { inside, capacity } => {
                format!("capacity exceeded: {}/{}", inside, capacity)
            }
        }
    }
}

/// Delivery backend. Runs on the dispatcher thread only.
pub trait Notifier: Send {
    fn name(&self) -> &'static str;

    fn deliver(&mut self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the process log.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn deliver(&mut self, notification: &Notification) -> Result<()> {
        match notification {
            Notification::CapacityExceeded { .. } => log::warn!("{}", notification.summary()),
            Notification::Camera { .. } => log::info!("{}", notification.summary()),
        }
        Ok(())
    }
}

/// Cheap, cloneable sender side. Never blocks and never fails.
#[derive(Clone, Debug)]
pub struct NotifyHandle {
    tx: Option<SyncSender<Notification>>,
}

impl NotifyHandle {
    /// A handle that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// A handle paired with a receiver, for callers that drain it themselves.
    pub fn channel() -> (Self, Receiver<Notification>) {
        let (tx, rx) = mpsc::sync_channel(DISPATCH_QUEUE_DEPTH);
        (Self { tx: Some(tx) }, rx)
    }

    pub fn send(&self, notification: Notification) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                log::warn!("notification queue full, dropping: {}", dropped.summary());
            }
            Err(TrySendError::Disconnected(dropped)) => {
                log::warn!("notification worker gone, dropping: {}", dropped.summary());
            }
        }
    }
}

/// Owns the worker thread that feeds a `Notifier`.
pub struct NotificationDispatcher {
    handle: NotifyHandle,
    join: Option<JoinHandle<()>>,
}

impl NotificationDispatcher {
    pub fn spawn(mut notifier: Box<dyn Notifier>) -> Result<Self> {
        let (handle, rx) = NotifyHandle::channel();
        let name = notifier.name();
        let join = std::thread::Builder::new()
            .name(format!("notify-{}", name))
            .spawn(move || {
                for notification in rx {
                    if let Err(err) = notifier.deliver(&notification) {
                        log::warn!(
                            "{} notifier failed to deliver '{}': {}",
                            name,
                            notification.summary(),
                            err
                        );
                    }
                }
            })?;
        Ok(Self {
            handle,
            join: Some(join),
        })
    }

    pub fn handle(&self) -> NotifyHandle {
        self.handle.clone()
    }

    /// Drop the dispatcher's own sender and wait for queued messages to drain.
    ///
    /// Other clones of the handle keep the worker alive until they are dropped.
    pub fn stop(mut self) {
        self.handle = NotifyHandle::disabled();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct FailingNotifier {
        attempts: Arc<Mutex<u32>>,
    }

    impl Notifier for FailingNotifier {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn deliver(&mut self, _notification: &Notification) -> Result<()> {
            *self.attempts.lock().unwrap() += 1;
            anyhow::bail!("broker unreachable")
        }
    }

    #[test]
    fn failing_notifier_does_not_reach_the_caller() -> Result<()> {
        let attempts = Arc::new(Mutex::new(0));
        let dispatcher = NotificationDispatcher::spawn(Box::new(FailingNotifier {
            attempts: attempts.clone(),
        }))?;
        let handle = dispatcher.handle();
        handle.send(Notification::camera(LinkStatus::Online));
        handle.send(Notification::camera(LinkStatus::Offline));
        drop(handle);
        dispatcher.stop();

        assert_eq!(*attempts.lock().unwrap(), 2);
        Ok(())
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (handle, rx) = NotifyHandle::channel();
        for attempt in 0..(DISPATCH_QUEUE_DEPTH as u32 + 10) {
            handle.send(Notification::camera(LinkStatus::Reconnecting { attempt }));
        }
        assert_eq!(rx.try_iter().count(), DISPATCH_QUEUE_DEPTH);
    }

    #[test]
    fn notifications_serialize_with_kind_tag() -> Result<()> {
        let json = serde_json::to_string(&Notification::camera(LinkStatus::Reconnecting {
            attempt: 2,
        }))?;
        assert_eq!(
            json,
            r#"{"kind":"camera","status":{"state":"reconnecting","attempt":2}}"#
        );
        let json = serde_json::to_string(&Notification::CapacityExceeded {
            inside: 51,
            capacity: 50,
        })?;
        assert!(json.contains(r#""kind":"capacity_exceeded""#));
        Ok(())
    }

    #[test]
    fn disabled_handle_is_silent() {
        NotifyHandle::disabled().send(Notification::camera(LinkStatus::Online));
    }
}
