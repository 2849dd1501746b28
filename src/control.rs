//! State shared between the pipeline thread and the presentation boundary.
//!
//! The pipeline is the only writer of the status snapshot and the frame
//! slot; readers always get a consistent copy. The activation switch runs the
//! other way: the API writes the desired state and the pipeline acknowledges
//! once the camera has actually been opened or released.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

pub use crate::ingest::CameraStatus;
use crate::occupancy::OccupancyState;
use crate::EpochMillis;

/// Everything `GET /status` reports, captured under one lock.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub camera: CameraStatus,
    pub active: bool,
    #[serde(flatten)]
    pub occupancy: OccupancyState,
    pub frames_processed: u64,
    pub pending_writes: usize,
    pub last_persistence_error: Option<String>,
    pub updated_at: EpochMillis,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            camera: CameraStatus::Closed,
            active: false,
            occupancy: OccupancyState::default(),
            frames_processed: 0,
            pending_writes: 0,
            last_persistence_error: None,
            updated_at: 0,
        }
    }
}

/// Result of flipping the activation switch.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct SwitchOutcome {
    pub active: bool,
    /// The pipeline applied the change before the wait expired.
    pub acknowledged: bool,
}

#[derive(Debug, Default)]
struct Switch {
    desired: bool,
    applied: bool,
}

#[derive(Debug, Default)]
struct FrameSlot {
    seq: u64,
    jpeg: Option<Arc<Vec<u8>>>,
}

#[derive(Debug, Default)]
pub struct Control {
    switch: Mutex<Switch>,
    switch_changed: Condvar,
    status: Mutex<StatusSnapshot>,
    frame: Mutex<FrameSlot>,
    frame_ready: Condvar,
}

impl Control {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------- activation (API side) --------------------

    pub fn desired_active(&self) -> Result<bool> {
        Ok(self.lock_switch()?.desired)
    }

    /// Request a state and wait up to `ack_timeout` for the pipeline to apply it.
    pub fn set_active(&self, desired: bool, ack_timeout: Duration) -> Result<SwitchOutcome> {
        {
            let mut switch = self.lock_switch()?;
            switch.desired = desired;
        }
        self.switch_changed.notify_all();
        self.await_ack(desired, ack_timeout)
    }

    pub fn toggle(&self, ack_timeout: Duration) -> Result<SwitchOutcome> {
        let desired = {
            let mut switch = self.lock_switch()?;
            switch.desired = !switch.desired;
            switch.desired
        };
        self.switch_changed.notify_all();
        self.await_ack(desired, ack_timeout)
    }

    fn await_ack(&self, desired: bool, ack_timeout: Duration) -> Result<SwitchOutcome> {
        let switch = self.lock_switch()?;
        let (switch, _) = self
            .switch_changed
            .wait_timeout_while(switch, ack_timeout, |s| {
                s.desired == desired && s.applied != desired
            })
            .map_err(|_| anyhow!("control switch lock poisoned"))?;
        Ok(SwitchOutcome {
            active: desired,
            acknowledged: switch.applied == desired,
        })
    }

    // -------------------- activation (pipeline side) --------------------

    /// Sleep for one tick, waking early if the desired state changes.
    /// Returns the desired state.
    pub fn wait_tick(&self, timeout: Duration) -> Result<bool> {
        let switch = self.lock_switch()?;
        let (switch, _) = self
            .switch_changed
            .wait_timeout_while(switch, timeout, |s| s.desired == s.applied)
            .map_err(|_| anyhow!("control switch lock poisoned"))?;
        Ok(switch.desired)
    }

    pub fn acknowledge(&self, applied: bool) -> Result<()> {
        self.lock_switch()?.applied = applied;
        self.switch_changed.notify_all();
        Ok(())
    }

    // -------------------- status --------------------

    pub fn publish_status(&self, snapshot: StatusSnapshot) -> Result<()> {
        *self
            .status
            .lock()
            .map_err(|_| anyhow!("control status lock poisoned"))? = snapshot;
        Ok(())
    }

    pub fn status(&self) -> Result<StatusSnapshot> {
        Ok(self
            .status
            .lock()
            .map_err(|_| anyhow!("control status lock poisoned"))?
            .clone())
    }

    // -------------------- live frame --------------------

    pub fn publish_frame(&self, jpeg: Arc<Vec<u8>>) -> Result<()> {
        {
            let mut slot = self.lock_frame()?;
            slot.seq += 1;
            slot.jpeg = Some(jpeg);
        }
        self.frame_ready.notify_all();
        Ok(())
    }

    pub fn latest_frame(&self) -> Result<Option<(u64, Arc<Vec<u8>>)>> {
        let slot = self.lock_frame()?;
        Ok(slot.jpeg.clone().map(|jpeg| (slot.seq, jpeg)))
    }

    /// Wait for a frame newer than `after_seq`.
    pub fn wait_frame(
        &self,
        after_seq: u64,
        timeout: Duration,
    ) -> Result<Option<(u64, Arc<Vec<u8>>)>> {
        let slot = self.lock_frame()?;
        let (slot, _) = self
            .frame_ready
            .wait_timeout_while(slot, timeout, |s| s.seq <= after_seq || s.jpeg.is_none())
            .map_err(|_| anyhow!("control frame lock poisoned"))?;
        if slot.seq <= after_seq {
            return Ok(None);
        }
        Ok(slot.jpeg.clone().map(|jpeg| (slot.seq, jpeg)))
    }

    fn lock_switch(&self) -> Result<MutexGuard<'_, Switch>> {
        self.switch
            .lock()
            .map_err(|_| anyhow!("control switch lock poisoned"))
    }

    fn lock_frame(&self) -> Result<MutexGuard<'_, FrameSlot>> {
        self.frame
            .lock()
            .map_err(|_| anyhow!("control frame lock poisoned"))
    }
}
