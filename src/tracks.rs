//! Bounded per-track memory.
//!
//! Track identifiers come and go as people walk through the doorway. Both the
//! crossing detector and the debouncer keep one small record per identifier;
//! `TrackTable` caps how many are held and ages out the ones nobody touched
//! for a while, so a daemon running for months does not grow without bound.

use std::collections::HashMap;

use crate::{EpochMillis, TrackId};

#[derive(Clone, Debug)]
struct Slot<T> {
    value: T,
    touched_at: EpochMillis,
}

#[derive(Clone, Debug)]
pub struct TrackTable<T> {
    slots: HashMap<TrackId, Slot<T>>,
    capacity: usize,
}

impl<T> TrackTable<T> {
    /// `capacity` is clamped to at least one entry.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: HashMap::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn get(&self, track_id: TrackId) -> Option<&T> {
        self.slots.get(&track_id).map(|slot| &slot.value)
    }

    /// Store `value` for `track_id`, evicting the least recently touched entry
    /// when the table is full and `track_id` is new.
    pub fn insert(&mut self, track_id: TrackId, value: T, now: EpochMillis) {
        if !self.slots.contains_key(&track_id) && self.slots.len() >= self.capacity {
            self.evict_oldest();
        }
        self.slots.insert(
            track_id,
            Slot {
                value,
                touched_at: now,
            },
        );
    }

    /// Remove entries untouched for longer than `ttl_ms`. Returns how many went.
    pub fn sweep(&mut self, now: EpochMillis, ttl_ms: EpochMillis) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| now.saturating_sub(slot.touched_at) <= ttl_ms);
        before - self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.touched_at)
            .map(|(track_id, _)| *track_id);
        if let Some(track_id) = oldest {
            self.slots.remove(&track_id);
        }
    }
}
