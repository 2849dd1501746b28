use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::{open_db_connection, Direction, EpochMillis, TrackId};

/// Result of a session write that did not fail.
///
/// `DuplicateSession` and `NoOpenSession` are tracker identity drift, not
/// caller mistakes: nothing is written and nothing is raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    DuplicateSession,
    NoOpenSession,
}

/// Immutable row of the append-only event log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedEvent {
    pub id: i64,
    pub track_id: TrackId,
    pub action: Direction,
    pub timestamp: EpochMillis,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OccupancyCounts {
    pub entered: u64,
    pub exited: u64,
}

/// Dwell time of one track identifier across all of its sessions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DwellSummary {
    pub track_id: TrackId,
    /// Sum of matched entry-to-exit intervals.
    pub closed_ms: i64,
    pub closed_sessions: u32,
    /// Elapsed time of the session still open, if any.
    pub open_ms: Option<i64>,
    pub total_ms: i64,
}

pub trait SessionStore: Send {
    /// Open a session for `track_id` and log the entry.
    fn record_entry(&mut self, track_id: TrackId, ts: EpochMillis) -> Result<RecordOutcome>;

    /// Close the open session for `track_id` and log the exit.
    fn record_exit(&mut self, track_id: TrackId, ts: EpochMillis) -> Result<RecordOutcome>;

    /// All-time counts of logged entries and exits.
    fn occupancy_counts(&mut self) -> Result<OccupancyCounts>;

    fn open_session_count(&mut self) -> Result<u64>;

    /// Per-track dwell totals, counting open sessions up to `now`.
    fn durations(&mut self, now: EpochMillis) -> Result<Vec<DwellSummary>>;

    /// Logged events with `since <= timestamp < until`, oldest first.
    fn events_between(
        &mut self,
        since: EpochMillis,
        until: EpochMillis,
    ) -> Result<Vec<PersistedEvent>>;

    /// Explicit full reset: drops every logged event and open session.
    fn reset(&mut self) -> Result<()>;

    fn record(
        &mut self,
        track_id: TrackId,
        direction: Direction,
        ts: EpochMillis,
    ) -> Result<RecordOutcome> {
        match direction {
            Direction::Entered => self.record_entry(track_id, ts),
            Direction::Exited => self.record_exit(track_id, ts),
        }
    }
}

/// Pair entries and exits per track in log order and add open sessions.
///
/// Pairing is FIFO: an exit always closes the oldest unmatched entry of the
/// same track. Intervals are clamped at zero so clock skew never yields a
/// negative dwell.
pub fn summarize_dwell(
    events: &[PersistedEvent],
    open_sessions: &[(TrackId, EpochMillis)],
    now: EpochMillis,
) -> Vec<DwellSummary> {
    let mut pending: HashMap<TrackId, VecDeque<EpochMillis>> = HashMap::new();
    let mut summaries: BTreeMap<TrackId, DwellSummary> = BTreeMap::new();

    for ev in events {
        match ev.action {
            Direction::Entered => {
                pending.entry(ev.track_id).or_default().push_back(ev.timestamp);
            }
            Direction::Exited => {
                let Some(entry_at) = pending
                    .get_mut(&ev.track_id)
                    .and_then(|queue| queue.pop_front())
                else {
                    continue;
                };
                let summary = summaries
                    .entry(ev.track_id)
                    .or_insert_with(|| empty_summary(ev.track_id));
                summary.closed_ms += ev.timestamp.saturating_sub(entry_at).max(0);
                summary.closed_sessions += 1;
            }
        }
    }

    for (track_id, entry_time) in open_sessions {
        let summary = summaries
            .entry(*track_id)
            .or_insert_with(|| empty_summary(*track_id));
        summary.open_ms = Some(now.saturating_sub(*entry_time).max(0));
    }

    summaries
        .into_values()
        .map(|mut summary| {
            summary.total_ms = summary.closed_ms + summary.open_ms.unwrap_or(0);
            summary
        })
        .collect()
}

fn empty_summary(track_id: TrackId) -> DwellSummary {
    DwellSummary {
        track_id,
        closed_ms: 0,
        closed_sessions: 0,
        open_ms: None,
        total_ms: 0,
    }
}

// ----------------------------------------------------------------------------
// SQLite store
// ----------------------------------------------------------------------------

pub struct SqliteSessionStore {
    conn: Connection,
}

impl SqliteSessionStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS occupancy_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              track_id INTEGER NOT NULL,
              action TEXT NOT NULL CHECK (action IN ('entered', 'exited')),
              ts INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS open_sessions (
              track_id INTEGER PRIMARY KEY,
              entry_time INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_occupancy_events_ts ON occupancy_events(ts);

            CREATE TRIGGER IF NOT EXISTS occupancy_events_append_only
            BEFORE UPDATE ON occupancy_events
            BEGIN
              SELECT RAISE(ABORT, 'occupancy_events is append-only');
            END;
            "#,
        )?;
        Ok(())
    }

    fn load_events(&self, sql: &str, bounds: &[i64]) -> Result<Vec<PersistedEvent>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(bounds.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let action: String = row.get(2)?;
            out.push(PersistedEvent {
                id: row.get(0)?,
                track_id: row.get(1)?,
                action: Direction::parse(&action)
                    .map_err(|e| anyhow!("corrupt occupancy log: {}", e))?,
                timestamp: row.get(3)?,
            });
        }
        Ok(out)
    }
}

impl SessionStore for SqliteSessionStore {
    fn record_entry(&mut self, track_id: TrackId, ts: EpochMillis) -> Result<RecordOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let open: Option<i64> = tx
            .query_row(
                "SELECT entry_time FROM open_sessions WHERE track_id = ?1",
                params![track_id],
                |row| row.get(0),
            )
            .optional()?;
        if open.is_some() {
            return Ok(RecordOutcome::DuplicateSession);
        }
        tx.execute(
            "INSERT INTO open_sessions(track_id, entry_time) VALUES (?1, ?2)",
            params![track_id, ts],
        )?;
        tx.execute(
            "INSERT INTO occupancy_events(track_id, action, ts) VALUES (?1, 'entered', ?2)",
            params![track_id, ts],
        )?;
        tx.commit()?;
        Ok(RecordOutcome::Recorded)
    }

    fn record_exit(&mut self, track_id: TrackId, ts: EpochMillis) -> Result<RecordOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let closed = tx.execute(
            "DELETE FROM open_sessions WHERE track_id = ?1",
            params![track_id],
        )?;
        if closed == 0 {
            return Ok(RecordOutcome::NoOpenSession);
        }
        tx.execute(
            "INSERT INTO occupancy_events(track_id, action, ts) VALUES (?1, 'exited', ?2)",
            params![track_id, ts],
        )?;
        tx.commit()?;
        Ok(RecordOutcome::Recorded)
    }

    fn occupancy_counts(&mut self) -> Result<OccupancyCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT action, COUNT(*) FROM occupancy_events GROUP BY action")?;
        let mut rows = stmt.query([])?;
        let mut counts = OccupancyCounts::default();
        while let Some(row) = rows.next()? {
            let action: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let count = u64::try_from(count).map_err(|_| anyhow!("negative event count"))?;
            match Direction::parse(&action)? {
                Direction::Entered => counts.entered = count,
                Direction::Exited => counts.exited = count,
            }
        }
        Ok(counts)
    }

    fn open_session_count(&mut self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM open_sessions", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn durations(&mut self, now: EpochMillis) -> Result<Vec<DwellSummary>> {
        let events = self.load_events(
            "SELECT id, track_id, action, ts FROM occupancy_events ORDER BY id ASC",
            &[],
        )?;
        let open = {
            let mut stmt = self
                .conn
                .prepare("SELECT track_id, entry_time FROM open_sessions ORDER BY track_id")?;
            let mut rows = stmt.query([])?;
            let mut open = Vec::new();
            while let Some(row) = rows.next()? {
                open.push((row.get(0)?, row.get(1)?));
            }
            open
        };
        Ok(summarize_dwell(&events, &open, now))
    }

    fn events_between(
        &mut self,
        since: EpochMillis,
        until: EpochMillis,
    ) -> Result<Vec<PersistedEvent>> {
        self.load_events(
            "SELECT id, track_id, action, ts FROM occupancy_events \
             WHERE ts >= ?1 AND ts < ?2 ORDER BY id ASC",
            &[since, until],
        )
    }

    fn reset(&mut self) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM occupancy_events", [])?;
        tx.execute("DELETE FROM open_sessions", [])?;
        tx.commit()?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// In-memory store (tests, dry runs)
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct InMemorySessionStore {
    events: Vec<PersistedEvent>,
    open: BTreeMap<TrackId, EpochMillis>,
    next_id: i64,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&mut self, track_id: TrackId, action: Direction, ts: EpochMillis) {
        self.next_id += 1;
        self.events.push(PersistedEvent {
            id: self.next_id,
            track_id,
            action,
            timestamp: ts,
        });
    }
}

impl SessionStore for InMemorySessionStore {
    fn record_entry(&mut self, track_id: TrackId, ts: EpochMillis) -> Result<RecordOutcome> {
        if self.open.contains_key(&track_id) {
            return Ok(RecordOutcome::DuplicateSession);
        }
        self.open.insert(track_id, ts);
        self.append(track_id, Direction::Entered, ts);
        Ok(RecordOutcome::Recorded)
    }

    fn record_exit(&mut self, track_id: TrackId, ts: EpochMillis) -> Result<RecordOutcome> {
        if self.open.remove(&track_id).is_none() {
            return Ok(RecordOutcome::NoOpenSession);
        }
        self.append(track_id, Direction::Exited, ts);
        Ok(RecordOutcome::Recorded)
    }

    fn occupancy_counts(&mut self) -> Result<OccupancyCounts> {
        let mut counts = OccupancyCounts::default();
        for ev in &self.events {
            match ev.action {
                Direction::Entered => counts.entered += 1,
                Direction::Exited => counts.exited += 1,
            }
        }
        Ok(counts)
    }

    fn open_session_count(&mut self) -> Result<u64> {
        Ok(self.open.len() as u64)
    }

    fn durations(&mut self, now: EpochMillis) -> Result<Vec<DwellSummary>> {
        let open = self
            .open
            .iter()
            .map(|(track_id, entry)| (*track_id, *entry))
            .collect::<Vec<_>>();
        Ok(summarize_dwell(&self.events, &open, now))
    }

    fn events_between(
        &mut self,
        since: EpochMillis,
        until: EpochMillis,
    ) -> Result<Vec<PersistedEvent>> {
        Ok(self
            .events
            .iter()
            .filter(|ev| ev.timestamp >= since && ev.timestamp < until)
            .cloned()
            .collect())
    }

    fn reset(&mut self) -> Result<()> {
        self.events.clear();
        self.open.clear();
        Ok(())
    }
}
