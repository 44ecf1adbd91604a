// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Dropped-event accounting.
//!
//! Every event the store gives up on (storage full, expired, retries
//! exhausted, rejected by the backend) is counted per mapping id and reason
//! in `meta.db`. Counters survive restarts and are reset by
//! [`MetricsStore::take`].

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::clock::ClockSource;
use crate::error::{Error, Result};
use crate::event::EventId;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dropped_events (
    mapping_id TEXT NOT NULL,
    reason TEXT NOT NULL,
    event_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (mapping_id, reason)
);

CREATE TABLE IF NOT EXISTS metrics_state (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;

const COLLECTED_SINCE_KEY: &str = "collected_since_ms";

/// Why an event was dropped without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Evicted or rejected because the storage ceiling was reached.
    StorageFull,
    /// Outlived its time-to-live before delivery.
    MessageTooOld,
    /// Failed transiently too many times.
    MaxRetriesReached,
    /// Rejected by the backend as malformed.
    InvalidPayload,
    /// Lost to a server-side failure that will not be retried.
    ServerError,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::StorageFull => "storage_full",
            DropReason::MessageTooOld => "message_too_old",
            DropReason::MaxRetriesReached => "max_retries_reached",
            DropReason::InvalidPayload => "invalid_payload",
            DropReason::ServerError => "server_error",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DropReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "storage_full" => Ok(DropReason::StorageFull),
            "message_too_old" => Ok(DropReason::MessageTooOld),
            "max_retries_reached" => Ok(DropReason::MaxRetriesReached),
            "invalid_payload" => Ok(DropReason::InvalidPayload),
            "server_error" => Ok(DropReason::ServerError),
            _ => Err(Error::InvalidDropReason(s.to_string())),
        }
    }
}

/// A single event that was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedEvent {
    /// `None` when the event was rejected before it got an id.
    pub event_id: Option<EventId>,
    pub mapping_id: String,
    pub reason: DropReason,
}

/// Number of events dropped for one mapping id and reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedEventsCounter {
    pub mapping_id: String,
    pub reason: DropReason,
    pub event_count: u64,
}

/// Snapshot of storage usage and dropped events since collection started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetrics {
    pub collected_since_ms: u64,
    pub current_storage_bytes: u64,
    pub max_storage_bytes: u64,
    pub dropped: BTreeMap<String, Vec<DroppedEventsCounter>>,
}

impl ClientMetrics {
    /// Total dropped events across all mapping ids and reasons.
    pub fn total_dropped(&self) -> u64 {
        self.dropped.values().flatten().map(|c| c.event_count).sum()
    }

    /// Dropped events for one reason across all mapping ids.
    pub fn dropped_for(&self, reason: DropReason) -> u64 {
        self.dropped.values().flatten().filter(|c| c.reason == reason).map(|c| c.event_count).sum()
    }
}

/// Persistent dropped-event counters.
pub struct MetricsStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn ClockSource>,
}

impl MetricsStore {
    /// Open or create the metrics database at the given path.
    ///
    /// Fails with [`Error::CorruptStore`] if the file exists but is not a
    /// usable metrics database.
    pub fn open(path: &Path, clock: Arc<dyn ClockSource>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let corrupt = |reason: String| Error::CorruptStore {
            store: path.display().to_string(),
            reason,
        };

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| corrupt(e.to_string()))?;

        let check: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|e| corrupt(e.to_string()))?;
        if check != "ok" {
            return Err(corrupt(check));
        }

        Self::init(conn, clock).map_err(|e| corrupt(e.to_string()))
    }

    /// Open an in-memory metrics database (for testing).
    pub fn open_in_memory(clock: Arc<dyn ClockSource>) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, clock)
    }

    fn init(conn: Connection, clock: Arc<dyn ClockSource>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO metrics_state (key, value) VALUES (?1, ?2)",
            params![COLLECTED_SINCE_KEY, to_sql_u64(clock.now_ms())],
        )?;
        Ok(MetricsStore { conn: Mutex::new(conn), clock })
    }

    /// Count dropped events.
    pub fn record(&self, dropped: &[DroppedEvent]) -> Result<()> {
        if dropped.is_empty() {
            return Ok(());
        }

        let mut totals: BTreeMap<(&str, DropReason), i64> = BTreeMap::new();
        for event in dropped {
            *totals.entry((event.mapping_id.as_str(), event.reason)).or_default() += 1;
        }

        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        for ((mapping_id, reason), count) in totals {
            tx.execute(
                "INSERT INTO dropped_events (mapping_id, reason, event_count) VALUES (?1, ?2, ?3)
                 ON CONFLICT(mapping_id, reason) DO UPDATE
                 SET event_count = event_count + excluded.event_count",
                params![mapping_id, reason.as_str(), count],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// All non-zero counters, ordered by mapping id then reason.
    pub fn counters(&self) -> Result<Vec<DroppedEventsCounter>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        read_counters(&conn)
    }

    /// Current metrics without resetting anything.
    pub fn snapshot(&self, current_storage_bytes: u64, max_storage_bytes: u64) -> Result<ClientMetrics> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        build_metrics(&conn, current_storage_bytes, max_storage_bytes)
    }

    /// Current metrics; counters are cleared and collection restarts now.
    pub fn take(&self, current_storage_bytes: u64, max_storage_bytes: u64) -> Result<ClientMetrics> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        let metrics = build_metrics(&tx, current_storage_bytes, max_storage_bytes)?;
        tx.execute("DELETE FROM dropped_events", [])?;
        tx.execute(
            "UPDATE metrics_state SET value = ?1 WHERE key = ?2",
            params![to_sql_u64(self.clock.now_ms()), COLLECTED_SINCE_KEY],
        )?;
        tx.commit()?;
        Ok(metrics)
    }
}

fn read_counters(conn: &Connection) -> Result<Vec<DroppedEventsCounter>> {
    let mut stmt = conn.prepare(
        "SELECT mapping_id, reason, event_count FROM dropped_events
         WHERE event_count > 0 ORDER BY mapping_id, reason",
    )?;
    let rows = stmt.query_map([], |row| {
        let reason: String = row.get(1)?;
        let count: i64 = row.get(2)?;
        Ok((row.get::<_, String>(0)?, reason, count))
    })?;

    let mut counters = Vec::new();
    for row in rows {
        let (mapping_id, reason, count) = row?;
        counters.push(DroppedEventsCounter {
            mapping_id,
            reason: reason.parse()?,
            event_count: u64::try_from(count).unwrap_or(0),
        });
    }
    Ok(counters)
}

fn build_metrics(conn: &Connection, current: u64, max: u64) -> Result<ClientMetrics> {
    let since: Option<i64> = conn
        .query_row(
            "SELECT value FROM metrics_state WHERE key = ?1",
            params![COLLECTED_SINCE_KEY],
            |row| row.get(0),
        )
        .optional()?;

    let mut dropped: BTreeMap<String, Vec<DroppedEventsCounter>> = BTreeMap::new();
    for counter in read_counters(conn)? {
        dropped.entry(counter.mapping_id.clone()).or_default().push(counter);
    }

    Ok(ClientMetrics {
        collected_since_ms: since.map(from_sql_u64).unwrap_or(0),
        current_storage_bytes: current,
        max_storage_bytes: max,
        dropped,
    })
}

pub(crate) fn to_sql_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn from_sql_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;
