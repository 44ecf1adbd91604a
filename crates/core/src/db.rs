// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! SQLite-backed queue for a single target.
//!
//! Each target owns one database file holding its events, the ledger of
//! in-flight batches, and a little per-target state (daily window, backend
//! throttle). Every state transition runs in one immediate transaction, so a
//! crash leaves either the old or the new state on disk, never a mix.

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;

use crate::error::{Error, Result};
use crate::event::{Batch, BatchId, EventId, NewEvent, QosTier, StoredEvent, TargetId};
use crate::metrics::{from_sql_u64, to_sql_u64, DropReason, DroppedEvent};

/// Current on-disk schema version.
pub const SCHEMA_VERSION: i64 = 1;

/// SQL schema for a target queue.
pub const SCHEMA: &str = r#"
-- In-flight batch ledger
CREATE TABLE IF NOT EXISTS batches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at_ms INTEGER NOT NULL
);

-- One row per pending event; batch_id is set while the event is in flight
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mapping_id TEXT NOT NULL,
    qos TEXT NOT NULL,
    payload BLOB NOT NULL,
    size_bytes INTEGER NOT NULL,
    created_at_ms INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    backoff_until_ms INTEGER NOT NULL DEFAULT 0,
    batch_id INTEGER,
    FOREIGN KEY (batch_id) REFERENCES batches(id)
);

-- Per-target scheduling state
CREATE TABLE IF NOT EXISTS target_state (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_batch ON events(batch_id);
"#;

const EVENT_COLUMNS: &str =
    "id, mapping_id, qos, payload, created_at_ms, expires_at_ms, retry_count, backoff_until_ms";

/// Eviction order: daily first, high priority last.
const RANK_SQL: &str =
    "CASE qos WHEN 'daily' THEN 0 WHEN 'wifi_only' THEN 1 WHEN 'default' THEN 2 ELSE 3 END";

const LAST_DAILY_KEY: &str = "last_daily_upload_ms";
const THROTTLE_KEY: &str = "throttle_until_ms";

/// Parse a string value from the database, returning a rusqlite error on parse failure.
fn parse_db<T: std::str::FromStr>(
    value: &str,
    column: &str,
) -> std::result::Result<T, rusqlite::Error> {
    value.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(Error::CorruptedData(format!(
                "invalid value '{value}' in column '{column}'"
            ))),
        )
    })
}

fn row_to_event(row: &Row<'_>, target: &TargetId) -> std::result::Result<StoredEvent, rusqlite::Error> {
    let qos: String = row.get(2)?;
    let retry_count: i64 = row.get(6)?;
    Ok(StoredEvent {
        id: EventId(row.get(0)?),
        target: target.clone(),
        mapping_id: row.get(1)?,
        qos: parse_db::<QosTier>(&qos, "qos")?,
        payload: row.get(3)?,
        created_at_ms: from_sql_u64(row.get(4)?),
        expires_at_ms: from_sql_u64(row.get(5)?),
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        backoff_until_ms: from_sql_u64(row.get(7)?),
    })
}

/// Run schema creation and version checks on a database connection.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(Error::CorruptedData(format!(
            "schema version {version} is newer than supported version {SCHEMA_VERSION}"
        )));
    }
    conn.execute_batch(SCHEMA)?;
    conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
    Ok(())
}

/// Scheduling state kept alongside a target's events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetState {
    /// When a batch with daily events was last formed.
    pub last_daily_upload_ms: Option<u64>,
    /// No uploads for this target before this time.
    pub throttle_until_ms: u64,
}

impl TargetState {
    pub fn is_throttled(&self, now_ms: u64) -> bool {
        self.throttle_until_ms > now_ms
    }
}

/// A queued event that may be evicted to make room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub target: TargetId,
    pub id: EventId,
    pub mapping_id: String,
    pub size_bytes: u64,
    pub created_at_ms: u64,
    /// Tier rank; lower ranks go first.
    pub rank: u8,
}

/// Result of returning a batch to the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requeued {
    /// Events back in the queue with an incremented retry count.
    pub requeued: Vec<EventId>,
    /// Events deleted because they ran out of retries or expired.
    pub dropped: Vec<DroppedEvent>,
    pub freed_bytes: u64,
}

/// Result of purging a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Purged {
    pub events: usize,
    pub freed_bytes: u64,
}

/// SQLite connection holding one target's queue.
pub struct TargetDb {
    conn: Connection,
    target: TargetId,
}

impl TargetDb {
    /// Open a target queue at the given path, creating and migrating if needed.
    ///
    /// Fails with [`Error::CorruptStore`] if the file exists but is not a
    /// usable queue.
    pub fn open(path: &Path, target: TargetId) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let corrupt = |reason: String| Error::CorruptStore { store: target.to_string(), reason };

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| corrupt(e.to_string()))?;

        let check: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|e| corrupt(e.to_string()))?;
        if check != "ok" {
            return Err(corrupt(check));
        }

        run_migrations(&conn).map_err(|e| corrupt(e.to_string()))?;
        Ok(TargetDb { conn, target })
    }

    /// Open an in-memory queue (for testing).
    pub fn open_in_memory(target: TargetId) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        run_migrations(&conn)?;
        Ok(TargetDb { conn, target })
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    fn begin(&mut self) -> Result<Transaction<'_>> {
        Ok(self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
    }

    /// Insert an event into the queue.
    pub fn insert(&mut self, event: &NewEvent, now_ms: u64, expires_at_ms: u64) -> Result<EventId> {
        self.conn.execute(
            "INSERT INTO events (mapping_id, qos, payload, size_bytes, created_at_ms, expires_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.mapping_id,
                event.qos.as_str(),
                event.payload,
                to_sql_u64(event.size_bytes()),
                to_sql_u64(now_ms),
                to_sql_u64(expires_at_ms),
            ],
        )?;
        Ok(EventId(self.conn.last_insert_rowid()))
    }

    /// Queued events with a tier rank of at most `max_rank`, lowest rank
    /// then oldest first, stopping once `enough` bytes are covered.
    pub fn eviction_candidates(&self, max_rank: u8, enough: u64) -> Result<Vec<EvictionCandidate>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, mapping_id, size_bytes, created_at_ms, {RANK_SQL} FROM events
             WHERE batch_id IS NULL AND {RANK_SQL} <= ?1
             ORDER BY {RANK_SQL}, created_at_ms, id"
        ))?;
        let mut rows = stmt.query(params![i64::from(max_rank)])?;

        let mut candidates = Vec::new();
        let mut covered = 0u64;
        while covered < enough {
            let Some(row) = rows.next()? else {
                break;
            };
            let rank: i64 = row.get(4)?;
            let candidate = EvictionCandidate {
                target: self.target.clone(),
                id: EventId(row.get(0)?),
                mapping_id: row.get(1)?,
                size_bytes: from_sql_u64(row.get(2)?),
                created_at_ms: from_sql_u64(row.get(3)?),
                rank: u8::try_from(rank).unwrap_or(u8::MAX),
            };
            covered = covered.saturating_add(candidate.size_bytes);
            candidates.push(candidate);
        }
        Ok(candidates)
    }

    /// Delete the given events if they are still queued.
    ///
    /// Events selected into a batch since they were picked are left alone.
    pub fn evict(&mut self, ids: &[EventId]) -> Result<(Vec<DroppedEvent>, u64)> {
        let tx = self.begin()?;
        let mut evicted = Vec::with_capacity(ids.len());
        let mut freed = 0u64;
        for id in ids {
            let row: Option<(String, i64)> = tx
                .query_row(
                    "SELECT mapping_id, size_bytes FROM events WHERE id = ?1 AND batch_id IS NULL",
                    params![id.0],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((mapping_id, size)) = row else {
                continue;
            };
            tx.execute("DELETE FROM events WHERE id = ?1", params![id.0])?;
            freed += from_sql_u64(size);
            evicted.push(DroppedEvent { event_id: Some(*id), mapping_id, reason: DropReason::StorageFull });
        }
        tx.commit()?;
        Ok((evicted, freed))
    }

    /// All queued (not in-flight) events in arrival order.
    pub fn queued_events(&self) -> Result<Vec<StoredEvent>> {
        load_queued(&self.conn, &self.target)
    }

    /// Atomically move matching queued events into a new in-flight batch.
    ///
    /// Events are visited in arrival order; at most `limit` are taken. If the
    /// batch holds any daily events, the daily window is stamped with `now_ms`
    /// in the same transaction.
    pub fn select<F>(&mut self, now_ms: u64, limit: usize, mut predicate: F) -> Result<Option<Batch>>
    where
        F: FnMut(&StoredEvent, &TargetState) -> bool,
    {
        let target = self.target.clone();
        let tx = self.begin()?;
        let state = read_state(&tx)?;

        let events: Vec<StoredEvent> = load_queued(&tx, &target)?
            .into_iter()
            .filter(|e| predicate(e, &state))
            .take(limit)
            .collect();
        if events.is_empty() {
            return Ok(None);
        }

        tx.execute("INSERT INTO batches (created_at_ms) VALUES (?1)", params![to_sql_u64(now_ms)])?;
        let batch_id = BatchId(tx.last_insert_rowid());
        for event in &events {
            tx.execute(
                "UPDATE events SET batch_id = ?1 WHERE id = ?2 AND batch_id IS NULL",
                params![batch_id.0, event.id.0],
            )?;
        }

        let batch = Batch { batch_id, target, events };
        if batch.contains_tier(QosTier::Daily) {
            write_state(&tx, LAST_DAILY_KEY, now_ms)?;
        }
        tx.commit()?;
        Ok(Some(batch))
    }

    /// Reload an in-flight batch from the ledger.
    pub fn batch(&self, batch_id: BatchId) -> Result<Option<Batch>> {
        let exists: Option<i64> = self
            .conn
            .query_row("SELECT id FROM batches WHERE id = ?1", params![batch_id.0], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Ok(None);
        }

        let events = load_batch(&self.conn, &self.target, batch_id)?;
        Ok(Some(Batch { batch_id, target: self.target.clone(), events }))
    }

    /// Permanently delete a batch and its events.
    pub fn purge(&mut self, batch_id: BatchId) -> Result<Purged> {
        let tx = self.begin()?;
        let (events, bytes): (i64, i64) = tx.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM events WHERE batch_id = ?1",
            params![batch_id.0],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        tx.execute("DELETE FROM events WHERE batch_id = ?1", params![batch_id.0])?;
        tx.execute("DELETE FROM batches WHERE id = ?1", params![batch_id.0])?;
        tx.commit()?;

        Ok(Purged { events: usize::try_from(events).unwrap_or(0), freed_bytes: from_sql_u64(bytes) })
    }

    /// Return a batch's events to the queue after a transient failure.
    ///
    /// Each event's retry count is incremented and its backoff set. Events
    /// that already failed `max_retries` times, or have expired, are deleted
    /// instead.
    pub fn requeue(
        &mut self,
        batch_id: BatchId,
        backoff_until_ms: u64,
        now_ms: u64,
        max_retries: u32,
    ) -> Result<Requeued> {
        let target = self.target.clone();
        let tx = self.begin()?;
        let events = load_batch(&tx, &target, batch_id)?;

        let mut result = Requeued::default();
        for event in events {
            let reason = if event.retry_count >= max_retries {
                Some(DropReason::MaxRetriesReached)
            } else if event.is_expired(now_ms) {
                Some(DropReason::MessageTooOld)
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    tx.execute("DELETE FROM events WHERE id = ?1", params![event.id.0])?;
                    result.freed_bytes += event.size_bytes();
                    result.dropped.push(DroppedEvent {
                        event_id: Some(event.id),
                        mapping_id: event.mapping_id,
                        reason,
                    });
                }
                None => {
                    tx.execute(
                        "UPDATE events SET batch_id = NULL, retry_count = ?1, backoff_until_ms = ?2
                         WHERE id = ?3",
                        params![
                            i64::from(event.retry_count.saturating_add(1)),
                            to_sql_u64(backoff_until_ms),
                            event.id.0
                        ],
                    )?;
                    result.requeued.push(event.id);
                }
            }
        }

        tx.execute("DELETE FROM batches WHERE id = ?1", params![batch_id.0])?;
        tx.commit()?;
        Ok(result)
    }

    /// Delete queued events whose time-to-live has passed.
    pub fn remove_expired(&mut self, now_ms: u64) -> Result<(Vec<DroppedEvent>, u64)> {
        let tx = self.begin()?;
        let expired = {
            let mut stmt = tx.prepare(
                "SELECT id, mapping_id, size_bytes FROM events
                 WHERE batch_id IS NULL AND expires_at_ms <= ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![to_sql_u64(now_ms)], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut dropped = Vec::with_capacity(expired.len());
        let mut freed = 0u64;
        for (id, mapping_id, size) in expired {
            tx.execute("DELETE FROM events WHERE id = ?1", params![id])?;
            freed += from_sql_u64(size);
            dropped.push(DroppedEvent {
                event_id: Some(EventId(id)),
                mapping_id,
                reason: DropReason::MessageTooOld,
            });
        }
        tx.commit()?;
        Ok((dropped, freed))
    }

    /// Ids of batches currently in flight, oldest first.
    pub fn in_flight_batches(&self) -> Result<Vec<BatchId>> {
        let mut stmt = self.conn.prepare("SELECT id FROM batches ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids.into_iter().map(BatchId).collect())
    }

    /// Number of queued (not in-flight) events.
    pub fn queued_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE batch_id IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Number of stored events, queued or in flight.
    pub fn event_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Bytes counted against the storage ceiling.
    pub fn total_bytes(&self) -> Result<u64> {
        let bytes: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM events",
            [],
            |row| row.get(0),
        )?;
        Ok(from_sql_u64(bytes))
    }

    pub fn state(&self) -> Result<TargetState> {
        read_state(&self.conn)
    }

    pub fn set_throttle_until(&mut self, until_ms: u64) -> Result<()> {
        write_state(&self.conn, THROTTLE_KEY, until_ms)
    }

    pub fn set_last_daily_upload(&mut self, at_ms: u64) -> Result<()> {
        write_state(&self.conn, LAST_DAILY_KEY, at_ms)
    }
}

fn load_queued(conn: &Connection, target: &TargetId) -> Result<Vec<StoredEvent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE batch_id IS NULL ORDER BY id"
    ))?;
    let events = stmt
        .query_map([], |row| row_to_event(row, target))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

fn load_batch(conn: &Connection, target: &TargetId, batch_id: BatchId) -> Result<Vec<StoredEvent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE batch_id = ?1 ORDER BY id"
    ))?;
    let events = stmt
        .query_map(params![batch_id.0], |row| row_to_event(row, target))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

fn read_state(conn: &Connection) -> Result<TargetState> {
    let get = |key: &str| -> Result<Option<u64>> {
        let value: Option<i64> = conn
            .query_row("SELECT value FROM target_state WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value.map(from_sql_u64))
    };

    Ok(TargetState {
        last_daily_upload_ms: get(LAST_DAILY_KEY)?,
        throttle_until_ms: get(THROTTLE_KEY)?.unwrap_or(0),
    })
}

fn write_state(conn: &Connection, key: &str, value: u64) -> Result<()> {
    conn.execute(
        "INSERT INTO target_state (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, to_sql_u64(value)],
    )?;
    Ok(())
}

#[cfg(test)]
#[path = "db_tests.rs"]
mod tests;
