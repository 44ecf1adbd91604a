// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Durable event store spanning all targets.
//!
//! Layout under the store directory:
//!
//! ```text
//! <dir>/meta.db              dropped-event counters
//! <dir>/targets/<target>.db  one queue per target
//! ```
//!
//! Targets are independent: each queue has its own connection behind its own
//! mutex, and the registry lock is only held to look a queue up. At most one
//! queue lock is held at a time. The storage ceiling is shared across targets
//! and tracked in memory; [`EventStore::rescan`] recounts it from disk.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::{add_ms, ClockSource};
use crate::db::{EvictionCandidate, Requeued, TargetDb, TargetState};
use crate::error::{Error, Result};
use crate::event::{Batch, BatchId, EventId, NewEvent, QosTier, StoredEvent, TargetId};
use crate::metrics::{ClientMetrics, DropReason, DroppedEvent, MetricsStore};

const TARGETS_DIR: &str = "targets";
const METRICS_FILE: &str = "meta.db";

/// Times an append tries to make room before it is rejected.
const EVICTION_ROUNDS: usize = 3;

/// Limits applied by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Ceiling on stored bytes across all targets.
    pub max_bytes: u64,
    /// How long an event may wait before it is dropped as too old.
    pub event_ttl: Duration,
    /// Transient failures an event survives before it is dropped.
    pub max_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            max_bytes: 20 * 1024 * 1024,
            event_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            max_retries: 5,
        }
    }
}

/// Result of a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appended {
    pub id: EventId,
    /// Lower-tier events removed to make room, with the target each was
    /// queued for.
    pub evicted: Vec<(TargetId, DroppedEvent)>,
}

/// A database that was found corrupt and replaced by an empty one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReset {
    /// The target whose queue was reset, or `None` for the metrics database.
    pub target: Option<TargetId>,
    pub reason: String,
    /// Where the damaged file was moved.
    pub moved_to: PathBuf,
}

type TargetQueue = Arc<Mutex<TargetDb>>;

/// Targets found by [`EventStore::rescan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rescan {
    pub added: Vec<TargetId>,
    /// Corrupt queues replaced while opening the new targets.
    pub resets: Vec<StoreReset>,
}

/// The durable event store.
pub struct EventStore {
    dir: Option<PathBuf>,
    config: StoreConfig,
    clock: Arc<dyn ClockSource>,
    queues: RwLock<HashMap<TargetId, TargetQueue>>,
    total_bytes: AtomicU64,
    metrics: MetricsStore,
    resets: Mutex<Vec<StoreReset>>,
}

impl EventStore {
    /// Open the store rooted at `dir`, opening every existing target queue.
    ///
    /// Corrupt databases are moved aside and replaced; see [`EventStore::resets`].
    pub fn open(dir: &Path, config: StoreConfig, clock: Arc<dyn ClockSource>) -> Result<Self> {
        let targets_dir = dir.join(TARGETS_DIR);
        std::fs::create_dir_all(&targets_dir)?;

        let mut resets = Vec::new();
        let metrics_path = dir.join(METRICS_FILE);
        let metrics = match MetricsStore::open(&metrics_path, clock.clone()) {
            Ok(metrics) => metrics,
            Err(Error::CorruptStore { reason, .. }) => {
                let moved_to = move_aside(&metrics_path)?;
                warn!(%reason, moved_to = %moved_to.display(), "corrupt metrics database, counters reset");
                let metrics = MetricsStore::open(&metrics_path, clock.clone())?;
                resets.push(StoreReset { target: None, reason, moved_to });
                metrics
            }
            Err(e) => return Err(e),
        };

        let store = EventStore {
            dir: Some(dir.to_path_buf()),
            config,
            clock,
            queues: RwLock::new(HashMap::new()),
            total_bytes: AtomicU64::new(0),
            metrics,
            resets: Mutex::new(resets),
        };

        let mut total = 0u64;
        {
            let mut queues = store.queues.write().unwrap_or_else(|e| e.into_inner());
            for target in discover_targets(&targets_dir)? {
                let db = store.open_queue(&target)?;
                total = total.saturating_add(db.total_bytes()?);
                queues.insert(target, Arc::new(Mutex::new(db)));
            }
            info!(dir = %dir.display(), targets = queues.len(), bytes = total, "opened event store");
        }
        store.total_bytes.store(total, Ordering::SeqCst);
        Ok(store)
    }

    /// Open a store that keeps everything in memory (for testing).
    pub fn open_in_memory(config: StoreConfig, clock: Arc<dyn ClockSource>) -> Result<Self> {
        Ok(EventStore {
            dir: None,
            config,
            metrics: MetricsStore::open_in_memory(clock.clone())?,
            clock,
            queues: RwLock::new(HashMap::new()),
            total_bytes: AtomicU64::new(0),
            resets: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The clock used to stamp events.
    pub fn clock(&self) -> &Arc<dyn ClockSource> {
        &self.clock
    }

    fn queue_path(&self, target: &TargetId) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(TARGETS_DIR).join(format!("{target}.db")))
    }

    /// Open one target's database, replacing it with an empty one if corrupt.
    fn open_queue(&self, target: &TargetId) -> Result<TargetDb> {
        let Some(path) = self.queue_path(target) else {
            return TargetDb::open_in_memory(target.clone());
        };

        let reason = match TargetDb::open(&path, target.clone()) {
            Ok(db) => return Ok(db),
            Err(Error::CorruptStore { reason, .. }) => reason,
            Err(e) => return Err(e),
        };

        let moved_to = move_aside(&path)?;
        warn!(target_id = %target, %reason, moved_to = %moved_to.display(), "corrupt queue, starting empty");

        let db = TargetDb::open(&path, target.clone())?;
        self.resets.lock().unwrap_or_else(|e| e.into_inner()).push(StoreReset {
            target: Some(target.clone()),
            reason,
            moved_to,
        });
        Ok(db)
    }

    /// Look up a target's queue without creating it.
    fn existing(&self, target: &TargetId) -> Option<TargetQueue> {
        self.queues.read().unwrap_or_else(|e| e.into_inner()).get(target).cloned()
    }

    /// Look up a target's queue, creating it on first use.
    fn queue(&self, target: &TargetId) -> Result<TargetQueue> {
        if let Some(queue) = self.existing(target) {
            return Ok(queue);
        }

        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        if let Some(queue) = queues.get(target) {
            return Ok(queue.clone());
        }
        let queue = Arc::new(Mutex::new(self.open_queue(target)?));
        queues.insert(target.clone(), queue.clone());
        debug!(target_id = %target, "created target queue");
        Ok(queue)
    }

    fn with_existing<T>(
        &self,
        target: &TargetId,
        empty: T,
        f: impl FnOnce(&mut TargetDb) -> Result<T>,
    ) -> Result<T> {
        match self.existing(target) {
            Some(queue) => {
                let mut db = queue.lock().unwrap_or_else(|e| e.into_inner());
                f(&mut *db)
            }
            None => Ok(empty),
        }
    }

    fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let _ = self
            .total_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(bytes)));
    }

    /// Count dropped events. Counter failures are logged, not surfaced.
    fn record_drops(&self, dropped: &[DroppedEvent]) {
        if let Err(e) = self.metrics.record(dropped) {
            warn!(error = %e, count = dropped.len(), "failed to record dropped events");
        }
    }

    /// Durably store an event.
    ///
    /// When the storage ceiling would be exceeded, queued events of any
    /// target with an equal or lower tier are evicted (lowest tier, then
    /// oldest first). Fails with [`Error::Capacity`] if that cannot free
    /// enough room; the rejected event is counted as dropped.
    pub fn append(&self, event: NewEvent) -> Result<Appended> {
        let size = event.size_bytes();
        let max = self.config.max_bytes;
        if size > max {
            return Err(self.reject(&event, size));
        }

        let queue = self.queue(&event.target)?;
        let mut evicted = Vec::new();
        let mut rounds = 0;
        loop {
            let reserved = self
                .total_bytes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                    let next = current.saturating_add(size);
                    (next <= max).then_some(next)
                });
            let Err(current) = reserved else {
                break;
            };

            rounds += 1;
            let must_free = current.saturating_add(size).saturating_sub(max);
            if rounds > EVICTION_ROUNDS || !self.make_room(event.qos, must_free, &mut evicted)? {
                return Err(self.reject(&event, size));
            }
        }

        let now = self.clock.now_ms();
        let expires_at = add_ms(now, self.config.event_ttl);
        let inserted = {
            let mut db = queue.lock().unwrap_or_else(|e| e.into_inner());
            db.insert(&event, now, expires_at)
        };
        let id = match inserted {
            Ok(id) => id,
            Err(e) => {
                self.release(size);
                return Err(e);
            }
        };

        debug!(target_id = %event.target, %id, qos = %event.qos, size, "appended event");
        Ok(Appended { id, evicted })
    }

    /// Evict queued events ranked at or below `qos` across all targets,
    /// lowest rank then oldest first, until `must_free` bytes are released.
    ///
    /// Returns false, evicting nothing, if the candidates cannot cover it.
    fn make_room(
        &self,
        qos: QosTier,
        must_free: u64,
        evicted: &mut Vec<(TargetId, DroppedEvent)>,
    ) -> Result<bool> {
        let mut candidates: Vec<EvictionCandidate> = Vec::new();
        for target in self.targets() {
            let found =
                self.with_existing(&target, Vec::new(), |db| db.eviction_candidates(qos.rank(), must_free))?;
            candidates.extend(found);
        }
        candidates.sort_by(|a, b| {
            a.rank
                .cmp(&b.rank)
                .then(a.created_at_ms.cmp(&b.created_at_ms))
                .then_with(|| a.target.cmp(&b.target))
                .then(a.id.cmp(&b.id))
        });

        let mut chosen: BTreeMap<TargetId, Vec<EventId>> = BTreeMap::new();
        let mut covered = 0u64;
        for candidate in candidates {
            if covered >= must_free {
                break;
            }
            covered = covered.saturating_add(candidate.size_bytes);
            chosen.entry(candidate.target).or_default().push(candidate.id);
        }
        if covered < must_free {
            return Ok(false);
        }

        for (target, ids) in chosen {
            let (dropped, freed) = self.with_existing(&target, (Vec::new(), 0), |db| db.evict(&ids))?;
            self.release(freed);
            if dropped.is_empty() {
                continue;
            }
            warn!(target_id = %target, evicted = dropped.len(), freed, "storage full, evicted lower-tier events");
            self.record_drops(&dropped);
            evicted.extend(dropped.into_iter().map(|d| (target.clone(), d)));
        }
        Ok(true)
    }

    fn reject(&self, event: &NewEvent, size: u64) -> Error {
        let available = self.config.max_bytes.saturating_sub(self.total_bytes());
        warn!(target_id = %event.target, mapping_id = %event.mapping_id, size, available, "rejected event, storage full");
        self.record_drops(&[DroppedEvent {
            event_id: None,
            mapping_id: event.mapping_id.clone(),
            reason: DropReason::StorageFull,
        }]);
        Error::Capacity { needed: size, available }
    }

    /// Atomically move up to `limit` matching queued events into a new batch.
    ///
    /// Selections on one target are serialized, so two callers never receive
    /// the same event.
    pub fn select_eligible<F>(&self, target: &TargetId, limit: usize, predicate: F) -> Result<Option<Batch>>
    where
        F: FnMut(&StoredEvent, &TargetState) -> bool,
    {
        if limit == 0 {
            return Ok(None);
        }
        let now = self.clock.now_ms();
        let batch = self.with_existing(target, None, |db| db.select(now, limit, predicate))?;
        if let Some(batch) = &batch {
            debug!(target_id = %target, batch_id = %batch.batch_id, events = batch.len(), "selected batch");
        }
        Ok(batch)
    }

    /// Delete an acknowledged batch. Unknown batches purge nothing.
    pub fn purge(&self, target: &TargetId, batch_id: BatchId) -> Result<usize> {
        let purged = self.with_existing(target, Default::default(), |db| db.purge(batch_id))?;
        self.release(purged.freed_bytes);
        Ok(purged.events)
    }

    /// Return a batch to the queue after a transient failure.
    ///
    /// Events out of retries or past their time-to-live are deleted and
    /// counted as dropped instead.
    pub fn requeue(&self, target: &TargetId, batch_id: BatchId, backoff_until_ms: u64) -> Result<Requeued> {
        let now = self.clock.now_ms();
        let max_retries = self.config.max_retries;
        let result = self.with_existing(target, Requeued::default(), |db| {
            db.requeue(batch_id, backoff_until_ms, now, max_retries)
        })?;

        self.release(result.freed_bytes);
        if !result.dropped.is_empty() {
            self.record_drops(&result.dropped);
        }
        Ok(result)
    }

    /// Count events permanently lost with a batch (already deleted).
    pub fn record_batch_loss(&self, batch: &Batch, reason: DropReason) {
        let dropped: Vec<_> = batch
            .events
            .iter()
            .map(|e| DroppedEvent { event_id: Some(e.id), mapping_id: e.mapping_id.clone(), reason })
            .collect();
        self.record_drops(&dropped);
    }

    /// Delete queued events that have outlived their time-to-live.
    pub fn remove_expired(&self, target: &TargetId) -> Result<Vec<DroppedEvent>> {
        let now = self.clock.now_ms();
        let (dropped, freed) =
            self.with_existing(target, (Vec::new(), 0), |db| db.remove_expired(now))?;
        self.release(freed);
        if !dropped.is_empty() {
            info!(target_id = %target, count = dropped.len(), "dropped expired events");
            self.record_drops(&dropped);
        }
        Ok(dropped)
    }

    /// Number of queued (not in-flight) events for a target.
    pub fn snapshot_size(&self, target: &TargetId) -> Result<usize> {
        self.with_existing(target, 0, |db| db.queued_count())
    }

    /// True if the target has any stored events, queued or in flight.
    pub fn has_events(&self, target: &TargetId) -> Result<bool> {
        self.with_existing(target, false, |db| Ok(db.event_count()? > 0))
    }

    /// Batches recorded in the in-flight ledger, oldest first.
    pub fn in_flight_batches(&self, target: &TargetId) -> Result<Vec<BatchId>> {
        self.with_existing(target, Vec::new(), |db| db.in_flight_batches())
    }

    /// Reload an in-flight batch.
    pub fn batch(&self, target: &TargetId, batch_id: BatchId) -> Result<Option<Batch>> {
        self.with_existing(target, None, |db| db.batch(batch_id))
    }

    /// All known targets, sorted.
    pub fn targets(&self) -> Vec<TargetId> {
        let mut targets: Vec<_> =
            self.queues.read().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect();
        targets.sort();
        targets
    }

    pub fn target_state(&self, target: &TargetId) -> Result<TargetState> {
        self.with_existing(target, TargetState::default(), |db| db.state())
    }

    /// Suppress uploads for a target until the given time.
    pub fn set_throttle_until(&self, target: &TargetId, until_ms: u64) -> Result<()> {
        let queue = self.queue(target)?;
        let mut db = queue.lock().unwrap_or_else(|e| e.into_inner());
        db.set_throttle_until(until_ms)
    }

    pub fn set_last_daily_upload(&self, target: &TargetId, at_ms: u64) -> Result<()> {
        let queue = self.queue(target)?;
        let mut db = queue.lock().unwrap_or_else(|e| e.into_inner());
        db.set_last_daily_upload(at_ms)
    }

    /// Open target queues created since the store was opened, typically by
    /// another process writing into the same directory, and recount stored
    /// bytes from disk.
    pub fn rescan(&self) -> Result<Rescan> {
        let Some(dir) = &self.dir else {
            return Ok(Rescan::default());
        };

        let seen = self.resets.lock().unwrap_or_else(|e| e.into_inner()).len();
        let mut added = Vec::new();
        for target in discover_targets(&dir.join(TARGETS_DIR))? {
            if self.existing(&target).is_none() {
                self.queue(&target)?;
                added.push(target);
            }
        }

        let mut total = 0u64;
        for target in self.targets() {
            total = total.saturating_add(self.with_existing(&target, 0, |db| db.total_bytes())?);
        }
        self.total_bytes.store(total, Ordering::SeqCst);

        if !added.is_empty() {
            info!(added = added.len(), bytes = total, "found new target queues");
        }
        let resets = self.resets.lock().unwrap_or_else(|e| e.into_inner()).get(seen..).unwrap_or_default().to_vec();
        Ok(Rescan { added, resets })
    }

    /// Bytes currently stored across all targets.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    pub fn max_bytes(&self) -> u64 {
        self.config.max_bytes
    }

    /// Storage usage and dropped-event counters.
    pub fn metrics(&self) -> Result<ClientMetrics> {
        self.metrics.snapshot(self.total_bytes(), self.max_bytes())
    }

    /// Like [`EventStore::metrics`], but resets the dropped-event counters.
    pub fn take_metrics(&self) -> Result<ClientMetrics> {
        self.metrics.take(self.total_bytes(), self.max_bytes())
    }

    /// Databases that were replaced because they were corrupt.
    pub fn resets(&self) -> Vec<StoreReset> {
        self.resets.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Valid target names of the queue files in `targets_dir`, sorted.
fn discover_targets(targets_dir: &Path) -> Result<Vec<TargetId>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(targets_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("db") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match TargetId::new(stem) {
            Ok(target) => found.push(target),
            Err(_) => warn!(path = %path.display(), "ignoring queue file with invalid target name"),
        }
    }
    found.sort();
    Ok(found)
}

/// Move a damaged database to `<file>.corrupt` and delete its WAL sidecars.
fn move_aside(path: &Path) -> Result<PathBuf> {
    let mut moved_to = path.as_os_str().to_owned();
    moved_to.push(".corrupt");
    let moved_to = PathBuf::from(moved_to);
    std::fs::rename(path, &moved_to)?;

    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let sidecar = PathBuf::from(sidecar);
        if sidecar.exists() {
            std::fs::remove_file(&sidecar)?;
        }
    }
    Ok(moved_to)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
