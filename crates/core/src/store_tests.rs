// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use crate::clock::ManualClock;
use crate::event::QosTier;
use std::collections::HashSet;

fn cct() -> TargetId {
    TargetId::new("cct").unwrap()
}

fn fll() -> TargetId {
    TargetId::new("fll").unwrap()
}

/// Five bytes against the ceiling: one-byte mapping id, four-byte payload.
fn event(target: TargetId, qos: QosTier) -> NewEvent {
    NewEvent::new(target, "m", qos, vec![1u8, 2, 3, 4])
}

fn config(max_bytes: u64) -> StoreConfig {
    StoreConfig { max_bytes, event_ttl: Duration::from_secs(60), max_retries: 3 }
}

fn memory_store(max_bytes: u64) -> (EventStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000));
    let store = EventStore::open_in_memory(config(max_bytes), clock.clone()).unwrap();
    (store, clock)
}

#[test]
fn append_then_select_in_arrival_order() {
    let (store, _) = memory_store(1_000);
    let a = store.append(event(cct(), QosTier::Default)).unwrap().id;
    let b = store.append(event(cct(), QosTier::HighPriority)).unwrap().id;

    assert_eq!(store.snapshot_size(&cct()).unwrap(), 2);
    assert_eq!(store.total_bytes(), 10);

    let batch = store.select_eligible(&cct(), 10, |_, _| true).unwrap().unwrap();
    assert_eq!(batch.event_ids(), vec![a, b]);
    assert_eq!(batch.target, cct());
    assert_eq!(store.snapshot_size(&cct()).unwrap(), 0);
    assert!(store.has_events(&cct()).unwrap());
}

#[test]
fn append_stamps_expiry_from_ttl() {
    let (store, _) = memory_store(1_000);
    store.append(event(cct(), QosTier::Default)).unwrap();
    let batch = store.select_eligible(&cct(), 1, |_, _| true).unwrap().unwrap();
    assert_eq!(batch.events[0].created_at_ms, 1_000);
    assert_eq!(batch.events[0].expires_at_ms, 61_000);
}

#[test]
fn unknown_target_reads_empty() {
    let (store, _) = memory_store(1_000);
    assert_eq!(store.snapshot_size(&cct()).unwrap(), 0);
    assert!(!store.has_events(&cct()).unwrap());
    assert!(store.select_eligible(&cct(), 10, |_, _| true).unwrap().is_none());
    assert_eq!(store.purge(&cct(), BatchId(1)).unwrap(), 0);
    assert!(store.targets().is_empty());
}

#[test]
fn targets_are_isolated() {
    let (store, _) = memory_store(1_000);
    store.append(event(cct(), QosTier::Default)).unwrap();
    store.append(event(fll(), QosTier::Default)).unwrap();

    let batch = store.select_eligible(&cct(), 10, |_, _| true).unwrap().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(store.snapshot_size(&fll()).unwrap(), 1);
    assert_eq!(store.targets(), vec![cct(), fll()]);
}

#[test]
fn purge_releases_storage() {
    let (store, _) = memory_store(1_000);
    store.append(event(cct(), QosTier::Default)).unwrap();
    store.append(event(cct(), QosTier::Default)).unwrap();
    let batch = store.select_eligible(&cct(), 10, |_, _| true).unwrap().unwrap();

    assert_eq!(store.purge(&cct(), batch.batch_id).unwrap(), 2);
    assert_eq!(store.total_bytes(), 0);
    assert!(!store.has_events(&cct()).unwrap());
    // Second purge of the same batch is a no-op.
    assert_eq!(store.purge(&cct(), batch.batch_id).unwrap(), 0);
}

#[test]
fn oversized_event_is_rejected_and_counted() {
    let (store, _) = memory_store(4);
    let err = store.append(event(cct(), QosTier::HighPriority)).unwrap_err();
    assert!(err.is_capacity());

    let metrics = store.metrics().unwrap();
    assert_eq!(metrics.dropped_for(DropReason::StorageFull), 1);
    assert_eq!(metrics.max_storage_bytes, 4);
}

#[test]
fn full_store_evicts_lower_tier() {
    let (store, _) = memory_store(20);
    let first_daily = store.append(event(cct(), QosTier::Daily)).unwrap().id;
    for _ in 0..3 {
        store.append(event(cct(), QosTier::Daily)).unwrap();
    }
    assert_eq!(store.total_bytes(), 20);

    let appended = store.append(event(cct(), QosTier::HighPriority)).unwrap();
    assert_eq!(appended.evicted.len(), 1);
    assert_eq!(appended.evicted[0].0, cct());
    assert_eq!(appended.evicted[0].1.event_id, Some(first_daily));
    assert_eq!(store.total_bytes(), 20);
    assert_eq!(store.snapshot_size(&cct()).unwrap(), 4);
    assert_eq!(store.metrics().unwrap().dropped_for(DropReason::StorageFull), 1);
}

#[test]
fn full_store_rejects_when_only_higher_tiers_remain() {
    let (store, _) = memory_store(10);
    store.append(event(cct(), QosTier::HighPriority)).unwrap();
    store.append(event(cct(), QosTier::Default)).unwrap();

    let err = store.append(event(cct(), QosTier::WifiOnly)).unwrap_err();
    assert!(matches!(err, Error::Capacity { needed: 5, available: 0 }));
    assert_eq!(store.snapshot_size(&cct()).unwrap(), 2);
    assert_eq!(store.total_bytes(), 10);
    assert_eq!(store.metrics().unwrap().dropped_for(DropReason::StorageFull), 1);
}

#[test]
fn full_store_evicts_from_other_targets() {
    let (store, _) = memory_store(10);
    let oldest = store.append(event(fll(), QosTier::Daily)).unwrap().id;
    store.append(event(fll(), QosTier::Daily)).unwrap();

    let appended = store.append(event(cct(), QosTier::HighPriority)).unwrap();
    assert_eq!(appended.evicted.len(), 1);
    assert_eq!(appended.evicted[0].0, fll());
    assert_eq!(appended.evicted[0].1.event_id, Some(oldest));
    assert_eq!(store.snapshot_size(&fll()).unwrap(), 1);
    assert_eq!(store.snapshot_size(&cct()).unwrap(), 1);
    assert_eq!(store.total_bytes(), 10);
    assert_eq!(store.metrics().unwrap().dropped_for(DropReason::StorageFull), 1);
}

#[test]
fn eviction_takes_lowest_tier_across_targets_first() {
    let (store, clock) = memory_store(15);
    store.append(event(cct(), QosTier::Default)).unwrap();
    clock.advance(Duration::from_millis(10));
    let wifi = store.append(event(fll(), QosTier::WifiOnly)).unwrap().id;
    clock.advance(Duration::from_millis(10));
    store.append(event(cct(), QosTier::HighPriority)).unwrap();

    // The lower tier goes first even though the default event on cct is older.
    let appended = store.append(event(cct(), QosTier::Default)).unwrap();
    assert_eq!(appended.evicted.len(), 1);
    assert_eq!(appended.evicted[0].0, fll());
    assert_eq!(appended.evicted[0].1.event_id, Some(wifi));
    assert_eq!(store.snapshot_size(&cct()).unwrap(), 3);
    assert_eq!(store.snapshot_size(&fll()).unwrap(), 0);
}

#[test]
fn eviction_never_touches_in_flight_events_of_other_targets() {
    let (store, _) = memory_store(10);
    store.append(event(fll(), QosTier::Daily)).unwrap();
    store.append(event(fll(), QosTier::Daily)).unwrap();
    store.select_eligible(&fll(), 10, |_, _| true).unwrap().unwrap();

    assert!(store.append(event(cct(), QosTier::HighPriority)).unwrap_err().is_capacity());
    assert!(store.has_events(&fll()).unwrap());
    assert_eq!(store.total_bytes(), 10);
}

#[test]
fn requeue_applies_backoff_and_drops_exhausted() {
    let (store, _) = memory_store(1_000);
    store.append(event(cct(), QosTier::Default)).unwrap();

    let batch = store.select_eligible(&cct(), 10, |_, _| true).unwrap().unwrap();
    let result = store.requeue(&cct(), batch.batch_id, 5_000).unwrap();
    assert_eq!(result.requeued.len(), 1);
    assert!(store.in_flight_batches(&cct()).unwrap().is_empty());

    // Backed-off events are skipped by a predicate that honors backoff.
    let now = store.clock().now_ms();
    assert!(store.select_eligible(&cct(), 10, |e, _| !e.is_backed_off(now)).unwrap().is_none());

    // max_retries is 3: two more retries, then the fourth failure drops it.
    for _ in 0..3 {
        let batch = store.select_eligible(&cct(), 10, |_, _| true).unwrap().unwrap();
        store.requeue(&cct(), batch.batch_id, 0).unwrap();
    }

    assert!(!store.has_events(&cct()).unwrap());
    assert_eq!(store.total_bytes(), 0);
    assert_eq!(store.metrics().unwrap().dropped_for(DropReason::MaxRetriesReached), 1);
}

#[test]
fn remove_expired_counts_too_old() {
    let (store, clock) = memory_store(1_000);
    store.append(event(cct(), QosTier::Daily)).unwrap();
    clock.advance(Duration::from_secs(30));
    store.append(event(cct(), QosTier::Daily)).unwrap();

    clock.advance(Duration::from_secs(31));
    let dropped = store.remove_expired(&cct()).unwrap();
    assert_eq!(dropped.len(), 1);
    assert_eq!(store.snapshot_size(&cct()).unwrap(), 1);
    assert_eq!(store.total_bytes(), 5);
    assert_eq!(store.metrics().unwrap().dropped_for(DropReason::MessageTooOld), 1);
}

#[test]
fn record_batch_loss_counts_each_event() {
    let (store, _) = memory_store(1_000);
    store.append(event(cct(), QosTier::Default)).unwrap();
    store.append(event(cct(), QosTier::Default)).unwrap();
    let batch = store.select_eligible(&cct(), 10, |_, _| true).unwrap().unwrap();
    store.purge(&cct(), batch.batch_id).unwrap();

    store.record_batch_loss(&batch, DropReason::InvalidPayload);
    assert_eq!(store.metrics().unwrap().dropped_for(DropReason::InvalidPayload), 2);
}

#[test]
fn throttle_state_is_per_target() {
    let (store, _) = memory_store(1_000);
    store.set_throttle_until(&cct(), 9_000).unwrap();

    assert_eq!(store.target_state(&cct()).unwrap().throttle_until_ms, 9_000);
    assert_eq!(store.target_state(&fll()).unwrap().throttle_until_ms, 0);
}

#[test]
fn concurrent_selection_never_overlaps() {
    let (store, _) = memory_store(1_000_000);
    for _ in 0..200 {
        store.append(event(cct(), QosTier::HighPriority)).unwrap();
    }
    let store = Arc::new(store);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            std::thread::spawn(move || {
                let mut ids = Vec::new();
                while let Some(batch) = store.select_eligible(&cct(), 7, |_, _| true).unwrap() {
                    ids.extend(batch.event_ids());
                }
                ids
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(seen.insert(id), "event {id} selected twice");
            total += 1;
        }
    }
    assert_eq!(total, 200);
}

#[test]
fn reopen_keeps_unacked_and_forgets_acked() {
    let dir = tempfile::tempdir().unwrap();
    let clock: Arc<dyn ClockSource> = Arc::new(ManualClock::new(1_000));

    let (acked, in_flight, queued) = {
        let store = EventStore::open(dir.path(), config(1_000), clock.clone()).unwrap();
        let acked = store.append(event(cct(), QosTier::Default)).unwrap().id;
        let batch = store.select_eligible(&cct(), 10, |_, _| true).unwrap().unwrap();
        store.purge(&cct(), batch.batch_id).unwrap();

        let in_flight = store.append(event(cct(), QosTier::Default)).unwrap().id;
        let batch = store.select_eligible(&cct(), 10, |_, _| true).unwrap().unwrap();
        let queued = store.append(event(cct(), QosTier::Default)).unwrap().id;
        (acked, (batch.batch_id, in_flight), queued)
    };

    let store = EventStore::open(dir.path(), config(1_000), clock).unwrap();
    assert_eq!(store.targets(), vec![cct()]);
    assert_eq!(store.total_bytes(), 10);
    assert_eq!(store.in_flight_batches(&cct()).unwrap(), vec![in_flight.0]);

    let recovered = store.batch(&cct(), in_flight.0).unwrap().unwrap();
    assert_eq!(recovered.event_ids(), vec![in_flight.1]);

    store.requeue(&cct(), in_flight.0, 0).unwrap();
    let batch = store.select_eligible(&cct(), 10, |_, _| true).unwrap().unwrap();
    let ids = batch.event_ids();
    assert!(!ids.contains(&acked));
    assert_eq!(ids, vec![in_flight.1, queued]);
}

#[test]
fn corrupt_queue_is_moved_aside() {
    let dir = tempfile::tempdir().unwrap();
    let clock: Arc<dyn ClockSource> = Arc::new(ManualClock::new(1_000));
    {
        let store = EventStore::open(dir.path(), config(1_000), clock.clone()).unwrap();
        store.append(event(fll(), QosTier::Default)).unwrap();
    }
    let targets = dir.path().join("targets");
    std::fs::write(targets.join("cct.db"), b"garbage garbage garbage garbage garbage garbage").unwrap();

    let store = EventStore::open(dir.path(), config(1_000), clock).unwrap();
    let resets = store.resets();
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].target, Some(cct()));
    assert!(resets[0].moved_to.exists());

    // The replaced queue works and the healthy one is untouched.
    store.append(event(cct(), QosTier::Default)).unwrap();
    assert_eq!(store.snapshot_size(&cct()).unwrap(), 1);
    assert_eq!(store.snapshot_size(&fll()).unwrap(), 1);
}

#[test]
fn corrupt_metrics_database_is_reset() {
    let dir = tempfile::tempdir().unwrap();
    let clock: Arc<dyn ClockSource> = Arc::new(ManualClock::new(1_000));
    {
        let store = EventStore::open(dir.path(), config(1_000), clock.clone()).unwrap();
        store.append(event(cct(), QosTier::Default)).unwrap();
    }
    std::fs::write(dir.path().join("meta.db"), b"not a metrics database, just some bytes on disk").unwrap();

    let store = EventStore::open(dir.path(), config(1_000), clock).unwrap();
    let resets = store.resets();
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].target, None);
    assert_eq!(resets[0].moved_to, dir.path().join("meta.db.corrupt"));
    assert!(resets[0].moved_to.exists());

    // Queues are untouched and drops are counted again.
    assert_eq!(store.snapshot_size(&cct()).unwrap(), 1);
    let batch = store.select_eligible(&cct(), 10, |_, _| true).unwrap().unwrap();
    store.record_batch_loss(&batch, DropReason::ServerError);
    assert_eq!(store.metrics().unwrap().dropped_for(DropReason::ServerError), 1);
}

#[test]
fn rescan_finds_queues_written_by_another_process() {
    let dir = tempfile::tempdir().unwrap();
    let clock: Arc<dyn ClockSource> = Arc::new(ManualClock::new(1_000));
    let store = EventStore::open(dir.path(), config(1_000), clock.clone()).unwrap();
    store.append(event(cct(), QosTier::Default)).unwrap();

    let writer = EventStore::open(dir.path(), config(1_000), clock).unwrap();
    writer.append(event(fll(), QosTier::Default)).unwrap();
    writer.append(event(cct(), QosTier::Default)).unwrap();
    assert_eq!(store.targets(), vec![cct()]);

    let rescan = store.rescan().unwrap();
    assert_eq!(rescan.added, vec![fll()]);
    assert!(rescan.resets.is_empty());
    assert_eq!(store.targets(), vec![cct(), fll()]);
    assert_eq!(store.snapshot_size(&fll()).unwrap(), 1);
    assert_eq!(store.total_bytes(), 15);

    assert!(store.rescan().unwrap().added.is_empty());
}

#[test]
fn rescan_of_memory_store_is_empty() {
    let (store, _) = memory_store(1_000);
    store.append(event(cct(), QosTier::Default)).unwrap();
    assert_eq!(store.rescan().unwrap(), Rescan::default());
    assert_eq!(store.total_bytes(), 5);
}

#[test]
fn metrics_take_resets_counters() {
    let (store, _) = memory_store(4);
    let _ = store.append(event(cct(), QosTier::Default));

    assert_eq!(store.take_metrics().unwrap().total_dropped(), 1);
    assert_eq!(store.metrics().unwrap().total_dropped(), 0);
}
