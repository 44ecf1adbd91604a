// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use yare::parameterized;

#[parameterized(
    simple = { "cct" },
    dashes = { "fire-log_2" },
    digits = { "1018" },
)]
fn target_id_valid(id: &str) {
    assert_eq!(TargetId::new(id).unwrap().as_str(), id);
}

#[parameterized(
    empty = { "" },
    space = { "a b" },
    slash = { "../etc" },
    dot = { "cct.db" },
)]
fn target_id_invalid(id: &str) {
    assert!(matches!(TargetId::new(id), Err(Error::InvalidTarget(_))));
}

#[test]
fn target_id_too_long() {
    assert!(TargetId::new("x".repeat(65)).is_err());
    assert!(TargetId::new("x".repeat(64)).is_ok());
}

#[test]
fn target_id_try_from_string() {
    let id = TargetId::try_from("cct".to_string()).unwrap();
    assert_eq!(String::from(id), "cct");
    assert!(TargetId::try_from("no/slash".to_string()).is_err());
}

#[parameterized(
    high = { "high_priority", QosTier::HighPriority },
    high_short = { "high", QosTier::HighPriority },
    default = { "default", QosTier::Default },
    wifi = { "wifi-only", QosTier::WifiOnly },
    daily = { "DAILY", QosTier::Daily },
)]
fn qos_tier_from_str(input: &str, expected: QosTier) {
    assert_eq!(input.parse::<QosTier>().unwrap(), expected);
}

#[test]
fn qos_tier_roundtrips_through_as_str() {
    for tier in QosTier::ALL {
        assert_eq!(tier.as_str().parse::<QosTier>().unwrap(), tier);
    }
}

#[test]
fn qos_tier_invalid() {
    assert!(matches!("urgent".parse::<QosTier>(), Err(Error::InvalidQosTier(_))));
}

#[test]
fn qos_rank_orders_daily_lowest() {
    let ranks: Vec<u8> = QosTier::ALL.iter().map(|t| t.rank()).collect();
    assert_eq!(ranks, vec![0, 1, 2, 3]);
    assert!(QosTier::Daily.rank() < QosTier::HighPriority.rank());
}

fn stored(id: i64, retry_count: u32, backoff_until_ms: u64) -> StoredEvent {
    StoredEvent {
        id: EventId(id),
        target: TargetId::new("t").unwrap(),
        mapping_id: "1018".into(),
        qos: QosTier::Default,
        payload: vec![1, 2, 3],
        created_at_ms: 1_000,
        expires_at_ms: 10_000,
        retry_count,
        backoff_until_ms,
    }
}

#[test]
fn stored_event_timing() {
    let event = stored(1, 0, 2_000);
    assert!(event.is_backed_off(1_500));
    assert!(!event.is_backed_off(2_000));
    assert!(!event.is_expired(9_999));
    assert!(event.is_expired(10_000));
    assert_eq!(event.age_ms(4_000), 3_000);
    assert_eq!(event.age_ms(500), 0);
}

#[test]
fn event_size_counts_mapping_and_payload() {
    let event = NewEvent::new(TargetId::new("t").unwrap(), "1018", QosTier::Daily, vec![0u8; 10]);
    assert_eq!(event.size_bytes(), 14);
    assert_eq!(stored(1, 0, 0).size_bytes(), 7);
}

#[test]
fn batch_retry_count_is_max() {
    let batch = Batch {
        batch_id: BatchId(1),
        target: TargetId::new("t").unwrap(),
        events: vec![stored(1, 0, 0), stored(2, 3, 0), stored(3, 1, 0)],
    };
    assert_eq!(batch.len(), 3);
    assert_eq!(batch.retry_count(), 3);
    assert_eq!(batch.event_ids(), vec![EventId(1), EventId(2), EventId(3)]);
    assert!(batch.contains_tier(QosTier::Default));
    assert!(!batch.contains_tier(QosTier::Daily));
}
