// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use std::time::Duration;
use yare::parameterized;

#[parameterized(
    offline = { ConditionsSnapshot::offline() },
    cellular = { ConditionsSnapshot::online(ConnectionClass::Cellular) },
    wifi = { ConditionsSnapshot::online(ConnectionClass::Wifi) },
    unreachable_wifi = { ConditionsSnapshot { reachable: false, connection: ConnectionClass::Wifi } },
)]
fn packing_preserves_snapshot(snapshot: ConditionsSnapshot) {
    assert_eq!(unpack(pack(snapshot)), snapshot);
}

#[test]
fn default_monitor_is_offline() {
    assert_eq!(ConditionsMonitor::default().current(), ConditionsSnapshot::offline());
}

#[test]
fn update_is_last_write_wins() {
    let monitor = ConditionsMonitor::default();
    monitor.update(ConditionsSnapshot::online(ConnectionClass::Cellular));
    monitor.update(ConditionsSnapshot::online(ConnectionClass::Wifi));
    assert!(monitor.current().on_wifi());
}

#[test]
fn changes_fire_only_on_difference() {
    let monitor = ConditionsMonitor::default();
    let mut changes = monitor.changes();

    monitor.update(ConditionsSnapshot::offline());
    assert!(!changes.has_changed().unwrap());

    monitor.update(ConditionsSnapshot::online(ConnectionClass::Wifi));
    assert!(changes.has_changed().unwrap());
    changes.mark_unchanged();

    monitor.update(ConditionsSnapshot::online(ConnectionClass::Wifi));
    assert!(!changes.has_changed().unwrap());
}

async fn wait_for(monitor: &ConditionsMonitor, expected: ConditionsSnapshot) {
    for _ in 0..100 {
        if monitor.current() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(monitor.current(), expected);
}

#[tokio::test]
async fn subscription_forwards_source_updates() {
    let monitor = Arc::new(ConditionsMonitor::default());
    let (tx, rx) = watch::channel(ConditionsSnapshot::online(ConnectionClass::Cellular));

    let subscription = monitor.subscribe(rx);
    wait_for(&monitor, ConditionsSnapshot::online(ConnectionClass::Cellular)).await;

    tx.send(ConditionsSnapshot::online(ConnectionClass::Wifi)).unwrap();
    wait_for(&monitor, ConditionsSnapshot::online(ConnectionClass::Wifi)).await;
    assert!(subscription.is_active());
}

#[tokio::test]
async fn unsubscribe_stops_forwarding() {
    let monitor = Arc::new(ConditionsMonitor::default());
    let (tx, rx) = watch::channel(ConditionsSnapshot::online(ConnectionClass::Wifi));

    let subscription = monitor.subscribe(rx);
    wait_for(&monitor, ConditionsSnapshot::online(ConnectionClass::Wifi)).await;
    subscription.unsubscribe();
    tokio::time::sleep(Duration::from_millis(20)).await;

    tx.send_replace(ConditionsSnapshot::offline());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(monitor.current().on_wifi());
}

#[tokio::test]
async fn closed_source_ends_subscription() {
    let monitor = Arc::new(ConditionsMonitor::default());
    let (tx, rx) = watch::channel(ConditionsSnapshot::offline());

    let subscription = monitor.subscribe(rx);
    drop(tx);
    for _ in 0..100 {
        if !subscription.is_active() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!subscription.is_active());
}
