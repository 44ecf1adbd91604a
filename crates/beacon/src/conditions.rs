// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Shared view of network conditions.
//!
//! The monitor holds the latest [`ConditionsSnapshot`] packed into a single
//! atomic byte, so reads never block. Platform code either pushes updates
//! with [`ConditionsMonitor::update`] or hands over a watch channel with
//! [`ConditionsMonitor::subscribe`]; the returned [`Subscription`] stops the
//! forwarding task when unsubscribed or dropped.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use beacon_core::{ConditionsSnapshot, ConnectionClass};

const REACHABLE_BIT: u8 = 0b001;
const CLASS_SHIFT: u8 = 1;

fn pack(snapshot: ConditionsSnapshot) -> u8 {
    let class = match snapshot.connection {
        ConnectionClass::None => 0,
        ConnectionClass::Cellular => 1,
        ConnectionClass::Wifi => 2,
    };
    (class << CLASS_SHIFT) | if snapshot.reachable { REACHABLE_BIT } else { 0 }
}

fn unpack(bits: u8) -> ConditionsSnapshot {
    let connection = match bits >> CLASS_SHIFT {
        1 => ConnectionClass::Cellular,
        2 => ConnectionClass::Wifi,
        _ => ConnectionClass::None,
    };
    ConditionsSnapshot { reachable: bits & REACHABLE_BIT != 0, connection }
}

/// Latest known network conditions.
pub struct ConditionsMonitor {
    state: AtomicU8,
    changed: watch::Sender<()>,
}

impl ConditionsMonitor {
    pub fn new(initial: ConditionsSnapshot) -> Self {
        let (changed, _) = watch::channel(());
        ConditionsMonitor { state: AtomicU8::new(pack(initial)), changed }
    }

    /// The current snapshot.
    pub fn current(&self) -> ConditionsSnapshot {
        unpack(self.state.load(Ordering::Acquire))
    }

    /// Replace the snapshot. Listeners are woken only if it changed.
    pub fn update(&self, snapshot: ConditionsSnapshot) {
        let previous = unpack(self.state.swap(pack(snapshot), Ordering::AcqRel));
        if previous != snapshot {
            debug!(
                reachable = snapshot.reachable,
                connection = %snapshot.connection,
                "network conditions changed"
            );
            self.changed.send_replace(());
        }
    }

    /// A receiver that is marked changed whenever the snapshot changes.
    pub fn changes(&self) -> watch::Receiver<()> {
        self.changed.subscribe()
    }

    /// Follow a platform signal source until unsubscribed.
    ///
    /// The source's current value is applied immediately. Must be called
    /// from within a tokio runtime.
    pub fn subscribe(self: &Arc<Self>, mut source: watch::Receiver<ConditionsSnapshot>) -> Subscription {
        let monitor = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let initial = *source.borrow_and_update();
            monitor.update(initial);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = source.changed() => {
                        if changed.is_err() {
                            debug!("conditions source closed");
                            break;
                        }
                        let snapshot = *source.borrow_and_update();
                        monitor.update(snapshot);
                    }
                }
            }
        });

        Subscription { cancel, handle }
    }
}

impl Default for ConditionsMonitor {
    fn default() -> Self {
        Self::new(ConditionsSnapshot::offline())
    }
}

/// Handle to a running [`ConditionsMonitor::subscribe`] task.
pub struct Subscription {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Stop following the signal source.
    pub fn unsubscribe(self) {
        self.cancel.cancel();
    }

    /// True until the forwarding task has exited.
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[path = "conditions_tests.rs"]
mod tests;
