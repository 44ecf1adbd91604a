// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Upload eligibility rules.
//!
//! | tier            | eligible when                                          |
//! |-----------------|--------------------------------------------------------|
//! | `high_priority` | reachable                                              |
//! | `wifi_only`     | reachable over wifi                                    |
//! | `default`       | reachable over wifi, or waited out the holding window  |
//! | `daily`         | reachable, and no daily batch within the daily window  |
//!
//! Events waiting out a retry backoff, or past their time-to-live, are never
//! eligible.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use beacon_core::{
    Batch, ClockSource, ConditionsSnapshot, DroppedEvent, EventStore, QosTier, Result, StoredEvent,
    TargetId, TargetState,
};

use crate::conditions::ConditionsMonitor;

/// Tunables for batch formation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// How long `default` events wait for wifi before any network will do.
    pub default_holding: Duration,
    /// Minimum spacing of batches carrying `daily` events.
    pub daily_window: Duration,
    pub max_batch_events: usize,
    /// Most batches in flight per target.
    pub max_in_flight_batches: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            default_holding: Duration::from_secs(15 * 60),
            daily_window: Duration::from_secs(24 * 60 * 60),
            max_batch_events: 500,
            max_in_flight_batches: 1,
        }
    }
}

fn as_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Whether one event may be uploaded now.
pub fn is_eligible(
    event: &StoredEvent,
    state: &TargetState,
    conditions: ConditionsSnapshot,
    now_ms: u64,
    policy: &Policy,
) -> bool {
    if !conditions.reachable || event.is_backed_off(now_ms) || event.is_expired(now_ms) {
        return false;
    }

    match event.qos {
        QosTier::HighPriority => true,
        QosTier::WifiOnly => conditions.on_wifi(),
        QosTier::Default => {
            conditions.on_wifi() || event.age_ms(now_ms) >= as_ms(policy.default_holding)
        }
        QosTier::Daily => match state.last_daily_upload_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= as_ms(policy.daily_window),
        },
    }
}

/// What one evaluation of a target produced.
#[derive(Debug, Default)]
pub struct Evaluation {
    pub batch: Option<Batch>,
    /// Queued events dropped because they outlived their time-to-live.
    pub expired: Vec<DroppedEvent>,
}

/// Forms batches from a target's queue.
pub struct Prioritizer {
    store: Arc<EventStore>,
    conditions: Arc<ConditionsMonitor>,
    policy: Policy,
}

impl Prioritizer {
    pub fn new(store: Arc<EventStore>, conditions: Arc<ConditionsMonitor>, policy: Policy) -> Self {
        Prioritizer { store, conditions, policy }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Select the next batch for a target, if one is due.
    ///
    /// Nothing is selected while the target is throttled or already has the
    /// maximum number of batches in flight. Expired events are dropped first.
    pub fn evaluate(&self, target: &TargetId) -> Result<Evaluation> {
        let now = self.store.clock().now_ms();

        let state = self.store.target_state(target)?;
        if state.is_throttled(now) {
            trace!(target_id = %target, until = state.throttle_until_ms, "target throttled");
            return Ok(Evaluation::default());
        }

        let in_flight = self.store.in_flight_batches(target)?.len();
        if in_flight >= self.policy.max_in_flight_batches {
            trace!(target_id = %target, in_flight, "in-flight limit reached");
            return Ok(Evaluation::default());
        }

        let expired = self.store.remove_expired(target)?;

        let conditions = self.conditions.current();
        if !conditions.reachable {
            return Ok(Evaluation { batch: None, expired });
        }

        let policy = self.policy;
        let batch = self.store.select_eligible(target, policy.max_batch_events, |event, state| {
            is_eligible(event, state, conditions, now, &policy)
        })?;
        Ok(Evaluation { batch, expired })
    }
}

#[cfg(test)]
#[path = "prioritizer_tests.rs"]
mod tests;
