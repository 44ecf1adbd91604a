// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Upload coordinator: sends batches and resolves them against the store.
//!
//! Every batch moves through
//!
//! ```text
//! Selected -> Sending -> Acked           (purged)
//!                     -> TransientFailed (requeued with backoff)
//!                     -> PermanentFailed (purged, reported as data loss)
//! ```
//!
//! and produces exactly one [`UploadOutcome`]. Outcomes are also published
//! as [`Report`]s on a broadcast channel for the host application.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use beacon_core::clock::add_ms;
use beacon_core::{Backoff, Batch, BatchId, DropReason, EventStore, TargetId};
use beacon_wire::{BatchRequest, BatchResponse, ClientInfo, CONTENT_TYPE};

use crate::transport::{Transport, TransportError, TransportResponse, TransportResult, UploadRequest};

/// Settings for sending batches.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Watchdog on a single upload attempt.
    pub timeout: Duration,
    pub backoff: Backoff,
    pub client: ClientInfo,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            timeout: Duration::from_secs(30),
            backoff: Backoff::default(),
            client: ClientInfo::new("unknown", "unknown"),
        }
    }
}

/// Where a batch is in its upload lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Selected,
    Sending,
    Acked,
    TransientFailed,
    PermanentFailed,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Selected => "selected",
            BatchState::Sending => "sending",
            BatchState::Acked => "acked",
            BatchState::TransientFailed => "transient_failed",
            BatchState::PermanentFailed => "permanent_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchState::Selected | BatchState::Sending)
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a batch was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Acknowledged and purged.
    Uploaded { events: usize, throttle_until_ms: Option<u64> },
    /// Returned to the queue; the events are not retried before `retry_at_ms`.
    Requeued { requeued: usize, dropped: usize, retry_at_ms: u64 },
    /// Every event in the batch was lost.
    DataLoss { events: usize, reason: DropReason },
    /// The store could not record the result; the batch stays in the
    /// in-flight ledger until [`UploadCoordinator::retry_resolution`]
    /// succeeds or the next start recovers it.
    Unresolved { error: String },
}

impl UploadOutcome {
    pub fn state(&self) -> BatchState {
        match self {
            UploadOutcome::Uploaded { .. } => BatchState::Acked,
            UploadOutcome::Requeued { .. } | UploadOutcome::Unresolved { .. } => {
                BatchState::TransientFailed
            }
            UploadOutcome::DataLoss { reason, .. } => match reason {
                DropReason::MaxRetriesReached | DropReason::MessageTooOld => {
                    BatchState::TransientFailed
                }
                _ => BatchState::PermanentFailed,
            },
        }
    }

    /// Earliest time the target should be evaluated again, if deferred.
    pub fn resume_at_ms(&self) -> Option<u64> {
        match self {
            UploadOutcome::Uploaded { throttle_until_ms, .. } => *throttle_until_ms,
            UploadOutcome::Requeued { retry_at_ms, .. } => Some(*retry_at_ms),
            _ => None,
        }
    }
}

/// Notifications published to the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    Uploaded { target: TargetId, batch_id: BatchId, events: usize },
    Requeued { target: TargetId, batch_id: BatchId, events: usize, retry_at_ms: u64 },
    /// Events dropped without delivery. `batch_id` is `None` for events
    /// evicted or rejected at append time.
    DataLoss { target: TargetId, batch_id: Option<BatchId>, events: usize, reason: DropReason },
    /// A corrupt database was replaced by an empty one. `target` is `None`
    /// for the metrics database.
    StoreReset { target: Option<TargetId>, reason: String },
}

/// Sends batches and records their outcome.
#[derive(Clone)]
pub struct UploadCoordinator {
    store: Arc<EventStore>,
    transport: Arc<dyn Transport>,
    config: Arc<CoordinatorConfig>,
    reports: broadcast::Sender<Report>,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<EventStore>,
        transport: Arc<dyn Transport>,
        config: CoordinatorConfig,
        reports: broadcast::Sender<Report>,
    ) -> Self {
        UploadCoordinator { store, transport, config: Arc::new(config), reports }
    }

    /// Upload a batch on a background task.
    ///
    /// The receiver yields the batch's single outcome. Must be called from
    /// within a tokio runtime.
    pub fn send(&self, batch: Batch) -> oneshot::Receiver<UploadOutcome> {
        let (tx, rx) = oneshot::channel();
        let coordinator = self.clone();
        tokio::spawn(async move {
            let outcome = coordinator.upload(batch).await;
            let _ = tx.send(outcome);
        });
        rx
    }

    /// Upload a batch and resolve it.
    pub async fn upload(&self, batch: Batch) -> UploadOutcome {
        debug!(
            target_id = %batch.target,
            batch_id = %batch.batch_id,
            events = batch.len(),
            state = %BatchState::Sending,
            "uploading batch"
        );
        let result = self.transmit(&batch).await;
        self.resolve(&batch, result)
    }

    async fn transmit(&self, batch: &Batch) -> TransportResult<TransportResponse> {
        let now = self.store.clock().now_ms();
        let sent_at = i64::try_from(now)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        let body = BatchRequest::from_batch(batch, &self.config.client, sent_at)
            .to_bytes()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        let request = UploadRequest {
            target: batch.target.clone(),
            batch_id: batch.batch_id,
            content_type: CONTENT_TYPE,
            body,
        };

        match tokio::time::timeout(self.config.timeout, self.transport.send(request)).await {
            Ok(result) => result?.error_for_status(),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Apply the result of an upload attempt to the store.
    pub fn resolve(&self, batch: &Batch, result: TransportResult<TransportResponse>) -> UploadOutcome {
        let outcome = match result {
            Ok(response) => self.acked(batch, &response),
            Err(e) if e.is_transient() => self.transient(batch, &e),
            Err(e) => self.permanent(batch, &e),
        };
        debug!(
            target_id = %batch.target,
            batch_id = %batch.batch_id,
            state = %outcome.state(),
            "batch resolved"
        );
        outcome
    }

    fn acked(&self, batch: &Batch, response: &TransportResponse) -> UploadOutcome {
        let target = &batch.target;
        let events = match self.store.purge(target, batch.batch_id) {
            Ok(events) => events,
            Err(e) => return self.unresolved(batch, e),
        };

        let body_wait = match BatchResponse::parse(&response.body) {
            Ok(body) => body.next_request_wait_ms,
            Err(e) => {
                warn!(target_id = %target, error = %e, "ignoring unreadable response body");
                None
            }
        };
        let throttle_until_ms = match body_wait.max(response.retry_after_ms) {
            Some(wait) if wait > 0 => {
                let until = self.store.clock().now_ms().saturating_add(wait);
                self.throttle(target, until);
                Some(until)
            }
            _ => None,
        };

        info!(target_id = %target, batch_id = %batch.batch_id, events, "batch uploaded");
        self.report(Report::Uploaded { target: target.clone(), batch_id: batch.batch_id, events });
        UploadOutcome::Uploaded { events, throttle_until_ms }
    }

    fn transient(&self, batch: &Batch, cause: &TransportError) -> UploadOutcome {
        let target = &batch.target;
        let now = self.store.clock().now_ms();
        let backoff = self.config.backoff.delay(batch.retry_count());
        let backoff_until = add_ms(now, backoff);
        let backend_delay = Duration::from_millis(cause.retry_after_ms().unwrap_or(0));
        let retry_at_ms = add_ms(now, backoff.max(backend_delay));

        let result = match self.store.requeue(target, batch.batch_id, backoff_until) {
            Ok(result) => result,
            Err(e) => return self.unresolved(batch, e),
        };
        // Only the backend holds back the whole target; otherwise backoff
        // is per event.
        if cause.is_throttle() {
            self.throttle(target, retry_at_ms);
        }

        let requeued = result.requeued.len();
        let dropped = result.dropped.len();
        if requeued > 0 {
            warn!(
                target_id = %target,
                batch_id = %batch.batch_id,
                error = %cause,
                requeued,
                retry_in_ms = retry_at_ms.saturating_sub(now),
                "upload failed, batch requeued"
            );
            self.report(Report::Requeued {
                target: target.clone(),
                batch_id: batch.batch_id,
                events: requeued,
                retry_at_ms,
            });
        }

        if dropped == 0 {
            return UploadOutcome::Requeued { requeued, dropped, retry_at_ms };
        }

        let reason = if result.dropped.iter().any(|d| d.reason == DropReason::MaxRetriesReached) {
            DropReason::MaxRetriesReached
        } else {
            DropReason::MessageTooOld
        };
        error!(
            target_id = %target,
            batch_id = %batch.batch_id,
            error = %cause,
            dropped,
            %reason,
            "events dropped after failed upload"
        );
        self.report(Report::DataLoss {
            target: target.clone(),
            batch_id: Some(batch.batch_id),
            events: dropped,
            reason,
        });

        if requeued == 0 {
            UploadOutcome::DataLoss { events: dropped, reason }
        } else {
            UploadOutcome::Requeued { requeued, dropped, retry_at_ms }
        }
    }

    fn permanent(&self, batch: &Batch, cause: &TransportError) -> UploadOutcome {
        let target = &batch.target;
        if let Err(e) = self.store.purge(target, batch.batch_id) {
            return self.unresolved(batch, e);
        }

        let reason = match cause {
            TransportError::Status { code: 400..=499, .. } | TransportError::Encode(_) => {
                DropReason::InvalidPayload
            }
            _ => DropReason::ServerError,
        };
        self.store.record_batch_loss(batch, reason);

        error!(
            target_id = %target,
            batch_id = %batch.batch_id,
            error = %cause,
            events = batch.len(),
            %reason,
            "batch rejected, events dropped"
        );
        self.report(Report::DataLoss {
            target: target.clone(),
            batch_id: Some(batch.batch_id),
            events: batch.len(),
            reason,
        });
        UploadOutcome::DataLoss { events: batch.len(), reason }
    }

    fn unresolved(&self, batch: &Batch, e: beacon_core::Error) -> UploadOutcome {
        error!(
            target_id = %batch.target,
            batch_id = %batch.batch_id,
            error = %e,
            "failed to record upload result, batch left in flight"
        );
        UploadOutcome::Unresolved { error: e.to_string() }
    }

    fn throttle(&self, target: &TargetId, until_ms: u64) {
        if let Err(e) = self.store.set_throttle_until(target, until_ms) {
            warn!(target_id = %target, error = %e, "failed to persist throttle");
        }
    }

    fn report(&self, report: Report) {
        // No subscribers is fine.
        let _ = self.reports.send(report);
    }

    /// Requeue every batch left in flight by a previous run.
    ///
    /// Each one is treated as a transient failure. Returns the number of
    /// batches recovered.
    pub fn recover(&self) -> usize {
        let mut recovered = 0;
        for target in self.store.targets() {
            let batch_ids = match self.store.in_flight_batches(&target) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(target_id = %target, error = %e, "failed to read in-flight ledger");
                    continue;
                }
            };

            for batch_id in batch_ids {
                info!(target_id = %target, %batch_id, "recovering interrupted batch");
                if self.retry_resolution(&target, batch_id).is_some() {
                    recovered += 1;
                }
            }
        }
        recovered
    }

    /// Resolve a batch still in the in-flight ledger as a transient failure.
    ///
    /// Returns `None` if the batch is no longer in flight or cannot be
    /// loaded.
    pub fn retry_resolution(&self, target: &TargetId, batch_id: BatchId) -> Option<UploadOutcome> {
        match self.store.batch(target, batch_id) {
            Ok(Some(batch)) => Some(self.resolve(&batch, Err(TransportError::Interrupted))),
            Ok(None) => None,
            Err(e) => {
                warn!(target_id = %target, %batch_id, error = %e, "failed to load in-flight batch");
                None
            }
        }
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
