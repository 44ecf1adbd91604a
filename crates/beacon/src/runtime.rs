// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! The telemetry runtime: store, prioritizer, coordinator and scheduler
//! wired together behind one handle.
//!
//! The scheduler is a single task that evaluates targets when
//! - an event is logged,
//! - network conditions change,
//! - a batch resolves or its retry deadline passes,
//! - the periodic tick fires.
//!
//! Evaluations are serialized through it; uploads run on their own tasks.
//! The periodic tick also rescans the store directory for queues written by
//! other processes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beacon_core::{
    Backoff, Batch, BatchId, ClientMetrics, ClockSource, DropReason, EventId, EventStore, NewEvent,
    QosTier, TargetId,
};

use crate::conditions::ConditionsMonitor;
use crate::config::Config;
use crate::coordinator::{Report, UploadCoordinator, UploadOutcome};
use crate::error::Result;
use crate::prioritizer::Prioritizer;
use crate::transport::Transport;

/// Reports buffered per subscriber before the oldest are skipped.
const REPORT_CAPACITY: usize = 256;

/// Work for the scheduler task.
#[derive(Debug)]
enum Nudge {
    Target(TargetId),
    All,
    Resolved { target: TargetId, batch_id: BatchId, outcome: UploadOutcome },
    /// Try again to record the result of a batch left in flight.
    RetryResolution { target: TargetId, batch_id: BatchId },
}

/// Handle to a running telemetry pipeline.
pub struct Telemetry {
    store: Arc<EventStore>,
    conditions: Arc<ConditionsMonitor>,
    reports: broadcast::Sender<Report>,
    /// Holds reports emitted during start until the first subscriber.
    first_subscriber: Mutex<Option<broadcast::Receiver<Report>>>,
    nudges: mpsc::UnboundedSender<Nudge>,
    cancel: CancellationToken,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl Telemetry {
    /// Open the store, recover interrupted uploads and start the scheduler.
    ///
    /// Without `storage.dir` the store lives in memory. Network conditions
    /// start offline until the host reports them through [`Telemetry::conditions`].
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: &Config,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Telemetry> {
        config.validate()?;

        let store = match &config.storage.dir {
            Some(dir) => EventStore::open(dir, config.store_config(), clock)?,
            None => EventStore::open_in_memory(config.store_config(), clock)?,
        };
        let store = Arc::new(store);
        let conditions = Arc::new(ConditionsMonitor::default());
        let (reports, first) = broadcast::channel(REPORT_CAPACITY);

        for reset in store.resets() {
            let _ = reports.send(Report::StoreReset { target: reset.target, reason: reset.reason });
        }

        let coordinator = UploadCoordinator::new(
            Arc::clone(&store),
            transport,
            config.coordinator_config(),
            reports.clone(),
        );
        let recovered = coordinator.recover();
        if recovered > 0 {
            info!(recovered, "requeued batches interrupted by the last shutdown");
        }

        let (nudges, nudge_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let scheduler = Scheduler {
            prioritizer: Prioritizer::new(Arc::clone(&store), Arc::clone(&conditions), config.policy()),
            coordinator,
            store: Arc::clone(&store),
            reports: reports.clone(),
            nudges: nudges.clone(),
            backoff: config.backoff(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(scheduler.run(nudge_rx, conditions.changes(), config.evaluate_interval()));

        info!(
            targets = store.targets().len(),
            queued_bytes = store.total_bytes(),
            persistent = config.storage.dir.is_some(),
            "telemetry started"
        );

        Ok(Telemetry {
            store,
            conditions,
            reports,
            first_subscriber: Mutex::new(Some(first)),
            nudges,
            cancel,
            scheduler: Mutex::new(Some(handle)),
        })
    }

    /// Queue an event for upload.
    ///
    /// Events evicted to make room, or this event if it is rejected, are
    /// published as [`Report::DataLoss`], one report per affected target.
    pub fn log_event(
        &self,
        target: &TargetId,
        mapping_id: impl Into<String>,
        qos: QosTier,
        payload: impl Into<Vec<u8>>,
    ) -> Result<EventId> {
        let event = NewEvent::new(target.clone(), mapping_id, qos, payload);
        let appended = match self.store.append(event) {
            Ok(appended) => appended,
            Err(e) => {
                if e.is_capacity() {
                    self.report_storage_loss(target, 1);
                }
                return Err(e.into());
            }
        };

        let mut evicted: BTreeMap<&TargetId, usize> = BTreeMap::new();
        for (owner, _) in &appended.evicted {
            *evicted.entry(owner).or_default() += 1;
        }
        for (owner, events) in evicted {
            self.report_storage_loss(owner, events);
        }
        let _ = self.nudges.send(Nudge::Target(target.clone()));
        Ok(appended.id)
    }

    fn report_storage_loss(&self, target: &TargetId, events: usize) {
        let _ = self.reports.send(Report::DataLoss {
            target: target.clone(),
            batch_id: None,
            events,
            reason: DropReason::StorageFull,
        });
    }

    /// Receive upload reports.
    ///
    /// The first subscriber also sees reports emitted during start.
    pub fn subscribe(&self) -> broadcast::Receiver<Report> {
        let first = self.first_subscriber.lock().unwrap_or_else(|e| e.into_inner()).take();
        first.unwrap_or_else(|| self.reports.subscribe())
    }

    pub fn conditions(&self) -> &Arc<ConditionsMonitor> {
        &self.conditions
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Current drop counters and storage usage.
    pub fn metrics(&self) -> Result<ClientMetrics> {
        Ok(self.store.metrics()?)
    }

    /// Read the drop counters and reset them.
    pub fn take_metrics(&self) -> Result<ClientMetrics> {
        Ok(self.store.take_metrics()?)
    }

    /// Evaluate every target without waiting for the next tick.
    pub fn evaluate_now(&self) {
        let _ = self.nudges.send(Nudge::All);
    }

    /// Stop the scheduler.
    ///
    /// Uploads already in flight keep running; any that do not finish are
    /// recovered on the next start.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.scheduler.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler task failed");
            }
        }
        info!("telemetry stopped");
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Scheduler {
    prioritizer: Prioritizer,
    coordinator: UploadCoordinator,
    store: Arc<EventStore>,
    reports: broadcast::Sender<Report>,
    nudges: mpsc::UnboundedSender<Nudge>,
    /// Spacing of attempts to resolve a batch the store could not record.
    backoff: Backoff,
    cancel: CancellationToken,
}

impl Scheduler {
    async fn run(
        self,
        mut nudges: mpsc::UnboundedReceiver<Nudge>,
        mut changes: watch::Receiver<()>,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.rescan();
                    self.evaluate_all();
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.evaluate_all();
                }
                nudge = nudges.recv() => match nudge {
                    Some(Nudge::Target(target)) => self.evaluate(&target),
                    Some(Nudge::All) => self.evaluate_all(),
                    Some(Nudge::Resolved { target, batch_id, outcome }) => {
                        self.resolved(target, batch_id, outcome)
                    }
                    Some(Nudge::RetryResolution { target, batch_id }) => {
                        match self.coordinator.retry_resolution(&target, batch_id) {
                            Some(outcome) => self.resolved(target, batch_id, outcome),
                            None => self.evaluate(&target),
                        }
                    }
                    None => break,
                },
            }
        }
        debug!("scheduler stopped");
    }

    fn report(&self, report: Report) {
        let _ = self.reports.send(report);
    }

    /// Pick up queues created by other writers.
    fn rescan(&self) {
        match self.store.rescan() {
            Ok(rescan) => {
                for reset in rescan.resets {
                    self.report(Report::StoreReset { target: reset.target, reason: reset.reason });
                }
            }
            Err(e) => warn!(error = %e, "failed to rescan store"),
        }
    }

    fn evaluate_all(&self) {
        for target in self.store.targets() {
            self.evaluate(&target);
        }
    }

    /// Dispatch batches for a target until nothing more is due.
    fn evaluate(&self, target: &TargetId) {
        loop {
            let evaluation = match self.prioritizer.evaluate(target) {
                Ok(evaluation) => evaluation,
                Err(e) => {
                    warn!(target_id = %target, error = %e, "failed to evaluate target");
                    break;
                }
            };

            if !evaluation.expired.is_empty() {
                self.report(Report::DataLoss {
                    target: target.clone(),
                    batch_id: None,
                    events: evaluation.expired.len(),
                    reason: DropReason::MessageTooOld,
                });
            }
            match evaluation.batch {
                Some(batch) => self.dispatch(target.clone(), batch),
                None => break,
            }
        }
    }

    fn dispatch(&self, target: TargetId, batch: Batch) {
        debug!(target_id = %target, batch_id = %batch.batch_id, events = batch.len(), "dispatching batch");
        let batch_id = batch.batch_id;
        let outcome = self.coordinator.send(batch);
        let nudges = self.nudges.clone();
        tokio::spawn(async move {
            if let Ok(outcome) = outcome.await {
                let _ = nudges.send(Nudge::Resolved { target, batch_id, outcome });
            }
        });
    }

    fn resolved(&self, target: TargetId, batch_id: BatchId, outcome: UploadOutcome) {
        if let UploadOutcome::Unresolved { error } = &outcome {
            let delay = self.backoff.delay(0);
            warn!(target_id = %target, %batch_id, %error, retry_in_ms = delay.as_millis() as u64, "batch left in flight");
            self.nudge_after(delay, Nudge::RetryResolution { target, batch_id });
            return;
        }

        let now = self.store.clock().now_ms();
        match outcome.resume_at_ms() {
            Some(at) if at > now => {
                self.nudge_after(Duration::from_millis(at - now), Nudge::Target(target))
            }
            _ => self.evaluate(&target),
        }
    }

    /// Deliver `nudge` once `delay` has passed, unless shut down first.
    fn nudge_after(&self, delay: Duration, nudge: Nudge) {
        let nudges = self.nudges.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = nudges.send(nudge);
                }
            }
        });
    }
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
