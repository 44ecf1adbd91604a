// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! beacon-core: durable storage for client-side telemetry.
//!
//! This crate provides the event data model, the per-target SQLite queues
//! with their in-flight batch ledger, dropped-event accounting, and the
//! clock and backoff primitives shared by the uploader runtime.

pub mod backoff;
pub mod clock;
pub mod conditions;
pub mod db;
pub mod error;
pub mod event;
pub mod metrics;
pub mod store;

pub use backoff::Backoff;
pub use clock::{ClockSource, ManualClock, SystemClock};
pub use conditions::{ConditionsSnapshot, ConnectionClass};
pub use db::{Requeued, TargetState};
pub use error::{Error, Result};
pub use event::{Batch, BatchId, EventId, NewEvent, QosTier, StoredEvent, TargetId};
pub use metrics::{ClientMetrics, DropReason, DroppedEvent, DroppedEventsCounter};
pub use store::{Appended, EventStore, Rescan, StoreConfig, StoreReset};
