// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! beacon: client-side telemetry uploader.
//!
//! Events are logged against a target with a QoS tier, persisted by
//! [`beacon_core::EventStore`], grouped into batches by the [`Prioritizer`]
//! according to network conditions, and uploaded by the
//! [`UploadCoordinator`]. [`Telemetry`] runs the whole pipeline.

pub mod conditions;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod prioritizer;
pub mod runtime;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use conditions::{ConditionsMonitor, Subscription};
pub use config::Config;
pub use coordinator::{BatchState, CoordinatorConfig, Report, UploadCoordinator, UploadOutcome};
pub use error::{Error, Result};
pub use prioritizer::{is_eligible, Evaluation, Policy, Prioritizer};
pub use runtime::Telemetry;
pub use transport::{
    HttpTransport, Transport, TransportError, TransportResponse, TransportResult, UploadRequest,
};

pub use beacon_core::{
    ConditionsSnapshot, ConnectionClass, DropReason, EventId, QosTier, SystemClock, TargetId,
};
