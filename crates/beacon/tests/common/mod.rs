// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Helpers shared by the integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon::{
    Config, Report, Telemetry, TargetId, Transport, TransportResponse, TransportResult,
    UploadRequest,
};
use beacon_core::ManualClock;
use beacon_wire::BatchRequest;
use tokio::sync::broadcast;

pub const START_MS: u64 = 1_700_000_000_000;

/// Transport answering with queued status codes, then 200.
#[derive(Clone, Default)]
pub struct MockTransport {
    statuses: Arc<Mutex<VecDeque<u16>>>,
    received: Arc<Mutex<Vec<BatchRequest>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(&self, status: u16) -> &Self {
        self.statuses.lock().unwrap().push_back(status);
        self
    }

    /// Decoded envelopes received so far.
    pub fn received(&self) -> Vec<BatchRequest> {
        self.received.lock().unwrap().clone()
    }

    /// Payloads received so far, in upload order.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.received().into_iter().flat_map(|r| r.events).map(|e| e.payload).collect()
    }
}

impl Transport for MockTransport {
    fn send(
        &self,
        request: UploadRequest,
    ) -> Pin<Box<dyn Future<Output = TransportResult<TransportResponse>> + Send + '_>> {
        self.received.lock().unwrap().push(BatchRequest::from_bytes(&request.body).unwrap());
        let status = self.statuses.lock().unwrap().pop_front().unwrap_or(200);
        Box::pin(async move { Ok(TransportResponse::with_status(status)) })
    }
}

pub fn target(name: &str) -> TargetId {
    TargetId::new(name).unwrap()
}

/// Defaults with millisecond backoff so retries happen within a test.
pub fn config() -> Config {
    let mut config = Config::default();
    config.upload.backoff_base_ms = 5;
    config.upload.backoff_cap_ms = 20;
    config
}

pub fn start(config: &Config, transport: &MockTransport, clock: &Arc<ManualClock>) -> Telemetry {
    Telemetry::start(config, Arc::new(transport.clone()), clock.clone()).unwrap()
}

/// Wait for the next report matching `pred`, skipping others.
pub async fn wait_for(
    reports: &mut broadcast::Receiver<Report>,
    pred: impl Fn(&Report) -> bool,
) -> Report {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let report = reports.recv().await.unwrap();
            if pred(&report) {
                return report;
            }
        }
    })
    .await
    .unwrap()
}

/// Give the scheduler a moment to act on anything pending.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
