// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test helpers for runtime tests.

#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_core::{ClockSource, EventStore, ManualClock, StoreConfig, TargetId};

use crate::transport::{Transport, TransportError, TransportResponse, TransportResult, UploadRequest};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Step {
    Respond(TransportResponse),
    Fail(TransportError),
    /// Never answer; the coordinator watchdog has to fire.
    Hang,
}

/// Transport replaying scripted replies; 200 once the script runs out.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    steps: Arc<Mutex<VecDeque<Step>>>,
    sent: Arc<Mutex<Vec<UploadRequest>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }

    pub fn respond(&self, status: u16) {
        self.push(Step::Respond(TransportResponse::with_status(status)));
    }

    /// Requests received so far.
    pub fn sent(&self) -> Vec<UploadRequest> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    fn send(
        &self,
        request: UploadRequest,
    ) -> Pin<Box<dyn Future<Output = TransportResult<TransportResponse>> + Send + '_>> {
        self.sent.lock().unwrap().push(request);
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Respond(TransportResponse::with_status(200)));
        Box::pin(async move {
            match step {
                Step::Respond(response) => Ok(response),
                Step::Fail(error) => Err(error),
                Step::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(TransportError::Timeout)
                }
            }
        })
    }
}

pub fn target() -> TargetId {
    TargetId::new("cct").unwrap()
}

/// In-memory store on a manual clock.
pub fn memory_store(config: StoreConfig) -> (Arc<EventStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = EventStore::open_in_memory(config, clock.clone() as Arc<dyn ClockSource>).unwrap();
    (Arc::new(store), clock)
}
