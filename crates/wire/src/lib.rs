// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Upload envelope shared by the uploader and the collection backend.
//!
//! A batch travels as one JSON document: the batch id and target, client
//! metadata, the time the request was built, and the batch's events in
//! arrival order. Payloads are opaque bytes and are carried base64-encoded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use beacon_core::Batch;

/// Version of the envelope format produced by this crate.
pub const WIRE_VERSION: u32 = 1;

/// Version reported as `sdk_version` in client metadata.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// MIME type of an encoded request.
pub const CONTENT_TYPE: &str = "application/json";

/// Errors from encoding requests or decoding responses.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode batch: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("unsupported envelope version {0}\n  hint: this build understands version {WIRE_VERSION}")]
    UnsupportedVersion(u32),
}

pub type Result<T> = std::result::Result<T, WireError>;

/// Metadata describing the sending client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub app_id: String,
    pub os_version: String,
    pub sdk_version: String,
}

impl ClientInfo {
    /// Client metadata stamped with this crate's version.
    pub fn new(app_id: impl Into<String>, os_version: impl Into<String>) -> Self {
        ClientInfo {
            app_id: app_id.into(),
            os_version: os_version.into(),
            sdk_version: SDK_VERSION.to_string(),
        }
    }
}

/// One event inside a batch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    pub mapping_id: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// When the producer logged the event.
    pub event_time_ms: u64,
    /// Upload attempts that already failed for this event.
    #[serde(default)]
    pub retry_count: u32,
}

/// Body of an upload request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub version: u32,
    pub batch_id: i64,
    pub target: String,
    pub sent_at: DateTime<Utc>,
    pub client: ClientInfo,
    pub events: Vec<WireEvent>,
}

impl BatchRequest {
    /// Build the request for a batch, keeping the batch's event order.
    pub fn from_batch(batch: &Batch, client: &ClientInfo, sent_at: DateTime<Utc>) -> Self {
        BatchRequest {
            version: WIRE_VERSION,
            batch_id: batch.batch_id.0,
            target: batch.target.to_string(),
            sent_at,
            client: client.clone(),
            events: batch
                .events
                .iter()
                .map(|e| WireEvent {
                    mapping_id: e.mapping_id.clone(),
                    payload: e.payload.clone(),
                    event_time_ms: e.created_at_ms,
                    retry_count: e.retry_count,
                })
                .collect(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(WireError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let request: BatchRequest = serde_json::from_slice(bytes).map_err(WireError::Decode)?;
        if request.version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(request.version));
        }
        Ok(request)
    }
}

/// Body of a backend reply. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    /// Backend asks the client to wait this long before the next upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_request_wait_ms: Option<u64>,
    /// Number of events the backend stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_events: Option<u64>,
}

impl BatchResponse {
    /// Parse a reply body. An empty body is an empty response.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(BatchResponse::default());
        }
        serde_json::from_slice(body).map_err(WireError::Decode)
    }
}

/// Serde adapter storing bytes as standard base64 text.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
