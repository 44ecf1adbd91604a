// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Transport abstraction for batch uploads.
//!
//! Provides a trait-based transport layer that enables:
//! - HTTP uploads for production
//! - Scripted transports for testing

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use beacon_core::{BatchId, TargetId};

/// Error type for transport operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request never got a response.
    #[error("network error: {0}")]
    Network(String),

    /// The request exceeded the upload watchdog.
    #[error("upload timed out")]
    Timeout,

    /// The backend answered with a non-success status.
    #[error("backend returned status {code}")]
    Status { code: u16, retry_after_ms: Option<u64> },

    /// The batch could not be encoded.
    #[error("failed to encode batch: {0}")]
    Encode(String),

    /// The upload was cut short by a restart.
    #[error("upload interrupted")]
    Interrupted,
}

impl TransportError {
    /// Returns true if the same batch may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Timeout | TransportError::Interrupted => {
                true
            }
            TransportError::Status { code, .. } => classify_status(*code) == StatusClass::Transient,
            TransportError::Encode(_) => false,
        }
    }

    /// Delay the backend asked for, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            TransportError::Status { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// True if the backend asked the client to back off (429 or `Retry-After`).
    pub fn is_throttle(&self) -> bool {
        matches!(self, TransportError::Status { code: 429, .. }) || self.retry_after_ms().is_some()
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// How an HTTP status resolves a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Transient,
    Permanent,
}

/// 2xx succeed; 408, 429 and 5xx are retried; anything else is permanent.
pub fn classify_status(code: u16) -> StatusClass {
    match code {
        200..=299 => StatusClass::Success,
        408 | 429 | 500..=599 => StatusClass::Transient,
        _ => StatusClass::Permanent,
    }
}

/// An encoded batch ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub target: TargetId,
    pub batch_id: BatchId,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

/// What the backend answered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// From the `Retry-After` header.
    pub retry_after_ms: Option<u64>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// A bare response with the given status.
    pub fn with_status(status: u16) -> Self {
        TransportResponse { status, retry_after_ms: None, body: Vec::new() }
    }

    /// Turn a non-2xx response into [`TransportError::Status`].
    pub fn error_for_status(self) -> TransportResult<Self> {
        if classify_status(self.status) == StatusClass::Success {
            Ok(self)
        } else {
            Err(TransportError::Status { code: self.status, retry_after_ms: self.retry_after_ms })
        }
    }
}

/// Transport trait for batch uploads.
///
/// Implementations return a response for every status code; classification
/// is left to the caller.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: UploadRequest,
    ) -> Pin<Box<dyn Future<Output = TransportResult<TransportResponse>> + Send + '_>>;
}

/// HTTP transport posting each batch to a single endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    /// Create a transport; `timeout` bounds each request at the socket level.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("beacon/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(HttpTransport { client, endpoint: endpoint.into() })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Transport for HttpTransport {
    fn send(
        &self,
        request: UploadRequest,
    ) -> Pin<Box<dyn Future<Output = TransportResult<TransportResponse>> + Send + '_>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.endpoint)
                .header(reqwest::header::CONTENT_TYPE, request.content_type)
                .header("X-Beacon-Target", request.target.as_str())
                .header("X-Beacon-Batch", request.batch_id.to_string())
                .body(request.body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        TransportError::Timeout
                    } else {
                        TransportError::Network(e.to_string())
                    }
                })?;

            let status = response.status().as_u16();
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, chrono::Utc::now()));
            let body = response
                .bytes()
                .await
                .map_err(|e| TransportError::Network(e.to_string()))?
                .to_vec();

            Ok(TransportResponse { status, retry_after_ms, body })
        })
    }
}

/// Parse a `Retry-After` value (delay seconds or an HTTP date) into milliseconds.
pub fn parse_retry_after(value: &str, now: chrono::DateTime<chrono::Utc>) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs.saturating_mul(1_000));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.signed_duration_since(now).num_milliseconds();
    Some(u64::try_from(wait).unwrap_or(0))
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
