// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Core telemetry types: targets, QoS tiers, events and batches.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Maximum length of a target id.
const MAX_TARGET_LEN: usize = 64;

/// Identifies the backend an event is uploaded to.
///
/// Target ids name the on-disk queue file, so they are restricted to
/// ASCII alphanumerics, `-` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetId(String);

impl TargetId {
    /// Creates a validated target id.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= MAX_TARGET_LEN
            && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::InvalidTarget(id));
        }
        Ok(TargetId(id))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TargetId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TargetId::new(s)
    }
}

impl TryFrom<String> for TargetId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        TargetId::new(s)
    }
}

impl From<TargetId> for String {
    fn from(id: TargetId) -> Self {
        id.0
    }
}

/// Upload priority class of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QosTier {
    /// Uploaded whenever the network is reachable.
    HighPriority,
    /// Uploaded on wifi, or on any network after a holding window.
    Default,
    /// Uploaded only on wifi.
    WifiOnly,
    /// Uploaded at most once per daily window.
    Daily,
}

impl QosTier {
    /// All tiers, lowest eviction rank first.
    pub const ALL: [QosTier; 4] =
        [QosTier::Daily, QosTier::WifiOnly, QosTier::Default, QosTier::HighPriority];

    /// Returns the string representation used in storage and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            QosTier::HighPriority => "high_priority",
            QosTier::Default => "default",
            QosTier::WifiOnly => "wifi_only",
            QosTier::Daily => "daily",
        }
    }

    /// Eviction rank: lower ranks are evicted first when storage is full.
    pub fn rank(&self) -> u8 {
        match self {
            QosTier::Daily => 0,
            QosTier::WifiOnly => 1,
            QosTier::Default => 2,
            QosTier::HighPriority => 3,
        }
    }
}

impl fmt::Display for QosTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QosTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "high_priority" | "high" => Ok(QosTier::HighPriority),
            "default" => Ok(QosTier::Default),
            "wifi_only" | "wifi" => Ok(QosTier::WifiOnly),
            "daily" => Ok(QosTier::Daily),
            _ => Err(Error::InvalidQosTier(s.to_string())),
        }
    }
}

/// Locally unique event identifier, monotonic within a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an upload batch, monotonic within a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId(pub i64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event handed in by a producer, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub target: TargetId,
    /// Identifies the payload schema.
    pub mapping_id: String,
    pub qos: QosTier,
    pub payload: Vec<u8>,
}

impl NewEvent {
    /// Creates a new event.
    pub fn new(
        target: TargetId,
        mapping_id: impl Into<String>,
        qos: QosTier,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        NewEvent { target, mapping_id: mapping_id.into(), qos, payload: payload.into() }
    }

    /// Bytes this event counts against the storage ceiling.
    pub fn size_bytes(&self) -> u64 {
        event_size(&self.mapping_id, &self.payload)
    }
}

/// An event as persisted in the store.
///
/// Only `retry_count` and `backoff_until_ms` change after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub id: EventId,
    pub target: TargetId,
    pub mapping_id: String,
    pub qos: QosTier,
    pub payload: Vec<u8>,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub retry_count: u32,
    /// Earliest time the event may be selected again.
    pub backoff_until_ms: u64,
}

impl StoredEvent {
    /// Bytes this event counts against the storage ceiling.
    pub fn size_bytes(&self) -> u64 {
        event_size(&self.mapping_id, &self.payload)
    }

    /// True while a retry backoff is pending.
    pub fn is_backed_off(&self, now_ms: u64) -> bool {
        self.backoff_until_ms > now_ms
    }

    /// True once the event has outlived its time-to-live.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }

    /// How long the event has been waiting.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }
}

fn event_size(mapping_id: &str, payload: &[u8]) -> u64 {
    (mapping_id.len() + payload.len()) as u64
}

/// Events selected together for one upload attempt, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub batch_id: BatchId,
    pub target: TargetId,
    pub events: Vec<StoredEvent>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn event_ids(&self) -> Vec<EventId> {
        self.events.iter().map(|e| e.id).collect()
    }

    /// Highest retry count among the batch's events.
    pub fn retry_count(&self) -> u32 {
        self.events.iter().map(|e| e.retry_count).max().unwrap_or(0)
    }

    pub fn contains_tier(&self, qos: QosTier) -> bool {
        self.events.iter().any(|e| e.qos == qos)
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
