// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for beacon-core operations.

use thiserror::Error;

/// All possible errors that can occur in beacon-core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage full: event needs {needed} bytes, {available} available\n  hint: raise storage.max_bytes or upload more often")]
    Capacity { needed: u64, available: u64 },

    #[error("corrupt store '{store}': {reason}")]
    CorruptStore { store: String, reason: String },

    #[error("invalid target id: '{0}'\n  hint: target ids are 1-64 characters of [A-Za-z0-9_-]")]
    InvalidTarget(String),

    #[error("invalid qos tier: '{0}'\n  hint: valid tiers are: high_priority, default, wifi_only, daily")]
    InvalidQosTier(String),

    #[error("invalid drop reason: '{0}'")]
    InvalidDropReason(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted data: {0}")]
    CorruptedData(String),
}

impl Error {
    /// Returns true if the error means the event was refused for lack of space.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::Capacity { .. })
    }
}

/// A specialized Result type for beacon-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
