// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

use thiserror::Error;

use crate::transport::TransportError;

/// All errors surfaced by the beacon runtime.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] beacon_core::Error),

    #[error(transparent)]
    Wire(#[from] beacon_wire::WireError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if the event was refused for lack of space.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::Core(e) if e.is_capacity())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
