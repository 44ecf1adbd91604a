// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Environment variables read by beacond.

use std::path::PathBuf;

/// Environment variable names.
pub mod names {
    /// Overrides the beacond state directory.
    pub const BEACON_STATE_DIR: &str = "BEACON_STATE_DIR";

    /// XDG base directory for state data.
    pub const XDG_STATE_HOME: &str = "XDG_STATE_HOME";

    /// Log level filter read by tracing-subscriber.
    pub const RUST_LOG: &str = "RUST_LOG";
}

/// Returns the value of `BEACON_STATE_DIR` if set.
pub fn state_dir() -> Option<PathBuf> {
    std::env::var(names::BEACON_STATE_DIR).ok().map(PathBuf::from)
}

/// Returns the value of `XDG_STATE_HOME` if set.
pub fn xdg_state_home() -> Option<PathBuf> {
    std::env::var(names::XDG_STATE_HOME).ok().map(PathBuf::from)
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
