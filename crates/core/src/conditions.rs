// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Network conditions as seen by the upload policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Kind of network the device is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionClass {
    #[default]
    None,
    Cellular,
    Wifi,
}

impl ConnectionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionClass::None => "none",
            ConnectionClass::Cellular => "cellular",
            ConnectionClass::Wifi => "wifi",
        }
    }
}

impl fmt::Display for ConnectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConnectionClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(ConnectionClass::None),
            "cellular" | "mobile" => Ok(ConnectionClass::Cellular),
            "wifi" | "ethernet" => Ok(ConnectionClass::Wifi),
            _ => Err(Error::InvalidInput(format!(
                "invalid connection class: '{s}'\n  hint: valid classes are: none, cellular, wifi"
            ))),
        }
    }
}

/// Point-in-time view of network conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConditionsSnapshot {
    pub reachable: bool,
    pub connection: ConnectionClass,
}

impl ConditionsSnapshot {
    /// No network at all.
    pub fn offline() -> Self {
        ConditionsSnapshot { reachable: false, connection: ConnectionClass::None }
    }

    /// Reachable over the given connection class.
    pub fn online(connection: ConnectionClass) -> Self {
        ConditionsSnapshot { reachable: connection != ConnectionClass::None, connection }
    }

    /// True when the device is reachable over wifi.
    pub fn on_wifi(&self) -> bool {
        self.reachable && self.connection == ConnectionClass::Wifi
    }
}

#[cfg(test)]
#[path = "conditions_tests.rs"]
mod tests;
