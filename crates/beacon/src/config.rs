// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Runtime configuration.
//!
//! Configuration is read from a TOML file with four tables:
//! - `[storage]`: where events live and how much space they may use
//! - `[upload]`: endpoint, retries and batching
//! - `[policy]`: holding and daily windows
//! - `[client]`: metadata sent with every batch
//!
//! Every field has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use beacon_core::{Backoff, StoreConfig};
use beacon_wire::ClientInfo;

use crate::coordinator::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::prioritizer::Policy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Local storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Store directory. Events are kept in memory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Ceiling on stored bytes across all targets (default: 20 MiB).
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    /// Time-to-live of an undelivered event in seconds (default: 30 days).
    #[serde(default = "default_event_ttl_secs")]
    pub event_ttl_secs: u64,
}

/// Upload settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Collection endpoint; must be http:// or https://.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Per-request watchdog in seconds (default: 30).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Transient failures an event survives (default: 5).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay in milliseconds (default: 1000).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Longest retry delay in milliseconds (default: 1 hour).
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Most events in one batch (default: 500).
    #[serde(default = "default_max_batch_events")]
    pub max_batch_events: usize,
    /// Most batches in flight per target (default: 1).
    #[serde(default = "default_max_in_flight_batches")]
    pub max_in_flight_batches: usize,
    /// Period of the sweep over all targets in seconds (default: 30).
    #[serde(default = "default_evaluate_interval_secs")]
    pub evaluate_interval_secs: u64,
}

/// Upload policy windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// How long `default` events wait for wifi before any network will do.
    #[serde(default = "default_holding_secs")]
    pub default_holding_secs: u64,
    /// Minimum spacing of batches carrying `daily` events.
    #[serde(default = "default_daily_window_secs")]
    pub daily_window_secs: u64,
}

/// Client metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_unknown")]
    pub app_id: String,
    #[serde(default = "default_unknown")]
    pub os_version: String,
}

fn default_max_bytes() -> u64 {
    20 * 1024 * 1024
}

fn default_event_ttl_secs() -> u64 {
    30 * 24 * 60 * 60
}

fn default_endpoint() -> String {
    "http://localhost:8080/v1/batch".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    60 * 60 * 1_000
}

fn default_max_batch_events() -> usize {
    500
}

fn default_max_in_flight_batches() -> usize {
    1
}

fn default_evaluate_interval_secs() -> u64 {
    30
}

fn default_holding_secs() -> u64 {
    15 * 60
}

fn default_daily_window_secs() -> u64 {
    24 * 60 * 60
}

fn default_unknown() -> String {
    "unknown".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            dir: None,
            max_bytes: default_max_bytes(),
            event_ttl_secs: default_event_ttl_secs(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            endpoint: default_endpoint(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            max_batch_events: default_max_batch_events(),
            max_in_flight_batches: default_max_in_flight_batches(),
            evaluate_interval_secs: default_evaluate_interval_secs(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            default_holding_secs: default_holding_secs(),
            daily_window_secs: default_daily_window_secs(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig { app_id: default_unknown(), os_version: default_unknown() }
    }
}

impl Config {
    /// Loads and validates configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Parses and validates configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks limits and the endpoint.
    pub fn validate(&self) -> Result<()> {
        let upload = &self.upload;
        if !(upload.endpoint.starts_with("http://") || upload.endpoint.starts_with("https://")) {
            return Err(Error::Config(format!(
                "invalid endpoint '{}'\n  hint: the endpoint must start with http:// or https://",
                upload.endpoint
            )));
        }

        let nonzero = [
            ("storage.max_bytes", self.storage.max_bytes),
            ("storage.event_ttl_secs", self.storage.event_ttl_secs),
            ("upload.timeout_secs", upload.timeout_secs),
            ("upload.max_retries", u64::from(upload.max_retries)),
            ("upload.backoff_base_ms", upload.backoff_base_ms),
            ("upload.max_batch_events", upload.max_batch_events as u64),
            ("upload.max_in_flight_batches", upload.max_in_flight_batches as u64),
            ("upload.evaluate_interval_secs", upload.evaluate_interval_secs),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }

        if upload.backoff_cap_ms < upload.backoff_base_ms {
            return Err(Error::Config(format!(
                "upload.backoff_cap_ms ({}) is below upload.backoff_base_ms ({})",
                upload.backoff_cap_ms, upload.backoff_base_ms
            )));
        }
        Ok(())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_bytes: self.storage.max_bytes,
            event_ttl: Duration::from_secs(self.storage.event_ttl_secs),
            max_retries: self.upload.max_retries,
        }
    }

    pub fn policy(&self) -> Policy {
        Policy {
            default_holding: Duration::from_secs(self.policy.default_holding_secs),
            daily_window: Duration::from_secs(self.policy.daily_window_secs),
            max_batch_events: self.upload.max_batch_events,
            max_in_flight_batches: self.upload.max_in_flight_batches,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.upload.backoff_base_ms),
            Duration::from_millis(self.upload.backoff_cap_ms),
        )
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            timeout: self.upload_timeout(),
            backoff: self.backoff(),
            client: ClientInfo::new(&self.client.app_id, &self.client.os_version),
        }
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload.timeout_secs)
    }

    pub fn evaluate_interval(&self) -> Duration {
        Duration::from_secs(self.upload.evaluate_interval_secs)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
