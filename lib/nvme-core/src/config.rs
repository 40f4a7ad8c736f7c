// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver configuration.

use std::path::Path;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Errors encountered while loading or validating a [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration file")]
    Io(#[from] std::io::Error),

    #[error("configuration is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables for one controller instance.
///
/// Every field has a default; a missing file or empty table is a valid
/// configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Admin queue depth in entries.
    pub admin_queue_depth: u16,

    /// I/O queue depth in entries.
    pub io_queue_depth: u16,

    /// Number of I/O queue pairs to request from the controller. The
    /// grant may be smaller, as may the interrupt vector allocation.
    pub io_queue_count: u16,

    /// Request pool capacity: the maximum number of concurrently
    /// outstanding commands across all queues.
    pub max_requests: u16,

    /// PRP descriptor-list pool capacity: the maximum number of
    /// concurrently outstanding large (>2 page) transfers.
    pub max_prp_lists: u16,

    /// Resubmission attempts per request before a retriable error is
    /// surfaced to the caller.
    pub retry_limit: u8,

    /// Per-request completion timeout budget in milliseconds.
    pub request_timeout_ms: u64,

    /// Interrupt priority handed to the platform at vector bind time.
    pub intr_priority: u8,

    /// Upper bound on discovered namespaces.
    pub max_namespaces: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin_queue_depth: 32,
            io_queue_depth: 128,
            io_queue_count: 1,
            max_requests: 64,
            max_prp_lists: 16,
            retry_limit: 3,
            request_timeout_ms: 5_000,
            intr_priority: 0,
            max_namespaces: 8,
        }
    }
}

impl Config {
    /// Parse a TOML configuration file.
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let cfg: Self = toml::from_str(&contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check internal consistency.
    ///
    /// A queue of depth N holds at most N - 1 commands, so the request
    /// pool may not exceed what the configured queues can have in flight
    /// at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin_queue_depth < 2 || self.io_queue_depth < 2 {
            return Err(ConfigError::Invalid(
                "queue depths must be at least 2".to_string(),
            ));
        }
        if self.io_queue_count == 0 {
            return Err(ConfigError::Invalid(
                "at least one I/O queue is required".to_string(),
            ));
        }
        if self.max_requests == 0 {
            return Err(ConfigError::Invalid(
                "request pool may not be empty".to_string(),
            ));
        }
        let capacity = (self.admin_queue_depth as u32 - 1)
            + self.io_queue_count as u32 * (self.io_queue_depth as u32 - 1);
        if self.max_requests as u32 > capacity {
            return Err(ConfigError::Invalid(format!(
                "max_requests ({}) exceeds total queue capacity ({})",
                self.max_requests, capacity
            )));
        }
        Ok(())
    }
}
