//! Host-supplied engine settings.
//!
//! [`EngineConfig`] deserializes from any serde format; missing fields take their defaults.
//!
//! ```
//! # use fieldsync::config::EngineConfig;
//! let config: EngineConfig = serde_json::from_str(r#"{ "sync_interval_secs": 300 }"#).unwrap();
//!
//! assert_eq!(config.sync_interval(), std::time::Duration::from_secs(300));
//! assert_eq!(config.max_attempts, 3);
//! ```
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::job::DEFAULT_MAX_ATTEMPTS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Period of the interval trigger.
    pub sync_interval_secs: u64,
    /// Attempts allowed for jobs enqueued without an explicit limit.
    pub max_attempts: u16,
    /// How long a job may stay `processing` before startup recovery returns it to `pending`.
    /// Every sync pass recovers the rest, since no job can still be running when one starts.
    pub processing_grace_secs: u64,
    /// Timeout of every remote request.
    pub request_timeout_secs: u64,
    /// Period of the reachability probe.
    pub probe_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineConfig {
    pub const fn new() -> Self {
        Self {
            sync_interval_secs: 15 * 60,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            processing_grace_secs: 10 * 60,
            request_timeout_secs: 30,
            probe_interval_secs: 30,
        }
    }

    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_secs = interval.as_secs();
        self
    }

    pub const fn with_max_attempts(mut self, max_attempts: u16) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub const fn with_processing_grace(mut self, grace: Duration) -> Self {
        self.processing_grace_secs = grace.as_secs();
        self
    }

    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs();
        self
    }

    pub const fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval_secs = interval.as_secs();
        self
    }

    /// Never zero, since a zero period would make the interval trigger panic.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn processing_grace(&self) -> TimeDelta {
        TimeDelta::seconds(self.processing_grace_secs.min(u64::from(u32::MAX)) as i64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }
}
