//! Mock server configuration.

use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wsmock_core::{MockError, Result};

/// Configuration for one mock server instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MockServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// First candidate port (inclusive).
    pub port_range_start: u16,
    /// Last candidate port (inclusive).
    pub port_range_end: u16,
    /// How many candidate ports to try before giving up.
    pub max_bind_attempts: u32,
    /// Upper bound on a single history query to a connection worker.
    pub query_timeout_ms: u64,
    /// Upper bound on waiting for workers during `stop()`.
    pub shutdown_timeout_ms: u64,
    /// Capacity of each connection's command mailbox.
    pub mailbox_capacity: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Upgrade route.
    pub path: String,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port_range_start: 49_152,
            port_range_end: 65_535,
            max_bind_attempts: 10,
            query_timeout_ms: 1_000,
            shutdown_timeout_ms: 5_000,
            mailbox_capacity: 256,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            path: "/ws".into(),
        }
    }
}

impl MockServerConfig {
    /// Defaults overridden by `WSMOCK_*` environment variables.
    ///
    /// Invalid or out-of-range values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `WSMOCK_*` environment overrides in place.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = read_env_string("WSMOCK_HOST") {
            self.host = v;
        }
        if let Some(v) = read_env_u16("WSMOCK_PORT_RANGE_START", 1, 65_535) {
            self.port_range_start = v;
        }
        if let Some(v) = read_env_u16("WSMOCK_PORT_RANGE_END", 1, 65_535) {
            self.port_range_end = v;
        }
        if let Some(v) = read_env_u64("WSMOCK_MAX_BIND_ATTEMPTS", 1, 10_000) {
            self.max_bind_attempts = v as u32;
        }
        if let Some(v) = read_env_u64("WSMOCK_QUERY_TIMEOUT_MS", 1, 600_000) {
            self.query_timeout_ms = v;
        }
        if let Some(v) = read_env_u64("WSMOCK_SHUTDOWN_TIMEOUT_MS", 1, 600_000) {
            self.shutdown_timeout_ms = v;
        }
    }

    /// Reject configurations the allocator or workers cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.port_range_start == 0 || self.port_range_start > self.port_range_end {
            return Err(MockError::InvalidConfig(format!(
                "port range {}..={} is empty",
                self.port_range_start, self.port_range_end
            )));
        }
        if self.max_bind_attempts == 0 {
            return Err(MockError::InvalidConfig(
                "max_bind_attempts must be at least 1".into(),
            ));
        }
        if self.mailbox_capacity == 0 {
            return Err(MockError::InvalidConfig(
                "mailbox_capacity must be at least 1".into(),
            ));
        }
        if !self.path.starts_with('/') {
            return Err(MockError::InvalidConfig(format!(
                "path {:?} must start with '/'",
                self.path
            )));
        }
        Ok(())
    }

    /// Candidate ports as an inclusive range.
    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }

    /// Builder-style helper pinning the candidate range.
    #[must_use]
    pub fn with_port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.port_range_start = *range.start();
        self.port_range_end = *range.end();
        self
    }

    /// Worker query timeout.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Teardown wait bound.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = val.trim().parse::<u16>().ok().filter(|v| (min..=max).contains(v));
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = val.trim().parse::<u64>().ok().filter(|v| (min..=max).contains(v));
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
