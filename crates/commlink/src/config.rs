//! Centralized configuration for commlink.
//!
//! `CommConfig` holds protocol constants. `ClientConfig` and `ServerConfig`
//! carry the per-instance settings, defaulting to the constants.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol-level constants.
pub struct CommConfig;

impl CommConfig {
    // Liveness
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
    pub const PING_TIMEOUT: Duration = Duration::from_secs(3);
    pub const DEFAULT_TOLERABLE_PING_FAILURES: usize = 10;

    // Calls
    pub const CALL_POLL_INTERVAL: Duration = Duration::from_secs(3);
    pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);
    pub const TRACKED_OBJECT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

    // Wire limits
    pub const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024; // 256MB
    pub const MAX_MESSAGE_PARTS: usize = 1024;

    // Transport
    pub const IO_THREADS: usize = 1;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
    pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(100);
    pub const CONTEXT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
    pub const AUTO_BIND_HOST: &'static str = "127.0.0.1";
    pub const AUTO_BIND_PORT_MIN: u16 = 10000;
    pub const AUTO_BIND_PORT_MAX: u16 = 60000;
    pub const AUTO_BIND_ATTEMPTS: usize = 200;

    // Server
    pub const DEFAULT_WORKER_THREADS: usize = 4;

    // Discovery keys
    pub const CONTROL_KEY_SUFFIX: &'static str = "_control";
    pub const STATUS_KEY_SUFFIX: &'static str = "_status";
    /// Value published by `reserve_key` before the real address is known.
    pub const RESERVED_PLACEHOLDER: &'static str = "";
    pub const DISCOVERY_BUSY_TIMEOUT_MS: u32 = 5000;
}

/// Settings for a [`crate::client::CommClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Literal endpoint (`tcp://host:port`) or discovery key of the server.
    pub name: String,
    pub alternate_control_address: Option<String>,
    pub alternate_publish_address: Option<String>,
    pub num_tolerable_ping_failures: usize,
    /// Relay process interrupts to the server as command cancellations.
    pub ops_interruptible: bool,
    pub heartbeat_interval: Duration,
    pub ping_timeout: Duration,
    pub call_poll_interval: Duration,
    pub bootstrap_timeout: Duration,
    pub sync_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            alternate_control_address: None,
            alternate_publish_address: None,
            num_tolerable_ping_failures: CommConfig::DEFAULT_TOLERABLE_PING_FAILURES,
            ops_interruptible: false,
            heartbeat_interval: CommConfig::HEARTBEAT_INTERVAL,
            ping_timeout: CommConfig::PING_TIMEOUT,
            call_poll_interval: CommConfig::CALL_POLL_INTERVAL,
            bootstrap_timeout: CommConfig::BOOTSTRAP_TIMEOUT,
            sync_interval: CommConfig::TRACKED_OBJECT_SYNC_INTERVAL,
        }
    }
}

impl ClientConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_alternate_control_address(mut self, address: impl Into<String>) -> Self {
        self.alternate_control_address = Some(address.into());
        self
    }

    pub fn with_alternate_publish_address(mut self, address: impl Into<String>) -> Self {
        self.alternate_publish_address = Some(address.into());
        self
    }

    pub fn with_tolerable_ping_failures(mut self, failures: usize) -> Self {
        self.num_tolerable_ping_failures = failures;
        self
    }

    pub fn with_ops_interruptible(mut self, interruptible: bool) -> Self {
        self.ops_interruptible = interruptible;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_call_poll_interval(mut self, interval: Duration) -> Self {
        self.call_poll_interval = interval;
        self
    }

    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }
}

/// Settings for a [`crate::server::CommServer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Discovery key under which the server publishes itself. Empty means
    /// no keys are published.
    pub name: String,
    /// Object socket bind address; `None` scans local ports.
    pub bind_address: Option<String>,
    pub control_address: Option<String>,
    pub publish_address: Option<String>,
    pub worker_threads: usize,
    pub control_worker_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            bind_address: None,
            control_address: None,
            publish_address: None,
            worker_threads: CommConfig::DEFAULT_WORKER_THREADS,
            control_worker_threads: 1,
        }
    }
}

impl ServerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = Some(address.into());
        self
    }

    pub fn with_control_address(mut self, address: impl Into<String>) -> Self {
        self.control_address = Some(address.into());
        self
    }

    pub fn with_publish_address(mut self, address: impl Into<String>) -> Self {
        self.publish_address = Some(address.into());
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }
}
