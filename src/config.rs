//! Session tunables.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde")]
use serde_cr as serde;
use std::time::Duration;

/// How long a connect attempt (link plus GATT discovery) may take.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `request_device` scans for a match.
pub const DEFAULT_REQUEST_DEVICE_TIMEOUT: Duration = Duration::from_secs(30);

/// What `start_scan` does when a scan session is already running.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr", rename_all = "snake_case")
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanRestartPolicy {
    /// Stop the running scan and start the new one in its place.
    #[default]
    Restart,
    /// Refuse with [`Error::AlreadyScanning`](crate::Error::AlreadyScanning).
    Reject,
}

#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr", default)
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    #[cfg_attr(feature = "serde", serde(with = "crate::serde::duration_millis"))]
    pub connect_timeout: Duration,
    #[cfg_attr(feature = "serde", serde(with = "crate::serde::duration_millis"))]
    pub request_device_timeout: Duration,
    pub scan_restart: ScanRestartPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_device_timeout: DEFAULT_REQUEST_DEVICE_TIMEOUT,
            scan_restart: ScanRestartPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_device_timeout(mut self, timeout: Duration) -> Self {
        self.request_device_timeout = timeout;
        self
    }

    pub fn scan_restart(mut self, policy: ScanRestartPolicy) -> Self {
        self.scan_restart = policy;
        self
    }
}
