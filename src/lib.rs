// btlesession Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! btlesession is a Bluetooth Low Energy *central* session manager.
//!
//! It sits on top of a radio driver (anything implementing [`api::Driver`]) and owns the state
//! a central application otherwise has to juggle itself: scan sessions with advertisement
//! filtering and deduplication, a registry of discovered peripherals, the connection lifecycle
//! (including a connect timeout and post-connect GATT discovery) and the read/write/notify path
//! against discovered characteristics.
//!
//! There are two layers:
//!
//! - [`Session`] is the typed core. Scans and subscriptions hand back request-scoped streams,
//!   and unsolicited events (adapter state, device-initiated disconnects) arrive on the
//!   [`SessionEvents`] channels returned by [`Session::initialize`].
//! - [`facade::BleClient`] is the host-facing surface taking string ids and UUIDs, with fan-out
//!   event channels for multiple listeners.
//!
//! # Usage
//!
//! ```no_run
//! use btlesession::api::ScanFilter;
//! use btlesession::fake::FakeDriver;
//! use btlesession::{Session, SessionConfig};
//! use futures::StreamExt;
//! use std::time::Duration;
//!
//! # async fn run() -> btlesession::Result<()> {
//! let driver = FakeDriver::new();
//! let session = Session::new(driver, SessionConfig::default());
//! let _events = session.initialize().await?;
//!
//! let mut results = session
//!     .start_scan(ScanFilter::default(), Some(Duration::from_secs(5)))
//!     .await?;
//! while let Some(record) = results.next().await {
//!     println!("found {} ({:?})", record.id, record.advertisement.local_name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub(crate) mod common;
pub mod config;
pub mod facade;
pub mod fake;
#[cfg(feature = "serde")]
pub mod serde;
pub mod session;

pub use config::{ScanRestartPolicy, SessionConfig};
pub use session::{Session, SessionEvents};

use api::{AdapterState, PeripheralId};
use static_assertions::assert_impl_all;
use std::fmt::Debug;
use std::result;
use std::time::Duration;
use uuid::Uuid;

/// The main error type returned by most methods in btlesession.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Bluetooth adapter unavailable (state: {0:?})")]
    AdapterUnavailable(AdapterState),

    #[error("Device {0} not found")]
    DeviceNotFound(PeripheralId),

    #[error("Device {0} is not connected")]
    NotConnected(PeripheralId),

    #[error("A connection attempt to {0} is already in progress")]
    AlreadyConnecting(PeripheralId),

    #[error("A scan is already in progress")]
    AlreadyScanning,

    #[error("Service {0} not found")]
    ServiceNotFound(Uuid),

    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("Connection timed out after {:?}", _0)]
    ConnectionTimeout(Duration),

    #[error("No device matched the request within {:?}", _0)]
    NoDeviceFound(Duration),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Session has not been initialized")]
    NotInitialized,

    #[error("Session is already initialized")]
    AlreadyInitialized,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid UUID: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("Invalid Bluetooth address: {0}")]
    InvalidBDAddr(#[from] api::ParseBDAddrError),

    #[error("{}", _0)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Normalizes an error coming back from the radio driver for operation `op`.
    ///
    /// Errors that already belong to the session taxonomy pass through unchanged, anything else
    /// is reported as [`Error::OperationFailed`].
    pub(crate) fn from_driver(op: &str, error: Error) -> Error {
        match error {
            Error::OperationFailed(_)
            | Error::NotConnected(_)
            | Error::AdapterUnavailable(_) => error,
            other => Error::OperationFailed(format!("{}: {}", op, other)),
        }
    }
}

/// Convenience type for a result using the btlesession [`Error`] type.
pub type Result<T> = result::Result<T, Error>;

assert_impl_all!(Session<fake::FakeDriver>: Clone, Debug, Send, Sized, Sync);
assert_impl_all!(facade::BleClient<fake::FakeDriver>: Clone, Debug, Send, Sized, Sync);
assert_impl_all!(session::ScanStream: Debug, Send, Unpin);
assert_impl_all!(session::NotificationStream: Debug, Send, Unpin);
assert_impl_all!(Error: Send, Sync);
