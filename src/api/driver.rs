// btlesession Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The capability set the session manager requires from a BLE radio backend.

use super::{
    AdapterState, AddressType, AdvertisementData, BDAddr, Characteristic, PeripheralId, Service,
    ValueNotification, WriteType,
};
use crate::Result;
use async_trait::async_trait;
use futures::stream::Stream;
use std::fmt::Debug;
use std::pin::Pin;
use uuid::Uuid;

pub type EventStream = Pin<Box<dyn Stream<Item = DriverEvent> + Send>>;

/// A raw discovery report, before any filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPeripheral {
    pub id: PeripheralId,
    pub address: BDAddr,
    pub address_type: Option<AddressType>,
    pub rssi: Option<i16>,
    pub advertisement: AdvertisementData,
}

/// Everything a driver reports without being asked.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    AdapterStateChanged(AdapterState),
    ScanStarted,
    ScanStopped,
    Discovered(RawPeripheral),
    /// The link to a peripheral went down, whether or not a disconnect was requested.
    Disconnected(PeripheralId),
    Notification(ValueNotification),
}

/// A BLE radio backend in the central role.
///
/// Every request method resolves when the driver considers the request complete; unsolicited
/// happenings are reported through the stream returned by [`Driver::events`]. The session takes
/// that stream exactly once, when it is initialized.
#[async_trait]
pub trait Driver: Send + Sync + Debug + 'static {
    /// Retrieve the stream of `DriverEvent`s.
    async fn events(&self) -> Result<EventStream>;

    /// Current adapter state. Later changes are reported as
    /// [`DriverEvent::AdapterStateChanged`].
    fn adapter_state(&self) -> AdapterState;

    /// Whether [`Driver::start_scan`] honors its `services` argument. Drivers that cannot filter
    /// by service at the radio level return `false`, and the session filters advertisements
    /// itself.
    fn filters_services(&self) -> bool {
        true
    }

    /// Starts a scan for BLE devices advertising any of `services` (all devices if empty).
    async fn start_scan(&self, services: &[Uuid], allow_duplicates: bool) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    /// Creates a connection to the device. Resolves once the link is up.
    async fn connect(&self, id: &PeripheralId) -> Result<()>;

    /// Terminates a connection to the device.
    async fn disconnect(&self, id: &PeripheralId) -> Result<()>;

    /// Discovers all services, characteristics and descriptors of a connected device.
    async fn discover_services(&self, id: &PeripheralId) -> Result<Vec<Service>>;

    async fn read(&self, id: &PeripheralId, characteristic: &Characteristic) -> Result<Vec<u8>>;

    /// Write some data to the characteristic. A `WithoutResponse` write resolves once the data is
    /// queued with the radio; a `WithResponse` write resolves on the peripheral's acknowledgment.
    async fn write(
        &self,
        id: &PeripheralId,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    /// Enables either notify or indicate (depending on support) for the specified characteristic.
    async fn subscribe(&self, id: &PeripheralId, characteristic: &Characteristic) -> Result<()>;

    /// Disables either notify or indicate (depending on support) for the specified characteristic.
    async fn unsubscribe(&self, id: &PeripheralId, characteristic: &Characteristic)
        -> Result<()>;

    async fn read_rssi(&self, id: &PeripheralId) -> Result<i16>;
}
