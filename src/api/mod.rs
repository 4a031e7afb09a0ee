// btlesession Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The `api` module contains the data model shared by every layer of the session manager, and
//! the [`Driver`] trait a radio backend implements.

pub(crate) mod bdaddr;
pub mod bleuuid;
pub mod driver;

pub use self::bdaddr::{BDAddr, ParseBDAddrError};
pub use self::driver::{Driver, DriverEvent, EventStream, RawPeripheral};

use bitflags::bitflags;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde")]
use serde_cr as serde;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

/// Opaque, stable identifier for a peripheral, assigned by the radio driver.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr", transparent)
)]
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeripheralId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeripheralId {
    fn from(id: String) -> Self {
        PeripheralId(id)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        PeripheralId(id.to_owned())
    }
}

#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum AddressType {
    Random,
    Public,
}

impl Default for AddressType {
    fn default() -> Self {
        AddressType::Public
    }
}

/// Power/authorization state of the radio adapter.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum AdapterState {
    #[default]
    Unknown,
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
}

impl AdapterState {
    pub fn is_powered_on(self) -> bool {
        self == AdapterState::PoweredOn
    }
}

#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

bitflags! {
    /// A set of properties that indicate what operations are supported by a Characteristic.
    #[cfg_attr(
        feature = "serde",
        derive(Serialize, Deserialize),
        serde(crate = "serde_cr")
    )]
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct CharPropFlags: u16 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
        const NOTIFY_ENCRYPTION_REQUIRED = 0x100;
        const INDICATE_ENCRYPTION_REQUIRED = 0x200;
    }
}

/// A BLE descriptor. Descriptors are informational only; no operation targets them.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
}

/// A Bluetooth characteristic. Characteristics are the main way you will interact with other
/// bluetooth devices. Characteristics are identified by a UUID which may be standardized
/// (like 0x2803, which identifies a characteristic for reading heart rate measurements) but more
/// often are specific to a particular device.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharPropFlags,
    pub descriptors: Vec<Descriptor>,
}

impl Display for Characteristic {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "uuid: {:?}, char properties: {:?}",
            self.uuid, self.properties
        )
    }
}

/// A GATT service, with the characteristics discovered on it.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Service {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Advertisement payload of a peripheral, as last observed.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AdvertisementData {
    pub local_name: Option<String>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Manufacturer specific data, keyed by company identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub tx_power_level: Option<i16>,
}

impl AdvertisementData {
    /// Folds a newer advertisement into this one. Fields the newer packet leaves out (a scan
    /// response without a name, say) keep their previous value.
    pub(crate) fn merge(&mut self, newer: &AdvertisementData) {
        if newer.local_name.is_some() {
            self.local_name = newer.local_name.clone();
        }
        if !newer.services.is_empty() {
            self.services = newer.services.clone();
        }
        self.manufacturer_data.extend(
            newer
                .manufacturer_data
                .iter()
                .map(|(k, v)| (*k, v.clone())),
        );
        self.service_data
            .extend(newer.service_data.iter().map(|(k, v)| (*k, v.clone())));
        if newer.tx_power_level.is_some() {
            self.tx_power_level = newer.tx_power_level;
        }
    }
}

/// The most recently observed snapshot of a peripheral, as held by the device registry.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralRecord {
    pub id: PeripheralId,
    pub address: BDAddr,
    pub address_type: Option<AddressType>,
    pub connection_state: ConnectionState,
    pub rssi: Option<i16>,
    pub advertisement: AdvertisementData,
    /// Discovered GATT tree. Empty until a connect (and its discovery) has completed.
    pub services: Vec<Service>,
}

impl PeripheralRecord {
    pub(crate) fn new(id: PeripheralId) -> Self {
        PeripheralRecord {
            id,
            address: BDAddr::default(),
            address_type: None,
            connection_state: ConnectionState::Disconnected,
            rssi: None,
            advertisement: AdvertisementData::default(),
            services: Vec::new(),
        }
    }

    pub(crate) fn apply_advertisement(&mut self, raw: &RawPeripheral) {
        self.address = raw.address;
        if raw.address_type.is_some() {
            self.address_type = raw.address_type;
        }
        if raw.rssi.is_some() {
            self.rssi = raw.rssi;
        }
        self.advertisement.merge(&raw.advertisement);
    }

    /// Moves the record to `Disconnected`, dropping the connection-scoped GATT tree.
    pub(crate) fn mark_disconnected(&mut self) {
        self.connection_state = ConnectionState::Disconnected;
        self.services.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    pub fn service(&self, uuid: Uuid) -> Option<&Service> {
        self.services.iter().find(|s| s.uuid == uuid)
    }
}

/// Criteria applied to advertisements during a scan session.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr", default)
)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only admit devices advertising exactly this name.
    pub name: Option<String>,
    /// Only admit devices whose advertised name starts with this prefix.
    pub name_prefix: Option<String>,
    /// Only admit devices advertising one of these services. Empty means no restriction.
    pub services: Vec<Uuid>,
    /// Report every advertisement instead of only the first one per device.
    pub allow_duplicates: bool,
}

/// The type of write operation to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteType {
    /// A write operation where the device is expected to respond with a confirmation or error.
    /// Also known as a request.
    WithResponse,
    /// A write-without-response, also known as a command.
    WithoutResponse,
}

/// A notification sent from a peripheral due to a change in a value.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValueNotification {
    pub id: PeripheralId,
    pub service_uuid: Uuid,
    /// UUID of the characteristic that fired the notification.
    pub uuid: Uuid,
    #[cfg_attr(feature = "serde", serde(with = "serde_bytes"))]
    pub value: Vec<u8>,
}

/// A characteristic resolved against a connected peripheral's discovered GATT tree.
///
/// Handles are produced by [`Session::resolve_characteristic`](crate::Session::resolve_characteristic)
/// and are the only way into read/write/subscribe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharacteristicHandle {
    pub peripheral_id: PeripheralId,
    pub characteristic: Characteristic,
}

impl CharacteristicHandle {
    pub fn uuid(&self) -> Uuid {
        self.characteristic.uuid
    }

    pub fn service_uuid(&self) -> Uuid {
        self.characteristic.service_uuid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::bleuuid::uuid_from_u16;

    #[test]
    fn merge_keeps_name_from_earlier_packet() {
        let mut adv = AdvertisementData {
            local_name: Some("Thermo".into()),
            services: vec![uuid_from_u16(0x181a)],
            ..Default::default()
        };
        let mut scan_response = AdvertisementData::default();
        scan_response.manufacturer_data.insert(0x004c, vec![1, 2]);
        adv.merge(&scan_response);

        assert_eq!(adv.local_name.as_deref(), Some("Thermo"));
        assert_eq!(adv.services, vec![uuid_from_u16(0x181a)]);
        assert_eq!(adv.manufacturer_data.get(&0x004c), Some(&vec![1, 2]));
    }

    #[test]
    fn mark_disconnected_clears_services() {
        let mut record = PeripheralRecord::new("a".into());
        record.connection_state = ConnectionState::Connected;
        record.services.push(Service {
            uuid: uuid_from_u16(0x180f),
            primary: true,
            characteristics: vec![],
        });
        assert!(record.service(uuid_from_u16(0x180f)).is_some());

        record.mark_disconnected();
        assert!(!record.is_connected());
        assert!(record.services.is_empty());
    }
}
