// btlesession Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! An in-memory, scripted [`Driver`].
//!
//! `FakeDriver` plays the radio: tests and demos register peripherals, make them advertise,
//! notify or drop their link, and inspect the requests the session made through
//! [`FakeDriver::calls`]. Clones share the same radio.

use crate::api::{
    bleuuid::uuid_from_u16, AdapterState, AddressType, AdvertisementData, BDAddr,
    CharPropFlags, Characteristic, Driver, DriverEvent, EventStream, PeripheralId,
    RawPeripheral, Service, ValueNotification, WriteType,
};
use crate::{Error, Result};
use async_trait::async_trait;
use log::trace;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

pub const BATTERY_SERVICE: Uuid = uuid_from_u16(0x180f);
pub const BATTERY_LEVEL: Uuid = uuid_from_u16(0x2a19);

/// A request the session made to the driver, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    StartScan {
        services: Vec<Uuid>,
        allow_duplicates: bool,
    },
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices(PeripheralId),
    Read(PeripheralId, Uuid),
    Write {
        id: PeripheralId,
        characteristic: Uuid,
        data: Vec<u8>,
        write_type: WriteType,
    },
    Subscribe(PeripheralId, Uuid),
    Unsubscribe(PeripheralId, Uuid),
    ReadRssi(PeripheralId),
}

/// How a peripheral answers a connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    #[default]
    Succeed,
    /// The link is refused.
    Fail,
    /// The request is never answered.
    Hang,
}

/// A scripted peripheral.
#[derive(Debug, Clone)]
pub struct FakePeripheral {
    id: PeripheralId,
    name: Option<String>,
    address: BDAddr,
    rssi: i16,
    services: Vec<Service>,
    values: HashMap<Uuid, Vec<u8>>,
    connect: ConnectBehavior,
    connected: bool,
    subscribed: HashSet<Uuid>,
}

impl FakePeripheral {
    pub fn new(id: &str, name: &str) -> Self {
        FakePeripheral {
            id: id.into(),
            name: Some(name.to_owned()),
            address: BDAddr::default(),
            rssi: -60,
            services: Vec::new(),
            values: HashMap::new(),
            connect: ConnectBehavior::Succeed,
            connected: false,
            subscribed: HashSet::new(),
        }
    }

    /// A peripheral that advertises without a local name.
    pub fn unnamed(id: &str) -> Self {
        FakePeripheral {
            name: None,
            ..FakePeripheral::new(id, "")
        }
    }

    pub fn with_address(mut self, address: BDAddr) -> Self {
        self.address = address;
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_service(mut self, uuid: Uuid, characteristics: Vec<(Uuid, CharPropFlags)>) -> Self {
        self.services.push(Service {
            uuid,
            primary: true,
            characteristics: characteristics
                .into_iter()
                .map(|(characteristic, properties)| Characteristic {
                    uuid: characteristic,
                    service_uuid: uuid,
                    properties,
                    descriptors: Vec::new(),
                })
                .collect(),
        });
        self
    }

    /// Adds the standard battery service with a readable, notifying battery level.
    pub fn with_battery_service(self) -> Self {
        self.with_service(
            BATTERY_SERVICE,
            vec![(BATTERY_LEVEL, CharPropFlags::READ | CharPropFlags::NOTIFY)],
        )
    }

    pub fn with_value(mut self, characteristic: Uuid, value: Vec<u8>) -> Self {
        self.values.insert(characteristic, value);
        self
    }

    pub fn id(&self) -> &PeripheralId {
        &self.id
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    fn raw(&self) -> RawPeripheral {
        RawPeripheral {
            id: self.id.clone(),
            address: self.address,
            address_type: Some(if self.address.is_random_static() {
                AddressType::Random
            } else {
                AddressType::Public
            }),
            rssi: Some(self.rssi),
            advertisement: AdvertisementData {
                local_name: self.name.clone(),
                services: self.services.iter().map(|s| s.uuid).collect(),
                ..Default::default()
            },
        }
    }

    fn characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.services.iter().find_map(|s| s.characteristic(uuid))
    }
}

/// A bare discovery report, for feeding the scan path directly.
pub fn advertisement(id: &str, name: Option<&str>) -> RawPeripheral {
    RawPeripheral {
        id: id.into(),
        address: BDAddr::default(),
        address_type: None,
        rssi: Some(-60),
        advertisement: AdvertisementData {
            local_name: name.map(str::to_owned),
            ..Default::default()
        },
    }
}

#[derive(Debug)]
struct Radio {
    adapter_state: AdapterState,
    filters_services: bool,
    // Services of the running scan, `None` while idle.
    scan: Option<Vec<Uuid>>,
    peripherals: HashMap<PeripheralId, FakePeripheral>,
    calls: Vec<DriverCall>,
    hold_write_acks: bool,
    fail_operations: bool,
}

#[derive(Debug)]
struct FakeInner {
    radio: Mutex<Radio>,
    sender: mpsc::UnboundedSender<DriverEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<DriverEvent>>>,
}

#[derive(Debug, Clone)]
pub struct FakeDriver {
    inner: Arc<FakeInner>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDriver {
    /// A powered-on radio with no peripherals around.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        FakeDriver {
            inner: Arc::new(FakeInner {
                radio: Mutex::new(Radio {
                    adapter_state: AdapterState::PoweredOn,
                    filters_services: true,
                    scan: None,
                    peripherals: HashMap::new(),
                    calls: Vec::new(),
                    hold_write_acks: false,
                    fail_operations: false,
                }),
                sender,
                receiver: Mutex::new(Some(receiver)),
            }),
        }
    }

    fn emit(&self, event: DriverEvent) {
        if self.inner.sender.send(event).is_err() {
            trace!("Fake driver event dropped, nobody listens");
        }
    }

    fn record(radio: &mut Radio, call: DriverCall) {
        trace!("Fake driver call {:?}", call);
        radio.calls.push(call);
    }

    /// Every request made so far, oldest first.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.inner.radio.lock().unwrap().calls.clone()
    }

    /// Payloads written to `characteristic` on `id`, oldest first.
    pub fn written(&self, id: &PeripheralId, characteristic: Uuid) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DriverCall::Write {
                    id: target,
                    characteristic: uuid,
                    data,
                    ..
                } if &target == id && uuid == characteristic => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn set_adapter_state(&self, state: AdapterState) {
        {
            let mut radio = self.inner.radio.lock().unwrap();
            radio.adapter_state = state;
            if !state.is_powered_on() {
                radio.scan = None;
            }
        }
        self.emit(DriverEvent::AdapterStateChanged(state));
    }

    pub fn set_filters_services(&self, filters: bool) {
        self.inner.radio.lock().unwrap().filters_services = filters;
    }

    /// While held, `WithResponse` writes are never acknowledged.
    pub fn hold_write_acks(&self, hold: bool) {
        self.inner.radio.lock().unwrap().hold_write_acks = hold;
    }

    /// Makes reads, writes, subscriptions and RSSI queries fail at the radio level.
    pub fn fail_operations(&self, fail: bool) {
        self.inner.radio.lock().unwrap().fail_operations = fail;
    }

    pub fn add_peripheral(&self, peripheral: FakePeripheral) {
        self.inner
            .radio
            .lock()
            .unwrap()
            .peripherals
            .insert(peripheral.id.clone(), peripheral);
    }

    fn with_peripheral<F: FnOnce(&mut FakePeripheral)>(&self, id: &PeripheralId, f: F) {
        if let Some(peripheral) = self.inner.radio.lock().unwrap().peripherals.get_mut(id) {
            f(peripheral);
        }
    }

    pub fn set_connect_behavior(&self, id: &PeripheralId, behavior: ConnectBehavior) {
        self.with_peripheral(id, |p| p.connect = behavior);
    }

    /// Forces the link state of a peripheral without any event.
    pub fn set_connected(&self, id: &PeripheralId, connected: bool) {
        self.with_peripheral(id, |p| p.connected = connected);
    }

    pub fn set_rssi(&self, id: &PeripheralId, rssi: i16) {
        self.with_peripheral(id, |p| p.rssi = rssi);
    }

    /// Makes a registered peripheral advertise once.
    pub fn advertise(&self, id: &PeripheralId) {
        let raw = self
            .inner
            .radio
            .lock()
            .unwrap()
            .peripherals
            .get(id)
            .map(FakePeripheral::raw);
        match raw {
            Some(raw) => self.advertise_raw(raw),
            None => trace!("No fake peripheral {} to advertise", id),
        }
    }

    /// Reports `raw` as heard on the air, if the running scan would pick it up.
    pub fn advertise_raw(&self, raw: RawPeripheral) {
        {
            let radio = self.inner.radio.lock().unwrap();
            let Some(services) = &radio.scan else {
                trace!("Not scanning, {} goes unheard", raw.id);
                return;
            };
            if radio.filters_services
                && !services.is_empty()
                && !raw
                    .advertisement
                    .services
                    .iter()
                    .any(|uuid| services.contains(uuid))
            {
                trace!("Scan service filter drops {}", raw.id);
                return;
            }
        }
        self.emit(DriverEvent::Discovered(raw));
    }

    /// Sends a notification from a subscribed characteristic.
    pub fn notify(&self, id: &PeripheralId, service_uuid: Uuid, uuid: Uuid, value: Vec<u8>) {
        let subscribed = self
            .inner
            .radio
            .lock()
            .unwrap()
            .peripherals
            .get(id)
            .map_or(false, |p| p.connected && p.subscribed.contains(&uuid));
        if !subscribed {
            trace!("{} is not subscribed on {}, notification lost", uuid, id);
            return;
        }
        self.emit(DriverEvent::Notification(ValueNotification {
            id: id.clone(),
            service_uuid,
            uuid,
            value,
        }));
    }

    /// The peripheral goes out of range: the link drops without anybody asking.
    pub fn drop_link(&self, id: &PeripheralId) {
        self.with_peripheral(id, |p| {
            p.connected = false;
            p.subscribed.clear();
        });
        self.emit(DriverEvent::Disconnected(id.clone()));
    }

    /// Looks up a connected peripheral's characteristic for a GATT request, recording `call`.
    fn gatt_request(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
        call: DriverCall,
    ) -> Result<FakePeripheral> {
        let mut radio = self.inner.radio.lock().unwrap();
        Self::record(&mut radio, call);
        let fail = radio.fail_operations;
        let peripheral = radio
            .peripherals
            .get(id)
            .filter(|p| p.connected)
            .ok_or_else(|| Error::NotConnected(id.clone()))?;
        if fail {
            return Err(Error::Other("ATT error 0x0e (unlikely error)".into()));
        }
        if peripheral.characteristic(characteristic).is_none() {
            return Err(Error::Other(
                format!("no attribute handle for {}", characteristic).into(),
            ));
        }
        Ok(peripheral.clone())
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn events(&self) -> Result<EventStream> {
        match self.inner.receiver.lock().unwrap().take() {
            Some(receiver) => Ok(Box::pin(UnboundedReceiverStream::new(receiver))),
            None => Err(Error::Other("event stream already taken".into())),
        }
    }

    fn adapter_state(&self) -> AdapterState {
        self.inner.radio.lock().unwrap().adapter_state
    }

    fn filters_services(&self) -> bool {
        self.inner.radio.lock().unwrap().filters_services
    }

    async fn start_scan(&self, services: &[Uuid], allow_duplicates: bool) -> Result<()> {
        {
            let mut radio = self.inner.radio.lock().unwrap();
            Self::record(
                &mut radio,
                DriverCall::StartScan {
                    services: services.to_vec(),
                    allow_duplicates,
                },
            );
            if !radio.adapter_state.is_powered_on() {
                return Err(Error::AdapterUnavailable(radio.adapter_state));
            }
            radio.scan = Some(services.to_vec());
        }
        self.emit(DriverEvent::ScanStarted);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        {
            let mut radio = self.inner.radio.lock().unwrap();
            Self::record(&mut radio, DriverCall::StopScan);
            radio.scan = None;
        }
        self.emit(DriverEvent::ScanStopped);
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<()> {
        let behavior = {
            let mut radio = self.inner.radio.lock().unwrap();
            Self::record(&mut radio, DriverCall::Connect(id.clone()));
            let peripheral = radio
                .peripherals
                .get_mut(id)
                .ok_or_else(|| Error::DeviceNotFound(id.clone()))?;
            if peripheral.connect == ConnectBehavior::Succeed {
                peripheral.connected = true;
            }
            peripheral.connect
        };
        match behavior {
            ConnectBehavior::Succeed => Ok(()),
            ConnectBehavior::Fail => Err(Error::Other("connection refused by peer".into())),
            ConnectBehavior::Hang => futures::future::pending().await,
        }
    }

    /// Like a real stack, confirms a torn-down link with a `Disconnected` event.
    async fn disconnect(&self, id: &PeripheralId) -> Result<()> {
        let was_connected = {
            let mut radio = self.inner.radio.lock().unwrap();
            Self::record(&mut radio, DriverCall::Disconnect(id.clone()));
            radio.peripherals.get_mut(id).is_some_and(|peripheral| {
                peripheral.subscribed.clear();
                std::mem::replace(&mut peripheral.connected, false)
            })
        };
        if was_connected {
            self.emit(DriverEvent::Disconnected(id.clone()));
        }
        Ok(())
    }

    async fn discover_services(&self, id: &PeripheralId) -> Result<Vec<Service>> {
        let mut radio = self.inner.radio.lock().unwrap();
        Self::record(&mut radio, DriverCall::DiscoverServices(id.clone()));
        radio
            .peripherals
            .get(id)
            .filter(|p| p.connected)
            .map(|p| p.services.clone())
            .ok_or_else(|| Error::NotConnected(id.clone()))
    }

    async fn read(&self, id: &PeripheralId, characteristic: &Characteristic) -> Result<Vec<u8>> {
        let peripheral = self.gatt_request(
            id,
            characteristic.uuid,
            DriverCall::Read(id.clone(), characteristic.uuid),
        )?;
        Ok(peripheral
            .values
            .get(&characteristic.uuid)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(
        &self,
        id: &PeripheralId,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.gatt_request(
            id,
            characteristic.uuid,
            DriverCall::Write {
                id: id.clone(),
                characteristic: characteristic.uuid,
                data: data.to_vec(),
                write_type,
            },
        )?;
        let hold = {
            let mut radio = self.inner.radio.lock().unwrap();
            if let Some(peripheral) = radio.peripherals.get_mut(id) {
                peripheral.values.insert(characteristic.uuid, data.to_vec());
            }
            radio.hold_write_acks
        };
        if write_type == WriteType::WithResponse && hold {
            trace!("Holding the acknowledgment of a write to {}", id);
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn subscribe(&self, id: &PeripheralId, characteristic: &Characteristic) -> Result<()> {
        let peripheral = self.gatt_request(
            id,
            characteristic.uuid,
            DriverCall::Subscribe(id.clone(), characteristic.uuid),
        )?;
        let properties = peripheral
            .characteristic(characteristic.uuid)
            .map(|c| c.properties)
            .unwrap_or_default();
        if !properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE) {
            return Err(Error::Other(
                format!("{} supports neither notify nor indicate", characteristic.uuid).into(),
            ));
        }
        self.with_peripheral(id, |p| {
            p.subscribed.insert(characteristic.uuid);
        });
        Ok(())
    }

    async fn unsubscribe(&self, id: &PeripheralId, characteristic: &Characteristic) -> Result<()> {
        self.gatt_request(
            id,
            characteristic.uuid,
            DriverCall::Unsubscribe(id.clone(), characteristic.uuid),
        )?;
        self.with_peripheral(id, |p| {
            p.subscribed.remove(&characteristic.uuid);
        });
        Ok(())
    }

    async fn read_rssi(&self, id: &PeripheralId) -> Result<i16> {
        let mut radio = self.inner.radio.lock().unwrap();
        Self::record(&mut radio, DriverCall::ReadRssi(id.clone()));
        let fail = radio.fail_operations;
        let peripheral = radio
            .peripherals
            .get(id)
            .filter(|p| p.connected)
            .ok_or_else(|| Error::NotConnected(id.clone()))?;
        if fail {
            return Err(Error::Other("RSSI query failed".into()));
        }
        Ok(peripheral.rssi)
    }
}
