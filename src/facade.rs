// btlesession Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Host-facing surface of a session.
//!
//! [`BleClient`] speaks in strings, the way a host bridge hands requests over: device ids are
//! the driver's ids, UUIDs may be full or 16/32-bit short forms. Unsolicited events fan out to
//! any number of listeners.

use crate::api::{
    bleuuid::parse_ble_uuid, CharacteristicHandle, Driver, PeripheralId, PeripheralRecord,
    ScanFilter, Service, ValueNotification, WriteType,
};
use crate::common::util::{self, stream_from_broadcast_receiver};
use crate::session::{Session, SessionEvents};
use crate::{Error, Result, SessionConfig};
use futures::stream::{Stream, StreamExt};
use log::info;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde")]
use serde_cr as serde;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, OnceCell};
use tokio::task::AbortHandle;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub type EventStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Options for [`BleClient::request_device`] and [`BleClient::request_le_scan`].
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr", default, rename_all = "camelCase")
)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestBleDeviceOptions {
    pub services: Vec<String>,
    pub name: Option<String>,
    pub name_prefix: Option<String>,
    /// Services the host wants to use later without filtering on them. Accepted for
    /// compatibility; every discovered service is available after connecting.
    pub optional_services: Vec<String>,
    pub allow_duplicates: Option<bool>,
    /// Scan duration for `request_le_scan`; unbounded when absent.
    pub duration_ms: Option<u64>,
}

impl RequestBleDeviceOptions {
    pub fn into_filter(self) -> Result<ScanFilter> {
        for optional in &self.optional_services {
            parse_ble_uuid(optional)?;
        }
        Ok(ScanFilter {
            name: self.name,
            name_prefix: self.name_prefix,
            services: self
                .services
                .iter()
                .map(|s| parse_ble_uuid(s))
                .collect::<Result<Vec<_>>>()?,
            allow_duplicates: self.allow_duplicates.unwrap_or(false),
        })
    }
}

#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr", rename_all = "camelCase")
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleDevice {
    pub device_id: String,
    pub name: Option<String>,
}

impl From<&PeripheralRecord> for BleDevice {
    fn from(record: &PeripheralRecord) -> Self {
        BleDevice {
            device_id: record.id.to_string(),
            name: record.advertisement.local_name.clone(),
        }
    }
}

/// One admitted discovery of an LE scan.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr", rename_all = "camelCase")
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub device: BleDevice,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub tx_power: Option<i16>,
    pub uuids: Vec<Uuid>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
}

impl From<&PeripheralRecord> for ScanResult {
    fn from(record: &PeripheralRecord) -> Self {
        let adv = &record.advertisement;
        ScanResult {
            device: BleDevice::from(record),
            local_name: adv.local_name.clone(),
            rssi: record.rssi,
            tx_power: adv.tx_power_level,
            uuids: adv.services.clone(),
            manufacturer_data: adv.manufacturer_data.clone(),
            service_data: adv.service_data.clone(),
        }
    }
}

type NotificationKey = (PeripheralId, Uuid, Uuid);

struct ClientInner<D: Driver> {
    session: Session<D>,
    initialized: OnceCell<()>,
    adapter_enabled: broadcast::Sender<bool>,
    scan_results: broadcast::Sender<ScanResult>,
    disconnects: broadcast::Sender<PeripheralId>,
    notifications: broadcast::Sender<ValueNotification>,
    scan_forwarder: Mutex<Option<AbortHandle>>,
    notification_forwarders: Mutex<HashMap<NotificationKey, AbortHandle>>,
}

/// The host-facing BLE client. Cheap to clone; clones share the same session.
pub struct BleClient<D: Driver> {
    inner: Arc<ClientInner<D>>,
}

impl<D: Driver> Clone for BleClient<D> {
    fn clone(&self) -> Self {
        BleClient {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Driver> std::fmt::Debug for BleClient<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BleClient")
            .field("session", &self.inner.session)
            .field("initialized", &self.inner.initialized.initialized())
            .finish()
    }
}

fn device_id(id: &str) -> Result<PeripheralId> {
    if id.is_empty() {
        return Err(Error::InvalidArgument("device id must not be empty".into()));
    }
    Ok(id.into())
}

fn forward<T: Send + 'static>(
    mut source: impl Stream<Item = T> + Send + Unpin + 'static,
    sink: broadcast::Sender<T>,
) -> AbortHandle {
    tokio::spawn(async move {
        while let Some(item) = source.next().await {
            util::broadcast(&sink, item);
        }
    })
    .abort_handle()
}

impl<D: Driver> BleClient<D> {
    pub fn new(driver: D, config: SessionConfig) -> Self {
        Self::from_session(Session::new(driver, config))
    }

    /// Wraps a session that has not been initialized yet.
    pub fn from_session(session: Session<D>) -> Self {
        BleClient {
            inner: Arc::new(ClientInner {
                session,
                initialized: OnceCell::new(),
                adapter_enabled: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
                scan_results: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
                disconnects: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
                notifications: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
                scan_forwarder: Mutex::new(None),
                notification_forwarders: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn session(&self) -> &Session<D> {
        &self.inner.session
    }

    /// Initializes the underlying session. Calling it again is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        self.inner
            .initialized
            .get_or_try_init(|| async {
                let SessionEvents {
                    adapter_state,
                    disconnected,
                } = self.inner.session.initialize().await?;
                let adapter_enabled = tokio_stream::wrappers::UnboundedReceiverStream::new(
                    adapter_state,
                )
                .map(|state| state.is_powered_on());
                forward(adapter_enabled, self.inner.adapter_enabled.clone());
                forward(
                    tokio_stream::wrappers::UnboundedReceiverStream::new(disconnected),
                    self.inner.disconnects.clone(),
                );
                info!("BLE client initialized");
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.inner.initialized.initialized() {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    fn resolve(
        &self,
        device: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<CharacteristicHandle> {
        self.ensure_initialized()?;
        self.inner.session.resolve_characteristic(
            &device_id(device)?,
            parse_ble_uuid(service)?,
            parse_ble_uuid(characteristic)?,
        )
    }

    pub fn is_enabled(&self) -> Result<bool> {
        self.ensure_initialized()?;
        Ok(self.inner.session.adapter_state().is_powered_on())
    }

    /// Scans until a device matches `options`, for at most the session's request timeout.
    pub async fn request_device(&self, options: RequestBleDeviceOptions) -> Result<BleDevice> {
        self.ensure_initialized()?;
        let record = self
            .inner
            .session
            .request_device(options.into_filter()?)
            .await?;
        Ok(BleDevice::from(&record))
    }

    /// Starts an LE scan whose results arrive on [`BleClient::scan_results`].
    pub async fn request_le_scan(&self, options: RequestBleDeviceOptions) -> Result<()> {
        self.ensure_initialized()?;
        let duration = options.duration_ms.map(Duration::from_millis);
        let results = self
            .inner
            .session
            .start_scan(options.into_filter()?, duration)
            .await?;
        let forwarder = forward(
            results.map(|record| ScanResult::from(&record)),
            self.inner.scan_results.clone(),
        );
        if let Some(previous) = self.inner.scan_forwarder.lock().unwrap().replace(forwarder) {
            previous.abort();
        }
        Ok(())
    }

    pub async fn stop_le_scan(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.inner.session.stop_scan().await
    }

    pub async fn connect(&self, device: &str) -> Result<()> {
        self.ensure_initialized()?;
        self.inner.session.connect(&device_id(device)?).await
    }

    pub async fn disconnect(&self, device: &str) -> Result<()> {
        self.ensure_initialized()?;
        let id = device_id(device)?;
        self.inner
            .notification_forwarders
            .lock()
            .unwrap()
            .retain(|(target, _, _), forwarder| {
                if target == &id {
                    forwarder.abort();
                }
                target != &id
            });
        self.inner.session.disconnect(&id).await
    }

    pub fn get_services(&self, device: &str) -> Result<Vec<Service>> {
        self.ensure_initialized()?;
        self.inner.session.services(&device_id(device)?)
    }

    /// Devices seen since the last scan started.
    pub fn get_devices(&self) -> Result<Vec<BleDevice>> {
        self.ensure_initialized()?;
        Ok(self
            .inner
            .session
            .devices()
            .iter()
            .map(BleDevice::from)
            .collect())
    }

    pub async fn read(&self, device: &str, service: &str, characteristic: &str) -> Result<Vec<u8>> {
        let handle = self.resolve(device, service, characteristic)?;
        self.inner.session.read(&handle).await
    }

    pub async fn write(
        &self,
        device: &str,
        service: &str,
        characteristic: &str,
        value: &[u8],
    ) -> Result<()> {
        let handle = self.resolve(device, service, characteristic)?;
        self.inner
            .session
            .write(&handle, value, WriteType::WithResponse)
            .await
    }

    pub async fn write_without_response(
        &self,
        device: &str,
        service: &str,
        characteristic: &str,
        value: &[u8],
    ) -> Result<()> {
        let handle = self.resolve(device, service, characteristic)?;
        self.inner
            .session
            .write(&handle, value, WriteType::WithoutResponse)
            .await
    }

    /// Subscribes to a characteristic; its values arrive on [`BleClient::notifications`].
    pub async fn start_notifications(
        &self,
        device: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<()> {
        let handle = self.resolve(device, service, characteristic)?;
        let values = self.inner.session.subscribe(&handle).await?;
        let (id, service_uuid, uuid) = (
            handle.peripheral_id.clone(),
            handle.service_uuid(),
            handle.uuid(),
        );
        let key = (id.clone(), service_uuid, uuid);
        let forwarder = forward(
            values.map(move |value| ValueNotification {
                id: id.clone(),
                service_uuid,
                uuid,
                value,
            }),
            self.inner.notifications.clone(),
        );
        if let Some(previous) = self
            .inner
            .notification_forwarders
            .lock()
            .unwrap()
            .insert(key, forwarder)
        {
            previous.abort();
        }
        Ok(())
    }

    pub async fn stop_notifications(
        &self,
        device: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let key = (
            device_id(device)?,
            parse_ble_uuid(service)?,
            parse_ble_uuid(characteristic)?,
        );
        if let Some(forwarder) = self.inner.notification_forwarders.lock().unwrap().remove(&key) {
            forwarder.abort();
        }
        self.inner
            .session
            .unsubscribe_characteristic(&key.0, key.1, key.2)
            .await
    }

    pub async fn read_rssi(&self, device: &str) -> Result<i16> {
        self.ensure_initialized()?;
        self.inner.session.read_rssi(&device_id(device)?).await
    }

    pub fn adapter_enabled_events(&self) -> EventStream<bool> {
        stream_from_broadcast_receiver(self.inner.adapter_enabled.subscribe())
    }

    pub fn scan_results(&self) -> EventStream<ScanResult> {
        stream_from_broadcast_receiver(self.inner.scan_results.subscribe())
    }

    pub fn disconnect_events(&self) -> EventStream<PeripheralId> {
        stream_from_broadcast_receiver(self.inner.disconnects.subscribe())
    }

    pub fn notification_events(&self) -> EventStream<ValueNotification> {
        stream_from_broadcast_receiver(self.inner.notifications.subscribe())
    }

    /// Unsolicited disconnects of one device.
    pub fn disconnected(&self, device: &str) -> EventStream<PeripheralId> {
        let wanted = PeripheralId::from(device);
        Box::pin(
            self.disconnect_events()
                .filter(move |id| futures::future::ready(*id == wanted)),
        )
    }

    /// Notifications of one characteristic.
    pub fn notifications(
        &self,
        device: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<EventStream<ValueNotification>> {
        let wanted = (
            PeripheralId::from(device),
            parse_ble_uuid(service)?,
            parse_ble_uuid(characteristic)?,
        );
        Ok(Box::pin(self.notification_events().filter(move |n| {
            futures::future::ready(
                n.id == wanted.0 && n.service_uuid == wanted.1 && n.uuid == wanted.2,
            )
        })))
    }
}
