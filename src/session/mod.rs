// btlesession Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The session core: one radio driver, the device registry, and the scan, connection and GATT
//! controllers wired to the driver's event stream.

mod connection;
pub mod filter;
mod gatt;
mod scan;

pub use self::connection::PendingConnection;
pub use self::gatt::NotificationStream;
pub use self::scan::{ScanState, ScanStream};

use self::connection::ConnectionController;
use self::gatt::GattDispatcher;
use self::scan::ScanController;
use crate::api::{
    AdapterState, CharacteristicHandle, Driver, DriverEvent, PeripheralId, PeripheralRecord,
    ScanFilter, Service, WriteType,
};
use crate::common::registry::DeviceRegistry;
use crate::config::SessionConfig;
use crate::{Error, Result};
use futures::stream::StreamExt;
use log::{debug, info, trace};
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Unsolicited session events, handed out once by [`Session::initialize`].
#[derive(Debug)]
pub struct SessionEvents {
    /// Adapter state transitions, reported only when the state actually changes.
    pub adapter_state: mpsc::UnboundedReceiver<AdapterState>,
    /// Peripherals whose link went down without being asked to.
    pub disconnected: mpsc::UnboundedReceiver<PeripheralId>,
}

struct SessionInner<D: Driver> {
    driver: Arc<D>,
    config: SessionConfig,
    registry: Arc<DeviceRegistry>,
    state: Arc<ScanState>,
    scan: ScanController<D>,
    connections: ConnectionController<D>,
    gatt: GattDispatcher<D>,
    adapter_events: mpsc::UnboundedSender<AdapterState>,
    events: Mutex<Option<SessionEvents>>,
}

/// A BLE central session on top of a single radio [`Driver`].
///
/// `Session` is a cheap handle; clones share the same state.
pub struct Session<D: Driver> {
    inner: Arc<SessionInner<D>>,
}

impl<D: Driver> Clone for Session<D> {
    fn clone(&self) -> Self {
        Session {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Driver> Debug for Session<D> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("driver", &self.inner.driver)
            .field("adapter_state", &self.inner.state.adapter_state())
            .field("scanning", &self.inner.state.is_scanning())
            .field("devices", &self.inner.registry.records().len())
            .finish()
    }
}

impl<D: Driver> Session<D> {
    pub fn new(driver: D, config: SessionConfig) -> Self {
        let driver = Arc::new(driver);
        let registry = Arc::new(DeviceRegistry::default());
        let state = Arc::new(ScanState::default());
        let (adapter_events, adapter_state) = mpsc::unbounded_channel();
        let (disconnect_events, disconnected) = mpsc::unbounded_channel();

        let scan = ScanController::new(
            driver.clone(),
            registry.clone(),
            state.clone(),
            config.scan_restart,
        );
        let connections = ConnectionController::new(
            driver.clone(),
            registry.clone(),
            state.clone(),
            disconnect_events,
            config.connect_timeout,
        );
        let gatt = GattDispatcher::new(driver.clone(), registry.clone());

        Session {
            inner: Arc::new(SessionInner {
                driver,
                config,
                registry,
                state,
                scan,
                connections,
                gatt,
                adapter_events,
                events: Mutex::new(Some(SessionEvents {
                    adapter_state,
                    disconnected,
                })),
            }),
        }
    }

    /// Seeds the adapter state from the driver and starts draining the driver's event stream.
    ///
    /// Returns the session's event channels. Fails with [`Error::AlreadyInitialized`] when
    /// called a second time.
    pub async fn initialize(&self) -> Result<SessionEvents> {
        let Some(events) = self.inner.events.lock().unwrap().take() else {
            return Err(Error::AlreadyInitialized);
        };
        let mut driver_events = match self.inner.driver.events().await {
            Ok(stream) => stream,
            Err(e) => {
                *self.inner.events.lock().unwrap() = Some(events);
                return Err(e);
            }
        };

        let adapter_state = self.inner.driver.adapter_state();
        self.inner.state.set_adapter_state(adapter_state);
        info!("Session initialized, adapter {:?}", adapter_state);

        let weak: Weak<SessionInner<D>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = driver_events.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.dispatch(event);
            }
            debug!("Driver event pump finished");
        });
        Ok(events)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.inner.state.adapter_state()
    }

    /// Whether the driver reports the radio as scanning.
    pub fn is_scanning(&self) -> bool {
        self.inner.state.is_scanning()
    }

    /// Starts a new scan session. The returned stream yields every admitted discovery and ends
    /// when the session stops, at the latest after `duration` if one is given.
    pub async fn start_scan(
        &self,
        filter: ScanFilter,
        duration: Option<Duration>,
    ) -> Result<ScanStream> {
        self.inner.scan.start_scan(filter, duration).await
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.inner.scan.stop_scan().await
    }

    /// Scans for the first device passing `filter`, giving up after the configured
    /// `request_device_timeout`.
    pub async fn request_device(&self, filter: ScanFilter) -> Result<PeripheralRecord> {
        self.inner
            .scan
            .request_device(filter, self.inner.config.request_device_timeout)
            .await
    }

    /// Connects to a discovered device and discovers its services.
    pub async fn connect(&self, id: &PeripheralId) -> Result<()> {
        self.inner.connections.connect(id).await
    }

    pub async fn disconnect(&self, id: &PeripheralId) -> Result<()> {
        self.inner.connections.disconnect(id).await?;
        self.inner.gatt.close_device(id);
        Ok(())
    }

    pub fn pending_connection(&self, id: &PeripheralId) -> Option<PendingConnection> {
        self.inner.connections.pending(id)
    }

    pub fn device(&self, id: &PeripheralId) -> Option<PeripheralRecord> {
        self.inner.registry.get(id)
    }

    /// Snapshot of every device seen since the last scan reset.
    pub fn devices(&self) -> Vec<PeripheralRecord> {
        self.inner.registry.records()
    }

    pub fn services(&self, id: &PeripheralId) -> Result<Vec<Service>> {
        self.inner.gatt.services(id)
    }

    pub fn resolve_characteristic(
        &self,
        id: &PeripheralId,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<CharacteristicHandle> {
        self.inner
            .gatt
            .resolve_characteristic(id, service_uuid, characteristic_uuid)
    }

    pub async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>> {
        self.inner.gatt.read(handle).await
    }

    pub async fn write(
        &self,
        handle: &CharacteristicHandle,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.inner.gatt.write(handle, data, write_type).await
    }

    pub async fn subscribe(&self, handle: &CharacteristicHandle) -> Result<NotificationStream> {
        self.inner.gatt.subscribe(handle).await
    }

    pub async fn unsubscribe(&self, handle: &CharacteristicHandle) -> Result<()> {
        self.inner.gatt.unsubscribe(handle).await
    }

    /// Like [`unsubscribe`](Self::unsubscribe), addressed by UUIDs. Needs no registry record, so
    /// it still works after a scan reset. Not being subscribed is not an error.
    pub async fn unsubscribe_characteristic(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        self.inner
            .gatt
            .unsubscribe_uuid(id, service, characteristic)
            .await
    }

    pub async fn read_rssi(&self, id: &PeripheralId) -> Result<i16> {
        self.inner.gatt.read_rssi(id).await
    }
}

impl<D: Driver> SessionInner<D> {
    fn dispatch(&self, event: DriverEvent) {
        match event {
            DriverEvent::AdapterStateChanged(state) => {
                let previous = self.state.set_adapter_state(state);
                if previous == state {
                    return;
                }
                info!("Adapter state {:?} -> {:?}", previous, state);
                if !state.is_powered_on() {
                    self.scan.abandon();
                    self.state.set_scanning(false);
                }
                if self.adapter_events.send(state).is_err() {
                    trace!("No listener for adapter state events");
                }
            }
            DriverEvent::ScanStarted => self.state.set_scanning(true),
            DriverEvent::ScanStopped => self.state.set_scanning(false),
            DriverEvent::Discovered(raw) => self.scan.handle_discovery(raw),
            DriverEvent::Disconnected(id) => {
                self.connections.handle_disconnected(&id);
                self.gatt.close_device(&id);
            }
            DriverEvent::Notification(notification) => {
                self.gatt.dispatch_notification(notification)
            }
        }
    }
}
