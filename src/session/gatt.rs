// btlesession Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use crate::api::{
    bleuuid::BleUuid, CharacteristicHandle, Driver, PeripheralId, PeripheralRecord, Service,
    ValueNotification, WriteType,
};
use crate::common::registry::DeviceRegistry;
use crate::{Error, Result};
use dashmap::DashMap;
use futures::stream::Stream;
use log::{debug, trace};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use uuid::Uuid;

type SubscriptionKey = (PeripheralId, Uuid, Uuid);

fn key_of(handle: &CharacteristicHandle) -> SubscriptionKey {
    (
        handle.peripheral_id.clone(),
        handle.service_uuid(),
        handle.uuid(),
    )
}

#[derive(Debug)]
struct Subscription {
    handle: CharacteristicHandle,
    sender: mpsc::UnboundedSender<Vec<u8>>,
    active: Arc<AtomicBool>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Notification payloads of one characteristic subscription, in driver delivery order.
///
/// Ends as soon as the subscription is removed (unsubscribe, resubscribe, or disconnect); payloads
/// still queued at that point are discarded.
#[derive(Debug)]
pub struct NotificationStream {
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    active: Arc<AtomicBool>,
}

impl Stream for NotificationStream {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !self.active.load(Ordering::SeqCst) {
            return Poll::Ready(None);
        }
        self.receiver.poll_recv(cx)
    }
}

#[derive(Debug)]
pub(crate) struct GattDispatcher<D: Driver> {
    driver: Arc<D>,
    registry: Arc<DeviceRegistry>,
    subscriptions: DashMap<SubscriptionKey, Subscription>,
}

impl<D: Driver> GattDispatcher<D> {
    pub(crate) fn new(driver: Arc<D>, registry: Arc<DeviceRegistry>) -> Self {
        GattDispatcher {
            driver,
            registry,
            subscriptions: DashMap::new(),
        }
    }

    fn connected_record(&self, id: &PeripheralId) -> Result<PeripheralRecord> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| Error::DeviceNotFound(id.clone()))?;
        if !record.is_connected() {
            return Err(Error::NotConnected(id.clone()));
        }
        Ok(record)
    }

    pub(crate) fn resolve_characteristic(
        &self,
        id: &PeripheralId,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<CharacteristicHandle> {
        let record = self.connected_record(id)?;
        let service = record
            .service(service_uuid)
            .ok_or(Error::ServiceNotFound(service_uuid))?;
        let characteristic = service
            .characteristic(characteristic_uuid)
            .ok_or(Error::CharacteristicNotFound(characteristic_uuid))?;
        Ok(CharacteristicHandle {
            peripheral_id: id.clone(),
            characteristic: characteristic.clone(),
        })
    }

    pub(crate) fn services(&self, id: &PeripheralId) -> Result<Vec<Service>> {
        Ok(self.connected_record(id)?.services)
    }

    pub(crate) async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>> {
        let id = &handle.peripheral_id;
        self.connected_record(id)?;
        trace!("Reading {} on {}", handle.uuid().to_short_string(), id);
        self.driver
            .read(id, &handle.characteristic)
            .await
            .map_err(|e| Error::from_driver("read", e))
    }

    pub(crate) async fn write(
        &self,
        handle: &CharacteristicHandle,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let id = &handle.peripheral_id;
        self.connected_record(id)?;
        trace!(
            "Writing {} bytes to {} on {} ({:?})",
            data.len(),
            handle.uuid().to_short_string(),
            id,
            write_type
        );
        self.driver
            .write(id, &handle.characteristic, data, write_type)
            .await
            .map_err(|e| Error::from_driver("write", e))
    }

    pub(crate) async fn read_rssi(&self, id: &PeripheralId) -> Result<i16> {
        self.connected_record(id)?;
        let rssi = self
            .driver
            .read_rssi(id)
            .await
            .map_err(|e| Error::from_driver("read rssi", e))?;
        self.registry.update(id, |r| r.rssi = Some(rssi));
        Ok(rssi)
    }

    pub(crate) async fn subscribe(&self, handle: &CharacteristicHandle) -> Result<NotificationStream> {
        let id = &handle.peripheral_id;
        self.connected_record(id)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        // Registered before enabling so the first notification cannot slip past. An older
        // subscription is held aside until the driver accepts the new one.
        let key = key_of(handle);
        let previous = self.subscriptions.insert(
            key.clone(),
            Subscription {
                handle: handle.clone(),
                sender,
                active: active.clone(),
            },
        );

        if let Err(e) = self.driver.subscribe(id, &handle.characteristic).await {
            self.subscriptions
                .remove_if(&key, |_, s| Arc::ptr_eq(&s.active, &active));
            if let Some(previous) = previous {
                self.subscriptions.entry(key).or_insert(previous);
            }
            return Err(Error::from_driver("subscribe", e));
        }
        // Ends the replaced stream.
        drop(previous);
        debug!("Subscribed to {} on {}", handle.uuid().to_short_string(), id);
        Ok(NotificationStream { receiver, active })
    }

    pub(crate) async fn unsubscribe(&self, handle: &CharacteristicHandle) -> Result<()> {
        self.unsubscribe_key(key_of(handle)).await
    }

    /// Unsubscribes by identifiers alone, so it works after the device left the registry.
    pub(crate) async fn unsubscribe_uuid(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        self.unsubscribe_key((id.clone(), service, characteristic))
            .await
    }

    async fn unsubscribe_key(&self, key: SubscriptionKey) -> Result<()> {
        let Some((_, subscription)) = self.subscriptions.remove(&key) else {
            return Ok(());
        };
        let handle = &subscription.handle;
        debug!(
            "Unsubscribing from {} on {}",
            handle.uuid().to_short_string(),
            handle.peripheral_id
        );
        self.driver
            .unsubscribe(&handle.peripheral_id, &handle.characteristic)
            .await
            .map_err(|e| Error::from_driver("unsubscribe", e))
    }

    /// Ends every subscription of a device whose link went down.
    pub(crate) fn close_device(&self, id: &PeripheralId) {
        self.subscriptions.retain(|(device, _, _), _| device != id);
    }

    pub(crate) fn dispatch_notification(&self, notification: ValueNotification) {
        let key = (
            notification.id.clone(),
            notification.service_uuid,
            notification.uuid,
        );
        let closed = match self.subscriptions.get(&key) {
            Some(subscription) => subscription.sender.send(notification.value).is_err(),
            None => {
                trace!(
                    "Dropping notification for {} on {}, not subscribed",
                    notification.uuid.to_short_string(),
                    notification.id
                );
                false
            }
        };
        if closed {
            self.subscriptions
                .remove_if(&key, |_, s| s.sender.is_closed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::bleuuid::uuid_from_u16;
    use crate::api::ConnectionState;
    use crate::fake::{DriverCall, FakeDriver, FakePeripheral, BATTERY_LEVEL, BATTERY_SERVICE};
    use futures::StreamExt;

    fn connected() -> (FakeDriver, Arc<DeviceRegistry>, GattDispatcher<FakeDriver>) {
        let driver = FakeDriver::new();
        let peripheral = FakePeripheral::new("dev", "Sensor")
            .with_battery_service()
            .with_value(BATTERY_LEVEL, vec![87]);
        let services = peripheral.services().to_vec();
        driver.add_peripheral(peripheral);
        driver.set_connected(&"dev".into(), true);

        let registry = Arc::new(DeviceRegistry::default());
        registry.upsert(&"dev".into(), |r| {
            r.connection_state = ConnectionState::Connected;
            r.services = services;
        });
        let gatt = GattDispatcher::new(Arc::new(driver.clone()), registry.clone());
        (driver, registry, gatt)
    }

    fn notification(value: u8) -> ValueNotification {
        ValueNotification {
            id: "dev".into(),
            service_uuid: BATTERY_SERVICE,
            uuid: BATTERY_LEVEL,
            value: vec![value],
        }
    }

    #[test]
    fn resolve_reports_each_lookup_miss() {
        let (_driver, registry, gatt) = connected();
        let id = PeripheralId::from("dev");

        assert!(gatt
            .resolve_characteristic(&id, BATTERY_SERVICE, BATTERY_LEVEL)
            .is_ok());
        assert!(matches!(
            gatt.resolve_characteristic(&"other".into(), BATTERY_SERVICE, BATTERY_LEVEL),
            Err(Error::DeviceNotFound(_))
        ));
        assert!(matches!(
            gatt.resolve_characteristic(&id, uuid_from_u16(0x1800), BATTERY_LEVEL),
            Err(Error::ServiceNotFound(_))
        ));
        let missing = uuid_from_u16(0x2a00);
        assert!(matches!(
            gatt.resolve_characteristic(&id, BATTERY_SERVICE, missing),
            Err(Error::CharacteristicNotFound(uuid)) if uuid == missing
        ));

        registry.update(&id, |r| r.mark_disconnected());
        assert!(matches!(
            gatt.resolve_characteristic(&id, BATTERY_SERVICE, BATTERY_LEVEL),
            Err(Error::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn read_and_write() {
        let (driver, _registry, gatt) = connected();
        let handle = gatt
            .resolve_characteristic(&"dev".into(), BATTERY_SERVICE, BATTERY_LEVEL)
            .unwrap();
        assert_eq!(gatt.read(&handle).await.unwrap(), vec![87]);

        gatt.write(&handle, &[1, 2], WriteType::WithResponse)
            .await
            .unwrap();
        assert_eq!(gatt.read(&handle).await.unwrap(), vec![1, 2]);
        assert!(driver.calls().contains(&DriverCall::Write {
            id: "dev".into(),
            characteristic: BATTERY_LEVEL,
            data: vec![1, 2],
            write_type: WriteType::WithResponse,
        }));
    }

    #[tokio::test]
    async fn stale_handle_fails_after_disconnect() {
        let (_driver, registry, gatt) = connected();
        let handle = gatt
            .resolve_characteristic(&"dev".into(), BATTERY_SERVICE, BATTERY_LEVEL)
            .unwrap();
        registry.update(&"dev".into(), |r| r.mark_disconnected());
        assert!(matches!(
            gatt.read(&handle).await,
            Err(Error::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn driver_errors_become_operation_failed() {
        let (driver, _registry, gatt) = connected();
        let handle = gatt
            .resolve_characteristic(&"dev".into(), BATTERY_SERVICE, BATTERY_LEVEL)
            .unwrap();
        driver.fail_operations(true);
        assert!(matches!(
            gatt.read(&handle).await,
            Err(Error::OperationFailed(_))
        ));
        assert!(matches!(
            gatt.subscribe(&handle).await,
            Err(Error::OperationFailed(_))
        ));
        assert!(gatt.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn failed_resubscribe_keeps_the_live_stream() {
        let (driver, _registry, gatt) = connected();
        let handle = gatt
            .resolve_characteristic(&"dev".into(), BATTERY_SERVICE, BATTERY_LEVEL)
            .unwrap();
        let mut first = gatt.subscribe(&handle).await.unwrap();

        driver.fail_operations(true);
        assert!(matches!(
            gatt.subscribe(&handle).await,
            Err(Error::OperationFailed(_))
        ));
        driver.fail_operations(false);

        gatt.dispatch_notification(notification(5));
        assert_eq!(first.next().await, Some(vec![5]));
        assert_eq!(gatt.subscriptions.len(), 1);
    }

    #[tokio::test]
    async fn rssi_is_requeried_and_recorded() {
        let (driver, registry, gatt) = connected();
        driver.set_rssi(&"dev".into(), -48);
        assert_eq!(gatt.read_rssi(&"dev".into()).await.unwrap(), -48);
        driver.set_rssi(&"dev".into(), -71);
        assert_eq!(gatt.read_rssi(&"dev".into()).await.unwrap(), -71);
        assert_eq!(registry.get(&"dev".into()).unwrap().rssi, Some(-71));
    }

    #[tokio::test]
    async fn notifications_in_delivery_order() {
        let (_driver, _registry, gatt) = connected();
        let handle = gatt
            .resolve_characteristic(&"dev".into(), BATTERY_SERVICE, BATTERY_LEVEL)
            .unwrap();
        let mut stream = gatt.subscribe(&handle).await.unwrap();
        for value in 0..5 {
            gatt.dispatch_notification(notification(value));
        }
        let values: Vec<u8> = stream.by_ref().take(5).map(|v| v[0]).collect().await;
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn resubscribe_yields_independent_stream() {
        let (driver, _registry, gatt) = connected();
        let handle = gatt
            .resolve_characteristic(&"dev".into(), BATTERY_SERVICE, BATTERY_LEVEL)
            .unwrap();

        let mut first = gatt.subscribe(&handle).await.unwrap();
        gatt.dispatch_notification(notification(1));
        gatt.dispatch_notification(notification(2));
        assert_eq!(first.next().await, Some(vec![1]));

        gatt.unsubscribe(&handle).await.unwrap();
        // Idempotent, and the driver only hears about the first one.
        gatt.unsubscribe(&handle).await.unwrap();
        let mut second = gatt.subscribe(&handle).await.unwrap();
        gatt.dispatch_notification(notification(3));

        assert_eq!(first.next().await, None);
        assert_eq!(second.next().await, Some(vec![3]));
        assert_eq!(
            driver
                .calls()
                .iter()
                .filter(|c| matches!(c, DriverCall::Unsubscribe(..)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn unsubscribe_by_uuid_outlives_the_record() {
        let (driver, registry, gatt) = connected();
        let handle = gatt
            .resolve_characteristic(&"dev".into(), BATTERY_SERVICE, BATTERY_LEVEL)
            .unwrap();
        let mut stream = gatt.subscribe(&handle).await.unwrap();

        registry.reset();
        gatt.unsubscribe_uuid(&"dev".into(), BATTERY_SERVICE, BATTERY_LEVEL)
            .await
            .unwrap();
        gatt.dispatch_notification(notification(4));
        assert_eq!(stream.next().await, None);
        assert!(driver
            .calls()
            .contains(&DriverCall::Unsubscribe("dev".into(), BATTERY_LEVEL)));

        // Nothing left to stop.
        gatt.unsubscribe_uuid(&"dev".into(), BATTERY_SERVICE, BATTERY_LEVEL)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn close_device_ends_streams() {
        let (_driver, _registry, gatt) = connected();
        let handle = gatt
            .resolve_characteristic(&"dev".into(), BATTERY_SERVICE, BATTERY_LEVEL)
            .unwrap();
        let mut stream = gatt.subscribe(&handle).await.unwrap();
        gatt.close_device(&"dev".into());
        gatt.dispatch_notification(notification(9));
        assert_eq!(stream.next().await, None);
    }
}
