// End-to-end scenarios for the session core, driven against the scripted fake radio.

use btlesession::api::{ConnectionState, PeripheralId, ScanFilter, WriteType};
use btlesession::fake::{
    ConnectBehavior, DriverCall, FakeDriver, FakePeripheral, BATTERY_LEVEL, BATTERY_SERVICE,
};
use btlesession::{Error, Session, SessionConfig, SessionEvents};
use futures::StreamExt;
use std::time::Duration;
use tokio::time::Instant;

async fn start(driver: &FakeDriver) -> (Session<FakeDriver>, SessionEvents) {
    let _ = pretty_env_logger::try_init();
    let session = Session::new(driver.clone(), SessionConfig::default());
    let events = session.initialize().await.unwrap();
    (session, events)
}

/// Runs a short scan so that `ids` end up in the registry.
async fn discover(session: &Session<FakeDriver>, driver: &FakeDriver, ids: &[&str]) {
    let mut results = session
        .start_scan(ScanFilter::default(), None)
        .await
        .unwrap();
    for id in ids {
        driver.advertise(&PeripheralId::from(*id));
    }
    for _ in ids {
        results.next().await.unwrap();
    }
    session.stop_scan().await.unwrap();
}

async fn connected_sensor() -> (FakeDriver, Session<FakeDriver>, SessionEvents) {
    let driver = FakeDriver::new();
    driver.add_peripheral(
        FakePeripheral::new("dev", "Sensor")
            .with_battery_service()
            .with_value(BATTERY_LEVEL, vec![64]),
    );
    let (session, events) = start(&driver).await;
    discover(&session, &driver, &["dev"]).await;
    session.connect(&"dev".into()).await.unwrap();
    (driver, session, events)
}

#[tokio::test(start_paused = true)]
async fn timed_scan_reports_each_device_once_then_ends() {
    let driver = FakeDriver::new();
    for id in ["a", "b", "c"] {
        driver.add_peripheral(FakePeripheral::new(id, &id.to_uppercase()));
    }
    let (session, _events) = start(&driver).await;

    let started = Instant::now();
    let results = session
        .start_scan(ScanFilter::default(), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    for id in ["a", "b", "c", "a", "b"] {
        driver.advertise(&id.into());
    }

    let mut ids: Vec<String> = results.map(|r| r.id.to_string()).collect().await;
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(session.devices().len(), 3);
    assert!(driver.calls().contains(&DriverCall::StopScan));
}

#[tokio::test]
async fn name_prefix_scan() {
    let driver = FakeDriver::new();
    driver.add_peripheral(FakePeripheral::new("1", "FooBar"));
    driver.add_peripheral(FakePeripheral::new("2", "Bar"));
    driver.add_peripheral(FakePeripheral::unnamed("3"));
    let (session, _events) = start(&driver).await;

    let filter = ScanFilter {
        name_prefix: Some("Foo".into()),
        ..Default::default()
    };
    let mut results = session.start_scan(filter, None).await.unwrap();
    for id in ["2", "3", "1"] {
        driver.advertise(&id.into());
    }
    assert_eq!(results.next().await.unwrap().id.as_str(), "1");
    session.stop_scan().await.unwrap();
    assert!(results.next().await.is_none());
    assert!(session.device(&"2".into()).is_none());
}

#[tokio::test]
async fn unknown_device_fails_immediately() {
    let driver = FakeDriver::new();
    let (session, _events) = start(&driver).await;
    assert!(matches!(
        session.connect(&"X".into()).await,
        Err(Error::DeviceNotFound(_))
    ));
    assert!(session.pending_connection(&"X".into()).is_none());
    assert!(driver.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_peripheral_times_out_after_ten_seconds() {
    let driver = FakeDriver::new();
    driver.add_peripheral(FakePeripheral::new("Y", "Silent"));
    driver.set_connect_behavior(&"Y".into(), ConnectBehavior::Hang);
    let (session, _events) = start(&driver).await;
    discover(&session, &driver, &["Y"]).await;

    let started = Instant::now();
    let result = session.connect(&"Y".into()).await;
    assert!(matches!(result, Err(Error::ConnectionTimeout(t)) if t == Duration::from_secs(10)));
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(
        session.device(&"Y".into()).unwrap().connection_state,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn missing_characteristic_after_connect() {
    let (_driver, session, _events) = connected_sensor().await;
    let missing = btlesession::api::bleuuid::uuid_from_u16(0x2a1a);
    assert!(matches!(
        session.resolve_characteristic(&"dev".into(), BATTERY_SERVICE, missing),
        Err(Error::CharacteristicNotFound(uuid)) if uuid == missing
    ));
    assert_eq!(session.services(&"dev".into()).unwrap().len(), 1);
}

#[tokio::test]
async fn read_after_disconnect_is_rejected() {
    let (_driver, session, _events) = connected_sensor().await;
    let handle = session
        .resolve_characteristic(&"dev".into(), BATTERY_SERVICE, BATTERY_LEVEL)
        .unwrap();
    assert_eq!(session.read(&handle).await.unwrap(), vec![64]);

    session.disconnect(&"dev".into()).await.unwrap();
    assert!(matches!(
        session.read(&handle).await,
        Err(Error::NotConnected(_))
    ));
    assert!(matches!(
        session.read_rssi(&"dev".into()).await,
        Err(Error::NotConnected(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn write_without_response_does_not_wait_for_ack() {
    let (driver, session, _events) = connected_sensor().await;
    driver.hold_write_acks(true);
    let handle = session
        .resolve_characteristic(&"dev".into(), BATTERY_SERVICE, BATTERY_LEVEL)
        .unwrap();
    let payload = rand::random::<[u8; 16]>().to_vec();

    session
        .write(&handle, &payload, WriteType::WithoutResponse)
        .await
        .unwrap();
    assert_eq!(driver.written(&"dev".into(), BATTERY_LEVEL), vec![payload]);

    let acknowledged = tokio::time::timeout(
        Duration::from_secs(1),
        session.write(&handle, &[1], WriteType::WithResponse),
    )
    .await;
    assert!(acknowledged.is_err());
}

#[tokio::test]
async fn resubscribing_does_not_leak_old_values() {
    let (driver, session, _events) = connected_sensor().await;
    let handle = session
        .resolve_characteristic(&"dev".into(), BATTERY_SERVICE, BATTERY_LEVEL)
        .unwrap();
    let id = PeripheralId::from("dev");

    let mut first = session.subscribe(&handle).await.unwrap();
    driver.notify(&id, BATTERY_SERVICE, BATTERY_LEVEL, vec![1]);
    driver.notify(&id, BATTERY_SERVICE, BATTERY_LEVEL, vec![2]);
    assert_eq!(first.next().await, Some(vec![1]));
    session.unsubscribe(&handle).await.unwrap();
    assert_eq!(first.next().await, None);

    let mut second = session.subscribe(&handle).await.unwrap();
    driver.notify(&id, BATTERY_SERVICE, BATTERY_LEVEL, vec![3]);
    assert_eq!(second.next().await, Some(vec![3]));
}

#[tokio::test]
async fn link_loss_is_an_event() {
    let (driver, session, mut events) = connected_sensor().await;
    driver.drop_link(&"dev".into());
    assert_eq!(events.disconnected.recv().await.unwrap().as_str(), "dev");
    let record = session.device(&"dev".into()).unwrap();
    assert!(!record.is_connected());
    assert!(record.services.is_empty());

    // Reconnecting rediscovers the tree.
    session.connect(&"dev".into()).await.unwrap();
    assert!(session
        .resolve_characteristic(&"dev".into(), BATTERY_SERVICE, BATTERY_LEVEL)
        .is_ok());
}

#[tokio::test]
async fn explicit_disconnect_is_not_an_event() {
    let driver = FakeDriver::new();
    driver.add_peripheral(FakePeripheral::new("dev", "Sensor").with_battery_service());
    driver.add_peripheral(FakePeripheral::new("tag", "Tag"));
    let (session, mut events) = start(&driver).await;
    discover(&session, &driver, &["dev", "tag"]).await;
    session.connect(&"dev".into()).await.unwrap();
    session.connect(&"tag".into()).await.unwrap();

    session.disconnect(&"dev".into()).await.unwrap();
    driver.drop_link(&"tag".into());
    // Events are pumped in order, so "dev" would have come first.
    assert_eq!(events.disconnected.recv().await.unwrap().as_str(), "tag");
    assert!(events.disconnected.try_recv().is_err());
}

#[tokio::test]
async fn live_link_survives_a_new_scan() {
    let (driver, session, _events) = connected_sensor().await;
    let handle = session
        .resolve_characteristic(&"dev".into(), BATTERY_SERVICE, BATTERY_LEVEL)
        .unwrap();
    let mut values = session.subscribe(&handle).await.unwrap();

    // A fresh scan forgets "dev", which stays silent while connected.
    let _results = session
        .start_scan(ScanFilter::default(), None)
        .await
        .unwrap();
    assert!(session.device(&"dev".into()).is_none());

    session
        .unsubscribe_characteristic(&"dev".into(), BATTERY_SERVICE, BATTERY_LEVEL)
        .await
        .unwrap();
    assert_eq!(values.next().await, None);
    session.disconnect(&"dev".into()).await.unwrap();
    assert_eq!(
        driver.calls().last(),
        Some(&DriverCall::Disconnect("dev".into()))
    );
    session.stop_scan().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn request_device_returns_first_match() {
    let driver = FakeDriver::new();
    driver.add_peripheral(FakePeripheral::new("other", "Lamp"));
    driver.add_peripheral(FakePeripheral::new("hr", "Polar H10").with_battery_service());
    let (session, _events) = start(&driver).await;

    let radio = driver.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        radio.advertise(&"other".into());
        radio.advertise(&"hr".into());
    });

    let filter = ScanFilter {
        services: vec![BATTERY_SERVICE],
        ..Default::default()
    };
    let record = session.request_device(filter).await.unwrap();
    assert_eq!(record.id.as_str(), "hr");
    assert_eq!(driver.calls().last(), Some(&DriverCall::StopScan));
}

#[tokio::test(start_paused = true)]
async fn request_device_gives_up() {
    let driver = FakeDriver::new();
    let (session, _events) = start(&driver).await;
    let result = session.request_device(ScanFilter::default()).await;
    assert!(matches!(result, Err(Error::NoDeviceFound(t)) if t == Duration::from_secs(30)));
    assert_eq!(driver.calls().last(), Some(&DriverCall::StopScan));
}
