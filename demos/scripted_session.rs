// Drives a BleClient against the scripted fake radio: scan, connect, read, notify, disconnect.
//
// Run with `RUST_LOG=btlesession=debug` to follow what the session does.

use btlesession::facade::{BleClient, RequestBleDeviceOptions};
use btlesession::fake::{FakeDriver, FakePeripheral, BATTERY_LEVEL, BATTERY_SERVICE};
use btlesession::SessionConfig;
use futures::stream::StreamExt;
use std::time::Duration;
use tokio::time;

const DEVICE_ID: &str = "C4:7C:8D:6A:2B:11";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let radio = FakeDriver::new();
    radio.add_peripheral(
        FakePeripheral::new(DEVICE_ID, "Thermo Sensor")
            .with_address(DEVICE_ID.parse()?)
            .with_rssi(-52)
            .with_battery_service()
            .with_value(BATTERY_LEVEL, vec![87]),
    );
    radio.add_peripheral(FakePeripheral::new("lamp", "Desk Lamp"));

    let client = BleClient::new(
        radio.clone(),
        SessionConfig::new().connect_timeout(Duration::from_secs(5)),
    );
    client.initialize().await?;
    println!("adapter enabled: {}", client.is_enabled()?);

    let mut results = client.scan_results();
    client
        .request_le_scan(RequestBleDeviceOptions {
            services: vec!["180f".into()],
            duration_ms: Some(2000),
            ..Default::default()
        })
        .await?;
    // Both advertise, only the battery powered one passes the scan filter.
    let advertiser = radio.clone();
    tokio::spawn(async move {
        for _ in 0..3 {
            advertiser.advertise(&"lamp".into());
            advertiser.advertise(&DEVICE_ID.into());
            time::sleep(Duration::from_millis(300)).await;
        }
    });
    let first = results.next().await.expect("scan results channel closed");
    println!(
        "found {} ({:?}) rssi {:?}",
        first.device.device_id, first.local_name, first.rssi
    );
    client.stop_le_scan().await?;

    client.connect(DEVICE_ID).await?;
    for service in client.get_services(DEVICE_ID)? {
        println!("service {}", service.uuid);
        for characteristic in &service.characteristics {
            println!("  characteristic {}", characteristic);
        }
    }
    let level = client.read(DEVICE_ID, "180f", "2a19").await?;
    println!("battery level: {}%", level[0]);
    println!("rssi: {}", client.read_rssi(DEVICE_ID).await?);

    let mut notifications = client.notifications(DEVICE_ID, "180f", "2a19")?;
    client.start_notifications(DEVICE_ID, "180f", "2a19").await?;
    for level in [86u8, 85, 84] {
        radio.notify(&DEVICE_ID.into(), BATTERY_SERVICE, BATTERY_LEVEL, vec![level]);
    }
    for _ in 0..3 {
        if let Some(notification) = notifications.next().await {
            println!("battery level changed: {}%", notification.value[0]);
        }
    }
    client.stop_notifications(DEVICE_ID, "180f", "2a19").await?;

    client.disconnect(DEVICE_ID).await?;
    println!("disconnected, {} devices known", client.get_devices()?.len());
    Ok(())
}
