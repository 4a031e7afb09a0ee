// btlesession Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use super::filter::{admit, admits_services};
use crate::api::{AdapterState, Driver, PeripheralRecord, RawPeripheral, ScanFilter};
use crate::common::registry::DeviceRegistry;
use crate::config::ScanRestartPolicy;
use crate::{Error, Result};
use futures::stream::{Stream, StreamExt};
use log::{debug, info, trace, warn};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Adapter-wide scan state. The adapter state is seeded when the session initializes and then
/// follows the driver's adapter events; `scanning` follows the driver's scan start/stop events.
#[derive(Debug, Default)]
pub struct ScanState {
    adapter_state: Mutex<AdapterState>,
    scanning: AtomicBool,
}

impl ScanState {
    pub fn adapter_state(&self) -> AdapterState {
        *self.adapter_state.lock().unwrap()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Returns the previous state.
    pub(crate) fn set_adapter_state(&self, state: AdapterState) -> AdapterState {
        std::mem::replace(&mut *self.adapter_state.lock().unwrap(), state)
    }

    pub(crate) fn set_scanning(&self, scanning: bool) {
        self.scanning.store(scanning, Ordering::SeqCst);
    }
}

/// Admitted discoveries of one scan session.
///
/// The stream ends when the session stops: explicitly, through its duration elapsing, by being
/// replaced with a new scan, or because the adapter went away.
#[derive(Debug)]
pub struct ScanStream {
    session: u64,
    receiver: mpsc::UnboundedReceiver<PeripheralRecord>,
}

impl Stream for ScanStream {
    type Item = PeripheralRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[derive(Debug)]
struct ActiveScan {
    session: u64,
    filter: ScanFilter,
    sender: mpsc::UnboundedSender<PeripheralRecord>,
    timer: Option<AbortHandle>,
}

#[derive(Debug)]
pub(crate) struct ScanController<D: Driver> {
    driver: Arc<D>,
    registry: Arc<DeviceRegistry>,
    state: Arc<ScanState>,
    active: Arc<Mutex<Option<ActiveScan>>>,
    sessions: Arc<AtomicU64>,
    restart: ScanRestartPolicy,
}

impl<D: Driver> Clone for ScanController<D> {
    fn clone(&self) -> Self {
        ScanController {
            driver: self.driver.clone(),
            registry: self.registry.clone(),
            state: self.state.clone(),
            active: self.active.clone(),
            sessions: self.sessions.clone(),
            restart: self.restart,
        }
    }
}

impl<D: Driver> ScanController<D> {
    pub(crate) fn new(
        driver: Arc<D>,
        registry: Arc<DeviceRegistry>,
        state: Arc<ScanState>,
        restart: ScanRestartPolicy,
    ) -> Self {
        ScanController {
            driver,
            registry,
            state,
            active: Arc::new(Mutex::new(None)),
            sessions: Arc::new(AtomicU64::new(0)),
            restart,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    pub(crate) async fn start_scan(
        &self,
        filter: ScanFilter,
        duration: Option<Duration>,
    ) -> Result<ScanStream> {
        let adapter_state = self.state.adapter_state();
        if !adapter_state.is_powered_on() {
            return Err(Error::AdapterUnavailable(adapter_state));
        }

        if self.is_active() {
            match self.restart {
                ScanRestartPolicy::Reject => return Err(Error::AlreadyScanning),
                ScanRestartPolicy::Restart => {
                    debug!("Scan already running, restarting it with the new filter");
                    if let Err(e) = self.stop_scan().await {
                        warn!("Failed to stop the previous scan, continuing: {}", e);
                    }
                }
            }
        }

        self.registry.reset();

        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        // Installed before the driver starts so that early reports are not lost.
        *self.active.lock().unwrap() = Some(ActiveScan {
            session,
            filter: filter.clone(),
            sender,
            timer: None,
        });

        if let Err(e) = self
            .driver
            .start_scan(&filter.services, filter.allow_duplicates)
            .await
        {
            self.take_session(Some(session));
            return Err(Error::from_driver("start scan", e));
        }
        info!("Scan session {} started ({:?})", session, filter);

        if let Some(duration) = duration {
            let controller = self.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                debug!("Scan session {} reached its duration {:?}", session, duration);
                if let Some(mut active) = controller.take_session(Some(session)) {
                    // Aborting ourselves would cancel the stop below.
                    active.timer = None;
                    if let Err(e) = controller.finish(active).await {
                        warn!("Failed to stop scan session {}: {}", session, e);
                    }
                }
            });
            let mut active = self.active.lock().unwrap();
            match active.as_mut() {
                Some(active) if active.session == session => {
                    active.timer = Some(timer.abort_handle())
                }
                _ => timer.abort(),
            }
        }

        Ok(ScanStream { session, receiver })
    }

    /// Stops the running scan session, if any. Calling it without a running scan is a no-op.
    pub(crate) async fn stop_scan(&self) -> Result<()> {
        match self.take_session(None) {
            Some(active) => self.finish(active).await,
            None if self.state.is_scanning() => self
                .driver
                .stop_scan()
                .await
                .map_err(|e| Error::from_driver("stop scan", e)),
            None => Ok(()),
        }
    }

    /// Scans until the first device passing `filter` shows up, then stops scanning.
    pub(crate) async fn request_device(
        &self,
        filter: ScanFilter,
        timeout: Duration,
    ) -> Result<PeripheralRecord> {
        let mut results = self.start_scan(filter, None).await?;
        let found = tokio::time::timeout(timeout, results.next()).await;
        if let Some(active) = self.take_session(Some(results.session)) {
            if let Err(e) = self.finish(active).await {
                warn!("Failed to stop the device request scan: {}", e);
            }
        }
        match found {
            Ok(Some(record)) => {
                info!("Device request matched {}", record.id);
                Ok(record)
            }
            Ok(None) => Err(Error::OperationFailed(
                "device request scan was stopped before a match".into(),
            )),
            Err(_) => Err(Error::NoDeviceFound(timeout)),
        }
    }

    /// Runs one raw discovery report through the active session's filter.
    pub(crate) fn handle_discovery(&self, raw: RawPeripheral) {
        let active = self.active.lock().unwrap();
        let Some(active) = active.as_ref() else {
            trace!("Ignoring advertisement from {}, no scan session", raw.id);
            return;
        };

        let is_duplicate = self.registry.contains(&raw.id);
        let name = raw.advertisement.local_name.as_deref();
        if !admit(name, &active.filter, is_duplicate) {
            trace!("Filtered out advertisement from {} ({:?})", raw.id, name);
            return;
        }
        if !self.driver.filters_services()
            && !admits_services(&raw.advertisement.services, &active.filter)
        {
            trace!("Filtered out advertisement from {} by service", raw.id);
            return;
        }

        let record = self.registry.upsert(&raw.id, |r| r.apply_advertisement(&raw));
        trace!("Discovered {} in scan session {}", record.id, active.session);
        if active.sender.send(record).is_err() {
            debug!("Scan session {} has no listener left", active.session);
        }
    }

    /// Ends the active session without talking to the driver, because the adapter went away.
    pub(crate) fn abandon(&self) {
        if let Some(active) = self.take_session(None) {
            warn!("Adapter unavailable, ending scan session {}", active.session);
            if let Some(timer) = active.timer {
                timer.abort();
            }
        }
    }

    /// Detaches the active session: `Some(id)` only if it is that session, `None` for any.
    fn take_session(&self, session: Option<u64>) -> Option<ActiveScan> {
        let mut active = self.active.lock().unwrap();
        match (active.as_ref(), session) {
            (Some(current), Some(wanted)) if current.session != wanted => None,
            _ => active.take(),
        }
    }

    async fn finish(&self, active: ActiveScan) -> Result<()> {
        let ActiveScan {
            session,
            sender,
            timer,
            ..
        } = active;
        if let Some(timer) = timer {
            timer.abort();
        }
        // Dropping the sender ends the session's stream.
        drop(sender);
        info!("Stopping scan session {}", session);
        self.driver
            .stop_scan()
            .await
            .map_err(|e| Error::from_driver("stop scan", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::bleuuid::uuid_from_u16;
    use crate::fake::{advertisement, DriverCall, FakeDriver};

    fn controller(driver: &FakeDriver) -> ScanController<FakeDriver> {
        let state = Arc::new(ScanState::default());
        state.set_adapter_state(AdapterState::PoweredOn);
        ScanController::new(
            Arc::new(driver.clone()),
            Arc::new(DeviceRegistry::default()),
            state,
            ScanRestartPolicy::Restart,
        )
    }

    #[tokio::test]
    async fn deduplicates_within_a_session() {
        let driver = FakeDriver::new();
        let scan = controller(&driver);
        let mut results = scan.start_scan(ScanFilter::default(), None).await.unwrap();

        scan.handle_discovery(advertisement("a", Some("A")));
        scan.handle_discovery(advertisement("a", Some("A")));
        scan.handle_discovery(advertisement("b", None));
        scan.stop_scan().await.unwrap();

        let ids: Vec<String> = results.by_ref().map(|r| r.id.to_string()).collect().await;
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn duplicates_update_the_registry_when_allowed() {
        let driver = FakeDriver::new();
        let scan = controller(&driver);
        let filter = ScanFilter {
            allow_duplicates: true,
            ..Default::default()
        };
        let mut results = scan.start_scan(filter, None).await.unwrap();

        let mut second = advertisement("a", Some("A"));
        second.rssi = Some(-30);
        scan.handle_discovery(advertisement("a", Some("A")));
        scan.handle_discovery(second);

        assert_eq!(results.next().await.unwrap().rssi, Some(-60));
        assert_eq!(results.next().await.unwrap().rssi, Some(-30));
        assert_eq!(scan.registry.get(&"a".into()).unwrap().rssi, Some(-30));
    }

    #[tokio::test]
    async fn powered_off_adapter_fails_fast() {
        let driver = FakeDriver::new();
        let scan = controller(&driver);
        scan.state.set_adapter_state(AdapterState::PoweredOff);

        let result = scan.start_scan(ScanFilter::default(), None).await;
        assert!(matches!(
            result,
            Err(Error::AdapterUnavailable(AdapterState::PoweredOff))
        ));
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn restart_ends_previous_stream_and_resets_registry() {
        let driver = FakeDriver::new();
        let scan = controller(&driver);
        let mut first = scan.start_scan(ScanFilter::default(), None).await.unwrap();
        scan.handle_discovery(advertisement("a", Some("A")));

        let mut second = scan.start_scan(ScanFilter::default(), None).await.unwrap();
        assert_eq!(first.next().await.unwrap().id.as_str(), "a");
        assert!(first.next().await.is_none());
        assert!(!scan.registry.contains(&"a".into()));

        // Not a duplicate any more: the registry was reset with the new session.
        scan.handle_discovery(advertisement("a", Some("A")));
        assert_eq!(second.next().await.unwrap().id.as_str(), "a");
        assert_eq!(
            driver
                .calls()
                .iter()
                .filter(|c| matches!(c, DriverCall::StopScan))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn reject_policy_refuses_second_scan() {
        let driver = FakeDriver::new();
        let mut scan = controller(&driver);
        scan.restart = ScanRestartPolicy::Reject;
        let _results = scan.start_scan(ScanFilter::default(), None).await.unwrap();
        assert!(matches!(
            scan.start_scan(ScanFilter::default(), None).await,
            Err(Error::AlreadyScanning)
        ));
    }

    #[tokio::test]
    async fn stop_without_scan_is_a_no_op() {
        let driver = FakeDriver::new();
        let scan = controller(&driver);
        scan.stop_scan().await.unwrap();
        scan.stop_scan().await.unwrap();
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn service_filter_applied_when_driver_cannot() {
        let driver = FakeDriver::new();
        driver.set_filters_services(false);
        let scan = controller(&driver);
        let heart_rate = uuid_from_u16(0x180d);
        let filter = ScanFilter {
            services: vec![heart_rate],
            ..Default::default()
        };
        let mut results = scan.start_scan(filter, None).await.unwrap();

        scan.handle_discovery(advertisement("plain", Some("P")));
        let mut hr = advertisement("hr", Some("H"));
        hr.advertisement.services.push(heart_rate);
        scan.handle_discovery(hr);
        scan.stop_scan().await.unwrap();

        let ids: Vec<String> = results.by_ref().map(|r| r.id.to_string()).collect().await;
        assert_eq!(ids, vec!["hr"]);
    }

    #[tokio::test]
    async fn discoveries_without_session_are_ignored() {
        let driver = FakeDriver::new();
        let scan = controller(&driver);
        scan.handle_discovery(advertisement("a", Some("A")));
        assert!(!scan.registry.contains(&"a".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn duration_timer_only_stops_its_own_session() {
        let driver = FakeDriver::new();
        let scan = controller(&driver);
        let mut first = scan
            .start_scan(ScanFilter::default(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let mut second = scan.start_scan(ScanFilter::default(), None).await.unwrap();
        assert!(first.next().await.is_none());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(scan.is_active());
        scan.handle_discovery(advertisement("late", None));
        assert_eq!(second.next().await.unwrap().id.as_str(), "late");
    }
}
