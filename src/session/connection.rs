// btlesession Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use super::scan::ScanState;
use crate::api::{ConnectionState, Driver, PeripheralId, Service};
use crate::common::registry::DeviceRegistry;
use crate::{Error, Result};
use dashmap::{mapref::entry::Entry, DashMap, DashSet};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// An in-flight connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConnection {
    pub id: PeripheralId,
    pub deadline: Instant,
}

/// Removes the pending entry on every way out of `connect`, including the caller dropping the
/// future.
struct PendingGuard<'a> {
    pending: &'a DashMap<PeripheralId, PendingConnection>,
    registry: &'a DeviceRegistry,
    id: &'a PeripheralId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
        self.registry.update(self.id, |r| {
            if r.connection_state == ConnectionState::Connecting {
                r.mark_disconnected();
            }
        });
    }
}

#[derive(Debug)]
pub(crate) struct ConnectionController<D: Driver> {
    driver: Arc<D>,
    registry: Arc<DeviceRegistry>,
    state: Arc<ScanState>,
    pending: DashMap<PeripheralId, PendingConnection>,
    // Devices whose link loss is reported on the disconnect channel.
    watched: DashSet<PeripheralId>,
    disconnects: mpsc::UnboundedSender<PeripheralId>,
    timeout: Duration,
}

impl<D: Driver> ConnectionController<D> {
    pub(crate) fn new(
        driver: Arc<D>,
        registry: Arc<DeviceRegistry>,
        state: Arc<ScanState>,
        disconnects: mpsc::UnboundedSender<PeripheralId>,
        timeout: Duration,
    ) -> Self {
        ConnectionController {
            driver,
            registry,
            state,
            pending: DashMap::new(),
            watched: DashSet::new(),
            disconnects,
            timeout,
        }
    }

    pub(crate) fn pending(&self, id: &PeripheralId) -> Option<PendingConnection> {
        self.pending.get(id).map(|p| p.value().clone())
    }

    /// Connects to a known device and discovers its GATT tree. Resolves only once both are done.
    pub(crate) async fn connect(&self, id: &PeripheralId) -> Result<()> {
        if !self.registry.contains(id) {
            return Err(Error::DeviceNotFound(id.clone()));
        }
        if self.pending.contains_key(id) {
            return Err(Error::AlreadyConnecting(id.clone()));
        }
        let adapter_state = self.state.adapter_state();
        if !adapter_state.is_powered_on() {
            return Err(Error::AdapterUnavailable(adapter_state));
        }

        let deadline = Instant::now() + self.timeout;
        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => return Err(Error::AlreadyConnecting(id.clone())),
            Entry::Vacant(entry) => {
                entry.insert(PendingConnection {
                    id: id.clone(),
                    deadline,
                });
            }
        }
        let _pending = PendingGuard {
            pending: &self.pending,
            registry: &self.registry,
            id,
        };

        self.registry
            .update(id, |r| r.connection_state = ConnectionState::Connecting);
        self.watched.insert(id.clone());
        debug!("Connecting to {}, timeout {:?}", id, self.timeout);

        match tokio::time::timeout_at(deadline, self.establish(id)).await {
            Ok(Ok(services)) => {
                info!("Connected to {} ({} services)", id, services.len());
                self.registry.upsert(id, |r| {
                    r.services = services;
                    r.connection_state = ConnectionState::Connected;
                });
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Connecting to {} failed: {}", id, e);
                self.registry.update(id, |r| r.mark_disconnected());
                Err(e)
            }
            Err(_) => {
                warn!("Connecting to {} timed out after {:?}", id, self.timeout);
                self.cancel(id).await;
                self.registry.update(id, |r| r.mark_disconnected());
                Err(Error::ConnectionTimeout(self.timeout))
            }
        }
    }

    async fn establish(&self, id: &PeripheralId) -> Result<Vec<Service>> {
        self.driver
            .connect(id)
            .await
            .map_err(|e| Error::from_driver("connect", e))?;
        debug!("Link to {} is up, discovering services", id);
        match self.driver.discover_services(id).await {
            Ok(services) => Ok(services),
            Err(e) => {
                self.cancel(id).await;
                Err(Error::from_driver("discover services", e))
            }
        }
    }

    /// Best-effort teardown of a half-made connection.
    async fn cancel(&self, id: &PeripheralId) {
        self.watched.remove(id);
        if let Err(e) = self.driver.disconnect(id).await {
            debug!("Cancelling the connection to {} failed: {}", id, e);
        }
    }

    /// Tears the link down. Goes to the driver even when the registry no longer knows the id, a
    /// scan reset does not end live connections.
    pub(crate) async fn disconnect(&self, id: &PeripheralId) -> Result<()> {
        self.watched.remove(id);
        self.driver
            .disconnect(id)
            .await
            .map_err(|e| Error::from_driver("disconnect", e))?;
        self.registry.update(id, |r| r.mark_disconnected());
        info!("Disconnected from {}", id);
        Ok(())
    }

    /// Handles a link loss reported by the driver.
    pub(crate) fn handle_disconnected(&self, id: &PeripheralId) {
        let known = self.registry.update(id, |r| r.mark_disconnected()).is_some();
        debug!("Driver reported {} disconnected (known: {})", id, known);
        if self.watched.remove(id).is_some() && self.disconnects.send(id.clone()).is_err() {
            debug!("No listener for disconnect events");
        }
    }
}
