// btlesession Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! In-memory registry of the peripherals seen during the current scan/request cycle.

use crate::api::{PeripheralId, PeripheralRecord};
use dashmap::DashMap;
use log::trace;

/// Maps each peripheral id to its most recent snapshot.
///
/// Writers are the scan, connection and GATT controllers (`pub(crate)` methods); everybody else
/// reads copies through [`DeviceRegistry::get`].
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    peripherals: DashMap<PeripheralId, PeripheralRecord>,
}

impl DeviceRegistry {
    /// Creates the record for `id` if needed, applies `update` to it in place and returns the
    /// updated snapshot. The connection state is left alone unless `update` changes it.
    pub(crate) fn upsert<F>(&self, id: &PeripheralId, update: F) -> PeripheralRecord
    where
        F: FnOnce(&mut PeripheralRecord),
    {
        let mut entry = self
            .peripherals
            .entry(id.clone())
            .or_insert_with(|| PeripheralRecord::new(id.clone()));
        update(entry.value_mut());
        entry.value().clone()
    }

    /// Applies `update` only if `id` is already known.
    pub(crate) fn update<F>(&self, id: &PeripheralId, update: F) -> Option<PeripheralRecord>
    where
        F: FnOnce(&mut PeripheralRecord),
    {
        self.peripherals.get_mut(id).map(|mut entry| {
            update(entry.value_mut());
            entry.value().clone()
        })
    }

    pub(crate) fn reset(&self) {
        trace!("Clearing {} registry entries", self.peripherals.len());
        self.peripherals.clear();
    }

    pub fn get(&self, id: &PeripheralId) -> Option<PeripheralRecord> {
        self.peripherals.get(id).map(|val| val.value().clone())
    }

    pub fn contains(&self, id: &PeripheralId) -> bool {
        self.peripherals.contains_key(id)
    }

    pub fn records(&self) -> Vec<PeripheralRecord> {
        self.peripherals
            .iter()
            .map(|val| val.value().clone())
            .collect()
    }
}
