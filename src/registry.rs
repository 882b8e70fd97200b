//! In-memory device registry, the single source of truth for device state.
//!
//! The outer map lock is only held long enough to find a device's slot; all
//! mutations then run under that device's own lock, so writers for different
//! devices never wait on each other and a reader never sees a half-applied
//! update. Every effective mutation is published as a [`RegistryEvent`].

use crate::device::{ConnectionState, Device, DeviceInfo, DeviceKind, OutletUpdate, Telemetry};
use crate::error::{PduError, Result};
use chrono::Utc;
use futures_core::Stream;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Change notification emitted after each mutation.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added(Device),
    Updated { before: Device, after: Device },
    Removed(String),
}

impl RegistryEvent {
    pub fn device_id(&self) -> &str {
        match self {
            RegistryEvent::Added(d) => &d.device_id,
            RegistryEvent::Updated { after, .. } => &after.device_id,
            RegistryEvent::Removed(id) => id,
        }
    }
}

struct Slot {
    device: Device,
    removed: bool,
}

pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<Mutex<Slot>>>>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            devices: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Returns a Stream of registry events. Lagging consumers skip ahead.
    pub fn stream(&self) -> impl Stream<Item = RegistryEvent> + Send + 'static {
        let mut rx = self.event_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Registry stream lagged, skipped {} events", n);
                        continue;
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Admits a device or refreshes the metadata of a known one.
    ///
    /// Returns true when the device was created. The outlet layout of an
    /// existing device is never changed.
    pub fn upsert_device(
        &self,
        device_id: &str,
        kind: DeviceKind,
        outlet_count: usize,
        info: DeviceInfo,
    ) -> bool {
        if let Some(slot) = self.slot(device_id) {
            let mut guard = slot.lock();
            if !guard.removed {
                if guard.device.outlet_count != outlet_count {
                    warn!(
                        "Device {} re-announced with {} outlets, keeping {}",
                        device_id, outlet_count, guard.device.outlet_count
                    );
                }
                let before = guard.device.clone();
                guard.device.info = info;
                self.publish_if_changed(before, &guard.device);
                return false;
            }
        }

        let mut devices = self.devices.write();
        // Another writer may have won the race while we waited for the lock.
        if let Some(existing) = devices.get(device_id) {
            if !existing.lock().removed {
                return false;
            }
        }

        let device = Device::new(device_id, kind, outlet_count, info);
        devices.insert(
            device_id.to_string(),
            Arc::new(Mutex::new(Slot {
                device: device.clone(),
                removed: false,
            })),
        );
        info!(
            "Device {} registered ({:?}, {} outlets)",
            device_id, kind, outlet_count
        );
        let _ = self.event_tx.send(RegistryEvent::Added(device));
        true
    }

    pub fn remove_device(&self, device_id: &str) -> Option<Device> {
        let slot = self.devices.write().remove(device_id)?;
        let mut guard = slot.lock();
        guard.removed = true;
        info!("Device {} removed from registry", device_id);
        let _ = self
            .event_tx
            .send(RegistryEvent::Removed(device_id.to_string()));
        Some(guard.device.clone())
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Replaces the telemetry snapshot as a whole.
    pub fn update_telemetry(&self, device_id: &str, telemetry: Telemetry) -> Result<()> {
        self.mutate(device_id, |device| {
            device.telemetry = Some(telemetry);
            device.last_seen = Some(Utc::now());
            Ok(())
        })
    }

    /// Applies a partial update to one outlet. Returns true if it changed.
    pub fn update_outlet(&self, device_id: &str, index: usize, update: &OutletUpdate) -> Result<bool> {
        let mut changed = false;
        self.mutate(device_id, |device| {
            let outlet = device
                .outlet_mut(index)
                .ok_or_else(|| PduError::InvalidOutlet {
                    device_id: device_id.to_string(),
                    index,
                })?;
            changed = outlet.apply(update);
            device.last_seen = Some(Utc::now());
            Ok(())
        })?;
        Ok(changed)
    }

    /// Applies several outlet updates in one atomic step. Unknown indices are skipped.
    pub fn update_outlets(&self, device_id: &str, updates: &[(usize, OutletUpdate)]) -> Result<()> {
        self.mutate(device_id, |device| {
            for (index, update) in updates {
                match device.outlet_mut(*index) {
                    Some(outlet) => {
                        outlet.apply(update);
                    }
                    None => debug!("Ignoring update for outlet {} of {}", index, device_id),
                }
            }
            device.last_seen = Some(Utc::now());
            Ok(())
        })
    }

    pub fn set_connection_state(&self, device_id: &str, state: ConnectionState) -> Result<()> {
        self.mutate(device_id, |device| {
            if device.connection_state == state {
                return Ok(());
            }
            debug!(
                "Device {} state {:?} -> {:?}",
                device_id, device.connection_state, state
            );
            device.connection_state = state;
            if state == ConnectionState::Connected {
                device.last_seen = Some(Utc::now());
            }
            Ok(())
        })
    }

    /// Runs `f` against the device under its lock and publishes the result.
    ///
    /// If `f` fails, the device is left exactly as it was.
    pub(crate) fn mutate<F>(&self, device_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Device) -> Result<()>,
    {
        let slot = self
            .slot(device_id)
            .ok_or_else(|| PduError::DeviceNotFound(device_id.to_string()))?;
        let mut guard = slot.lock();
        if guard.removed {
            return Err(PduError::DeviceNotFound(device_id.to_string()));
        }

        let before = guard.device.clone();
        let mut working = guard.device.clone();
        f(&mut working)?;
        guard.device = working;
        self.publish_if_changed(before, &guard.device);
        Ok(())
    }

    fn publish_if_changed(&self, before: Device, after: &Device) {
        if before != *after {
            let _ = self.event_tx.send(RegistryEvent::Updated {
                before,
                after: after.clone(),
            });
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    fn slot(&self, device_id: &str) -> Option<Arc<Mutex<Slot>>> {
        self.devices.read().get(device_id).cloned()
    }

    pub fn get_device(&self, device_id: &str) -> Option<Device> {
        let slot = self.slot(device_id)?;
        let guard = slot.lock();
        if guard.removed {
            None
        } else {
            Some(guard.device.clone())
        }
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.get_device(device_id).is_some()
    }

    pub fn list_devices(&self) -> Vec<Device> {
        let slots: Vec<_> = self.devices.read().values().cloned().collect();
        let mut devices: Vec<Device> = slots
            .iter()
            .filter_map(|slot| {
                let guard = slot.lock();
                (!guard.removed).then(|| guard.device.clone())
            })
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }
}
