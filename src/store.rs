//! On-disk state shared by the energy tracker and the GWGJ device list.
//!
//! GWGJ units announce themselves, so the listener alone forgets them on
//! restart. [`DeviceStore`] keeps one record per unit in `devices.json` and
//! restores them as `Lost` until they reconnect.

use crate::device::{ConnectionState, Device, DeviceInfo, DeviceKind};
use crate::error::{PduError, Result};
use crate::registry::{DeviceRegistry, RegistryEvent};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub const DEVICES_FILE: &str = "devices.json";

/// Writes `contents` to a sibling temp file and renames it over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Serialized state waiting to be flushed.
#[derive(Debug)]
pub struct PendingWrite {
    path: PathBuf,
    contents: String,
}

impl PendingWrite {
    pub(crate) fn new(path: PathBuf, contents: String) -> Self {
        Self { path, contents }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self) -> Result<()> {
        write_atomic(&self.path, &self.contents)
    }

    /// Runs the write on the blocking pool.
    pub async fn write_off_thread(self) -> Result<()> {
        tokio::task::spawn_blocking(move || self.write())
            .await
            .map_err(|e| PduError::Io(format!("state writer failed: {}", e)))?
    }
}

/// What is kept about one GWGJ unit between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDevice {
    pub outlet_count: usize,
    pub info: DeviceInfo,
    pub first_seen: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl StoredDevice {
    fn from_device(device: &Device) -> Self {
        Self {
            outlet_count: device.outlet_count,
            info: device.info.clone(),
            first_seen: device.first_seen,
            last_seen: device.last_seen,
        }
    }

    fn same_identity(&self, other: &StoredDevice) -> bool {
        self.outlet_count == other.outlet_count && self.info == other.info
    }
}

/// Persistent list of GWGJ devices, keyed by handshake id.
#[derive(Debug)]
pub struct DeviceStore {
    path: PathBuf,
    devices: BTreeMap<String, StoredDevice>,
    dirty: bool,
}

impl DeviceStore {
    /// Opens the store at `path`. A missing or corrupt file starts empty.
    pub fn open<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let devices = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(devices) => devices,
                Err(e) => {
                    warn!("Ignoring corrupt device list {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            devices,
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, device_id: &str) -> Option<&StoredDevice> {
        self.devices.get(device_id)
    }

    /// Records a GWGJ device; other kinds are ignored.
    ///
    /// `last_seen` alone only reaches the file together with a state change.
    pub fn record(&mut self, device: &Device, state_changed: bool) {
        if device.kind != DeviceKind::Gwgj {
            return;
        }
        let entry = StoredDevice::from_device(device);
        if let Some(old) = self.devices.get(&device.device_id) {
            if *old == entry || (!state_changed && old.same_identity(&entry)) {
                return;
            }
        }
        self.devices.insert(device.device_id.clone(), entry);
        self.dirty = true;
    }

    pub fn forget(&mut self, device_id: &str) -> bool {
        let removed = self.devices.remove(device_id).is_some();
        self.dirty |= removed;
        removed
    }

    /// Admits every stored device into `registry` as `Lost`.
    pub fn preload(&self, registry: &DeviceRegistry) -> usize {
        let mut restored = 0;
        for (id, stored) in &self.devices {
            if !registry.upsert_device(id, DeviceKind::Gwgj, stored.outlet_count, stored.info.clone()) {
                continue;
            }
            let _ = registry.mutate(id, |device: &mut Device| {
                device.connection_state = ConnectionState::Lost;
                device.first_seen = stored.first_seen;
                device.last_seen = stored.last_seen;
                Ok(())
            });
            restored += 1;
        }
        if restored > 0 {
            info!("Restored {} GWGJ device(s) from {}", restored, self.path.display());
        }
        restored
    }

    pub fn apply_event(&mut self, event: &RegistryEvent) {
        match event {
            RegistryEvent::Added(device) => self.record(device, true),
            RegistryEvent::Updated { before, after } => {
                self.record(after, before.connection_state != after.connection_state)
            }
            RegistryEvent::Removed(id) => {
                self.forget(id);
            }
        }
    }

    /// Rebuilds the list from the registry after missed events.
    pub fn resync(&mut self, registry: &DeviceRegistry) {
        let live: Vec<Device> = registry
            .list_devices()
            .into_iter()
            .filter(|d| d.kind == DeviceKind::Gwgj)
            .collect();
        let before = self.devices.len();
        self.devices
            .retain(|id, _| live.iter().any(|d| &d.device_id == id));
        self.dirty |= self.devices.len() != before;
        for device in &live {
            self.record(device, true);
        }
    }

    pub fn save(&mut self) -> Result<()> {
        let contents = serde_json::to_string_pretty(&self.devices)?;
        write_atomic(&self.path, &contents)?;
        self.dirty = false;
        Ok(())
    }

    /// Serialized list if it changed since the last flush.
    pub fn take_pending(&mut self) -> Option<PendingWrite> {
        if !self.dirty {
            return None;
        }
        match serde_json::to_string_pretty(&self.devices) {
            Ok(contents) => {
                self.dirty = false;
                Some(PendingWrite::new(self.path.clone(), contents))
            }
            Err(e) => {
                warn!("Could not serialize device list: {}", e);
                None
            }
        }
    }

    /// Follows registry events until `token` is cancelled, flushing after each change.
    pub async fn run(
        mut self,
        registry: Arc<DeviceRegistry>,
        mut rx: broadcast::Receiver<RegistryEvent>,
        token: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = rx.recv() => event,
            };
            match event {
                Ok(event) => self.apply_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Device store lagged by {} events, resyncing", n);
                    self.resync(&registry);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
            if let Some(write) = self.take_pending() {
                if let Err(e) = write.write_off_thread().await {
                    warn!("Could not persist device list {}: {}", self.path.display(), e);
                }
            }
        }
        debug!("Device store for {} stopped", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gwgj(id: &str) -> Device {
        let mut device = Device::new(id, DeviceKind::Gwgj, 16, DeviceInfo::named(id));
        device.connection_state = ConnectionState::Connected;
        device.last_seen = Some(Utc::now());
        device
    }

    #[test]
    fn test_changsui_devices_are_not_stored() {
        let mut store = DeviceStore::open("/nonexistent/devices.json");
        let pdu = Device::new("10.0.0.1", DeviceKind::Changsui, 8, DeviceInfo::named("x"));
        store.record(&pdu, true);
        assert!(store.is_empty());
        assert!(store.take_pending().is_none());
    }

    #[test]
    fn test_last_seen_alone_is_not_flushed() {
        let mut store = DeviceStore::open("/nonexistent/devices.json");
        let mut device = gwgj("PDU1");
        store.record(&device, true);
        assert!(store.take_pending().is_some());

        device.last_seen = Some(Utc::now() + chrono::Duration::seconds(5));
        store.record(&device, false);
        assert!(store.take_pending().is_none());

        device.connection_state = ConnectionState::Lost;
        store.record(&device, true);
        assert!(store.take_pending().is_some());
        assert_eq!(store.get("PDU1").unwrap().last_seen, device.last_seen);
    }

    #[test]
    fn test_events_follow_registry() {
        let registry = DeviceRegistry::new();
        let mut rx = registry.subscribe();
        let mut store = DeviceStore::open("/nonexistent/devices.json");

        registry.upsert_device("PDU2", DeviceKind::Gwgj, 8, DeviceInfo::named("PDU2"));
        registry
            .set_connection_state("PDU2", ConnectionState::Connected)
            .unwrap();
        registry.remove_device("PDU2");
        registry.upsert_device("PDU3", DeviceKind::Gwgj, 8, DeviceInfo::named("PDU3"));

        while let Ok(event) = rx.try_recv() {
            store.apply_event(&event);
        }
        assert!(store.get("PDU2").is_none());
        assert_eq!(store.get("PDU3").unwrap().outlet_count, 8);
    }

    #[test]
    fn test_preload_marks_devices_lost() {
        let mut store = DeviceStore::open("/nonexistent/devices.json");
        let device = gwgj("PDU4");
        store.record(&device, true);

        let registry = DeviceRegistry::new();
        assert_eq!(store.preload(&registry), 1);
        let restored = registry.get_device("PDU4").unwrap();
        assert_eq!(restored.connection_state, ConnectionState::Lost);
        assert_eq!(restored.outlet_count, 16);
        assert_eq!(restored.first_seen, device.first_seen);
        assert_eq!(restored.last_seen, device.last_seen);

        // Already present devices are left alone
        assert_eq!(store.preload(&registry), 0);
    }
}
