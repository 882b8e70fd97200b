//! Platform-facing state synchronisation and command routing.
//!
//! [`StateSync`] turns registry change notifications into one
//! [`PlatformEvent::EntityUpdate`] per changed value, and keeps track of when
//! a silent device's entities should turn unavailable. [`CommandRouter`]
//! sends outlet commands down to whichever transport owns the device.

use crate::device::{ConnectionState, Device, DeviceInfo, DeviceKind, OutletUpdate};
use crate::error::{PduError, Result};
use crate::poller::PollScheduler;
use crate::registry::{DeviceRegistry, RegistryEvent};
use crate::server::PduServer;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 1024;
const AVAILABILITY_CHECK: Duration = Duration::from_secs(10);

// ---- Entity model ----

/// One platform entity of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKey {
    Switch(usize),
    Voltage,
    Current,
    Power,
    PowerFactor,
    Energy,
    EnergyToday,
    OutletPower(usize),
    OutletCurrent(usize),
    OutletCurrentMin(usize),
    OutletCurrentMax(usize),
    OutletEnergy(usize),
    OutletEnergyToday(usize),
    OutletEnergyYesterday(usize),
    Connection,
    Availability,
}

impl EntityKey {
    /// Stable id for the platform, e.g. `PDU01_outlet3` or `PDU01_voltage`.
    pub fn unique_id(&self, device_id: &str) -> String {
        format!("{}_{}", device_id, self)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Switch(n) => write!(f, "outlet{}", n),
            EntityKey::Voltage => write!(f, "voltage"),
            EntityKey::Current => write!(f, "current"),
            EntityKey::Power => write!(f, "power"),
            EntityKey::PowerFactor => write!(f, "power_factor"),
            EntityKey::Energy => write!(f, "energy"),
            EntityKey::EnergyToday => write!(f, "energy_today"),
            EntityKey::OutletPower(n) => write!(f, "outlet{}_power", n),
            EntityKey::OutletCurrent(n) => write!(f, "outlet{}_current", n),
            EntityKey::OutletCurrentMin(n) => write!(f, "outlet{}_current_min", n),
            EntityKey::OutletCurrentMax(n) => write!(f, "outlet{}_current_max", n),
            EntityKey::OutletEnergy(n) => write!(f, "outlet{}_energy", n),
            EntityKey::OutletEnergyToday(n) => write!(f, "outlet{}_energy_today", n),
            EntityKey::OutletEnergyYesterday(n) => write!(f, "outlet{}_energy_yesterday", n),
            EntityKey::Connection => write!(f, "connection"),
            EntityKey::Availability => write!(f, "available"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntityValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

/// Event delivered to the home-automation platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlatformEvent {
    DeviceAdded {
        device_id: String,
        kind: DeviceKind,
        info: DeviceInfo,
        entities: Vec<(EntityKey, EntityValue)>,
    },
    EntityUpdate {
        device_id: String,
        entity: EntityKey,
        value: EntityValue,
    },
    DeviceRemoved {
        device_id: String,
    },
}

impl PlatformEvent {
    pub fn device_id(&self) -> &str {
        match self {
            PlatformEvent::DeviceAdded { device_id, .. }
            | PlatformEvent::EntityUpdate { device_id, .. }
            | PlatformEvent::DeviceRemoved { device_id } => device_id,
        }
    }
}

/// Which optional per-outlet sensors a device exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityOptions {
    pub outlet_power: bool,
    pub outlet_current: bool,
    pub current_limits: bool,
    pub outlet_energy: bool,
}

impl EntityOptions {
    pub fn all() -> Self {
        Self {
            outlet_power: true,
            outlet_current: true,
            current_limits: true,
            outlet_energy: true,
        }
    }

    /// Default for devices without explicit options: currents only, once they appear.
    fn for_kind(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Gwgj => Self {
                outlet_current: true,
                ..Default::default()
            },
            DeviceKind::Changsui => Self::default(),
        }
    }
}

fn state_name(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Unregistered => "unregistered",
        ConnectionState::Connected => "connected",
        ConnectionState::Degraded => "degraded",
        ConnectionState::Lost => "lost",
    }
}

/// Every entity value a device currently exposes, availability excluded.
pub fn entity_values(device: &Device, options: &EntityOptions) -> Vec<(EntityKey, EntityValue)> {
    use EntityValue::{Bool, Number};

    let mut values = Vec::new();
    for outlet in &device.outlets {
        values.push((EntityKey::Switch(outlet.index), Bool(outlet.is_on)));
    }

    if let Some(t) = &device.telemetry {
        values.push((EntityKey::Voltage, Number(t.voltage_v)));
        values.push((EntityKey::Current, Number(t.current_a)));
        values.push((EntityKey::Power, Number(t.power_w)));
        if let Some(pf) = t.power_factor {
            values.push((EntityKey::PowerFactor, Number(pf)));
        }
        if let Some(kwh) = t.energy_kwh_total {
            values.push((EntityKey::Energy, Number(kwh)));
        }
        if let Some(kwh) = t.energy_kwh_today {
            values.push((EntityKey::EnergyToday, Number(kwh)));
        }
    }

    for outlet in &device.outlets {
        let n = outlet.index;
        let optional = [
            (options.outlet_power, EntityKey::OutletPower(n), outlet.power_w),
            (options.outlet_current, EntityKey::OutletCurrent(n), outlet.current_a),
            (options.current_limits, EntityKey::OutletCurrentMin(n), outlet.current_min_a),
            (options.current_limits, EntityKey::OutletCurrentMax(n), outlet.current_max_a),
            (options.outlet_energy, EntityKey::OutletEnergy(n), outlet.energy_kwh),
            (options.outlet_energy, EntityKey::OutletEnergyToday(n), outlet.energy_today_kwh),
            (
                options.outlet_energy,
                EntityKey::OutletEnergyYesterday(n),
                outlet.energy_yesterday_kwh,
            ),
        ];
        for (enabled, key, value) in optional {
            if let (true, Some(v)) = (enabled, value) {
                values.push((key, Number(v)));
            }
        }
    }

    values.push((
        EntityKey::Connection,
        EntityValue::Text(state_name(device.connection_state).to_string()),
    ));
    values
}

/// Values in `after` that are new or differ from `before`.
pub fn diff(
    before: &Device,
    after: &Device,
    options: &EntityOptions,
) -> Vec<(EntityKey, EntityValue)> {
    let old: HashMap<EntityKey, EntityValue> = entity_values(before, options).into_iter().collect();
    entity_values(after, options)
        .into_iter()
        .filter(|(key, value)| old.get(key) != Some(value))
        .collect()
}

/// Whether a device's entities should be shown as available at `now`.
pub fn is_available(device: &Device, now: DateTime<Utc>, unavailable_after: Duration) -> bool {
    match device.connection_state {
        ConnectionState::Connected | ConnectionState::Unregistered => true,
        ConnectionState::Degraded | ConnectionState::Lost => {
            let seen = device.last_seen.unwrap_or(device.first_seen);
            let silent = (now - seen).to_std().unwrap_or(Duration::ZERO);
            silent < unavailable_after
        }
    }
}

// ---- State synchroniser ----

pub struct StateSync {
    registry: Arc<DeviceRegistry>,
    options: RwLock<HashMap<String, EntityOptions>>,
    available: Mutex<HashMap<String, bool>>,
    unavailable_after: Duration,
    event_tx: broadcast::Sender<PlatformEvent>,
}

impl StateSync {
    pub fn new(registry: Arc<DeviceRegistry>, unavailable_after: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            options: RwLock::new(HashMap::new()),
            available: Mutex::new(HashMap::new()),
            unavailable_after,
            event_tx,
        }
    }

    /// Subscribes to the registry and spawns the sync loop.
    ///
    /// The registry subscription is taken before this returns, so no change
    /// made afterwards is missed.
    pub fn start(self: &Arc<Self>, token: CancellationToken) {
        let rx = self.registry.subscribe();
        let this = self.clone();
        tokio::spawn(async move { this.run(rx, token).await });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.event_tx.subscribe()
    }

    /// Returns a Stream of platform events. Lagging consumers skip ahead.
    pub fn stream(&self) -> impl Stream<Item = PlatformEvent> + Send + 'static {
        let mut rx = self.event_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Platform event stream lagged, skipped {} events", n);
                        continue;
                    }
                }
            }
        }
    }

    pub fn set_options(&self, device_id: &str, options: EntityOptions) {
        self.options.write().insert(device_id.to_string(), options);
    }

    pub fn clear_options(&self, device_id: &str) {
        self.options.write().remove(device_id);
    }

    fn options_for(&self, device: &Device) -> EntityOptions {
        self.options
            .read()
            .get(&device.device_id)
            .copied()
            .unwrap_or_else(|| EntityOptions::for_kind(device.kind))
    }

    /// Current entity values of a device, including availability.
    pub fn entities(&self, device_id: &str) -> Option<Vec<(EntityKey, EntityValue)>> {
        let device = self.registry.get_device(device_id)?;
        let mut values = entity_values(&device, &self.options_for(&device));
        values.push((
            EntityKey::Availability,
            EntityValue::Bool(is_available(&device, Utc::now(), self.unavailable_after)),
        ));
        Some(values)
    }

    fn publish(&self, event: PlatformEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Translates one registry event into platform events.
    pub fn handle_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Added(device) => {
                let options = self.options_for(&device);
                let mut entities = entity_values(&device, &options);
                let available = is_available(&device, Utc::now(), self.unavailable_after);
                entities.push((EntityKey::Availability, EntityValue::Bool(available)));
                self.available
                    .lock()
                    .insert(device.device_id.clone(), available);
                info!(
                    "Publishing device {} with {} entities",
                    device.device_id,
                    entities.len()
                );
                self.publish(PlatformEvent::DeviceAdded {
                    device_id: device.device_id.clone(),
                    kind: device.kind,
                    info: device.info.clone(),
                    entities,
                });
            }
            RegistryEvent::Updated { before, after } => {
                let options = self.options_for(&after);
                for (entity, value) in diff(&before, &after, &options) {
                    self.publish(PlatformEvent::EntityUpdate {
                        device_id: after.device_id.clone(),
                        entity,
                        value,
                    });
                }
                self.refresh_availability(&after, Utc::now());
            }
            RegistryEvent::Removed(device_id) => {
                self.available.lock().remove(&device_id);
                self.clear_options(&device_id);
                self.publish(PlatformEvent::DeviceRemoved { device_id });
            }
        }
    }

    fn refresh_availability(&self, device: &Device, now: DateTime<Utc>) {
        let available = is_available(device, now, self.unavailable_after);
        let previous = self
            .available
            .lock()
            .insert(device.device_id.clone(), available);
        if previous != Some(available) {
            if !available {
                warn!(
                    "Device {} unreachable for over {}s, entities unavailable",
                    device.device_id,
                    self.unavailable_after.as_secs()
                );
            }
            self.publish(PlatformEvent::EntityUpdate {
                device_id: device.device_id.clone(),
                entity: EntityKey::Availability,
                value: EntityValue::Bool(available),
            });
        }
    }

    /// Re-evaluates availability of every device as of `now`.
    pub fn check_availability_at(&self, now: DateTime<Utc>) {
        for device in self.registry.list_devices() {
            self.refresh_availability(&device, now);
        }
    }

    /// Republishes every entity of every device, used after missing events.
    fn resync(&self) {
        for device in self.registry.list_devices() {
            let options = self.options_for(&device);
            for (entity, value) in entity_values(&device, &options) {
                self.publish(PlatformEvent::EntityUpdate {
                    device_id: device.device_id.clone(),
                    entity,
                    value,
                });
            }
        }
    }

    async fn run(&self, mut rx: broadcast::Receiver<RegistryEvent>, token: CancellationToken) {
        let mut check = tokio::time::interval(AVAILABILITY_CHECK);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = check.tick() => self.check_availability_at(Utc::now()),
                res = rx.recv() => match res {
                    Ok(event) => self.handle_event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("State sync lagged behind registry by {} events, resyncing", n);
                        self.resync();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        debug!("State sync stopped");
    }
}

// ---- Command routing ----

pub struct CommandRouter {
    registry: Arc<DeviceRegistry>,
    server: Option<PduServer>,
    pollers: Arc<PollScheduler>,
}

impl CommandRouter {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        server: Option<PduServer>,
        pollers: Arc<PollScheduler>,
    ) -> Self {
        Self {
            registry,
            server,
            pollers,
        }
    }

    /// Switches one outlet on or off.
    ///
    /// An unknown device fails with `DeviceUnreachable` and changes nothing.
    /// On success the registry reflects the commanded state right away.
    pub async fn set_outlet(&self, device_id: &str, index: usize, is_on: bool) -> Result<()> {
        let device = self
            .registry
            .get_device(device_id)
            .ok_or_else(|| PduError::DeviceUnreachable(device_id.to_string()))?;
        if !device.has_outlet(index) {
            return Err(PduError::InvalidOutlet {
                device_id: device_id.to_string(),
                index,
            });
        }

        match device.kind {
            DeviceKind::Gwgj => {
                let server = self
                    .server
                    .as_ref()
                    .ok_or_else(|| PduError::DeviceUnreachable(device_id.to_string()))?;
                server.send_switch(device_id, index, is_on).await?;
            }
            DeviceKind::Changsui => {
                let client = self
                    .pollers
                    .client(device_id)
                    .ok_or_else(|| PduError::DeviceUnreachable(device_id.to_string()))?;
                client.set_outlet(index, is_on).await?;
            }
        }

        debug!(
            "Outlet {} of {} commanded {}",
            index,
            device_id,
            if is_on { "on" } else { "off" }
        );
        if let Err(e) = self
            .registry
            .update_outlet(device_id, index, &OutletUpdate::switch(is_on))
        {
            debug!("Optimistic update for {} skipped: {}", device_id, e);
        }
        Ok(())
    }

    /// Flips an outlet based on its last known state. Returns the new state.
    pub async fn toggle_outlet(&self, device_id: &str, index: usize) -> Result<bool> {
        let current = self
            .registry
            .get_device(device_id)
            .ok_or_else(|| PduError::DeviceUnreachable(device_id.to_string()))?
            .outlet(index)
            .map(|o| o.is_on)
            .ok_or_else(|| PduError::InvalidOutlet {
                device_id: device_id.to_string(),
                index,
            })?;
        self.set_outlet(device_id, index, !current).await?;
        Ok(!current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Telemetry;

    fn device() -> Device {
        Device::new("PDU01", DeviceKind::Gwgj, 4, DeviceInfo::named("rack"))
    }

    #[test]
    fn single_field_change_yields_single_update() {
        let before = device();
        let mut after = before.clone();
        after.outlets[2].is_on = true;

        let changes = diff(&before, &after, &EntityOptions::default());
        assert_eq!(changes, vec![(EntityKey::Switch(3), EntityValue::Bool(true))]);
    }

    #[test]
    fn telemetry_appears_as_new_values() {
        let before = device();
        let mut after = before.clone();
        after.telemetry = Some(Telemetry::new(220.1, 3.2, 700.0));

        let keys: Vec<EntityKey> = diff(&before, &after, &EntityOptions::default())
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(
            keys,
            vec![EntityKey::Voltage, EntityKey::Current, EntityKey::Power]
        );
    }

    #[test]
    fn optional_sensors_follow_options() {
        let mut d = device();
        d.outlets[0].power_w = Some(12.0);
        d.outlets[0].current_a = Some(0.1);

        let off = entity_values(&d, &EntityOptions::default());
        assert!(!off.iter().any(|(k, _)| matches!(k, EntityKey::OutletPower(_))));

        let on = entity_values(&d, &EntityOptions::all());
        assert!(on.contains(&(EntityKey::OutletPower(1), EntityValue::Number(12.0))));
        assert!(on.contains(&(EntityKey::OutletCurrent(1), EntityValue::Number(0.1))));
        // Values that were never read stay absent even when enabled
        assert!(!on.iter().any(|(k, _)| *k == EntityKey::OutletPower(2)));
    }

    #[test]
    fn availability_outlives_short_outages() {
        let mut d = device();
        let now = Utc::now();
        d.connection_state = ConnectionState::Lost;
        d.last_seen = Some(now - chrono::Duration::seconds(60));
        assert!(is_available(&d, now, Duration::from_secs(300)));

        d.last_seen = Some(now - chrono::Duration::seconds(301));
        assert!(!is_available(&d, now, Duration::from_secs(300)));

        d.connection_state = ConnectionState::Connected;
        assert!(is_available(&d, now, Duration::from_secs(300)));
    }

    #[test]
    fn unique_ids() {
        assert_eq!(EntityKey::Switch(3).unique_id("10.0.0.5"), "10.0.0.5_outlet3");
        assert_eq!(EntityKey::Voltage.unique_id("PDU01"), "PDU01_voltage");
        assert_eq!(
            EntityKey::OutletEnergyYesterday(2).unique_id("x"),
            "x_outlet2_energy_yesterday"
        );
    }

    #[tokio::test]
    async fn registry_changes_become_platform_events() {
        let registry = Arc::new(DeviceRegistry::new());
        let sync = StateSync::new(registry.clone(), Duration::from_secs(300));
        let mut reg_rx = registry.subscribe();
        let mut rx = sync.subscribe();

        registry.upsert_device("PDU01", DeviceKind::Gwgj, 4, DeviceInfo::named("rack"));
        registry
            .update_outlet("PDU01", 2, &OutletUpdate::switch(true))
            .unwrap();
        registry.remove_device("PDU01");

        while let Ok(event) = reg_rx.try_recv() {
            sync.handle_event(event);
        }

        match rx.try_recv().unwrap() {
            PlatformEvent::DeviceAdded { entities, .. } => {
                assert!(entities.contains(&(EntityKey::Switch(4), EntityValue::Bool(false))));
                assert!(entities.contains(&(EntityKey::Availability, EntityValue::Bool(true))));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            rx.try_recv().unwrap(),
            PlatformEvent::EntityUpdate {
                device_id: "PDU01".to_string(),
                entity: EntityKey::Switch(2),
                value: EntityValue::Bool(true),
            }
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            PlatformEvent::DeviceRemoved { .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_device_command_is_unreachable() {
        let registry = Arc::new(DeviceRegistry::new());
        let pollers = Arc::new(PollScheduler::new(
            registry.clone(),
            CancellationToken::new(),
            None,
        ));
        let router = CommandRouter::new(registry.clone(), None, pollers);
        let mut rx = registry.subscribe();

        assert!(matches!(
            router.set_outlet("ghost", 1, true).await,
            Err(PduError::DeviceUnreachable(_))
        ));
        assert!(rx.try_recv().is_err());

        registry.upsert_device("PDU01", DeviceKind::Gwgj, 4, DeviceInfo::named("rack"));
        assert!(matches!(
            router.set_outlet("PDU01", 5, true).await,
            Err(PduError::InvalidOutlet { index: 5, .. })
        ));
        // Registered but without a live connection
        assert!(matches!(
            router.set_outlet("PDU01", 1, true).await,
            Err(PduError::DeviceUnreachable(_))
        ));
    }
}
