//! Canonical device model shared by the GWGJ and Changsui families.
//! Records here are owned by the registry; everything else sees clones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MANUFACTURER: &str = "Generic";
pub const DEFAULT_MODEL: &str = "PDU";

/// Which protocol family a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Pushes text frames to our TCP listener
    Gwgj,
    /// Polled over its embedded HTTP server
    Changsui,
}

/// Lifecycle of a device as seen by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Unregistered,
    Connected,
    Degraded,
    Lost,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Whole-unit electrical snapshot. Replaced as a unit, never field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_w: f64,
    pub power_factor: Option<f64>,
    pub energy_kwh_total: Option<f64>,
    pub energy_kwh_today: Option<f64>,
}

impl Telemetry {
    pub fn new(voltage_v: f64, current_a: f64, power_w: f64) -> Self {
        Self {
            voltage_v,
            current_a,
            power_w,
            power_factor: None,
            energy_kwh_total: None,
            energy_kwh_today: None,
        }
    }
}

/// One switched receptacle. Optional readings stay `None` until a sensor reports them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outlet {
    pub index: usize,
    pub name: Option<String>,
    pub is_on: bool,
    pub power_w: Option<f64>,
    pub current_a: Option<f64>,
    pub current_min_a: Option<f64>,
    pub current_max_a: Option<f64>,
    pub energy_kwh: Option<f64>,
    pub energy_today_kwh: Option<f64>,
    pub energy_yesterday_kwh: Option<f64>,
}

impl Outlet {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            name: None,
            is_on: false,
            power_w: None,
            current_a: None,
            current_min_a: None,
            current_max_a: None,
            energy_kwh: None,
            energy_today_kwh: None,
            energy_yesterday_kwh: None,
        }
    }

    /// Applies every field present in `update`. Returns true if anything changed.
    pub fn apply(&mut self, update: &OutletUpdate) -> bool {
        let before = self.clone();
        if let Some(on) = update.is_on {
            self.is_on = on;
        }
        if let Some(name) = &update.name {
            self.name = Some(name.clone());
        }
        merge(&mut self.power_w, update.power_w);
        merge(&mut self.current_a, update.current_a);
        merge(&mut self.current_min_a, update.current_min_a);
        merge(&mut self.current_max_a, update.current_max_a);
        merge(&mut self.energy_kwh, update.energy_kwh);
        merge(&mut self.energy_today_kwh, update.energy_today_kwh);
        merge(&mut self.energy_yesterday_kwh, update.energy_yesterday_kwh);
        *self != before
    }
}

fn merge(slot: &mut Option<f64>, value: Option<f64>) {
    if value.is_some() {
        *slot = value;
    }
}

/// Partial outlet update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutletUpdate {
    pub is_on: Option<bool>,
    pub name: Option<String>,
    pub power_w: Option<f64>,
    pub current_a: Option<f64>,
    pub current_min_a: Option<f64>,
    pub current_max_a: Option<f64>,
    pub energy_kwh: Option<f64>,
    pub energy_today_kwh: Option<f64>,
    pub energy_yesterday_kwh: Option<f64>,
}

impl OutletUpdate {
    pub fn switch(is_on: bool) -> Self {
        Self {
            is_on: Some(is_on),
            ..Default::default()
        }
    }

    pub fn current(current_a: f64) -> Self {
        Self {
            current_a: Some(current_a),
            ..Default::default()
        }
    }
}

/// Descriptive metadata surfaced to the platform's device page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub configuration_url: Option<String>,
}

impl DeviceInfo {
    pub fn named<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            manufacturer: DEFAULT_MANUFACTURER.to_string(),
            model: DEFAULT_MODEL.to_string(),
            ip: None,
            port: None,
            configuration_url: None,
        }
    }
}

/// One physical PDU unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub kind: DeviceKind,
    pub outlet_count: usize,
    pub outlets: Vec<Outlet>,
    pub telemetry: Option<Telemetry>,
    pub connection_state: ConnectionState,
    pub first_seen: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub info: DeviceInfo,
}

impl Device {
    pub fn new<I: Into<String>>(
        device_id: I,
        kind: DeviceKind,
        outlet_count: usize,
        info: DeviceInfo,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
            outlet_count,
            outlets: (1..=outlet_count).map(Outlet::new).collect(),
            telemetry: None,
            connection_state: ConnectionState::Unregistered,
            first_seen: Utc::now(),
            last_seen: None,
            info,
        }
    }

    pub fn has_outlet(&self, index: usize) -> bool {
        index >= 1 && index <= self.outlet_count
    }

    pub fn outlet(&self, index: usize) -> Option<&Outlet> {
        if self.has_outlet(index) {
            self.outlets.get(index - 1)
        } else {
            None
        }
    }

    pub(crate) fn outlet_mut(&mut self, index: usize) -> Option<&mut Outlet> {
        if self.has_outlet(index) {
            self.outlets.get_mut(index - 1)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outlets_are_one_based_and_stable() {
        let device = Device::new("pdu", DeviceKind::Gwgj, 8, DeviceInfo::named("pdu"));
        assert_eq!(device.outlets.len(), 8);
        assert_eq!(device.outlet(1).map(|o| o.index), Some(1));
        assert_eq!(device.outlet(8).map(|o| o.index), Some(8));
        assert!(device.outlet(0).is_none());
        assert!(device.outlet(9).is_none());
        assert_eq!(device.connection_state, ConnectionState::Unregistered);
    }

    #[test]
    fn outlet_apply_reports_changes() {
        let mut outlet = Outlet::new(3);
        assert!(outlet.apply(&OutletUpdate::switch(true)));
        assert!(!outlet.apply(&OutletUpdate::switch(true)));
        assert!(outlet.apply(&OutletUpdate::current(0.25)));
        assert_eq!(outlet.current_a, Some(0.25));
        // Absent fields never clear existing readings
        assert!(!outlet.apply(&OutletUpdate::default()));
        assert_eq!(outlet.current_a, Some(0.25));
    }
}
