//! Configuration management.
//!
//! Values arrive as a YAML document with one `server` section for the GWGJ
//! listener and a `changsui` list with one entry per polled PDU. Every field
//! has a default so a partial file is valid.

use crate::device::{DEFAULT_MANUFACTURER, DEFAULT_MODEL};
use crate::error::{PduError, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "PDUBRIDGE_CONFIG";
const CONFIG_SEARCH_PATHS: &[&str] = &["pdubridge.yaml", "/etc/pdubridge/config.yaml"];

const LOG_LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];
const CHANGSUI_OUTLET_COUNTS: &[usize] = &[8, 16, 20];
const MAX_GWGJ_OUTLETS: usize = 32;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    /// Seconds a Degraded/Lost device keeps its entities available
    pub unavailable_after_secs: u64,
    /// Directory for energy counters and the GWGJ device list; none keeps
    /// both in memory only
    #[serde(alias = "energy_state_dir")]
    pub state_dir: Option<PathBuf>,
    pub server: ServerConfig,
    pub changsui: Vec<ChangsuiConfig>,
}

/// GWGJ TCP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub listen_address: String,
    pub listen_port: u16,
    /// Outlet count for devices whose handshake does not state one
    pub num_switches: usize,
    pub request_interval_secs: u64,
    pub read_timeout_secs: u64,
    /// Consecutive decode errors before a device is marked Degraded
    pub degraded_after_errors: u32,
    pub fetch_outlet_current: bool,
    pub outlet_current_interval_secs: u64,
    pub outlet_current_port: u16,
    pub manufacturer: String,
    pub model: String,
    pub devices: HashMap<String, GwgjDeviceConfig>,
}

/// Per-device overrides keyed by the handshake id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GwgjDeviceConfig {
    pub name: Option<String>,
    pub num_switches: Option<usize>,
}

/// One HTTP-polled Changsui PDU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangsuiConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    pub outlets: usize,
    /// Registry id; defaults to the host
    pub device_id: Option<String>,
    pub pdu_name: Option<String>,
    pub show_outlet_current: bool,
    pub show_outlet_power: bool,
    pub show_current_limits: bool,
    pub show_outlet_energy: bool,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Consecutive failed polls before the device is marked Degraded
    pub degraded_after: u32,
    /// Re-login after this many seconds even without a rejection
    pub session_ttl_secs: Option<u64>,
    /// Base delay for login/command retries and login backoff
    pub retry_base_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            unavailable_after_secs: 300,
            state_dir: None,
            server: ServerConfig::default(),
            changsui: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_address: "0.0.0.0".to_string(),
            listen_port: 4600,
            num_switches: 8,
            request_interval_secs: 5,
            read_timeout_secs: 60,
            degraded_after_errors: 3,
            fetch_outlet_current: false,
            outlet_current_interval_secs: 30,
            outlet_current_port: 80,
            manufacturer: DEFAULT_MANUFACTURER.to_string(),
            model: DEFAULT_MODEL.to_string(),
            devices: HashMap::new(),
        }
    }
}

impl Default for ChangsuiConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            outlets: 16,
            device_id: None,
            pdu_name: None,
            show_outlet_current: false,
            show_outlet_power: false,
            show_current_limits: false,
            show_outlet_energy: false,
            poll_interval_secs: 30,
            request_timeout_secs: 10,
            degraded_after: 3,
            session_ttl_secs: None,
            retry_base_ms: 1000,
        }
    }
}

impl ServerConfig {
    /// Checks listener settings. Port 0 is accepted here and means "any free port".
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        if !(1..=MAX_GWGJ_OUTLETS).contains(&self.num_switches) {
            return Err(invalid("server.num_switches", "must be within 1..=32"));
        }
        if self.request_interval_secs == 0 || self.read_timeout_secs == 0 {
            return Err(invalid("server", "intervals must be positive"));
        }
        if self.degraded_after_errors == 0 {
            return Err(invalid("server.degraded_after_errors", "must be positive"));
        }
        if self.fetch_outlet_current {
            if self.outlet_current_interval_secs == 0 {
                return Err(invalid(
                    "server.outlet_current_interval_secs",
                    "must be positive when fetch_outlet_current is set",
                ));
            }
            if self.outlet_current_port == 0 {
                return Err(invalid("server.outlet_current_port", "must not be 0"));
            }
        }
        for (id, device) in &self.devices {
            if let Some(n) = device.num_switches {
                if !(1..=MAX_GWGJ_OUTLETS).contains(&n) {
                    return Err(invalid(
                        &format!("server.devices.{}.num_switches", id),
                        "must be within 1..=32",
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .listen_address
            .parse()
            .map_err(|_| invalid("server.listen_address", &self.listen_address))?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }

    /// Outlet count for a device: handshake value, then override, then default.
    pub fn outlet_count_for(&self, device_id: &str, announced: Option<usize>) -> usize {
        announced
            .filter(|n| (1..=MAX_GWGJ_OUTLETS).contains(n))
            .or_else(|| self.devices.get(device_id).and_then(|d| d.num_switches))
            .unwrap_or(self.num_switches)
    }

    pub fn name_for(&self, device_id: &str) -> String {
        self.devices
            .get(device_id)
            .and_then(|d| d.name.clone())
            .unwrap_or_else(|| format!("PDU {}", device_id))
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_secs(self.request_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn outlet_current_interval(&self) -> Duration {
        Duration::from_secs(self.outlet_current_interval_secs)
    }
}

impl ChangsuiConfig {
    pub fn new<H: Into<String>>(host: H) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn device_id(&self) -> String {
        self.device_id.clone().unwrap_or_else(|| self.host.clone())
    }

    pub fn display_name(&self) -> String {
        self.pdu_name
            .clone()
            .unwrap_or_else(|| format!("Changsui PDU {}", self.host))
    }

    /// `http://<host>` unless the host already carries a scheme.
    pub fn base_url(&self) -> String {
        let host = self.host.trim().trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{}", host)
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn session_ttl(&self) -> Option<Duration> {
        self.session_ttl_secs.map(Duration::from_secs)
    }

    /// Checks one entry on its own, as done when a PDU is added at runtime.
    pub fn validate(&self) -> Result<()> {
        self.validate_as(&format!("changsui[{}]", self.device_id()))
    }

    fn validate_as(&self, prefix: &str) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(invalid(&format!("{}.host", prefix), "must not be empty"));
        }
        if self.username.is_empty() {
            return Err(invalid(&format!("{}.username", prefix), "must not be empty"));
        }
        if !CHANGSUI_OUTLET_COUNTS.contains(&self.outlets) {
            return Err(invalid(
                &format!("{}.outlets", prefix),
                &format!("{} (expected one of {:?})", self.outlets, CHANGSUI_OUTLET_COUNTS),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(invalid(&format!("{}.poll_interval_secs", prefix), "must be positive"));
        }
        if self.request_timeout_secs == 0 {
            return Err(invalid(&format!("{}.request_timeout_secs", prefix), "must be positive"));
        }
        if self.degraded_after == 0 {
            return Err(invalid(&format!("{}.degraded_after", prefix), "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &str, msg: &str) -> PduError {
    PduError::Config(format!("{} - {}", field, msg))
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `$PDUBRIDGE_CONFIG`, then the default search paths, then defaults.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            info!("Loading configuration from {} (via {})", path, CONFIG_ENV);
            return Self::from_file(path);
        }

        for path in CONFIG_SEARCH_PATHS {
            if Path::new(path).exists() {
                info!("Loading configuration from {}", path);
                return Self::from_file(path);
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(Config::default())
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(invalid("log_level", &self.log_level));
        }
        if self.unavailable_after_secs == 0 {
            return Err(invalid("unavailable_after_secs", "must be positive"));
        }

        if self.server.enabled {
            self.server.validate()?;
            if self.server.listen_port == 0 {
                return Err(invalid("server.listen_port", "must not be 0"));
            }
        }

        let mut seen = HashSet::new();
        for (i, entry) in self.changsui.iter().enumerate() {
            entry.validate_as(&format!("changsui[{}]", i))?;
            if !seen.insert(entry.device_id()) {
                return Err(PduError::DuplicateDevice(entry.device_id()));
            }
        }
        Ok(())
    }

    pub fn unavailable_after(&self) -> Duration {
        Duration::from_secs(self.unavailable_after_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.listen_port, 4600);
        assert_eq!(config.server.num_switches, 8);
        assert_eq!(config.server.manufacturer, "Generic");
        assert!(config.changsui.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
log_level: debug
changsui:
  - host: 192.168.1.50
    outlets: 20
    show_outlet_energy: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        let pdu = &config.changsui[0];
        assert_eq!(pdu.username, "admin");
        assert_eq!(pdu.poll_interval_secs, 30);
        assert_eq!(pdu.device_id(), "192.168.1.50");
        assert_eq!(pdu.base_url(), "http://192.168.1.50");
        assert!(pdu.show_outlet_energy);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.changsui.push(ChangsuiConfig {
            outlets: 12,
            ..ChangsuiConfig::new("10.0.0.2")
        });
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.changsui.push(ChangsuiConfig::new("10.0.0.2"));
        config.changsui.push(ChangsuiConfig::new("10.0.0.2"));
        assert!(matches!(config.validate(), Err(PduError::DuplicateDevice(_))));

        let mut config = Config::default();
        config.server.listen_address = "not-an-ip".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_outlet_count_resolution() {
        let mut server = ServerConfig::default();
        server.devices.insert(
            "PDU9".to_string(),
            GwgjDeviceConfig {
                name: Some("Rack 9".to_string()),
                num_switches: Some(16),
            },
        );
        assert_eq!(server.outlet_count_for("PDU9", None), 16);
        assert_eq!(server.outlet_count_for("PDU9", Some(20)), 20);
        assert_eq!(server.outlet_count_for("other", None), 8);
        assert_eq!(server.outlet_count_for("other", Some(0)), 8);
        assert_eq!(server.name_for("PDU9"), "Rack 9");
    }

    #[test]
    fn test_zero_scrape_interval_rejected() {
        let mut config = Config::default();
        config.server.outlet_current_interval_secs = 0;
        // Unused while scraping is off
        assert!(config.validate().is_ok());

        config.server.fetch_outlet_current = true;
        assert!(matches!(config.validate(), Err(PduError::Config(_))));
        assert!(config.server.validate().is_err());

        config.server.outlet_current_interval_secs = 30;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_single_entry_validation() {
        assert!(ChangsuiConfig::new("10.0.0.4").validate().is_ok());

        let zero_interval = ChangsuiConfig {
            poll_interval_secs: 0,
            ..ChangsuiConfig::new("10.0.0.4")
        };
        let err = zero_interval.validate().unwrap_err();
        assert!(err.to_string().contains("changsui[10.0.0.4].poll_interval_secs"));

        let odd_outlets = ChangsuiConfig {
            outlets: 12,
            ..ChangsuiConfig::new("10.0.0.4")
        };
        assert!(matches!(odd_outlets.validate(), Err(PduError::Config(_))));
    }

    #[test]
    fn test_base_url_keeps_scheme() {
        let pdu = ChangsuiConfig::new("http://127.0.0.1:8080/");
        assert_eq!(pdu.base_url(), "http://127.0.0.1:8080");
    }
}
