//! Engine wiring and lifecycle.
//! Owns the registry, the GWGJ server, the Changsui pollers and the
//! platform-facing sync layer, and exposes them behind one handle.

use crate::config::{ChangsuiConfig, Config};
use crate::device::{ConnectionState, Device, DeviceKind};
use crate::error::{PduError, Result};
use crate::poller::PollScheduler;
use crate::registry::DeviceRegistry;
use crate::server::{ConnectionInfo, PduServer};
use crate::session::SessionStatus;
use crate::store::{DEVICES_FILE, DeviceStore};
use crate::sync::{CommandRouter, EntityKey, EntityOptions, EntityValue, PlatformEvent, StateSync};
use chrono::{DateTime, Utc};
use futures_core::Stream;
use log::{info, warn};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Per-device troubleshooting snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub device_id: String,
    pub kind: DeviceKind,
    pub connection_state: ConnectionState,
    pub available: bool,
    pub outlet_count: usize,
    pub has_telemetry: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub connection: Option<ConnectionInfo>,
    pub session: Option<SessionStatus>,
    pub poll_interval_secs: Option<u64>,
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: Config,
    registry: Arc<DeviceRegistry>,
    server: Option<PduServer>,
    pollers: Arc<PollScheduler>,
    sync: Arc<StateSync>,
    router: CommandRouter,
    cancel_token: CancellationToken,
}

impl Manager {
    /// Maximizes the file descriptor limit for the current process.
    ///
    /// Each GWGJ device holds one socket, so large sites can exceed the
    /// default soft limit. On non-Unix systems this does nothing.
    pub fn maximize_fd_limit() -> Result<()> {
        #[cfg(unix)]
        {
            let (soft, hard) = rlimit::getrlimit(rlimit::Resource::NOFILE)
                .map_err(|e| PduError::Io(format!("Failed to get rlimit: {}", e)))?;

            if soft < hard {
                rlimit::setrlimit(rlimit::Resource::NOFILE, hard, hard)
                    .map_err(|e| PduError::Io(format!("Failed to set rlimit: {}", e)))?;
                info!("File descriptor limit increased from {} to {}", soft, hard);
            }
        }
        Ok(())
    }

    /// Validates `config`, starts the sync layer, the listener and every poller.
    pub async fn start(config: Config) -> Result<Self> {
        config.validate()?;

        let cancel_token = CancellationToken::new();
        let registry = Arc::new(DeviceRegistry::new());
        let sync = Arc::new(StateSync::new(registry.clone(), config.unavailable_after()));
        sync.start(cancel_token.child_token());

        // Known GWGJ units are back in the registry before the listener opens
        if let (true, Some(dir)) = (config.server.enabled, &config.state_dir) {
            let store = DeviceStore::open(dir.join(DEVICES_FILE));
            store.preload(&registry);
            let rx = registry.subscribe();
            tokio::spawn(store.run(registry.clone(), rx, cancel_token.child_token()));
        }

        let server = if config.server.enabled {
            let server = PduServer::new(
                config.server.clone(),
                registry.clone(),
                cancel_token.child_token(),
            );
            server.start().await?;
            Some(server)
        } else {
            info!("GWGJ server disabled");
            None
        };

        let pollers = Arc::new(PollScheduler::new(
            registry.clone(),
            cancel_token.child_token(),
            config.state_dir.clone(),
        ));
        let router = CommandRouter::new(registry.clone(), server.clone(), pollers.clone());

        let manager = Self {
            inner: Arc::new(ManagerInner {
                config: config.clone(),
                registry,
                server,
                pollers,
                sync,
                router,
                cancel_token,
            }),
        };

        for pdu in config.changsui {
            manager.add_changsui(pdu)?;
        }

        info!("PDU engine started");
        Ok(manager)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    /// Address the GWGJ listener is bound to, if enabled.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.inner.server.as_ref().and_then(|s| s.local_addr())
    }

    /// Starts polling another Changsui PDU.
    ///
    /// The entry is validated on its own, so a PDU added at runtime gets the
    /// same checks as one loaded from the configuration file.
    pub fn add_changsui(&self, config: ChangsuiConfig) -> Result<()> {
        config.validate()?;
        let id = config.device_id();
        if self.inner.pollers.poller(&id).is_some() || self.inner.registry.contains(&id) {
            return Err(PduError::DuplicateDevice(id));
        }

        // Options must be in place before the first poll can admit the device
        self.inner.sync.set_options(
            &id,
            EntityOptions {
                outlet_power: config.show_outlet_power,
                outlet_current: config.show_outlet_current,
                current_limits: config.show_current_limits,
                outlet_energy: config.show_outlet_energy,
            },
        );
        if let Err(e) = self.inner.pollers.add(config) {
            self.inner.sync.clear_options(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Stops talking to a device and drops its record. Returns false if unknown.
    pub fn remove_device(&self, device_id: &str) -> bool {
        let polled = self.inner.pollers.remove(device_id);
        let connected = self
            .inner
            .server
            .as_ref()
            .is_some_and(|s| s.disconnect(device_id));
        let registered = self.inner.registry.remove_device(device_id).is_some();
        self.inner.sync.clear_options(device_id);
        if !(polled || connected || registered) {
            warn!("Attempted to remove unknown device {}", device_id);
        }
        polled || connected || registered
    }

    // ---- Platform surface ----

    /// Returns a Stream of entity-level events for all devices.
    pub fn events(&self) -> impl Stream<Item = PlatformEvent> + Send + 'static {
        self.inner.sync.stream()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.inner.sync.subscribe()
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.inner.registry.get_device(device_id)
    }

    pub fn devices(&self) -> Vec<Device> {
        self.inner.registry.list_devices()
    }

    pub fn entities(&self, device_id: &str) -> Option<Vec<(EntityKey, EntityValue)>> {
        self.inner.sync.entities(device_id)
    }

    pub async fn set_outlet(&self, device_id: &str, index: usize, is_on: bool) -> Result<()> {
        self.inner.router.set_outlet(device_id, index, is_on).await
    }

    pub async fn toggle_outlet(&self, device_id: &str, index: usize) -> Result<bool> {
        self.inner.router.toggle_outlet(device_id, index).await
    }

    pub fn diagnostics(&self, device_id: &str) -> Option<Diagnostics> {
        let device = self.inner.registry.get_device(device_id)?;
        let connection = self
            .inner
            .server
            .as_ref()
            .and_then(|s| s.connection_info(device_id));
        let client = self.inner.pollers.client(device_id);
        let session = client.as_ref().map(|c| c.status());

        Some(Diagnostics {
            device_id: device.device_id.clone(),
            kind: device.kind,
            connection_state: device.connection_state,
            available: crate::sync::is_available(
                &device,
                Utc::now(),
                self.inner.config.unavailable_after(),
            ),
            outlet_count: device.outlet_count,
            has_telemetry: device.telemetry.is_some(),
            first_seen: device.first_seen,
            last_seen: device.last_seen,
            connection,
            session,
            poll_interval_secs: client.map(|c| c.config().poll_interval_secs),
        })
    }

    /// Stops every task. Pending reads and requests are abandoned.
    pub async fn shutdown(&self) {
        info!("Shutting down PDU engine");
        self.inner.cancel_token.cancel();
        if let Some(server) = &self.inner.server {
            server.shutdown();
        }
        self.inner.pollers.shutdown().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel_token.is_cancelled()
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
