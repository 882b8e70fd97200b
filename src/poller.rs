//! Poll scheduler for HTTP-polled Changsui PDUs.
//!
//! Each PDU gets one background task that reads its full status on a fixed
//! interval. Ticks for the same device never overlap: a slow poll simply
//! delays the next one. Results are written to the registry in one atomic
//! step, so a failed tick leaves the previous snapshot untouched.

use crate::changsui::StatusSnapshot;
use crate::config::ChangsuiConfig;
use crate::device::{ConnectionState, Device, DeviceInfo, DeviceKind, OutletUpdate};
use crate::energy::EnergyTracker;
use crate::error::{PduError, Result};
use crate::registry::DeviceRegistry;
use crate::session::ChangsuiClient;
use chrono::{Local, NaiveDate, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const CHANGSUI_MANUFACTURER: &str = "Changsui";
pub const CHANGSUI_MODEL: &str = "CAN";

const MAX_INITIAL_JITTER_MS: u64 = 2000;

/// Polls one PDU and reflects the result into the registry.
pub struct ChangsuiPoller {
    client: Arc<ChangsuiClient>,
    registry: Arc<DeviceRegistry>,
    energy: Mutex<EnergyTracker>,
    // Cancelled when the device is removed from the configuration
    stop: CancellationToken,
    // Held while a result is written so `stop` cannot land halfway through
    apply_gate: Mutex<()>,
}

impl ChangsuiPoller {
    pub fn new(
        client: Arc<ChangsuiClient>,
        registry: Arc<DeviceRegistry>,
        energy: EnergyTracker,
    ) -> Self {
        Self {
            client,
            registry,
            energy: Mutex::new(energy),
            stop: CancellationToken::new(),
            apply_gate: Mutex::new(()),
        }
    }

    /// Stops the poll loop; a poll already in flight finishes but is not applied.
    ///
    /// Once this returns no further result reaches the registry.
    pub fn stop(&self) {
        let _gate = self.apply_gate.lock();
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn client(&self) -> &Arc<ChangsuiClient> {
        &self.client
    }

    fn device_info(&self) -> DeviceInfo {
        let config = self.client.config();
        DeviceInfo {
            name: config.display_name(),
            manufacturer: CHANGSUI_MANUFACTURER.to_string(),
            model: format!("{}-{}", CHANGSUI_MODEL, config.outlets),
            ip: Some(config.host.clone()),
            port: None,
            configuration_url: Some(config.base_url()),
        }
    }

    /// Runs one poll tick and records its outcome.
    pub async fn poll_once(&self) -> Result<()> {
        let result = match self.client.fetch_status().await {
            Ok(snapshot) => match self.apply(snapshot, Local::now().date_naive()) {
                Some(result) => result,
                None => {
                    debug!("Discarding poll result for removed {}", self.client.device_id());
                    return Ok(());
                }
            },
            Err(_) if self.is_stopped() => return Ok(()),
            Err(e) => Err(e),
        };
        self.persist_energy().await;

        let failures = self.client.record_poll(&result);
        if let Err(e) = &result {
            let config = self.client.config();
            let id = config.device_id();
            warn!("Poll of {} failed ({} in a row): {}", id, failures, e);
            if failures >= config.degraded_after && self.registry.contains(&id) {
                let _ = self
                    .registry
                    .set_connection_state(&id, ConnectionState::Degraded);
            }
        }
        result
    }

    /// Writes a poll result to the registry. Returns `None` once stopped.
    fn apply(&self, snapshot: StatusSnapshot, today: NaiveDate) -> Option<Result<()>> {
        let _gate = self.apply_gate.lock();
        if self.is_stopped() {
            return None;
        }
        let config = self.client.config();
        let id = config.device_id();

        if self
            .registry
            .upsert_device(&id, DeviceKind::Changsui, config.outlets, self.device_info())
        {
            debug!("Changsui PDU {} admitted on first successful poll", id);
        }

        let updates = self.outlet_updates(&snapshot, today);

        let mut telemetry = snapshot.telemetry;
        let result = self.registry.mutate(&id, |device: &mut Device| {
            if telemetry.energy_kwh_today.is_none() {
                telemetry.energy_kwh_today =
                    device.telemetry.as_ref().and_then(|t| t.energy_kwh_today);
            }
            device.telemetry = Some(telemetry);
            for (index, update) in &updates {
                if let Some(outlet) = device.outlet_mut(*index) {
                    outlet.apply(update);
                }
            }
            device.connection_state = ConnectionState::Connected;
            device.last_seen = Some(Utc::now());
            Ok(())
        });
        Some(result)
    }

    /// Flushes changed energy counters without blocking the runtime.
    async fn persist_energy(&self) {
        let pending = self.energy.lock().take_pending();
        if let Some(write) = pending {
            if let Err(e) = write.write_off_thread().await {
                warn!(
                    "Could not persist energy state for {}: {}",
                    self.client.device_id(),
                    e
                );
            }
        }
    }

    fn outlet_updates(&self, snapshot: &StatusSnapshot, today: NaiveDate) -> Vec<(usize, OutletUpdate)> {
        let mut updates: Vec<(usize, OutletUpdate)> = snapshot
            .outlets
            .iter()
            .map(|reading| (reading.index, reading.to_update()))
            .collect();

        let mut energy = self.energy.lock();
        for (pos, reading) in snapshot.outlet_energy.iter().enumerate() {
            let index = pos + 1;
            let usage = energy.update_at(index, reading.energy_kwh, today);
            let update = OutletUpdate {
                energy_kwh: Some(usage.total_kwh),
                energy_today_kwh: Some(usage.today_kwh),
                energy_yesterday_kwh: usage.yesterday_kwh,
                ..Default::default()
            };
            match updates.iter_mut().find(|(i, _)| *i == index) {
                Some((_, existing)) => {
                    existing.energy_kwh = update.energy_kwh;
                    existing.energy_today_kwh = update.energy_today_kwh;
                    existing.energy_yesterday_kwh = update.energy_yesterday_kwh;
                }
                None => updates.push((index, update)),
            }
        }
        updates
    }

    /// Poll loop; returns after [`stop`](Self::stop) or when `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let config = self.client.config().clone();
        let id = config.device_id();

        let jitter = {
            let mut rng = rand::rng();
            Duration::from_millis(rng.random_range(0..=MAX_INITIAL_JITTER_MS))
                .min(config.poll_interval())
        };
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + jitter, config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!("Starting poll task for {} every {}s", id, config.poll_interval_secs);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.stop.cancelled() => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.poll_once() => {}
            }
        }

        self.client.close();
        debug!("Poll task for {} stopped", id);
    }
}

struct PollHandle {
    poller: Arc<ChangsuiPoller>,
    task: JoinHandle<()>,
}

/// Owns the poll tasks of all configured Changsui PDUs.
pub struct PollScheduler {
    registry: Arc<DeviceRegistry>,
    pollers: Mutex<HashMap<String, PollHandle>>,
    cancel_token: CancellationToken,
    energy_dir: Option<PathBuf>,
}

impl PollScheduler {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        cancel_token: CancellationToken,
        energy_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            registry,
            pollers: Mutex::new(HashMap::new()),
            cancel_token,
            energy_dir,
        }
    }

    fn energy_tracker(dir: Option<&Path>, device_id: &str) -> EnergyTracker {
        match dir {
            Some(dir) => {
                let file: String = device_id
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                    .collect();
                EnergyTracker::with_state_file(dir.join(format!("{}.energy.json", file)))
            }
            None => EnergyTracker::new(),
        }
    }

    /// Starts polling a PDU. Fails on an invalid entry or if a poller for the same id already runs.
    pub fn add(&self, config: ChangsuiConfig) -> Result<Arc<ChangsuiPoller>> {
        config.validate()?;
        let id = config.device_id();
        let mut pollers = self.pollers.lock();
        if pollers.contains_key(&id) {
            return Err(PduError::DuplicateDevice(id));
        }

        let client = Arc::new(ChangsuiClient::new(config)?);
        let energy = Self::energy_tracker(self.energy_dir.as_deref(), &id);
        let poller = Arc::new(ChangsuiPoller::new(client, self.registry.clone(), energy));
        let task = tokio::spawn(poller.clone().run(self.cancel_token.clone()));

        info!("Polling Changsui PDU {}", id);
        pollers.insert(
            id,
            PollHandle {
                poller: poller.clone(),
                task,
            },
        );
        Ok(poller)
    }

    /// Stops polling a PDU. Returns false if it was not scheduled.
    pub fn remove(&self, device_id: &str) -> bool {
        match self.pollers.lock().remove(device_id) {
            Some(handle) => {
                handle.poller.stop();
                info!("Stopped polling {}", device_id);
                true
            }
            None => false,
        }
    }

    pub fn poller(&self, device_id: &str) -> Option<Arc<ChangsuiPoller>> {
        self.pollers.lock().get(device_id).map(|h| h.poller.clone())
    }

    pub fn client(&self, device_id: &str) -> Option<Arc<ChangsuiClient>> {
        self.poller(device_id).map(|p| p.client().clone())
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pollers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Abandons every poll task and waits for them to exit.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handles: Vec<PollHandle> = self.pollers.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.task.await;
        }
    }
}
