//! GWGJ TCP connection manager.
//!
//! Devices dial in and identify themselves with a handshake frame. Each
//! accepted socket gets its own read loop plus a writer task, and once the
//! handshake binds it to a device id the connection is published in a map so
//! outlet commands can be routed to it. A device that reconnects replaces its
//! previous connection.

use crate::config::ServerConfig;
use crate::device::{ConnectionState, Device, DeviceInfo, DeviceKind, OutletUpdate, Telemetry};
use crate::error::{PduError, Result};
use crate::protocol::{self, FrameBuffer, LOGIN_ACK, ProtocolMessage, REQ_IOSTATE, REQ_PVC};
use crate::registry::DeviceRegistry;
use crate::scraper::OutletCurrentScraper;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;

const LISTEN_BACKLOG: i32 = 128;
const READ_CHUNK: usize = 1024;
const OUTBOUND_CAPACITY: usize = 32;
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

// ---- Connection bookkeeping ----

struct Outbound {
    bytes: Vec<u8>,
    resp_tx: Option<oneshot::Sender<Result<()>>>,
}

#[derive(Debug, Default)]
struct ConnectionStats {
    frames: AtomicU64,
    decode_errors: AtomicU64,
    consecutive_errors: AtomicU32,
}

struct ConnectionHandle {
    conn_id: u64,
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    tx: mpsc::Sender<Outbound>,
    token: CancellationToken,
    stats: Arc<ConnectionStats>,
}

/// Snapshot of a live connection, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub conn_id: u64,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub frames: u64,
    pub decode_errors: u64,
}

struct ServerInner {
    config: ServerConfig,
    registry: Arc<DeviceRegistry>,
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    next_conn_id: AtomicU64,
    local_addr: Mutex<Option<SocketAddr>>,
    cancel_token: CancellationToken,
}

/// Accepts GWGJ device connections and routes commands to them.
#[derive(Clone)]
pub struct PduServer {
    inner: Arc<ServerInner>,
}

impl PduServer {
    pub fn new(
        config: ServerConfig,
        registry: Arc<DeviceRegistry>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                registry,
                connections: RwLock::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
                local_addr: Mutex::new(None),
                cancel_token,
            }),
        }
    }

    /// Binds the listener and spawns the accept loop. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        self.inner.config.validate()?;
        let addr = self.inner.config.listen_addr()?;
        let listener = bind_listener(addr)?;
        let local = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(local);
        info!("GWGJ server listening on {}", local);

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.accept_loop(listener).await });
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.inner.connections.read().contains_key(device_id)
    }

    pub fn connected_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.connections.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn connection_info(&self, device_id: &str) -> Option<ConnectionInfo> {
        self.inner
            .connections
            .read()
            .get(device_id)
            .map(|h| ConnectionInfo {
                conn_id: h.conn_id,
                peer: h.peer,
                connected_at: h.connected_at,
                frames: h.stats.frames.load(Ordering::Relaxed),
                decode_errors: h.stats.decode_errors.load(Ordering::Relaxed),
            })
    }

    /// Writes an `open`/`close` frame to the device's live connection.
    pub async fn send_switch(&self, device_id: &str, index: usize, is_on: bool) -> Result<()> {
        let tx = self
            .inner
            .connections
            .read()
            .get(device_id)
            .map(|h| h.tx.clone())
            .ok_or_else(|| PduError::DeviceUnreachable(device_id.to_string()))?;

        let frame = protocol::encode_switch(index, is_on).map_err(|_| PduError::InvalidOutlet {
            device_id: device_id.to_string(),
            index,
        })?;

        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(Outbound {
            bytes: frame,
            resp_tx: Some(resp_tx),
        })
        .await
        .map_err(|_| PduError::DeviceUnreachable(device_id.to_string()))?;

        match timeout(WRITE_TIMEOUT, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PduError::DeviceUnreachable(device_id.to_string())),
            Err(_) => Err(PduError::Timeout),
        }
    }

    /// Closes the device's connection, if any. The registry entry is left alone.
    pub fn disconnect(&self, device_id: &str) -> bool {
        match self.inner.connections.write().remove(device_id) {
            Some(handle) => {
                handle.token.cancel();
                info!("Closed connection of {} ({})", device_id, handle.peer);
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
        let handles: Vec<ConnectionHandle> =
            self.inner.connections.write().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.token.cancel();
        }
    }
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into())?)
}

impl ServerInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    debug!("GWGJ accept loop stopped");
                    break;
                }
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                        info!("New GWGJ connection #{} from {}", conn_id, peer);
                        let inner = self.clone();
                        tokio::spawn(async move {
                            Connection::run(inner, stream, peer, conn_id).await;
                        });
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    /// Publishes a bound connection, closing any older one for the same device.
    fn bind(&self, device_id: &str, handle: ConnectionHandle) {
        let old = self
            .connections
            .write()
            .insert(device_id.to_string(), handle);
        if let Some(old) = old {
            info!(
                "Device {} reconnected, closing previous connection #{} from {}",
                device_id, old.conn_id, old.peer
            );
            old.token.cancel();
        }
    }

    /// Drops the map entry only if it still belongs to `conn_id`.
    fn unbind(&self, device_id: &str, conn_id: u64) -> bool {
        let mut connections = self.connections.write();
        if connections.get(device_id).is_some_and(|h| h.conn_id == conn_id) {
            connections.remove(device_id);
            true
        } else {
            false
        }
    }
}

// ---- Per-connection task ----

struct Connection {
    inner: Arc<ServerInner>,
    peer: SocketAddr,
    conn_id: u64,
    device_id: Option<String>,
    tx: mpsc::Sender<Outbound>,
    token: CancellationToken,
    stats: Arc<ConnectionStats>,
}

impl Connection {
    async fn run(inner: Arc<ServerInner>, stream: TcpStream, peer: SocketAddr, conn_id: u64) {
        let (mut read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let token = inner.cancel_token.child_token();

        tokio::spawn(writer_task(write_half, rx, token.clone(), peer));

        let mut conn = Connection {
            inner,
            peer,
            conn_id,
            device_id: None,
            tx,
            token,
            stats: Arc::new(ConnectionStats::default()),
        };

        let read_timeout = conn.inner.config.read_timeout();
        let period = conn.inner.config.request_interval();
        let mut requests = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        requests.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut buffer = FrameBuffer::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            tokio::select! {
                _ = conn.token.cancelled() => break,
                _ = requests.tick(), if conn.device_id.is_some() => {
                    conn.send_requests().await;
                }
                res = timeout(read_timeout, read_half.read(&mut chunk)) => match res {
                    Err(_) => {
                        debug!(
                            "No data from {} for {}s, still waiting",
                            conn.label(),
                            read_timeout.as_secs()
                        );
                    }
                    Ok(Ok(0)) => {
                        info!("Connection {} closed by peer", conn.label());
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!("Read error on {}: {}", conn.label(), e);
                        break;
                    }
                    Ok(Ok(n)) => {
                        buffer.extend(&chunk[..n]);
                        if let Err(e) = conn.process(buffer.drain_messages(), &chunk[..n]).await {
                            error!("Dropping connection {}: {}", conn.label(), e);
                            break;
                        }
                    }
                }
            }
        }

        conn.close();
    }

    fn label(&self) -> String {
        match &self.device_id {
            Some(id) => format!("{} ({})", id, self.peer),
            None => format!("#{} ({})", self.conn_id, self.peer),
        }
    }

    /// Handles decoded messages; an error here closes the connection.
    async fn process(&mut self, messages: Vec<Result<ProtocolMessage>>, raw: &[u8]) -> Result<()> {
        for message in messages {
            match message {
                Ok(msg) => {
                    self.stats.frames.fetch_add(1, Ordering::Relaxed);
                    self.handle(msg).await?;
                }
                Err(e) => self.on_decode_error(e, raw),
            }
        }
        Ok(())
    }

    async fn handle(&mut self, msg: ProtocolMessage) -> Result<()> {
        if let ProtocolMessage::Handshake {
            device_id,
            outlet_count,
        } = msg
        {
            return self.on_handshake(device_id, outlet_count).await;
        }

        let Some(device_id) = self.device_id.clone() else {
            return Err(PduError::ProtocolViolation(format!(
                "expected handshake, got {:?}",
                msg
            )));
        };

        let registry = &self.inner.registry;
        let states = msg.outlet_states(MAX_MASK_OUTLETS);
        let result = match msg {
            ProtocolMessage::Telemetry {
                voltage_v,
                current_a,
                power_w,
                outlet_currents,
            } => registry.mutate(&device_id, |device: &mut Device| {
                device.telemetry = Some(Telemetry::new(voltage_v, current_a, power_w));
                for (index, amps) in &outlet_currents {
                    if let Some(outlet) = device.outlet_mut(*index) {
                        outlet.apply(&OutletUpdate::current(*amps));
                    }
                }
                mark_alive(device);
                Ok(())
            }),
            ProtocolMessage::OutletState { .. } => registry.mutate(&device_id, |device: &mut Device| {
                for (index, is_on) in states {
                    if let Some(outlet) = device.outlet_mut(index) {
                        outlet.apply(&OutletUpdate::switch(is_on));
                    }
                }
                mark_alive(device);
                Ok(())
            }),
            ProtocolMessage::CommandAck { index, is_on } => {
                debug!("Device {} confirmed outlet {} -> {}", device_id, index, is_on);
                registry.mutate(&device_id, |device: &mut Device| {
                    let outlet = device.outlet_mut(index).ok_or_else(|| PduError::InvalidOutlet {
                        device_id: device_id.clone(),
                        index,
                    })?;
                    outlet.apply(&OutletUpdate::switch(is_on));
                    mark_alive(device);
                    Ok(())
                })
            }
            ProtocolMessage::Handshake { .. } => Ok(()),
        };

        match result {
            Ok(()) => {
                self.stats.consecutive_errors.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(e @ PduError::InvalidOutlet { .. }) => {
                warn!("Ignoring message from {}: {}", self.label(), e);
                Ok(())
            }
            Err(PduError::DeviceNotFound(_)) => {
                // Removed while connected
                Err(PduError::ProtocolViolation(format!(
                    "device {} is no longer registered",
                    device_id
                )))
            }
            Err(e) => Err(e),
        }
    }

    async fn on_handshake(&mut self, device_id: String, announced: Option<usize>) -> Result<()> {
        if device_id.is_empty() {
            return Err(PduError::ProtocolViolation("handshake with empty id".into()));
        }
        if let Some(current) = &self.device_id {
            if *current != device_id {
                return Err(PduError::ProtocolViolation(format!(
                    "connection bound to {} announced itself as {}",
                    current, device_id
                )));
            }
            debug!("Repeated handshake from {}", self.label());
            self.stats.consecutive_errors.store(0, Ordering::Relaxed);
            self.send(LOGIN_ACK.to_vec()).await;
            return Ok(());
        }

        let config = &self.inner.config;
        let outlet_count = config.outlet_count_for(&device_id, announced);
        let ip = self.peer.ip().to_string();
        let info = DeviceInfo {
            name: config.name_for(&device_id),
            manufacturer: config.manufacturer.clone(),
            model: config.model.clone(),
            ip: Some(ip.clone()),
            port: Some(self.peer.port()),
            configuration_url: Some(format!("http://{}", ip)),
        };

        let registry = &self.inner.registry;
        registry.upsert_device(&device_id, DeviceKind::Gwgj, outlet_count, info);
        self.inner.bind(
            &device_id,
            ConnectionHandle {
                conn_id: self.conn_id,
                peer: self.peer,
                connected_at: Utc::now(),
                tx: self.tx.clone(),
                token: self.token.clone(),
                stats: self.stats.clone(),
            },
        );
        registry.set_connection_state(&device_id, ConnectionState::Connected)?;
        // Junk that arrived before the handshake does not count toward Degraded
        self.stats.consecutive_errors.store(0, Ordering::Relaxed);
        self.device_id = Some(device_id.clone());
        info!("Device {} logged in from {} ({} outlets)", device_id, self.peer, outlet_count);

        self.send(LOGIN_ACK.to_vec()).await;
        self.send_requests().await;

        if config.fetch_outlet_current {
            match OutletCurrentScraper::new(&ip, config.outlet_current_port) {
                Ok(scraper) => {
                    tokio::spawn(scrape_task(
                        scraper,
                        registry.clone(),
                        device_id,
                        config.outlet_current_interval(),
                        self.token.clone(),
                    ));
                }
                Err(e) => warn!("Outlet current scraping disabled for {}: {}", device_id, e),
            }
        }
        Ok(())
    }

    fn on_decode_error(&self, e: PduError, raw: &[u8]) {
        self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.stats.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        warn!("Decode error from {}: {}", self.label(), e);
        debug!("Raw chunk from {}: {}", self.peer, hex::encode(raw));

        if let Some(id) = &self.device_id {
            if consecutive >= self.inner.config.degraded_after_errors {
                let _ = self
                    .inner
                    .registry
                    .set_connection_state(id, ConnectionState::Degraded);
            }
        }
    }

    async fn send(&self, bytes: Vec<u8>) {
        let msg = Outbound {
            bytes,
            resp_tx: None,
        };
        if self.tx.send(msg).await.is_err() {
            debug!("Writer for {} already gone", self.label());
        }
    }

    async fn send_requests(&self) {
        self.send(protocol::encode_frame(REQ_IOSTATE)).await;
        self.send(protocol::encode_frame(REQ_PVC)).await;
    }

    fn close(&self) {
        self.token.cancel();
        if let Some(id) = &self.device_id {
            if self.inner.unbind(id, self.conn_id) {
                let _ = self
                    .inner
                    .registry
                    .set_connection_state(id, ConnectionState::Lost);
                info!("Device {} disconnected", id);
            }
        }
        debug!("Connection #{} from {} finished", self.conn_id, self.peer);
    }
}

/// Outlets addressable by the `io8` mask.
const MAX_MASK_OUTLETS: usize = 32;

fn mark_alive(device: &mut Device) {
    device.connection_state = ConnectionState::Connected;
    device.last_seen = Some(Utc::now());
}

async fn writer_task(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outbound>,
    token: CancellationToken,
    peer: SocketAddr,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                let result = match timeout(WRITE_TIMEOUT, write_half.write_all(&msg.bytes)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(PduError::from(e)),
                    Err(_) => Err(PduError::Timeout),
                };
                let failed = result.is_err();
                if let Err(e) = &result {
                    warn!("Write to {} failed: {}", peer, e);
                }
                if let Some(resp_tx) = msg.resp_tx {
                    let _ = resp_tx.send(result);
                }
                if failed {
                    token.cancel();
                    break;
                }
            }
        }
    }
    let _ = write_half.shutdown().await;
}

async fn scrape_task(
    scraper: OutletCurrentScraper,
    registry: Arc<DeviceRegistry>,
    device_id: String,
    period: Duration,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("Scraping outlet currents of {} from {}", device_id, scraper.url());

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        let readings = tokio::select! {
            _ = token.cancelled() => break,
            res = scraper.fetch() => res,
        };
        match readings {
            Ok(readings) => {
                let updates: Vec<(usize, OutletUpdate)> = readings
                    .into_iter()
                    .map(|(index, amps)| (index, OutletUpdate::current(amps)))
                    .collect();
                if let Err(e) = registry.update_outlets(&device_id, &updates) {
                    debug!("Dropping scraped currents for {}: {}", device_id, e);
                }
            }
            Err(e) => debug!("Outlet current scrape of {} failed: {}", device_id, e),
        }
    }
    debug!("Outlet current scraper for {} stopped", device_id);
}
