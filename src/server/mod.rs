//! TCP front end: one thread per connection speaking newline-delimited JSON.
//!
//! Each connection gets a writer thread fed by a bounded queue. Direct replies
//! wait for queue space (back-pressure lands on that connection only); viewer
//! broadcasts are dropped when the queue is full.
//!
//! Peers are screened at accept: an origin outside the allow-list, or one that
//! already holds `max_connections_per_origin` open connections, is closed
//! before any thread or buffer is spent on it.

use anyhow::{anyhow, Result};
use std::collections::{BTreeSet, HashMap};
use std::io::{BufReader, ErrorKind};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use zeroize::Zeroize;

use crate::config::HubConfig;
use crate::error::{AdmissionError, IngestError};
use crate::hub::{ConnectionId, VIEWERS_TOPIC};
use crate::pipeline::{generate_device_id, MotionHub};
use crate::protocol::{
    decode_frame_data, max_line_bytes, write_message, ClientMessage, LineRead, LineReader,
    ServerMessage,
};
use crate::registry::metadata_from_json;
use crate::{lock, now_ms, DeviceId};

const READ_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    /// Outbound messages buffered per connection.
    pub queue_depth: usize,
    /// Open connections allowed from one peer address.
    pub max_connections_per_origin: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            queue_depth: 64,
            max_connections_per_origin: 5,
        }
    }
}

impl From<&HubConfig> for ServerConfig {
    fn from(cfg: &HubConfig) -> Self {
        Self {
            addr: cfg.listen_addr.clone(),
            queue_depth: cfg.viewer_queue_depth,
            max_connections_per_origin: cfg.admission.max_connections_per_ip,
        }
    }
}

type OpenCounts = Arc<Mutex<HashMap<IpAddr, usize>>>;

/// Counts open connections per peer address.
#[derive(Clone)]
pub struct ConnectionLimiter {
    max_per_origin: usize,
    open: OpenCounts,
}

/// One open connection slot. Released on drop.
pub struct ConnectionPermit {
    origin: IpAddr,
    open: OpenCounts,
}

impl ConnectionLimiter {
    pub fn new(max_per_origin: usize) -> Self {
        Self {
            max_per_origin: max_per_origin.max(1),
            open: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn try_acquire(&self, origin: IpAddr) -> Option<ConnectionPermit> {
        let mut open = lock(&self.open);
        let count = open.entry(origin).or_insert(0);
        if *count >= self.max_per_origin {
            return None;
        }
        *count += 1;
        Some(ConnectionPermit {
            origin,
            open: self.open.clone(),
        })
    }

    pub fn open_from(&self, origin: IpAddr) -> usize {
        lock(&self.open).get(&origin).copied().unwrap_or(0)
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let mut open = lock(&self.open);
        if let Some(count) = open.get_mut(&self.origin) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                open.remove(&self.origin);
            }
        }
    }
}

/// Accept-side screening of a new peer.
pub fn admit_peer(
    hub: &MotionHub,
    limiter: &ConnectionLimiter,
    peer: IpAddr,
) -> Result<ConnectionPermit, AdmissionError> {
    let origin = normalize_origin(peer);
    if !hub.registry().admits_origin(&origin.to_string()) {
        return Err(AdmissionError::UnauthorizedOrigin);
    }
    limiter
        .try_acquire(origin)
        .ok_or(AdmissionError::TooManyConnections)
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting, close every connection (running its teardown) and wait.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("hub server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct HubServer {
    cfg: ServerConfig,
    hub: Arc<MotionHub>,
}

impl HubServer {
    pub fn new(cfg: ServerConfig, hub: Arc<MotionHub>) -> Self {
        Self { cfg, hub }
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg.clone();
        let hub = self.hub.clone();
        let join = std::thread::Builder::new()
            .name("hub-accept".into())
            .spawn(move || {
                if let Err(err) = run_server(listener, cfg, hub, shutdown_thread) {
                    log::error!("hub server stopped: {}", err);
                }
            })?;
        log::info!("motion hub listening on {}", addr);

        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_server(
    listener: TcpListener,
    cfg: ServerConfig,
    hub: Arc<MotionHub>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let limiter = ConnectionLimiter::new(cfg.max_connections_per_origin);
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    let result = loop {
        if shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                connections.retain(|handle| !handle.is_finished());
                let permit = match admit_peer(&hub, &limiter, peer.ip()) {
                    Ok(permit) => permit,
                    Err(err) => {
                        log::warn!("connection from {} refused: {}", peer, err.code());
                        let _ = stream.shutdown(Shutdown::Both);
                        continue;
                    }
                };
                let hub = hub.clone();
                let cfg = cfg.clone();
                let shutdown = shutdown.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("hub-conn-{}", peer))
                    .spawn(move || {
                        let _permit = permit;
                        if let Err(err) = serve_connection(stream, peer, &cfg, hub, &shutdown) {
                            log::warn!("connection {} ended with error: {}", peer, err);
                        }
                    });
                match spawned {
                    Ok(handle) => connections.push(handle),
                    Err(err) => log::error!("no thread for connection {}: {}", peer, err),
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => break Err(err.into()),
        }
    };
    shutdown.store(true, Ordering::SeqCst);
    for handle in connections {
        let _ = handle.join();
    }
    result
}

/// Peer address as used for origin admission. IPv4-mapped IPv6 peers are
/// reported in dotted IPv4 form so prefix rules like `192.168.` apply.
pub fn normalize_origin(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    cfg: &ServerConfig,
    hub: Arc<MotionHub>,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    let origin_ip = normalize_origin(peer.ip());
    log::info!("connection from {}", peer);

    let conn_id = hub.hub().next_connection_id();
    let (tx, rx) = mpsc::sync_channel::<Arc<ServerMessage>>(cfg.queue_depth.max(1));
    let writer_stream = stream.try_clone()?;
    let writer = std::thread::Builder::new()
        .name(format!("hub-writer-{}", conn_id))
        .spawn(move || write_loop(writer_stream, rx))?;
    hub.hub().attach(conn_id, tx.clone());

    let limit = max_line_bytes(hub.max_frame_bytes());
    {
        let mut conn = Connection {
            id: conn_id,
            origin: origin_ip.to_string(),
            loopback: origin_ip.is_loopback(),
            hub,
            tx,
            devices: BTreeSet::new(),
        };
        conn.reply(ServerMessage::ConnectionResponse {
            status: "connected".to_string(),
            server_time_ms: now_ms(),
            message: "Connected to motion hub".to_string(),
        });

        let mut reader = LineReader::new(BufReader::new(stream.try_clone()?), limit);
        while !shutdown.load(Ordering::SeqCst) {
            match reader.read_line() {
                Ok(LineRead::Line(line)) => conn.handle_line(&line),
                Ok(LineRead::TooLong(size)) => {
                    conn.hub.note_rejected();
                    log::debug!("connection {} sent an oversized line ({} bytes)", peer, size);
                    conn.reply(ServerMessage::Error {
                        reason: IngestError::TooLarge { size, limit }.code().to_string(),
                    });
                }
                Ok(LineRead::Eof) => break,
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue
                }
                Err(err) => {
                    log::debug!("read from {} failed: {}", peer, err);
                    break;
                }
            }
        }
        // `conn` drops here: owned devices are unregistered and the sink detached.
    }

    let _ = writer.join();
    let _ = stream.shutdown(Shutdown::Both);
    log::info!("connection from {} closed", peer);
    Ok(())
}

fn write_loop(mut stream: TcpStream, rx: Receiver<Arc<ServerMessage>>) {
    for message in rx {
        if let Err(err) = write_message(&mut stream, &message) {
            log::debug!("write failed, closing connection: {}", err);
            // Unblocks the reader so the connection tears down promptly.
            let _ = stream.shutdown(Shutdown::Both);
            break;
        }
    }
}

/// Per-connection state. Dropping it runs the same teardown as an explicit
/// `unregister` for every device the connection registered.
struct Connection {
    id: ConnectionId,
    origin: String,
    loopback: bool,
    hub: Arc<MotionHub>,
    tx: SyncSender<Arc<ServerMessage>>,
    devices: BTreeSet<DeviceId>,
}

impl Connection {
    fn reply(&self, message: ServerMessage) {
        // Fails only once the writer is gone, at which point the connection is closing.
        let _ = self.tx.send(Arc::new(message));
    }

    fn owns(&self, device_id: &str) -> bool {
        self.devices.contains(device_id)
    }

    fn handle_line(&mut self, line: &[u8]) {
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            return;
        }
        match serde_json::from_slice::<ClientMessage>(line) {
            Ok(message) => self.handle(message),
            Err(err) => {
                log::debug!("connection {} sent an invalid message: {}", self.id, err);
                self.reply(ServerMessage::Error {
                    reason: "invalid_message".to_string(),
                });
            }
        }
    }

    fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Register {
                device_id,
                device_info,
            } => self.register(device_id, device_info),
            ClientMessage::Unregister { device_id } => {
                let success = self.owns(&device_id);
                if success {
                    self.hub.unregister(&device_id);
                    self.devices.remove(&device_id);
                }
                self.reply(ServerMessage::UnregistrationResult { success, device_id });
            }
            ClientMessage::StartStream { device_id } => {
                let result = if self.owns(&device_id) {
                    self.hub.start_stream(&device_id).map(|_| ())
                } else {
                    Err(AdmissionError::NotRegistered)
                };
                self.reply(match result {
                    Ok(()) => ServerMessage::StreamResult {
                        success: true,
                        streaming: true,
                        device_id,
                        reason: None,
                    },
                    Err(err) => ServerMessage::StreamResult {
                        success: false,
                        streaming: false,
                        device_id,
                        reason: Some(err.code().to_string()),
                    },
                });
            }
            ClientMessage::StopStream { device_id } => {
                let owned = self.owns(&device_id);
                if owned {
                    self.hub.stop_stream(&device_id);
                }
                self.reply(ServerMessage::StreamResult {
                    success: owned,
                    streaming: false,
                    device_id,
                    reason: (!owned).then(|| AdmissionError::NotRegistered.code().to_string()),
                });
            }
            ClientMessage::Frame {
                device_id,
                frame_data,
                ..
            } => self.frame(device_id, &frame_data),
            ClientMessage::JoinViewers => {
                self.hub.hub().subscribe(VIEWERS_TOPIC, self.id);
                self.reply(ServerMessage::JoinedViewers {
                    message: "Joined viewers room".to_string(),
                });
            }
            ClientMessage::LeaveViewers => {
                self.hub.hub().unsubscribe(VIEWERS_TOPIC, self.id);
                self.reply(ServerMessage::LeftViewers);
            }
            ClientMessage::GetStats => self.reply(ServerMessage::Stats(self.hub.stats())),
            ClientMessage::SetMotionDetection { enabled } => {
                if !self.loopback {
                    log::warn!("motion detection toggle from {} refused", self.origin);
                    self.reply(ServerMessage::Error {
                        reason: "forbidden".to_string(),
                    });
                    return;
                }
                match self.hub.set_motion_detection(enabled) {
                    Ok(enabled) => self.reply(ServerMessage::MotionDetection { enabled }),
                    Err(err) => {
                        log::warn!("motion detection toggle failed: {:#}", err);
                        self.reply(ServerMessage::Error {
                            reason: "invalid_settings".to_string(),
                        });
                    }
                }
            }
        }
    }

    fn register(
        &mut self,
        device_id: Option<String>,
        device_info: serde_json::Map<String, serde_json::Value>,
    ) {
        let device_id = device_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_device_id);
        let metadata = metadata_from_json(device_info);
        let reply = match self.hub.register(&device_id, metadata, &self.origin) {
            Ok(_) => {
                self.devices.insert(device_id.clone());
                ServerMessage::RegistrationResult {
                    success: true,
                    device_id,
                    reason: None,
                }
            }
            Err(err) => ServerMessage::RegistrationResult {
                success: false,
                device_id,
                reason: Some(err.code().to_string()),
            },
        };
        self.reply(reply);
    }

    fn frame(&mut self, device_id: String, frame_data: &str) {
        if !self.owns(&device_id) {
            self.hub.note_rejected();
            self.reply(ServerMessage::FrameError {
                device_id,
                reason: IngestError::NotStreaming.code().to_string(),
            });
            return;
        }
        let mut bytes = match decode_frame_data(frame_data, self.hub.max_frame_bytes()) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.hub.note_rejected();
                self.reply(ServerMessage::FrameError {
                    device_id,
                    reason: err.code().to_string(),
                });
                return;
            }
        };
        let result = self.hub.ingest(&device_id, &bytes);
        bytes.zeroize();
        if let Err(err) = result {
            self.reply(ServerMessage::FrameError {
                device_id,
                reason: err.code().to_string(),
            });
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for device_id in std::mem::take(&mut self.devices) {
            self.hub.unregister(&device_id);
            log::info!("device {} released on disconnect", device_id);
        }
        self.hub.hub().detach(self.id);
    }
}
