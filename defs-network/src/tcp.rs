//! TCP stream host
//!
//! Each protocol stream is its own TCP connection. The dialer opens with a
//! preamble naming the protocol and its own node id; the listener admits the
//! connection, answers with an ack carrying its node id, and hands the socket
//! to the registered [`StreamHandler`].
//!
//! ```text
//! dialer                                  listener
//!   │── u32_be(len) {protocol, peer} ──────▶│  admission control
//!   │◀───────── u32_be(len) {ok, peer} ─────│  handler lookup
//!   │◀════════ protocol frames ════════════▶│
//! ```

use crate::host::{Host, ProtocolStream, StreamHandler};
use crate::peerstore::{AddrInfo, PeerStore, TEMP_ADDR_TTL};
use crate::resource::{ResourceLimits, ResourceManager};
use async_trait::async_trait;
use defs_core::error::{DefsError, Result};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Internal protocol used by [`Host::connect`] to check reachability
pub const PROBE_PROTOCOL: &str = "/defs/tcp/probe/1.0.0";

const MAX_PREAMBLE: usize = 4096;
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
struct Preamble {
    protocol: String,
    peer: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PreambleAck {
    ok: bool,
    peer: String,
    #[serde(default)]
    reason: String,
}

async fn write_message<W, T>(io: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    let write = async {
        io.write_u32(body.len() as u32).await?;
        io.write_all(&body).await?;
        io.flush().await
    };
    match tokio::time::timeout(PREAMBLE_TIMEOUT, write).await {
        Err(_) => Err(DefsError::StreamTimeout),
        Ok(result) => result.map_err(DefsError::from_stream_io),
    }
}

async fn read_message<R, T>(io: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let read = async {
        let len = io.read_u32().await.map_err(DefsError::from_stream_io)? as usize;
        if len > MAX_PREAMBLE {
            return Err(DefsError::MessageTooLarge {
                size: len,
                max: MAX_PREAMBLE,
            });
        }
        let mut body = vec![0u8; len];
        io.read_exact(&mut body)
            .await
            .map_err(DefsError::from_stream_io)?;
        Ok::<T, DefsError>(serde_json::from_slice(&body)?)
    };
    tokio::time::timeout(PREAMBLE_TIMEOUT, read)
        .await
        .map_err(|_| DefsError::StreamTimeout)?
}

/// Parse `host:port` or `/ip4|ip6/<ip>/tcp/<port>`
pub fn parse_addr(addr: &str) -> Result<SocketAddr> {
    if !addr.starts_with('/') {
        return addr
            .parse()
            .map_err(|_| DefsError::Network(format!("unsupported address: {}", addr)));
    }

    // Parse addresses like /ip4/192.168.1.1/tcp/4600
    let parts: Vec<&str> = addr.split('/').collect();
    let mut ip: Option<IpAddr> = None;
    let mut port: Option<u16> = None;
    for (i, part) in parts.iter().enumerate() {
        let Some(value) = parts.get(i + 1) else {
            break;
        };
        match *part {
            "ip4" | "ip6" => ip = value.parse().ok(),
            "tcp" => port = value.parse().ok(),
            _ => {}
        }
    }
    match (ip, port) {
        (Some(ip), Some(port)) => Ok(SocketAddr::new(ip, port)),
        _ => Err(DefsError::Network(format!("unsupported address: {}", addr))),
    }
}

/// TCP host configuration
#[derive(Debug, Clone)]
pub struct TcpHostConfig {
    pub listen_addr: SocketAddr,
    pub connect_timeout: Duration,
    pub limits: ResourceLimits,
}

impl Default for TcpHostConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            connect_timeout: Duration::from_secs(10),
            limits: ResourceLimits::default(),
        }
    }
}

impl TcpHostConfig {
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// [`Host`] over tokio TCP
pub struct TcpHost {
    local_id: String,
    local_addr: SocketAddr,
    config: TcpHostConfig,
    peerstore: PeerStore,
    resources: ResourceManager,
    handlers: RwLock<HashMap<String, Arc<dyn StreamHandler>>>,
    /// Peer id to the address that last answered
    connected: Mutex<HashMap<String, SocketAddr>>,
    shutdown: CancellationToken,
}

impl TcpHost {
    /// Bind the listener and start accepting streams
    pub async fn bind(local_id: impl Into<String>, config: TcpHostConfig) -> Result<Arc<Self>> {
        let local_id = local_id.into();
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let host = Arc::new(Self {
            peerstore: PeerStore::new(local_id.clone()),
            resources: ResourceManager::new(config.limits.clone()),
            local_id,
            local_addr,
            config,
            handlers: RwLock::new(HashMap::new()),
            connected: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        info!(node_id = %host.local_id, addr = %local_addr, "TCP host listening");
        tokio::spawn(Self::accept_loop(
            Arc::downgrade(&host),
            listener,
            host.shutdown.clone(),
        ));
        Ok(host)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    /// Stop accepting new streams
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn accept_loop(host: Weak<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let (socket, remote) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };
            let Some(host) = host.upgrade() else {
                break;
            };
            tokio::spawn(async move {
                if let Err(e) = host.serve_inbound(socket, remote).await {
                    debug!(remote = %remote, error = %e, kind = e.kind(), "Inbound stream ended with error");
                }
            });
        }
        debug!("Accept loop stopped");
    }

    async fn serve_inbound(self: Arc<Self>, mut socket: TcpStream, remote: SocketAddr) -> Result<()> {
        let Some(_connection) = self.resources.admit_connection(remote.ip()) else {
            return Err(DefsError::Network(format!(
                "connection budget exhausted, dropping {}",
                remote
            )));
        };
        socket.set_nodelay(true)?;

        let preamble: Preamble = read_message(&mut socket).await?;
        if preamble.protocol == PROBE_PROTOCOL {
            return write_message(&mut socket, &self.ack()).await;
        }

        let Some(_stream) = self.resources.admit_stream(&preamble.peer) else {
            return self.reject(&mut socket, "stream budget exhausted").await;
        };
        let handler = self.handlers.read().get(&preamble.protocol).cloned();
        let Some(handler) = handler else {
            return self.reject(&mut socket, "protocol not supported").await;
        };

        write_message(&mut socket, &self.ack()).await?;
        debug!(peer = %preamble.peer, protocol = %preamble.protocol, "Inbound stream accepted");
        handler
            .handle(ProtocolStream::new(
                preamble.peer,
                preamble.protocol,
                Box::new(socket),
            ))
            .await
    }

    fn ack(&self) -> PreambleAck {
        PreambleAck {
            ok: true,
            peer: self.local_id.clone(),
            reason: String::new(),
        }
    }

    async fn reject(&self, socket: &mut TcpStream, reason: &str) -> Result<()> {
        let ack = PreambleAck {
            ok: false,
            peer: self.local_id.clone(),
            reason: reason.to_string(),
        };
        write_message(socket, &ack).await?;
        Err(DefsError::Network(reason.to_string()))
    }

    async fn dial(&self, addr: SocketAddr, peer: &str, protocol: &str) -> Result<TcpStream> {
        let mut socket = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DefsError::StreamTimeout)?
            .map_err(DefsError::from_stream_io)?;
        socket.set_nodelay(true)?;

        let preamble = Preamble {
            protocol: protocol.to_string(),
            peer: self.local_id.clone(),
        };
        write_message(&mut socket, &preamble).await?;
        let ack: PreambleAck = read_message(&mut socket).await?;
        if !ack.ok {
            return Err(DefsError::Network(format!(
                "{} refused {}: {}",
                peer, protocol, ack.reason
            )));
        }
        if ack.peer != peer {
            return Err(DefsError::Network(format!(
                "expected peer {} at {}, found {}",
                peer, addr, ack.peer
            )));
        }
        Ok(socket)
    }

    /// Connected address first, then every live peerstore address
    fn dial_addrs(&self, peer: &str) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self.connected.lock().get(peer).copied().into_iter().collect();
        for addr in self.peerstore.addrs(peer) {
            match parse_addr(&addr) {
                Ok(addr) if !addrs.contains(&addr) => addrs.push(addr),
                Ok(_) => {}
                Err(e) => debug!(peer, error = %e, "Skipping address"),
            }
        }
        addrs
    }
}

impl Drop for TcpHost {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Host for TcpHost {
    fn local_peer_id(&self) -> &str {
        &self.local_id
    }

    fn peerstore(&self) -> &PeerStore {
        &self.peerstore
    }

    fn listen_addrs(&self) -> Vec<String> {
        vec![self.local_addr.to_string()]
    }

    async fn connect(&self, info: &AddrInfo) -> Result<()> {
        if info.id == self.local_id {
            return Err(DefsError::Network("refusing to dial self".to_string()));
        }
        let candidates = if info.addrs.is_empty() {
            self.peerstore.addrs(&info.id)
        } else {
            info.addrs.clone()
        };
        if candidates.is_empty() {
            return Err(DefsError::PeerNotFound(info.id.clone()));
        }

        let mut last = None;
        for addr in &candidates {
            let result = match parse_addr(addr) {
                Ok(sock) => self.dial(sock, &info.id, PROBE_PROTOCOL).await.map(|_| sock),
                Err(e) => Err(e),
            };
            match result {
                Ok(sock) => {
                    self.peerstore
                        .add_addrs(&info.id, std::slice::from_ref(addr), TEMP_ADDR_TTL);
                    self.connected.lock().insert(info.id.clone(), sock);
                    debug!(peer = %info.id, addr = %addr, "Connected");
                    return Ok(());
                }
                Err(e) => {
                    debug!(peer = %info.id, addr = %addr, error = %e, "Dial failed");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| DefsError::PeerNotFound(info.id.clone())))
    }

    async fn new_stream(&self, peer: &str, protocol: &str) -> Result<ProtocolStream> {
        let addrs = self.dial_addrs(peer);
        if addrs.is_empty() {
            return Err(DefsError::PeerNotFound(peer.to_string()));
        }

        let mut last = None;
        for addr in addrs {
            match self.dial(addr, peer, protocol).await {
                Ok(socket) => {
                    self.connected.lock().insert(peer.to_string(), addr);
                    return Ok(ProtocolStream::new(peer, protocol, Box::new(socket)));
                }
                Err(e) => {
                    debug!(peer, addr = %addr, protocol, error = %e, "Stream open failed");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| DefsError::PeerNotFound(peer.to_string())))
    }

    async fn close_peer(&self, peer: &str) -> Result<()> {
        if self.connected.lock().remove(peer).is_some() {
            debug!(peer, "Connection released");
        }
        Ok(())
    }

    fn set_stream_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        self.handlers.write().insert(protocol.to_string(), handler);
        debug!(protocol, "Stream handler registered");
    }

    fn remove_stream_handler(&self, protocol: &str) {
        self.handlers.write().remove(protocol);
    }

    fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.connected.lock().keys().cloned().collect();
        peers.sort();
        peers
    }
}
