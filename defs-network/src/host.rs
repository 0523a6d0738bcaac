//! Host abstraction
//!
//! A [`Host`] dials peers and opens protocol streams; inbound streams are
//! routed to the [`StreamHandler`] registered for their protocol id.

use crate::peerstore::{AddrInfo, PeerStore};
use async_trait::async_trait;
use defs_core::error::Result;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream carried by a protocol stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// An open stream speaking one protocol with one peer
pub struct ProtocolStream {
    /// Remote peer id
    pub peer: String,
    pub protocol: String,
    pub io: BoxStream,
}

impl ProtocolStream {
    pub fn new(peer: impl Into<String>, protocol: impl Into<String>, io: BoxStream) -> Self {
        Self {
            peer: peer.into(),
            protocol: protocol.into(),
            io,
        }
    }
}

impl fmt::Debug for ProtocolStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolStream")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Serves inbound streams of one protocol
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, stream: ProtocolStream) -> Result<()>;
}

/// Stream host
#[async_trait]
pub trait Host: Send + Sync {
    fn local_peer_id(&self) -> &str;

    fn peerstore(&self) -> &PeerStore;

    /// Addresses other nodes can dial
    fn listen_addrs(&self) -> Vec<String>;

    /// Establish reachability of `info`, recording its addresses
    async fn connect(&self, info: &AddrInfo) -> Result<()>;

    /// Open a stream for `protocol` to a connected or known peer
    async fn new_stream(&self, peer: &str, protocol: &str) -> Result<ProtocolStream>;

    /// Release any connection state held for `peer`
    async fn close_peer(&self, peer: &str) -> Result<()>;

    fn set_stream_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>);

    fn remove_stream_handler(&self, protocol: &str);

    /// Peers with an established connection
    fn connected_peers(&self) -> Vec<String>;
}
