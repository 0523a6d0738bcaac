//! DEFS Network Layer
//!
//! Peer-to-peer plumbing for DEFS storage nodes:
//! - **Host**: abstract stream host with a loopback-friendly TCP implementation
//! - **Handshake**: peer exchange on `/defs/handshake/1.0.0`
//! - **Shard upload**: request/response on `/defs/slice/upload/1.0.0`
//! - **Delete dispatch**: owner-authorized deletes over pubsub
//! - **Gossip**: libp2p gossipsub + Kademlia swarm backing the pubsub topics
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Node context                        │
//! │                                                           │
//! │  ┌──────────────────┐        ┌────────────────────────┐  │
//! │  │  Host (TcpHost)  │        │  PubSub                │  │
//! │  │  handshake       │        │  (LocalPubSub or       │  │
//! │  │  slice upload    │        │   GossipPubSub)        │  │
//! │  └──────────────────┘        └────────────────────────┘  │
//! │           │                             │                 │
//! │  ┌──────────────────┐        ┌────────────────────────┐  │
//! │  │ UploadDispatcher │        │  DeleteHandler         │  │
//! │  │ UploadTaskState  │        │  (P2PKH check)         │  │
//! │  └──────────────────┘        └────────────────────────┘  │
//! └───────────│─────────────────────────────│────────────────┘
//!             ▼                             ▼
//!     ┌───────────────┐             ┌───────────────┐
//!     │ Remote nodes  │             │ Topic peers   │
//!     └───────────────┘             └───────────────┘
//! ```

pub mod behaviour;
pub mod delete;
pub mod dispatch;
pub mod events;
pub mod framing;
pub mod gossip;
pub mod handshake;
pub mod host;
pub mod peerstore;
pub mod pubsub;
pub mod resource;
pub mod tcp;
pub mod upload;

// Re-exports
pub use delete::{DeleteHandler, DeleteOutcome, DeleteRequest, SignedEnvelope};
pub use dispatch::{DispatchConfig, ShardStatus, UploadDispatcher, UploadTaskState};
pub use events::{HandshakeAttempted, PeerConnected, ShardStored, ShardsDeleted, UploadServed};
pub use framing::{FramedStream, StreamPolicy};
pub use gossip::{GossipConfig, GossipPubSub, GossipService};
pub use handshake::{HandshakeConfig, HandshakeMessage, HandshakeService};
pub use host::{Host, ProtocolStream, StreamHandler};
pub use peerstore::{AddrInfo, PeerStore};
pub use pubsub::{LocalPubSub, PubSub, PubSubMessage};
pub use resource::{ResourceLimits, ResourceManager};
pub use tcp::{TcpHost, TcpHostConfig};
pub use upload::{UploadHandler, UploadResponse};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol id of the peer handshake
pub const HANDSHAKE_PROTOCOL: &str = "/defs/handshake/1.0.0";

/// Protocol id of shard upload
pub const UPLOAD_PROTOCOL: &str = "/defs/slice/upload/1.0.0";

/// Pubsub topics
pub mod topic {
    pub const DELETE_REQUEST: &str = "file/delete/request/1.0.0";
    pub const UPLOAD_REQUEST: &str = "file/upload/request/1.0.0";
    pub const UPLOAD_RESPONSE: &str = "file/upload/response/1.0.0";
    pub const DOWNLOAD_REQUEST: &str = "file/download/request/1.0.0";
    pub const DOWNLOAD_RESPONSE: &str = "file/download/response/1.0.0";

    /// Every topic a storage node joins
    pub const ALL: [&str; 5] = [
        DELETE_REQUEST,
        UPLOAD_REQUEST,
        UPLOAD_RESPONSE,
        DOWNLOAD_REQUEST,
        DOWNLOAD_RESPONSE,
    ];
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP listen address for protocol streams
    pub listen_addr: String,

    /// libp2p listen address for gossip (empty disables the swarm)
    pub gossip_listen_addr: String,

    /// Gossip bootstrap multiaddrs, optionally ending in `/p2p/<peer id>`
    pub gossip_bootstrap: Vec<String>,

    /// Bootstrap peers as `node_id@host:port`
    pub bootstrap_peers: Vec<String>,

    /// Connection high-water mark, sizes the inbound budget
    pub high_water: usize,

    /// Node ids or IP addresses exempt from admission limits
    pub allow_list: Vec<String>,

    /// Handshake attempt timeout in seconds (0 = no deadline)
    pub handshake_timeout_secs: u64,

    /// Initial stream read deadline in seconds
    pub read_timeout_secs: u64,

    /// Stream write deadline in seconds
    pub write_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4600".to_string(),
            gossip_listen_addr: String::new(),
            gossip_bootstrap: Vec::new(),
            bootstrap_peers: Vec::new(),
            high_water: 400,
            allow_list: Vec::new(),
            handshake_timeout_secs: 0,
            read_timeout_secs: framing::DEFAULT_READ_TIMEOUT.as_secs(),
            write_timeout_secs: framing::DEFAULT_WRITE_TIMEOUT.as_secs(),
        }
    }
}

impl NetworkConfig {
    /// Set the listen address
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    /// Add a bootstrap peer (`node_id@host:port`)
    pub fn with_bootstrap_peer(mut self, peer: impl Into<String>) -> Self {
        self.bootstrap_peers.push(peer.into());
        self
    }

    /// Stream deadlines derived from this config
    pub fn stream_policy(&self) -> StreamPolicy {
        StreamPolicy::default()
            .with_read_timeout(Duration::from_secs(self.read_timeout_secs))
            .with_write_timeout(Duration::from_secs(self.write_timeout_secs))
    }

    /// Admission limits derived from this config
    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits::new(self.high_water).with_allow_list(self.allow_list.iter().cloned())
    }

    /// Parsed bootstrap peers; malformed entries are reported
    pub fn bootstrap_addrs(&self) -> defs_core::Result<Vec<AddrInfo>> {
        self.bootstrap_peers
            .iter()
            .map(|entry| AddrInfo::parse(entry))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_config_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.read_timeout_secs, 33);
        assert_eq!(config.write_timeout_secs, 30);
        assert!(config.bootstrap_peers.is_empty());
    }

    #[test]
    fn test_bootstrap_parsing() {
        let config = NetworkConfig::default()
            .with_bootstrap_peer("node-a@127.0.0.1:4600")
            .with_bootstrap_peer("node-b@/ip4/10.0.0.2/tcp/4601");
        let peers = config.bootstrap_addrs().unwrap();
        assert_eq!(peers[0].id, "node-a");
        assert_eq!(peers[1].addrs, vec!["/ip4/10.0.0.2/tcp/4601".to_string()]);

        let bad = NetworkConfig::default().with_bootstrap_peer("no-separator");
        assert!(bad.bootstrap_addrs().is_err());
    }

    #[test]
    fn test_topics_distinct() {
        let mut topics = topic::ALL.to_vec();
        topics.sort();
        topics.dedup();
        assert_eq!(topics.len(), 5);
    }
}
