//! libp2p NetworkBehaviour for the gossip swarm
//!
//! Combines:
//! - Gossipsub for the file topics
//! - Kademlia for peer discovery
//! - Identify for peer info exchange
//! - Ping for liveness checking

use defs_core::crypto;
use defs_core::error::DefsError;
use libp2p::{
    gossipsub, identify, kad, kad::store::MemoryStore, ping, swarm::NetworkBehaviour, Multiaddr,
    PeerId, StreamProtocol,
};
use std::time::Duration;
use tracing::{debug, info};

/// Protocol name for the DEFS Kademlia DHT
pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/defs/kad/1.0.0");

/// Protocol name for DEFS Identify
pub const IDENTIFY_PROTOCOL: &str = "/defs/id/1.0.0";

/// Agent version string
pub const AGENT_VERSION: &str = concat!("defs/", env!("CARGO_PKG_VERSION"));

/// Combined network behaviour for DEFS nodes
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "DefsEvent")]
pub struct DefsBehaviour {
    /// Gossipsub for file topics
    pub gossipsub: gossipsub::Behaviour,
    /// Kademlia DHT for peer discovery
    pub kademlia: kad::Behaviour<MemoryStore>,
    /// Identify protocol for exchanging peer info
    pub identify: identify::Behaviour,
    /// Ping protocol for liveness checking
    pub ping: ping::Behaviour,
}

/// Events emitted by the DEFS behaviour
#[derive(Debug)]
pub enum DefsEvent {
    /// A gossip message arrived on a subscribed topic
    Message {
        source: Option<PeerId>,
        topic: String,
        data: Vec<u8>,
    },
    /// A peer joined one of our topics
    Subscribed { peer_id: PeerId, topic: String },
    /// Identify info received
    IdentifyReceived {
        peer_id: PeerId,
        listen_addrs: Vec<Multiaddr>,
    },
    /// Routing table gained a peer
    RoutingUpdated { peer_id: PeerId },
    /// Ping result received
    PingResult { peer_id: PeerId, rtt: Duration },
    /// Ping failed
    PingFailed { peer_id: PeerId },
    /// Anything the service does not act on
    Other,
}

impl From<gossipsub::Event> for DefsEvent {
    fn from(event: gossipsub::Event) -> Self {
        match event {
            gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            } => {
                debug!(
                    peer = %propagation_source,
                    topic = %message.topic,
                    size = message.data.len(),
                    "Gossip message received"
                );
                DefsEvent::Message {
                    source: message.source,
                    topic: message.topic.into_string(),
                    data: message.data,
                }
            }
            gossipsub::Event::Subscribed { peer_id, topic } => {
                debug!(peer = %peer_id, topic = %topic, "Peer subscribed");
                DefsEvent::Subscribed {
                    peer_id,
                    topic: topic.into_string(),
                }
            }
            gossipsub::Event::GossipsubNotSupported { peer_id } => {
                debug!(peer = %peer_id, "Peer does not support gossipsub");
                DefsEvent::Other
            }
            _ => DefsEvent::Other,
        }
    }
}

impl From<kad::Event> for DefsEvent {
    fn from(event: kad::Event) -> Self {
        match event {
            kad::Event::RoutingUpdated { peer, .. } => {
                debug!(peer = %peer, "Kademlia routing updated");
                DefsEvent::RoutingUpdated { peer_id: peer }
            }
            kad::Event::OutboundQueryProgressed { result, .. } => {
                debug!(?result, "Kademlia query progressed");
                DefsEvent::Other
            }
            _ => DefsEvent::Other,
        }
    }
}

impl From<identify::Event> for DefsEvent {
    fn from(event: identify::Event) -> Self {
        match event {
            identify::Event::Received { peer_id, info } => {
                info!(
                    peer = %peer_id,
                    agent = %info.agent_version,
                    "Identify info received"
                );
                DefsEvent::IdentifyReceived {
                    peer_id,
                    listen_addrs: info.listen_addrs,
                }
            }
            identify::Event::Error { peer_id, error } => {
                debug!(peer = %peer_id, error = %error, "Identify error");
                DefsEvent::Other
            }
            _ => DefsEvent::Other,
        }
    }
}

impl From<ping::Event> for DefsEvent {
    fn from(event: ping::Event) -> Self {
        match event.result {
            Ok(rtt) => {
                debug!(peer = %event.peer, rtt_ms = rtt.as_millis(), "Ping success");
                DefsEvent::PingResult {
                    peer_id: event.peer,
                    rtt,
                }
            }
            Err(e) => {
                debug!(peer = %event.peer, error = %e, "Ping failed");
                DefsEvent::PingFailed {
                    peer_id: event.peer,
                }
            }
        }
    }
}

/// Configuration for the DEFS behaviour
#[derive(Debug, Clone)]
pub struct BehaviourConfig {
    /// Local keypair (signs gossip messages, feeds identify)
    pub keypair: libp2p::identity::Keypair,
    /// Gossipsub heartbeat
    pub heartbeat_interval: Duration,
    /// Ping interval
    pub ping_interval: Duration,
    /// Ping timeout
    pub ping_timeout: Duration,
    /// Kademlia query timeout
    pub kademlia_query_timeout: Duration,
}

impl BehaviourConfig {
    /// Create a new config from a keypair
    pub fn from_keypair(keypair: &libp2p::identity::Keypair) -> Self {
        Self {
            keypair: keypair.clone(),
            heartbeat_interval: Duration::from_secs(1),
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            kademlia_query_timeout: Duration::from_secs(60),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.keypair.public().to_peer_id()
    }

    /// Set ping interval
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set gossipsub heartbeat
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Content-addressed message ids so duplicates are suppressed
fn message_id(message: &gossipsub::Message) -> gossipsub::MessageId {
    let mut input = message.topic.as_str().as_bytes().to_vec();
    input.extend_from_slice(&message.data);
    gossipsub::MessageId::from(hex::encode(crypto::sha256(&input)))
}

impl DefsBehaviour {
    /// Create a new DEFS behaviour
    pub fn new(config: BehaviourConfig) -> defs_core::error::Result<Self> {
        let local_peer_id = config.local_peer_id();

        // Create Gossipsub behaviour
        let gossip_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(config.heartbeat_interval)
            .validation_mode(gossipsub::ValidationMode::Strict)
            .message_id_fn(message_id)
            .build()
            .map_err(|e| DefsError::Configuration(format!("gossipsub: {}", e)))?;
        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(config.keypair.clone()),
            gossip_config,
        )
        .map_err(|e| DefsError::Configuration(format!("gossipsub: {}", e)))?;

        // Create Kademlia behaviour
        let store = MemoryStore::new(local_peer_id);
        let mut kad_config = kad::Config::default();
        kad_config.set_query_timeout(config.kademlia_query_timeout);
        kad_config.set_protocol_names(vec![KAD_PROTOCOL]);
        let kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);

        // Create Identify behaviour
        let identify_config =
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), config.keypair.public())
                .with_agent_version(AGENT_VERSION.to_string());
        let identify = identify::Behaviour::new(identify_config);

        // Create Ping behaviour
        let ping_config = ping::Config::new()
            .with_interval(config.ping_interval)
            .with_timeout(config.ping_timeout);
        let ping = ping::Behaviour::new(ping_config);

        info!(peer_id = %local_peer_id, "Created DEFS behaviour");

        Ok(Self {
            gossipsub,
            kademlia,
            identify,
            ping,
        })
    }

    /// Add a known address for a peer
    pub fn add_address(&mut self, peer_id: &PeerId, addr: Multiaddr) {
        self.kademlia.add_address(peer_id, addr);
    }

    /// Start a Kademlia bootstrap
    pub fn bootstrap(&mut self) -> std::result::Result<kad::QueryId, kad::NoKnownPeers> {
        self.kademlia.bootstrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_behaviour_config() {
        let keypair = libp2p::identity::Keypair::generate_ed25519();
        let config = BehaviourConfig::from_keypair(&keypair)
            .with_ping_interval(Duration::from_secs(60))
            .with_heartbeat_interval(Duration::from_millis(500));

        assert_eq!(config.ping_interval, Duration::from_secs(60));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(config.local_peer_id(), keypair.public().to_peer_id());
    }

    #[test]
    fn test_behaviour_creation() {
        let keypair = libp2p::identity::Keypair::generate_ed25519();
        let behaviour = DefsBehaviour::new(BehaviourConfig::from_keypair(&keypair));
        assert!(behaviour.is_ok());
    }

    #[test]
    fn test_agent_version() {
        assert!(AGENT_VERSION.starts_with("defs/"));
    }
}
