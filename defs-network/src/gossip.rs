//! Gossip swarm backing the pubsub topics
//!
//! One task owns the libp2p swarm. [`GossipPubSub`] talks to it over a
//! command channel; messages arriving on subscribed topics are fanned out to
//! local receivers through a [`TopicHub`]. While fewer than
//! `routing_low_water` peers are connected the bootstrap addresses are
//! redialed on every refresh tick.

use crate::behaviour::{BehaviourConfig, DefsBehaviour, DefsEvent};
use crate::pubsub::{PubSub, PubSubMessage, TopicHub, DEFAULT_TOPIC_CAPACITY};
use async_trait::async_trait;
use bytes::Bytes;
use defs_core::error::{DefsError, Result};
use defs_core::ROUTING_LOW_WATER;
use futures::StreamExt;
use libp2p::{
    gossipsub::{self, IdentTopic},
    identity::Keypair,
    multiaddr::Protocol,
    noise,
    swarm::SwarmEvent,
    tcp, yamux, Multiaddr, PeerId, Swarm,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Gossip service configuration
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Listen addresses
    pub listen_addrs: Vec<Multiaddr>,
    /// Bootstrap addresses, optionally ending in `/p2p/<peer id>`
    pub bootstrap_peers: Vec<Multiaddr>,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// How often connectivity is checked
    pub refresh_interval: Duration,
    /// Connected-peer floor that triggers a redial
    pub routing_low_water: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            listen_addrs: Vec::new(),
            bootstrap_peers: Vec::new(),
            idle_timeout: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(30),
            routing_low_water: ROUTING_LOW_WATER,
        }
    }
}

impl GossipConfig {
    /// Parse a listen address such as `/ip4/0.0.0.0/tcp/4700`
    pub fn with_listen_addr(mut self, addr: &str) -> Result<Self> {
        self.listen_addrs.push(parse_multiaddr(addr)?);
        Ok(self)
    }

    pub fn with_bootstrap_peer(mut self, addr: &str) -> Result<Self> {
        self.bootstrap_peers.push(parse_multiaddr(addr)?);
        Ok(self)
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }
}

/// Swarm identity derived from the node's 32-byte secret
pub fn keypair_from_secret(secret: [u8; 32]) -> Result<Keypair> {
    Keypair::ed25519_from_bytes(secret).map_err(|e| DefsError::InvalidKey(format!("ed25519: {}", e)))
}

fn parse_multiaddr(addr: &str) -> Result<Multiaddr> {
    addr.parse()
        .map_err(|e| DefsError::Configuration(format!("invalid multiaddr {}: {}", addr, e)))
}

/// Peer id carried in a trailing `/p2p/...` component
fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

enum Command {
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Owner of the swarm event loop
pub struct GossipService {
    swarm: Swarm<DefsBehaviour>,
    config: GossipConfig,
    hub: Arc<TopicHub>,
    commands: mpsc::Receiver<Command>,
}

impl GossipService {
    /// Build the swarm, start listening and run the event loop on the
    /// current runtime.
    pub fn spawn(keypair: Keypair, config: GossipConfig) -> Result<(GossipPubSub, JoinHandle<()>)> {
        let local_peer_id = keypair.public().to_peer_id();
        let behaviour = DefsBehaviour::new(BehaviourConfig::from_keypair(&keypair))?;
        let idle_timeout = config.idle_timeout;

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| DefsError::Network(format!("transport: {}", e)))?
            .with_behaviour(move |_key| behaviour)
            .map_err(|e| DefsError::Network(format!("behaviour: {}", e)))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(idle_timeout))
            .build();

        for addr in &config.listen_addrs {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| DefsError::Network(format!("listen on {}: {}", addr, e)))?;
            info!(addr = %addr, "Gossip listening");
        }

        for addr in &config.bootstrap_peers {
            if let Some(peer_id) = peer_id_of(addr) {
                swarm.behaviour_mut().add_address(&peer_id, addr.clone());
            }
            if let Err(e) = swarm.dial(addr.clone()) {
                warn!(addr = %addr, error = %e, "Failed to dial bootstrap peer");
            }
        }
        if config.bootstrap_peers.iter().any(|a| peer_id_of(a).is_some()) {
            match swarm.behaviour_mut().bootstrap() {
                Ok(_) => info!("Started Kademlia bootstrap"),
                Err(e) => warn!(error = ?e, "Bootstrap failed - no known peers"),
            }
        }

        let hub = Arc::new(TopicHub::new(DEFAULT_TOPIC_CAPACITY));
        let (tx, rx) = mpsc::channel(64);
        let service = Self {
            swarm,
            config,
            hub: hub.clone(),
            commands: rx,
        };
        let handle = tokio::spawn(service.run());

        Ok((
            GossipPubSub {
                local_peer_id: local_peer_id.to_string(),
                commands: tx,
                hub,
            },
            handle,
        ))
    }

    async fn run(mut self) {
        let mut refresh = tokio::time::interval(self.config.refresh_interval);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("Gossip service stopping");
                        break;
                    }
                },
                _ = refresh.tick() => self.maintain_connectivity(),
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Publish { topic, data, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(IdentTopic::new(topic.as_str()), data)
                    .map(|id| debug!(topic = %topic, message_id = %id, "Published"))
                    .map_err(|e| DefsError::Network(format!("publish on {}: {}", topic, e)));
                let _ = reply.send(result);
            }
            Command::Subscribe { topic, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .subscribe(&IdentTopic::new(topic.as_str()))
                    .map(|_| ())
                    .map_err(|e| DefsError::Network(format!("subscribe to {}: {}", topic, e)));
                let _ = reply.send(result);
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<DefsEvent>) {
        match event {
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "New listen address");
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!(peer = %peer_id, "Connection established");
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                debug!(peer = %peer_id, "Connection closed");
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                debug!(peer = ?peer_id, error = %error, "Outgoing connection failed");
            }
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: DefsEvent) {
        match event {
            DefsEvent::Message {
                source,
                topic,
                data,
            } => {
                let delivered = self.hub.deliver(PubSubMessage {
                    topic,
                    source: source.map(|p| p.to_string()),
                    data: Bytes::from(data),
                });
                debug!(delivered, "Gossip message delivered");
            }
            DefsEvent::IdentifyReceived {
                peer_id,
                listen_addrs,
            } => {
                for addr in listen_addrs {
                    self.swarm.behaviour_mut().add_address(&peer_id, addr);
                }
            }
            DefsEvent::Subscribed { .. }
            | DefsEvent::RoutingUpdated { .. }
            | DefsEvent::PingResult { .. }
            | DefsEvent::PingFailed { .. }
            | DefsEvent::Other => {}
        }
    }

    fn maintain_connectivity(&mut self) {
        let connected = self.swarm.connected_peers().count();
        if connected >= self.config.routing_low_water || self.config.bootstrap_peers.is_empty() {
            return;
        }
        debug!(connected, "Below routing low water, redialing bootstrap peers");
        for addr in &self.config.bootstrap_peers {
            if let Err(e) = self.swarm.dial(addr.clone()) {
                debug!(addr = %addr, error = %e, "Redial failed");
            }
        }
    }
}

/// [`PubSub`] over the gossip swarm. Own publishes are not delivered back.
#[derive(Clone)]
pub struct GossipPubSub {
    local_peer_id: String,
    commands: mpsc::Sender<Command>,
    hub: Arc<TopicHub>,
}

impl GossipPubSub {
    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    async fn request(&self, command: Command, rx: oneshot::Receiver<Result<()>>) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DefsError::Network("gossip service stopped".to_string()))?;
        rx.await
            .map_err(|_| DefsError::Network("gossip service stopped".to_string()))?
    }
}

#[async_trait]
impl PubSub for GossipPubSub {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Publish {
                topic: topic.to_string(),
                data,
                reply,
            },
            rx,
        )
        .await
    }

    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<PubSubMessage>> {
        // Take the receiver first so nothing arriving right after the join is lost
        let receiver = self.hub.subscribe(topic);
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Subscribe {
                topic: topic.to_string(),
                reply,
            },
            rx,
        )
        .await?;
        Ok(receiver)
    }
}

/// Build and spawn the gossip service described by `config`, if any
pub fn spawn_from_config(
    keypair: Keypair,
    config: &crate::NetworkConfig,
) -> Result<Option<(GossipPubSub, JoinHandle<()>)>> {
    if config.gossip_listen_addr.is_empty() {
        return Ok(None);
    }
    let mut gossip = GossipConfig::default().with_listen_addr(&config.gossip_listen_addr)?;
    for addr in &config.gossip_bootstrap {
        gossip = gossip.with_bootstrap_peer(addr)?;
    }
    match GossipService::spawn(keypair, gossip) {
        Ok(spawned) => Ok(Some(spawned)),
        Err(e) => {
            error!(error = %e, "Failed to start gossip service");
            Err(e)
        }
    }
}
