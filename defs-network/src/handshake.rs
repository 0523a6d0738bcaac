//! Peer handshake on `/defs/handshake/1.0.0`
//!
//! Both sides send one JSON message listing up to 100 known peers (never
//! themselves). The dialer retries up to three times; attempt `n > 1` waits
//! `min(10s * 2^(n-2), 50s)` plus uniform jitter in `[0, delay/2)` and
//! releases its connection to the target first. Learned peers are merged
//! into the peerstore with the connected-address lifetime.

use crate::events::{HandshakeAttempted, PeerConnected};
use crate::framing::{FramedStream, StreamPolicy, MAX_CONTROL_MESSAGE};
use crate::host::{Host, ProtocolStream, StreamHandler};
use crate::peerstore::{AddrInfo, CONNECTED_ADDR_TTL};
use crate::HANDSHAKE_PROTOCOL;
use async_trait::async_trait;
use defs_core::error::{DefsError, Result};
use defs_core::EventBus;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Version string carried in handshake messages
pub const HANDSHAKE_VERSION: &str = "1.0.0";

/// Peers advertised per handshake
pub const MAX_ADVERTISED_PEERS: usize = 100;

pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(50);

/// Message exchanged in both directions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    pub version: String,
    pub node_id: String,
    pub known_peers: Vec<AddrInfo>,
    /// Addresses the sender listens on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listen_addrs: Vec<String>,
}

/// Handshake tuning
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub version: String,
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Overall deadline for one `handshake` call
    pub deadline: Option<Duration>,
    pub max_peers: usize,
    pub peer_ttl: Duration,
    pub stream_policy: StreamPolicy,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            version: HANDSHAKE_VERSION.to_string(),
            attempts: DEFAULT_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            deadline: None,
            max_peers: MAX_ADVERTISED_PEERS,
            peer_ttl: CONNECTED_ADDR_TTL,
            stream_policy: StreamPolicy::default(),
        }
    }
}

impl HandshakeConfig {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the retry schedule; the cap keeps the 10:50 ratio of the default
    pub fn with_base_delay(mut self, base: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = base.saturating_mul(5);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_stream_policy(mut self, policy: StreamPolicy) -> Self {
        self.stream_policy = policy;
        self
    }
}

/// Delay before attempt `attempt` (1-indexed), without jitter
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    base.saturating_mul(2u32.saturating_pow(attempt - 2)).min(max)
}

/// `delay` plus uniform jitter in `[0, delay/2)`
pub fn with_jitter<R: Rng + ?Sized>(delay: Duration, rng: &mut R) -> Duration {
    let half = (delay / 2).as_nanos() as u64;
    if half == 0 {
        return delay;
    }
    delay + Duration::from_nanos(rng.gen_range(0..half))
}

/// Dialer and responder of the handshake protocol
pub struct HandshakeService {
    host: Arc<dyn Host>,
    events: EventBus,
    config: HandshakeConfig,
}

impl HandshakeService {
    pub fn new(host: Arc<dyn Host>, events: EventBus, config: HandshakeConfig) -> Self {
        Self {
            host,
            events,
            config,
        }
    }

    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    /// Register the responder on the host
    pub fn register(self: &Arc<Self>) {
        self.host.set_stream_handler(
            HANDSHAKE_PROTOCOL,
            Arc::new(HandshakeHandler {
                service: self.clone(),
            }),
        );
    }

    /// Message describing this node
    pub fn local_message(&self) -> HandshakeMessage {
        let local = self.host.local_peer_id();
        let known_peers = self
            .host
            .peerstore()
            .peers()
            .into_iter()
            .filter(|p| p.id != local && !p.addrs.is_empty())
            .take(self.config.max_peers)
            .collect();
        HandshakeMessage {
            version: self.config.version.clone(),
            node_id: local.to_string(),
            known_peers,
            listen_addrs: self.host.listen_addrs(),
        }
    }

    /// Merge a remote message into the peerstore; returns the number of
    /// third-party peers learned
    pub fn merge(&self, remote: &HandshakeMessage, dialed: &[String]) -> usize {
        let store = self.host.peerstore();
        let local = self.host.local_peer_id();
        let ttl = self.config.peer_ttl;

        store.add_addrs(&remote.node_id, dialed, ttl);
        store.add_addrs(&remote.node_id, &remote.listen_addrs, ttl);

        let mut learned = 0;
        for peer in remote.known_peers.iter().take(self.config.max_peers) {
            if peer.id.is_empty() || peer.id == local || peer.id == remote.node_id {
                continue;
            }
            if peer.addrs.is_empty() {
                continue;
            }
            store.add_addrs(&peer.id, &peer.addrs, ttl);
            learned += 1;
        }
        learned
    }

    /// Handshake with `target`, applying the configured deadline if any
    pub async fn handshake(&self, target: &AddrInfo) -> Result<usize> {
        let deadline = self.config.deadline.map(|d| Instant::now() + d);
        self.handshake_until(target, deadline).await
    }

    /// Handshake with `target`, giving up on remaining attempts at `deadline`
    pub async fn handshake_until(&self, target: &AddrInfo, deadline: Option<Instant>) -> Result<usize> {
        let attempts = self.config.attempts.max(1);
        let mut made = 0;
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = {
                    let mut rng = rand::thread_rng();
                    with_jitter(
                        backoff_delay(attempt, self.config.base_delay, self.config.max_delay),
                        &mut rng,
                    )
                };
                if let Err(e) = self.host.close_peer(&target.id).await {
                    debug!(peer = %target.id, error = %e, "Release before retry failed");
                }
                if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                    last_error = format!("deadline elapsed before attempt {}", attempt);
                    break;
                }
                debug!(
                    peer = %target.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying handshake"
                );
                tokio::time::sleep(delay).await;
            }

            made = attempt;
            let result = match deadline {
                Some(d) => tokio::time::timeout_at(d, self.attempt(target))
                    .await
                    .unwrap_or(Err(DefsError::StreamTimeout)),
                None => self.attempt(target).await,
            };
            self.events.publish(HandshakeAttempted {
                peer: target.id.clone(),
                attempt,
                success: result.is_ok(),
            });

            match result {
                Ok(learned) => {
                    info!(peer = %target.id, attempt, learned, "Handshake complete");
                    self.events.publish(PeerConnected {
                        peer: target.id.clone(),
                        learned,
                    });
                    return Ok(learned);
                }
                Err(DefsError::Cancelled) => return Err(DefsError::Cancelled),
                Err(e) => {
                    warn!(peer = %target.id, attempt, error = %e, kind = e.kind(), "Handshake attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(DefsError::HandshakeFailed {
            attempts: made,
            cause: last_error,
        })
    }

    async fn attempt(&self, target: &AddrInfo) -> Result<usize> {
        self.host.connect(target).await?;
        let stream = self.host.new_stream(&target.id, HANDSHAKE_PROTOCOL).await?;
        let mut framed = FramedStream::new(
            stream.io,
            MAX_CONTROL_MESSAGE,
            self.config.stream_policy.clone(),
        );
        framed.write_json(&self.local_message()).await?;
        let reply: HandshakeMessage = framed.read_json().await?;
        if reply.node_id != target.id {
            return Err(DefsError::Network(format!(
                "handshake reply from {} while dialing {}",
                reply.node_id, target.id
            )));
        }
        Ok(self.merge(&reply, &target.addrs))
    }

    async fn respond(&self, stream: ProtocolStream) -> Result<()> {
        let peer = stream.peer.clone();
        let mut framed = FramedStream::new(
            stream.io,
            MAX_CONTROL_MESSAGE,
            self.config.stream_policy.clone(),
        );
        let remote: HandshakeMessage = framed.read_json().await?;
        if remote.node_id.is_empty() || remote.node_id != peer {
            return Err(DefsError::Network(format!(
                "handshake node id {:?} does not match stream peer {}",
                remote.node_id, peer
            )));
        }
        if remote.version != self.config.version {
            debug!(peer = %peer, version = %remote.version, "Handshake version differs");
        }

        let learned = self.merge(&remote, &[]);
        framed.write_json(&self.local_message()).await?;
        framed.close().await?;

        debug!(peer = %peer, learned, "Handshake answered");
        self.events.publish(PeerConnected { peer, learned });
        Ok(())
    }
}

/// Inbound side of the handshake protocol
pub struct HandshakeHandler {
    service: Arc<HandshakeService>,
}

#[async_trait]
impl StreamHandler for HandshakeHandler {
    async fn handle(&self, stream: ProtocolStream) -> Result<()> {
        self.service.respond(stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peerstore::PeerStore;
    use crate::tcp::{TcpHost, TcpHostConfig};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_backoff_schedule() {
        let base = DEFAULT_BASE_DELAY;
        let max = DEFAULT_MAX_DELAY;
        assert_eq!(backoff_delay(1, base, max), Duration::ZERO);
        assert_eq!(backoff_delay(2, base, max), Duration::from_secs(10));
        assert_eq!(backoff_delay(3, base, max), Duration::from_secs(20));
        assert_eq!(backoff_delay(4, base, max), Duration::from_secs(40));
        assert_eq!(backoff_delay(5, base, max), Duration::from_secs(50));
        assert_eq!(backoff_delay(40, base, max), Duration::from_secs(50));
    }

    #[test]
    fn test_zero_delay_has_no_jitter() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(with_jitter(Duration::ZERO, &mut rng), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn prop_delay_within_bounds(attempt in 2u32..8, seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let d = backoff_delay(attempt, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY);
            let expected = Duration::from_secs((10u64 << (attempt - 2)).min(50));
            prop_assert_eq!(d, expected);

            let waited = with_jitter(d, &mut rng);
            prop_assert!(waited >= d);
            prop_assert!(waited < d + d / 2);
        }
    }

    async fn service(id: &str) -> (Arc<TcpHost>, Arc<HandshakeService>, EventBus) {
        let host = TcpHost::bind(id, TcpHostConfig::default()).await.unwrap();
        let events = EventBus::new();
        let service = Arc::new(HandshakeService::new(
            host.clone(),
            events.clone(),
            HandshakeConfig::default(),
        ));
        service.register();
        (host, service, events)
    }

    #[tokio::test]
    async fn test_handshake_exchanges_peers() {
        let (a, a_service, a_events) = service("node-a").await;
        let (b, _b_service, _) = service("node-b").await;
        b.peerstore()
            .add_addrs("node-c", &["127.0.0.1:9".to_string()], CONNECTED_ADDR_TTL);

        let connected = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = connected.clone();
        a_events.subscribe(move |e: &PeerConnected| sink.lock().push(e.clone()));

        let learned = a_service
            .handshake(&AddrInfo::new("node-b", b.listen_addrs()))
            .await
            .unwrap();
        assert_eq!(learned, 1);
        assert!(a.peerstore().contains("node-b"));
        assert_eq!(a.peerstore().addrs("node-c"), vec!["127.0.0.1:9".to_string()]);

        // Responder learned the dialer's listen address
        assert_eq!(b.peerstore().addrs("node-a"), a.listen_addrs());
        assert_eq!(connected.lock()[0].peer, "node-b");
    }

    #[tokio::test]
    async fn test_local_message_caps_and_excludes_self() {
        let (host, service, _) = service("node-a").await;
        for i in 0..150 {
            host.peerstore().add_addrs(
                &format!("peer-{:03}", i),
                &[format!("127.0.0.1:{}", 1000 + i)],
                CONNECTED_ADDR_TTL,
            );
        }
        let message = service.local_message();
        assert_eq!(message.node_id, "node-a");
        assert_eq!(message.known_peers.len(), MAX_ADVERTISED_PEERS);
        assert!(message.known_peers.iter().all(|p| p.id != "node-a"));
    }

    /// Host whose dials are always refused
    struct RefusingHost {
        peerstore: PeerStore,
    }

    #[async_trait]
    impl Host for RefusingHost {
        fn local_peer_id(&self) -> &str {
            "node-a"
        }

        fn peerstore(&self) -> &PeerStore {
            &self.peerstore
        }

        fn listen_addrs(&self) -> Vec<String> {
            Vec::new()
        }

        async fn connect(&self, info: &AddrInfo) -> Result<()> {
            Err(DefsError::Network(format!("connection to {} refused", info.id)))
        }

        async fn new_stream(&self, peer: &str, _protocol: &str) -> Result<ProtocolStream> {
            Err(DefsError::Network(format!("{} not connected", peer)))
        }

        async fn close_peer(&self, _peer: &str) -> Result<()> {
            Ok(())
        }

        fn set_stream_handler(&self, _protocol: &str, _handler: Arc<dyn StreamHandler>) {}

        fn remove_stream_handler(&self, _protocol: &str) {}

        fn connected_peers(&self) -> Vec<String> {
            Vec::new()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_remaining_attempts() {
        let host = Arc::new(RefusingHost {
            peerstore: PeerStore::new("node-a"),
        });
        let events = EventBus::new();
        let attempts = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = attempts.clone();
        events.subscribe(move |e: &HandshakeAttempted| sink.lock().push(e.attempt));

        let service = HandshakeService::new(
            host,
            events,
            HandshakeConfig::default().with_deadline(Duration::from_secs(15)),
        );
        let target = AddrInfo::new("ghost", vec!["127.0.0.1:1".to_string()]);

        // Attempt 2 starts 10-15s in; attempt 3 would wait 20-30s more
        let start = Instant::now();
        let err = service.handshake(&target).await.unwrap_err();
        let elapsed = start.elapsed();

        match err {
            DefsError::HandshakeFailed { attempts, cause } => {
                assert_eq!(attempts, 2);
                assert!(cause.contains("deadline"), "{cause}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*attempts.lock(), vec![1, 2]);
        assert!(elapsed >= Duration::from_secs(10), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(20), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_deadline_all_attempts_run() {
        let host = Arc::new(RefusingHost {
            peerstore: PeerStore::new("node-a"),
        });
        let service = HandshakeService::new(host, EventBus::new(), HandshakeConfig::default());
        let target = AddrInfo::new("ghost", vec!["127.0.0.1:1".to_string()]);

        let start = Instant::now();
        let err = service.handshake(&target).await.unwrap_err();
        assert!(matches!(err, DefsError::HandshakeFailed { attempts: 3, .. }));
        // 10s and 20s waits, each plus under half again of jitter
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(45), "{elapsed:?}");
    }

    #[test]
    fn test_message_wire_format() {
        let message = HandshakeMessage {
            version: "1.0.0".to_string(),
            node_id: "node-a".to_string(),
            known_peers: vec![AddrInfo::new("node-b", vec!["127.0.0.1:1".to_string()])],
            listen_addrs: Vec::new(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "version": "1.0.0",
                "node_id": "node-a",
                "known_peers": [{"id": "node-b", "addrs": ["127.0.0.1:1"]}]
            })
        );
    }
}
