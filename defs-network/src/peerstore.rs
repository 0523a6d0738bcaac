//! Peer address book
//!
//! Addresses carry a time-to-live; expired ones are dropped lazily on read.
//! The whole table sits behind one mutex and no method calls out while
//! holding it.

use defs_core::error::{DefsError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Lifetime of addresses learned from a connected peer
pub const CONNECTED_ADDR_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Lifetime of addresses seen only in passing
pub const TEMP_ADDR_TTL: Duration = Duration::from_secs(2 * 60);

/// Lifetime for configured addresses (never expire)
pub const PERMANENT_ADDR_TTL: Duration = Duration::MAX;

/// A peer id with the addresses it can be reached at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrInfo {
    pub id: String,
    pub addrs: Vec<String>,
}

impl AddrInfo {
    pub fn new(id: impl Into<String>, addrs: Vec<String>) -> Self {
        Self {
            id: id.into(),
            addrs,
        }
    }

    /// Parse `node_id@address`
    pub fn parse(entry: &str) -> Result<Self> {
        match entry.split_once('@') {
            Some((id, addr)) if !id.is_empty() && !addr.is_empty() => {
                Ok(Self::new(id, vec![addr.to_string()]))
            }
            _ => Err(DefsError::Configuration(format!(
                "peer address must be node_id@address: {:?}",
                entry
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct AddrRecord {
    addr: String,
    /// `None` never expires
    expires: Option<Instant>,
}

impl AddrRecord {
    fn is_live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |t| t > now)
    }
}

/// Known peers and their addresses
#[derive(Debug)]
pub struct PeerStore {
    local_id: String,
    peers: Mutex<HashMap<String, Vec<AddrRecord>>>,
}

impl PeerStore {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Add or refresh addresses for `peer`; the local id is ignored.
    /// A longer TTL on an existing address wins.
    pub fn add_addrs(&self, peer: &str, addrs: &[String], ttl: Duration) {
        if peer == self.local_id || peer.is_empty() {
            return;
        }
        let expires = Instant::now().checked_add(ttl);
        let mut peers = self.peers.lock();
        let records = peers.entry(peer.to_string()).or_default();
        for addr in addrs {
            match records.iter_mut().find(|r| &r.addr == addr) {
                Some(record) => {
                    record.expires = match (record.expires, expires) {
                        (None, _) | (_, None) => None,
                        (Some(a), Some(b)) => Some(a.max(b)),
                    };
                }
                None => records.push(AddrRecord {
                    addr: addr.clone(),
                    expires,
                }),
            }
        }
    }

    /// Live addresses of `peer`
    pub fn addrs(&self, peer: &str) -> Vec<String> {
        let now = Instant::now();
        let mut peers = self.peers.lock();
        let Some(records) = peers.get_mut(peer) else {
            return Vec::new();
        };
        records.retain(|r| r.is_live(now));
        let addrs: Vec<String> = records.iter().map(|r| r.addr.clone()).collect();
        if addrs.is_empty() {
            peers.remove(peer);
        }
        addrs
    }

    pub fn peer_info(&self, peer: &str) -> Option<AddrInfo> {
        let addrs = self.addrs(peer);
        (!addrs.is_empty()).then(|| AddrInfo::new(peer, addrs))
    }

    /// Peers with at least one live address, sorted by id
    pub fn peers(&self) -> Vec<AddrInfo> {
        let now = Instant::now();
        let mut peers = self.peers.lock();
        peers.retain(|_, records| {
            records.retain(|r| r.is_live(now));
            !records.is_empty()
        });
        let mut infos: Vec<AddrInfo> = peers
            .iter()
            .map(|(id, records)| {
                AddrInfo::new(id.clone(), records.iter().map(|r| r.addr.clone()).collect())
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers().into_iter().map(|info| info.id).collect()
    }

    pub fn contains(&self, peer: &str) -> bool {
        !self.addrs(peer).is_empty()
    }

    pub fn remove_peer(&self, peer: &str) -> bool {
        self.peers.lock().remove(peer).is_some()
    }

    pub fn len(&self) -> usize {
        self.peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_add_and_query() {
        let store = PeerStore::new("self");
        store.add_addrs("b", &addrs(&["127.0.0.1:2"]), CONNECTED_ADDR_TTL);
        store.add_addrs("a", &addrs(&["127.0.0.1:1"]), CONNECTED_ADDR_TTL);
        store.add_addrs("a", &addrs(&["127.0.0.1:1", "127.0.0.1:3"]), TEMP_ADDR_TTL);

        assert_eq!(store.peer_ids(), vec!["a", "b"]);
        assert_eq!(store.addrs("a"), addrs(&["127.0.0.1:1", "127.0.0.1:3"]));
        assert!(store.contains("b"));
        assert!(!store.contains("c"));
    }

    #[test]
    fn test_ignores_self() {
        let store = PeerStore::new("self");
        store.add_addrs("self", &addrs(&["127.0.0.1:1"]), PERMANENT_ADDR_TTL);
        assert!(store.is_empty());
    }

    #[test]
    fn test_expiry() {
        let store = PeerStore::new("self");
        store.add_addrs("a", &addrs(&["127.0.0.1:1"]), Duration::ZERO);
        store.add_addrs("b", &addrs(&["127.0.0.1:2"]), PERMANENT_ADDR_TTL);
        assert!(store.addrs("a").is_empty());
        assert_eq!(store.peer_ids(), vec!["b"]);
    }

    #[test]
    fn test_longer_ttl_wins() {
        let store = PeerStore::new("self");
        store.add_addrs("a", &addrs(&["x"]), PERMANENT_ADDR_TTL);
        store.add_addrs("a", &addrs(&["x"]), Duration::ZERO);
        assert_eq!(store.addrs("a"), addrs(&["x"]));
    }

    #[test]
    fn test_parse_addr_info() {
        let info = AddrInfo::parse("node@127.0.0.1:4600").unwrap();
        assert_eq!(info.id, "node");
        assert_eq!(info.addrs, addrs(&["127.0.0.1:4600"]));
        assert!(AddrInfo::parse("@127.0.0.1:1").is_err());
        assert!(AddrInfo::parse("node@").is_err());
    }
}
