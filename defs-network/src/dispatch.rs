//! Shard placement on remote peers
//!
//! The dispatcher reacts to [`SliceUploaded`] events: it reads the stored
//! object, picks a peer (one holding nothing of the same file if possible,
//! never ourselves) and sends it over the upload protocol. It is the only
//! layer that retries a failed send. A shard that exhausts `max_retries` or
//! finds no candidate is parked as [`ShardStatus::Pending`] and sent again
//! when a new peer connects.

use crate::events::PeerConnected;
use crate::framing::StreamPolicy;
use crate::host::Host;
use crate::upload::send_shard;
use bytes::Bytes;
use defs_core::pipeline::SliceUploaded;
use defs_core::{EventBus, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_INTERVAL_SECS};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Dispatcher retry budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Sends per shard before it is parked
    pub max_retries: u32,
    /// Pause between sends of the same shard
    #[serde(with = "duration_secs")]
    pub retry_interval: Duration,
    #[serde(skip)]
    pub policy: StreamPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS),
            policy: StreamPolicy::default(),
        }
    }
}

impl DispatchConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_policy(mut self, policy: StreamPolicy) -> Self {
        self.policy = policy;
        self
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Where a shard ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardStatus {
    Stored { peer: String },
    Pending,
}

#[derive(Debug, Default)]
struct FileTask {
    assignments: BTreeMap<u32, String>,
    pending: BTreeMap<u32, SliceUploaded>,
    attempts: HashMap<u32, u32>,
}

/// In-memory record of shard placement, keyed by file id
#[derive(Debug, Default)]
pub struct UploadTaskState {
    files: Mutex<HashMap<String, FileTask>>,
}

impl UploadTaskState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `peer` as holder of shard `index`
    pub fn assign(&self, file_id: &str, index: u32, peer: &str) {
        let mut files = self.files.lock();
        let task = files.entry(file_id.to_string()).or_default();
        task.pending.remove(&index);
        task.assignments.insert(index, peer.to_string());
    }

    /// Count one more send of shard `index`; returns the new total
    pub fn record_attempt(&self, file_id: &str, index: u32) -> u32 {
        let mut files = self.files.lock();
        let attempts = files
            .entry(file_id.to_string())
            .or_default()
            .attempts
            .entry(index)
            .or_insert(0);
        *attempts += 1;
        *attempts
    }

    pub fn attempts(&self, file_id: &str, index: u32) -> u32 {
        self.files
            .lock()
            .get(file_id)
            .and_then(|t| t.attempts.get(&index).copied())
            .unwrap_or(0)
    }

    pub fn mark_pending(&self, slice: SliceUploaded) {
        let mut files = self.files.lock();
        let task = files.entry(slice.file_id.clone()).or_default();
        task.assignments.remove(&slice.index);
        task.pending.insert(slice.index, slice);
    }

    /// Drain every pending shard, resetting its attempt counter
    pub fn take_pending(&self) -> Vec<SliceUploaded> {
        let mut files = self.files.lock();
        let mut drained = Vec::new();
        for task in files.values_mut() {
            for (index, slice) in std::mem::take(&mut task.pending) {
                task.attempts.remove(&index);
                drained.push(slice);
            }
        }
        drained
    }

    pub fn is_pending(&self, file_id: &str, index: u32) -> bool {
        self.files
            .lock()
            .get(file_id)
            .is_some_and(|t| t.pending.contains_key(&index))
    }

    pub fn pending_count(&self) -> usize {
        self.files.lock().values().map(|t| t.pending.len()).sum()
    }

    pub fn status(&self, file_id: &str, index: u32) -> Option<ShardStatus> {
        let files = self.files.lock();
        let task = files.get(file_id)?;
        if let Some(peer) = task.assignments.get(&index) {
            Some(ShardStatus::Stored { peer: peer.clone() })
        } else if task.pending.contains_key(&index) {
            Some(ShardStatus::Pending)
        } else {
            None
        }
    }

    /// Shard index to holder
    pub fn assignments(&self, file_id: &str) -> BTreeMap<u32, String> {
        self.files
            .lock()
            .get(file_id)
            .map(|t| t.assignments.clone())
            .unwrap_or_default()
    }

    pub fn peers_holding(&self, file_id: &str) -> HashSet<String> {
        self.files
            .lock()
            .get(file_id)
            .map(|t| t.assignments.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Sends locally stored shards to remote peers
pub struct UploadDispatcher {
    host: Arc<dyn Host>,
    state: Arc<UploadTaskState>,
    config: DispatchConfig,
}

impl UploadDispatcher {
    pub fn new(host: Arc<dyn Host>, config: DispatchConfig) -> Self {
        Self {
            host,
            state: Arc::new(UploadTaskState::new()),
            config,
        }
    }

    pub fn state(&self) -> &Arc<UploadTaskState> {
        &self.state
    }

    /// Dispatch every [`SliceUploaded`] published on `events`, and retry
    /// parked shards on every [`PeerConnected`]
    pub fn attach(self: &Arc<Self>, events: &EventBus) {
        let dispatcher = self.clone();
        events.subscribe_async(true, move |slice: SliceUploaded| {
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher.dispatch(slice).await;
            }
        });

        let dispatcher = self.clone();
        events.subscribe_async(false, move |event: PeerConnected| {
            let dispatcher = dispatcher.clone();
            async move {
                if dispatcher.state.pending_count() > 0 {
                    debug!(peer = %event.peer, "New peer, redispatching pending shards");
                    dispatcher.redispatch_pending().await;
                }
            }
        });
    }

    /// Candidate holder for a shard of `file_id`. Peers already holding part
    /// of the file, or in `tried`, are used only when nothing else is left.
    pub fn select_peer(&self, file_id: &str, tried: &HashSet<String>) -> Option<String> {
        let local = self.host.local_peer_id();
        let candidates: Vec<String> = self
            .host
            .peerstore()
            .peer_ids()
            .into_iter()
            .filter(|p| p != local)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let holding = self.state.peers_holding(file_id);
        let mut rng = rand::thread_rng();
        let fresh: Vec<&String> = candidates
            .iter()
            .filter(|p| !holding.contains(*p) && !tried.contains(*p))
            .collect();
        if let Some(peer) = fresh.choose(&mut rng) {
            return Some((*peer).clone());
        }
        let untried: Vec<&String> = candidates.iter().filter(|p| !tried.contains(*p)).collect();
        untried
            .choose(&mut rng)
            .map(|p| (*p).clone())
            .or_else(|| candidates.choose(&mut rng).cloned())
    }

    /// Send one shard, retrying up to the configured budget
    pub async fn dispatch(&self, slice: SliceUploaded) -> ShardStatus {
        let object = match tokio::fs::read(&slice.path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(
                    file_id = %slice.file_id,
                    index = slice.index,
                    path = %slice.path.display(),
                    error = %e,
                    "Stored shard unreadable, parking"
                );
                self.state.mark_pending(slice);
                return ShardStatus::Pending;
            }
        };

        let mut tried = HashSet::new();
        loop {
            let Some(peer) = self.select_peer(&slice.file_id, &tried) else {
                debug!(file_id = %slice.file_id, index = slice.index, "No peer to send shard to");
                break;
            };
            let attempt = self.state.record_attempt(&slice.file_id, slice.index);

            match send_shard(self.host.as_ref(), &peer, object.clone(), &self.config.policy).await {
                Ok(holder) => {
                    info!(
                        file_id = %slice.file_id,
                        index = slice.index,
                        peer = %holder,
                        attempt,
                        "Shard placed"
                    );
                    self.state.assign(&slice.file_id, slice.index, &holder);
                    return ShardStatus::Stored { peer: holder };
                }
                Err(e) => {
                    warn!(
                        file_id = %slice.file_id,
                        index = slice.index,
                        peer = %peer,
                        attempt,
                        error = %e,
                        kind = e.kind(),
                        "Shard send failed"
                    );
                    tried.insert(peer);
                }
            }

            if attempt >= self.config.max_retries {
                break;
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }

        warn!(file_id = %slice.file_id, index = slice.index, "Shard parked as pending");
        self.state.mark_pending(slice);
        ShardStatus::Pending
    }

    /// Try every parked shard again with a fresh budget
    pub async fn redispatch_pending(&self) -> Vec<ShardStatus> {
        let pending = self.state.take_pending();
        let mut results = Vec::with_capacity(pending.len());
        for slice in pending {
            results.push(self.dispatch(slice).await);
        }
        results
    }
}
