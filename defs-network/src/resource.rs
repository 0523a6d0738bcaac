//! Inbound admission control
//!
//! The connection budget is `max(800, 2 * high_water)`; the stream budget
//! scales with it. Allow-listed peers (by node id or IP) bypass both.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Floor of the inbound connection budget
pub const MIN_INBOUND_CONNECTIONS: usize = 800;

/// Inbound streams allowed per reserved connection
pub const STREAMS_PER_CONNECTION: usize = 4;

/// Budget sizes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub inbound_connections: usize,
    pub inbound_streams: usize,
    pub allow_list: HashSet<String>,
}

impl ResourceLimits {
    pub fn new(high_water: usize) -> Self {
        let inbound_connections = MIN_INBOUND_CONNECTIONS.max(high_water.saturating_mul(2));
        Self {
            inbound_connections,
            inbound_streams: inbound_connections.saturating_mul(STREAMS_PER_CONNECTION),
            allow_list: HashSet::new(),
        }
    }

    pub fn with_allow_list(mut self, entries: impl IntoIterator<Item = String>) -> Self {
        self.allow_list.extend(entries);
        self
    }

    /// Override both budgets directly
    pub fn with_budgets(mut self, connections: usize, streams: usize) -> Self {
        self.inbound_connections = connections;
        self.inbound_streams = streams;
        self
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Held for the lifetime of an admitted connection or stream.
/// Allow-listed admissions carry no permit.
#[derive(Debug)]
pub struct Admission {
    permit: Option<OwnedSemaphorePermit>,
}

impl Admission {
    pub fn is_unlimited(&self) -> bool {
        self.permit.is_none()
    }
}

/// Tracks inbound connection and stream budgets
#[derive(Debug)]
pub struct ResourceManager {
    limits: ResourceLimits,
    connections: Arc<Semaphore>,
    streams: Arc<Semaphore>,
    allow_list: RwLock<HashSet<String>>,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            connections: Arc::new(Semaphore::new(limits.inbound_connections)),
            streams: Arc::new(Semaphore::new(limits.inbound_streams)),
            allow_list: RwLock::new(limits.allow_list.clone()),
            limits,
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn allow(&self, entry: impl Into<String>) {
        self.allow_list.write().insert(entry.into());
    }

    pub fn is_allowed(&self, entry: &str) -> bool {
        self.allow_list.read().contains(entry)
    }

    /// Reserve a connection slot for a remote IP
    pub fn admit_connection(&self, remote: IpAddr) -> Option<Admission> {
        if self.is_allowed(&remote.to_string()) {
            return Some(Admission { permit: None });
        }
        match self.connections.clone().try_acquire_owned() {
            Ok(permit) => Some(Admission {
                permit: Some(permit),
            }),
            Err(_) => {
                debug!(remote = %remote, "Inbound connection budget exhausted");
                None
            }
        }
    }

    /// Reserve a stream slot for a peer
    pub fn admit_stream(&self, peer: &str) -> Option<Admission> {
        if self.is_allowed(peer) {
            return Some(Admission { permit: None });
        }
        match self.streams.clone().try_acquire_owned() {
            Ok(permit) => Some(Admission {
                permit: Some(permit),
            }),
            Err(_) => {
                debug!(peer = %peer, "Inbound stream budget exhausted");
                None
            }
        }
    }

    pub fn available_connections(&self) -> usize {
        self.connections.available_permits()
    }

    pub fn available_streams(&self) -> usize {
        self.streams.available_permits()
    }
}
