//! Events published by the network layer on the node's [`EventBus`]
//!
//! [`EventBus`]: defs_core::EventBus

use defs_core::Event;
use std::path::PathBuf;

/// A handshake completed and the remote peer was merged into the peerstore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnected {
    pub peer: String,
    /// Peers learned from the remote side
    pub learned: usize,
}

impl Event for PeerConnected {
    const NAME: &'static str = "network.peer_connected";
}

/// One outbound handshake attempt finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeAttempted {
    pub peer: String,
    pub attempt: u32,
    pub success: bool,
}

impl Event for HandshakeAttempted {
    const NAME: &'static str = "network.handshake_attempted";
}

/// A shard received over the upload protocol was persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStored {
    pub file_id: String,
    pub shard_hash: String,
    pub index: u32,
    /// Data pieces of the file, from the slice table
    pub total_pieces: usize,
    pub from_peer: String,
    pub path: PathBuf,
}

impl Event for ShardStored {
    const NAME: &'static str = "storage.shard_stored";
}

/// An upload request was answered with `code`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadServed {
    pub peer: String,
    pub code: i32,
}

impl Event for UploadServed {
    const NAME: &'static str = "network.upload_served";
}

/// A delete request was applied to the local store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardsDeleted {
    pub file_id: String,
    pub deleted: usize,
    pub kept: usize,
    pub dir_removed: bool,
}

impl Event for ShardsDeleted {
    const NAME: &'static str = "storage.shards_deleted";
}
