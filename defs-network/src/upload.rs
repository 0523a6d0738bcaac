//! Shard upload on `/defs/slice/upload/1.0.0`
//!
//! The request is one frame holding a serialized shard object. The receiver
//! stages it to a temporary file, reads the header segments, checks content
//! hash and owner signature, moves it into
//! `files/slices/<node_id>/<file_id>/<shard_hash>` and answers
//! `{code, msg, data}` with `data` set to its node id on success.

use crate::events::{ShardStored, UploadServed};
use crate::framing::{FramedStream, StreamPolicy, MAX_SHARD_MESSAGE};
use crate::host::{Host, ProtocolStream, StreamHandler};
use crate::UPLOAD_PROTOCOL;
use async_trait::async_trait;
use bytes::Bytes;
use defs_core::error::{DefsError, Result};
use defs_core::segment;
use defs_core::shard::{field, Shard, ShardHeader};
use defs_core::{crypto, EventBus};
use defs_storage::LocalShardStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const CODE_OK: i32 = 200;
pub const CODE_BAD_REQUEST: i32 = 400;
pub const CODE_STORAGE_FAILURE: i32 = 500;

/// Reply to an upload request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub code: i32,
    pub msg: String,
    pub data: Vec<u8>,
}

impl UploadResponse {
    pub fn ok(node_id: &str) -> Self {
        Self {
            code: CODE_OK,
            msg: "stored".to_string(),
            data: node_id.as_bytes().to_vec(),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }

    /// Node id of the holder, for successful replies
    pub fn holder(&self) -> Option<String> {
        if self.is_ok() {
            String::from_utf8(self.data.clone()).ok()
        } else {
            None
        }
    }
}

/// What a request turned out to be, before it is persisted
struct Received {
    header: ShardHeader,
    total_pieces: usize,
}

/// Receiving side of shard upload
#[derive(Clone)]
pub struct UploadHandler {
    store: Arc<LocalShardStore>,
    events: EventBus,
    policy: StreamPolicy,
}

impl UploadHandler {
    pub fn new(store: Arc<LocalShardStore>, events: EventBus, policy: StreamPolicy) -> Self {
        Self {
            store,
            events,
            policy,
        }
    }

    /// Register on `host` under the upload protocol id
    pub fn register(self, host: &dyn Host) {
        host.set_stream_handler(UPLOAD_PROTOCOL, Arc::new(self));
    }

    fn staging_path(&self) -> PathBuf {
        self.store
            .roots()
            .uploads()
            .join(format!(".incoming-{}.tmp", uuid::Uuid::new_v4()))
    }

    /// Read and check a staged object. Any failure here is the sender's fault.
    fn inspect(path: &Path) -> Result<Received> {
        let mut reader = segment::open_file(path)?;
        let Shard { header, content } = Shard::read(&mut reader)?;
        header.check_layout()?;
        if hex::encode(crypto::sha256(&content)) != header.slice_hash {
            return Err(DefsError::Corrupt(field::SLICEHASH.to_string()));
        }
        header.verify_signature()?;
        if !header.slice_table.contains_hash(&header.slice_hash) {
            return Err(DefsError::Corrupt(field::SLICETABLE.to_string()));
        }
        let total_pieces = header.slice_table.total_pieces();
        Ok(Received {
            header,
            total_pieces,
        })
    }

    /// Stage, verify and persist one object; maps failures to reply codes
    pub fn accept(&self, peer: &str, object: &[u8]) -> UploadResponse {
        let staged = self.staging_path();
        let response = self.accept_staged(peer, object, &staged);
        if staged.exists() {
            if let Err(e) = std::fs::remove_file(&staged) {
                warn!(path = %staged.display(), error = %e, "Staged upload not removed");
            }
        }
        response
    }

    fn accept_staged(&self, peer: &str, object: &[u8], staged: &Path) -> UploadResponse {
        if let Err(e) = std::fs::write(staged, object) {
            warn!(peer, error = %e, "Failed to stage upload");
            return UploadResponse::error(CODE_STORAGE_FAILURE, e.to_string());
        }

        let received = match Self::inspect(staged) {
            Ok(received) => received,
            Err(e) => {
                warn!(peer, error = %e, kind = e.kind(), "Rejected shard upload");
                return UploadResponse::error(CODE_BAD_REQUEST, e.to_string());
            }
        };
        let header = &received.header;

        match self
            .store
            .put_from(&header.file_id, &header.slice_hash, staged)
        {
            Ok(path) => {
                info!(
                    peer,
                    file_id = %header.file_id,
                    index = header.index,
                    total_pieces = received.total_pieces,
                    "Shard stored"
                );
                self.events.publish(ShardStored {
                    file_id: header.file_id.clone(),
                    shard_hash: header.slice_hash.clone(),
                    index: header.index,
                    total_pieces: received.total_pieces,
                    from_peer: peer.to_string(),
                    path,
                });
                UploadResponse::ok(self.store.node_id())
            }
            // Ids that do not form a valid path are the sender's fault
            Err(DefsError::Storage(msg)) if msg.starts_with("invalid path component") => {
                warn!(peer, error = %msg, "Rejected shard upload");
                UploadResponse::error(CODE_BAD_REQUEST, msg)
            }
            Err(e) => {
                warn!(peer, file_id = %header.file_id, error = %e, "Failed to persist shard");
                UploadResponse::error(CODE_STORAGE_FAILURE, e.to_string())
            }
        }
    }
}

#[async_trait]
impl StreamHandler for UploadHandler {
    async fn handle(&self, stream: ProtocolStream) -> Result<()> {
        let peer = stream.peer.clone();
        let mut framed = FramedStream::new(stream.io, MAX_SHARD_MESSAGE, self.policy.clone());

        let response = match framed.read_frame().await {
            Ok(object) => {
                debug!(peer = %peer, size = object.len(), "Upload request received");
                let store_handler = self.clone();
                let peer_id = peer.clone();
                tokio::task::spawn_blocking(move || store_handler.accept(&peer_id, &object))
                    .await
                    .unwrap_or_else(|e| UploadResponse::error(CODE_STORAGE_FAILURE, e.to_string()))
            }
            Err(e @ DefsError::MessageTooLarge { .. }) => {
                warn!(peer = %peer, error = %e, "Upload request too large");
                UploadResponse::error(CODE_BAD_REQUEST, e.to_string())
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, kind = e.kind(), "Upload request not read");
                return Err(e);
            }
        };

        self.events.publish(UploadServed {
            peer: peer.clone(),
            code: response.code,
        });
        framed.write_json(&response).await?;
        framed.close().await
    }
}

/// Send one shard object to `peer`; returns the holder's node id
pub async fn send_shard(
    host: &dyn Host,
    peer: &str,
    object: Bytes,
    policy: &StreamPolicy,
) -> Result<String> {
    if object.len() > MAX_SHARD_MESSAGE {
        return Err(DefsError::MessageTooLarge {
            size: object.len(),
            max: MAX_SHARD_MESSAGE,
        });
    }
    let stream = host.new_stream(peer, UPLOAD_PROTOCOL).await?;
    let mut framed = FramedStream::new(stream.io, MAX_SHARD_MESSAGE, policy.clone());
    framed.write_frame(object).await?;
    let response: UploadResponse = framed.read_json().await?;

    match response.holder() {
        Some(holder) => Ok(holder),
        None if response.is_ok() => Err(DefsError::Network(format!(
            "{} replied without a holder id",
            peer
        ))),
        None => Err(DefsError::Network(format!(
            "{} rejected shard ({}): {}",
            peer, response.code, response.msg
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use defs_core::{ErasureConfig, FileMeta, PauseRegistry, PipelineConfig, PrivateKey, ShardPipeline};
    use defs_storage::StorageConfig;

    fn build_objects(dir: &Path) -> (Arc<LocalShardStore>, defs_core::UploadedFile) {
        let source = Arc::new(LocalShardStore::open(StorageConfig::new(dir.join("src")), "sender").unwrap());
        let pipeline = ShardPipeline::new(
            PipelineConfig {
                workers: 1,
                ..PipelineConfig::default()
            },
            PauseRegistry::new(),
            EventBus::new(),
        )
        .unwrap();
        let uploaded = pipeline
            .upload(
                b"contents of a shared file",
                FileMeta::new("shared.txt"),
                &PrivateKey::generate(),
                source.as_ref(),
                Some(ErasureConfig::new(2, 1).unwrap()),
            )
            .unwrap();
        (source, uploaded)
    }

    fn receiver(dir: &Path) -> (UploadHandler, Arc<LocalShardStore>, EventBus) {
        let store = Arc::new(LocalShardStore::open(StorageConfig::new(dir.join("dst")), "receiver").unwrap());
        let events = EventBus::new();
        (
            UploadHandler::new(store.clone(), events.clone(), StreamPolicy::default()),
            store,
            events,
        )
    }

    #[test]
    fn test_accept_valid_shard() {
        let dir = tempfile::tempdir().unwrap();
        let (source, uploaded) = build_objects(dir.path());
        let (handler, store, events) = receiver(dir.path());

        let stored = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = stored.clone();
        events.subscribe(move |e: &ShardStored| sink.lock().push(e.clone()));

        let shard = &uploaded.shards[2];
        let object = source.read(&uploaded.file_id, &shard.hash).unwrap();
        let response = handler.accept("sender", &object);

        assert_eq!(response.code, CODE_OK);
        assert_eq!(response.holder().as_deref(), Some("receiver"));
        assert!(store.contains(&uploaded.file_id, &shard.hash));

        let stored = stored.lock();
        assert_eq!(stored[0].index, 2);
        assert_eq!(stored[0].total_pieces, 2);
        assert_eq!(stored[0].from_peer, "sender");

        // Nothing left in staging
        let leftovers: Vec<_> = std::fs::read_dir(store.roots().uploads()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_malformed_payload_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, store, _) = receiver(dir.path());

        let response = handler.accept("sender", b"definitely not a shard object");
        assert_eq!(response.code, CODE_BAD_REQUEST);
        assert!(response.holder().is_none());
        assert!(store.list_files().unwrap().is_empty());
    }

    #[test]
    fn test_tampered_content_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let (source, uploaded) = build_objects(dir.path());
        let (handler, store, _) = receiver(dir.path());

        let shard = &uploaded.shards[0];
        let mut parsed =
            defs_core::Shard::from_bytes(&source.read(&uploaded.file_id, &shard.hash).unwrap()).unwrap();
        parsed.content[0] ^= 0xff;
        let response = handler.accept("sender", &parsed.to_bytes().unwrap());

        assert_eq!(response.code, CODE_BAD_REQUEST);
        assert!(!store.contains(&uploaded.file_id, &shard.hash));
    }

    #[test]
    fn test_wrong_batch_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let (source, uploaded) = build_objects(dir.path());
        let (handler, store, _) = receiver(dir.path());

        let shard = &uploaded.shards[1];
        let mut parsed =
            defs_core::Shard::from_bytes(&source.read(&uploaded.file_id, &shard.hash).unwrap()).unwrap();
        parsed.header.batch = 4;
        let response = handler.accept("sender", &parsed.to_bytes().unwrap());

        assert_eq!(response.code, CODE_BAD_REQUEST);
        assert!(!store.contains(&uploaded.file_id, &shard.hash));
    }

    #[test]
    fn test_response_wire_format() {
        let json = serde_json::to_value(UploadResponse::ok("n1")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"code": 200, "msg": "stored", "data": [110, 49]})
        );
    }
}
