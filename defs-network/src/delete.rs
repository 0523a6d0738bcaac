//! Owner-authorized shard deletion over pubsub
//!
//! The owner publishes `{file_id, pub_key_hash}` on the delete topic, wrapped
//! in a [`SignedEnvelope`]. Every node walks its shards of that file and
//! removes those whose embedded P2PKH locking script names the same key hash.
//! The file directory goes only when every listed shard was removed.

use crate::events::ShardsDeleted;
use crate::pubsub::PubSub;
use crate::topic;
use defs_core::error::{DefsError, Result};
use defs_core::script::verify_key_hash;
use defs_core::{crypto, EventBus, PrivateKey};
use defs_storage::LocalShardStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delete request payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub file_id: String,
    /// Hex RIPEMD160(SHA256(owner public key))
    pub pub_key_hash: String,
}

impl DeleteRequest {
    pub fn new(file_id: impl Into<String>, pub_key_hash: &[u8; 20]) -> Self {
        Self {
            file_id: file_id.into(),
            pub_key_hash: hex::encode(pub_key_hash),
        }
    }

    /// Request naming the owner of `key`
    pub fn for_owner(file_id: impl Into<String>, key: &PrivateKey) -> Self {
        Self::new(file_id, &key.public_key().pub_key_hash())
    }

    pub fn key_hash(&self) -> Result<[u8; 20]> {
        let bytes = hex::decode(&self.pub_key_hash)
            .map_err(|e| DefsError::InvalidKey(format!("pub_key_hash: {}", e)))?;
        bytes
            .try_into()
            .map_err(|_| DefsError::InvalidKey("pub_key_hash must be 20 bytes".to_string()))
    }
}

/// Pubsub wrapper binding a payload to its author
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub payload: Vec<u8>,
    #[serde(default)]
    pub public_key: Option<Vec<u8>>,
    #[serde(default)]
    pub signature: Option<Vec<u8>>,
}

impl SignedEnvelope {
    pub fn sign(payload: Vec<u8>, key: &PrivateKey) -> Self {
        let signature = key.sign(&payload);
        Self {
            payload,
            public_key: Some(key.public_key().to_bytes()),
            signature: Some(signature),
        }
    }

    pub fn unsigned(payload: Vec<u8>) -> Self {
        Self {
            payload,
            public_key: None,
            signature: None,
        }
    }

    pub fn is_signed(&self) -> bool {
        self.public_key.is_some() && self.signature.is_some()
    }

    /// Check the signature; returns the signer's key hash
    pub fn verify(&self) -> Result<[u8; 20]> {
        match (&self.public_key, &self.signature) {
            (Some(public_key), Some(signature))
                if crypto::verify_signature(public_key, &self.payload, signature) =>
            {
                Ok(crypto::hash160(public_key))
            }
            _ => Err(DefsError::SignatureInvalid),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// What a delete request did on this node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub listed: usize,
    pub deleted: usize,
    pub kept: usize,
    pub dir_removed: bool,
}

/// Applies delete requests to the local store
pub struct DeleteHandler {
    store: Arc<LocalShardStore>,
    events: EventBus,
    require_signature: bool,
}

impl DeleteHandler {
    pub fn new(store: Arc<LocalShardStore>, events: EventBus) -> Self {
        Self {
            store,
            events,
            require_signature: true,
        }
    }

    /// Accept unsigned envelopes too
    pub fn with_require_signature(mut self, require: bool) -> Self {
        self.require_signature = require;
        self
    }

    /// Decode, authenticate and apply one pubsub message
    pub fn handle_message(&self, data: &[u8]) -> Result<DeleteOutcome> {
        let envelope = SignedEnvelope::from_bytes(data)?;
        let request: DeleteRequest = serde_json::from_slice(&envelope.payload)?;
        let key_hash = request.key_hash()?;

        if envelope.is_signed() {
            if envelope.verify()? != key_hash {
                warn!(file_id = %request.file_id, "Delete signer does not own the key hash");
                return Err(DefsError::SignatureInvalid);
            }
        } else if self.require_signature {
            warn!(file_id = %request.file_id, "Dropping unsigned delete request");
            return Err(DefsError::SignatureInvalid);
        }

        self.apply(&request)
    }

    /// Remove every local shard of the file whose owner script accepts the
    /// request's key hash
    pub fn apply(&self, request: &DeleteRequest) -> Result<DeleteOutcome> {
        let key_hash = request.key_hash()?;
        let file_id = request.file_id.as_str();

        // Counts are over this listing, not whatever appears meanwhile
        let listed = self.store.list(file_id)?;
        let mut outcome = DeleteOutcome {
            listed: listed.len(),
            ..DeleteOutcome::default()
        };

        for shard_hash in &listed {
            let script = match self.store.read_script(file_id, shard_hash) {
                Ok(script) => script,
                Err(e) => {
                    warn!(file_id, shard_hash = %shard_hash, error = %e, "Unreadable shard kept");
                    outcome.kept += 1;
                    continue;
                }
            };
            if let Err(e) = verify_key_hash(&script, &key_hash) {
                debug!(file_id, shard_hash = %shard_hash, error = %e, "Owner mismatch, shard kept");
                outcome.kept += 1;
                continue;
            }
            match self.store.delete(file_id, shard_hash) {
                Ok(true) => outcome.deleted += 1,
                Ok(false) => outcome.kept += 1,
                Err(e) => {
                    warn!(file_id, shard_hash = %shard_hash, error = %e, "Shard not deleted");
                    outcome.kept += 1;
                }
            }
        }

        if outcome.deleted == outcome.listed {
            outcome.dir_removed = self.store.remove_file_dir(file_id)?;
        }

        info!(
            file_id,
            listed = outcome.listed,
            deleted = outcome.deleted,
            kept = outcome.kept,
            dir_removed = outcome.dir_removed,
            "Delete request applied"
        );
        self.events.publish(ShardsDeleted {
            file_id: file_id.to_string(),
            deleted: outcome.deleted,
            kept: outcome.kept,
            dir_removed: outcome.dir_removed,
        });
        Ok(outcome)
    }

    /// Subscribe to the delete topic and apply requests until the
    /// subscription closes
    pub async fn listen(self: Arc<Self>, pubsub: &dyn PubSub) -> Result<JoinHandle<()>> {
        let mut rx = pubsub.subscribe(topic::DELETE_REQUEST).await?;
        Ok(tokio::spawn(async move {
            loop {
                let message = match rx.recv().await {
                    Ok(message) => message,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Delete listener lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let handler = self.clone();
                let result =
                    tokio::task::spawn_blocking(move || handler.handle_message(&message.data)).await;
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, kind = e.kind(), "Delete request rejected"),
                    Err(e) => warn!(error = %e, "Delete task failed"),
                }
            }
            debug!("Delete listener stopped");
        }))
    }
}

/// Publish a signed delete request for `file_id` owned by `owner`
pub async fn publish_delete(pubsub: &dyn PubSub, owner: &PrivateKey, file_id: &str) -> Result<()> {
    let request = DeleteRequest::for_owner(file_id, owner);
    let envelope = SignedEnvelope::sign(serde_json::to_vec(&request)?, owner);
    pubsub
        .publish(topic::DELETE_REQUEST, envelope.to_bytes()?)
        .await?;
    info!(file_id, "Delete request published");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use defs_core::{ErasureConfig, FileMeta, PauseRegistry, PipelineConfig, ShardPipeline};
    use defs_storage::StorageConfig;

    fn stored_file(dir: &std::path::Path, owner: &PrivateKey) -> (Arc<LocalShardStore>, String) {
        let store = Arc::new(LocalShardStore::open(StorageConfig::new(dir), "node-1").unwrap());
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
                b"owned file contents",
                FileMeta::new("owned.txt"),
                owner,
                store.as_ref(),
                Some(ErasureConfig::new(2, 1).unwrap()),
            )
            .unwrap();
        (store, uploaded.file_id)
    }

    #[test]
    fn test_matching_owner_deletes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let owner = PrivateKey::generate();
        let (store, file_id) = stored_file(dir.path(), &owner);
        let handler = DeleteHandler::new(store.clone(), EventBus::new());

        let outcome = handler
            .apply(&DeleteRequest::for_owner(&file_id, &owner))
            .unwrap();

        assert_eq!(outcome.listed, 3);
        assert_eq!(outcome.deleted, 3);
        assert!(outcome.dir_removed);
        assert!(!store.file_dir(&file_id).unwrap().exists());
    }

    #[test]
    fn test_other_owner_deletes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let owner = PrivateKey::generate();
        let (store, file_id) = stored_file(dir.path(), &owner);
        let handler = DeleteHandler::new(store.clone(), EventBus::new());

        let outcome = handler
            .apply(&DeleteRequest::for_owner(&file_id, &PrivateKey::generate()))
            .unwrap();

        assert_eq!(outcome.deleted, 0);
        assert_eq!(outcome.kept, 3);
        assert!(!outcome.dir_removed);
        assert_eq!(store.list(&file_id).unwrap().len(), 3);
    }

    #[test]
    fn test_unsigned_envelope_policy() {
        let dir = tempfile::tempdir().unwrap();
        let owner = PrivateKey::generate();
        let (store, file_id) = stored_file(dir.path(), &owner);
        let payload = serde_json::to_vec(&DeleteRequest::for_owner(&file_id, &owner)).unwrap();
        let message = SignedEnvelope::unsigned(payload).to_bytes().unwrap();

        let strict = DeleteHandler::new(store.clone(), EventBus::new());
        assert!(matches!(
            strict.handle_message(&message),
            Err(DefsError::SignatureInvalid)
        ));
        assert_eq!(store.list(&file_id).unwrap().len(), 3);

        let lenient = DeleteHandler::new(store.clone(), EventBus::new()).with_require_signature(false);
        assert_eq!(lenient.handle_message(&message).unwrap().deleted, 3);
    }

    #[test]
    fn test_signer_must_own_key_hash() {
        let dir = tempfile::tempdir().unwrap();
        let owner = PrivateKey::generate();
        let (store, file_id) = stored_file(dir.path(), &owner);
        let handler = DeleteHandler::new(store.clone(), EventBus::new());

        // Names the owner but signed by someone else
        let payload = serde_json::to_vec(&DeleteRequest::for_owner(&file_id, &owner)).unwrap();
        let forged = SignedEnvelope::sign(payload, &PrivateKey::generate());
        assert!(matches!(
            handler.handle_message(&forged.to_bytes().unwrap()),
            Err(DefsError::SignatureInvalid)
        ));
        assert_eq!(store.list(&file_id).unwrap().len(), 3);
    }

    #[test]
    fn test_envelope_tamper_detected() {
        let key = PrivateKey::generate();
        let mut envelope = SignedEnvelope::sign(b"payload".to_vec(), &key);
        assert_eq!(envelope.verify().unwrap(), key.public_key().pub_key_hash());
        envelope.payload[0] ^= 1;
        assert!(envelope.verify().is_err());
    }

    #[test]
    fn test_bad_key_hash() {
        let request = DeleteRequest {
            file_id: "f".to_string(),
            pub_key_hash: "abcd".to_string(),
        };
        assert!(matches!(request.key_hash(), Err(DefsError::InvalidKey(_))));
    }

    #[test]
    fn test_missing_file_is_empty_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalShardStore::open(StorageConfig::new(dir.path()), "node-1").unwrap());
        let handler = DeleteHandler::new(store, EventBus::new());
        let outcome = handler
            .apply(&DeleteRequest::new("0".repeat(64), &[0u8; 20]))
            .unwrap();
        assert_eq!(outcome, DeleteOutcome::default());
    }
}
