//! Node context: owns every long-lived service of a running node

use crate::config::NodeConfig;
use crate::metrics::NodeMetrics;
use defs_core::pipeline::UploadedFile;
use defs_core::{
    crypto, DefsError, ErasureConfig, EventBus, PauseRegistry, PrivateKey, Result, ShardPipeline,
};
use defs_network::delete::{publish_delete, DeleteOutcome, DeleteRequest};
use defs_network::gossip::{keypair_from_secret, spawn_from_config};
use defs_network::{
    tcp, DeleteHandler, HandshakeConfig, HandshakeService, Host, LocalPubSub, PubSub,
    ShardsDeleted, TcpHost, TcpHostConfig, UploadDispatcher, UploadHandler,
};
use defs_storage::LocalShardStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LOCAL_DELETE_TIMEOUT: Duration = Duration::from_secs(10);

/// Load the hex node key at `path`, or generate and save one
pub fn load_or_create_key(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        let hex = std::fs::read_to_string(path)?;
        return PrivateKey::from_hex(hex.trim());
    }

    let key = PrivateKey::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, key.to_hex())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    info!(path = %path.display(), "Generated new node key");
    Ok(key)
}

/// Every service of one node, built from a [`NodeConfig`]
pub struct AppContext {
    pub config: NodeConfig,
    pub key: PrivateKey,
    pub node_id: String,
    pub events: EventBus,
    pub store: Arc<LocalShardStore>,
    pub pipeline: Arc<ShardPipeline>,
    pub host: Arc<TcpHost>,
    pub handshake: Arc<HandshakeService>,
    pub dispatcher: Arc<UploadDispatcher>,
    pub delete: Arc<DeleteHandler>,
    pub pubsub: Arc<dyn PubSub>,
    pub metrics: NodeMetrics,
    gossip_enabled: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl AppContext {
    /// Build the services; nothing is registered until [`AppContext::start`]
    pub async fn build(config: NodeConfig) -> Result<Self> {
        let key = load_or_create_key(&config.key_path())?;
        let node_id = key.public_key().address();
        let events = EventBus::new();

        let store = Arc::new(LocalShardStore::open(
            config.storage.to_storage_config(),
            node_id.clone(),
        )?);
        let pipeline = Arc::new(ShardPipeline::new(
            config.pipeline.to_pipeline_config(),
            PauseRegistry::new(),
            events.clone(),
        )?);

        let network = &config.network;
        let policy = network.stream_policy();
        let host = TcpHost::bind(
            node_id.clone(),
            TcpHostConfig::default()
                .with_listen_addr(tcp::parse_addr(&network.listen_addr)?)
                .with_limits(network.resource_limits()),
        )
        .await?;

        let mut handshake_config = HandshakeConfig::default().with_stream_policy(policy.clone());
        handshake_config.version = config.node.version.clone();
        if network.handshake_timeout_secs > 0 {
            handshake_config =
                handshake_config.with_deadline(Duration::from_secs(network.handshake_timeout_secs));
        }
        let handshake = Arc::new(HandshakeService::new(
            host.clone(),
            events.clone(),
            handshake_config,
        ));

        let dispatcher = Arc::new(UploadDispatcher::new(
            host.clone(),
            config.pipeline.to_dispatch_config(policy),
        ));
        let delete = Arc::new(
            DeleteHandler::new(store.clone(), events.clone())
                .with_require_signature(config.delete.require_signed),
        );

        let mut tasks = Vec::new();
        let keypair = keypair_from_secret(key.to_bytes())?;
        let (pubsub, gossip_enabled): (Arc<dyn PubSub>, bool) =
            match spawn_from_config(keypair, network)? {
                Some((gossip, task)) => {
                    info!(peer_id = %gossip.local_peer_id(), "Gossip enabled");
                    tasks.push(task);
                    (Arc::new(gossip), true)
                }
                None => {
                    debug!("Gossip disabled, deletes stay on this node");
                    (Arc::new(LocalPubSub::new().with_source(node_id.clone())), false)
                }
            };

        let metrics = NodeMetrics::new(node_id.clone());

        Ok(Self {
            config,
            key,
            node_id,
            events,
            store,
            pipeline,
            host,
            handshake,
            dispatcher,
            delete,
            pubsub,
            metrics,
            gossip_enabled,
            tasks,
        })
    }

    /// Register protocol handlers and event subscribers
    pub async fn start(&mut self) -> Result<()> {
        self.handshake.register();
        UploadHandler::new(
            self.store.clone(),
            self.events.clone(),
            self.config.network.stream_policy(),
        )
        .register(self.host.as_ref());
        self.dispatcher.attach(&self.events);
        self.metrics.attach(&self.events);

        let listener = self.delete.clone().listen(self.pubsub.as_ref()).await?;
        self.tasks.push(listener);

        info!(
            node_id = %self.node_id,
            addrs = ?self.host.listen_addrs(),
            "Node services started"
        );
        Ok(())
    }

    pub fn gossip_enabled(&self) -> bool {
        self.gossip_enabled
    }

    /// Handshake with every configured bootstrap peer; returns how many
    /// answered
    pub async fn bootstrap(&self) -> Result<usize> {
        let peers = self.config.network.bootstrap_addrs()?;
        if peers.is_empty() {
            return Ok(0);
        }

        let results = futures::future::join_all(
            peers.iter().map(|peer| self.handshake.handshake(peer)),
        )
        .await;

        let mut connected = 0;
        for (peer, result) in peers.iter().zip(results) {
            match result {
                Ok(learned) => {
                    connected += 1;
                    info!(peer = %peer.id, learned, "Bootstrap peer connected");
                }
                Err(e) => warn!(peer = %peer.id, error = %e, kind = e.kind(), "Bootstrap peer unreachable"),
            }
        }
        Ok(connected)
    }

    /// Shard, encrypt and store `path` locally; the dispatcher then places
    /// each shard on a peer
    pub async fn upload_file(
        &self,
        path: &Path,
        erasure: Option<ErasureConfig>,
    ) -> Result<UploadedFile> {
        let path = path.to_path_buf();
        let pipeline = self.pipeline.clone();
        let store = self.store.clone();
        let key = self.key.clone();

        let uploaded = tokio::task::spawn_blocking(move || {
            let uploaded = pipeline.upload_path(&path, &key, store.as_ref(), erasure)?;
            store.stage_upload(&uploaded.file_id, &path)?;
            Ok::<_, DefsError>(uploaded)
        })
        .await
        .map_err(|e| DefsError::Internal(e.to_string()))??;

        self.refresh_storage_metrics();
        info!(
            file_id = %uploaded.file_id,
            shards = uploaded.shards.len(),
            failed = uploaded.failed.len(),
            batches = uploaded.batches,
            size = uploaded.size,
            "File uploaded"
        );
        Ok(uploaded)
    }

    /// Rebuild `file_id` from local shards into the downloads directory
    pub async fn download_file(
        &self,
        file_id: &str,
        key: [u8; crypto::FILE_KEY_SIZE],
    ) -> Result<PathBuf> {
        let file_id = file_id.to_string();
        let pipeline = self.pipeline.clone();
        let store = self.store.clone();

        tokio::task::spawn_blocking(move || {
            let downloads = store.roots().downloads();
            pipeline.reconstruct_file(&file_id, &key, store.as_ref(), &downloads)
        })
        .await
        .map_err(|e| DefsError::Internal(e.to_string()))?
    }

    /// Broadcast a signed delete of `file_id` and return what it removed
    /// here. Gossip does not deliver our own messages back, so with gossip on
    /// the request is applied directly; otherwise the local listener applies
    /// it and we wait for its result.
    pub async fn delete_file(&self, file_id: &str) -> Result<DeleteOutcome> {
        if self.gossip_enabled {
            let delete = self.delete.clone();
            let request = DeleteRequest::for_owner(file_id, &self.key);
            let outcome = tokio::task::spawn_blocking(move || delete.apply(&request))
                .await
                .map_err(|e| DefsError::Internal(e.to_string()))??;
            if let Err(e) = publish_delete(self.pubsub.as_ref(), &self.key, file_id).await {
                warn!(file_id, error = %e, "Delete request not broadcast");
            }
            self.refresh_storage_metrics();
            return Ok(outcome);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let wanted = file_id.to_string();
        let subscription = self.events.subscribe(move |e: &ShardsDeleted| {
            if e.file_id == wanted {
                let _ = tx.send(e.clone());
            }
        });

        let applied = async {
            publish_delete(self.pubsub.as_ref(), &self.key, file_id).await?;
            tokio::time::timeout(LOCAL_DELETE_TIMEOUT, rx.recv())
                .await
                .ok()
                .flatten()
                .ok_or_else(|| DefsError::Internal(format!("delete of {} not applied", file_id)))
        }
        .await;
        self.events.unsubscribe::<ShardsDeleted>(subscription);

        let applied = applied?;
        self.refresh_storage_metrics();
        Ok(DeleteOutcome {
            listed: applied.deleted + applied.kept,
            deleted: applied.deleted,
            kept: applied.kept,
            dir_removed: applied.dir_removed,
        })
    }

    pub fn refresh_storage_metrics(&self) {
        match self.store.stats() {
            Ok(stats) => self.metrics.update_storage(&stats),
            Err(e) => debug!(error = %e, "Storage stats unavailable"),
        }
    }

    /// Stop the host and background tasks
    pub async fn shutdown(self) {
        self.host.shutdown();
        self.metrics.mark_down();
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        info!(node_id = %self.node_id, "Node stopped");
    }
}
