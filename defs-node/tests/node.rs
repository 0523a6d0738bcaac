//! Two nodes on loopback: bootstrap, upload, placement, download and delete

use defs_core::{ErasureConfig, FileMeta, PrivateKey};
use defs_network::delete::{DeleteRequest, SignedEnvelope};
use defs_node::{load_or_create_key, AppContext, NodeConfig};
use std::path::Path;

fn config(root: &Path) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.storage.root = root.to_path_buf();
    config.network.listen_addr = "127.0.0.1:0".to_string();
    config.pipeline.workers = 1;
    config.pipeline.retry_interval_secs = 1;
    config
}

async fn node(config: NodeConfig) -> AppContext {
    config.validate().unwrap();
    let mut ctx = AppContext::build(config).await.unwrap();
    ctx.start().await.unwrap();
    ctx
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upload_is_placed_on_the_bootstrap_peer() {
    let dir = tempfile::tempdir().unwrap();
    let holder = node(config(&dir.path().join("holder"))).await;

    let mut owner_config = config(&dir.path().join("owner"));
    owner_config.network.bootstrap_peers =
        vec![format!("{}@{}", holder.node_id, holder.host.local_addr())];
    let owner = node(owner_config).await;
    assert_eq!(owner.bootstrap().await.unwrap(), 1);

    let source = dir.path().join("notes.txt");
    let contents: Vec<u8> = (0..40_000).map(|i| (i % 251) as u8).collect();
    std::fs::write(&source, &contents).unwrap();

    let uploaded = owner
        .upload_file(&source, Some(ErasureConfig::new(2, 1).unwrap()))
        .await
        .unwrap();
    owner.events.wait_async().await;

    // Every shard went to the only known peer
    let assignments = owner.dispatcher.state().assignments(&uploaded.file_id);
    assert_eq!(assignments.len(), 3);
    assert!(assignments.values().all(|peer| *peer == holder.node_id));
    assert_eq!(holder.store.list(&uploaded.file_id).unwrap().len(), 3);
    assert_eq!(holder.metrics.shards_stored(), 3);
    assert_eq!(owner.metrics.pipeline_shards(), (2, 1));

    // The holder can rebuild the file with the owner's key
    let rebuilt = holder
        .download_file(&uploaded.file_id, uploaded.key)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&rebuilt).unwrap(), contents);
    assert_eq!(rebuilt.file_name().unwrap(), "notes.txt");

    owner.shutdown().await;
    holder.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deletes_only_follow_the_owner() {
    let dir = tempfile::tempdir().unwrap();
    let holder = node(config(&dir.path().join("holder"))).await;

    let mut owner_config = config(&dir.path().join("owner"));
    owner_config.network.bootstrap_peers =
        vec![format!("{}@{}", holder.node_id, holder.host.local_addr())];
    let owner = node(owner_config).await;
    owner.bootstrap().await.unwrap();

    let source = dir.path().join("ledger.csv");
    std::fs::write(&source, b"date,amount\n2024-01-01,10\n").unwrap();
    let uploaded = owner
        .upload_file(&source, Some(ErasureConfig::new(2, 1).unwrap()))
        .await
        .unwrap();
    owner.events.wait_async().await;
    let file_id = uploaded.file_id.as_str();
    assert_eq!(holder.store.list(file_id).unwrap().len(), 3);

    // The holder's own key does not own the file
    let refused = holder.delete_file(file_id).await.unwrap();
    assert_eq!(refused.deleted, 0);
    assert_eq!(refused.kept, 3);
    assert_eq!(holder.store.list(file_id).unwrap().len(), 3);

    // The owner's signed request, as it would arrive over pubsub
    let request = DeleteRequest::for_owner(file_id, &owner.key);
    let envelope = SignedEnvelope::sign(serde_json::to_vec(&request).unwrap(), &owner.key);
    let outcome = holder
        .delete
        .handle_message(&envelope.to_bytes().unwrap())
        .unwrap();
    assert_eq!(outcome.deleted, 3);
    assert!(outcome.dir_removed);
    assert!(holder.store.list(file_id).unwrap().is_empty());

    // The owner also clears its local copies
    let local = owner.delete_file(file_id).await.unwrap();
    assert_eq!(local.deleted, 3);
    assert!(owner.store.list(file_id).unwrap().is_empty());

    owner.shutdown().await;
    holder.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_records_file_metadata_and_stages_a_copy() {
    let dir = tempfile::tempdir().unwrap();
    let mut node_config = config(&dir.path().join("solo"));
    node_config.storage.local_storage = true;
    let solo = node(node_config).await;

    let source = dir.path().join("photo.raw");
    let contents: Vec<u8> = (0..9_000).map(|i| (i % 97) as u8).collect();
    std::fs::write(&source, &contents).unwrap();

    let uploaded = solo.upload_file(&source, None).await.unwrap();
    solo.events.wait_async().await;
    assert!(uploaded.is_complete());
    assert_eq!(uploaded.batches, 1);

    let expected = FileMeta::from_path(&source).unwrap();
    for hash in solo.store.list(&uploaded.file_id).unwrap() {
        let header = solo.store.read_header(&uploaded.file_id, &hash).unwrap();
        assert_eq!(header.name, "photo.raw");
        assert_eq!(header.mod_time, expected.mod_time);
    }

    let staged = dir
        .path()
        .join("solo/files/uploads")
        .join(&uploaded.file_id)
        .join("photo.raw");
    assert_eq!(std::fs::read(staged).unwrap(), contents);

    // No peers yet, so every shard waits for one
    assert_eq!(
        solo.dispatcher.state().pending_count(),
        uploaded.shards.len()
    );

    solo.shutdown().await;
}

#[tokio::test]
async fn node_key_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys").join("node.key");

    let first = load_or_create_key(&path).unwrap();
    let second = load_or_create_key(&path).unwrap();
    assert_eq!(first.to_hex(), second.to_hex());

    std::fs::write(&path, "not hex").unwrap();
    assert!(load_or_create_key(&path).is_err());

    let other = PrivateKey::generate();
    std::fs::write(&path, format!("{}\n", other.to_hex())).unwrap();
    assert_eq!(
        load_or_create_key(&path).unwrap().public_key().address(),
        other.public_key().address()
    );
}
