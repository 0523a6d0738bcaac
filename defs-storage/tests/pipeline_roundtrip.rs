//! Upload and reconstruct a file through the local shard store

use defs_core::crypto::{self, PrivateKey};
use defs_core::{
    ErasureConfig, EventBus, FileMeta, PauseRegistry, PipelineConfig, ShardPipeline, SliceUploaded,
};
use defs_storage::{LocalShardStore, StorageConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn pipeline(events: EventBus) -> ShardPipeline {
    let config = PipelineConfig {
        workers: 2,
        ..PipelineConfig::default()
    };
    ShardPipeline::new(config, PauseRegistry::new(), events).unwrap()
}

#[test]
fn upload_then_reconstruct_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalShardStore::open(StorageConfig::new(dir.path()), "node-a").unwrap();
    let events = EventBus::new();
    let published = Arc::new(AtomicUsize::new(0));
    let counter = published.clone();
    events.subscribe(move |_: &SliceUploaded| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let pipeline = pipeline(events);
    let owner = PrivateKey::generate();
    let contents: Vec<u8> = (0..1536 * 1024).map(|i| (i % 241) as u8).collect();
    let uploaded = pipeline
        .upload(
            &contents,
            FileMeta::new("video.bin"),
            &owner,
            &store,
            Some(ErasureConfig::new(4, 2).unwrap()),
        )
        .unwrap();

    assert_eq!(published.load(Ordering::SeqCst), 6);
    assert_eq!(store.list(&uploaded.file_id).unwrap().len(), 6);
    for shard in &uploaded.shards {
        let expected = dir
            .path()
            .join("files/slices/node-a")
            .join(&uploaded.file_id)
            .join(&shard.hash);
        assert_eq!(shard.path, expected);

        let header = store.read_header(&uploaded.file_id, &shard.hash).unwrap();
        assert_eq!(header.index, shard.index);
        assert_eq!(header.size, contents.len() as i64);
        header.verify_signature().unwrap();
    }

    // Lose one data shard and one parity shard
    store.delete(&uploaded.file_id, &uploaded.shards[1].hash).unwrap();
    store.delete(&uploaded.file_id, &uploaded.shards[5].hash).unwrap();

    let out = pipeline
        .reconstruct_file(
            &uploaded.file_id,
            &uploaded.key,
            &store,
            &store.roots().downloads(),
        )
        .unwrap();
    assert_eq!(out, dir.path().join("files/downloads/video.bin"));
    let rebuilt = std::fs::read(&out).unwrap();
    assert_eq!(crypto::file_id(&rebuilt).1, uploaded.file_id);
    assert_eq!(rebuilt, contents);
}

#[test]
fn corrupted_object_on_disk_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalShardStore::open(StorageConfig::new(dir.path()), "node-b").unwrap();
    let pipeline = pipeline(EventBus::new());
    let contents = b"short document that still needs protecting".to_vec();

    let uploaded = pipeline
        .upload(
            &contents,
            FileMeta::new("doc.txt"),
            &PrivateKey::generate(),
            &store,
            Some(ErasureConfig::new(2, 1).unwrap()),
        )
        .unwrap();

    // Flip a content byte of shard 0 so its CRC no longer matches
    let path = &uploaded.shards[0].path;
    let mut bytes = std::fs::read(path).unwrap();
    let mut reader =
        defs_core::SegmentReader::open(std::io::Cursor::new(bytes.clone())).unwrap();
    let entry = *reader.xref().get("CONTENT").unwrap();
    let body_start = entry.offset as usize + 4 + "CONTENT".len() + 8;
    bytes[body_start] ^= 0x01;
    assert!(reader.read_segment("CONTENT").is_ok());
    std::fs::write(path, bytes).unwrap();

    let (_, rebuilt) = pipeline
        .reconstruct(&uploaded.file_id, &uploaded.key, &store)
        .unwrap();
    assert_eq!(rebuilt, contents);
}
