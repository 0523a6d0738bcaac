//! Local shard store
//!
//! Persists shard objects at `files/slices/<node_id>/<file_id>/<shard_hash>`.
//! Each shard is written to a hidden temporary file in its directory and
//! renamed into place, so readers never observe a partial object. Shards of
//! different files never share a lock.

use crate::layout::FileRoots;
use crate::StorageConfig;
use defs_core::error::{DefsError, Result};
use defs_core::pipeline::{ShardSink, ShardSource};
use defs_core::segment::{self, SegmentReader};
use defs_core::shard::{field, ShardHeader};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    /// Total number of shard objects on disk
    pub shard_count: u64,

    /// Total bytes used by shard objects
    pub bytes_used: u64,

    /// Total storage capacity (0 = unlimited)
    pub bytes_capacity: u64,

    /// Number of read operations
    pub reads: u64,

    /// Number of write operations
    pub writes: u64,

    /// Number of delete operations
    pub deletes: u64,
}

impl StorageStats {
    /// Check if storage is full
    pub fn is_full(&self) -> bool {
        self.bytes_capacity > 0 && self.bytes_used >= self.bytes_capacity
    }

    /// Available space in bytes
    pub fn bytes_available(&self) -> u64 {
        if self.bytes_capacity == 0 {
            u64::MAX
        } else {
            self.bytes_capacity.saturating_sub(self.bytes_used)
        }
    }
}

/// Filesystem shard store for one node
pub struct LocalShardStore {
    roots: FileRoots,
    node_id: String,
    config: StorageConfig,

    /// Operation counters
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl LocalShardStore {
    /// Open the store under `config.root`, creating the directory tree
    pub fn open(config: StorageConfig, node_id: impl Into<String>) -> Result<Self> {
        let roots = config.roots();
        roots.ensure()?;
        let node_id = node_id.into();
        fs::create_dir_all(roots.node_dir(&node_id)?)?;
        info!(root = %roots.root().display(), node_id = %node_id, "Shard store opened");
        Ok(Self {
            roots,
            node_id,
            config,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        })
    }

    pub fn roots(&self) -> &FileRoots {
        &self.roots
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn shard_path(&self, file_id: &str, shard_hash: &str) -> Result<PathBuf> {
        self.roots.shard_path(&self.node_id, file_id, shard_hash)
    }

    pub fn file_dir(&self, file_id: &str) -> Result<PathBuf> {
        self.roots.file_dir(&self.node_id, file_id)
    }

    fn check_capacity(&self, incoming: u64) -> Result<()> {
        if self.config.max_capacity == 0 {
            return Ok(());
        }
        let used = self.stats()?.bytes_used;
        if used + incoming > self.config.max_capacity {
            return Err(DefsError::Storage(format!(
                "storage full: {} of {} bytes used",
                used, self.config.max_capacity
            )));
        }
        Ok(())
    }

    fn temp_path(dir: &Path) -> PathBuf {
        dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()))
    }

    /// Write a shard object, replacing any previous copy
    pub fn put(&self, file_id: &str, shard_hash: &str, object: &[u8]) -> Result<PathBuf> {
        let path = self.shard_path(file_id, shard_hash)?;
        self.check_capacity(object.len() as u64)?;
        let dir = self.file_dir(file_id)?;
        fs::create_dir_all(&dir)?;

        let tmp = Self::temp_path(&dir);
        let written = File::create(&tmp).and_then(|mut f| {
            f.write_all(object)?;
            f.sync_all()
        });
        if let Err(e) = written.and_then(|_| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(file_id, shard_hash, size = object.len(), "Shard persisted");
        Ok(path)
    }

    /// Move an already written object (e.g. an upload temp file) into place
    pub fn put_from(&self, file_id: &str, shard_hash: &str, source: &Path) -> Result<PathBuf> {
        let path = self.shard_path(file_id, shard_hash)?;
        self.check_capacity(fs::metadata(source)?.len())?;
        fs::create_dir_all(self.file_dir(file_id)?)?;

        if fs::rename(source, &path).is_err() {
            // Cross-device: copy to a temp file next to the target, then rename
            let tmp = Self::temp_path(&self.file_dir(file_id)?);
            let copied = fs::copy(source, &tmp).and_then(|_| fs::rename(&tmp, &path));
            if let Err(e) = copied {
                let _ = fs::remove_file(&tmp);
                return Err(e.into());
            }
            let _ = fs::remove_file(source);
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(file_id, shard_hash, "Shard persisted from staging");
        Ok(path)
    }

    /// Full object bytes
    pub fn read(&self, file_id: &str, shard_hash: &str) -> Result<Vec<u8>> {
        let path = self.shard_path(file_id, shard_hash)?;
        let bytes = fs::read(&path).map_err(|e| not_found(e, file_id, shard_hash))?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(bytes)
    }

    /// Open an object for segment reads under a shared lock
    pub fn open_reader(&self, file_id: &str, shard_hash: &str) -> Result<SegmentReader<File>> {
        let path = self.shard_path(file_id, shard_hash)?;
        if !path.is_file() {
            return Err(DefsError::Storage(format!(
                "shard not found: {}/{}",
                file_id, shard_hash
            )));
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        segment::open_file(&path)
    }

    /// Header segments of a stored shard, without its content
    pub fn read_header(&self, file_id: &str, shard_hash: &str) -> Result<ShardHeader> {
        let mut reader = self.open_reader(file_id, shard_hash)?;
        ShardHeader::read(&mut reader)
    }

    /// `P2PKHSCRIPT` segment of a stored shard
    pub fn read_script(&self, file_id: &str, shard_hash: &str) -> Result<Vec<u8>> {
        let mut reader = self.open_reader(file_id, shard_hash)?;
        defs_core::shard::read_bytes(&mut reader, field::P2PKHSCRIPT)
    }

    pub fn contains(&self, file_id: &str, shard_hash: &str) -> bool {
        self.shard_path(file_id, shard_hash)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    /// Shard hashes stored for `file_id`, sorted
    pub fn list(&self, file_id: &str) -> Result<Vec<String>> {
        list_entries(&self.file_dir(file_id)?, |meta| meta.is_file())
    }

    /// File ids with at least a directory on this node, sorted
    pub fn list_files(&self) -> Result<Vec<String>> {
        list_entries(&self.roots.node_dir(&self.node_id)?, |meta| meta.is_dir())
    }

    /// Remove one shard; returns whether it existed
    pub fn delete(&self, file_id: &str, shard_hash: &str) -> Result<bool> {
        let path = self.shard_path(file_id, shard_hash)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                self.deletes.fetch_add(1, Ordering::Relaxed);
                debug!(file_id, shard_hash, "Shard deleted");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the directory of `file_id` if nothing is left in it
    pub fn remove_file_dir(&self, file_id: &str) -> Result<bool> {
        let dir = self.file_dir(file_id)?;
        match fs::remove_dir(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!(file_id, error = %e, "File directory not removed");
                Ok(false)
            }
        }
    }

    /// Keep a copy of the uploaded file at `source` under
    /// `files/uploads/<file_id>/<name>`
    pub fn stage_upload(&self, file_id: &str, source: &Path) -> Result<Option<PathBuf>> {
        if !self.config.local_storage {
            return Ok(None);
        }
        let dir = self.roots.upload_dir(file_id)?;
        fs::create_dir_all(&dir)?;
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_id.to_string());
        let path = dir.join(name);
        fs::copy(source, &path)?;
        Ok(Some(path))
    }

    /// Walk the node directory for usage figures
    pub fn stats(&self) -> Result<StorageStats> {
        let mut stats = StorageStats {
            bytes_capacity: self.config.max_capacity,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            ..Default::default()
        };
        for file_id in self.list_files()? {
            let dir = self.file_dir(&file_id)?;
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                if meta.is_file() && !is_hidden(&entry.file_name().to_string_lossy()) {
                    stats.shard_count += 1;
                    stats.bytes_used += meta.len();
                }
            }
        }
        Ok(stats)
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn list_entries(dir: &Path, keep: impl Fn(&fs::Metadata) -> bool) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_hidden(&name) && keep(&entry.metadata()?) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn not_found(err: std::io::Error, file_id: &str, shard_hash: &str) -> DefsError {
    if err.kind() == ErrorKind::NotFound {
        DefsError::Storage(format!("shard not found: {}/{}", file_id, shard_hash))
    } else {
        DefsError::Io(err)
    }
}

impl ShardSink for LocalShardStore {
    fn put_shard(&self, file_id: &str, shard_hash: &str, object: &[u8]) -> Result<PathBuf> {
        self.put(file_id, shard_hash, object)
    }
}

impl ShardSource for LocalShardStore {
    fn list_shards(&self, file_id: &str) -> Result<Vec<String>> {
        self.list(file_id)
    }

    fn fetch_shard(&self, file_id: &str, shard_hash: &str) -> Result<Vec<u8>> {
        self.read(file_id, shard_hash)
    }

    fn fetch_header(&self, file_id: &str, shard_hash: &str) -> Result<ShardHeader> {
        self.read_header(file_id, shard_hash)
    }
}
