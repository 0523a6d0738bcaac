//! Shard pipeline
//!
//! Upload path: hash the file, derive `(k, m)`, erasure-code it in one or
//! more batches, encrypt each shard with the per-file key, sign it, wrap it
//! as a shard object and hand it to a [`ShardSink`]. Shards are stored
//! independently: a failed shard is reported in [`UploadedFile::failed`]
//! and never stops its siblings. A [`SliceUploaded`] event is published for
//! every stored shard so the dispatcher can place it.
//!
//! Download path: group the listed shards by batch, fetch each batch in
//! parallel, verify CRC, content hash and signature, decrypt, reconstruct
//! and join every batch in order.

use crate::crypto::{self, PrivateKey};
use crate::erasure::{Batch, ErasureCoder, ErasureConfig, StreamingEncoder};
use crate::error::{DefsError, Result};
use crate::event::{Event, EventBus};
use crate::script;
use crate::segment::SegmentReader;
use crate::shard::{self, Shard, ShardHeader, SliceEntry, SliceTable, SHARD_VERSION};
use crate::{DEFAULT_PARITY_RATIO, DEFAULT_SHARD_SIZE, MAX_SHARDS, MAX_SLICE_SIZE, MIN_SLICE_SIZE};
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Target shard length when `(k, m)` is derived, and the shard length of
    /// every full batch of a batched file
    pub shard_size: usize,
    /// Parity shards per data shard
    pub parity_ratio: f64,
    pub min_slice_size: usize,
    pub max_slice_size: usize,
    /// Size of the shard worker pool
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shard_size: DEFAULT_SHARD_SIZE,
            parity_ratio: DEFAULT_PARITY_RATIO,
            min_slice_size: MIN_SLICE_SIZE,
            max_slice_size: MAX_SLICE_SIZE,
            workers: num_workers(),
        }
    }
}

fn num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Shard layout chosen for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardParams {
    pub erasure: ErasureConfig,
    /// Shard length of a full batch
    pub shard_len: usize,
    /// Input bytes coded per batch
    pub batch_len: usize,
}

impl ShardParams {
    /// Number of batches a file of `size` bytes is coded in
    pub fn batches(&self, size: u64) -> u64 {
        size.div_ceil(self.batch_len.max(1) as u64).max(1)
    }
}

fn parity_for(k: usize, ratio: f64) -> usize {
    // Guard against 10 * 0.3 = 3.0000000000000004 rounding up to 4
    ((k as f64 * ratio) - 1e-9).ceil().max(0.0) as usize
}

/// Choose `(k, m)` and the shard length for a file of `size` bytes.
///
/// Explicit parameters are used as given. Otherwise
/// `k = ceil(size / shard_size)` and `m = ceil(k * parity_ratio)`; when
/// `k + m` exceeds 256 the shard length grows instead. A file whose shards
/// would then exceed `max_slice_size` is coded in batches of `k` shards of
/// `shard_size` bytes.
pub fn derive_params(
    size: usize,
    config: &PipelineConfig,
    explicit: Option<ErasureConfig>,
) -> Result<ShardParams> {
    let erasure = match explicit {
        Some(erasure) => erasure,
        None => {
            if config.shard_size == 0 {
                return Err(DefsError::Configuration(
                    "shard_size must be > 0".to_string(),
                ));
            }
            let mut k = size.div_ceil(config.shard_size).clamp(1, MAX_SHARDS);
            while k > 1 && k + parity_for(k, config.parity_ratio) > MAX_SHARDS {
                k -= 1;
            }
            ErasureConfig::new(k, parity_for(k, config.parity_ratio))?
        }
    };

    let mut shard_len = erasure.shard_len(size);
    if shard_len > config.max_slice_size {
        shard_len = config
            .shard_size
            .max(config.min_slice_size)
            .min(config.max_slice_size);
        debug!(
            size,
            shard_len,
            data_shards = erasure.data_shards,
            "File coded in batches"
        );
    }
    Ok(ShardParams {
        erasure,
        shard_len,
        batch_len: shard_len * erasure.data_shards,
    })
}

/// Per-file pause flags consulted before each shard
#[derive(Clone, Default)]
pub struct PauseRegistry {
    flags: Arc<RwLock<HashMap<String, Arc<AtomicBool>>>>,
}

impl PauseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self, file_id: &str) -> Arc<AtomicBool> {
        if let Some(flag) = self.flags.read().get(file_id) {
            return flag.clone();
        }
        self.flags
            .write()
            .entry(file_id.to_string())
            .or_default()
            .clone()
    }

    pub fn pause(&self, file_id: &str) {
        self.flag(file_id).store(true, Ordering::SeqCst);
        info!(file_id, "File paused");
    }

    pub fn resume(&self, file_id: &str) {
        if let Some(flag) = self.flags.write().remove(file_id) {
            flag.store(false, Ordering::SeqCst);
            info!(file_id, "File resumed");
        }
    }

    pub fn is_paused(&self, file_id: &str) -> bool {
        self.flags
            .read()
            .get(file_id)
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }

    fn check(&self, file_id: &str) -> Result<()> {
        if self.is_paused(file_id) {
            Err(DefsError::Paused(file_id.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Destination for freshly built shard objects
pub trait ShardSink: Send + Sync {
    /// Persist `object` for `(file_id, shard_hash)`, returning its location
    fn put_shard(&self, file_id: &str, shard_hash: &str, object: &[u8]) -> Result<PathBuf>;
}

/// Origin of shard objects for reconstruction
pub trait ShardSource: Send + Sync {
    /// Hashes of the shards of `file_id` this source can serve
    fn list_shards(&self, file_id: &str) -> Result<Vec<String>>;

    /// Serialized shard object
    fn fetch_shard(&self, file_id: &str, shard_hash: &str) -> Result<Vec<u8>>;

    /// Header segments of a shard object
    fn fetch_header(&self, file_id: &str, shard_hash: &str) -> Result<ShardHeader> {
        let bytes = self.fetch_shard(file_id, shard_hash)?;
        let mut reader = SegmentReader::open(Cursor::new(bytes))?;
        ShardHeader::read(&mut reader)
    }
}

/// Published once per stored shard
#[derive(Debug, Clone)]
pub struct SliceUploaded {
    pub file_id: String,
    pub index: u32,
    pub shard_hash: String,
    pub is_parity: bool,
    pub path: PathBuf,
}

impl Event for SliceUploaded {
    const NAME: &'static str = "pipeline.slice_uploaded";
}

/// A shard persisted by the upload path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredShard {
    /// File-wide shard index
    pub index: u32,
    pub batch: u32,
    pub hash: String,
    pub is_parity: bool,
    pub path: PathBuf,
}

/// A shard the upload path built but could not store
#[derive(Debug)]
pub struct FailedShard {
    pub index: u32,
    pub error: DefsError,
}

/// Result of the upload path
#[derive(Debug)]
pub struct UploadedFile {
    pub file_id: String,
    pub file_hash: [u8; 32],
    /// Per-file decryption key, kept by the owner
    pub key: [u8; crypto::FILE_KEY_SIZE],
    pub name: String,
    pub size: u64,
    pub params: ShardParams,
    pub batches: u32,
    /// Every shard of every batch, keyed by file-wide index
    pub slice_table: SliceTable,
    pub shards: Vec<StoredShard>,
    pub failed: Vec<FailedShard>,
}

impl UploadedFile {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Metadata describing the file being uploaded
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub name: String,
    pub mod_time: i64,
    pub shared: bool,
}

impl FileMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mod_time: chrono::Utc::now().timestamp(),
            shared: false,
        }
    }

    /// Name and modification time of the file at `path`
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut meta = Self::new(name);
        if let Ok(modified) = std::fs::metadata(path)?.modified() {
            meta.mod_time = chrono::DateTime::<chrono::Utc>::from(modified).timestamp();
        }
        Ok(meta)
    }

    pub fn with_mod_time(mut self, mod_time: i64) -> Self {
        self.mod_time = mod_time;
        self
    }

    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }
}

/// Everything a shard signature and header need besides the shard itself
struct ShardSigner<'a> {
    file_id: &'a str,
    meta: &'a FileMeta,
    owner: &'a PrivateKey,
    key: [u8; crypto::FILE_KEY_SIZE],
    size: i64,
    erasure: ErasureConfig,
    public_key: Vec<u8>,
    p2pkh_script: Vec<u8>,
    upload_time: i64,
}

/// One batch's place in the file and its slice table
struct BatchLayout {
    index: u32,
    len: i64,
    table: SliceTable,
    table_bytes: Vec<u8>,
}

#[derive(Default)]
struct BatchOutcome {
    stored: Vec<StoredShard>,
    failed: Vec<FailedShard>,
    paused: bool,
}

impl ShardSigner<'_> {
    fn store(
        &self,
        layout: &BatchLayout,
        index: u32,
        content: Vec<u8>,
        slice_hash: String,
        sink: &dyn ShardSink,
    ) -> Result<StoredShard> {
        let signature = self.owner.sign(&shard::signing_input(
            self.file_id,
            &slice_hash,
            index,
            &layout.table_bytes,
            &self.public_key,
        ));
        let shard = Shard {
            header: ShardHeader {
                file_id: self.file_id.to_string(),
                name: self.meta.name.clone(),
                size: self.size,
                mod_time: self.meta.mod_time,
                upload_time: self.upload_time,
                public_key: self.public_key.clone(),
                slice_table: layout.table.clone(),
                slice_hash,
                index,
                batch: layout.index,
                batch_len: layout.len,
                data_shards: self.erasure.data_shards as u32,
                parity_shards: self.erasure.parity_shards as u32,
                signature,
                shared: self.meta.shared,
                p2pkh_script: self.p2pkh_script.clone(),
                version: SHARD_VERSION.to_string(),
            },
            content,
        };
        let path = sink.put_shard(self.file_id, &shard.header.slice_hash, &shard.to_bytes()?)?;
        debug!(file_id = %self.file_id, index, hash = %shard.header.slice_hash, "Shard stored");
        Ok(StoredShard {
            index,
            batch: layout.index,
            is_parity: shard.header.is_parity(),
            hash: shard.header.slice_hash,
            path,
        })
    }
}

/// Content hash and length of an input, known before coding starts
#[derive(Debug, Clone, Copy)]
struct InputDigest {
    file_hash: [u8; 32],
    size: u64,
}

/// Builds and reconstructs shard sets
pub struct ShardPipeline {
    config: PipelineConfig,
    pool: rayon::ThreadPool,
    pauses: PauseRegistry,
    events: EventBus,
}

impl ShardPipeline {
    pub fn new(config: PipelineConfig, pauses: PauseRegistry, events: EventBus) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("defs-shard-{}", i))
            .build()
            .map_err(|e| DefsError::Internal(e.to_string()))?;
        Ok(Self {
            config,
            pool,
            pauses,
            events,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pauses(&self) -> &PauseRegistry {
        &self.pauses
    }

    /// Run the upload path over the file at `path`. The file is read twice,
    /// once for its id and once batch by batch for coding; it is never held
    /// in memory whole.
    pub fn upload_path(
        &self,
        path: &Path,
        owner: &PrivateKey,
        sink: &dyn ShardSink,
        explicit: Option<ErasureConfig>,
    ) -> Result<UploadedFile> {
        let meta = FileMeta::from_path(path)?;
        let size = std::fs::metadata(path)?.len();
        let (file_hash, _) = crypto::file_id_reader(BufReader::new(File::open(path)?))?;
        let reader = BufReader::new(File::open(path)?);
        self.encode_batches(reader, InputDigest { file_hash, size }, meta, owner, sink, explicit)
    }

    /// Encode, encrypt, sign and store every shard of `contents`
    pub fn upload(
        &self,
        contents: &[u8],
        meta: FileMeta,
        owner: &PrivateKey,
        sink: &dyn ShardSink,
        explicit: Option<ErasureConfig>,
    ) -> Result<UploadedFile> {
        let (file_hash, _) = crypto::file_id(contents);
        let digest = InputDigest {
            file_hash,
            size: contents.len() as u64,
        };
        self.encode_batches(contents, digest, meta, owner, sink, explicit)
    }

    fn encode_batches<R: Read + Send>(
        &self,
        reader: R,
        digest: InputDigest,
        meta: FileMeta,
        owner: &PrivateKey,
        sink: &dyn ShardSink,
        explicit: Option<ErasureConfig>,
    ) -> Result<UploadedFile> {
        let file_hash = digest.file_hash;
        let file_id = crypto::file_id_from_hash(&file_hash);
        self.pauses.check(&file_id)?;

        let size = usize::try_from(digest.size)
            .map_err(|_| DefsError::Configuration(format!("{} bytes is too large", digest.size)))?;
        let params = derive_params(size, &self.config, explicit)?;
        let batches = params.batches(digest.size);
        let per_batch = params.erasure.total_shards() as u64;
        if batches.saturating_mul(per_batch) > u64::from(u32::MAX) {
            return Err(DefsError::ShardCountOutOfRange {
                data: params.erasure.data_shards,
                parity: params.erasure.parity_shards,
            });
        }
        let streamer = StreamingEncoder::new(params.erasure, params.shard_len)?;

        info!(
            file_id = %file_id,
            size = digest.size,
            data_shards = params.erasure.data_shards,
            parity_shards = params.erasure.parity_shards,
            shard_len = params.shard_len,
            batches,
            "Encoding file"
        );

        let public = owner.public_key();
        let signer = ShardSigner {
            file_id: &file_id,
            meta: &meta,
            owner,
            key: crypto::file_key(&file_hash),
            size: digest.size as i64,
            erasure: params.erasure,
            public_key: public.to_bytes(),
            p2pkh_script: script::p2pkh_locking_script(&public.pub_key_hash()),
            upload_time: chrono::Utc::now().timestamp(),
        };

        let mut slice_table = SliceTable::new();
        let mut shards = Vec::new();
        let mut failed = Vec::new();
        let coded = self.pool.install(|| {
            streamer.encode_reader(reader, |batch| {
                let (table, outcome) = self.store_batch(&signer, batch, sink);
                for entry in table.entries() {
                    slice_table.insert(entry.clone());
                }
                for stored in &outcome.stored {
                    self.events.publish(SliceUploaded {
                        file_id: file_id.clone(),
                        index: stored.index,
                        shard_hash: stored.hash.clone(),
                        is_parity: stored.is_parity,
                        path: stored.path.clone(),
                    });
                }
                shards.extend(outcome.stored);
                failed.extend(outcome.failed);
                if outcome.paused {
                    Err(DefsError::Paused(file_id.clone()))
                } else {
                    Ok(())
                }
            })
        });

        let coded = match coded {
            Ok(coded) => coded,
            Err(e) => {
                warn!(file_id = %file_id, stored = shards.len(), error = %e, "Encoding stopped");
                return Err(e);
            }
        };
        if coded != digest.size {
            return Err(DefsError::Internal(format!(
                "input of {} changed while encoding: {} bytes expected, {} read",
                file_id, digest.size, coded
            )));
        }
        if shards.is_empty() {
            if let Some(first) = failed.drain(..).next() {
                return Err(first.error);
            }
        }

        if failed.is_empty() {
            info!(file_id = %file_id, shards = shards.len(), batches, "File encoded");
        } else {
            warn!(
                file_id = %file_id,
                shards = shards.len(),
                failed = failed.len(),
                batches,
                "File encoded with unstored shards"
            );
        }
        let key = signer.key;
        Ok(UploadedFile {
            file_id,
            file_hash,
            key,
            name: meta.name.clone(),
            size: digest.size,
            params,
            batches: batches as u32,
            slice_table,
            shards,
            failed,
        })
    }

    /// Encrypt, sign and store one batch; every shard succeeds or fails on
    /// its own
    fn store_batch(
        &self,
        signer: &ShardSigner<'_>,
        batch: Batch,
        sink: &dyn ShardSink,
    ) -> (SliceTable, BatchOutcome) {
        let k = signer.erasure.data_shards as u32;
        let batch_index = batch.index as u32;
        let first = batch_index * signer.erasure.total_shards() as u32;

        // Encrypt every shard and hash its ciphertext
        let ciphertexts: Vec<(u32, Vec<u8>, String)> = batch
            .shards
            .into_par_iter()
            .map(|shard| {
                let ct = crypto::apply_keystream(&signer.key, &shard.data);
                let hash = hex::encode(crypto::sha256(&ct));
                (first + shard.index, ct, hash)
            })
            .collect();

        let mut table = SliceTable::new();
        for (index, _, hash) in &ciphertexts {
            table.insert(SliceEntry {
                index: *index,
                hash: hash.clone(),
                is_parity: index - first >= k,
            });
        }
        let layout = BatchLayout {
            index: batch_index,
            len: batch.len as i64,
            table_bytes: table.to_bytes(),
            table,
        };

        let results: Vec<(u32, Result<StoredShard>)> = ciphertexts
            .into_par_iter()
            .map(|(index, content, hash)| {
                let result = self
                    .pauses
                    .check(signer.file_id)
                    .and_then(|()| signer.store(&layout, index, content, hash, sink));
                (index, result)
            })
            .collect();

        let mut outcome = BatchOutcome::default();
        for (index, result) in results {
            match result {
                Ok(stored) => outcome.stored.push(stored),
                Err(DefsError::Paused(_)) => outcome.paused = true,
                Err(error) => {
                    warn!(
                        file_id = %signer.file_id,
                        index,
                        error = %error,
                        kind = error.kind(),
                        "Shard not stored"
                    );
                    outcome.failed.push(FailedShard { index, error });
                }
            }
        }
        (layout.table, outcome)
    }

    /// Rebuild the contents of `file_id` from `source`
    pub fn reconstruct(
        &self,
        file_id: &str,
        key: &[u8; crypto::FILE_KEY_SIZE],
        source: &dyn ShardSource,
    ) -> Result<(ShardHeader, Vec<u8>)> {
        let mut out = Vec::new();
        let header = self.reconstruct_into(file_id, key, source, &mut out)?;
        Ok((header, out))
    }

    /// Rebuild `file_id` batch by batch into `out`; returns the header the
    /// layout was taken from
    pub fn reconstruct_into<W: Write>(
        &self,
        file_id: &str,
        key: &[u8; crypto::FILE_KEY_SIZE],
        source: &dyn ShardSource,
        out: &mut W,
    ) -> Result<ShardHeader> {
        let available = source.list_shards(file_id)?;
        let headers: Vec<(String, ShardHeader)> = self.pool.install(|| {
            available
                .par_iter()
                .filter_map(|hash| match source.fetch_header(file_id, hash) {
                    Ok(header) if header.file_id == file_id => Some((hash.clone(), header)),
                    Ok(_) => None,
                    Err(e) => {
                        debug!(file_id, hash = %hash, error = %e, "Unreadable shard header");
                        None
                    }
                })
                .collect()
        });

        let reference = headers
            .iter()
            .map(|(_, header)| header)
            .find(|header| header.check_layout().is_ok() && header.verify_signature().is_ok())
            .cloned()
            .ok_or_else(|| DefsError::ReconstructInsufficient {
                available: 0,
                required: 1,
            })?;

        let k = reference.data_shards as usize;
        let m = reference.parity_shards as usize;
        let coder = ErasureCoder::new(k, m)?;
        let size = u64::try_from(reference.size)
            .map_err(|_| DefsError::Corrupt(shard::field::SIZE.to_string()))?;

        // Batch number to (input length, listed shards)
        let mut plans: BTreeMap<u32, (usize, Vec<(u32, String)>)> = BTreeMap::new();
        for (hash, header) in headers {
            let same_file = header.public_key == reference.public_key
                && header.data_shards == reference.data_shards
                && header.parity_shards == reference.parity_shards
                && header.size == reference.size;
            if !same_file || header.check_layout().is_err() || header.slice_hash != hash {
                debug!(file_id, index = header.index, "Ignoring inconsistent shard");
                continue;
            }
            let len = usize::try_from(header.batch_len)
                .map_err(|_| DefsError::Corrupt(shard::field::BATCHLEN.to_string()))?;
            plans
                .entry(header.batch)
                .or_insert_with(|| (len, Vec::new()))
                .1
                .push((header.index, hash));
        }

        let mut written = 0u64;
        for (expected, (batch, (len, members))) in (0u32..).zip(&plans) {
            if *batch != expected {
                warn!(file_id, batch = expected, "No shard of batch found");
                return Err(DefsError::ReconstructInsufficient {
                    available: 0,
                    required: k,
                });
            }
            self.rebuild_batch(&coder, file_id, key, source, &reference.public_key, members, *len, out)?;
            written += *len as u64;
        }
        if written != size {
            warn!(file_id, written, size, "Trailing batches missing");
            return Err(DefsError::ReconstructInsufficient {
                available: 0,
                required: k,
            });
        }
        Ok(reference)
    }

    #[allow(clippy::too_many_arguments)]
    fn rebuild_batch<W: Write>(
        &self,
        coder: &ErasureCoder,
        file_id: &str,
        key: &[u8; crypto::FILE_KEY_SIZE],
        source: &dyn ShardSource,
        owner_key: &[u8],
        members: &[(u32, String)],
        len: usize,
        out: &mut W,
    ) -> Result<()> {
        let k = coder.config().data_shards;
        let n = coder.config().total_shards();

        let fetched: Vec<(usize, Vec<u8>)> = self.pool.install(|| {
            members
                .par_iter()
                .filter_map(|(index, hash)| {
                    match fetch_verified(source, file_id, *index, hash, owner_key) {
                        Ok(content) => Some((
                            *index as usize % n,
                            crypto::apply_keystream(key, &content),
                        )),
                        Err(e) => {
                            warn!(
                                file_id,
                                index = *index,
                                error = %e,
                                kind = e.kind(),
                                "Discarding shard"
                            );
                            None
                        }
                    }
                })
                .collect()
        });

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; n];
        for (position, plain) in fetched {
            if let Some(slot) = shards.get_mut(position) {
                *slot = Some(plain);
            }
        }

        coder.reconstruct(&mut shards)?;
        let full: Vec<Vec<u8>> = shards.into_iter().flatten().collect();
        if !coder.verify(&full)? {
            return Err(DefsError::Corrupt("parity".to_string()));
        }
        coder.join(&full[..k], out, len)
    }

    /// Rebuild `file_id` into `downloads_dir/<name>` and check the file id of
    /// the output
    pub fn reconstruct_file(
        &self,
        file_id: &str,
        key: &[u8; crypto::FILE_KEY_SIZE],
        source: &dyn ShardSource,
        downloads_dir: &Path,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(downloads_dir)?;
        let partial = downloads_dir.join(format!(".{}.part", file_id));
        let mut writer = HashingWriter::new(BufWriter::new(File::create(&partial)?));

        let rebuilt = self
            .reconstruct_into(file_id, key, source, &mut writer)
            .and_then(|header| {
                let (file_hash, size) = writer.finish()?;
                if crypto::file_id_from_hash(&file_hash) != file_id {
                    return Err(DefsError::Corrupt(shard::field::FILEID.to_string()));
                }
                Ok((header, size))
            });
        let (header, size) = match rebuilt {
            Ok(rebuilt) => rebuilt,
            Err(e) => {
                let _ = std::fs::remove_file(&partial);
                return Err(e);
            }
        };

        let name = Path::new(&header.name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| file_id.to_string());
        let path = downloads_dir.join(name);
        std::fs::rename(&partial, &path)?;
        info!(file_id, path = %path.display(), size, "File reconstructed");
        Ok(path)
    }
}

/// Writer that hashes everything passing through it
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Flush and return the SHA-256 and length of the output
    fn finish(&mut self) -> Result<([u8; 32], u64)> {
        self.inner.flush()?;
        Ok((self.hasher.clone().finalize().into(), self.written))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Fetch one shard and run every integrity check; returns its ciphertext
fn fetch_verified(
    source: &dyn ShardSource,
    file_id: &str,
    index: u32,
    hash: &str,
    owner_key: &[u8],
) -> Result<Vec<u8>> {
    let bytes = source.fetch_shard(file_id, hash)?;
    let shard = Shard::from_bytes(&bytes)?;
    if shard.header.file_id != file_id || shard.header.index != index {
        return Err(DefsError::Corrupt(shard::field::INDEX.to_string()));
    }
    if shard.header.slice_hash != hash
        || shard.header.slice_table.get(index).map(|e| e.hash.as_str()) != Some(hash)
    {
        return Err(DefsError::Corrupt(shard::field::SLICEHASH.to_string()));
    }
    if shard.header.public_key != owner_key {
        return Err(DefsError::SignatureInvalid);
    }
    shard.verify()?;
    Ok(shard.content)
}
