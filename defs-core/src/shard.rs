//! Shard objects
//!
//! Every shard of a file is stored as one segmented object. The segment names
//! and their value types are fixed (see [`field`]); `CONTENT` holds the raw
//! ciphertext while every other segment is a tag-prefixed value.
//!
//! A file larger than one erasure batch is coded in several batches of
//! `k + m` shards. `INDEX` is numbered across the whole file, `BATCH` names
//! the batch the shard belongs to and `BATCHLEN` the input bytes that batch
//! covers. Objects without the batch segments are single-batch shards.

use crate::codec::Value;
use crate::crypto::{self, PublicKey};
use crate::error::{DefsError, Result};
use crate::segment::{SegmentReader, SegmentWriter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, Write};

/// Segment names of a shard object
pub mod field {
    pub const FILEID: &str = "FILEID";
    pub const NAME: &str = "NAME";
    pub const SIZE: &str = "SIZE";
    pub const MODTIME: &str = "MODTIME";
    pub const UPLOADTIME: &str = "UPLOADTIME";
    pub const PUBLICKEY: &str = "PUBLICKEY";
    pub const SLICETABLE: &str = "SLICETABLE";
    pub const SLICEHASH: &str = "SLICEHASH";
    pub const INDEX: &str = "INDEX";
    pub const DATASHARDS: &str = "DATASHARDS";
    pub const PARITYSHARDS: &str = "PARITYSHARDS";
    pub const CONTENT: &str = "CONTENT";
    pub const SIGNATURE: &str = "SIGNATURE";
    pub const SHARED: &str = "SHARED";
    pub const P2PKHSCRIPT: &str = "P2PKHSCRIPT";
    pub const VERSION: &str = "VERSION";
    pub const BATCH: &str = "BATCH";
    pub const BATCHLEN: &str = "BATCHLEN";
}

/// Format version written into every shard
pub const SHARD_VERSION: &str = "1.0.0";

/// One row of a file's slice table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceEntry {
    pub index: u32,
    /// Hex SHA-256 of the shard ciphertext
    pub hash: String,
    pub is_parity: bool,
}

/// Index of every shard of a file, keyed by shard index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceTable {
    entries: BTreeMap<u32, SliceEntry>,
}

impl SliceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: SliceEntry) -> Option<SliceEntry> {
        self.entries.insert(entry.index, entry)
    }

    pub fn get(&self, index: u32) -> Option<&SliceEntry> {
        self.entries.get(&index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in index order
    pub fn entries(&self) -> impl Iterator<Item = &SliceEntry> {
        self.entries.values()
    }

    /// Number of data (non-parity) shards
    pub fn total_pieces(&self) -> usize {
        self.entries.values().filter(|e| !e.is_parity).count()
    }

    pub fn parity_pieces(&self) -> usize {
        self.entries.values().filter(|e| e.is_parity).count()
    }

    pub fn contains_hash(&self, hash: &str) -> bool {
        self.entries.values().any(|e| e.hash == hash)
    }

    /// Canonical encoding: `u32 count`, then per entry in index order
    /// `u32 index | u8 is_parity | u32 hash_len | hash`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.entries.len() * 73);
        out.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for entry in self.entries.values() {
            out.extend_from_slice(&entry.index.to_be_bytes());
            out.push(u8::from(entry.is_parity));
            out.extend_from_slice(&(entry.hash.len() as u32).to_be_bytes());
            out.extend_from_slice(entry.hash.as_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let corrupt = || DefsError::Corrupt(field::SLICETABLE.to_string());
        let mut cursor = bytes;

        let count = take_u32(&mut cursor).ok_or_else(corrupt)?;
        let mut table = Self::new();
        for _ in 0..count {
            let index = take_u32(&mut cursor).ok_or_else(corrupt)?;
            let (&flag, rest) = cursor.split_first().ok_or_else(corrupt)?;
            cursor = rest;
            let is_parity = match flag {
                0 => false,
                1 => true,
                _ => return Err(corrupt()),
            };
            let hash_len = take_u32(&mut cursor).ok_or_else(corrupt)? as usize;
            if cursor.len() < hash_len {
                return Err(corrupt());
            }
            let (hash, rest) = cursor.split_at(hash_len);
            cursor = rest;
            let hash = std::str::from_utf8(hash).map_err(|_| corrupt())?;

            let entry = SliceEntry {
                index,
                hash: hash.to_string(),
                is_parity,
            };
            if table.insert(entry).is_some() {
                return Err(corrupt());
            }
        }
        if !cursor.is_empty() {
            return Err(corrupt());
        }
        Ok(table)
    }
}

fn take_u32(cursor: &mut &[u8]) -> Option<u32> {
    if cursor.len() < 4 {
        return None;
    }
    let (head, rest) = cursor.split_at(4);
    *cursor = rest;
    Some(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
}

/// Canonical signing input:
/// `file_id | shard_hash | u32_be(index) | slice_table_bytes | owner_public_key`
pub fn signing_input(
    file_id: &str,
    shard_hash: &str,
    index: u32,
    slice_table_bytes: &[u8],
    public_key: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        file_id.len() + shard_hash.len() + 4 + slice_table_bytes.len() + public_key.len(),
    );
    out.extend_from_slice(file_id.as_bytes());
    out.extend_from_slice(shard_hash.as_bytes());
    out.extend_from_slice(&index.to_be_bytes());
    out.extend_from_slice(slice_table_bytes);
    out.extend_from_slice(public_key);
    out
}

/// Every shard segment except `CONTENT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardHeader {
    pub file_id: String,
    pub name: String,
    /// Original file size in bytes
    pub size: i64,
    pub mod_time: i64,
    pub upload_time: i64,
    /// Compressed owner public key
    pub public_key: Vec<u8>,
    pub slice_table: SliceTable,
    pub slice_hash: String,
    /// File-wide shard index
    pub index: u32,
    pub batch: u32,
    /// Input bytes covered by this shard's batch
    pub batch_len: i64,
    pub data_shards: u32,
    pub parity_shards: u32,
    /// DER signature over [`ShardHeader::signing_input`]
    pub signature: Vec<u8>,
    pub shared: bool,
    pub p2pkh_script: Vec<u8>,
    pub version: String,
}

impl ShardHeader {
    pub fn shards_per_batch(&self) -> u32 {
        self.data_shards + self.parity_shards
    }

    /// Index of the shard within its batch
    pub fn position(&self) -> u32 {
        self.index % self.shards_per_batch().max(1)
    }

    pub fn is_parity(&self) -> bool {
        self.position() >= self.data_shards
    }

    /// `BATCH` must match the signed `INDEX`, and the batch must fit in
    /// `SIZE`
    pub fn check_layout(&self) -> Result<()> {
        let per_batch = self.shards_per_batch();
        if self.data_shards == 0 || self.index / per_batch != self.batch {
            return Err(DefsError::Corrupt(field::BATCH.to_string()));
        }
        if self.batch_len < 0 || self.batch_len > self.size {
            return Err(DefsError::Corrupt(field::BATCHLEN.to_string()));
        }
        Ok(())
    }

    pub fn signing_input(&self) -> Vec<u8> {
        signing_input(
            &self.file_id,
            &self.slice_hash,
            self.index,
            &self.slice_table.to_bytes(),
            &self.public_key,
        )
    }

    /// Check `SIGNATURE` under `PUBLICKEY`
    pub fn verify_signature(&self) -> Result<()> {
        let key = PublicKey::from_sec1_bytes(&self.public_key)?;
        if key.verify(&self.signing_input(), &self.signature) {
            Ok(())
        } else {
            Err(DefsError::SignatureInvalid)
        }
    }

    /// Read the header segments of a shard object, skipping `CONTENT`
    pub fn read<F: Read + Seek>(reader: &mut SegmentReader<F>) -> Result<Self> {
        let slice_table_bytes = read_bytes(reader, field::SLICETABLE)?;
        let size = read_i64(reader, field::SIZE)?;
        Ok(Self {
            file_id: read_string(reader, field::FILEID)?,
            name: optional(read_string(reader, field::NAME))?.unwrap_or_default(),
            size,
            mod_time: optional(read_i64(reader, field::MODTIME))?.unwrap_or_default(),
            upload_time: optional(read_i64(reader, field::UPLOADTIME))?.unwrap_or_default(),
            public_key: read_bytes(reader, field::PUBLICKEY)?,
            slice_table: SliceTable::from_bytes(&slice_table_bytes)?,
            slice_hash: read_string(reader, field::SLICEHASH)?,
            index: read_u32(reader, field::INDEX)?,
            batch: optional(read_u32(reader, field::BATCH))?.unwrap_or(0),
            batch_len: match optional(read_i64(reader, field::BATCHLEN))? {
                Some(len) => len,
                None => size,
            },
            data_shards: read_u32(reader, field::DATASHARDS)?,
            parity_shards: read_u32(reader, field::PARITYSHARDS)?,
            signature: read_bytes(reader, field::SIGNATURE)?,
            shared: optional(read_bool(reader, field::SHARED))?.unwrap_or(false),
            p2pkh_script: read_bytes(reader, field::P2PKHSCRIPT)?,
            version: optional(read_string(reader, field::VERSION))?
                .unwrap_or_else(|| SHARD_VERSION.to_string()),
        })
    }

    /// Append every header segment through `writer`
    pub fn write<F: Read + Write + Seek>(&self, writer: &mut SegmentWriter<F>) -> Result<()> {
        writer.write_value(field::FILEID, &Value::from(self.file_id.as_str()))?;
        writer.write_value(field::NAME, &Value::from(self.name.as_str()))?;
        writer.write_value(field::SIZE, &Value::Int64(self.size))?;
        writer.write_value(field::MODTIME, &Value::Int64(self.mod_time))?;
        writer.write_value(field::UPLOADTIME, &Value::Int64(self.upload_time))?;
        writer.write_value(field::PUBLICKEY, &Value::Bytes(self.public_key.clone()))?;
        writer.write_value(field::SLICETABLE, &Value::Bytes(self.slice_table.to_bytes()))?;
        writer.write_value(field::SLICEHASH, &Value::from(self.slice_hash.as_str()))?;
        writer.write_value(field::INDEX, &Value::Uint32(self.index))?;
        writer.write_value(field::DATASHARDS, &Value::Uint32(self.data_shards))?;
        writer.write_value(field::PARITYSHARDS, &Value::Uint32(self.parity_shards))?;
        writer.write_value(field::SIGNATURE, &Value::Bytes(self.signature.clone()))?;
        writer.write_value(field::SHARED, &Value::Bool(self.shared))?;
        writer.write_value(field::P2PKHSCRIPT, &Value::Bytes(self.p2pkh_script.clone()))?;
        writer.write_value(field::VERSION, &Value::from(self.version.as_str()))?;
        writer.write_value(field::BATCH, &Value::Uint32(self.batch))?;
        writer.write_value(field::BATCHLEN, &Value::Int64(self.batch_len))?;
        Ok(())
    }
}

/// A complete shard: header segments plus ciphertext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub header: ShardHeader,
    pub content: Vec<u8>,
}

impl Shard {
    /// Write the shard as a new segmented object
    pub fn write<F: Read + Write + Seek>(&self, writer: &mut SegmentWriter<F>) -> Result<()> {
        self.header.write(writer)?;
        writer.write_segment(field::CONTENT, &self.content)?;
        Ok(())
    }

    /// Serialize into an in-memory object
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = SegmentWriter::create(Cursor::new(Vec::new()))?;
        self.write(&mut writer)?;
        Ok(writer.into_inner().into_inner())
    }

    pub fn read<F: Read + Seek>(reader: &mut SegmentReader<F>) -> Result<Self> {
        let header = ShardHeader::read(reader)?;
        let content = reader.read_segment(field::CONTENT)?;
        Ok(Self { header, content })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = SegmentReader::open(Cursor::new(bytes))?;
        Self::read(&mut reader)
    }

    /// `SHA256(CONTENT) == SLICEHASH`
    pub fn verify_content(&self) -> Result<()> {
        if hex::encode(crypto::sha256(&self.content)) == self.header.slice_hash {
            Ok(())
        } else {
            Err(DefsError::Corrupt(field::SLICEHASH.to_string()))
        }
    }

    /// Batch layout, content hash, then signature
    pub fn verify(&self) -> Result<()> {
        self.header.check_layout()?;
        self.verify_content()?;
        self.header.verify_signature()
    }
}

fn optional<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(DefsError::NoSuchField(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn wrong_type(name: &str) -> DefsError {
    DefsError::Corrupt(name.to_string())
}

pub fn read_string<F: Read + Seek>(reader: &mut SegmentReader<F>, name: &str) -> Result<String> {
    match reader.read_value(name)? {
        Value::String(s) => Ok(s),
        _ => Err(wrong_type(name)),
    }
}

pub fn read_bytes<F: Read + Seek>(reader: &mut SegmentReader<F>, name: &str) -> Result<Vec<u8>> {
    match reader.read_value(name)? {
        Value::Bytes(b) => Ok(b),
        _ => Err(wrong_type(name)),
    }
}

pub fn read_i64<F: Read + Seek>(reader: &mut SegmentReader<F>, name: &str) -> Result<i64> {
    reader
        .read_value(name)?
        .as_i64()
        .ok_or_else(|| wrong_type(name))
}

pub fn read_u32<F: Read + Seek>(reader: &mut SegmentReader<F>, name: &str) -> Result<u32> {
    reader
        .read_value(name)?
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| wrong_type(name))
}

pub fn read_bool<F: Read + Seek>(reader: &mut SegmentReader<F>, name: &str) -> Result<bool> {
    reader
        .read_value(name)?
        .as_bool()
        .ok_or_else(|| wrong_type(name))
}
