//! Segmented object container
//!
//! A segmented object is a sequence of named, CRC-protected segments followed
//! by a cross-reference (xref) tail:
//!
//! ```text
//! segment := u32 type_len | type_name | u32 body_len | u32 crc32 | body
//! xref    := (u32 type_len | type_name | i64 offset | u32 length)*
//!            "startxref" | i64 xref_start
//! ```
//!
//! Appending a segment overwrites the old tail in place: the new segment is
//! written at the old `xref_start`, followed by the whole updated table. A
//! re-appended name points at its newest body; the older body stays on disk
//! unreferenced.

use crate::codec::{self, Value};
use crate::error::{DefsError, Result};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

/// Maximum segment name length in bytes
pub const MAX_TYPE_LEN: usize = 128;

/// Marker preceding the xref offset at the tail of every object
pub const XREF_MARKER: &[u8] = b"startxref";

/// Backward scan block size when locating the xref marker
const SCAN_BLOCK: u64 = 1024;

/// Bytes of the tail after the table: marker plus i64 offset
const TRAILER_LEN: u64 = XREF_MARKER.len() as u64 + 8;

/// Location of one segment inside an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XrefEntry {
    /// Byte position of the segment's `type_len` prefix
    pub offset: u64,
    /// Body length, excluding framing
    pub length: u32,
}

/// Cross-reference table mapping segment names to locations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XrefTable {
    entries: BTreeMap<String, XrefEntry>,
}

impl XrefTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&XrefEntry> {
        self.entries.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: XrefEntry) -> Option<XrefEntry> {
        self.entries.insert(name.into(), entry)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &XrefEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Serialize the table, the marker and `xref_start`
    fn encode_tail(&self, xref_start: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 32 + TRAILER_LEN as usize);
        for (name, entry) in &self.entries {
            out.extend_from_slice(&(name.len() as u32).to_be_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&(entry.offset as i64).to_be_bytes());
            out.extend_from_slice(&entry.length.to_be_bytes());
        }
        out.extend_from_slice(XREF_MARKER);
        out.extend_from_slice(&(xref_start as i64).to_be_bytes());
        out
    }

    /// Parse entries from `buf`, stopping at the first implausible name length
    fn decode_entries(buf: &[u8]) -> Self {
        let mut table = Self::new();
        let mut pos = 0usize;
        while pos + 4 <= buf.len() {
            let type_len = u32::from_be_bytes(read_array(&buf[pos..])) as usize;
            if type_len == 0 || type_len > MAX_TYPE_LEN {
                break;
            }
            let entry_len = 4 + type_len + 8 + 4;
            if pos + entry_len > buf.len() {
                break;
            }
            let name_bytes = &buf[pos + 4..pos + 4 + type_len];
            let Ok(name) = std::str::from_utf8(name_bytes) else {
                break;
            };
            let offset = i64::from_be_bytes(read_array(&buf[pos + 4 + type_len..]));
            let length = u32::from_be_bytes(read_array(&buf[pos + 12 + type_len..]));
            if offset < 0 {
                break;
            }
            table.insert(
                name,
                XrefEntry {
                    offset: offset as u64,
                    length,
                },
            );
            pos += entry_len;
        }
        table
    }
}

fn read_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&slice[..N]);
    out
}

/// Check that a segment name is 1..=128 bytes of printable ASCII
pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_TYPE_LEN
        && name.bytes().all(|b| (0x20..=0x7e).contains(&b));
    if ok {
        Ok(())
    } else {
        Err(DefsError::InvalidSegmentName(name.to_string()))
    }
}

/// Encode one segment frame
fn encode_frame(name: &str, body: &[u8]) -> Result<Vec<u8>> {
    let body_len = u32::try_from(body.len()).map_err(|_| DefsError::MessageTooLarge {
        size: body.len(),
        max: u32::MAX as usize,
    })?;
    let crc = if body.is_empty() {
        0
    } else {
        crc32fast::hash(body)
    };

    let mut frame = Vec::with_capacity(12 + name.len() + body.len());
    frame.extend_from_slice(&(name.len() as u32).to_be_bytes());
    frame.extend_from_slice(name.as_bytes());
    frame.extend_from_slice(&body_len.to_be_bytes());
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Locate the tail: returns `(xref_start, marker_pos)`.
///
/// Scans backwards in 1 KiB blocks for the last `startxref` marker that is
/// followed by a full 8-byte offset. Consecutive blocks overlap so a marker
/// straddling a block boundary is still found.
pub fn locate_xref<R: Read + Seek>(r: &mut R) -> Result<(u64, u64)> {
    let len = r.seek(SeekFrom::End(0))?;
    if len < TRAILER_LEN {
        return Err(DefsError::XrefNotFound);
    }

    let overlap = TRAILER_LEN - 1;
    let mut block_end = len;
    loop {
        let block_start = block_end.saturating_sub(SCAN_BLOCK);
        let read_end = (block_end + overlap).min(len);
        let mut buf = vec![0u8; (read_end - block_start) as usize];
        r.seek(SeekFrom::Start(block_start))?;
        r.read_exact(&mut buf)?;

        let found = buf
            .windows(XREF_MARKER.len())
            .enumerate()
            .rev()
            .map(|(i, _)| i)
            .find(|&i| {
                buf[i..].starts_with(XREF_MARKER)
                    && block_start + i as u64 + TRAILER_LEN <= len
            });

        if let Some(i) = found {
            let marker_pos = block_start + i as u64;
            let mut offset = [0u8; 8];
            r.seek(SeekFrom::Start(marker_pos + XREF_MARKER.len() as u64))?;
            r.read_exact(&mut offset)?;
            let xref_start = i64::from_be_bytes(offset);
            if xref_start < 0 || xref_start as u64 > marker_pos {
                return Err(DefsError::Corrupt("startxref".to_string()));
            }
            return Ok((xref_start as u64, marker_pos));
        }

        if block_start == 0 {
            return Err(DefsError::XrefNotFound);
        }
        block_end = block_start;
    }
}

/// Read the xref table of an existing object: returns `(table, xref_start)`
pub fn read_xref<R: Read + Seek>(r: &mut R) -> Result<(XrefTable, u64)> {
    let (xref_start, marker_pos) = locate_xref(r)?;
    let mut buf = vec![0u8; (marker_pos - xref_start) as usize];
    r.seek(SeekFrom::Start(xref_start))?;
    r.read_exact(&mut buf)?;
    Ok((XrefTable::decode_entries(&buf), xref_start))
}

/// Read and CRC-check the body at `entry`
fn read_body<R: Read + Seek>(r: &mut R, name: &str, entry: &XrefEntry) -> Result<Vec<u8>> {
    let corrupt = || DefsError::Corrupt(name.to_string());

    r.seek(SeekFrom::Start(entry.offset))?;
    let mut word = [0u8; 4];
    r.read_exact(&mut word)?;
    let type_len = u32::from_be_bytes(word) as usize;
    if type_len != name.len() {
        return Err(corrupt());
    }
    let mut stored_name = vec![0u8; type_len];
    r.read_exact(&mut stored_name)?;
    if stored_name != name.as_bytes() {
        return Err(corrupt());
    }

    r.read_exact(&mut word)?;
    let body_len = u32::from_be_bytes(word);
    if body_len != entry.length {
        return Err(corrupt());
    }
    r.read_exact(&mut word)?;
    let crc = u32::from_be_bytes(word);

    let mut body = vec![0u8; body_len as usize];
    r.read_exact(&mut body).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => corrupt(),
        _ => DefsError::Io(e),
    })?;

    let expected = if body.is_empty() {
        0
    } else {
        crc32fast::hash(&body)
    };
    if crc != expected {
        return Err(corrupt());
    }
    Ok(body)
}

/// Appending writer over a segmented object
pub struct SegmentWriter<F> {
    inner: F,
    xref: XrefTable,
    xref_start: u64,
}

impl<F: Read + Write + Seek> SegmentWriter<F> {
    /// Start a new, empty object at the beginning of `inner`
    pub fn create(mut inner: F) -> Result<Self> {
        let xref = XrefTable::new();
        inner.seek(SeekFrom::Start(0))?;
        inner.write_all(&xref.encode_tail(0))?;
        Ok(Self {
            inner,
            xref,
            xref_start: 0,
        })
    }

    /// Open an existing object for appending
    pub fn open(mut inner: F) -> Result<Self> {
        let (xref, xref_start) = read_xref(&mut inner)?;
        Ok(Self {
            inner,
            xref,
            xref_start,
        })
    }

    /// Append a segment, rewriting the tail. Re-using a name supersedes the
    /// previous body.
    pub fn write_segment(&mut self, name: &str, body: &[u8]) -> Result<XrefEntry> {
        validate_name(name)?;

        let offset = self.xref_start;
        let frame = encode_frame(name, body)?;
        let entry = XrefEntry {
            offset,
            length: body.len() as u32,
        };
        let new_xref_start = offset + frame.len() as u64;

        let mut table = self.xref.clone();
        table.insert(name, entry);

        // Stage segment and tail into one buffer so the rewrite is a single write.
        let mut staged = frame;
        staged.extend_from_slice(&table.encode_tail(new_xref_start));

        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.write_all(&staged)?;

        self.xref = table;
        self.xref_start = new_xref_start;
        debug!(segment = name, offset, length = body.len(), "Segment written");
        Ok(entry)
    }

    /// Append a segment whose body is a tag-prefixed value
    pub fn write_value(&mut self, name: &str, value: &Value) -> Result<XrefEntry> {
        self.write_segment(name, &codec::encode(value))
    }

    pub fn xref(&self) -> &XrefTable {
        &self.xref
    }

    pub fn xref_start(&self) -> u64 {
        self.xref_start
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> F {
        self.inner
    }
}

/// Random-access reader over a segmented object
pub struct SegmentReader<F> {
    inner: F,
    xref: XrefTable,
    xref_start: u64,
}

impl<F: Read + Seek> SegmentReader<F> {
    pub fn open(mut inner: F) -> Result<Self> {
        let (xref, xref_start) = read_xref(&mut inner)?;
        Ok(Self {
            inner,
            xref,
            xref_start,
        })
    }

    /// Read a raw segment body, verifying its CRC
    pub fn read_segment(&mut self, name: &str) -> Result<Vec<u8>> {
        let entry = *self
            .xref
            .get(name)
            .ok_or_else(|| DefsError::NoSuchField(name.to_string()))?;
        read_body(&mut self.inner, name, &entry)
    }

    /// Read and decode a tag-prefixed segment
    pub fn read_value(&mut self, name: &str) -> Result<Value> {
        let body = self.read_segment(name)?;
        codec::decode(&body)
    }

    /// Read every segment, verifying each body
    pub fn read_all(&mut self) -> Result<BTreeMap<String, Vec<u8>>> {
        let names: Vec<String> = self.xref.names().map(str::to_string).collect();
        let mut out = BTreeMap::new();
        for name in names {
            let body = self.read_segment(&name)?;
            out.insert(name, body);
        }
        Ok(out)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.xref.contains(name)
    }

    pub fn xref(&self) -> &XrefTable {
        &self.xref
    }

    pub fn xref_start(&self) -> u64 {
        self.xref_start
    }

    pub fn into_inner(self) -> F {
        self.inner
    }
}

/// Create a new object file, holding an exclusive lock until the writer drops
pub fn create_file(path: impl AsRef<Path>) -> Result<SegmentWriter<File>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path.as_ref())?;
    file.lock_exclusive()?;
    SegmentWriter::create(file)
}

/// Open an existing object file for appending under an exclusive lock
pub fn open_file_for_append(path: impl AsRef<Path>) -> Result<SegmentWriter<File>> {
    let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
    file.lock_exclusive()?;
    SegmentWriter::open(file)
}

/// Open an object file for reading under a shared lock
pub fn open_file(path: impl AsRef<Path>) -> Result<SegmentReader<File>> {
    let file = File::open(path.as_ref())?;
    file.lock_shared()?;
    SegmentReader::open(file)
}

/// Serialize a full object in memory from `(name, body)` pairs, in order
pub fn build_object<'a, I>(segments: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut writer = SegmentWriter::create(std::io::Cursor::new(Vec::new()))?;
    for (name, body) in segments {
        writer.write_segment(name, body)?;
    }
    Ok(writer.into_inner().into_inner())
}
