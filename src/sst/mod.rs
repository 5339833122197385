//! Sorted table format of the SST files the differ backs up and rewrites.
//!
//! File layout:
//! ```text
//! [data blocks...]
//! [index block]
//! [properties block]
//! [footer]
//! [magic]
//! ```
//!
//! Data block format:
//! ```text
//! [count u32]
//! repeated count times:
//!   [internal_key]
//!   [val_len u32][val bytes]
//! [trailer]
//! ```
//!
//! Trailer format:
//! - crc32c(u32) over block payload (everything before trailer)
//! - blake3(32 bytes) over block payload
//!
//! Index block entries map `last_internal_key_in_block -> {offset,len}`. The
//! reader exposes every entry, tombstones and shadowed versions included,
//! since a value-stripped copy must keep the exact key sequence.

mod strip;

use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::internal_key::{DecodeError, InternalKey};

pub use strip::{strip_values, StripStats};

/// Extension of SST files, including the leading dot.
pub const SST_FILE_EXTENSION: &str = ".sst";

#[derive(Debug, thiserror::Error)]
pub enum SstError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("sst corrupt: {0}")]
    Corrupt(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRoot(pub [u8; 32]);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SstProperties {
    pub smallest_user_key: Bytes,
    pub largest_user_key: Bytes,
    pub max_seqno: u64,
    pub entries: u64,
    pub tombstones: u64,
    pub data_bytes: u64,
    pub index_bytes: u64,
    pub table_root: TableRoot,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct BlockHandle {
    offset: u64,
    len: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    last_key: InternalKey,
    handle: BlockHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Footer {
    index_offset: u64,
    index_len: u32,
    props_offset: u64,
    props_len: u32,
    table_root: TableRoot,
}

const MAGIC: &[u8; 8] = b"LYRDIFF1";
const FOOTER_SIZE: usize = 8 + 4 + 8 + 4 + 32;
const BLOCK_TRAILER_SIZE: usize = 4 + 32;

/// Streams sorted entries into a new SST at an exact path.
///
/// Callers that need atomic replacement write to a temporary name and rename
/// it once [`SstWriter::finish`] returns.
pub struct SstWriter {
    block_size: usize,
    file: std::fs::File,
    path: PathBuf,
    buf: Vec<u8>,
    entries_in_block: u32,
    last_key: Option<InternalKey>,
    index: Vec<IndexEntry>,
    smallest_user_key: Option<Bytes>,
    largest_user_key: Option<Bytes>,
    max_seqno: u64,
    entries: u64,
    tombstones: u64,
    data_bytes: u64,
    table_hasher: blake3::Hasher,
}

impl SstWriter {
    pub fn create(path: impl AsRef<Path>, block_size: usize) -> Result<Self, SstError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)?;
        let block_size = block_size.max(64);
        Ok(Self {
            block_size,
            file,
            path,
            buf: Vec::with_capacity(block_size + 256),
            entries_in_block: 0,
            last_key: None,
            index: Vec::new(),
            smallest_user_key: None,
            largest_user_key: None,
            max_seqno: 0,
            entries: 0,
            tombstones: 0,
            data_bytes: 0,
            table_hasher: blake3::Hasher::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<(), SstError> {
        if let Some(last) = &self.last_key {
            if key <= last {
                return Err(SstError::Corrupt(
                    "internal keys must be added in strictly sorted order",
                ));
            }
        }

        if self.smallest_user_key.is_none() {
            self.smallest_user_key = Some(key.user_key.clone());
        }
        self.largest_user_key = Some(key.user_key.clone());
        self.last_key = Some(key.clone());
        self.max_seqno = self.max_seqno.max(key.seqno);
        self.entries += 1;
        if key.kind.is_tombstone() {
            self.tombstones += 1;
        }

        if self.entries_in_block == 0 {
            self.buf.extend_from_slice(&0u32.to_le_bytes());
        }
        key.encode_into(&mut self.buf)?;
        let val_len: u32 = value
            .len()
            .try_into()
            .map_err(|_| SstError::Corrupt("value too large"))?;
        self.buf.extend_from_slice(&val_len.to_le_bytes());
        self.buf.extend_from_slice(value);
        self.entries_in_block += 1;
        self.buf[0..4].copy_from_slice(&self.entries_in_block.to_le_bytes());

        if self.buf.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<SstProperties, SstError> {
        if self.entries_in_block > 0 {
            self.flush_block()?;
        }

        let index_offset = self.file.stream_position()?;
        let index_bytes =
            bincode::serialize(&self.index).map_err(|_| SstError::Corrupt("index serialize"))?;
        self.file.write_all(&index_bytes)?;
        let index_len: u32 = index_bytes
            .len()
            .try_into()
            .map_err(|_| SstError::Corrupt("index too large"))?;

        let props_offset = self.file.stream_position()?;
        self.table_hasher.update(&index_bytes);
        let table_root = TableRoot(*self.table_hasher.finalize().as_bytes());
        let props = SstProperties {
            smallest_user_key: self.smallest_user_key.take().unwrap_or_default(),
            largest_user_key: self.largest_user_key.take().unwrap_or_default(),
            max_seqno: self.max_seqno,
            entries: self.entries,
            tombstones: self.tombstones,
            data_bytes: self.data_bytes,
            index_bytes: index_bytes.len() as u64,
            table_root,
        };
        let props_bytes =
            bincode::serialize(&props).map_err(|_| SstError::Corrupt("props serialize"))?;
        let props_len: u32 = props_bytes
            .len()
            .try_into()
            .map_err(|_| SstError::Corrupt("props too large"))?;
        self.file.write_all(&props_bytes)?;

        let footer = Footer {
            index_offset,
            index_len,
            props_offset,
            props_len,
            table_root,
        };
        self.file.write_all(&encode_footer(&footer))?;
        self.file.sync_data()?;
        Ok(props)
    }

    fn flush_block(&mut self) -> Result<(), SstError> {
        let payload_len = self.buf.len();
        let crc = crc32c::crc32c(&self.buf);
        let hash = blake3::hash(&self.buf);
        self.table_hasher.update(hash.as_bytes());
        self.buf.extend_from_slice(&crc.to_le_bytes());
        self.buf.extend_from_slice(hash.as_bytes());

        let offset = self.file.stream_position()?;
        self.file.write_all(&self.buf)?;
        let len: u32 = self
            .buf
            .len()
            .try_into()
            .map_err(|_| SstError::Corrupt("block too large"))?;

        let last_key = self
            .last_key
            .clone()
            .ok_or(SstError::Corrupt("missing last key"))?;
        self.index.push(IndexEntry {
            last_key,
            handle: BlockHandle { offset, len },
        });

        self.data_bytes += payload_len as u64;
        self.buf.clear();
        self.entries_in_block = 0;
        Ok(())
    }
}

pub struct SstReader {
    path: PathBuf,
    mmap: Mmap,
    index: Vec<IndexEntry>,
    props: SstProperties,
}

impl std::fmt::Debug for SstReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SstReader")
            .field("path", &self.path)
            .field("blocks", &self.index.len())
            .field("entries", &self.props.entries)
            .finish()
    }
}

impl SstReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SstError> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::open(&path)?;
        // SAFETY: backed-up SSTs are only replaced by rename, never rewritten
        // in place, so the mapping stays valid for the reader's lifetime.
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < MAGIC.len() + FOOTER_SIZE {
            return Err(SstError::Corrupt("file too small"));
        }
        if &mmap[(mmap.len() - MAGIC.len())..] != MAGIC {
            return Err(SstError::Corrupt("bad magic"));
        }

        let footer_offset = mmap.len() - (MAGIC.len() + FOOTER_SIZE);
        let footer = decode_footer(&mmap[footer_offset..(footer_offset + FOOTER_SIZE)])?;

        let index_range = checked_range(footer.index_offset, u64::from(footer.index_len), footer_offset)
            .ok_or(SstError::Corrupt("bad footer offsets"))?;
        let props_range = checked_range(footer.props_offset, u64::from(footer.props_len), footer_offset)
            .ok_or(SstError::Corrupt("bad footer offsets"))?;

        let index: Vec<IndexEntry> = bincode::deserialize(&mmap[index_range])
            .map_err(|_| SstError::Corrupt("index decode"))?;
        let props: SstProperties = bincode::deserialize(&mmap[props_range])
            .map_err(|_| SstError::Corrupt("props decode"))?;
        if props.table_root != footer.table_root {
            return Err(SstError::Corrupt("table root mismatch"));
        }

        Ok(Self {
            path,
            mmap,
            index,
            props,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn properties(&self) -> &SstProperties {
        &self.props
    }

    /// Iterates every entry in file order.
    pub fn iter(&self) -> SstIter<'_> {
        SstIter {
            reader: self,
            index_pos: 0,
            entries: Vec::new(),
            entry_pos: 0,
        }
    }

    fn read_block(&self, handle: BlockHandle) -> Result<Vec<(InternalKey, Bytes)>, SstError> {
        let range = checked_range(handle.offset, u64::from(handle.len), self.mmap.len())
            .ok_or(SstError::Corrupt("block handle out of bounds"))?;
        let (start, end) = (range.start, range.end);
        if handle.len as usize <= BLOCK_TRAILER_SIZE {
            return Err(SstError::Corrupt("block too small"));
        }

        let payload_end = end - BLOCK_TRAILER_SIZE;
        let payload = &self.mmap[start..payload_end];
        let crc_expected = read_u32(&self.mmap[payload_end..])?;
        let hash_expected = &self.mmap[(payload_end + 4)..end];

        if crc32c::crc32c(payload) != crc_expected {
            return Err(SstError::Corrupt("block crc mismatch"));
        }
        if blake3::hash(payload).as_bytes() != hash_expected {
            return Err(SstError::Corrupt("block hash mismatch"));
        }

        let count = read_u32(payload)? as usize;
        let mut offset = 4usize;
        let mut out = Vec::with_capacity(count.min(payload.len()));
        for _ in 0..count {
            let rest = payload
                .get(offset..)
                .ok_or(SstError::Corrupt("truncated block"))?;
            let (ikey, used) = InternalKey::decode(rest)?;
            offset += used;
            let val_len = read_u32(payload.get(offset..).unwrap_or(&[]))? as usize;
            offset += 4;
            if offset.checked_add(val_len).map_or(true, |end| end > payload.len()) {
                return Err(SstError::Corrupt("truncated value bytes"));
            }
            let value = Bytes::copy_from_slice(&payload[offset..(offset + val_len)]);
            offset += val_len;
            out.push((ikey, value));
        }
        Ok(out)
    }
}

pub struct SstIter<'a> {
    reader: &'a SstReader,
    index_pos: usize,
    entries: Vec<(InternalKey, Bytes)>,
    entry_pos: usize,
}

impl Iterator for SstIter<'_> {
    type Item = Result<(InternalKey, Bytes), SstError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.entry_pos >= self.entries.len() {
            let handle = self.reader.index.get(self.index_pos)?.handle;
            self.index_pos += 1;
            match self.reader.read_block(handle) {
                Ok(entries) => {
                    self.entries = entries;
                    self.entry_pos = 0;
                }
                Err(e) => {
                    self.index_pos = self.reader.index.len();
                    return Some(Err(e));
                }
            }
        }
        let entry = self.entries[self.entry_pos].clone();
        self.entry_pos += 1;
        Some(Ok(entry))
    }
}

/// `offset..offset + len` when it lies within `limit`, without overflowing.
fn checked_range(offset: u64, len: u64, limit: usize) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    (end <= limit).then_some(start..end)
}

fn read_u32(input: &[u8]) -> Result<u32, SstError> {
    input
        .get(0..4)
        .and_then(|s| s.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(SstError::Corrupt("truncated u32"))
}

fn read_u64(input: &[u8]) -> Result<u64, SstError> {
    input
        .get(0..8)
        .and_then(|s| s.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or(SstError::Corrupt("truncated u64"))
}

fn encode_footer(footer: &Footer) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FOOTER_SIZE + MAGIC.len());
    buf.extend_from_slice(&footer.index_offset.to_le_bytes());
    buf.extend_from_slice(&footer.index_len.to_le_bytes());
    buf.extend_from_slice(&footer.props_offset.to_le_bytes());
    buf.extend_from_slice(&footer.props_len.to_le_bytes());
    buf.extend_from_slice(&footer.table_root.0);
    debug_assert_eq!(buf.len(), FOOTER_SIZE);
    buf.extend_from_slice(MAGIC);
    buf
}

fn decode_footer(input: &[u8]) -> Result<Footer, SstError> {
    if input.len() != FOOTER_SIZE {
        return Err(SstError::Corrupt("bad footer size"));
    }
    let mut table_root = [0u8; 32];
    table_root.copy_from_slice(&input[24..56]);
    Ok(Footer {
        index_offset: read_u64(&input[0..])?,
        index_len: read_u32(&input[8..])?,
        props_offset: read_u64(&input[12..])?,
        props_len: read_u32(&input[20..])?,
        table_root: TableRoot(table_root),
    })
}

/// File name of an SST path with the `.sst` extension removed.
///
/// Returns `None` when the path does not name an SST file.
pub fn sst_file_stem(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(SST_FILE_EXTENSION)?;
    (!stem.is_empty()).then_some(stem)
}

/// Name of the SST file for `file_name` inside `dir`.
pub fn sst_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(format!("{file_name}{SST_FILE_EXTENSION}"))
}

pub(crate) fn fsync_parent_dir(path: &Path) -> Result<(), SstError> {
    let parent = path
        .parent()
        .ok_or(SstError::Corrupt("missing parent dir"))?;
    std::fs::File::open(parent)?.sync_all()?;
    Ok(())
}
