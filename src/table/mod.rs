//! Ordered key/value tables the differ persists its history into.
//!
//! The host store normally provides these as column families. [`FileTable`]
//! is a self-contained implementation for deployments (and tests) that keep
//! the differ's metadata outside the store: an append-only record file that
//! is replayed into memory on open.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("table {path:?} corrupt at offset {offset}: {reason}")]
    Corrupt {
        path: PathBuf,
        offset: usize,
        reason: &'static str,
    },
}

/// Minimal ordered table interface.
pub trait KvTable: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, TableError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), TableError>;

    fn delete(&self, key: &[u8]) -> Result<(), TableError>;

    /// Snapshot of every entry in ascending key order.
    fn scan(&self) -> Result<Vec<(Bytes, Bytes)>, TableError>;

    fn is_empty(&self) -> Result<bool, TableError>;
}

#[derive(Debug, Default)]
pub struct MemoryTable {
    entries: RwLock<BTreeMap<Bytes, Bytes>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvTable for MemoryTable {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, TableError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), TableError> {
        self.entries
            .write()
            .insert(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), TableError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(Bytes, Bytes)>, TableError> {
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn is_empty(&self) -> Result<bool, TableError> {
        Ok(self.entries.read().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum TableRecord {
    Put { key: Bytes, value: Bytes },
    Delete { key: Bytes },
}

/// Options for [`FileTable`].
#[derive(Debug, Clone)]
pub struct FileTableOptions {
    /// fsync after every mutation.
    pub sync_writes: bool,
    /// Rewrite the record file on open once it holds this many times more
    /// records than live keys.
    pub rewrite_ratio: usize,
}

impl Default for FileTableOptions {
    fn default() -> Self {
        Self {
            sync_writes: true,
            rewrite_ratio: 4,
        }
    }
}

struct FileTableState {
    file: std::fs::File,
    entries: BTreeMap<Bytes, Bytes>,
}

/// Durable table backed by a single record file.
///
/// Record framing: `[len u32][crc32c u32][bincode payload]`. A torn record at
/// the tail (crash mid-append) is dropped on replay and truncated away.
pub struct FileTable {
    path: PathBuf,
    options: FileTableOptions,
    state: Mutex<FileTableState>,
}

impl std::fmt::Debug for FileTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTable")
            .field("path", &self.path)
            .field("entries", &self.state.lock().entries.len())
            .finish()
    }
}

impl FileTable {
    pub fn open(path: impl AsRef<Path>, options: FileTableOptions) -> Result<Self, TableError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut data = Vec::new();
        match std::fs::File::open(&path) {
            Ok(mut file) => {
                file.read_to_end(&mut data)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let (entries, records, valid_len) = replay_records(&path, &data)?;
        if valid_len < data.len() {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = data.len() - valid_len,
                "dropping torn tail of table file"
            );
        }

        let needs_rewrite = valid_len < data.len()
            || records > entries.len().max(1).saturating_mul(options.rewrite_ratio.max(1));
        if needs_rewrite {
            rewrite_file(&path, &entries)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            options,
            state: Mutex::new(FileTableState { file, entries }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, state: &mut FileTableState, record: &TableRecord) -> Result<(), TableError> {
        let frame = encode_frame(record)?;
        state.file.write_all(&frame)?;
        if self.options.sync_writes {
            state.file.sync_data()?;
        }
        Ok(())
    }
}

impl KvTable for FileTable {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, TableError> {
        Ok(self.state.lock().entries.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), TableError> {
        let key = Bytes::copy_from_slice(key);
        let value = Bytes::copy_from_slice(value);
        let mut state = self.state.lock();
        self.append(
            &mut state,
            &TableRecord::Put {
                key: key.clone(),
                value: value.clone(),
            },
        )?;
        state.entries.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), TableError> {
        let mut state = self.state.lock();
        if !state.entries.contains_key(key) {
            return Ok(());
        }
        self.append(
            &mut state,
            &TableRecord::Delete {
                key: Bytes::copy_from_slice(key),
            },
        )?;
        state.entries.remove(key);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(Bytes, Bytes)>, TableError> {
        Ok(self
            .state
            .lock()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn is_empty(&self) -> Result<bool, TableError> {
        Ok(self.state.lock().entries.is_empty())
    }
}

fn encode_frame(record: &TableRecord) -> Result<Vec<u8>, TableError> {
    let payload = bincode::serialize(record)?;
    let len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "record too large"))?;
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Returns the live entries, the number of records read and the length of the
/// valid prefix of `data`.
fn replay_records(
    path: &Path,
    data: &[u8],
) -> Result<(BTreeMap<Bytes, Bytes>, usize, usize), TableError> {
    let mut entries = BTreeMap::new();
    let mut offset = 0usize;
    let mut records = 0usize;
    while offset + 8 <= data.len() {
        let len = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        let crc = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);
        let start = offset + 8;
        if start + len > data.len() {
            break;
        }
        let payload = &data[start..(start + len)];
        if crc32c::crc32c(payload) != crc {
            // Only the final record may be torn.
            if start + len == data.len() {
                break;
            }
            return Err(TableError::Corrupt {
                path: path.to_path_buf(),
                offset,
                reason: "record checksum mismatch",
            });
        }
        match bincode::deserialize::<TableRecord>(payload)? {
            TableRecord::Put { key, value } => {
                entries.insert(key, value);
            }
            TableRecord::Delete { key } => {
                entries.remove(&key);
            }
        }
        records += 1;
        offset = start + len;
    }
    Ok((entries, records, offset))
}

fn rewrite_file(path: &Path, entries: &BTreeMap<Bytes, Bytes>) -> Result<(), TableError> {
    let tmp = path.with_extension("rewrite.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        for (key, value) in entries {
            file.write_all(&encode_frame(&TableRecord::Put {
                key: key.clone(),
                value: value.clone(),
            })?)?;
        }
        file.sync_data()?;
    }
    std::fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        std::fs::File::open(parent)?.sync_all()?;
    }
    tracing::debug!(path = %path.display(), live = entries.len(), "rewrote table file");
    Ok(())
}
