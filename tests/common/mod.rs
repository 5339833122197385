#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use layerdiff::internal_key::InternalKey;
use layerdiff::sst::{sst_path, SstReader, SstWriter};
use layerdiff::{
    CheckpointDiffer, CompactionEvent, CompactionJobInfo, DifferOptions, DifferSnapshotInfo,
    DifferTables, KvTable, LiveFileMetadata, MemoryTable, StoreEngine,
};
use parking_lot::Mutex;

pub const KEY_TABLE: &str = "keyTable";

pub fn options() -> DifferOptions {
    DifferOptions {
        prune_daemon_interval: Duration::ZERO,
        sst_block_size: 256,
        ..Default::default()
    }
}

pub struct Harness {
    pub differ: Arc<CheckpointDiffer>,
    pub compaction_log: Arc<dyn KvTable>,
    pub snapshot_info: Arc<dyn KvTable>,
}

impl Harness {
    pub fn open(metadata_dir: &Path, options: DifferOptions) -> anyhow::Result<Self> {
        let differ = CheckpointDiffer::open(metadata_dir, options)?;
        let compaction_log: Arc<dyn KvTable> = Arc::new(MemoryTable::new());
        let snapshot_info: Arc<dyn KvTable> = Arc::new(MemoryTable::new());
        differ.attach_tables(DifferTables {
            compaction_log: compaction_log.clone(),
            snapshot_info: snapshot_info.clone(),
        });
        Ok(Self {
            differ,
            compaction_log,
            snapshot_info,
        })
    }

    /// Registers a snapshot so compactions start being tracked.
    pub fn start_tracking(&self) -> anyhow::Result<()> {
        self.snapshot_info.put(b"/vol/bucket/snap-0", b"info")?;
        Ok(())
    }
}

/// A toy LSM store that writes real SST files and reports them as live.
pub struct FakeStore {
    dir: PathBuf,
    seq: AtomicU64,
    live: Mutex<BTreeMap<String, LiveFileMetadata>>,
}

impl FakeStore {
    pub fn open(dir: &Path) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(dir)?;
        Ok(Arc::new(Self {
            dir: dir.to_path_buf(),
            seq: AtomicU64::new(0),
            live: Mutex::new(BTreeMap::new()),
        }))
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        sst_path(&self.dir, name)
    }

    pub fn live_names(&self) -> Vec<String> {
        self.live.lock().keys().cloned().collect()
    }

    /// Writes `entries` (`None` values are tombstones) as a new live file.
    pub fn flush(
        &self,
        column_family: &str,
        name: &str,
        entries: &[(&str, Option<&str>)],
    ) -> anyhow::Result<PathBuf> {
        let mut sorted: Vec<(InternalKey, Bytes)> = entries
            .iter()
            .map(|(key, value)| {
                let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
                let key = Bytes::copy_from_slice(key.as_bytes());
                match value {
                    Some(v) => (InternalKey::put(key, seq), Bytes::copy_from_slice(v.as_bytes())),
                    None => (InternalKey::delete(key, seq), Bytes::new()),
                }
            })
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        self.write_live(column_family, name, &sorted)
    }

    /// Runs a compaction the way an engine would: begin event, write outputs,
    /// retire inputs, completed event.
    pub fn compact(
        &self,
        differ: &CheckpointDiffer,
        column_family: &str,
        inputs: &[&str],
        outputs: &[&str],
    ) -> anyhow::Result<CompactionJobInfo> {
        let job = CompactionJobInfo::new(
            column_family,
            inputs.iter().map(|n| self.file_path(n)).collect(),
            outputs.iter().map(|n| self.file_path(n)).collect(),
        )
        .with_reason("LevelL0FilesNum");
        differ.record_compaction(self, &CompactionEvent::begin(job.clone()))?;

        let mut merged = Vec::new();
        for name in inputs {
            let reader = SstReader::open(self.file_path(name))?;
            for entry in reader.iter() {
                merged.push(entry?);
            }
        }
        merged.sort_by(|a, b| a.0.cmp(&b.0));
        let chunk = merged.len().div_ceil(outputs.len()).max(1);
        let mut chunks = merged.chunks(chunk);
        for name in outputs {
            let part = chunks.next().unwrap_or(&[]);
            self.write_live(column_family, name, part)?;
        }

        self.seq.fetch_add(1, Ordering::SeqCst);
        {
            let mut live = self.live.lock();
            for name in inputs {
                live.remove(*name);
            }
        }
        for name in inputs {
            std::fs::remove_file(self.file_path(name))?;
        }

        differ.record_compaction(self, &CompactionEvent::completed(job.clone()))?;
        Ok(job)
    }

    /// A read-only copy of the current live set, as a snapshot at the current
    /// sequence number.
    pub fn checkpoint(&self, id: &str, dir: &Path) -> anyhow::Result<DifferSnapshotInfo> {
        std::fs::create_dir_all(dir)?;
        let mut live = BTreeMap::new();
        for (name, meta) in self.live.lock().iter() {
            let target = sst_path(dir, name);
            std::fs::hard_link(self.file_path(name), &target)?;
            let mut meta = meta.clone();
            meta.file_name = target.display().to_string();
            live.insert(name.clone(), meta);
        }
        let generation = self.latest_sequence_number();
        let store: Arc<dyn StoreEngine> = Arc::new(FakeStore {
            dir: dir.to_path_buf(),
            seq: AtomicU64::new(generation),
            live: Mutex::new(live),
        });
        Ok(DifferSnapshotInfo::new(id, generation, store))
    }

    fn write_live(
        &self,
        column_family: &str,
        name: &str,
        entries: &[(InternalKey, Bytes)],
    ) -> anyhow::Result<PathBuf> {
        let path = self.file_path(name);
        let mut writer = SstWriter::create(&path, 128)?;
        for (key, value) in entries {
            writer.add(key, value)?;
        }
        let props = writer.finish()?;
        self.live.lock().insert(
            name.to_string(),
            LiveFileMetadata {
                file_name: path.display().to_string(),
                column_family: column_family.to_string(),
                level: 0,
                size: std::fs::metadata(&path)?.len(),
                num_entries: props.entries,
                smallest_key: props.smallest_user_key,
                largest_key: props.largest_user_key,
            },
        );
        Ok(path)
    }
}

impl StoreEngine for FakeStore {
    fn db_path(&self) -> &Path {
        &self.dir
    }

    fn latest_sequence_number(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    fn live_files_metadata(&self) -> std::io::Result<Vec<LiveFileMetadata>> {
        Ok(self.live.lock().values().cloned().collect())
    }
}

/// Store that only reports a fixed list of live file names.
pub struct ListStore {
    dir: PathBuf,
    seq: u64,
    files: Vec<String>,
}

impl ListStore {
    pub fn snapshot(id: &str, generation: u64, files: &[String]) -> DifferSnapshotInfo {
        let store = Arc::new(Self {
            dir: PathBuf::from(format!("/nonexistent/{id}")),
            seq: generation,
            files: files.to_vec(),
        });
        DifferSnapshotInfo::new(id, generation, store)
    }
}

impl StoreEngine for ListStore {
    fn db_path(&self) -> &Path {
        &self.dir
    }

    fn latest_sequence_number(&self) -> u64 {
        self.seq
    }

    fn live_files_metadata(&self) -> std::io::Result<Vec<LiveFileMetadata>> {
        Ok(self
            .files
            .iter()
            .map(|name| LiveFileMetadata {
                file_name: format!("{name}.sst"),
                column_family: KEY_TABLE.to_string(),
                level: 0,
                size: 0,
                num_entries: 0,
                smallest_key: Bytes::new(),
                largest_key: Bytes::new(),
            })
            .collect())
    }
}
