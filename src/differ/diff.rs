use std::collections::{BTreeMap, BTreeSet};

use super::*;
use crate::dag::CompactionNode;
use crate::engine::{DifferSnapshotInfo, LiveFileMetadata, StoreEngine, DEFAULT_COLUMN_FAMILY};
use crate::sst::{sst_file_stem, sst_path};

/// Outcome of a snapshot diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffResult {
    /// SST files whose contents may differ between the two snapshots, sorted
    /// by name. Empty when the snapshots hold the same data.
    Incremental(Vec<String>),
    /// Compaction history does not explain every destination file; the
    /// caller must fall back to a full key-space comparison.
    FullDiffRequired,
}

impl DiffResult {
    pub fn files(&self) -> Option<&[String]> {
        match self {
            Self::Incremental(files) => Some(files),
            Self::FullDiffRequired => None,
        }
    }
}

/// Files of the source snapshot split by whether the destination holds the
/// same data.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Classification {
    pub same: HashSet<String>,
    pub different: HashSet<String>,
}

impl CheckpointDiffer {
    /// SST files that may differ between `src` (the later snapshot) and
    /// `dest` (the earlier one).
    pub fn get_diff(&self, src: &DifferSnapshotInfo, dest: &DifferSnapshotInfo) -> Result<DiffResult> {
        let src_files = self.live_sst_files(src.store.as_ref())?;
        let dest_files = self.live_sst_files(dest.store.as_ref())?;
        let prefixes = src.table_prefixes.as_ref().filter(|p| !p.is_empty());
        // Engine calls stay outside the instance lock.
        let bounds = match prefixes {
            Some(_) => live_bounds(&[src.store.as_ref(), dest.store.as_ref()])?,
            None => HashMap::new(),
        };

        let dag = self.dag.lock();
        let classified = classify_files(
            &dag,
            &src_files,
            &dest_files,
            dest.snapshot_generation,
            self.options.max_traversal_levels,
        )?;

        let unexplained = dest_files
            .iter()
            .filter(|f| !classified.same.contains(*f) && !classified.different.contains(*f))
            .count();
        if unexplained > 0 {
            tracing::debug!(
                src = %src.snapshot_id,
                dest = %dest.snapshot_id,
                unexplained,
                "compaction history does not cover every destination file"
            );
            return Ok(DiffResult::FullDiffRequired);
        }

        let mut different: BTreeSet<String> = classified.different.into_iter().collect();
        if let Some(prefixes) = prefixes {
            different.retain(|file| {
                let keep = match dag.node(file) {
                    Some(node) if has_bounds(node) => node_may_contain_prefix(node, prefixes),
                    _ => bounds
                        .get(file)
                        .map_or(true, |meta| live_file_may_contain_prefix(meta, prefixes)),
                };
                if !keep {
                    tracing::debug!(file = %file, "dropping SST outside requested key prefixes");
                }
                keep
            });
        }
        Ok(DiffResult::Incremental(different.into_iter().collect()))
    }

    /// Like [`Self::get_diff`], but hard-links every differing file into
    /// `target_dir` and returns the linked paths.
    pub fn get_diff_with_materialized_files(
        &self,
        src: &DifferSnapshotInfo,
        dest: &DifferSnapshotInfo,
        target_dir: &Path,
    ) -> Result<Option<Vec<PathBuf>>> {
        let files = match self.get_diff(src, dest)? {
            DiffResult::Incremental(files) => files,
            DiffResult::FullDiffRequired => return Ok(None),
        };

        std::fs::create_dir_all(target_dir)?;
        let mut linked = Vec::with_capacity(files.len());
        for file in &files {
            let source = self.locate_sst(file, &[&src.db_path, &dest.db_path])?;
            let link = sst_path(target_dir, file);
            match std::fs::hard_link(&source, &link) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
            linked.push(link);
        }
        Ok(Some(linked))
    }

    /// Live SST names of the tracked column families (plus the default one)
    /// with the `.sst` extension removed.
    pub fn live_sst_files(&self, store: &dyn StoreEngine) -> Result<HashSet<String>> {
        let mut files = HashSet::new();
        for meta in store.live_files_metadata()? {
            if meta.column_family != DEFAULT_COLUMN_FAMILY
                && !self.options.is_tracked(&meta.column_family)
            {
                continue;
            }
            let name = sst_file_stem(Path::new(&meta.file_name))
                .ok_or_else(|| DifferError::InvalidSstName(meta.file_name.clone()))?;
            files.insert(name.to_string());
        }
        Ok(files)
    }

    /// Backup directory first, then each database directory in order.
    fn locate_sst(&self, file: &str, db_paths: &[&PathBuf]) -> Result<PathBuf> {
        let backup = self.backup_path(file);
        if backup.exists() {
            return Ok(backup);
        }
        db_paths
            .iter()
            .map(|dir| sst_path(dir, file))
            .find(|path| path.exists())
            .ok_or_else(|| DifferError::SstNotFound(file.to_string()))
    }
}

/// Walks the DAG from each source file toward older files until it meets a
/// file the destination holds, a file older than the destination, or the
/// start of recorded history.
pub(crate) fn classify_files(
    dag: &CompactionDag,
    src_files: &HashSet<String>,
    dest_files: &HashSet<String>,
    dest_generation: u64,
    max_levels: usize,
) -> Result<Classification> {
    let mut out = Classification::default();
    for file in src_files {
        if dest_files.contains(file) {
            out.same.insert(file.clone());
        }
    }

    for file in src_files {
        if out.same.contains(file) {
            continue;
        }
        if !dag.contains(file) {
            // Flushed after the destination was taken and never compacted.
            out.different.insert(file.clone());
            continue;
        }

        let mut current: HashSet<String> = HashSet::from([file.clone()]);
        let mut level = 0usize;
        while !current.is_empty() {
            level += 1;
            if level >= max_levels {
                tracing::error!(
                    file = %file,
                    levels = level,
                    "diff traversal did not terminate; compaction DAG has a cycle"
                );
                return Err(DifferError::TraversalLimit { levels: level });
            }

            let mut next = HashSet::new();
            for name in &current {
                let Some(node) = dag.node(name) else {
                    out.different.insert(name.clone());
                    continue;
                };
                if node.snapshot_generation() < dest_generation {
                    out.different.insert(name.clone());
                    continue;
                }
                if !dag.has_successors(name) {
                    out.different.insert(name.clone());
                    continue;
                }
                for older in dag.successors(name) {
                    if out.same.contains(older) || out.different.contains(older) {
                        continue;
                    }
                    if dest_files.contains(older) {
                        out.same.insert(older.to_string());
                        continue;
                    }
                    next.insert(older.to_string());
                }
            }
            current = next;
        }
    }
    Ok(out)
}

fn has_bounds(node: &CompactionNode) -> bool {
    node.start_key().is_some() && node.end_key().is_some() && node.column_family().is_some()
}

fn node_may_contain_prefix(node: &CompactionNode, prefixes: &BTreeMap<String, Bytes>) -> bool {
    match (node.start_key(), node.end_key(), node.column_family()) {
        (Some(start), Some(end), Some(cf)) => range_may_contain_prefix(cf, start, end, prefixes),
        _ => true,
    }
}

fn live_file_may_contain_prefix(meta: &LiveFileMetadata, prefixes: &BTreeMap<String, Bytes>) -> bool {
    range_may_contain_prefix(
        &meta.column_family,
        &meta.smallest_key,
        &meta.largest_key,
        prefixes,
    )
}

/// A file survives the prefix filter unless its column family has no
/// requested prefix or its key range cannot hold that prefix.
pub(crate) fn range_may_contain_prefix(
    column_family: &str,
    start: &[u8],
    end: &[u8],
    prefixes: &BTreeMap<String, Bytes>,
) -> bool {
    if prefixes.is_empty() {
        return true;
    }
    let Some(prefix) = prefixes.get(column_family) else {
        return false;
    };
    let truncate = |key: &[u8]| key[..key.len().min(prefix.len())].to_vec();
    let start = truncate(start);
    let end = truncate(end);
    start.as_slice() <= prefix.as_ref() && prefix.as_ref() <= end.as_slice()
}

fn live_bounds(stores: &[&dyn StoreEngine]) -> Result<HashMap<String, LiveFileMetadata>> {
    let mut out = HashMap::new();
    for store in stores {
        for meta in store.live_files_metadata()? {
            if let Some(name) = sst_file_stem(Path::new(&meta.file_name)) {
                out.entry(name.to_string()).or_insert(meta);
            }
        }
    }
    Ok(out)
}
