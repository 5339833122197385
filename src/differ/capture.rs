use super::*;
use crate::engine::{
    CompactionEvent, CompactionJobInfo, CompactionPhase, LiveFileMetadata, StoreEngine,
};
use crate::log::CompactionLogEntry;
use crate::sst::sst_file_stem;

impl CheckpointDiffer {
    /// Dispatches a compaction notification to the matching hook.
    pub fn record_compaction(&self, engine: &dyn StoreEngine, event: &CompactionEvent) -> Result<()> {
        match event.phase {
            CompactionPhase::Begin => self.on_compaction_begin(engine, &event.job),
            CompactionPhase::Completed => self.on_compaction_completed(engine, &event.job),
        }
    }

    /// Captures the inputs of a compaction that is about to run: their
    /// metadata goes into the in-flight map and each file is hard-linked into
    /// the backup directory so it outlives the compaction.
    pub fn on_compaction_begin(&self, engine: &dyn StoreEngine, job: &CompactionJobInfo) -> Result<()> {
        if self.should_skip_compaction(job) {
            return Ok(());
        }
        {
            let _guard = self.dag.lock();
            if self.is_closed() || !self.is_tracking_initialized()? {
                return Ok(());
            }
        }

        let infos = file_infos(&job.input_files, engine)?;
        {
            let mut in_flight = self.in_flight.lock();
            for info in infos {
                in_flight.insert(info.file_name.clone(), info);
            }
        }

        for file in &job.input_files {
            self.create_backup_link(file)?;
        }
        Ok(())
    }

    /// Records a finished compaction in the log table and the DAG.
    pub fn on_compaction_completed(
        &self,
        engine: &dyn StoreEngine,
        job: &CompactionJobInfo,
    ) -> Result<()> {
        if self.should_skip_compaction(job) {
            return Ok(());
        }

        if job.output_files.is_empty() {
            tracing::debug!("not recording compaction with no output files");
            let mut in_flight = self.in_flight.lock();
            for file in &job.input_files {
                if let Some(name) = sst_file_stem(file) {
                    in_flight.remove(name);
                }
            }
            return Ok(());
        }

        let db_sequence_number = engine.latest_sequence_number();
        let current_inputs = file_infos(&job.input_files, engine)?;
        let outputs = file_infos(&job.output_files, engine)?;

        let inputs: Vec<CompactionFileInfo> = {
            let in_flight = self.in_flight.lock();
            current_inputs
                .into_iter()
                .map(|info| match in_flight.get(&info.file_name) {
                    Some(at_begin) => at_begin.clone(),
                    None => {
                        tracing::warn!(
                            file = %info.file_name,
                            "input file was not captured at compaction begin"
                        );
                        info
                    }
                })
                .collect()
        };

        let entry = CompactionLogEntry::new(db_sequence_number, now_millis(), inputs, outputs)
            .with_reason(job.reason.clone());

        let key = {
            let mut dag = self.dag.lock();
            if self.is_closed() || !self.is_tracking_initialized()? {
                return Ok(());
            }
            let key = self.put_log_entry(&entry)?;
            dag.populate(&entry.input_files, &entry.output_files, entry.db_sequence_number);
            let mut in_flight = self.in_flight.lock();
            for name in entry.input_file_names() {
                in_flight.remove(name);
            }
            key
        };

        tracing::debug!(
            seq = entry.db_sequence_number,
            inputs = entry.input_files.len(),
            outputs = entry.output_files.len(),
            "recorded compaction"
        );
        if self.options.value_pruning {
            self.prune_queue.lock().push(Bytes::from(key));
        }
        Ok(())
    }

    pub(super) fn put_log_entry(&self, entry: &CompactionLogEntry) -> Result<Vec<u8>> {
        let tables = self.tables()?;
        let key = entry.key();
        tables.compaction_log.put(&key, &entry.encode()?)?;
        Ok(key)
    }

    fn should_skip_compaction(&self, job: &CompactionJobInfo) -> bool {
        if !self.options.is_tracked(&job.column_family) {
            tracing::debug!(column_family = %job.column_family, "skipping untracked column family");
            return true;
        }
        if job.input_files.is_empty() {
            tracing::debug!("skipping compaction with no input files");
            return true;
        }
        let inputs: HashSet<&PathBuf> = job.input_files.iter().collect();
        let outputs: HashSet<&PathBuf> = job.output_files.iter().collect();
        if inputs == outputs {
            tracing::debug!("skipping compaction whose inputs equal its outputs");
            return true;
        }
        false
    }

    /// Compactions are only worth recording once a snapshot exists to diff
    /// against. Without attached tables there is nowhere to persist them.
    fn is_tracking_initialized(&self) -> Result<bool> {
        match self.tables.read().as_ref() {
            Some(tables) => Ok(!tables.snapshot_info.is_empty()?),
            None => {
                tracing::warn!("differ tables are not attached; not recording compaction");
                Ok(false)
            }
        }
    }

    fn create_backup_link(&self, file: &Path) -> Result<()> {
        let name = sst_file_stem(file)
            .ok_or_else(|| DifferError::InvalidSstName(file.display().to_string()))?;
        let link = self.backup_path(name);
        match std::fs::hard_link(file, &link) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::debug!(link = %link.display(), "backup SST link already exists");
                Ok(())
            }
            Err(e) => {
                tracing::error!(file = %file.display(), error = %e, "failed to back up SST file");
                Err(e.into())
            }
        }
    }
}

/// File info for each path, enriched with key bounds from the engine's live
/// metadata where the engine still reports the file.
fn file_infos(files: &[PathBuf], engine: &dyn StoreEngine) -> Result<Vec<CompactionFileInfo>> {
    let live: HashMap<String, LiveFileMetadata> = engine
        .live_files_metadata()?
        .into_iter()
        .filter_map(|meta| {
            let name = sst_file_stem(Path::new(&meta.file_name))?.to_string();
            Some((name, meta))
        })
        .collect();

    files
        .iter()
        .map(|file| -> Result<CompactionFileInfo> {
            let name = sst_file_stem(file)
                .ok_or_else(|| DifferError::InvalidSstName(file.display().to_string()))?;
            let info = CompactionFileInfo::named(name);
            Ok(match live.get(name) {
                Some(meta) => info
                    .with_key_range(meta.smallest_key.clone(), meta.largest_key.clone())
                    .with_column_family(meta.column_family.clone())
                    .with_num_entries(meta.num_entries),
                None => info,
            })
        })
        .collect()
}
