//! One differ per metadata directory.
//!
//! Hosts that open the same store several times (for example a checkpoint
//! and the live store sharing metadata) must share one differ, since the
//! backup directory and the log table are single-writer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::differ::CheckpointDiffer;
use crate::error::Result;
use crate::options::DifferOptions;

#[derive(Debug, Default)]
pub struct DifferRegistry {
    instances: Mutex<HashMap<PathBuf, Arc<CheckpointDiffer>>>,
}

impl DifferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the differ for `metadata_dir`, opening it on first use.
    /// `options` only applies when a new differ is opened.
    pub fn open(
        &self,
        metadata_dir: impl AsRef<Path>,
        options: DifferOptions,
    ) -> Result<Arc<CheckpointDiffer>> {
        let key = metadata_dir.as_ref().to_path_buf();
        let mut instances = self.instances.lock();
        if let Some(existing) = instances.get(&key) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }
        let differ = CheckpointDiffer::open(&key, options)?;
        instances.insert(key, differ.clone());
        Ok(differ)
    }

    pub fn get(&self, metadata_dir: impl AsRef<Path>) -> Option<Arc<CheckpointDiffer>> {
        self.instances.lock().get(metadata_dir.as_ref()).cloned()
    }

    /// Closes and forgets the differ for `metadata_dir`. Returns whether one
    /// was registered.
    pub fn close(&self, metadata_dir: impl AsRef<Path>) -> bool {
        let removed = self.instances.lock().remove(metadata_dir.as_ref());
        match removed {
            Some(differ) => {
                differ.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let drained: Vec<_> = self.instances.lock().drain().map(|(_, d)| d).collect();
        for differ in drained {
            differ.close();
        }
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }
}
