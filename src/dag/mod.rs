//! In-memory graph of SST files linked by the compactions that rewrote them.
//!
//! Nodes live in an arena keyed by file name. Two adjacency indices are kept
//! in lock step:
//! - `forward`: compaction output -> each of its inputs. Walking forward goes
//!   from newer files toward the older files they replaced, which is the
//!   direction snapshot diffing traverses.
//! - `backward`: input -> each output it was compacted into.
//!
//! Every edge endpoint is present in the arena. Removing a node removes all
//! edges touching it from both indices.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;

use crate::log::CompactionFileInfo;

/// One SST file's identity and position in compaction history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionNode {
    file_name: String,
    snapshot_generation: u64,
    start_key: Option<Bytes>,
    end_key: Option<Bytes>,
    column_family: Option<String>,
    total_number_of_keys: u64,
    cumulative_keys_reverse_traversal: u64,
}

impl CompactionNode {
    pub fn new(file_name: impl Into<String>, snapshot_generation: u64) -> Self {
        Self {
            file_name: file_name.into(),
            snapshot_generation,
            start_key: None,
            end_key: None,
            column_family: None,
            total_number_of_keys: 0,
            cumulative_keys_reverse_traversal: 0,
        }
    }

    fn from_file_info(info: &CompactionFileInfo, snapshot_generation: u64) -> Self {
        Self {
            file_name: info.file_name.clone(),
            snapshot_generation,
            start_key: info.start_key.clone(),
            end_key: info.end_key.clone(),
            column_family: info.column_family.clone(),
            total_number_of_keys: info.num_entries.unwrap_or(0),
            cumulative_keys_reverse_traversal: 0,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn snapshot_generation(&self) -> u64 {
        self.snapshot_generation
    }

    pub fn start_key(&self) -> Option<&Bytes> {
        self.start_key.as_ref()
    }

    pub fn end_key(&self) -> Option<&Bytes> {
        self.end_key.as_ref()
    }

    pub fn column_family(&self) -> Option<&str> {
        self.column_family.as_deref()
    }

    pub fn total_number_of_keys(&self) -> u64 {
        self.total_number_of_keys
    }

    pub fn cumulative_keys_reverse_traversal(&self) -> u64 {
        self.cumulative_keys_reverse_traversal
    }

    pub fn set_total_number_of_keys(&mut self, keys: u64) {
        self.total_number_of_keys = keys;
    }

    pub fn add_cumulative_keys_reverse_traversal(&mut self, keys: u64) {
        self.cumulative_keys_reverse_traversal =
            self.cumulative_keys_reverse_traversal.saturating_add(keys);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DagStats {
    pub nodes: usize,
    pub edges: usize,
}

#[derive(Debug, Default)]
pub struct CompactionDag {
    nodes: HashMap<String, CompactionNode>,
    forward: HashMap<String, HashSet<String>>,
    backward: HashMap<String, HashSet<String>>,
}

impl CompactionDag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.forward.values().map(HashSet::len).sum()
    }

    pub fn stats(&self) -> DagStats {
        DagStats {
            nodes: self.len(),
            edges: self.edge_count(),
        }
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.nodes.contains_key(file_name)
    }

    pub fn node(&self, file_name: &str) -> Option<&CompactionNode> {
        self.nodes.get(file_name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &CompactionNode> {
        self.nodes.values()
    }

    /// Older files `file_name` was compacted from.
    pub fn successors<'a>(&'a self, file_name: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.forward
            .get(file_name)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Newer files `file_name` was compacted into.
    pub fn predecessors<'a>(&'a self, file_name: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.backward
            .get(file_name)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    pub fn has_successors(&self, file_name: &str) -> bool {
        self.forward.get(file_name).is_some_and(|s| !s.is_empty())
    }

    /// Records one compaction: every output links to every input.
    ///
    /// Nodes that already exist keep their identity; replaying the same
    /// compaction twice leaves the graph unchanged.
    pub fn populate(
        &mut self,
        inputs: &[CompactionFileInfo],
        outputs: &[CompactionFileInfo],
        snapshot_generation: u64,
    ) {
        for info in outputs.iter().chain(inputs) {
            let node = self
                .nodes
                .entry(info.file_name.clone())
                .or_insert_with(|| CompactionNode::from_file_info(info, snapshot_generation));
            if let Some(keys) = info.num_entries {
                node.set_total_number_of_keys(keys);
            }
        }

        for output in outputs {
            for input in inputs {
                if output.file_name == input.file_name {
                    continue;
                }
                let added = self
                    .forward
                    .entry(output.file_name.clone())
                    .or_default()
                    .insert(input.file_name.clone());
                self.backward
                    .entry(input.file_name.clone())
                    .or_default()
                    .insert(output.file_name.clone());
                if added {
                    let input_keys = self
                        .nodes
                        .get(&input.file_name)
                        .map_or(0, CompactionNode::total_number_of_keys);
                    if let Some(node) = self.nodes.get_mut(&output.file_name) {
                        node.add_cumulative_keys_reverse_traversal(input_keys);
                    }
                }
            }
        }
    }

    /// Removes `start_nodes` and every older file reachable from them.
    ///
    /// An older file is kept while a newer file outside the removal set still
    /// links to it, so history reachable from surviving files stays intact.
    /// Returns the names of the removed nodes.
    pub fn prune(&mut self, start_nodes: &HashSet<String>) -> HashSet<String> {
        let mut frontier = HashSet::new();
        for name in start_nodes {
            if self.nodes.contains_key(name) {
                frontier.insert(name.clone());
            } else {
                tracing::warn!(file = %name, "compaction node not found in DAG, skipping prune");
            }
        }

        let mut candidates = frontier.clone();
        let mut queue: VecDeque<String> = frontier.iter().cloned().collect();
        while let Some(current) = queue.pop_front() {
            let older: Vec<String> = self.successors(&current).map(str::to_owned).collect();
            for name in older {
                if candidates.insert(name.clone()) {
                    queue.push_back(name);
                }
            }
        }

        loop {
            let retained: Vec<String> = candidates
                .iter()
                .filter(|name| !frontier.contains(*name))
                .filter(|name| self.predecessors(name).any(|p| !candidates.contains(p)))
                .cloned()
                .collect();
            if retained.is_empty() {
                break;
            }
            for name in retained {
                candidates.remove(&name);
            }
        }

        for name in &candidates {
            self.remove_node(name);
        }
        candidates
    }

    fn remove_node(&mut self, file_name: &str) {
        self.nodes.remove(file_name);
        if let Some(older) = self.forward.remove(file_name) {
            for input in older {
                if let Some(set) = self.backward.get_mut(&input) {
                    set.remove(file_name);
                    if set.is_empty() {
                        self.backward.remove(&input);
                    }
                }
            }
        }
        if let Some(newer) = self.backward.remove(file_name) {
            for output in newer {
                if let Some(set) = self.forward.get_mut(&output) {
                    set.remove(file_name);
                    if set.is_empty() {
                        self.forward.remove(&output);
                    }
                }
            }
        }
    }

    /// Files that were themselves produced by a tracked compaction.
    pub fn non_leaf_files(&self) -> HashSet<String> {
        self.forward
            .iter()
            .filter(|(_, inputs)| !inputs.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Every edge as `(output, input)`. Debug helper.
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut edges: Vec<_> = self
            .forward
            .iter()
            .flat_map(|(out, ins)| ins.iter().map(move |i| (out.clone(), i.clone())))
            .collect();
        edges.sort();
        edges
    }
}
