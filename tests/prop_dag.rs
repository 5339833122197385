mod common;

use std::collections::{BTreeSet, HashMap, HashSet};

use proptest::prelude::*;

use common::{options, FakeStore, Harness, KEY_TABLE};
use layerdiff::{CompactionDag, CompactionFileInfo, DiffResult, DifferSnapshotInfo, StoreEngine};

#[derive(Debug, Clone)]
enum Step {
    Flush,
    /// Compacts the live files selected by `mask` into `outputs` new files.
    Compact { mask: u8, outputs: u8 },
    Snapshot,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => Just(Step::Flush),
        2 => (any::<u8>(), 1u8..3).prop_map(|(mask, outputs)| Step::Compact { mask, outputs }),
        1 => Just(Step::Snapshot),
    ]
}

fn pick_inputs(live: &[String], mask: u8) -> Vec<String> {
    let picked: Vec<String> = live
        .iter()
        .take(8)
        .enumerate()
        .filter(|(i, _)| mask & (1 << i) != 0)
        .map(|(_, f)| f.clone())
        .collect();
    if picked.is_empty() {
        live.iter().take(1).cloned().collect()
    } else {
        picked
    }
}

struct Compaction {
    inputs: Vec<CompactionFileInfo>,
    outputs: Vec<CompactionFileInfo>,
    generation: u64,
}

/// Replays `steps` against a name-only model of the live set.
fn history(steps: &[Step]) -> Vec<Compaction> {
    let mut live: Vec<String> = Vec::new();
    let mut next_file = 0u32;
    let mut new_file = || {
        next_file += 1;
        format!("{next_file:06}")
    };
    let mut out = Vec::new();
    for (seq, step) in steps.iter().enumerate() {
        match step {
            Step::Flush => live.push(new_file()),
            Step::Compact { mask, outputs } if !live.is_empty() => {
                let inputs = pick_inputs(&live, *mask);
                live.retain(|f| !inputs.contains(f));
                let outputs: Vec<String> = (0..*outputs).map(|_| new_file()).collect();
                live.extend(outputs.iter().cloned());
                out.push(Compaction {
                    inputs: inputs.into_iter().map(CompactionFileInfo::named).collect(),
                    outputs: outputs.into_iter().map(CompactionFileInfo::named).collect(),
                    generation: seq as u64,
                });
            }
            Step::Compact { .. } | Step::Snapshot => {}
        }
    }
    out
}

/// What the store did, independent of the DAG: which inputs produced each
/// output, and the sequence number of the first compaction naming each file.
#[derive(Default)]
struct Lineage {
    inputs_of: HashMap<String, Vec<String>>,
    generation: HashMap<String, u64>,
}

impl Lineage {
    fn record(&mut self, inputs: &[String], outputs: &[String], seq: u64) {
        for file in inputs.iter().chain(outputs) {
            self.generation.entry(file.clone()).or_insert(seq);
        }
        for output in outputs {
            self.inputs_of.insert(output.clone(), inputs.to_vec());
        }
    }

    /// Files reached by walking from each source file toward older files,
    /// stopping at destination files (same data) and reporting every file
    /// where a walk ends without one.
    fn expected_diff(
        &self,
        src_live: &HashSet<String>,
        dest_live: &HashSet<String>,
        dest_generation: u64,
    ) -> Vec<String> {
        let mut out = BTreeSet::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<&String> = src_live.iter().collect();
        while let Some(file) = stack.pop() {
            if dest_live.contains(file) || !seen.insert(file) {
                continue;
            }
            match (self.generation.get(file), self.inputs_of.get(file)) {
                (Some(generation), Some(inputs)) if *generation >= dest_generation => {
                    stack.extend(inputs);
                }
                _ => {
                    out.insert(file.clone());
                }
            }
        }
        out.into_iter().collect()
    }
}

fn assert_consistent(dag: &CompactionDag) -> Result<(), TestCaseError> {
    for (output, input) in dag.edges() {
        prop_assert!(dag.contains(&output), "dangling output {}", output);
        prop_assert!(dag.contains(&input), "dangling input {}", input);
        prop_assert!(dag.predecessors(&input).any(|p| p == output));
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn prop_prune_keeps_dag_consistent(
        steps in prop::collection::vec(step_strategy(), 1..60),
        expired_fraction in 0usize..=4,
    ) {
        let compactions = history(&steps);
        let mut dag = CompactionDag::new();
        for c in &compactions {
            dag.populate(&c.inputs, &c.outputs, c.generation);
        }
        assert_consistent(&dag)?;

        let expired = compactions.len() * expired_fraction / 4;
        let start: HashSet<String> = compactions[..expired]
            .iter()
            .flat_map(|c| c.inputs.iter().map(|f| f.file_name.clone()))
            .collect();
        let removed = dag.prune(&start);
        assert_consistent(&dag)?;
        prop_assert!(start.is_subset(&removed));

        for c in &compactions[expired..] {
            for output in &c.outputs {
                for input in &c.inputs {
                    prop_assert!(
                        dag.successors(&output.file_name).any(|f| f == input.file_name),
                        "edge {} -> {} of a live compaction was pruned",
                        output.file_name,
                        input.file_name
                    );
                }
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 24, .. ProptestConfig::default() })]

    #[test]
    fn prop_diff_matches_lineage_walk(steps in prop::collection::vec(step_strategy(), 1..24)) {
        let dir = tempfile::TempDir::new().unwrap();
        let harness = Harness::open(&dir.path().join("meta"), options()).unwrap();
        harness.start_tracking().unwrap();
        let store = FakeStore::open(&dir.path().join("db")).unwrap();

        let mut next_file = 0u32;
        let mut lineage = Lineage::default();
        let mut snapshots: Vec<(DifferSnapshotInfo, HashSet<String>)> = Vec::new();
        for step in &steps {
            match step {
                Step::Flush => {
                    next_file += 1;
                    let name = format!("{next_file:06}");
                    store.flush(KEY_TABLE, &name, &[(name.as_str(), Some("v"))]).unwrap();
                }
                Step::Compact { mask, outputs } => {
                    let live = store.live_names();
                    if live.is_empty() {
                        continue;
                    }
                    let inputs = pick_inputs(&live, *mask);
                    let outputs: Vec<String> = (0..*outputs)
                        .map(|_| {
                            next_file += 1;
                            format!("{next_file:06}")
                        })
                        .collect();
                    let input_refs: Vec<&str> = inputs.iter().map(String::as_str).collect();
                    let output_refs: Vec<&str> = outputs.iter().map(String::as_str).collect();
                    store.compact(&harness.differ, KEY_TABLE, &input_refs, &output_refs).unwrap();
                    lineage.record(&inputs, &outputs, store.latest_sequence_number());
                }
                Step::Snapshot => {
                    let id = format!("snap-{}", snapshots.len());
                    let live: HashSet<String> = store.live_names().into_iter().collect();
                    let snapshot = store.checkpoint(&id, &dir.path().join(&id)).unwrap();
                    snapshots.push((snapshot, live));
                }
            }
        }

        let differ = &harness.differ;
        for (i, (earlier, earlier_live)) in snapshots.iter().enumerate() {
            let same = differ.get_diff(earlier, earlier).unwrap();
            prop_assert_eq!(same, DiffResult::Incremental(Vec::new()));

            for (later, later_live) in &snapshots[i..] {
                let diff = differ.get_diff(later, earlier).unwrap();
                let files = match diff {
                    DiffResult::Incremental(files) => files,
                    DiffResult::FullDiffRequired => {
                        return Err(TestCaseError::fail(format!(
                            "{} -> {} needed a full diff",
                            later.snapshot_id, earlier.snapshot_id
                        )));
                    }
                };
                prop_assert!(files.iter().all(|f| !earlier_live.contains(f)));
                let expected =
                    lineage.expected_diff(later_live, earlier_live, earlier.snapshot_generation);
                prop_assert_eq!(files, expected);
            }
        }
    }
}

#[test]
fn diff_walks_several_compactions_back() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let harness = Harness::open(&dir.path().join("meta"), options())?;
    harness.start_tracking()?;
    let store = FakeStore::open(&dir.path().join("db"))?;

    store.flush(KEY_TABLE, "000001", &[("a", Some("1"))])?;
    store.flush(KEY_TABLE, "000002", &[("b", Some("2"))])?;
    let earlier = store.checkpoint("snap-1", &dir.path().join("snap-1"))?;

    // 000004 descends from 000001 (live in the earlier snapshot) through
    // 000003, and from 000006, which was written after it.
    store.flush(KEY_TABLE, "000006", &[("c", Some("3"))])?;
    store.compact(&harness.differ, KEY_TABLE, &["000001"], &["000003"])?;
    store.compact(&harness.differ, KEY_TABLE, &["000003", "000006"], &["000004"])?;
    store.flush(KEY_TABLE, "000005", &[("d", Some("4"))])?;
    let later = store.checkpoint("snap-2", &dir.path().join("snap-2"))?;

    let diff = harness.differ.get_diff(&later, &earlier)?;
    assert_eq!(
        diff,
        DiffResult::Incremental(vec!["000005".to_string(), "000006".to_string()])
    );
    Ok(())
}
