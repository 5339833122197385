mod common;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use common::{options, FakeStore, Harness, KEY_TABLE};
use layerdiff::sst::{sst_path, SstReader};
use layerdiff::{CompactionLogEntry, DifferOptions, KvTable};
use tempfile::TempDir;

fn logged_entries(harness: &Harness) -> anyhow::Result<Vec<CompactionLogEntry>> {
    harness
        .compaction_log
        .scan()?
        .into_iter()
        .map(|(_, value)| -> anyhow::Result<CompactionLogEntry> {
            Ok(CompactionLogEntry::decode(&value)?)
        })
        .collect()
}

/// Flushes two files with values and compacts them into one.
fn compacted(dir: &TempDir, options: DifferOptions) -> anyhow::Result<Harness> {
    let harness = Harness::open(&dir.path().join("meta"), options)?;
    harness.start_tracking()?;
    let store = FakeStore::open(&dir.path().join("db"))?;
    store.flush(
        KEY_TABLE,
        "000001",
        &[
            ("a", Some("value-of-a")),
            ("b", Some("value-of-b")),
            ("c", Some("value-of-c")),
            ("d", None),
        ],
    )?;
    store.flush(KEY_TABLE, "000002", &[("e", Some("value-of-e")), ("f", None)])?;
    store.compact(&harness.differ, KEY_TABLE, &["000001", "000002"], &["000003"])?;
    Ok(harness)
}

/// Three compactions in a row: 000001 -> 000002 -> 000003.
fn chain(dir: &TempDir, options: DifferOptions) -> anyhow::Result<Harness> {
    let harness = Harness::open(&dir.path().join("meta"), options)?;
    harness.start_tracking()?;
    let store = FakeStore::open(&dir.path().join("db"))?;
    store.flush(KEY_TABLE, "000001", &[("a", Some("1"))])?;
    store.compact(&harness.differ, KEY_TABLE, &["000001"], &["000002"])?;
    store.compact(&harness.differ, KEY_TABLE, &["000002"], &["000003"])?;
    Ok(harness)
}

#[test]
fn value_pruning_strips_backup_values() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let harness = compacted(&dir, options())?;
    let differ = &harness.differ;
    assert_eq!(differ.pruning_metrics().queue_len, 1);

    let report = differ.prune_sst_file_values()?;
    assert_eq!(report.entries_processed, 1);
    assert_eq!(report.files_pruned, 2);
    assert_eq!(report.files_skipped, 0);

    let reader = SstReader::open(sst_path(differ.sst_backup_dir(), "000001"))?;
    assert_eq!(reader.properties().entries, 4);
    assert_eq!(reader.properties().tombstones, 1);
    for entry in reader.iter() {
        let (_, value) = entry?;
        assert!(value.is_empty());
    }
    assert!(!differ.sst_backup_dir().join("pruned.sst.tmp").exists());

    let entries = logged_entries(&harness)?;
    assert!(entries[0].input_files.iter().all(|f| f.pruned));

    let metrics = differ.pruning_metrics();
    assert_eq!(metrics.queue_len, 0);
    assert_eq!(metrics.files_pruned, 2);

    let again = differ.prune_sst_file_values()?;
    assert_eq!(again.entries_processed, 0);
    Ok(())
}

#[test]
fn suspended_differ_skips_maintenance() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let harness = compacted(&dir, options())?;
    let differ = &harness.differ;

    differ.suspend();
    assert_eq!(differ.prune_sst_file_values()?.entries_processed, 0);
    assert_eq!(differ.prune_sst_files()?, 0);
    assert_eq!(differ.pruning_metrics().queue_len, 1);

    differ.resume();
    assert_eq!(differ.prune_sst_file_values()?.entries_processed, 1);
    Ok(())
}

#[test]
fn missing_backup_is_skipped() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let harness = compacted(&dir, options())?;
    let differ = &harness.differ;
    std::fs::remove_file(sst_path(differ.sst_backup_dir(), "000001"))?;

    let report = differ.prune_sst_file_values()?;
    assert_eq!(report.files_pruned, 1);
    assert_eq!(report.files_skipped, 1);

    let entries = logged_entries(&harness)?;
    let pruned: Vec<(&str, bool)> = entries[0]
        .input_files
        .iter()
        .map(|f| (f.file_name.as_str(), f.pruned))
        .collect();
    assert_eq!(pruned, [("000001", false), ("000002", true)]);
    assert_eq!(differ.pruning_metrics().queue_len, 0);
    Ok(())
}

#[test]
fn unreadable_backup_keeps_entry_queued() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let harness = compacted(&dir, options())?;
    let differ = &harness.differ;
    std::fs::write(sst_path(differ.sst_backup_dir(), "000001"), b"not an sst file")?;

    assert!(differ.prune_sst_file_values().is_err());
    let metrics = differ.pruning_metrics();
    assert_eq!(metrics.failures, 1);
    assert_eq!(metrics.queue_len, 1);

    let entries = logged_entries(&harness)?;
    assert!(entries[0].input_files.iter().all(|f| !f.pruned));
    Ok(())
}

#[test]
fn expired_history_is_pruned() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let harness = chain(
        &dir,
        DifferOptions {
            max_time_in_dag: Duration::ZERO,
            ..options()
        },
    )?;
    let differ = &harness.differ;
    assert!(sst_path(differ.sst_backup_dir(), "000001").exists());
    assert!(sst_path(differ.sst_backup_dir(), "000002").exists());

    let report = differ.prune_older_snapshots_with_compaction_history()?;
    assert_eq!(report.expired_entries, 2);
    assert_eq!(
        report.nodes_removed,
        ["000001", "000002"]
            .into_iter()
            .map(String::from)
            .collect::<HashSet<_>>()
    );
    assert_eq!(report.backups_deleted, 2);

    assert!(harness.compaction_log.is_empty()?);
    assert!(!sst_path(differ.sst_backup_dir(), "000001").exists());
    let stats = differ.dag_stats();
    assert_eq!(stats.edges, 0);
    assert!(differ.with_dag(|dag| !dag.contains("000001") && !dag.contains("000002")));
    Ok(())
}

#[test]
fn recent_history_is_kept() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let harness = chain(&dir, options())?;
    let before = harness.differ.with_dag(|dag| dag.edges());

    let report = harness.differ.prune_older_snapshots_with_compaction_history()?;
    assert_eq!(report.expired_entries, 0);
    assert_eq!(harness.differ.with_dag(|dag| dag.edges()), before);
    assert_eq!(logged_entries(&harness)?.len(), 2);
    Ok(())
}

#[test]
fn only_leaf_backups_are_kept() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let harness = chain(&dir, options())?;
    let differ = &harness.differ;

    assert_eq!(differ.prune_sst_files()?, 1);
    assert!(sst_path(differ.sst_backup_dir(), "000001").exists());
    assert!(!sst_path(differ.sst_backup_dir(), "000002").exists());
    assert_eq!(differ.prune_sst_files()?, 0);
    Ok(())
}

#[test]
fn background_tasks_drain_the_queue() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let harness = compacted(
        &dir,
        DifferOptions {
            prune_daemon_interval: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(5),
            ..options()
        },
    )?;
    let differ = &harness.differ;

    let deadline = Instant::now() + Duration::from_secs(10);
    while differ.pruning_metrics().queue_len > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(differ.pruning_metrics().queue_len, 0);
    assert!(logged_entries(&harness)?[0].input_files.iter().all(|f| f.pruned));

    differ.close();
    assert!(differ.is_closed());
    Ok(())
}
