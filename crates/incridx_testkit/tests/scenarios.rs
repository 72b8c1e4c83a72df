//! End-to-end scenarios across the change tracker, transactions and
//! version handling.

use incridx_core::{EventMerger, IndexEventListener, IndexId, IndexingStamp};
use incridx_testkit::prelude::*;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

#[test]
fn changed_keys_are_diffed() {
    init_test_logging();
    let engine = TestEngine::new();

    engine.index_text(1, "a b");
    assert_eq!(engine.words_of(1), vec!["a", "b"]);

    engine.index_text(1, "b c");
    assert!(engine.files_of("a").is_empty());
    assert_eq!(engine.files_of("b"), vec![FileId::new(1)]);
    assert_eq!(engine.files_of("c"), vec![FileId::new(1)]);
    assert_eq!(engine.words_of(1), vec!["b", "c"]);
    assert_consistent(&engine, &engine.words);
}

#[test]
fn other_files_keep_shared_keys() {
    let engine = TestEngine::new();
    engine.index_text(1, "shared one");
    engine.index_text(2, "shared two");

    engine.remove(1);
    assert_eq!(engine.files_of("shared"), vec![FileId::new(2)]);
    assert!(engine.files_of("one").is_empty());
    assert!(engine.words_of(1).is_empty());
    assert_consistent(&engine, &engine.words);
}

#[test]
fn values_follow_content() {
    let engine = TestEngine::new();
    engine.index_text(1, "x x y");
    let values = engine
        .get_values(&engine.words, &"x".to_string(), ReadPolicy::FailFast)
        .unwrap();
    assert_eq!(values, vec![2]);

    engine.index_text(1, "x y");
    let values = engine
        .get_values(&engine.words, &"x".to_string(), ReadPolicy::FailFast)
        .unwrap();
    assert_eq!(values, vec![1]);
}

#[test]
fn content_change_then_removal_merges_to_removal() {
    let merger = EventMerger::new();
    let file = FileId::new(9);
    merger.record(file, ChangeFlags::CONTENT_CHANGED);
    merger.record(file, ChangeFlags::REMOVED);
    assert_eq!(merger.get(file).unwrap().flags, ChangeFlags::REMOVED);

    let engine = TestEngine::new();
    let source = MapContentSource::new();
    source.set_text(9, "still here");
    engine.index_text(9, "still here");

    engine.record_event(file, ChangeFlags::CONTENT_CHANGED).unwrap();
    engine.record_event(file, ChangeFlags::REMOVED).unwrap();
    let report = engine.process_changes(&source, &TaskContext::new()).unwrap();

    assert_eq!(report.changes, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(report.indexed, 0);
    assert!(engine.files_of("still").is_empty());
}

#[test]
fn removal_then_addition_reindexes_from_scratch() {
    let engine = TestEngine::new();
    let source = MapContentSource::new();
    engine.index_text(4, "old words");
    source.set_text(4, "new words");

    engine.record_event(FileId::new(4), ChangeFlags::REMOVED).unwrap();
    engine.record_event(FileId::new(4), ChangeFlags::ADDED).unwrap();
    let report = engine.process_changes(&source, &TaskContext::new()).unwrap();

    assert_eq!(report.removed, 1);
    assert_eq!(report.indexed, 1);
    assert!(engine.files_of("old").is_empty());
    assert_eq!(engine.files_of("new"), vec![FileId::new(4)]);
    assert_eq!(engine.words_of(4), vec!["new", "words"]);
}

#[test]
fn missing_content_removes_file() {
    let engine = TestEngine::new();
    let source = MapContentSource::new();
    engine.index_text(5, "vanished");

    engine.record_event(FileId::new(5), ChangeFlags::CONTENT_CHANGED).unwrap();
    let report = engine.process_changes(&source, &TaskContext::new()).unwrap();
    assert_eq!(report.removed, 1);
    assert!(engine.files_of("vanished").is_empty());
}

#[test]
fn before_change_only_invalidates() {
    let engine = TestEngine::new();
    let source = MapContentSource::new();
    engine.index_text(6, "stable");

    engine
        .record_event(FileId::new(6), ChangeFlags::BEFORE_CONTENT_CHANGED)
        .unwrap();
    let report = engine.process_changes(&source, &TaskContext::new()).unwrap();

    assert_eq!(report.invalidated, 1);
    assert_eq!(engine.files_of("stable"), vec![FileId::new(6)]);
    assert_eq!(
        engine.indexing_stamp(&engine.words, FileId::new(6)).unwrap(),
        IndexingStamp::Outdated
    );
    assert_eq!(engine.index_text(6, "stable"), 1);
    assert_eq!(
        engine.indexing_stamp(&engine.words, FileId::new(6)).unwrap(),
        IndexingStamp::UpToDate
    );
}

#[test]
fn rejected_content_is_removed() {
    let engine = TestEngine::new();
    engine.index_text(7, "plain text");
    assert_eq!(engine.index_text(7, "#binary plain"), 1);
    assert!(engine.files_of("plain").is_empty());
    assert_eq!(
        engine.indexing_stamp(&engine.words, FileId::new(7)).unwrap(),
        IndexingStamp::Unindexed
    );
}

#[test]
fn schema_bump_wipes_index() {
    let engine = TestEngine::new();
    engine.index_text(1, "before bump");
    engine.flush_all().unwrap();
    let entries = engine.path().join("indices").join("words").join("entries.log");
    assert!(fs::metadata(&entries).unwrap().len() > 0);

    let engine = engine.reopen_with(test_config(), Arc::new(incridx_core::SystemClock), WordIndex::with_version(2));
    assert_eq!(
        engine.registration_report(),
        &[(IndexId::new("words"), VersionDiff::VersionChanged)]
    );
    assert_eq!(fs::metadata(&entries).unwrap().len(), 0);
    assert!(engine.files_of("before").is_empty());

    engine.index_text(1, "after bump");
    assert_eq!(engine.files_of("after"), vec![FileId::new(1)]);

    let engine = engine.reopen_with(test_config(), Arc::new(incridx_core::SystemClock), WordIndex::with_version(2));
    assert_eq!(
        engine.registration_report(),
        &[(IndexId::new("words"), VersionDiff::UpToDate)]
    );
    assert_eq!(engine.files_of("after"), vec![FileId::new(1)]);
}

#[test]
fn engine_version_change_invalidates_every_index() {
    let engine = TestEngine::new();
    engine.index_text(1, "kept");
    let engine = engine.reopen_with(
        test_config().engine_version(2),
        Arc::new(incridx_core::SystemClock),
        WordIndex::new(),
    );
    assert_eq!(engine.registration_report()[0].1, VersionDiff::VersionChanged);
    assert!(engine.files_of("kept").is_empty());
}

#[test]
fn leftover_dirty_marker_forces_rebuild() {
    let engine = TestEngine::new();
    engine.index_text(1, "suspect");

    let engine = engine.reopen_after(|root| {
        fs::write(root.join("indices").join("words").join("DIRTY"), b"").unwrap();
    });
    assert_eq!(engine.registration_report()[0].1, VersionDiff::CorruptedRebuild);
    assert!(engine.files_of("suspect").is_empty());
}

#[test]
fn creation_stamp_survives_clock_regression() {
    let clock = ManualClock::new(1_000_000);
    let dir = TempDir::new().unwrap();
    let engine = TestEngine::open_in(dir, test_config(), clock.clone(), WordIndex::new());
    let first = engine.index_version("words").unwrap().creation_stamp;

    clock.set(10);
    let engine = engine.reopen_with(test_config(), clock.clone(), WordIndex::with_version(2));
    let second = engine.index_version("words").unwrap().creation_stamp;
    assert!(second > first);

    assert_eq!(engine.request_rebuild("words").unwrap(), RebuildOutcome::Performed);
    let third = engine.index_version("words").unwrap().creation_stamp;
    assert!(third > second);

    engine.index_text(1, "fresh");
    assert_eq!(
        engine.indexing_stamp(&engine.words, FileId::new(1)).unwrap(),
        incridx_core::IndexingStamp::UpToDate
    );
}

#[test]
fn invalidate_all_forces_reindexing() {
    let engine = TestEngine::new();
    engine.index_text(1, "one");
    engine.index_text(2, "two");
    assert_eq!(engine.index_text(1, "one"), 0);

    assert_eq!(engine.invalidate_all().unwrap(), 2);
    assert_eq!(engine.files_of("one"), vec![FileId::new(1)]);
    assert_eq!(engine.index_text(1, "one"), 1);
}

#[test]
fn dirty_files_survive_restart_as_orphans() {
    let engine = TestEngine::new();
    let source = MapContentSource::new();
    source.set_text(3, "late arrival");
    engine.record_event(FileId::new(3), ChangeFlags::ADDED).unwrap();
    assert_eq!(engine.dirty_files(), vec![FileId::new(3)]);

    let engine = engine.reopen();
    assert_eq!(engine.recover_orphans().unwrap(), vec![FileId::new(3)]);
    let report = engine.process_changes(&source, &TaskContext::new()).unwrap();
    assert_eq!(report.indexed, 1);
    assert!(engine.dirty_files().is_empty());
    assert_eq!(engine.files_of("late"), vec![FileId::new(3)]);
}

#[test]
fn partitions_restore_their_dirty_files() {
    let engine = TestEngine::new();
    let first = engine.open_partition("project").unwrap();
    assert!(first.full_rescan_required);

    engine.assign_to_partition(FileId::new(8), "project").unwrap();
    engine.record_event(FileId::new(8), ChangeFlags::CONTENT_CHANGED).unwrap();
    assert_eq!(engine.close_partition("project").unwrap(), 1);
    assert!(engine.dirty_files().is_empty());

    let engine = engine.reopen();
    let recovery = engine.open_partition("project").unwrap();
    assert!(!recovery.full_rescan_required);
    assert_eq!(recovery.dirty, vec![FileId::new(8)]);
    assert!(engine.is_dirty(FileId::new(8)));

    assert!(matches!(
        engine.assign_to_partition(FileId::new(1), "elsewhere"),
        Err(CoreError::UnknownPartition { .. })
    ));
}

#[derive(Default)]
struct Counting {
    required: AtomicUsize,
    finished: AtomicUsize,
}

impl IndexEventListener for Counting {
    fn on_rebuild_required(&self, _index: &IndexId) {
        self.required.fetch_add(1, Ordering::SeqCst);
    }

    fn on_rebuild_finished(&self, _index: &IndexId) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn listener_hears_about_rebuilds() {
    let dir = TempDir::new().unwrap();
    let listener = Arc::new(Counting::default());
    let mut builder = EngineBuilder::new().listener(listener.clone());
    let words = builder.register(WordIndex::new()).unwrap();
    let engine = Engine::open(dir.path(), test_config(), builder).unwrap();

    engine
        .index_file(FileId::new(1), &FileContent::persisted(&b"wiped"[..]), &TaskContext::new())
        .unwrap();
    engine.request_rebuild("words").unwrap();

    assert_eq!(listener.required.load(Ordering::SeqCst), 1);
    assert_eq!(listener.finished.load(Ordering::SeqCst), 1);
    assert!(engine
        .get_files(&words, &"wiped".to_string(), ReadPolicy::FailFast)
        .unwrap()
        .is_empty());
    assert_eq!(engine.status("words").unwrap(), RebuildStatus::Ok);
}

#[test]
fn typed_handle_from_another_engine_is_checked() {
    let dir = TempDir::new().unwrap();
    let mut builder = EngineBuilder::new();
    builder.register(LengthIndex).unwrap();
    let engine = Engine::open(dir.path(), test_config(), builder).unwrap();

    let other = TestEngine::new();
    assert!(matches!(
        engine.get_files(&other.words, &"x".to_string(), ReadPolicy::FailFast),
        Err(CoreError::UnknownIndex { .. })
    ));

    let impostor = TestEngine::open_in(
        TempDir::new().unwrap(),
        test_config(),
        Arc::new(incridx_core::SystemClock),
        WordIndex::new().named("lengths"),
    );
    assert!(matches!(
        engine.get_files(&impostor.words, &"x".to_string(), ReadPolicy::FailFast),
        Err(CoreError::IndexTypeMismatch { .. })
    ));
}
