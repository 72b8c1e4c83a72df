//! Forward/inverted consistency checks.
//!
//! An index is consistent when every key in a file's forward record lists
//! the file in its inverted entry, and no inverted entry lists a file whose
//! forward record lacks that key.

use incridx_core::{CoreResult, Engine, FileId, IndexDefinition, IndexRef, ReadPolicy, TaskContext};
use std::collections::{BTreeMap, BTreeSet};

/// Both views of an index, for comparisons across operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSnapshot<K: Ord> {
    /// Key to `(file, debug-formatted value)` pairs, files ascending.
    pub entries: BTreeMap<K, Vec<(FileId, String)>>,
    /// File to the keys of its forward record.
    pub forward: BTreeMap<FileId, BTreeSet<K>>,
}

/// Reads every key and every forward record of an index.
pub fn snapshot<D: IndexDefinition>(engine: &Engine, index: &IndexRef<D>) -> CoreResult<IndexSnapshot<D::Key>> {
    let mut entries = BTreeMap::new();
    engine.process_keys(
        index,
        |_: &D::Key| true,
        None,
        &TaskContext::new(),
        ReadPolicy::FailFast,
        |key: &D::Key, container: &incridx_core::ValueContainer<D::Value>| {
            let files = container
                .files()
                .into_iter()
                .map(|file| (file, format!("{:?}", container.value_of(file))))
                .collect();
            entries.insert(key.clone(), files);
            true
        },
    )?;

    let mut forward = BTreeMap::new();
    for file in engine.indexed_files(index, ReadPolicy::FailFast)? {
        forward.insert(file, engine.forward_keys(index, file, ReadPolicy::FailFast)?);
    }
    Ok(IndexSnapshot { entries, forward })
}

/// Lists every disagreement between the forward and inverted views.
pub fn consistency_violations<D: IndexDefinition>(engine: &Engine, index: &IndexRef<D>) -> CoreResult<Vec<String>> {
    let snapshot = snapshot(engine, index)?;
    let mut violations = Vec::new();

    for (file, keys) in &snapshot.forward {
        for key in keys {
            let listed = snapshot
                .entries
                .get(key)
                .is_some_and(|files| files.iter().any(|(f, _)| f == file));
            if !listed {
                violations.push(format!("{file} has forward key {key:?} but is missing from its entry"));
            }
        }
    }

    for (key, files) in &snapshot.entries {
        for (file, _) in files {
            let owns = snapshot.forward.get(file).is_some_and(|keys| keys.contains(key));
            if !owns {
                violations.push(format!("entry {key:?} lists {file} whose forward record lacks it"));
            }
        }
    }
    Ok(violations)
}

/// Panics with every violation if the index is inconsistent.
pub fn assert_consistent<D: IndexDefinition>(engine: &Engine, index: &IndexRef<D>) {
    let violations = consistency_violations(engine, index).expect("Failed to read index");
    assert!(
        violations.is_empty(),
        "index {} is inconsistent:\n{}",
        index.name(),
        violations.join("\n")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestEngine;

    #[test]
    fn fresh_index_is_consistent() {
        let engine = TestEngine::new();
        assert!(consistency_violations(&engine, &engine.words).unwrap().is_empty());
    }

    #[test]
    fn snapshot_reflects_updates() {
        let engine = TestEngine::new();
        engine.index_text(1, "x y x");
        engine.index_text(2, "y");

        let snap = snapshot(&engine, &engine.words).unwrap();
        assert_eq!(snap.entries["x"], vec![(FileId::new(1), "Some(2)".to_string())]);
        assert_eq!(snap.entries["y"].len(), 2);
        assert_eq!(snap.forward.len(), 2);
        assert_consistent(&engine, &engine.words);
    }
}
