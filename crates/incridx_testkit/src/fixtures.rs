//! Test fixtures and engine helpers.
//!
//! Provides sample index definitions, an in-memory content source, a manual
//! clock and a temporary engine that can be closed and reopened in place.

use incridx_core::{
    Clock, ContentError, ContentSource, Config, Engine, EngineBuilder, FileContent, FileId, IndexDefinition,
    IndexRef, ReadPolicy, SystemClock, TaskContext,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Maps every whitespace-separated word to its number of occurrences.
///
/// Content starting with `#binary` is rejected by the input filter.
#[derive(Debug, Clone)]
pub struct WordIndex {
    name: String,
    version: u32,
}

impl WordIndex {
    /// Creates the `words` index at schema version 1.
    pub fn new() -> Self {
        Self::with_version(1)
    }

    /// Creates the `words` index at the given schema version.
    pub fn with_version(version: u32) -> Self {
        Self {
            name: "words".to_string(),
            version,
        }
    }

    /// Renames the index.
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}

impl Default for WordIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexDefinition for WordIndex {
    type Key = String;
    type Value = u32;

    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn accepts(&self, content: &FileContent) -> bool {
        !content.bytes().starts_with(b"#binary")
    }

    fn map(&self, content: &FileContent) -> HashMap<String, u32> {
        let mut counts = HashMap::new();
        for word in content.text().unwrap_or_default().split_whitespace() {
            *counts.entry(word.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

/// Maps content to its byte length, valued by the content fingerprint.
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthIndex;

impl IndexDefinition for LengthIndex {
    type Key = u64;
    type Value = u64;

    fn name(&self) -> &str {
        "lengths"
    }

    fn version(&self) -> u32 {
        1
    }

    fn map(&self, content: &FileContent) -> HashMap<u64, u64> {
        HashMap::from([(content.bytes().len() as u64, content.fingerprint())])
    }
}

/// In-memory [`ContentSource`] keyed by file id.
#[derive(Debug, Default)]
pub struct MapContentSource {
    files: Mutex<HashMap<FileId, FileContent>>,
}

impl MapContentSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores persisted text for a file.
    pub fn set_text(&self, file: u32, text: &str) {
        self.set(FileId::new(file), FileContent::persisted(text.as_bytes()));
    }

    /// Stores content for a file.
    pub fn set(&self, file: FileId, content: FileContent) {
        self.files.lock().expect("source lock poisoned").insert(file, content);
    }

    /// Deletes a file.
    pub fn remove(&self, file: u32) {
        self.files.lock().expect("source lock poisoned").remove(&FileId::new(file));
    }
}

impl ContentSource for MapContentSource {
    fn content(&self, file: FileId) -> Result<Option<FileContent>, ContentError> {
        Ok(self.files.lock().expect("source lock poisoned").get(&file).cloned())
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Creates a clock reading `millis`.
    pub fn new(millis: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(millis),
        })
    }

    /// Sets the current time, possibly backwards.
    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    /// Moves the clock forward.
    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Configuration used by test engines: no background flusher, sanity
/// checks on.
pub fn test_config() -> Config {
    Config::new().background_flush(false).sanity_checks(true)
}

/// An engine with a `words` index in a temporary directory.
pub struct TestEngine {
    /// The engine instance.
    pub engine: Engine,
    /// Handle of the `words` index.
    pub words: IndexRef<WordIndex>,
    dir: TempDir,
}

impl TestEngine {
    /// Opens a fresh engine with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Opens a fresh engine with a custom configuration.
    pub fn with_config(config: Config) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        Self::open_in(dir, config, Arc::new(SystemClock), WordIndex::new())
    }

    /// Opens an engine in an existing directory.
    pub fn open_in(dir: TempDir, config: Config, clock: Arc<dyn Clock>, words: WordIndex) -> Self {
        let mut builder = EngineBuilder::new().clock(clock);
        let words = builder.register(words).expect("Failed to register words index");
        let engine = Engine::open(dir.path(), config, builder).expect("Failed to open engine");
        Self { engine, words, dir }
    }

    /// Closes the engine and opens it again in the same directory.
    pub fn reopen(self) -> Self {
        self.reopen_with(test_config(), Arc::new(SystemClock), WordIndex::new())
    }

    /// Closes the engine and reopens it with other settings.
    pub fn reopen_with(self, config: Config, clock: Arc<dyn Clock>, words: WordIndex) -> Self {
        let Self { engine, dir, .. } = self;
        engine.close().expect("Failed to close engine");
        drop(engine);
        Self::open_in(dir, config, clock, words)
    }

    /// Closes the engine, lets `tamper` edit the root, then reopens it.
    pub fn reopen_after(self, tamper: impl FnOnce(&Path)) -> Self {
        let Self { engine, dir, .. } = self;
        engine.close().expect("Failed to close engine");
        drop(engine);
        tamper(dir.path());
        Self::open_in(dir, test_config(), Arc::new(SystemClock), WordIndex::new())
    }

    /// Returns the engine root.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Indexes persisted text as the content of `file`.
    ///
    /// Returns the number of indices updated.
    pub fn index_text(&self, file: u32, text: &str) -> usize {
        self.engine
            .index_file(FileId::new(file), &FileContent::persisted(text.as_bytes()), &TaskContext::new())
            .expect("Failed to index file")
    }

    /// Removes `file` from every index.
    pub fn remove(&self, file: u32) {
        self.engine
            .remove_file(FileId::new(file), &TaskContext::new())
            .expect("Failed to remove file");
    }

    /// Files containing `word`.
    pub fn files_of(&self, word: &str) -> Vec<FileId> {
        self.engine
            .get_files(&self.words, &word.to_string(), ReadPolicy::FailFast)
            .expect("Failed to query words index")
    }

    /// Words `file` contributes to the index.
    pub fn words_of(&self, file: u32) -> Vec<String> {
        self.engine
            .forward_keys(&self.words, FileId::new(file), ReadPolicy::FailFast)
            .expect("Failed to read forward keys")
            .into_iter()
            .collect()
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}
