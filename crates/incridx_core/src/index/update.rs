//! The per-file update transaction.

use super::definition::IndexDefinition;
use super::instance::IndexInstance;
use super::stamps::FileStamp;
use crate::buffering::BufferMode;
use crate::cancel::TaskContext;
use crate::content::FileContent;
use crate::error::{CoreError, CoreResult};
use crate::types::FileId;
use std::collections::{BTreeSet, HashMap};
use tracing::{trace, warn};

impl<D: IndexDefinition> IndexInstance<D> {
    /// Replaces the contribution of `file` with the mapping of `content`.
    ///
    /// `None` content, or content the definition rejects, removes the file.
    /// The mapping runs outside the index lock; the table changes run under
    /// the write lock and either all land or the index is sent to rebuild.
    pub(crate) fn update_file(
        &self,
        ctx: &TaskContext,
        file: FileId,
        content: Option<&FileContent>,
        mode: BufferMode,
    ) -> CoreResult<()> {
        let _marker = ctx.enter(&self.id)?;
        ctx.check_cancelled()?;
        if !self.rebuild.is_ok() {
            return Err(CoreError::not_ready(self.id.as_str(), self.rebuild.status()));
        }

        let accepted = content.filter(|c| self.definition.accepts(c));
        let mapped = accepted.map_or_else(HashMap::new, |c| self.definition.map(c));
        let fingerprint = accepted.map(FileContent::fingerprint);

        let guard = self.lock.write();
        if !self.rebuild.is_ok() {
            return Err(CoreError::not_ready(self.id.as_str(), self.rebuild.status()));
        }

        let result = match self.apply(file, &mapped, fingerprint, mode) {
            Err(e) if e.is_transient() => {
                warn!(index = %self.id, %file, error = %e, "transient failure, retrying update");
                self.apply(file, &mapped, fingerprint, mode)
            }
            other => other,
        };

        match result {
            Ok(()) => {
                drop(guard);
                if accepted.is_some() {
                    self.env.stats.record_update();
                } else {
                    self.env.stats.record_removal();
                }
                Ok(())
            }
            Err(e) if e.requires_rebuild() => {
                drop(guard);
                self.env.stats.record_error();
                self.mark_corrupted(&e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn apply(
        &self,
        file: FileId,
        mapped: &HashMap<D::Key, D::Value>,
        fingerprint: Option<u64>,
        mode: BufferMode,
    ) -> CoreResult<()> {
        if mode == BufferMode::Persistent {
            self.note_unflushed()?;
        }

        let old_keys = self.forward.read_input_keys(file)?;
        let new_keys: BTreeSet<D::Key> = mapped.keys().cloned().collect();

        for key in old_keys.difference(&new_keys) {
            self.entries.remove_associated_value(key, file, mode)?;
        }
        for (key, value) in mapped {
            self.entries.add_value(key, file, value.clone(), mode)?;
        }
        if old_keys != new_keys {
            self.forward.write_input_keys(file, &new_keys, mode)?;
        }
        trace!(
            index = %self.id,
            %file,
            removed = old_keys.difference(&new_keys).count(),
            keys = new_keys.len(),
            "applied file update"
        );

        if self.env.config.sanity_checks {
            self.verify(file, mapped)?;
        }

        if mode == BufferMode::Persistent {
            match fingerprint {
                Some(fingerprint) => self.stamps.set(
                    file,
                    FileStamp {
                        stamp: self.current_stamp(),
                        fingerprint,
                    },
                )?,
                None => self.stamps.remove(file)?,
            }
        }
        Ok(())
    }

    /// Checks that forward and inverted tables agree on `file`.
    fn verify(&self, file: FileId, mapped: &HashMap<D::Key, D::Value>) -> CoreResult<()> {
        let violation = |message: String| CoreError::ConsistencyViolation {
            index: self.id.as_str().to_string(),
            file,
            message,
        };

        let forward = self.forward.read_input_keys(file)?;
        if forward.len() != mapped.len() || !mapped.keys().all(|k| forward.contains(k)) {
            return Err(violation(format!(
                "forward record has {} keys, mapping produced {}",
                forward.len(),
                mapped.len()
            )));
        }
        for (key, value) in mapped {
            let container = self.entries.read(key)?;
            if container.value_of(file) != Some(value) {
                return Err(violation(format!("inverted entry for {key:?} does not hold the mapped value")));
            }
        }
        Ok(())
    }
}
