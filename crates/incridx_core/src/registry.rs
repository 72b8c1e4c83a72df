//! Registered indices and typed handles to them.

use crate::error::{CoreError, CoreResult};
use crate::index::{IndexDefinition, IndexHandle, IndexInstance};
use crate::types::IndexId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Typed handle to a registered index.
///
/// Returned by registration and used for queries, so key and value types
/// are checked at compile time.
pub struct IndexRef<D: IndexDefinition> {
    id: IndexId,
    _definition: PhantomData<fn() -> D>,
}

impl<D: IndexDefinition> IndexRef<D> {
    pub(crate) fn new(id: IndexId) -> Self {
        Self {
            id,
            _definition: PhantomData,
        }
    }

    /// Returns the index id.
    #[must_use]
    pub fn id(&self) -> &IndexId {
        &self.id
    }

    /// Returns the index name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.id.as_str()
    }
}

impl<D: IndexDefinition> Clone for IndexRef<D> {
    fn clone(&self) -> Self {
        Self::new(self.id.clone())
    }
}

impl<D: IndexDefinition> fmt::Debug for IndexRef<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IndexRef").field(&self.id).finish()
    }
}

/// The set of opened indices, in registration order.
#[derive(Debug, Default)]
pub(crate) struct IndexRegistry {
    handles: Vec<Arc<dyn IndexHandle>>,
    by_name: HashMap<IndexId, usize>,
}

impl IndexRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, handle: Arc<dyn IndexHandle>) -> CoreResult<()> {
        let id = handle.id().clone();
        if self.by_name.contains_key(&id) {
            return Err(CoreError::DuplicateIndex { name: id.to_string() });
        }
        self.by_name.insert(id, self.handles.len());
        self.handles.push(handle);
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn handles(&self) -> &[Arc<dyn IndexHandle>] {
        &self.handles
    }

    pub(crate) fn by_name(&self, name: &str) -> CoreResult<&Arc<dyn IndexHandle>> {
        self.by_name
            .get(&IndexId::new(name))
            .and_then(|&pos| self.handles.get(pos))
            .ok_or_else(|| CoreError::UnknownIndex { name: name.to_string() })
    }

    /// Resolves a typed handle to its instance.
    pub(crate) fn typed<D: IndexDefinition>(&self, index: &IndexRef<D>) -> CoreResult<&IndexInstance<D>> {
        self.by_name(index.name())?
            .as_any()
            .downcast_ref::<IndexInstance<D>>()
            .ok_or_else(|| CoreError::IndexTypeMismatch {
                name: index.name().to_string(),
            })
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.handles.iter().map(|h| h.id().to_string()).collect()
    }
}
