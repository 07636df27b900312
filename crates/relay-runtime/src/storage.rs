use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// A typed key into [`AgentStorage`].
pub struct StorageKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StorageKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Per-run key/value storage shared by every context of one run.
#[derive(Clone, Default)]
pub struct AgentStorage {
    values: Arc<RwLock<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>>,
}

impl AgentStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Send + Sync + 'static>(&self, key: &StorageKey<T>, value: T) {
        self.values.write().insert(key.name, Arc::new(value));
    }

    /// The stored value, if present under `key` with type `T`.
    pub fn get<T: Send + Sync + 'static>(&self, key: &StorageKey<T>) -> Option<Arc<T>> {
        let value = self.values.read().get(key.name).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn remove<T: Send + Sync + 'static>(&self, key: &StorageKey<T>) -> Option<Arc<T>> {
        let value = self.values.write().remove(key.name)?;
        value.downcast::<T>().ok()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    pub fn clear(&self) {
        self.values.write().clear();
    }
}
