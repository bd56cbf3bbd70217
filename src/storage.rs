//! Pluggable persistence for the records this node accepts.

use std::collections::BTreeMap;
use std::fmt::Debug;

use bytes::Bytes;

use crate::common::Id;

/// A streaming scan over every stored entry. Dropping it closes the scan;
/// calling [Storage::scan] again re-opens one.
pub type ScanIter<'a> = Box<dyn Iterator<Item = Result<(Id, Bytes), StorageError>> + 'a>;

/// What the node requires of its storage engine. Values are opaque bytes;
/// the node serializes its records before they get here.
pub trait Storage: Send + Debug {
    /// Returns the stored bytes for a key, or None.
    fn get(&self, key: &Id) -> Result<Option<Bytes>, StorageError>;

    /// Stores bytes under a key, replacing any previous value.
    fn put(&mut self, key: Id, value: Bytes) -> Result<(), StorageError>;

    /// Deletes a key. Deleting an absent key is not an error.
    fn del(&mut self, key: &Id) -> Result<(), StorageError>;

    /// Opens a streaming scan over all entries, in no particular order.
    fn scan(&self) -> ScanIter<'_>;
}

#[derive(thiserror::Error, Debug)]
/// Errors a storage backend may surface.
pub enum StorageError {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    Io(#[from] std::io::Error),

    /// Any backend-specific failure.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Default)]
/// In-memory [Storage] used as the default backend and in tests.
pub struct MemoryStore {
    records: BTreeMap<Id, Bytes>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            records: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Storage for MemoryStore {
    fn get(&self, key: &Id) -> Result<Option<Bytes>, StorageError> {
        Ok(self.records.get(key).cloned())
    }

    fn put(&mut self, key: Id, value: Bytes) -> Result<(), StorageError> {
        self.records.insert(key, value);
        Ok(())
    }

    fn del(&mut self, key: &Id) -> Result<(), StorageError> {
        self.records.remove(key);
        Ok(())
    }

    fn scan(&self) -> ScanIter<'_> {
        Box::new(
            self.records
                .iter()
                .map(|(key, value)| Ok((*key, value.clone()))),
        )
    }
}
