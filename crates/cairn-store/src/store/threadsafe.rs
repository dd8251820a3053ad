//! Mutex wrapper lifting a raw store into the shared [`ChunkStore`] contract.

use std::path::Path;

use bytes::Bytes;
use cairn_core::ChunkId;
use parking_lot::Mutex;

use super::{ChunkData, ChunkStore, RawChunkStore};

/// Wraps any [`RawChunkStore`] behind a single mutex; every operation holds
/// it for the duration. Simple and coarse on purpose — the stores guard
/// on-disk state, so finer locking buys nothing.
pub struct ThreadsafeChunkStore<S: RawChunkStore> {
    inner: Mutex<S>,
}

impl<S: RawChunkStore> ThreadsafeChunkStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl<S: RawChunkStore> ChunkStore for ThreadsafeChunkStore<S> {
    fn get(&self, name: &ChunkId) -> Option<Bytes> {
        self.inner.lock().get(name)
    }

    fn get_to_file(&self, name: &ChunkId, sink: &Path) -> bool {
        self.inner.lock().get_to_file(name, sink)
    }

    fn store(&self, name: &ChunkId, content: Bytes) -> bool {
        self.inner.lock().store(name, content)
    }

    fn store_from_file(&self, name: &ChunkId, source: &Path, delete_source: bool) -> bool {
        self.inner.lock().store_from_file(name, source, delete_source)
    }

    fn delete(&self, name: &ChunkId) -> bool {
        self.inner.lock().delete(name)
    }

    fn modify(&self, name: &ChunkId, content: Bytes) -> bool {
        self.inner.lock().modify(name, content)
    }

    fn has(&self, name: &ChunkId) -> bool {
        self.inner.lock().has(name)
    }

    fn move_to(&self, name: &ChunkId, sink: &dyn ChunkStore) -> bool {
        self.inner.lock().move_to(name, sink)
    }

    fn size_of(&self, name: &ChunkId) -> u64 {
        self.inner.lock().size_of(name)
    }

    fn size(&self) -> u64 {
        self.inner.lock().size()
    }

    fn capacity(&self) -> u64 {
        self.inner.lock().capacity()
    }

    fn set_capacity(&self, capacity: u64) {
        self.inner.lock().set_capacity(capacity)
    }

    fn vacant(&self, required: u64) -> bool {
        self.inner.lock().vacant(required)
    }

    fn count_of(&self, name: &ChunkId) -> u64 {
        self.inner.lock().count_of(name)
    }

    fn count(&self) -> u64 {
        self.inner.lock().count()
    }

    fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn clear(&self) {
        self.inner.lock().clear()
    }

    fn list_chunks(&self) -> Vec<ChunkData> {
        self.inner.lock().list_chunks()
    }
}
