//! In-memory byte store: `name → (reference count, bytes)`.

use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use cairn_core::ChunkId;

use super::{Accounting, ChunkData, ChunkStore, RawChunkStore};

/// Map-backed store. Not synchronised — wrap in [`ThreadsafeChunkStore`]
/// (or hold it behind your own lock, as the buffered store's cache does).
///
/// [`ThreadsafeChunkStore`]: super::ThreadsafeChunkStore
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: BTreeMap<ChunkId, (u64, Bytes)>,
    accounting: Accounting,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn drop_reference(&mut self, name: &ChunkId) {
        if let Some(entry) = self.chunks.get_mut(name) {
            entry.0 -= 1;
            if entry.0 == 0 {
                let released = entry.1.len() as u64;
                self.chunks.remove(name);
                self.accounting.remove(released);
            }
        }
    }
}

impl RawChunkStore for MemoryChunkStore {
    fn get(&self, name: &ChunkId) -> Option<Bytes> {
        self.chunks.get(name).map(|(_, content)| content.clone())
    }

    fn get_to_file(&self, name: &ChunkId, sink: &Path) -> bool {
        match self.chunks.get(name) {
            Some((_, content)) => std::fs::write(sink, content).is_ok(),
            None => {
                tracing::debug!(chunk = %name, "get: not held");
                false
            }
        }
    }

    fn store(&mut self, name: &ChunkId, content: Bytes) -> bool {
        if let Some(entry) = self.chunks.get_mut(name) {
            entry.0 += 1;
            return true;
        }

        let chunk_size = content.len() as u64;
        if chunk_size == 0 {
            tracing::error!(chunk = %name, "store: empty content");
            return false;
        }
        if !self.accounting.vacant(chunk_size) {
            tracing::error!(chunk = %name, size = chunk_size, "store: no vacant space");
            return false;
        }

        self.chunks.insert(name.clone(), (1, content));
        self.accounting.add(chunk_size);
        true
    }

    fn store_from_file(&mut self, name: &ChunkId, source: &Path, delete_source: bool) -> bool {
        if self.chunks.contains_key(name) {
            // Existing chunk: the source only has to be plausible.
            if !source.as_os_str().is_empty() && !source.exists() {
                tracing::error!(chunk = %name, "store: non-existent source file");
                return false;
            }
            if let Some(entry) = self.chunks.get_mut(name) {
                entry.0 += 1;
            }
        } else {
            let content = match std::fs::read(source) {
                Ok(bytes) => Bytes::from(bytes),
                Err(e) => {
                    tracing::error!(chunk = %name, error = %e, "store: failed to read source");
                    return false;
                }
            };
            if !self.store(name, content) {
                return false;
            }
        }

        if delete_source {
            let _ = std::fs::remove_file(source);
        }
        true
    }

    fn delete(&mut self, name: &ChunkId) -> bool {
        self.drop_reference(name);
        true
    }

    fn modify(&mut self, name: &ChunkId, content: Bytes) -> bool {
        let Some((_, current)) = self.chunks.get(name) else {
            return false;
        };
        let current = current.len() as u64;
        let Some((grows, delta)) = self.accounting.assess_replacement(current, content.len() as u64)
        else {
            tracing::error!(chunk = %name, "modify: growth exceeds vacancy");
            return false;
        };
        if let Some(entry) = self.chunks.get_mut(name) {
            entry.1 = content;
        }
        self.accounting.apply_replacement(grows, delta);
        true
    }

    fn has(&self, name: &ChunkId) -> bool {
        self.chunks.contains_key(name)
    }

    fn move_to(&mut self, name: &ChunkId, sink: &dyn ChunkStore) -> bool {
        let Some((_, content)) = self.chunks.get(name) else {
            tracing::warn!(chunk = %name, "move_to: not held");
            return false;
        };
        if !sink.store(name, content.clone()) {
            tracing::error!(chunk = %name, "move_to: sink refused chunk");
            return false;
        }
        self.drop_reference(name);
        true
    }

    fn size_of(&self, name: &ChunkId) -> u64 {
        self.chunks
            .get(name)
            .map(|(_, content)| content.len() as u64)
            .unwrap_or(0)
    }

    fn size(&self) -> u64 {
        self.accounting.size()
    }

    fn capacity(&self) -> u64 {
        self.accounting.capacity()
    }

    fn set_capacity(&mut self, capacity: u64) {
        self.accounting.set_capacity(capacity);
    }

    fn vacant(&self, required: u64) -> bool {
        self.accounting.vacant(required)
    }

    fn count_of(&self, name: &ChunkId) -> u64 {
        self.chunks.get(name).map(|(count, _)| *count).unwrap_or(0)
    }

    fn count(&self) -> u64 {
        self.chunks.len() as u64
    }

    fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.accounting.reset();
    }

    fn list_chunks(&self) -> Vec<ChunkData> {
        self.chunks
            .iter()
            .map(|(name, (_, content))| ChunkData {
                name: name.clone(),
                size: content.len() as u64,
            })
            .collect()
    }
}
