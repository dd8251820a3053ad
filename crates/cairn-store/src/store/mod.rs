//! Byte stores — the bottom tier of the storage pipeline.
//!
//! Three variants share one contract: an in-memory map, a file-backed tree,
//! and a mutex wrapper that makes either shareable. Stores count references
//! per chunk and account for bytes against an optional capacity.

mod buffered;
mod file;
mod memory;
mod threadsafe;

pub use buffered::BufferedChunkStore;
pub use file::FileChunkStore;
pub use memory::MemoryChunkStore;
pub use threadsafe::ThreadsafeChunkStore;

use std::path::Path;

use bytes::Bytes;
use cairn_core::ChunkId;

/// A chunk name with its stored size, as returned by `list_chunks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    pub name: ChunkId,
    pub size: u64,
}

/// Shared contract of the byte stores.
///
/// Implementors are internally synchronised; every method takes `&self` so a
/// store can sit behind an `Arc` shared by the action authority, the chunk
/// managers and the scheduler.
pub trait ChunkStore: Send + Sync {
    /// Chunk content, or `None` if absent.
    fn get(&self, name: &ChunkId) -> Option<Bytes>;
    /// Write chunk content to `sink`. False if absent or the write fails.
    fn get_to_file(&self, name: &ChunkId, sink: &Path) -> bool;
    /// Store content under `name`; storing an existing name increments its
    /// reference count instead of rewriting.
    fn store(&self, name: &ChunkId, content: Bytes) -> bool;
    /// Store from a source file, optionally deleting it afterwards.
    fn store_from_file(&self, name: &ChunkId, source: &Path, delete_source: bool) -> bool;
    /// Decrement the reference count; remove the bytes at zero. Deleting an
    /// absent chunk succeeds.
    fn delete(&self, name: &ChunkId) -> bool;
    /// Replace content in place, adjusting size accounting.
    fn modify(&self, name: &ChunkId, content: Bytes) -> bool;
    fn has(&self, name: &ChunkId) -> bool;
    /// Transfer one reference to `sink`: store there, decrement here.
    fn move_to(&self, name: &ChunkId, sink: &dyn ChunkStore) -> bool;
    /// Size of one chunk's content, 0 if absent.
    fn size_of(&self, name: &ChunkId) -> u64;
    /// Total bytes held, counting each reference.
    fn size(&self) -> u64;
    /// Byte budget; 0 means unbounded.
    fn capacity(&self) -> u64;
    /// Change the budget. Values below the current size are raised to it.
    fn set_capacity(&self, capacity: u64);
    /// Whether `required` more bytes would fit.
    fn vacant(&self, required: u64) -> bool;
    /// Reference count of one chunk, 0 if absent.
    fn count_of(&self, name: &ChunkId) -> u64;
    /// Number of distinct chunks held.
    fn count(&self) -> u64;
    fn is_empty(&self) -> bool;
    /// Remove everything and reset accounting.
    fn clear(&self);
    fn list_chunks(&self) -> Vec<ChunkData>;
}

/// The unsynchronised version of the contract, implemented by the raw
/// memory and file stores. Method semantics match [`ChunkStore`];
/// [`ThreadsafeChunkStore`] lifts any implementor into the shared contract
/// by serialising every call behind one mutex.
pub trait RawChunkStore: Send {
    fn get(&self, name: &ChunkId) -> Option<Bytes>;
    fn get_to_file(&self, name: &ChunkId, sink: &Path) -> bool;
    fn store(&mut self, name: &ChunkId, content: Bytes) -> bool;
    fn store_from_file(&mut self, name: &ChunkId, source: &Path, delete_source: bool) -> bool;
    fn delete(&mut self, name: &ChunkId) -> bool;
    fn modify(&mut self, name: &ChunkId, content: Bytes) -> bool;
    fn has(&self, name: &ChunkId) -> bool;
    fn move_to(&mut self, name: &ChunkId, sink: &dyn ChunkStore) -> bool;
    fn size_of(&self, name: &ChunkId) -> u64;
    fn size(&self) -> u64;
    fn capacity(&self) -> u64;
    fn set_capacity(&mut self, capacity: u64);
    fn vacant(&self, required: u64) -> bool;
    fn count_of(&self, name: &ChunkId) -> u64;
    fn count(&self) -> u64;
    fn is_empty(&self) -> bool;
    fn clear(&mut self);
    fn list_chunks(&self) -> Vec<ChunkData>;
}

/// Size/capacity bookkeeping shared by the store implementations.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Accounting {
    size: u64,
    capacity: u64,
}

impl Accounting {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Capacity never drops below the bytes already held.
    pub fn set_capacity(&mut self, capacity: u64) {
        self.capacity = capacity.max(if capacity == 0 { 0 } else { self.size });
        if self.capacity != capacity && capacity != 0 {
            tracing::debug!(
                requested = capacity,
                raised_to = self.capacity,
                "capacity raised to current size"
            );
        }
    }

    pub fn vacant(&self, required: u64) -> bool {
        self.capacity == 0 || self.size + required <= self.capacity
    }

    pub fn add(&mut self, delta: u64) {
        self.size += delta;
    }

    pub fn remove(&mut self, delta: u64) {
        self.size = self.size.saturating_sub(delta);
    }

    pub fn reset(&mut self) {
        self.size = 0;
    }

    /// Work out the accounting delta of replacing `current` bytes with `new`
    /// bytes. Returns `(grows, delta)`, or `None` if the growth would not
    /// fit the remaining capacity.
    pub fn assess_replacement(&self, current: u64, new: u64) -> Option<(bool, u64)> {
        if new > current {
            let delta = new - current;
            if !self.vacant(delta) {
                return None;
            }
            Some((true, delta))
        } else {
            Some((false, current - new))
        }
    }

    pub fn apply_replacement(&mut self, grows: bool, delta: u64) {
        if grows {
            self.add(delta);
        } else {
            self.remove(delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_capacity_clamps_to_size() {
        let mut accounting = Accounting::default();
        accounting.add(100);
        accounting.set_capacity(40);
        assert_eq!(accounting.capacity(), 100);
        accounting.set_capacity(200);
        assert_eq!(accounting.capacity(), 200);
    }

    #[test]
    fn zero_capacity_is_unbounded() {
        let mut accounting = Accounting::default();
        accounting.add(1 << 40);
        assert!(accounting.vacant(u64::MAX - (1 << 40)));
        accounting.set_capacity(0);
        assert_eq!(accounting.capacity(), 0);
    }

    #[test]
    fn assess_replacement_checks_growth_only() {
        let mut accounting = Accounting::default();
        accounting.set_capacity(10);
        accounting.add(8);
        assert_eq!(accounting.assess_replacement(4, 6), Some((true, 2)));
        assert_eq!(accounting.assess_replacement(4, 8), None);
        assert_eq!(accounting.assess_replacement(4, 1), Some((false, 3)));
    }
}
