//! Memory-over-disk buffered chunk store.
//!
//! Composes an LRU-managed memory cache with a permanent file store behind
//! one mutex wrapper. Stores land in the cache first and are promoted to
//! disk by a background worker; a pending-transfer set tracks in-flight
//! promotions so deletes, modifies and moves can drain them first.
//!
//! Lock order: `xfer` may be taken alone or before `cache`; `cache` is
//! never held while acquiring `xfer`. The condvar lives on `xfer` and
//! signals transfer and deletion completion. Every blocking wait is bounded
//! and reports failure instead of deadlocking.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cairn_core::ChunkId;
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{ChunkData, ChunkStore, FileChunkStore, MemoryChunkStore, RawChunkStore,
            ThreadsafeChunkStore};

/// Bound on a single wait for pending transfers.
pub const XFER_WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// If the cache is full with nothing left to evict, how many transfer
/// completions to wait for before giving up.
pub const WAIT_TRANSFERS_FOR_CACHE_VACANT_CHECK: u32 = 10;

struct CacheState {
    store: MemoryChunkStore,
    /// Cached names, most recently used at the front.
    recency: VecDeque<ChunkId>,
}

struct XferState {
    /// In-flight promotions, name → outstanding transfer count.
    pending: HashMap<ChunkId, u32>,
    /// Chunks marked deletable, drained when permanent space is needed.
    removable: VecDeque<ChunkId>,
    /// Cached copy of the permanent store's size, valid under this lock.
    perm_size: u64,
}

struct Inner {
    cache: Mutex<CacheState>,
    xfer: Mutex<XferState>,
    xfer_done: Condvar,
    permanent: Arc<ThreadsafeChunkStore<FileChunkStore>>,
}

/// The buffered store itself. Shareable via `Arc`; implements
/// [`ChunkStore`] so the action authority can sit on top of it.
pub struct BufferedChunkStore {
    inner: Arc<Inner>,
    promote_tx: Option<mpsc::Sender<ChunkId>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl BufferedChunkStore {
    /// Open the permanent store under `storage_location` and start the
    /// promotion worker. `removable` seeds the marked-for-deletion list.
    pub fn open(
        storage_location: impl Into<PathBuf>,
        removable: Vec<ChunkId>,
        dir_depth: u32,
    ) -> Option<Self> {
        let file_store = FileChunkStore::open(storage_location, dir_depth)?;
        let perm_size = RawChunkStore::size(&file_store);
        let permanent = Arc::new(ThreadsafeChunkStore::new(file_store));

        let inner = Arc::new(Inner {
            cache: Mutex::new(CacheState {
                store: MemoryChunkStore::new(),
                recency: VecDeque::new(),
            }),
            xfer: Mutex::new(XferState {
                pending: HashMap::new(),
                removable: removable.into(),
                perm_size,
            }),
            xfer_done: Condvar::new(),
            permanent,
        });

        let (promote_tx, promote_rx) = mpsc::channel::<ChunkId>();
        let worker_inner = inner.clone();
        let worker = std::thread::Builder::new()
            .name("chunk-promote".into())
            .spawn(move || {
                while let Ok(name) = promote_rx.recv() {
                    worker_inner.do_make_chunk_permanent(&name);
                }
            })
            .ok()?;

        Some(Self {
            inner,
            promote_tx: Some(promote_tx),
            worker: Some(worker),
        })
    }

    // ── Cache surface ─────────────────────────────────────────────────────────

    /// Store into the cache only, registering the chunk for LRU eviction.
    pub fn cache_store(&self, name: &ChunkId, content: Bytes) -> bool {
        if !self.inner.do_cache_store(name, content) {
            tracing::error!(chunk = %name, "failed to cache");
            return false;
        }
        self.inner.add_recency_entry(name);
        true
    }

    pub fn cache_has(&self, name: &ChunkId) -> bool {
        self.inner.cache.lock().store.has(name)
    }

    pub fn cache_size(&self) -> u64 {
        self.inner.cache.lock().store.size()
    }

    pub fn cache_capacity(&self) -> u64 {
        self.inner.cache.lock().store.capacity()
    }

    pub fn set_cache_capacity(&self, capacity: u64) {
        self.inner.cache.lock().store.set_capacity(capacity);
    }

    pub fn cache_vacant(&self, required: u64) -> bool {
        self.inner.cache.lock().store.vacant(required)
    }

    pub fn cache_count(&self) -> u64 {
        self.inner.cache.lock().store.count()
    }

    pub fn cache_empty(&self) -> bool {
        self.inner.cache.lock().store.is_empty()
    }

    pub fn cache_clear(&self) {
        let mut xfer = self.inner.xfer.lock();
        if !self.inner.wait_all_pending(&mut xfer) {
            tracing::error!("cache_clear: timed out waiting for pending transfers");
            return;
        }
        drop(xfer);
        let mut cache = self.inner.cache.lock();
        cache.recency.clear();
        cache.store.clear();
    }

    // ── Permanent surface ─────────────────────────────────────────────────────

    /// Promote a cached chunk to the permanent store, synchronously.
    /// Idempotent if the chunk is already permanent.
    pub fn permanent_store(&self, name: &ChunkId) -> bool {
        let content = self.inner.cache.lock().store.get(name);

        let mut xfer = self.inner.xfer.lock();
        self.inner.remove_deletion_marks(&mut xfer, name);
        if !self.inner.wait_pending_for(&mut xfer, name) {
            tracing::error!(chunk = %name, "permanent_store: timed out on pending transfers");
            return false;
        }
        if self.inner.permanent.has(name) {
            return true;
        }
        let Some(content) = content else {
            tracing::error!(chunk = %name, "permanent_store: not in cache");
            return false;
        };
        if !self.inner.permanent.store(name, content) {
            tracing::error!(chunk = %name, "permanent_store: transfer failed");
            return false;
        }
        xfer.perm_size = self.inner.permanent.size();
        true
    }

    /// True if the permanent store holds more references than there are
    /// deletion marks outstanding against the chunk.
    pub fn permanent_has(&self, name: &ChunkId) -> bool {
        let mut xfer = self.inner.xfer.lock();
        if !self.inner.wait_pending_for(&mut xfer, name) {
            tracing::error!(chunk = %name, "permanent_has: timed out on pending transfers");
            return false;
        }
        let marks = xfer.removable.iter().filter(|id| *id == name).count() as u64;
        self.inner.permanent.count_of(name) > marks
    }

    /// Append to the removable-chunks list. Entries are consumed when the
    /// permanent store needs space, or by `delete_all_marked`.
    pub fn mark_for_deletion(&self, name: &ChunkId) {
        self.inner.xfer.lock().removable.push_back(name.clone());
    }

    /// Delete every marked chunk from the permanent store and the cache.
    pub fn delete_all_marked(&self) -> bool {
        let marked: Vec<ChunkId>;
        let mut all_deleted = true;
        {
            let mut xfer = self.inner.xfer.lock();
            marked = xfer.removable.drain(..).collect();
            if !self.inner.wait_all_pending(&mut xfer) {
                tracing::error!("delete_all_marked: timed out waiting for pending transfers");
                return false;
            }
            for name in &marked {
                if !self.inner.permanent.delete(name) {
                    all_deleted = false;
                    tracing::error!(chunk = %name, "delete_all_marked: permanent delete failed");
                }
            }
            xfer.perm_size = self.inner.permanent.size();
        }

        let mut cache = self.inner.cache.lock();
        for name in &marked {
            cache.recency.retain(|id| id != name);
            cache.store.delete(name);
        }
        all_deleted
    }

    pub fn removable_chunks(&self) -> Vec<ChunkId> {
        self.inner.xfer.lock().removable.iter().cloned().collect()
    }
}

impl Drop for BufferedChunkStore {
    fn drop(&mut self) {
        {
            let mut xfer = self.inner.xfer.lock();
            if !self.inner.wait_all_pending(&mut xfer) {
                tracing::error!("buffered store dropped with transfers still pending");
            }
        }
        self.promote_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Inner {
    /// Insert or refresh `name` at the MRU end of the recency list.
    fn add_recency_entry(&self, name: &ChunkId) {
        let mut cache = self.cache.lock();
        cache.recency.retain(|id| id != name);
        cache.recency.push_front(name.clone());
    }

    fn remove_deletion_marks(&self, xfer: &mut MutexGuard<'_, XferState>, name: &ChunkId) {
        xfer.removable.retain(|id| id != name);
    }

    /// Wait until no promotion of `name` is in flight. Bounded.
    fn wait_pending_for(&self, xfer: &mut MutexGuard<'_, XferState>, name: &ChunkId) -> bool {
        while xfer.pending.contains_key(name) {
            if self.xfer_done.wait_for(xfer, XFER_WAIT_TIMEOUT).timed_out()
                && xfer.pending.contains_key(name)
            {
                return false;
            }
        }
        true
    }

    /// Wait until no promotion at all is in flight. Bounded.
    fn wait_all_pending(&self, xfer: &mut MutexGuard<'_, XferState>) -> bool {
        while !xfer.pending.is_empty() {
            if self.xfer_done.wait_for(xfer, XFER_WAIT_TIMEOUT).timed_out()
                && !xfer.pending.is_empty()
            {
                return false;
            }
        }
        true
    }

    /// Store into the cache, evicting least-recently-used entries to make
    /// room. When the cache is empty but still lacks vacancy, waits for
    /// pending transfers to drain, bounded by
    /// `WAIT_TRANSFERS_FOR_CACHE_VACANT_CHECK` completion cycles.
    fn do_cache_store(&self, name: &ChunkId, content: Bytes) -> bool {
        let mut cache = self.cache.lock();
        if cache.store.has(name) {
            return true;
        }

        let size = content.len() as u64;
        let capacity = cache.store.capacity();
        if size > capacity && capacity > 0 {
            tracing::error!(chunk = %name, size, capacity, "chunk exceeds cache capacity");
            return false;
        }

        while !cache.store.vacant(size) {
            while cache.recency.is_empty() {
                drop(cache);
                {
                    let mut xfer = self.xfer.lock();
                    if xfer.pending.is_empty() {
                        tracing::error!(chunk = %name, "cannot make cache space");
                        return false;
                    }
                    let mut cycles = WAIT_TRANSFERS_FOR_CACHE_VACANT_CHECK;
                    loop {
                        if xfer.pending.is_empty() || cycles == 0 {
                            break;
                        }
                        if self.xfer_done.wait_for(&mut xfer, XFER_WAIT_TIMEOUT).timed_out()
                            && !xfer.pending.is_empty()
                        {
                            tracing::error!(chunk = %name, "timed out waiting for transfers");
                            return false;
                        }
                        cycles -= 1;
                    }
                }
                cache = self.cache.lock();
            }
            if let Some(victim) = cache.recency.pop_back() {
                cache.store.delete(&victim);
            }
        }

        cache.store.store(name, content)
    }

    /// Reserve permanent space for a freshly cached chunk and queue its
    /// promotion. Runs under the xfer lock.
    fn make_chunk_permanent(
        &self,
        name: &ChunkId,
        size: u64,
        promote_tx: &mpsc::Sender<ChunkId>,
    ) -> bool {
        let mut xfer = self.xfer.lock();
        self.remove_deletion_marks(&mut xfer, name);

        let capacity = self.permanent.capacity();
        if capacity > 0 {
            if size > capacity {
                tracing::error!(chunk = %name, size, capacity, "chunk exceeds permanent capacity");
                return false;
            }

            let mut is_new = true;
            if xfer.perm_size + size > capacity {
                if !self.wait_all_pending(&mut xfer) {
                    tracing::error!(chunk = %name, "timed out waiting for transfers");
                    return false;
                }
                if self.permanent.has(name) {
                    is_new = false;
                } else {
                    while xfer.perm_size + size > capacity {
                        let Some(victim) = xfer.removable.pop_front() else {
                            tracing::error!(chunk = %name, "cannot make permanent space");
                            return false;
                        };
                        if self.permanent.delete(&victim) {
                            xfer.perm_size = self.permanent.size();
                        }
                    }
                }
            }

            if is_new {
                // Account for the chunk while its transfer is in flight.
                xfer.perm_size += size;
            }
        }

        *xfer.pending.entry(name.clone()).or_insert(0) += 1;
        if promote_tx.send(name.clone()).is_err() {
            // Worker gone; undo the reservation.
            if let Some(count) = xfer.pending.get_mut(name) {
                *count -= 1;
                if *count == 0 {
                    xfer.pending.remove(name);
                }
            }
            return false;
        }
        true
    }

    /// Promotion worker body: copy the cached bytes to the permanent store
    /// and retire the pending-transfer entry.
    fn do_make_chunk_permanent(&self, name: &ChunkId) {
        let content = self.cache.lock().store.get(name);

        match content {
            None => {
                tracing::error!(chunk = %name, "promotion: chunk vanished from cache")
            }
            Some(content) => {
                if self.permanent.store(name, content) {
                    self.add_recency_entry(name);
                } else {
                    tracing::error!(chunk = %name, "promotion: permanent store refused chunk");
                }
            }
        }

        let mut xfer = self.xfer.lock();
        xfer.perm_size = self.permanent.size();
        if let Some(count) = xfer.pending.get_mut(name) {
            *count -= 1;
            if *count == 0 {
                xfer.pending.remove(name);
            }
        }
        self.xfer_done.notify_all();
    }
}

impl ChunkStore for BufferedChunkStore {
    /// Cache copy if present (refreshing recency), else read through from
    /// the permanent store and cache the result.
    fn get(&self, name: &ChunkId) -> Option<Bytes> {
        {
            let mut cache = self.inner.cache.lock();
            if cache.store.has(name) {
                if let Some(pos) = cache.recency.iter().position(|id| id == name) {
                    cache.recency.remove(pos);
                    cache.recency.push_front(name.clone());
                }
                return cache.store.get(name);
            }
        }

        let content = self.inner.permanent.get(name)?;
        if self.inner.do_cache_store(name, content.clone()) {
            self.inner.add_recency_entry(name);
        }
        Some(content)
    }

    fn get_to_file(&self, name: &ChunkId, sink: &Path) -> bool {
        match self.get(name) {
            Some(content) => std::fs::write(sink, content).is_ok(),
            None => false,
        }
    }

    /// Cache first, then queue background promotion. Returns once the cache
    /// holds the chunk and permanent space is reserved; on reservation
    /// failure the cache copy is dropped again.
    fn store(&self, name: &ChunkId, content: Bytes) -> bool {
        let size = content.len() as u64;
        if !self.inner.do_cache_store(name, content) {
            tracing::error!(chunk = %name, "store: failed to cache");
            return false;
        }

        let Some(promote_tx) = self.promote_tx.as_ref() else {
            return false;
        };
        if !self.inner.make_chunk_permanent(name, size, promote_tx) {
            self.inner.cache.lock().store.delete(name);
            tracing::error!(chunk = %name, "store: failed to make permanent");
            return false;
        }
        true
    }

    fn store_from_file(&self, name: &ChunkId, source: &Path, delete_source: bool) -> bool {
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
        if delete_source {
            let _ = std::fs::remove_file(source);
        }
        true
    }

    /// Drain pending transfers for `name`, then delete from the permanent
    /// store and the cache.
    fn delete(&self, name: &ChunkId) -> bool {
        let deleted;
        {
            let mut xfer = self.inner.xfer.lock();
            if !self.inner.wait_pending_for(&mut xfer, name) {
                tracing::error!(chunk = %name, "delete: timed out on pending transfers");
                return false;
            }
            deleted = self.inner.permanent.delete(name);
            xfer.perm_size = self.inner.permanent.size();
        }
        if !deleted {
            tracing::error!(chunk = %name, "delete: permanent delete failed");
        }

        let mut cache = self.inner.cache.lock();
        cache.recency.retain(|id| id != name);
        cache.store.delete(name);
        deleted
    }

    /// Modify in the permanent store if held there (draining removable
    /// entries to make room for growth), otherwise in the cache with LRU
    /// eviction for the growth delta.
    fn modify(&self, name: &ChunkId, content: Bytes) -> bool {
        let mut xfer = self.inner.xfer.lock();
        self.inner.remove_deletion_marks(&mut xfer, name);
        if !self.inner.wait_pending_for(&mut xfer, name) {
            tracing::error!(chunk = %name, "modify: timed out on pending transfers");
            return false;
        }

        if self.inner.permanent.has(name) {
            let current = self.inner.permanent.size_of(name);
            let new = content.len() as u64;
            let capacity = self.inner.permanent.capacity();
            if new > current && capacity > 0 {
                let delta = new - current;
                while xfer.perm_size + delta > capacity {
                    let Some(victim) = xfer.removable.pop_front() else {
                        tracing::error!(chunk = %name, "modify: cannot make permanent space");
                        return false;
                    };
                    if self.inner.permanent.delete(&victim) {
                        xfer.perm_size = self.inner.permanent.size();
                    }
                }
            }
            if !self.inner.permanent.modify(name, content) {
                tracing::error!(chunk = %name, "modify: permanent modify failed");
                return false;
            }
            xfer.perm_size = self.inner.permanent.size();
            drop(xfer);

            // The cached copy is stale now; drop it.
            let mut cache = self.inner.cache.lock();
            if let Some(pos) = cache.recency.iter().position(|id| id == name) {
                cache.recency.remove(pos);
                cache.store.delete(name);
            }
            return true;
        }

        // Not permanent: operate on the cache.
        let mut cache = self.inner.cache.lock();
        if !cache.store.has(name) {
            tracing::error!(chunk = %name, "modify: chunk not held");
            return false;
        }
        let current = cache.store.size_of(name);
        let new = content.len() as u64;
        if new > current {
            let delta = new - current;
            while !cache.store.vacant(delta) {
                if cache.recency.is_empty() {
                    if xfer.pending.is_empty() {
                        tracing::error!(chunk = %name, "modify: cannot make cache space");
                        return false;
                    }
                    drop(cache);
                    let mut cycles = WAIT_TRANSFERS_FOR_CACHE_VACANT_CHECK;
                    loop {
                        if xfer.pending.is_empty() || cycles == 0 {
                            break;
                        }
                        if self
                            .inner
                            .xfer_done
                            .wait_for(&mut xfer, XFER_WAIT_TIMEOUT)
                            .timed_out()
                            && !xfer.pending.is_empty()
                        {
                            tracing::error!(chunk = %name, "modify: timed out waiting for transfers");
                            return false;
                        }
                        cycles -= 1;
                    }
                    cache = self.inner.cache.lock();
                    continue;
                }
                if let Some(victim) = cache.recency.pop_back() {
                    cache.store.delete(&victim);
                }
            }
        }
        cache.store.modify(name, content)
    }

    fn has(&self, name: &ChunkId) -> bool {
        self.cache_has(name) || self.permanent_has(name)
    }

    /// Drain pending transfers for `name`, transfer one permanent
    /// reference to `sink`, and drop any cache copy.
    fn move_to(&self, name: &ChunkId, sink: &dyn ChunkStore) -> bool {
        let moved;
        {
            let mut xfer = self.inner.xfer.lock();
            if !self.inner.wait_pending_for(&mut xfer, name) {
                tracing::error!(chunk = %name, "move_to: timed out on pending transfers");
                return false;
            }
            moved = self.inner.permanent.move_to(name, sink);
            xfer.perm_size = self.inner.permanent.size();
        }
        if !moved {
            tracing::error!(chunk = %name, "move_to: permanent move failed");
            return false;
        }

        let mut cache = self.inner.cache.lock();
        cache.recency.retain(|id| id != name);
        cache.store.delete(name);
        true
    }

    fn size_of(&self, name: &ChunkId) -> u64 {
        let cache = self.inner.cache.lock();
        if cache.store.has(name) {
            return cache.store.size_of(name);
        }
        self.inner.permanent.size_of(name)
    }

    fn size(&self) -> u64 {
        self.inner.xfer.lock().perm_size
    }

    fn capacity(&self) -> u64 {
        self.inner.permanent.capacity()
    }

    fn set_capacity(&self, capacity: u64) {
        let mut xfer = self.inner.xfer.lock();
        if !self.inner.wait_all_pending(&mut xfer) {
            tracing::error!("set_capacity: timed out waiting for pending transfers");
            return;
        }
        self.inner.permanent.set_capacity(capacity);
    }

    fn vacant(&self, required: u64) -> bool {
        let capacity = self.inner.permanent.capacity();
        capacity == 0 || self.inner.xfer.lock().perm_size + required <= capacity
    }

    fn count_of(&self, name: &ChunkId) -> u64 {
        let mut xfer = self.inner.xfer.lock();
        if !self.inner.wait_pending_for(&mut xfer, name) {
            tracing::error!(chunk = %name, "count: timed out on pending transfers");
            return 0;
        }
        self.inner.permanent.count_of(name)
    }

    fn count(&self) -> u64 {
        let mut xfer = self.inner.xfer.lock();
        if !self.inner.wait_all_pending(&mut xfer) {
            tracing::error!("count: timed out waiting for pending transfers");
            return 0;
        }
        self.inner.permanent.count()
    }

    fn is_empty(&self) -> bool {
        self.cache_empty() && self.inner.permanent.is_empty()
    }

    fn clear(&self) {
        let mut xfer = self.inner.xfer.lock();
        if !self.inner.wait_all_pending(&mut xfer) {
            tracing::error!("clear: timed out waiting for pending transfers");
            return;
        }
        let mut cache = self.inner.cache.lock();
        cache.recency.clear();
        xfer.removable.clear();
        cache.store.clear();
        self.inner.permanent.clear();
        xfer.perm_size = 0;
    }

    fn list_chunks(&self) -> Vec<ChunkData> {
        let _xfer = self.inner.xfer.lock();
        self.inner.permanent.list_chunks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_store() -> (BufferedChunkStore, PathBuf) {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "cairn-buffered-{}-{}",
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_dir_all(&dir);
        let store = BufferedChunkStore::open(&dir, Vec::new(), 4).unwrap();
        (store, dir)
    }

    fn name_for(content: &[u8]) -> ChunkId {
        ChunkId::new(cairn_core::crypto::content_hash(content).to_vec())
    }

    /// Promotion is asynchronous; settle it before asserting on disk state.
    fn drain(store: &BufferedChunkStore) {
        let mut xfer = store.inner.xfer.lock();
        assert!(store.inner.wait_all_pending(&mut xfer));
    }

    #[test]
    fn store_reaches_cache_and_disk() {
        let (store, dir) = temp_store();
        let name = name_for(b"hello world");
        assert!(store.store(&name, Bytes::from_static(b"hello world")));
        assert!(store.cache_has(&name));
        drain(&store);
        assert!(store.permanent_has(&name));
        assert_eq!(store.get(&name).unwrap(), Bytes::from_static(b"hello world"));
        assert_eq!(store.size(), 11);
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn get_reads_through_and_caches() {
        let (store, dir) = temp_store();
        let name = name_for(b"read through");
        store.store(&name, Bytes::from_static(b"read through"));
        drain(&store);
        store.cache_clear();
        assert!(!store.cache_has(&name));

        assert_eq!(store.get(&name).unwrap(), Bytes::from_static(b"read through"));
        assert!(store.cache_has(&name));
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn oversized_chunk_fails_cache() {
        let (store, dir) = temp_store();
        store.set_cache_capacity(8);
        let name = name_for(b"too big for cache");
        assert!(!store.store(&name, Bytes::from_static(b"too big for cache")));
        assert!(!store.cache_has(&name));
        drain(&store);
        assert!(!store.permanent_has(&name));
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn lru_eviction_makes_room() {
        let (store, dir) = temp_store();
        store.set_cache_capacity(10);
        let first = name_for(b"aaaa");
        let second = name_for(b"bbbb");
        let third = name_for(b"cccc");
        assert!(store.store(&first, Bytes::from_static(b"aaaa")));
        drain(&store);
        assert!(store.store(&second, Bytes::from_static(b"bbbb")));
        drain(&store);
        assert!(store.store(&third, Bytes::from_static(b"cccc")));
        drain(&store);

        // first was least recently used and must have been evicted
        assert!(!store.cache_has(&first));
        assert!(store.cache_has(&second) && store.cache_has(&third));
        // but it is still on disk
        assert!(store.permanent_has(&first));
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn delete_removes_both_tiers() {
        let (store, dir) = temp_store();
        let name = name_for(b"short lived");
        store.store(&name, Bytes::from_static(b"short lived"));
        drain(&store);
        assert!(store.delete(&name));
        assert!(!store.cache_has(&name));
        assert!(!store.permanent_has(&name));
        assert!(store.get(&name).is_none());
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn modify_permanent_chunk() {
        let (store, dir) = temp_store();
        let name = name_for(b"v1");
        store.store(&name, Bytes::from_static(b"v1"));
        drain(&store);
        assert!(store.modify(&name, Bytes::from_static(b"version two")));
        assert_eq!(store.get(&name).unwrap(), Bytes::from_static(b"version two"));
        assert_eq!(store.size(), 11);
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn marked_chunks_are_consumed_for_space() {
        let (store, dir) = temp_store();
        store.set_capacity(16);
        let old = name_for(b"oldoldold");
        store.store(&old, Bytes::from_static(b"oldoldold"));
        drain(&store);
        store.mark_for_deletion(&old);

        let fresh = name_for(b"freshfresh");
        assert!(store.store(&fresh, Bytes::from_static(b"freshfresh")));
        drain(&store);
        assert!(store.permanent_has(&fresh));
        assert!(!store.permanent_has(&old));
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn delete_all_marked_sweeps() {
        let (store, dir) = temp_store();
        let doomed = name_for(b"doomed");
        let kept = name_for(b"kept");
        store.store(&doomed, Bytes::from_static(b"doomed"));
        store.store(&kept, Bytes::from_static(b"kept"));
        drain(&store);

        store.mark_for_deletion(&doomed);
        assert_eq!(store.removable_chunks().len(), 1);
        assert!(store.delete_all_marked());
        assert!(store.removable_chunks().is_empty());
        assert!(!store.permanent_has(&doomed));
        assert!(store.permanent_has(&kept));
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn permanent_has_discounts_deletion_marks() {
        let (store, dir) = temp_store();
        let name = name_for(b"marked");
        store.store(&name, Bytes::from_static(b"marked"));
        drain(&store);
        assert!(store.permanent_has(&name));
        store.mark_for_deletion(&name);
        assert!(!store.permanent_has(&name));
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn move_to_hands_over_one_reference() {
        let (store, dir) = temp_store();
        let sink = ThreadsafeChunkStore::new(MemoryChunkStore::new());
        let name = name_for(b"migrant");
        store.store(&name, Bytes::from_static(b"migrant"));
        drain(&store);

        assert!(store.move_to(&name, &sink));
        assert!(sink.has(&name));
        assert!(!store.permanent_has(&name));
        assert!(!store.cache_has(&name));

        assert!(!store.move_to(&name_for(b"absent"), &sink));
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn clear_resets_everything() {
        let (store, dir) = temp_store();
        store.store(&name_for(b"one"), Bytes::from_static(b"one"));
        store.store(&name_for(b"two"), Bytes::from_static(b"two"));
        drain(&store);
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.size(), 0);
        assert_eq!(store.count(), 0);
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
