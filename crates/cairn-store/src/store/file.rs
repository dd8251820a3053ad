//! File-backed byte store.
//!
//! Layout under the root directory:
//!   - `info` — two little-endian u64s: chunk count, total byte size. Kept
//!     in sync on every mutation so `count()` and `size()` are O(1).
//!   - a tree of `dir_depth` levels, each named by one character of the
//!     base-32 chunk name; the leaf file carries the remaining characters
//!     plus an extension `.N` holding the reference count.
//!
//! Reference-count updates are renames, which are atomic on a local
//! filesystem. Content writes go to a temp file first, then rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use cairn_core::ChunkId;
use memmap2::Mmap;

use super::{Accounting, ChunkData, ChunkStore, RawChunkStore};

const INFO_FILE: &str = "info";

/// Shortest base-32 rendering of a valid name (64 bytes → 103 chars); the
/// directory depth must leave at least one character for the leaf name.
const MIN_ENCODED_NAME_LEN: u32 = 103;

/// Disk store. Not synchronised — wrap in [`ThreadsafeChunkStore`].
///
/// [`ThreadsafeChunkStore`]: super::ThreadsafeChunkStore
pub struct FileChunkStore {
    root: PathBuf,
    dir_depth: u32,
    chunk_count: u64,
    accounting: Accounting,
    initialised: bool,
}

impl FileChunkStore {
    /// Open or create a store rooted at `root` with the given tree depth.
    pub fn open(root: impl Into<PathBuf>, dir_depth: u32) -> Option<Self> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            tracing::error!("file store: empty storage location");
            return None;
        }
        if dir_depth == 0 || dir_depth >= MIN_ENCODED_NAME_LEN {
            tracing::error!(dir_depth, "file store: directory depth eats the whole name");
            return None;
        }
        if let Err(e) = fs::create_dir_all(&root) {
            tracing::error!(root = %root.display(), error = %e, "file store: create root failed");
            return None;
        }

        let mut store = FileChunkStore {
            root,
            dir_depth,
            chunk_count: 0,
            accounting: Accounting::default(),
            initialised: false,
        };

        let info_path = store.root.join(INFO_FILE);
        if info_path.exists() {
            let (count, size) = store.load_info()?;
            store.chunk_count = count;
            store.accounting.add(size);
        } else if !store.save_info() {
            return None;
        }
        store.initialised = true;
        Some(store)
    }

    fn load_info(&self) -> Option<(u64, u64)> {
        let bytes = match fs::read(self.root.join(INFO_FILE)) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "file store: info file unreadable");
                return None;
            }
        };
        if bytes.len() != 16 {
            tracing::error!(len = bytes.len(), "file store: info file corrupt");
            return None;
        }
        let count = u64::from_le_bytes(bytes[..8].try_into().ok()?);
        let size = u64::from_le_bytes(bytes[8..].try_into().ok()?);
        Some((count, size))
    }

    fn save_info(&self) -> bool {
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&self.chunk_count.to_le_bytes());
        bytes.extend_from_slice(&self.accounting.size().to_le_bytes());
        match fs::write(self.root.join(INFO_FILE), bytes) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "file store: info file unwritable");
                false
            }
        }
    }

    /// Leaf path for a chunk, without the reference-count extension.
    fn chunk_path(&self, name: &ChunkId, create_dirs: bool) -> Option<PathBuf> {
        if !self.initialised || name.is_empty() {
            return None;
        }
        let encoded = name.to_base32();
        if encoded.len() <= self.dir_depth as usize {
            return None;
        }
        let mut path = self.root.clone();
        for segment in encoded
            .chars()
            .take(self.dir_depth as usize)
            .map(|c| c.to_string())
        {
            path.push(segment);
        }
        if create_dirs {
            if let Err(e) = fs::create_dir_all(&path) {
                tracing::error!(error = %e, "file store: create chunk dirs failed");
                return None;
            }
        }
        path.push(&encoded[self.dir_depth as usize..]);
        Some(path)
    }

    /// The on-disk file for a chunk (leaf path plus `.N`), if any reference
    /// exists. Returns `(path, reference_count)`.
    fn existing_file(&self, name: &ChunkId) -> Option<(PathBuf, u64)> {
        let leaf = self.chunk_path(name, false)?;
        let dir = leaf.parent()?;
        let stem = leaf.file_name()?.to_str()?.to_string();
        let entries = fs::read_dir(dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            let file_name = path.file_name()?.to_str()?.to_string();
            if let Some(ext) = file_name.strip_prefix(&format!("{stem}.")) {
                if let Ok(count) = ext.parse::<u64>() {
                    return Some((path, count));
                }
            }
        }
        None
    }

    fn write_atomically(path: &Path, content: &[u8]) -> bool {
        let tmp_path = path.with_extension("tmp");
        let write = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(content)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = write {
            tracing::error!(path = %path.display(), error = %e, "file store: write failed");
            let _ = fs::remove_file(&tmp_path);
            return false;
        }
        if let Err(e) = fs::rename(&tmp_path, path) {
            tracing::error!(path = %path.display(), error = %e, "file store: rename failed");
            let _ = fs::remove_file(&tmp_path);
            return false;
        }
        true
    }

    fn read_file(path: &Path) -> Option<Bytes> {
        let file = fs::File::open(path).ok()?;
        if file.metadata().ok()?.len() == 0 {
            return Some(Bytes::new());
        }
        // Safety: opened read-only and never mutated through the map.
        let mmap = unsafe { Mmap::map(&file).ok()? };
        Some(Bytes::copy_from_slice(&mmap))
    }

    fn collect_chunks(&self, dir: &Path, prefix: String, out: &mut Vec<ChunkData>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if path.is_dir() {
                self.collect_chunks(&path, format!("{prefix}{file_name}"), out);
            } else if !prefix.is_empty() {
                let Some(stem) = file_name.split('.').next() else {
                    continue;
                };
                let encoded = format!("{prefix}{stem}");
                let Ok(raw) = data_encoding::BASE32_NOPAD.decode(encoded.to_uppercase().as_bytes())
                else {
                    continue;
                };
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                out.push(ChunkData {
                    name: ChunkId::new(raw),
                    size,
                });
            }
        }
    }
}

impl RawChunkStore for FileChunkStore {
    fn get(&self, name: &ChunkId) -> Option<Bytes> {
        let (path, _) = self.existing_file(name)?;
        Self::read_file(&path)
    }

    fn get_to_file(&self, name: &ChunkId, sink: &Path) -> bool {
        match self.get(name) {
            Some(content) => fs::write(sink, content).is_ok(),
            None => false,
        }
    }

    fn store(&mut self, name: &ChunkId, content: Bytes) -> bool {
        if let Some((path, count)) = self.existing_file(name) {
            // Another reference, no rewrite. Rename is atomic.
            let bumped = path.with_extension((count + 1).to_string());
            if let Err(e) = fs::rename(&path, &bumped) {
                tracing::error!(chunk = %name, error = %e, "store: refcount rename failed");
                return false;
            }
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
        let Some(leaf) = self.chunk_path(name, true) else {
            return false;
        };
        if !Self::write_atomically(&leaf.with_extension("1"), &content) {
            return false;
        }
        self.chunk_count += 1;
        self.accounting.add(chunk_size);
        self.save_info()
    }

    fn store_from_file(&mut self, name: &ChunkId, source: &Path, delete_source: bool) -> bool {
        if self.existing_file(name).is_some() {
            if !source.as_os_str().is_empty() && !source.exists() {
                tracing::error!(chunk = %name, "store: non-existent source file");
                return false;
            }
            if !self.store(name, Bytes::new()) {
                // Bytes::new() unused on the refcount path; store() above
                // only renames when the chunk already exists.
                return false;
            }
        } else {
            let content = match fs::read(source) {
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
            let _ = fs::remove_file(source);
        }
        true
    }

    fn delete(&mut self, name: &ChunkId) -> bool {
        let Some((path, count)) = self.existing_file(name) else {
            return true;
        };
        if count > 1 {
            let dropped = path.with_extension((count - 1).to_string());
            return fs::rename(&path, &dropped).is_ok();
        }
        let released = path.metadata().map(|m| m.len()).unwrap_or(0);
        if let Err(e) = fs::remove_file(&path) {
            tracing::error!(chunk = %name, error = %e, "delete: remove failed");
            return false;
        }
        self.chunk_count = self.chunk_count.saturating_sub(1);
        self.accounting.remove(released);
        self.save_info()
    }

    fn modify(&mut self, name: &ChunkId, content: Bytes) -> bool {
        let Some((path, _)) = self.existing_file(name) else {
            return false;
        };
        let current = path.metadata().map(|m| m.len()).unwrap_or(0);
        let Some((grows, delta)) = self.accounting.assess_replacement(current, content.len() as u64)
        else {
            tracing::error!(chunk = %name, "modify: growth exceeds vacancy");
            return false;
        };
        if !Self::write_atomically(&path, &content) {
            return false;
        }
        self.accounting.apply_replacement(grows, delta);
        self.save_info()
    }

    fn has(&self, name: &ChunkId) -> bool {
        self.existing_file(name).is_some()
    }

    fn move_to(&mut self, name: &ChunkId, sink: &dyn ChunkStore) -> bool {
        let Some(content) = self.get(name) else {
            tracing::warn!(chunk = %name, "move_to: not held");
            return false;
        };
        if !sink.store(name, content) {
            tracing::error!(chunk = %name, "move_to: sink refused chunk");
            return false;
        }
        self.delete(name)
    }

    fn size_of(&self, name: &ChunkId) -> u64 {
        self.existing_file(name)
            .and_then(|(path, _)| path.metadata().ok())
            .map(|m| m.len())
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
        self.existing_file(name).map(|(_, count)| count).unwrap_or(0)
    }

    fn count(&self) -> u64 {
        self.chunk_count
    }

    fn is_empty(&self) -> bool {
        self.chunk_count == 0
    }

    fn clear(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            tracing::error!(error = %e, "clear: remove root failed");
        }
        let _ = fs::create_dir_all(&self.root);
        self.chunk_count = 0;
        self.accounting.reset();
        self.save_info();
    }

    fn list_chunks(&self) -> Vec<ChunkData> {
        let mut out = Vec::new();
        let root = self.root.clone();
        self.collect_chunks(&root, String::new(), &mut out);
        out
    }
}
