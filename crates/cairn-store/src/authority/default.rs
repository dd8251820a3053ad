//! Rules for `Default` chunks: immutable, content-addressed, cacheable.

use bytes::Bytes;
use cairn_core::{crypto, ChunkId};

use super::{ChunkActionError, ModifyOutcome};
use crate::store::ChunkStore;

pub(super) fn process_get(
    name: &ChunkId,
    _version: Option<&[u8]>,
    _public_key: &[u8],
    store: &dyn ChunkStore,
) -> Result<Bytes, ChunkActionError> {
    store
        .get(name)
        .ok_or(ChunkActionError::FailedToFindChunk)
}

pub(super) fn process_store(
    name: &ChunkId,
    content: &Bytes,
    _public_key: &[u8],
    store: &dyn ChunkStore,
) -> Result<(), ChunkActionError> {
    match store.get(name) {
        None => {
            // New chunk: content must hash to the name.
            if crypto::content_hash(content).as_slice() != name.without_type() {
                return Err(ChunkActionError::NotHashable);
            }
            Ok(())
        }
        Some(existing) => {
            // Pre-existing chunk: only an identical re-store is allowed.
            if existing != *content {
                return Err(ChunkActionError::InvalidSignedData);
            }
            Ok(())
        }
    }
}

// Deletion of hashable chunks is authorised upstream; nothing to check here.
pub(super) fn process_delete(
    _name: &ChunkId,
    _ownership_proof: &[u8],
    _public_key: &[u8],
    _store: &dyn ChunkStore,
) -> Result<(), ChunkActionError> {
    Ok(())
}

pub(super) fn process_modify(
    name: &ChunkId,
    _content: &[u8],
    _public_key: &[u8],
    _store: &dyn ChunkStore,
) -> Result<ModifyOutcome, ChunkActionError> {
    tracing::error!(chunk = %name, "default chunks cannot be modified");
    Err(ChunkActionError::InvalidModify)
}

pub(super) fn process_has(
    name: &ChunkId,
    _version: Option<&[u8]>,
    _public_key: &[u8],
    store: &dyn ChunkStore,
) -> Result<(), ChunkActionError> {
    if store.has(name) {
        Ok(())
    } else {
        Err(ChunkActionError::FailedToFindChunk)
    }
}

/// The leading bytes of the name double as the version; the content never
/// changes, so nothing needs hashing.
pub(super) fn version(name: &ChunkId, _store: &dyn ChunkStore) -> Option<Vec<u8>> {
    Some(name.without_type()[..crypto::VERSION_SIZE].to_vec())
}

pub(super) fn is_valid_chunk(name: &ChunkId, store: &dyn ChunkStore) -> bool {
    match store.get(name) {
        Some(content) => crypto::content_hash(&content).as_slice() == name.without_type(),
        None => false,
    }
}
