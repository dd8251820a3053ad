//! Rules for `SignaturePacket` chunks: immutable signed key material whose
//! name is the hash of `data || signature`.

use bytes::Bytes;
use cairn_core::{crypto, ChunkId, SignedData};

use super::{check_signed, ChunkActionError, ModifyOutcome};
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
    public_key: &[u8],
    store: &dyn ChunkStore,
) -> Result<(), ChunkActionError> {
    if store.has(name) {
        return Err(ChunkActionError::KeyNotUnique);
    }

    let chunk =
        SignedData::decode(content).map_err(|_| ChunkActionError::InvalidSignedData)?;
    check_signed(&chunk, public_key)?;

    let mut hashed = chunk.data.clone();
    hashed.extend_from_slice(&chunk.signature);
    if crypto::content_hash(&hashed).as_slice() != name.without_type() {
        return Err(ChunkActionError::NotHashable);
    }
    Ok(())
}

/// Deleting a signature packet needs the owner: the existing record must
/// verify against `public_key`, and the caller must present a fresh
/// ownership proof signed with the same key.
pub(super) fn process_delete(
    name: &ChunkId,
    ownership_proof: &[u8],
    public_key: &[u8],
    store: &dyn ChunkStore,
) -> Result<(), ChunkActionError> {
    let Some(existing_content) = store.get(name) else {
        tracing::debug!(chunk = %name, "already deleted");
        return Ok(());
    };

    let existing = SignedData::decode(&existing_content)
        .map_err(|_| ChunkActionError::ParseFailure)?;
    check_signed(&existing, public_key)?;

    let proof = SignedData::decode(ownership_proof).map_err(|_| ChunkActionError::NotOwner)?;
    match proof.verify(public_key) {
        Ok(true) => Ok(()),
        Ok(false) => Err(ChunkActionError::NotOwner),
        Err(_) => Err(ChunkActionError::SignatureCheckError),
    }
}

pub(super) fn process_modify(
    name: &ChunkId,
    _content: &[u8],
    _public_key: &[u8],
    _store: &dyn ChunkStore,
) -> Result<ModifyOutcome, ChunkActionError> {
    tracing::error!(chunk = %name, "signature packets cannot be modified");
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

pub(super) fn version(name: &ChunkId, _store: &dyn ChunkStore) -> Option<Vec<u8>> {
    Some(name.without_type()[..crypto::VERSION_SIZE].to_vec())
}

pub(super) fn is_valid_chunk(name: &ChunkId, store: &dyn ChunkStore) -> bool {
    let Some(content) = store.get(name) else {
        return false;
    };
    let Ok(chunk) = SignedData::decode(&content) else {
        return false;
    };
    let mut hashed = chunk.data.clone();
    hashed.extend_from_slice(&chunk.signature);
    crypto::content_hash(&hashed).as_slice() == name.without_type()
}
