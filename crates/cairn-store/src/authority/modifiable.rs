//! Rules for `ModifiableByOwner` chunks: signed data the owner may replace
//! wholesale. Modify is replace-semantics; gets may be version-gated.

use bytes::Bytes;
use cairn_core::{crypto, ChunkId, SignedData};

use super::{check_signed, ChunkActionError, ModifyOutcome};
use crate::store::ChunkStore;

pub(super) fn process_get(
    name: &ChunkId,
    version: Option<&[u8]>,
    _public_key: &[u8],
    store: &dyn ChunkStore,
) -> Result<Bytes, ChunkActionError> {
    let content = store
        .get(name)
        .ok_or(ChunkActionError::FailedToFindChunk)?;

    if let Some(version) = version.filter(|v| !v.is_empty()) {
        if crypto::version_hash(&content).as_slice() != version {
            return Err(ChunkActionError::DifferentVersion);
        }
    }
    Ok(content)
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
    check_signed(&chunk, public_key)
}

/// Same ownership-proof contract as signature packets.
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

/// Owner check on the existing record, signature check on the replacement;
/// the replacement becomes the new content in full.
pub(super) fn process_modify(
    name: &ChunkId,
    content: &[u8],
    public_key: &[u8],
    store: &dyn ChunkStore,
) -> Result<ModifyOutcome, ChunkActionError> {
    let existing_content = store
        .get(name)
        .ok_or(ChunkActionError::FailedToFindChunk)?;

    let existing = SignedData::decode(&existing_content)
        .map_err(|_| ChunkActionError::ParseFailure)?;
    check_signed(&existing, public_key)?;

    let replacement =
        SignedData::decode(content).map_err(|_| ChunkActionError::InvalidSignedData)?;
    check_signed(&replacement, public_key)?;

    Ok(ModifyOutcome {
        size_difference: existing_content.len() as i64 - content.len() as i64,
        new_content: Bytes::copy_from_slice(content),
    })
}

pub(super) fn process_has(
    name: &ChunkId,
    version: Option<&[u8]>,
    _public_key: &[u8],
    store: &dyn ChunkStore,
) -> Result<(), ChunkActionError> {
    let Some(content) = store.get(name) else {
        return Err(ChunkActionError::FailedToFindChunk);
    };
    if let Some(version) = version.filter(|v| !v.is_empty()) {
        if crypto::version_hash(&content).as_slice() != version {
            return Err(ChunkActionError::DifferentVersion);
        }
    }
    Ok(())
}

/// Content hash of the stored record; changes on every modify.
pub(super) fn version(name: &ChunkId, store: &dyn ChunkStore) -> Option<Vec<u8>> {
    store
        .get(name)
        .map(|content| crypto::version_hash(&content).to_vec())
}

pub(super) fn is_valid_chunk(name: &ChunkId, store: &dyn ChunkStore) -> bool {
    store
        .get(name)
        .and_then(|content| SignedData::decode(&content).ok())
        .is_some()
}
