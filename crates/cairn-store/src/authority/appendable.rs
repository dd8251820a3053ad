//! Rules for `AppendableByAll` chunks.
//!
//! The record holds an owner-signed permission field, an owner-signed
//! identity key, and a list of appendices contributed by other parties.
//! The signer of `allow_others_to_append` is the owner; the first byte of
//! that field's data is a `ChunkType` tag, and appending is open while it
//! equals the `AppendableByAll` tag.

use bytes::Bytes;
use cairn_core::{crypto, AppendableByAll, ChunkId, ChunkType, ModifyAppendableByAll, SignedData};

use super::{check_signed, ChunkActionError, ModifyOutcome};
use crate::store::ChunkStore;

fn is_owner(record: &AppendableByAll, public_key: &[u8]) -> Result<bool, ChunkActionError> {
    record
        .allow_others_to_append
        .verify(public_key)
        .map_err(|_| ChunkActionError::SignatureCheckError)
}

/// Owner reads get the whole record and atomically consume the appendix
/// list; everyone else only sees the identity key.
pub(super) fn process_get(
    name: &ChunkId,
    _version: Option<&[u8]>,
    public_key: &[u8],
    store: &dyn ChunkStore,
) -> Result<Bytes, ChunkActionError> {
    let full_content = store
        .get(name)
        .ok_or(ChunkActionError::FailedToFindChunk)?;

    let mut record =
        AppendableByAll::decode(&full_content).map_err(|_| ChunkActionError::ParseFailure)?;

    if is_owner(&record, public_key)? {
        if !record.appendices.is_empty() {
            record.appendices.clear();
            let cleared = record
                .encode()
                .map_err(|_| ChunkActionError::SerialisationError)?;
            // The read stays a success even if the clearing write is
            // refused; the appendices will be consumed again next time.
            if !store.modify(name, Bytes::from(cleared)) {
                tracing::error!(chunk = %name, "failed to clear appendices on owner read");
            }
        }
        Ok(full_content)
    } else {
        let identity = record
            .identity_key
            .encode()
            .map_err(|_| ChunkActionError::SerialisationError)?;
        Ok(Bytes::from(identity))
    }
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
    let record =
        AppendableByAll::decode(content).map_err(|_| ChunkActionError::InvalidSignedData)?;
    // Only the permission field is verified at store time.
    check_signed(&record.allow_others_to_append, public_key)
}

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

    let record =
        AppendableByAll::decode(&existing_content).map_err(|_| ChunkActionError::ParseFailure)?;
    check_signed(&record.allow_others_to_append, public_key)?;

    let proof = SignedData::decode(ownership_proof).map_err(|_| ChunkActionError::NotOwner)?;
    match proof.verify(public_key) {
        Ok(true) => Ok(()),
        Ok(false) => Err(ChunkActionError::NotOwner),
        Err(_) => Err(ChunkActionError::SignatureCheckError),
    }
}

/// Owners swap exactly one control field (appendices preserved); anyone
/// else appends a verified `SignedData`, if the owner currently allows it.
pub(super) fn process_modify(
    name: &ChunkId,
    content: &[u8],
    public_key: &[u8],
    store: &dyn ChunkStore,
) -> Result<ModifyOutcome, ChunkActionError> {
    let existing_content = store
        .get(name)
        .ok_or(ChunkActionError::FailedToFindChunk)?;

    let mut record =
        AppendableByAll::decode(&existing_content).map_err(|_| ChunkActionError::ParseFailure)?;

    if is_owner(&record, public_key)? {
        let change = ModifyAppendableByAll::decode(content)
            .map_err(|_| ChunkActionError::InvalidSignedData)?;

        match (change.allow_others_to_append, change.identity_key) {
            (Some(allow), None) => {
                check_signed(&allow, public_key)?;
                record.allow_others_to_append = allow;
            }
            (None, Some(identity)) => {
                check_signed(&identity, public_key)?;
                record.identity_key = identity;
            }
            // One and only one control field may be replaced per modify.
            _ => return Err(ChunkActionError::InvalidModify),
        }
    } else {
        let appendability = record
            .allow_others_to_append
            .data
            .first()
            .copied()
            .unwrap_or_default();
        if appendability != ChunkType::AppendableByAll as u8 {
            return Err(ChunkActionError::AppendDisallowed);
        }

        let appendix =
            SignedData::decode(content).map_err(|_| ChunkActionError::InvalidSignedData)?;
        check_signed(&appendix, public_key)?;
        record.appendices.push(appendix);
    }

    let new_content = record
        .encode()
        .map_err(|_| ChunkActionError::SerialisationError)?;
    Ok(ModifyOutcome {
        size_difference: existing_content.len() as i64 - new_content.len() as i64,
        new_content: Bytes::from(new_content),
    })
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

pub(super) fn version(name: &ChunkId, store: &dyn ChunkStore) -> Option<Vec<u8>> {
    store
        .get(name)
        .map(|content| crypto::version_hash(&content).to_vec())
}

pub(super) fn is_valid_chunk(name: &ChunkId, store: &dyn ChunkStore) -> bool {
    store
        .get(name)
        .and_then(|content| AppendableByAll::decode(&content).ok())
        .is_some()
}
