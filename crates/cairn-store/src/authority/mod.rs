//! Chunk action authority — per-type rules for every storage verb.
//!
//! Each chunk type gets its own rule module of pure functions over
//! `(name, bytes, key, store)`; this module owns the property table and the
//! polymorphic entrypoints that read the name's trailing byte and dispatch.
//! There is no runtime inheritance anywhere in the rules.

mod appendable;
mod default;
mod modifiable;
mod signature;

use std::sync::Arc;

use bytes::Bytes;
use cairn_core::{ChunkId, ChunkType};
use thiserror::Error;

use crate::store::ChunkStore;

/// Typed verdicts of the rule functions. The scheduler and managers
/// translate these into booleans or callback results at their boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChunkActionError {
    #[error("failed to find chunk")]
    FailedToFindChunk,
    #[error("stored data does not parse")]
    ParseFailure,
    #[error("content is not valid signed data")]
    InvalidSignedData,
    #[error("signature check failed")]
    FailedSignatureCheck,
    #[error("signature could not be checked")]
    SignatureCheckError,
    #[error("requester is not the owner")]
    NotOwner,
    #[error("content does not hash to the chunk name")]
    NotHashable,
    #[error("chunk name already exists")]
    KeyNotUnique,
    #[error("chunk type does not support modify")]
    InvalidModify,
    #[error("invalid chunk type")]
    InvalidChunkType,
    #[error("stored version differs from the requested one")]
    DifferentVersion,
    #[error("record does not serialise")]
    SerialisationError,
    #[error("owner has disallowed appending")]
    AppendDisallowed,
    #[error("byte store refused the store")]
    StoreFailure,
    #[error("byte store refused the modify")]
    ModifyFailure,
    #[error("byte store refused the delete")]
    DeleteFailure,
}

/// Result of a validated modify: the bytes to write and the signed size
/// delta (positive when the chunk shrank).
pub struct ModifyOutcome {
    pub new_content: Bytes,
    pub size_difference: i64,
}

/// Property table, fixed per chunk type.
///
/// | Type              | cacheable | modifiable | modify_replaces | payable |
/// |-------------------|-----------|------------|-----------------|---------|
/// | Default           | yes       | no         | no              | yes     |
/// | SignaturePacket   | no        | no         | no              | no      |
/// | ModifiableByOwner | no        | yes        | yes             | no      |
/// | AppendableByAll   | no        | yes        | no              | no      |
pub fn is_cacheable(name: &ChunkId) -> bool {
    name.chunk_type() == ChunkType::Default
}

pub fn is_modifiable(name: &ChunkId) -> bool {
    matches!(
        name.chunk_type(),
        ChunkType::ModifiableByOwner | ChunkType::AppendableByAll
    )
}

pub fn modify_replaces(name: &ChunkId) -> bool {
    name.chunk_type() == ChunkType::ModifiableByOwner
}

pub fn is_payable(name: &ChunkId) -> bool {
    name.chunk_type() == ChunkType::Default
}

pub fn is_valid_name(name: &ChunkId) -> bool {
    name.is_valid()
}

/// The authority itself: the rule dispatch plus the byte store the rules
/// read from and the verbs write through to.
pub struct ChunkActionAuthority {
    store: Arc<dyn ChunkStore>,
}

impl ChunkActionAuthority {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self { store }
    }

    /// Validated read. For `AppendableByAll` the result depends on whether
    /// `public_key` belongs to the owner, and an owner read consumes the
    /// stored appendix list.
    pub fn get(
        &self,
        name: &ChunkId,
        version: Option<&[u8]>,
        public_key: &[u8],
    ) -> Result<Bytes, ChunkActionError> {
        let result = match name.chunk_type() {
            ChunkType::Default => default::process_get(name, version, public_key, &*self.store),
            ChunkType::SignaturePacket => {
                signature::process_get(name, version, public_key, &*self.store)
            }
            ChunkType::ModifiableByOwner => {
                modifiable::process_get(name, version, public_key, &*self.store)
            }
            ChunkType::AppendableByAll => {
                appendable::process_get(name, version, public_key, &*self.store)
            }
            ChunkType::Unknown => Err(ChunkActionError::InvalidChunkType),
        };
        if let Err(error) = &result {
            tracing::warn!(chunk = %name, %error, "get refused");
        }
        result
    }

    /// Validated store: per-type checks, then the write through to the
    /// byte store.
    pub fn store(
        &self,
        name: &ChunkId,
        content: Bytes,
        public_key: &[u8],
    ) -> Result<(), ChunkActionError> {
        let validated = match name.chunk_type() {
            ChunkType::Default => default::process_store(name, &content, public_key, &*self.store),
            ChunkType::SignaturePacket => {
                signature::process_store(name, &content, public_key, &*self.store)
            }
            ChunkType::ModifiableByOwner => {
                modifiable::process_store(name, &content, public_key, &*self.store)
            }
            ChunkType::AppendableByAll => {
                appendable::process_store(name, &content, public_key, &*self.store)
            }
            ChunkType::Unknown => Err(ChunkActionError::InvalidChunkType),
        };
        if let Err(error) = validated {
            tracing::error!(chunk = %name, %error, "store refused");
            return Err(error);
        }
        if !self.store.store(name, content) {
            tracing::error!(chunk = %name, "store failed in byte store");
            return Err(ChunkActionError::StoreFailure);
        }
        Ok(())
    }

    /// Validated delete. Non-cacheable types demand an ownership proof
    /// signed by `public_key`. Deleting an absent chunk succeeds.
    pub fn delete(
        &self,
        name: &ChunkId,
        ownership_proof: &[u8],
        public_key: &[u8],
    ) -> Result<(), ChunkActionError> {
        let validated = match name.chunk_type() {
            ChunkType::Default => {
                default::process_delete(name, ownership_proof, public_key, &*self.store)
            }
            ChunkType::SignaturePacket => {
                signature::process_delete(name, ownership_proof, public_key, &*self.store)
            }
            ChunkType::ModifiableByOwner => {
                modifiable::process_delete(name, ownership_proof, public_key, &*self.store)
            }
            ChunkType::AppendableByAll => {
                appendable::process_delete(name, ownership_proof, public_key, &*self.store)
            }
            ChunkType::Unknown => Err(ChunkActionError::InvalidChunkType),
        };
        if let Err(error) = validated {
            tracing::error!(chunk = %name, %error, "delete refused");
            return Err(error);
        }
        if !self.store.delete(name) {
            tracing::error!(chunk = %name, "delete failed in byte store");
            return Err(ChunkActionError::DeleteFailure);
        }
        Ok(())
    }

    /// Validated modify: the per-type rule computes the replacement bytes,
    /// which are then written through. Returns the signed size delta.
    pub fn modify(
        &self,
        name: &ChunkId,
        content: &[u8],
        public_key: &[u8],
    ) -> Result<i64, ChunkActionError> {
        let outcome = match name.chunk_type() {
            ChunkType::Default => default::process_modify(name, content, public_key, &*self.store),
            ChunkType::SignaturePacket => {
                signature::process_modify(name, content, public_key, &*self.store)
            }
            ChunkType::ModifiableByOwner => {
                modifiable::process_modify(name, content, public_key, &*self.store)
            }
            ChunkType::AppendableByAll => {
                appendable::process_modify(name, content, public_key, &*self.store)
            }
            ChunkType::Unknown => Err(ChunkActionError::InvalidChunkType),
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(chunk = %name, %error, "modify refused");
                return Err(error);
            }
        };
        if !self.store.modify(name, outcome.new_content) {
            tracing::error!(chunk = %name, "modify failed in byte store");
            return Err(ChunkActionError::ModifyFailure);
        }
        Ok(outcome.size_difference)
    }

    /// Validated existence check.
    pub fn has(
        &self,
        name: &ChunkId,
        version: Option<&[u8]>,
        public_key: &[u8],
    ) -> Result<(), ChunkActionError> {
        match name.chunk_type() {
            ChunkType::Default => default::process_has(name, version, public_key, &*self.store),
            ChunkType::SignaturePacket => {
                signature::process_has(name, version, public_key, &*self.store)
            }
            ChunkType::ModifiableByOwner => {
                modifiable::process_has(name, version, public_key, &*self.store)
            }
            ChunkType::AppendableByAll => {
                appendable::process_has(name, version, public_key, &*self.store)
            }
            ChunkType::Unknown => Err(ChunkActionError::InvalidChunkType),
        }
    }

    /// The version tag of a stored chunk, if derivable.
    pub fn version(&self, name: &ChunkId) -> Option<Vec<u8>> {
        match name.chunk_type() {
            ChunkType::Default => default::version(name, &*self.store),
            ChunkType::SignaturePacket => signature::version(name, &*self.store),
            ChunkType::ModifiableByOwner => modifiable::version(name, &*self.store),
            ChunkType::AppendableByAll => appendable::version(name, &*self.store),
            ChunkType::Unknown => None,
        }
    }

    /// Post-hoc integrity check of a stored chunk.
    pub fn is_valid_chunk(&self, name: &ChunkId) -> bool {
        match name.chunk_type() {
            ChunkType::Default => default::is_valid_chunk(name, &*self.store),
            ChunkType::SignaturePacket => signature::is_valid_chunk(name, &*self.store),
            ChunkType::ModifiableByOwner => modifiable::is_valid_chunk(name, &*self.store),
            ChunkType::AppendableByAll => appendable::is_valid_chunk(name, &*self.store),
            ChunkType::Unknown => false,
        }
    }
}

/// Shared helper: verify a signed-data record against a public key,
/// distinguishing a clean mismatch from an uncheckable signature.
pub(crate) fn check_signed(
    signed: &cairn_core::SignedData,
    public_key: &[u8],
) -> Result<(), ChunkActionError> {
    match signed.verify(public_key) {
        Ok(true) => Ok(()),
        Ok(false) => Err(ChunkActionError::FailedSignatureCheck),
        Err(_) => Err(ChunkActionError::SignatureCheckError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryChunkStore, ThreadsafeChunkStore};
    use cairn_core::{crypto, AppendableByAll, ModifyAppendableByAll, SignedData};

    fn authority() -> ChunkActionAuthority {
        ChunkActionAuthority::new(Arc::new(ThreadsafeChunkStore::new(MemoryChunkStore::new())))
    }

    fn default_name(content: &[u8]) -> ChunkId {
        ChunkId::new(crypto::content_hash(content).to_vec())
    }

    fn signed_name(signed: &SignedData, chunk_type: ChunkType) -> ChunkId {
        let mut hashed = signed.data.clone();
        hashed.extend_from_slice(&signed.signature);
        ChunkId::apply_type(&crypto::content_hash(&hashed), chunk_type).unwrap()
    }

    fn random_typed_name(chunk_type: ChunkType) -> ChunkId {
        ChunkId::apply_type(&crypto::content_hash(&crypto::random_bytes(16)), chunk_type).unwrap()
    }

    fn ownership_proof(keys: &crypto::Keypair) -> Vec<u8> {
        SignedData::sign(crypto::random_bytes(16), keys)
            .encode()
            .unwrap()
    }

    fn appendable_record(owner: &crypto::Keypair, open: bool) -> AppendableByAll {
        let tag = if open {
            ChunkType::AppendableByAll as u8
        } else {
            ChunkType::Default as u8
        };
        AppendableByAll {
            allow_others_to_append: SignedData::sign(vec![tag], owner),
            identity_key: SignedData::sign(owner.public.to_vec(), owner),
            appendices: Vec::new(),
        }
    }

    // ── Default ───────────────────────────────────────────────────────────────

    #[test]
    fn default_round_trip() {
        let caa = authority();
        let content = Bytes::from_static(b"hello world");
        let name = default_name(&content);

        assert!(caa.store(&name, content.clone(), &[]).is_ok());
        assert!(caa.has(&name, None, &[]).is_ok());
        assert_eq!(caa.get(&name, None, &[]).unwrap(), content);
        assert!(caa.delete(&name, &[], &[]).is_ok());
        assert_eq!(
            caa.has(&name, None, &[]),
            Err(ChunkActionError::FailedToFindChunk)
        );
    }

    #[test]
    fn default_rejects_mis_hashed_content() {
        let caa = authority();
        let name = default_name(b"world");
        assert_eq!(
            caa.store(&name, Bytes::from_static(b"hello"), &[]),
            Err(ChunkActionError::NotHashable)
        );
        assert!(caa.has(&name, None, &[]).is_err());
    }

    #[test]
    fn default_restore_must_match_existing() {
        let caa = authority();
        let content = Bytes::from_static(b"fixed");
        let name = default_name(&content);
        caa.store(&name, content.clone(), &[]).unwrap();
        assert!(caa.store(&name, content, &[]).is_ok());
    }

    #[test]
    fn default_modify_always_fails() {
        let caa = authority();
        let content = Bytes::from_static(b"immutable");
        let name = default_name(&content);
        caa.store(&name, content.clone(), &[]).unwrap();
        assert_eq!(
            caa.modify(&name, b"replacement", &[]),
            Err(ChunkActionError::InvalidModify)
        );
        assert_eq!(caa.get(&name, None, &[]).unwrap(), content);
    }

    #[test]
    fn unknown_type_is_rejected_everywhere() {
        let caa = authority();
        let mut bytes = crypto::content_hash(b"x").to_vec();
        bytes.push(0x42);
        let name = ChunkId::new(bytes);
        assert!(!is_valid_name(&name));
        assert_eq!(
            caa.store(&name, Bytes::from_static(b"x"), &[]),
            Err(ChunkActionError::InvalidChunkType)
        );
        assert_eq!(
            caa.get(&name, None, &[]),
            Err(ChunkActionError::InvalidChunkType)
        );
    }

    // ── SignaturePacket ───────────────────────────────────────────────────────

    #[test]
    fn signature_packet_store_and_delete() {
        let caa = authority();
        let keys = crypto::Keypair::generate();
        let packet = SignedData::sign(keys.public.to_vec(), &keys);
        let name = signed_name(&packet, ChunkType::SignaturePacket);
        let content = Bytes::from(packet.encode().unwrap());

        assert!(caa.store(&name, content.clone(), &keys.public).is_ok());
        // Signature packets are write-once.
        assert_eq!(
            caa.store(&name, content, &keys.public),
            Err(ChunkActionError::KeyNotUnique)
        );

        // Deletion needs a proof signed by the owner.
        let stranger = crypto::Keypair::generate();
        assert_eq!(
            caa.delete(&name, &ownership_proof(&stranger), &keys.public),
            Err(ChunkActionError::NotOwner)
        );
        assert!(caa
            .delete(&name, &ownership_proof(&keys), &keys.public)
            .is_ok());
        assert!(caa.has(&name, None, &keys.public).is_err());
    }

    #[test]
    fn signature_packet_name_must_match_hash() {
        let caa = authority();
        let keys = crypto::Keypair::generate();
        let packet = SignedData::sign(keys.public.to_vec(), &keys);
        let name = random_typed_name(ChunkType::SignaturePacket);
        assert_eq!(
            caa.store(&name, Bytes::from(packet.encode().unwrap()), &keys.public),
            Err(ChunkActionError::NotHashable)
        );
    }

    // ── ModifiableByOwner ─────────────────────────────────────────────────────

    #[test]
    fn modifiable_store_modify_get() {
        let caa = authority();
        let keys = crypto::Keypair::generate();
        let name = random_typed_name(ChunkType::ModifiableByOwner);

        let v1 = SignedData::sign(b"version one".to_vec(), &keys);
        caa.store(&name, Bytes::from(v1.encode().unwrap()), &keys.public)
            .unwrap();

        let v2 = SignedData::sign(b"version two".to_vec(), &keys);
        let v2_bytes = v2.encode().unwrap();
        let delta = caa.modify(&name, &v2_bytes, &keys.public).unwrap();
        assert_eq!(
            delta,
            v1.encode().unwrap().len() as i64 - v2_bytes.len() as i64
        );
        assert_eq!(caa.get(&name, None, &keys.public).unwrap(), v2_bytes);
    }

    #[test]
    fn modifiable_rejects_non_owner_modify() {
        let caa = authority();
        let keys = crypto::Keypair::generate();
        let intruder = crypto::Keypair::generate();
        let name = random_typed_name(ChunkType::ModifiableByOwner);

        let original = SignedData::sign(b"mine".to_vec(), &keys);
        caa.store(&name, Bytes::from(original.encode().unwrap()), &keys.public)
            .unwrap();

        let forged = SignedData::sign(b"theirs".to_vec(), &intruder);
        assert_eq!(
            caa.modify(&name, &forged.encode().unwrap(), &intruder.public),
            Err(ChunkActionError::FailedSignatureCheck)
        );
    }

    #[test]
    fn modifiable_version_gated_get() {
        let caa = authority();
        let keys = crypto::Keypair::generate();
        let name = random_typed_name(ChunkType::ModifiableByOwner);

        let record = SignedData::sign(b"gated".to_vec(), &keys);
        let content = record.encode().unwrap();
        caa.store(&name, Bytes::from(content.clone()), &keys.public)
            .unwrap();

        let version = crypto::version_hash(&content);
        assert!(caa.get(&name, Some(version.as_slice()), &keys.public).is_ok());
        assert_eq!(caa.version(&name).unwrap(), version.to_vec());

        let wrong = crypto::version_hash(b"something else");
        assert_eq!(
            caa.get(&name, Some(wrong.as_slice()), &keys.public),
            Err(ChunkActionError::DifferentVersion)
        );
    }

    // ── AppendableByAll ───────────────────────────────────────────────────────

    #[test]
    fn appendable_owner_read_consumes_appendices() {
        let caa = authority();
        let owner = crypto::Keypair::generate();
        let other = crypto::Keypair::generate();
        let name = random_typed_name(ChunkType::AppendableByAll);

        let record = appendable_record(&owner, true);
        caa.store(&name, Bytes::from(record.encode().unwrap()), &owner.public)
            .unwrap();

        // Non-owner appends.
        let appendix = SignedData::sign(b"message for owner".to_vec(), &other);
        caa.modify(&name, &appendix.encode().unwrap(), &other.public)
            .unwrap();

        // Owner read returns the appendix and clears the stored list.
        let full = caa.get(&name, None, &owner.public).unwrap();
        let parsed = AppendableByAll::decode(&full).unwrap();
        assert_eq!(parsed.appendices, vec![appendix]);

        let again = caa.get(&name, None, &owner.public).unwrap();
        assert!(AppendableByAll::decode(&again).unwrap().appendices.is_empty());
    }

    #[test]
    fn appendable_non_owner_sees_identity_key_only() {
        let caa = authority();
        let owner = crypto::Keypair::generate();
        let other = crypto::Keypair::generate();
        let name = random_typed_name(ChunkType::AppendableByAll);

        let record = appendable_record(&owner, true);
        caa.store(&name, Bytes::from(record.encode().unwrap()), &owner.public)
            .unwrap();

        let view = caa.get(&name, None, &other.public).unwrap();
        let identity = SignedData::decode(&view).unwrap();
        assert_eq!(identity, record.identity_key);
    }

    #[test]
    fn appendable_append_respects_permission_byte() {
        let caa = authority();
        let owner = crypto::Keypair::generate();
        let other = crypto::Keypair::generate();
        let name = random_typed_name(ChunkType::AppendableByAll);

        let record = appendable_record(&owner, false);
        caa.store(&name, Bytes::from(record.encode().unwrap()), &owner.public)
            .unwrap();

        let appendix = SignedData::sign(b"rejected".to_vec(), &other);
        assert_eq!(
            caa.modify(&name, &appendix.encode().unwrap(), &other.public),
            Err(ChunkActionError::AppendDisallowed)
        );
    }

    #[test]
    fn appendable_owner_swaps_exactly_one_field() {
        let caa = authority();
        let owner = crypto::Keypair::generate();
        let name = random_typed_name(ChunkType::AppendableByAll);

        caa.store(
            &name,
            Bytes::from(appendable_record(&owner, true).encode().unwrap()),
            &owner.public,
        )
        .unwrap();

        // Close the chunk to appends.
        let closed = ModifyAppendableByAll {
            allow_others_to_append: Some(SignedData::sign(
                vec![ChunkType::Default as u8],
                &owner,
            )),
            identity_key: None,
        };
        caa.modify(&name, &closed.encode().unwrap(), &owner.public)
            .unwrap();

        let stored = caa.get(&name, None, &owner.public).unwrap();
        let parsed = AppendableByAll::decode(&stored).unwrap();
        assert_eq!(parsed.allow_others_to_append.data, vec![ChunkType::Default as u8]);

        // Zero or two fields is an invalid modify.
        let none = ModifyAppendableByAll {
            allow_others_to_append: None,
            identity_key: None,
        };
        assert_eq!(
            caa.modify(&name, &none.encode().unwrap(), &owner.public),
            Err(ChunkActionError::InvalidModify)
        );
        let both = ModifyAppendableByAll {
            allow_others_to_append: Some(SignedData::sign(vec![1], &owner)),
            identity_key: Some(SignedData::sign(vec![2], &owner)),
        };
        assert_eq!(
            caa.modify(&name, &both.encode().unwrap(), &owner.public),
            Err(ChunkActionError::InvalidModify)
        );
    }

    // ── Property table ────────────────────────────────────────────────────────

    #[test]
    fn property_table_matches_types() {
        let default = default_name(b"t");
        let signature = random_typed_name(ChunkType::SignaturePacket);
        let modifiable = random_typed_name(ChunkType::ModifiableByOwner);
        let appendable = random_typed_name(ChunkType::AppendableByAll);

        assert!(is_cacheable(&default) && is_payable(&default));
        assert!(!is_modifiable(&default) && !modify_replaces(&default));

        assert!(!is_cacheable(&signature) && !is_modifiable(&signature));

        assert!(is_modifiable(&modifiable) && modify_replaces(&modifiable));
        assert!(!is_cacheable(&modifiable) && !is_payable(&modifiable));

        assert!(is_modifiable(&appendable) && !modify_replaces(&appendable));
    }
}
