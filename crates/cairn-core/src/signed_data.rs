//! Structured chunk payload records.
//!
//! These records ARE the stored bytes for the non-default chunk types, so
//! their encoding must be deterministic: names and versions are hashes of
//! the encoded form. bincode gives a stable byte layout; do not switch the
//! codec without migrating every stored chunk.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("payload does not parse: {0}")]
    Parse(String),
    #[error("payload does not serialise: {0}")]
    Serialise(String),
}

/// A blob plus the owner's detached signature over it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedData {
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedData {
    /// Sign `data` with `keys` and wrap the pair.
    pub fn sign(data: Vec<u8>, keys: &crypto::Keypair) -> Self {
        let signature = keys.sign(&data);
        SignedData { data, signature }
    }

    /// Check the signature against a public key. Malformed key or signature
    /// bytes surface as an error, a clean mismatch as `Ok(false)`.
    pub fn verify(&self, public_key: &[u8]) -> Result<bool, crypto::CryptoError> {
        crypto::verify(&self.data, &self.signature, public_key)
    }

    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        bincode::serialize(self).map_err(|e| RecordError::Serialise(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        bincode::deserialize(bytes).map_err(|e| RecordError::Parse(e.to_string()))
    }
}

/// Stored record for an `AppendableByAll` chunk.
///
/// The signer of `allow_others_to_append` is the owner. The first byte of
/// `allow_others_to_append.data` encodes whether appending is currently
/// permitted (it holds a `ChunkType` tag; `AppendableByAll` means open).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendableByAll {
    pub allow_others_to_append: SignedData,
    pub identity_key: SignedData,
    pub appendices: Vec<SignedData>,
}

impl AppendableByAll {
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        bincode::serialize(self).map_err(|e| RecordError::Serialise(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        bincode::deserialize(bytes).map_err(|e| RecordError::Parse(e.to_string()))
    }
}

/// Owner-issued modification of an `AppendableByAll` chunk.
///
/// Exactly one of the two fields must be present; the matching field of the
/// stored record is replaced and the appendix list is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyAppendableByAll {
    pub allow_others_to_append: Option<SignedData>,
    pub identity_key: Option<SignedData>,
}

impl ModifyAppendableByAll {
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        bincode::serialize(self).map_err(|e| RecordError::Serialise(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        bincode::deserialize(bytes).map_err(|e| RecordError::Parse(e.to_string()))
    }
}
