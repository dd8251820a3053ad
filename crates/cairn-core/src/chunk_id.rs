//! Chunk identifiers — fixed-width content names with an optional type byte.
//!
//! A chunk name is the 64-byte digest of its content (or of the record that
//! names it), optionally followed by ONE trailing byte tagging the chunk
//! type. A name without the trailing byte is `Default`. A trailing byte that
//! matches none of the known types makes the name `Unknown`, and the action
//! authority rejects it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Length of a chunk name without its type byte.
pub const NAME_SIZE: usize = 64;

/// Chunk type, encoded as the optional trailing byte of a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChunkType {
    /// Content-addressed immutable data: `hash(bytes) == name`.
    Default = 0,
    /// Structured record anyone may append to, owned by one signer.
    AppendableByAll = 1,
    /// Signed data the owner may replace wholesale.
    ModifiableByOwner = 2,
    /// Immutable signature packet: `hash(data || signature) == name`.
    SignaturePacket = 3,
    /// Unrecognised trailing byte or bad length. Rejected everywhere.
    Unknown = 0x80,
}

impl ChunkType {
    fn from_tag(tag: u8) -> ChunkType {
        match tag {
            1 => ChunkType::AppendableByAll,
            2 => ChunkType::ModifiableByOwner,
            3 => ChunkType::SignaturePacket,
            _ => ChunkType::Unknown,
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChunkType::Default => "default",
            ChunkType::AppendableByAll => "appendable-by-all",
            ChunkType::ModifiableByOwner => "modifiable-by-owner",
            ChunkType::SignaturePacket => "signature-packet",
            ChunkType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A chunk name: `NAME_SIZE` bytes, or `NAME_SIZE + 1` with a type tag.
///
/// Names of any other length are representable (they arrive off the wire)
/// but classify as `Unknown` and fail `is_valid()`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(Vec<u8>);

impl ChunkId {
    pub fn new(bytes: Vec<u8>) -> Self {
        ChunkId(bytes)
    }

    /// Build a name from a bare 64-byte digest and a type. Non-default types
    /// get the tag byte appended. Returns `None` if the digest has the wrong
    /// length or the type is `Unknown`.
    pub fn apply_type(name: &[u8], chunk_type: ChunkType) -> Option<ChunkId> {
        if name.len() != NAME_SIZE {
            tracing::error!(
                len = name.len(),
                "chunk name must be {NAME_SIZE} bytes before typing"
            );
            return None;
        }
        match chunk_type {
            ChunkType::Default => Some(ChunkId(name.to_vec())),
            ChunkType::Unknown => None,
            tagged => {
                let mut full = name.to_vec();
                full.push(tagged as u8);
                Some(ChunkId(full))
            }
        }
    }

    /// The leading fixed-width portion of the name, without any type byte.
    pub fn without_type(&self) -> &[u8] {
        if self.0.len() > NAME_SIZE {
            &self.0[..NAME_SIZE]
        } else {
            &self.0
        }
    }

    /// Classify the name by its length and trailing byte.
    pub fn chunk_type(&self) -> ChunkType {
        match self.0.len() {
            NAME_SIZE => ChunkType::Default,
            len if len == NAME_SIZE + 1 => ChunkType::from_tag(self.0[NAME_SIZE]),
            _ => ChunkType::Unknown,
        }
    }

    /// A name is valid iff it classifies as a known type.
    pub fn is_valid(&self) -> bool {
        self.chunk_type() != ChunkType::Unknown
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Base-32 rendering of the full name, used for on-disk paths.
    pub fn to_base32(&self) -> String {
        data_encoding::BASE32_NOPAD.encode(&self.0).to_lowercase()
    }

    /// Short base-32 prefix for log lines.
    pub fn short(&self) -> String {
        let full = self.to_base32();
        full[..12.min(full.len())].to_string()
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({}, {})", self.short(), self.chunk_type())
    }
}

// Display shows the short base-32 prefix; full names are 64+ bytes and
// would drown log lines.
impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(fill: u8) -> Vec<u8> {
        vec![fill; NAME_SIZE]
    }

    #[test]
    fn bare_name_is_default() {
        let id = ChunkId::new(digest(7));
        assert_eq!(id.chunk_type(), ChunkType::Default);
        assert!(id.is_valid());
        assert_eq!(id.without_type(), &digest(7)[..]);
    }

    #[test]
    fn apply_type_appends_tag() {
        let id = ChunkId::apply_type(&digest(1), ChunkType::ModifiableByOwner).unwrap();
        assert_eq!(id.len(), NAME_SIZE + 1);
        assert_eq!(id.chunk_type(), ChunkType::ModifiableByOwner);
        assert_eq!(id.without_type(), &digest(1)[..]);
    }

    #[test]
    fn apply_type_default_appends_nothing() {
        let id = ChunkId::apply_type(&digest(2), ChunkType::Default).unwrap();
        assert_eq!(id.len(), NAME_SIZE);
    }

    #[test]
    fn apply_type_rejects_bad_length() {
        assert!(ChunkId::apply_type(&[0u8; 10], ChunkType::Default).is_none());
        assert!(ChunkId::apply_type(&[0u8; NAME_SIZE + 1], ChunkType::SignaturePacket).is_none());
    }

    #[test]
    fn unknown_tag_classifies_unknown() {
        let mut bytes = digest(3);
        bytes.push(0x42);
        let id = ChunkId::new(bytes);
        assert_eq!(id.chunk_type(), ChunkType::Unknown);
        assert!(!id.is_valid());
    }

    #[test]
    fn wrong_length_classifies_unknown() {
        assert!(!ChunkId::new(vec![0u8; 12]).is_valid());
        assert!(!ChunkId::new(vec![0u8; NAME_SIZE + 2]).is_valid());
    }

    #[test]
    fn all_tags_round_trip() {
        for t in [
            ChunkType::AppendableByAll,
            ChunkType::ModifiableByOwner,
            ChunkType::SignaturePacket,
        ] {
            let id = ChunkId::apply_type(&digest(9), t).unwrap();
            assert_eq!(id.chunk_type(), t);
        }
    }
}
