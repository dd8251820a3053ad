//! Cryptographic facade for Cairn.
//!
//! Provides four things:
//!   1. SHA3-512 content hashing — 64-byte chunk names
//!   2. BLAKE3 short hashing — 32-byte chunk versions
//!   3. Ed25519 keypairs — chunk ownership signatures, client identities
//!   4. AES-256-GCM sealing — vault credentials at rest in the config file
//!
//! Private key material is zeroized on drop. There is no unsafe code in
//! this module.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::{Signer, Verifier};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of a content hash, and so of an untyped chunk name.
pub const HASH_SIZE: usize = 64;
/// Length of a chunk version digest.
pub const VERSION_SIZE: usize = 32;
/// AES-256 key length.
pub const AES_KEY_SIZE: usize = 32;
/// AES-GCM nonce length.
pub const AES_NONCE_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("bad key material: {0}")]
    BadKey(&'static str),
    #[error("signature verification failed")]
    BadSignature,
    #[error("sealed data could not be opened")]
    OpenFailed,
}

// ── Hashing ───────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning the 64-byte SHA3-512 digest.
///
/// This digest IS the untyped chunk name for content-addressed chunks.
pub fn content_hash(data: &[u8]) -> [u8; HASH_SIZE] {
    use sha3::{Digest, Sha3_512};
    let digest = Sha3_512::digest(data);
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(&digest);
    out
}

/// Short 32-byte BLAKE3 digest, used as a chunk version tag.
///
/// Versions compare for equality only; nothing orders them.
pub fn version_hash(data: &[u8]) -> [u8; VERSION_SIZE] {
    *blake3::hash(data).as_bytes()
}

// ── Random material ───────────────────────────────────────────────────────────

/// Cryptographically random bytes of the given length.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Random alphanumeric string, used for lock-record transaction ids.
pub fn random_alphanumeric(len: usize) -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Non-zero uniformly random 32-bit integer.
pub fn random_nonzero_u32() -> u32 {
    loop {
        let id = rand::thread_rng().next_u32();
        if id != 0 {
            return id;
        }
    }
}

// ── Keypairs ──────────────────────────────────────────────────────────────────

/// An Ed25519 keypair.
///
/// Identifies a chunk owner, a client (MAID) or a vault (PMID). The private
/// half never leaves this struct except via `private_bytes` for sealed
/// persistence.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    private: Zeroizing<[u8; 32]>,
    /// Public verifying key bytes.
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let signing = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        Self {
            public: signing.verifying_key().to_bytes(),
            private: Zeroizing::new(signing.to_bytes()),
        }
    }

    /// Reconstruct from stored private key bytes. The public half is derived.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let signing = ed25519_dalek::SigningKey::from_bytes(&private_bytes);
        Self {
            public: signing.verifying_key().to_bytes(),
            private: Zeroizing::new(private_bytes),
        }
    }

    /// Private key bytes for sealed persistence.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    /// Sign a message, returning the 64-byte detached signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signing = ed25519_dalek::SigningKey::from_bytes(&self.private);
        signing.sign(message).to_bytes().to_vec()
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Keypair::from_private(*self.private_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair({})", hex::encode(&self.public[..6]))
    }
}

/// Verify a detached signature against a 32-byte public key.
///
/// Returns `Ok(true)` / `Ok(false)` for a well-formed check, and an error
/// only when the key or signature bytes are malformed — callers report the
/// two cases differently.
pub fn verify(message: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool, CryptoError> {
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| CryptoError::BadKey("public key must be 32 bytes"))?;
    let verifying = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| CryptoError::BadKey("not a valid Ed25519 point"))?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::BadKey("signature must be 64 bytes"))?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    Ok(verifying.verify(message, &signature).is_ok())
}

// ── Sealing (config file) ─────────────────────────────────────────────────────

/// Seal plaintext under an AES-256-GCM key and nonce.
pub fn seal(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_lengths(key, nonce)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::OpenFailed)
}

/// Open ciphertext sealed by `seal` with the same key and nonce.
pub fn open(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_lengths(key, nonce)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::OpenFailed)
}

fn check_lengths(key: &[u8], nonce: &[u8]) -> Result<(), CryptoError> {
    if key.len() != AES_KEY_SIZE {
        return Err(CryptoError::BadKey("AES key must be 32 bytes"));
    }
    if nonce.len() != AES_NONCE_SIZE {
        return Err(CryptoError::BadKey("AES nonce must be 12 bytes"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_and_wide() {
        let a = content_hash(b"hello world");
        let b = content_hash(b"hello world");
        assert_eq!(a, b);
        assert_ne!(a, content_hash(b"hello worlds"));
        assert_eq!(a.len(), HASH_SIZE);
    }

    #[test]
    fn version_hash_differs_from_content_hash() {
        let v = version_hash(b"payload");
        assert_eq!(v.len(), VERSION_SIZE);
        assert_ne!(&content_hash(b"payload")[..VERSION_SIZE], &v[..]);
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let keys = Keypair::generate();
        let sig = keys.sign(b"prove it");
        assert!(verify(b"prove it", &sig, &keys.public).unwrap());
        assert!(!verify(b"prove what", &sig, &keys.public).unwrap());
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let keys = Keypair::generate();
        let other = Keypair::generate();
        let sig = keys.sign(b"data");
        assert!(!verify(b"data", &sig, &other.public).unwrap());
    }

    #[test]
    fn verify_errors_on_malformed_input() {
        let keys = Keypair::generate();
        assert!(verify(b"data", b"short", &keys.public).is_err());
        assert!(verify(b"data", &keys.sign(b"data"), b"short").is_err());
    }

    #[test]
    fn keypair_reconstructs_from_private() {
        let keys = Keypair::generate();
        let again = Keypair::from_private(*keys.private_bytes());
        assert_eq!(keys.public, again.public);
        let sig = again.sign(b"still me");
        assert!(verify(b"still me", &sig, &keys.public).unwrap());
    }

    #[test]
    fn seal_open_round_trip() {
        let key = random_bytes(AES_KEY_SIZE);
        let nonce = random_bytes(AES_NONCE_SIZE);
        let sealed = seal(&key, &nonce, b"vault credentials").unwrap();
        assert_ne!(&sealed[..], b"vault credentials");
        let opened = open(&key, &nonce, &sealed).unwrap();
        assert_eq!(opened, b"vault credentials");
    }

    #[test]
    fn open_detects_tampering() {
        let key = random_bytes(AES_KEY_SIZE);
        let nonce = random_bytes(AES_NONCE_SIZE);
        let mut sealed = seal(&key, &nonce, b"secret").unwrap();
        sealed[0] ^= 0xff;
        assert!(open(&key, &nonce, &sealed).is_err());
    }

    #[test]
    fn random_nonzero_u32_is_never_zero() {
        for _ in 0..64 {
            assert_ne!(random_nonzero_u32(), 0);
        }
    }
}
