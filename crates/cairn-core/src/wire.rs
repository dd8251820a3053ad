//! Loopback wire protocol between the supervisor, its clients, and vaults.
//!
//! Every message on the wire is a `WrapperMessage { message_type, payload }`
//! serialised as JSON inside a 4-byte big-endian length-prefixed frame. The
//! payload is the JSON encoding of the type-specific struct below. Changing
//! any field here is a protocol break between a supervisor and the vaults
//! it spawned — both sides ship in lockstep, so no versioning field exists.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Frame length prefix size.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Upper bound on a single frame body. Anything larger is a corrupt stream.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Challenge length is uniform in `[MIN_CHALLENGE_SIZE, MAX_CHALLENGE_SIZE)`.
pub const MIN_CHALLENGE_SIZE: usize = 100;
pub const MAX_CHALLENGE_SIZE: usize = 200;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds maximum")]
    FrameTooLarge(usize),
    #[error("message does not parse: {0}")]
    Parse(String),
    #[error("message does not serialise: {0}")]
    Serialise(String),
    #[error("unexpected message type {0:?}")]
    UnexpectedType(MessageType),
}

/// Tags for every message on the loopback transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// VM → client: here is a challenge, prove who you are.
    ValidateConnectionRequest,
    /// Client → VM: signed challenge plus the client's public identity.
    ChallengeResponse,
    /// Client → VM: create and start a new vault.
    StartVaultRequest,
    /// Client → VM: take ownership of an existing labelled vault.
    TakeOwnershipRequest,
    /// VM → client: outcome of a start/ownership request.
    VaultRunningResponse,
    /// Child → VM: the spawned process reports its OS pid.
    VaultStarted,
    /// VM → child: credentials and configuration for the new vault.
    VaultStartedResponse,
    /// Child → VM: the vault's application layer reports readiness.
    JoinedNetwork,
    /// VM → child: cooperative shutdown.
    VaultShutdownRequest,
    /// Child → VM: shutdown acknowledged, exiting.
    VaultShutdownResponse,
    /// VM → child: new disk budget.
    MaxDiskUsageUpdate,
    /// Child → VM: log line, forwarded to the owning client if connected.
    LogMessage,
}

/// The envelope every frame carries.
#[derive(Debug, Serialize, Deserialize)]
pub struct WrapperMessage {
    pub message_type: MessageType,
    #[serde(with = "serde_bytes_as_json")]
    pub payload: Vec<u8>,
}

// Payload bytes are themselves JSON; keep them readable in the envelope by
// storing them as a string rather than a number array.
mod serde_bytes_as_json {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&data_encoding::BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        data_encoding::BASE64
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Serialise a payload into a ready-to-frame wrapper body.
pub fn wrap<T: Serialize>(message_type: MessageType, payload: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload =
        serde_json::to_vec(payload).map_err(|e| ProtocolError::Serialise(e.to_string()))?;
    let wrapper = WrapperMessage {
        message_type,
        payload,
    };
    serde_json::to_vec(&wrapper).map_err(|e| ProtocolError::Serialise(e.to_string()))
}

/// Wrap a message that carries no payload.
pub fn wrap_empty(message_type: MessageType) -> Result<Vec<u8>, ProtocolError> {
    wrap(message_type, &())
}

/// Split a frame body back into its type tag and payload bytes.
pub fn unwrap(body: &[u8]) -> Result<(MessageType, Vec<u8>), ProtocolError> {
    let wrapper: WrapperMessage =
        serde_json::from_slice(body).map_err(|e| ProtocolError::Parse(e.to_string()))?;
    Ok((wrapper.message_type, wrapper.payload))
}

/// Parse a payload produced by `wrap`.
pub fn parse_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::Parse(e.to_string()))
}

/// Prefix a frame body with its length header.
pub fn encode_frame(body: Vec<u8>) -> Result<Vec<u8>, ProtocolError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// A keypair in transit. Only ever sent over the loopback transport, to the
/// validated owner of the vault the keys belong to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireKeypair {
    pub public: Vec<u8>,
    pub private: Vec<u8>,
}

/// A vault identity plus the credential that signs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmidAndSigner {
    pub pmid: WireKeypair,
    pub anpmid: WireKeypair,
}

/// The plaintext inside `VaultStartedResponse::sealed_pmid` and inside the
/// config file's per-vault credential blob. Sealed with the installation's
/// AES key; public halves are rederived from the private keys.
#[derive(Debug, Serialize, Deserialize)]
pub struct SealedPmid {
    pub pmid_private: [u8; 32],
    pub anpmid_private: [u8; 32],
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateConnectionRequest {
    pub challenge: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChallengeResponse {
    /// Hex of the client's public key hash; keys validated clients.
    pub public_maid_name: String,
    pub public_maid_bytes: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartVaultRequest {
    pub label: String,
    pub vault_dir: Option<String>,
    pub max_disk_usage: Option<u64>,
    /// Test mode only: pick a pre-generated identity instead of minting one.
    pub pmid_list_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeOwnershipRequest {
    pub label: String,
    pub vault_dir: String,
    pub max_disk_usage: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultRunningResponse {
    pub label: String,
    pub pmid_and_signer: Option<PmidAndSigner>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VaultStarted {
    pub process_id: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VaultStartedResponse {
    /// PMID keypair sealed with the config file's AES key.
    pub sealed_pmid: Vec<u8>,
    pub aes_key: Vec<u8>,
    pub aes_nonce: Vec<u8>,
    pub chunkstore_path: String,
    pub max_disk_usage: u64,
    /// Opaque pass-through; the supervisor never interprets these.
    pub bootstrap_contacts: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MaxDiskUsageUpdate {
    pub max_disk_usage: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogMessage {
    pub message: String,
}
