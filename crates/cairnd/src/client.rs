//! Client-side controller for the supervisor's control plane.
//!
//! Speaks the validated-client half of the loopback protocol: connect,
//! answer the challenge with the MAID key, then issue start/ownership
//! requests. Used by the integration tests and any CLI wrapper.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use cairn_core::crypto::Keypair;
use cairn_core::wire::{self, MessageType};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::connection::{read_message, write_message};
use crate::connections::{maid_name_for, RPC_TIMEOUT};

/// How long to wait for a vault to spawn and hand back its credentials.
const START_VAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ClientController {
    stream: TcpStream,
    keys: Keypair,
}

impl ClientController {
    /// Connect to a supervisor on the loopback and validate with the MAID
    /// keypair via challenge/response.
    pub async fn connect(port: u16, keys: Keypair) -> Result<Self> {
        let mut stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .context("connecting to vault manager")?;

        write_message(
            &mut stream,
            wire::wrap_empty(MessageType::ValidateConnectionRequest)?,
        )
        .await?;

        let (message_type, payload) = timeout(RPC_TIMEOUT, read_message(&mut stream))
            .await
            .context("timed out waiting for challenge")??;
        if message_type != MessageType::ValidateConnectionRequest {
            bail!("expected challenge, got {message_type:?}");
        }
        let challenge: wire::ValidateConnectionRequest = wire::parse_payload(&payload)?;

        let response = wire::ChallengeResponse {
            public_maid_name: maid_name_for(&keys.public),
            public_maid_bytes: keys.public.to_vec(),
            signature: keys.sign(&challenge.challenge),
        };
        write_message(
            &mut stream,
            wire::wrap(MessageType::ChallengeResponse, &response)?,
        )
        .await?;

        tracing::debug!(client = %response.public_maid_name, "validated with vault manager");
        Ok(Self { stream, keys })
    }

    pub fn maid_name(&self) -> String {
        maid_name_for(&self.keys.public)
    }

    /// Ask the supervisor to create and start a vault. Resolves with the
    /// supervisor's response once the vault has handshaked (or failed).
    pub async fn start_vault(
        &mut self,
        label: &str,
        vault_dir: Option<String>,
        max_disk_usage: Option<u64>,
    ) -> Result<wire::VaultRunningResponse> {
        let request = wire::StartVaultRequest {
            label: label.to_string(),
            vault_dir,
            max_disk_usage,
            pmid_list_index: None,
        };
        write_message(
            &mut self.stream,
            wire::wrap(MessageType::StartVaultRequest, &request)?,
        )
        .await?;
        self.wait_for_running_response(label).await
    }

    /// Claim an existing labelled vault, possibly moving its chunkstore.
    pub async fn take_ownership(
        &mut self,
        label: &str,
        vault_dir: &str,
        max_disk_usage: u64,
    ) -> Result<wire::VaultRunningResponse> {
        let request = wire::TakeOwnershipRequest {
            label: label.to_string(),
            vault_dir: vault_dir.to_string(),
            max_disk_usage,
        };
        write_message(
            &mut self.stream,
            wire::wrap(MessageType::TakeOwnershipRequest, &request)?,
        )
        .await?;
        self.wait_for_running_response(label).await
    }

    async fn wait_for_running_response(
        &mut self,
        label: &str,
    ) -> Result<wire::VaultRunningResponse> {
        let deadline = tokio::time::Instant::now() + START_VAULT_TIMEOUT;
        loop {
            let (message_type, payload) =
                tokio::time::timeout_at(deadline, read_message(&mut self.stream))
                    .await
                    .context("timed out waiting for vault running response")??;
            match message_type {
                MessageType::VaultRunningResponse => {
                    let response: wire::VaultRunningResponse = wire::parse_payload(&payload)?;
                    if response.label == label {
                        return Ok(response);
                    }
                    tracing::debug!(label = %response.label, "response for another vault");
                }
                MessageType::LogMessage => {
                    if let Ok(log) = wire::parse_payload::<wire::LogMessage>(&payload) {
                        tracing::info!("vault manager: {}", log.message);
                    }
                }
                other => {
                    tracing::warn!(?other, "unexpected message while waiting for response");
                }
            }
        }
    }

    /// Next forwarded log line from the owned vault.
    pub async fn next_log_message(&mut self) -> Result<String> {
        let deadline = tokio::time::Instant::now() + RPC_TIMEOUT;
        loop {
            let (message_type, payload) =
                tokio::time::timeout_at(deadline, read_message(&mut self.stream))
                    .await
                    .context("timed out waiting for log message")??;
            if message_type == MessageType::LogMessage {
                let log: wire::LogMessage = wire::parse_payload(&payload)?;
                return Ok(log.message);
            }
        }
    }
}
