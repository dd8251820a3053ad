//! Outbound message builders.
//!
//! Thin helpers that wrap a payload and queue it on a connection; every
//! supervisor-to-peer message goes through one of these.

use cairn_core::wire::{self, MessageType};

use crate::connection::Connection;
use crate::vault_info::PmidAndSigner;

fn send<T: serde::Serialize>(connection: &Connection, message_type: MessageType, payload: &T) {
    match wire::wrap(message_type, payload) {
        Ok(body) => connection.send(message_type, body),
        Err(error) => {
            tracing::error!(?message_type, %error, "failed to build message")
        }
    }
}

fn send_empty(connection: &Connection, message_type: MessageType) {
    match wire::wrap_empty(message_type) {
        Ok(body) => connection.send(message_type, body),
        Err(error) => {
            tracing::error!(?message_type, %error, "failed to build message")
        }
    }
}

pub fn send_challenge(connection: &Connection, challenge: Vec<u8>) {
    send(
        connection,
        MessageType::ValidateConnectionRequest,
        &wire::ValidateConnectionRequest { challenge },
    );
}

pub fn send_vault_running_response(
    connection: &Connection,
    label: &str,
    pmid_and_signer: Option<&PmidAndSigner>,
    error: Option<String>,
) {
    send(
        connection,
        MessageType::VaultRunningResponse,
        &wire::VaultRunningResponse {
            label: label.to_string(),
            pmid_and_signer: pmid_and_signer.map(PmidAndSigner::to_wire),
            error,
        },
    );
}

pub fn send_vault_started_response(
    connection: &Connection,
    response: &wire::VaultStartedResponse,
) {
    send(connection, MessageType::VaultStartedResponse, response);
}

pub fn send_vault_shutdown_request(connection: &Connection) {
    send_empty(connection, MessageType::VaultShutdownRequest);
}

pub fn send_max_disk_usage_update(connection: &Connection, max_disk_usage: u64) {
    send(
        connection,
        MessageType::MaxDiskUsageUpdate,
        &wire::MaxDiskUsageUpdate { max_disk_usage },
    );
}

pub fn send_log_message(connection: &Connection, message: String) {
    send(
        connection,
        MessageType::LogMessage,
        &wire::LogMessage { message },
    );
}
