//! Connection registries.
//!
//! Every fresh connection sits in `NewConnections` under an RPC timer
//! until it identifies itself as a client (challenge/response) or a vault
//! (`VaultStarted`). Clients then live in `ClientConnections`, keyed by
//! their public MAID name once the challenge signature checks out.

use std::time::Duration;

use cairn_core::{crypto, wire};
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::connection::{Connection, Event};

/// How long a connection may stay unclassified, and how long a pending
/// request may wait for its response.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Unclassified connections, closed if the timer fires first.
#[derive(Default)]
pub struct NewConnections {
    connections: DashMap<u64, Connection>,
}

impl NewConnections {
    /// Track a fresh connection and start its classification timer.
    pub fn add(&self, connection: Connection, events: mpsc::UnboundedSender<Event>) {
        let id = connection.id();
        self.connections.insert(id, connection);
        tokio::spawn(async move {
            tokio::time::sleep(RPC_TIMEOUT).await;
            let _ = events.send(Event::NewConnectionExpired(id));
        });
    }

    /// Remove a connection that has identified itself. False if untracked.
    pub fn remove(&self, id: u64) -> Option<Connection> {
        self.connections.remove(&id).map(|(_, connection)| connection)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().close();
        }
        self.connections.clear();
    }
}

struct UnvalidatedClient {
    connection: Connection,
    challenge: Vec<u8>,
}

struct ValidatedClient {
    connection: Connection,
    maid_name: String,
}

/// Client connections, unvalidated (challenge outstanding) or validated.
#[derive(Default)]
pub struct ClientConnections {
    unvalidated: DashMap<u64, UnvalidatedClient>,
    validated: DashMap<u64, ValidatedClient>,
}

impl ClientConnections {
    /// Issue a challenge of random length in `[100, 200)` for a connection
    /// that asked to be validated.
    pub fn add(&self, connection: Connection) -> Vec<u8> {
        use rand::Rng;
        let length = rand::thread_rng()
            .gen_range(wire::MIN_CHALLENGE_SIZE..wire::MAX_CHALLENGE_SIZE);
        let challenge = crypto::random_bytes(length);
        self.unvalidated.insert(
            connection.id(),
            UnvalidatedClient {
                connection,
                challenge: challenge.clone(),
            },
        );
        challenge
    }

    /// Verify a challenge response. On success the connection becomes a
    /// validated client keyed by its MAID name; on failure it is closed.
    pub fn validate(&self, id: u64, response: &wire::ChallengeResponse) -> bool {
        let Some((_, pending)) = self.unvalidated.remove(&id) else {
            tracing::error!(connection = id, "challenge response from unknown connection");
            return false;
        };

        let expected_name = maid_name_for(&response.public_maid_bytes);
        let signature_good = crypto::verify(
            &pending.challenge,
            &response.signature,
            &response.public_maid_bytes,
        )
        .unwrap_or(false);
        if !signature_good || expected_name != response.public_maid_name {
            tracing::error!(connection = id, "client validation failed");
            pending.connection.close();
            return false;
        }

        tracing::info!(
            connection = id,
            client = %response.public_maid_name,
            "client validated"
        );
        self.validated.insert(
            id,
            ValidatedClient {
                connection: pending.connection,
                maid_name: response.public_maid_name.clone(),
            },
        );
        true
    }

    /// MAID name of a validated client connection.
    pub fn find_validated(&self, id: u64) -> Option<String> {
        self.validated.get(&id).map(|entry| entry.maid_name.clone())
    }

    /// Connection of a validated client, by MAID name.
    pub fn find_by_name(&self, maid_name: &str) -> Option<Connection> {
        self.validated
            .iter()
            .find(|entry| entry.maid_name == maid_name)
            .map(|entry| entry.connection.clone())
    }

    /// Drop a closed connection. True if it was tracked here.
    pub fn remove(&self, id: u64) -> bool {
        self.unvalidated.remove(&id).is_some() || self.validated.remove(&id).is_some()
    }

    pub fn close_all(&self) {
        for entry in self.unvalidated.iter() {
            entry.value().connection.close();
        }
        for entry in self.validated.iter() {
            entry.value().connection.close();
        }
        self.unvalidated.clear();
        self.validated.clear();
    }
}

/// The MAID name a client derives from its public key; clients and the
/// supervisor must agree on this derivation.
pub fn maid_name_for(public_key: &[u8]) -> String {
    hex::encode(crypto::version_hash(public_key))
}
