//! Cairn integration test harness.
//!
//! Supervisor tests spawn real `cairn-vault` child processes, so they need
//! the workspace binaries built first:
//!
//!   cargo build
//!   cargo test --test integration
//!
//! Tests that need the vault binary skip themselves (with a message) when
//! it is absent. Every test gets its own temp root and an OS-assigned
//! listener port, so they can run in parallel.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use cairn_core::config::CairnConfig;
use cairn_core::crypto::{self, Keypair};
use cairn_core::wire::{self, MessageType};
use cairn_core::ChunkId;
use cairnd::connection::Event;
use cairnd::{ClientController, VaultManager};
use tokio::net::TcpStream;

static COUNTER: AtomicU64 = AtomicU64::new(0);

// ── Harness ───────────────────────────────────────────────────────────────────

fn temp_root(tag: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "cairn-integration-{}-{}-{}",
        tag,
        std::process::id(),
        id
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn vault_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("target/debug/cairn-vault")
}

fn vault_binary_available() -> bool {
    let available = vault_binary_path().exists();
    if !available {
        eprintln!("cairn-vault binary not built, skipping");
    }
    available
}

struct Supervisor {
    port: u16,
    shutdown: tokio::sync::mpsc::UnboundedSender<Event>,
    task: tokio::task::JoinHandle<()>,
    root: PathBuf,
}

/// Start a supervisor on an ephemeral port under its own temp root.
async fn start_supervisor(tag: &str) -> Supervisor {
    let root = temp_root(tag);
    let mut config = CairnConfig::default();
    config.supervisor.root_dir = root.clone();
    config.supervisor.listener_port = 0;
    config.supervisor.vault_executable = vault_binary_path();

    let manager = VaultManager::start(config).await.expect("supervisor start");
    let port = manager.listener_port();
    let shutdown = manager.event_sender();
    let task = tokio::spawn(manager.run());
    Supervisor {
        port,
        shutdown,
        task,
        root,
    }
}

impl Supervisor {
    async fn stop(self) {
        let _ = self.shutdown.send(Event::Shutdown);
        let _ = tokio::time::timeout(Duration::from_secs(20), self.task).await;
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

// ── Supervisor control plane ──────────────────────────────────────────────────

#[tokio::test]
async fn client_validates_and_starts_a_vault() {
    if !vault_binary_available() {
        return;
    }
    let supervisor = start_supervisor("start-vault").await;

    let keys = Keypair::generate();
    let mut client = ClientController::connect(supervisor.port, keys)
        .await
        .expect("client connect");

    let response = client
        .start_vault("vault1", None, Some(1 << 30))
        .await
        .expect("start vault");
    assert_eq!(response.label, "vault1");
    assert!(response.error.is_none(), "error: {:?}", response.error);

    let credentials = response.pmid_and_signer.expect("credentials for owner");
    assert_eq!(credentials.pmid.public.len(), 32);
    assert_eq!(credentials.anpmid.public.len(), 32);

    supervisor.stop().await;
}

#[tokio::test]
async fn take_ownership_updates_the_disk_budget() {
    if !vault_binary_available() {
        return;
    }
    let supervisor = start_supervisor("take-ownership").await;

    let keys = Keypair::generate();
    let mut client = ClientController::connect(supervisor.port, keys)
        .await
        .expect("client connect");

    let vault_dir = supervisor.root.join("owned-vault");
    let started = client
        .start_vault(
            "vault1",
            Some(vault_dir.display().to_string()),
            Some(1 << 30),
        )
        .await
        .expect("start vault");
    assert!(started.error.is_none());

    // Same directory, bigger budget: no restart needed.
    let owned = client
        .take_ownership("vault1", &vault_dir.display().to_string(), 2 << 30)
        .await
        .expect("take ownership");
    assert_eq!(owned.label, "vault1");
    assert!(owned.error.is_none(), "error: {:?}", owned.error);
    assert!(owned.pmid_and_signer.is_some());

    supervisor.stop().await;
}

#[tokio::test]
async fn unknown_label_ownership_is_refused() {
    let supervisor = start_supervisor("bad-label").await;

    let keys = Keypair::generate();
    let mut client = ClientController::connect(supervisor.port, keys)
        .await
        .expect("client connect");

    let response = client
        .take_ownership("no-such-vault", "/tmp/nowhere", 1 << 30)
        .await
        .expect("response");
    assert!(response.error.is_some());
    assert!(response.pmid_and_signer.is_none());

    supervisor.stop().await;
}

#[tokio::test]
async fn bad_challenge_signature_closes_the_connection() {
    let supervisor = start_supervisor("bad-signature").await;

    let mut stream = TcpStream::connect(("127.0.0.1", supervisor.port))
        .await
        .expect("connect");
    cairnd::connection::write_message(
        &mut stream,
        wire::wrap_empty(MessageType::ValidateConnectionRequest).unwrap(),
    )
    .await
    .unwrap();

    let (message_type, payload) = cairnd::connection::read_message(&mut stream)
        .await
        .expect("challenge");
    assert_eq!(message_type, MessageType::ValidateConnectionRequest);
    let challenge: wire::ValidateConnectionRequest = wire::parse_payload(&payload).unwrap();
    assert!(challenge.challenge.len() >= wire::MIN_CHALLENGE_SIZE);
    assert!(challenge.challenge.len() < wire::MAX_CHALLENGE_SIZE);

    // Sign the challenge with a key that does not match the claimed name.
    let honest = Keypair::generate();
    let impostor = Keypair::generate();
    let response = wire::ChallengeResponse {
        public_maid_name: cairnd::connections::maid_name_for(&honest.public),
        public_maid_bytes: honest.public.to_vec(),
        signature: impostor.sign(&challenge.challenge),
    };
    cairnd::connection::write_message(
        &mut stream,
        wire::wrap(MessageType::ChallengeResponse, &response).unwrap(),
    )
    .await
    .unwrap();

    // The supervisor drops us: the next read returns EOF or an error.
    let closed = tokio::time::timeout(
        Duration::from_secs(5),
        cairnd::connection::read_message(&mut stream),
    )
    .await;
    match closed {
        Ok(Ok(_)) => panic!("connection survived a forged signature"),
        Ok(Err(_)) | Err(_) => {}
    }

    supervisor.stop().await;
}

#[tokio::test]
async fn unvalidated_client_cannot_start_a_vault() {
    let supervisor = start_supervisor("unvalidated").await;

    let mut stream = TcpStream::connect(("127.0.0.1", supervisor.port))
        .await
        .expect("connect");
    let request = wire::StartVaultRequest {
        label: "sneaky".into(),
        vault_dir: None,
        max_disk_usage: None,
        pmid_list_index: None,
    };
    cairnd::connection::write_message(
        &mut stream,
        wire::wrap(MessageType::StartVaultRequest, &request).unwrap(),
    )
    .await
    .unwrap();

    let (message_type, payload) = tokio::time::timeout(
        Duration::from_secs(5),
        cairnd::connection::read_message(&mut stream),
    )
    .await
    .expect("response in time")
    .expect("readable response");
    assert_eq!(message_type, MessageType::VaultRunningResponse);
    let response: wire::VaultRunningResponse = wire::parse_payload(&payload).unwrap();
    assert_eq!(response.label, "sneaky");
    assert!(response.error.is_some());

    supervisor.stop().await;
}

#[tokio::test]
async fn vault_config_survives_supervisor_restart() {
    if !vault_binary_available() {
        return;
    }
    let root = temp_root("config-restart");

    let make_config = || {
        let mut config = CairnConfig::default();
        config.supervisor.root_dir = root.clone();
        config.supervisor.listener_port = 0;
        config.supervisor.vault_executable = vault_binary_path();
        config
    };

    // First run: create a vault.
    {
        let manager = VaultManager::start(make_config()).await.unwrap();
        let port = manager.listener_port();
        let shutdown = manager.event_sender();
        let task = tokio::spawn(manager.run());

        let keys = Keypair::generate();
        let mut client = ClientController::connect(port, keys).await.unwrap();
        let response = client
            .start_vault("persistent", None, Some(1 << 20))
            .await
            .unwrap();
        assert!(response.error.is_none());

        let _ = shutdown.send(Event::Shutdown);
        let _ = tokio::time::timeout(Duration::from_secs(20), task).await;
    }

    // Second run: the configured vault restarts from the config file.
    {
        let manager = VaultManager::start(make_config()).await.unwrap();
        let shutdown = manager.event_sender();
        let task = tokio::spawn(manager.run());

        // Give the restarted vault a moment to handshake, then stop.
        tokio::time::sleep(Duration::from_secs(2)).await;
        let _ = shutdown.send(Event::Shutdown);
        let _ = tokio::time::timeout(Duration::from_secs(20), task).await;
    }

    let config_file = root.join("vaults.cfg");
    assert!(config_file.exists());
    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&config_file).unwrap()).unwrap();
    assert_eq!(raw["vaults"][0]["label"], "persistent");

    let _ = std::fs::remove_dir_all(&root);
}

// ── Storage pipeline end to end ───────────────────────────────────────────────

#[test]
fn concurrent_clients_share_one_pipeline() {
    let root = temp_root("pipeline");
    let remote = cairn_store::create_local_chunk_store(
        root.join("buffer"),
        root.join("simulation"),
        root.join("locks"),
        Duration::ZERO,
    )
    .expect("pipeline");

    let mut handles = Vec::new();
    for worker in 0..4u8 {
        let remote = remote.clone();
        handles.push(std::thread::spawn(move || {
            let keys = Keypair::generate();
            for round in 0..5u8 {
                let content = Bytes::from(format!("worker {worker} round {round}"));
                let name = ChunkId::new(crypto::content_hash(&content).to_vec());
                assert!(remote.store(&name, content.clone(), None, &keys));
                assert_eq!(remote.get(&name, &keys), content);
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker");
    }

    assert!(remote.wait_for_completion());
    let stats = remote.stats();
    let store_index = cairn_store::OpType::Store as usize;
    assert_eq!(stats.success[store_index] + stats.skip[store_index], 20);

    let _ = std::fs::remove_dir_all(&root);
}
