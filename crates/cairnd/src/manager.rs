//! The vault supervisor.
//!
//! One event loop owns every piece of mutable state: the connection maps,
//! the process table and the config file. Reader/writer tasks, timers and
//! child monitors all communicate with it through the event channel, so no
//! handler ever races another.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cairn_core::config::CairnConfig;
use cairn_core::crypto;
use cairn_core::wire::{self, MessageType};
use cairn_core::{ChunkId, ChunkType, SignedData};
use cairn_store::RemoteChunkStore;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config_file::ConfigFileHandler;
use crate::connection::{self, Connection, Event};
use crate::connections::{ClientConnections, NewConnections};
use crate::dispatcher;
use crate::process::{ExitAction, ProcessManager, ProcessStatus, RESTART_DELAY, STOP_TIMEOUT};
use crate::vault_info::{PmidAndSigner, VaultInfo};

pub struct VaultManager {
    config: CairnConfig,
    config_file: ConfigFileHandler,
    listener_port: u16,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    connections: HashMap<u64, Connection>,
    new_connections: NewConnections,
    client_connections: ClientConnections,
    process_manager: ProcessManager,
    /// Local storage pipeline used to publish freshly minted vault
    /// identities as signature packets.
    pipeline: Option<Arc<RemoteChunkStore>>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl VaultManager {
    /// Bind the loopback listener, load the config file, and start every
    /// vault whose record asks to run.
    pub async fn start(config: CairnConfig) -> Result<Self> {
        let root = config.supervisor.root_dir.clone();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating supervisor root {}", root.display()))?;

        let config_file = ConfigFileHandler::open(config.vault_config_path())?;

        let listener = TcpListener::bind(("127.0.0.1", config.supervisor.listener_port))
            .await
            .context("binding loopback listener")?;
        let listener_port = listener.local_addr().context("listener address")?.port();
        tracing::info!(port = listener_port, "vault manager listening");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let accept_task = {
            let events = events_tx.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "connection accepted");
                            let connection = connection::spawn(stream, events.clone());
                            if events.send(Event::Accepted(connection)).is_err() {
                                return;
                            }
                        }
                        Err(error) => {
                            tracing::error!(%error, "accept failed");
                        }
                    }
                }
            })
        };

        let vault_executable = resolve_vault_executable(&config.supervisor.vault_executable);
        let process_manager =
            ProcessManager::new(vault_executable, listener_port, events_tx.clone());

        let pipeline = cairn_store::create_local_chunk_store(
            root.join("client-store"),
            root.join("client-network"),
            root.join("client-locks"),
            Duration::ZERO,
        );
        if pipeline.is_none() {
            tracing::warn!("identity publication pipeline unavailable");
        }

        let mut manager = Self {
            config,
            config_file,
            listener_port,
            events_tx,
            events_rx,
            connections: HashMap::new(),
            new_connections: NewConnections::default(),
            client_connections: ClientConnections::default(),
            process_manager,
            pipeline,
            accept_task,
        };

        for vault in manager.config_file.read()? {
            if vault.requested_to_run {
                if let Err(error) = manager.process_manager.add(vault) {
                    tracing::error!(%error, "failed to start configured vault");
                }
            }
        }

        Ok(manager)
    }

    pub fn listener_port(&self) -> u16 {
        self.listener_port
    }

    /// Sender half of the event channel; `Event::Shutdown` stops `run`.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<Event> {
        self.events_tx.clone()
    }

    /// Process events until shutdown, then tear everything down.
    pub async fn run(mut self) {
        while let Some(event) = self.events_rx.recv().await {
            if matches!(event, Event::Shutdown) {
                break;
            }
            self.handle_event(event);
        }
        self.tear_down(Duration::ZERO).await;
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Accepted(connection) => {
                self.connections.insert(connection.id(), connection.clone());
                self.new_connections
                    .add(connection, self.events_tx.clone());
            }
            Event::Message {
                connection_id,
                message_type,
                payload,
            } => self.handle_message(connection_id, message_type, payload),
            Event::ConnectionClosed(connection_id) => {
                self.handle_connection_closed(connection_id)
            }
            Event::NewConnectionExpired(connection_id) => {
                if let Some(connection) = self.new_connections.remove(connection_id) {
                    tracing::warn!(
                        connection = connection_id,
                        "connection never identified itself, closing"
                    );
                    connection.close();
                    self.connections.remove(&connection_id);
                }
            }
            Event::ChildExited {
                process_id,
                exit_code,
            } => self.handle_child_exited(process_id, exit_code),
            Event::ChildStopTimeout { process_id } => {
                let still_live = self
                    .process_manager
                    .record(process_id)
                    .map(|record| record.is_live())
                    .unwrap_or(false);
                if still_live {
                    self.process_manager.kill(process_id);
                }
            }
            Event::ChildRestartDue { process_id } => {
                let ready = self
                    .process_manager
                    .record(process_id)
                    .map(|record| record.status == ProcessStatus::Stopped && !record.stop_requested)
                    .unwrap_or(false);
                if ready {
                    if let Err(error) = self.process_manager.start(process_id) {
                        tracing::error!(%error, "vault restart failed");
                    }
                }
            }
            Event::Shutdown => {}
        }
    }

    fn handle_message(&mut self, connection_id: u64, message_type: MessageType, payload: Vec<u8>) {
        tracing::debug!(connection = connection_id, ?message_type, "message received");
        match message_type {
            MessageType::ValidateConnectionRequest => self.handle_validate_request(connection_id),
            MessageType::ChallengeResponse => {
                self.handle_challenge_response(connection_id, &payload)
            }
            MessageType::StartVaultRequest => self.handle_start_vault(connection_id, &payload),
            MessageType::TakeOwnershipRequest => {
                self.handle_take_ownership(connection_id, &payload)
            }
            MessageType::VaultStarted => self.handle_vault_started(connection_id, &payload),
            MessageType::JoinedNetwork => self.handle_joined_network(connection_id),
            MessageType::VaultShutdownResponse => {
                tracing::debug!(connection = connection_id, "vault acknowledged shutdown");
            }
            MessageType::LogMessage => self.handle_log_message(connection_id, &payload),
            other => {
                tracing::warn!(connection = connection_id, ?other, "unexpected message");
            }
        }
    }

    // ── Client-facing handlers ────────────────────────────────────────────────

    fn handle_validate_request(&mut self, connection_id: u64) {
        let Some(connection) = self.new_connections.remove(connection_id) else {
            tracing::warn!(
                connection = connection_id,
                "validation request from already-classified connection"
            );
            return;
        };
        let challenge = self.client_connections.add(connection.clone());
        dispatcher::send_challenge(&connection, challenge);
    }

    fn handle_challenge_response(&mut self, connection_id: u64, payload: &[u8]) {
        let response: wire::ChallengeResponse = match wire::parse_payload(payload) {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(connection = connection_id, %error, "bad challenge response");
                return;
            }
        };
        if !self.client_connections.validate(connection_id, &response) {
            self.connections.remove(&connection_id);
        }
    }

    fn handle_start_vault(&mut self, connection_id: u64, payload: &[u8]) {
        let Some(connection) = self.connections.get(&connection_id).cloned() else {
            return;
        };
        let request: wire::StartVaultRequest = match wire::parse_payload(payload) {
            Ok(request) => request,
            Err(error) => {
                tracing::error!(connection = connection_id, %error, "bad start vault request");
                return;
            }
        };

        if let Err(error) = self.try_start_vault(connection_id, &request) {
            tracing::error!(label = %request.label, %error, "start vault failed");
            dispatcher::send_vault_running_response(
                &connection,
                &request.label,
                None,
                Some(error.to_string()),
            );
        }
        // The success response goes out once the child completes its
        // handshake; see handle_vault_started.
    }

    fn try_start_vault(
        &mut self,
        connection_id: u64,
        request: &wire::StartVaultRequest,
    ) -> Result<()> {
        let client_name = self
            .client_connections
            .find_validated(connection_id)
            .context("request from unvalidated connection")?;

        if request.pmid_list_index.is_some() {
            tracing::debug!(label = %request.label, "pmid list index ignored, minting fresh identity");
        }
        let pmid_and_signer = PmidAndSigner::generate();
        self.publish_pmid(&pmid_and_signer);

        let chunkstore_path = match &request.vault_dir {
            Some(dir) => PathBuf::from(dir),
            None => self
                .config
                .supervisor
                .root_dir
                .join("vaults")
                .join(hex::encode(&pmid_and_signer.pmid.public[..8])),
        };
        std::fs::create_dir_all(&chunkstore_path)
            .with_context(|| format!("creating vault dir {}", chunkstore_path.display()))?;

        let info = VaultInfo {
            label: request.label.clone(),
            chunkstore_path,
            max_disk_usage: request.max_disk_usage.unwrap_or(0),
            owner_name: Some(client_name),
            pmid_and_signer,
            requested_to_run: true,
        };
        self.process_manager.add(info)?;
        self.write_config();
        Ok(())
    }

    /// Publish the public halves of a fresh identity as signature packets,
    /// retrying until the pipeline accepts them.
    fn publish_pmid(&self, keys: &PmidAndSigner) {
        let Some(pipeline) = &self.pipeline else {
            return;
        };
        for keypair in [&keys.pmid, &keys.anpmid] {
            let packet = SignedData::sign(keypair.public.to_vec(), keypair);
            let Ok(encoded) = packet.encode() else {
                tracing::error!("identity packet does not serialise");
                return;
            };
            let mut hashed = packet.data.clone();
            hashed.extend_from_slice(&packet.signature);
            let Some(name) = ChunkId::apply_type(
                &crypto::content_hash(&hashed),
                ChunkType::SignaturePacket,
            ) else {
                return;
            };

            let mut attempts = 0u32;
            while !pipeline.store(&name, bytes::Bytes::from(encoded.clone()), None, keypair) {
                // A partial earlier attempt may have landed the packet.
                if !pipeline.get(&name, keypair).is_empty() {
                    break;
                }
                attempts += 1;
                tracing::warn!(attempts, "identity publication refused, retrying");
                if attempts >= 10 {
                    tracing::error!("giving up on identity publication");
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        tracing::debug!("published vault identity packets");
    }

    fn handle_take_ownership(&mut self, connection_id: u64, payload: &[u8]) {
        let Some(connection) = self.connections.get(&connection_id).cloned() else {
            return;
        };
        let request: wire::TakeOwnershipRequest = match wire::parse_payload(payload) {
            Ok(request) => request,
            Err(error) => {
                tracing::error!(connection = connection_id, %error, "bad take ownership request");
                return;
            }
        };

        match self.try_take_ownership(connection_id, &request) {
            Ok(responded_now) => {
                if responded_now {
                    let pmid = self
                        .process_manager
                        .find_by_label(&request.label)
                        .map(|record| record.info.pmid_and_signer.clone());
                    dispatcher::send_vault_running_response(
                        &connection,
                        &request.label,
                        pmid.as_ref(),
                        None,
                    );
                }
            }
            Err(error) => {
                tracing::error!(label = %request.label, %error, "take ownership failed");
                dispatcher::send_vault_running_response(
                    &connection,
                    &request.label,
                    None,
                    Some(error.to_string()),
                );
            }
        }
    }

    /// Returns whether the response should be sent immediately (directory
    /// unchanged); a directory move defers it to the restarted handshake.
    fn try_take_ownership(
        &mut self,
        connection_id: u64,
        request: &wire::TakeOwnershipRequest,
    ) -> Result<bool> {
        let client_name = self
            .client_connections
            .find_validated(connection_id)
            .context("request from unvalidated connection")?;

        let record = self
            .process_manager
            .find_by_label(&request.label)
            .with_context(|| format!("no vault labelled {}", request.label))?;
        let process_id = record.id;
        let current_dir = record.info.chunkstore_path.clone();
        let current_max = record.info.max_disk_usage;
        let child_connection = record.connection.clone();

        let new_dir = PathBuf::from(&request.vault_dir);
        let mut info = record.info.clone();
        info.owner_name = Some(client_name);
        // Zero means "keep the current budget".
        info.max_disk_usage = if request.max_disk_usage != 0 {
            request.max_disk_usage
        } else {
            current_max
        };

        if new_dir != current_dir {
            // The vault must restart to move its chunkstore. The response
            // goes to the owner when the restarted child reports in.
            info.chunkstore_path = new_dir;
            self.process_manager.update_info(process_id, info);
            self.write_config();
            if let Some(child) = child_connection {
                dispatcher::send_vault_shutdown_request(&child);
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(STOP_TIMEOUT).await;
                    let _ = events.send(Event::ChildStopTimeout { process_id });
                });
            } else {
                self.process_manager.kill(process_id);
            }
            // stop_requested stays false, so the exit triggers a restart
            // with the new directory.
            return Ok(false);
        }

        if request.max_disk_usage != current_max && request.max_disk_usage != 0 {
            if let Some(child) = &child_connection {
                dispatcher::send_max_disk_usage_update(child, request.max_disk_usage);
            }
        }
        self.process_manager.update_info(process_id, info);
        self.write_config();
        Ok(true)
    }

    // ── Child-facing handlers ─────────────────────────────────────────────────

    fn handle_vault_started(&mut self, connection_id: u64, payload: &[u8]) {
        if self.new_connections.remove(connection_id).is_none() {
            tracing::warn!(connection = connection_id, "vault started from known connection");
        }
        let started: wire::VaultStarted = match wire::parse_payload(payload) {
            Ok(started) => started,
            Err(error) => {
                tracing::error!(connection = connection_id, %error, "bad vault started message");
                return;
            }
        };
        let Some(connection) = self.connections.get(&connection_id).cloned() else {
            return;
        };

        let Some(process_id) = self
            .process_manager
            .handle_vault_started(connection.clone(), started.process_id)
        else {
            tracing::error!(
                pid = started.process_id,
                "vault started for unknown process id"
            );
            connection.close();
            self.connections.remove(&connection_id);
            return;
        };

        let Some(record) = self.process_manager.record(process_id) else {
            return;
        };
        let label = record.info.label.clone();
        let owner = record.info.owner_name.clone();
        let pmid_and_signer = record.info.pmid_and_signer.clone();

        let sealed_pmid = match self.config_file.seal_pmid(&pmid_and_signer) {
            Ok(sealed) => sealed,
            Err(error) => {
                tracing::error!(%label, %error, "failed to seal credentials");
                return;
            }
        };
        dispatcher::send_vault_started_response(
            &connection,
            &wire::VaultStartedResponse {
                sealed_pmid,
                aes_key: self.config_file.aes_key().to_vec(),
                aes_nonce: self.config_file.aes_nonce().to_vec(),
                chunkstore_path: record.info.chunkstore_path.display().to_string(),
                max_disk_usage: record.info.max_disk_usage,
                bootstrap_contacts: self.config.network.bootstrap_contacts.clone(),
            },
        );
        tracing::info!(%label, pid = started.process_id, "vault started");

        // Tell the waiting owner its vault is up.
        if let Some(owner_name) = owner {
            if let Some(client) = self.client_connections.find_by_name(&owner_name) {
                dispatcher::send_vault_running_response(
                    &client,
                    &label,
                    Some(&pmid_and_signer),
                    None,
                );
            }
        }
    }

    fn handle_joined_network(&mut self, connection_id: u64) {
        let Some(process_id) = self.process_manager.handle_joined_network(connection_id) else {
            tracing::warn!(connection = connection_id, "joined network from unknown vault");
            return;
        };
        if let Some(record) = self.process_manager.record(process_id) {
            let message = format!(
                "vault {} running as {}",
                record.info.label,
                hex::encode(&record.info.pmid_and_signer.pmid.public[..8])
            );
            tracing::info!("{message}");
            self.forward_to_owner(process_id, message);
        }
    }

    fn handle_log_message(&mut self, connection_id: u64, payload: &[u8]) {
        let message: wire::LogMessage = match wire::parse_payload(payload) {
            Ok(message) => message,
            Err(_) => return,
        };
        tracing::info!(connection = connection_id, "vault: {}", message.message);
        if let Some(record) = self.process_manager.find_by_connection(connection_id) {
            let process_id = record.id;
            self.forward_to_owner(process_id, message.message);
        }
    }

    fn forward_to_owner(&self, process_id: u64, message: String) {
        let Some(record) = self.process_manager.record(process_id) else {
            return;
        };
        let Some(owner_name) = &record.info.owner_name else {
            return;
        };
        if let Some(client) = self.client_connections.find_by_name(owner_name) {
            dispatcher::send_log_message(&client, message);
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    fn handle_connection_closed(&mut self, connection_id: u64) {
        self.connections.remove(&connection_id);
        if let Some(record) = self.process_manager.find_by_connection(connection_id) {
            let process_id = record.id;
            let expected = record.stop_requested;
            tracing::warn!(label = %record.info.label, expected, "vault connection closed");
            if let Some(record) = self.process_manager.record_mut(process_id) {
                record.connection = None;
            }
            if !expected {
                // The process may still be alive with a dead control
                // channel; force it down so the exit path restarts it.
                self.process_manager.restart(process_id);
            }
            return;
        }
        if self.client_connections.remove(connection_id) {
            return;
        }
        self.new_connections.remove(connection_id);
    }

    fn handle_child_exited(&mut self, process_id: u64, exit_code: Option<i32>) {
        match self.process_manager.handle_exit(process_id, exit_code) {
            Some(ExitAction::Expected) | None => {}
            Some(ExitAction::Restart) => {
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(RESTART_DELAY).await;
                    let _ = events.send(Event::ChildRestartDue { process_id });
                });
            }
            Some(ExitAction::GiveUp) => {
                let label = self
                    .process_manager
                    .record(process_id)
                    .map(|record| record.info.label.clone())
                    .unwrap_or_default();
                self.forward_to_owner(
                    process_id,
                    format!("vault {label} failed and will not be restarted"),
                );
            }
        }
    }

    fn write_config(&self) {
        if let Err(error) = self.config_file.write(self.process_manager.all_infos()) {
            tracing::error!(%error, "failed to write config file");
        }
    }

    /// Stop listening, close every connection, ask each child to shut down
    /// and wait a bounded time per child; `interval` spaces the shutdowns
    /// to avoid a stampede.
    pub async fn tear_down(&mut self, interval: Duration) {
        tracing::info!("vault manager tearing down");
        self.accept_task.abort();
        self.new_connections.close_all();
        self.client_connections.close_all();

        for process_id in self.process_manager.live_ids() {
            if let Some(child) = self.process_manager.stop(process_id) {
                dispatcher::send_vault_shutdown_request(&child);
            } else {
                self.process_manager.kill(process_id);
            }
            self.wait_for_stop(process_id).await;
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }

        for connection in self.connections.values() {
            connection.close();
        }
        self.connections.clear();
    }

    /// Drain events until one child stops, bounded by [`STOP_TIMEOUT`].
    async fn wait_for_stop(&mut self, process_id: u64) {
        let deadline = tokio::time::Instant::now() + STOP_TIMEOUT;
        loop {
            let live = self
                .process_manager
                .record(process_id)
                .map(|record| record.is_live())
                .unwrap_or(false);
            if !live {
                return;
            }
            match tokio::time::timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) => return,
                Err(_) => {
                    tracing::warn!(process_id, "vault ignored shutdown, killing");
                    self.process_manager.kill(process_id);
                    return;
                }
            }
        }
    }
}

/// The vault binary: configured path, or `cairn-vault` next to the current
/// executable.
fn resolve_vault_executable(configured: &std::path::Path) -> PathBuf {
    if !configured.as_os_str().is_empty() {
        return configured.to_path_buf();
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("cairn-vault")))
        .unwrap_or_else(|| PathBuf::from("cairn-vault"))
}
