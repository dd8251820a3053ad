//! Vault process manager.
//!
//! Owns the table of configured vault processes: spawning, cooperative
//! stop, unconditional kill, and crash-restart policy. Runs entirely on
//! the supervisor's event loop; child exits arrive as events from the
//! per-child monitor tasks.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, oneshot};

use crate::connection::{Connection, Event};
use crate::vault_info::VaultInfo;

/// Pause before respawning a crashed child.
pub const RESTART_DELAY: Duration = Duration::from_millis(600);

/// Consecutive restarts tolerated before a vault is declared failed.
pub const MAX_RESTARTS: u32 = 4;

/// Bounded wait for a cooperative stop before the child is killed.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(3);

pub type ProcessId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Spawned, handshake not yet seen.
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Crashed past the restart cap.
    Failed,
}

/// What the supervisor should do about a child exit.
#[derive(Debug, PartialEq, Eq)]
pub enum ExitAction {
    /// The stop was requested; nothing to do.
    Expected,
    /// Crash within the restart budget: respawn after [`RESTART_DELAY`].
    Restart,
    /// Restart cap exceeded: report the failure to the owner.
    GiveUp,
}

pub struct ProcessRecord {
    pub id: ProcessId,
    pub info: VaultInfo,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    /// The child's loopback connection, once it has sent `VaultStarted`.
    pub connection: Option<Connection>,
    pub stop_requested: bool,
    pub restart_count: u32,
    pub joined_network: bool,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessRecord {
    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            ProcessStatus::Starting | ProcessStatus::Running | ProcessStatus::Stopping
        )
    }
}

pub struct ProcessManager {
    records: Vec<ProcessRecord>,
    next_id: ProcessId,
    vault_executable: PathBuf,
    listener_port: u16,
    events: mpsc::UnboundedSender<Event>,
}

impl ProcessManager {
    pub fn new(
        vault_executable: PathBuf,
        listener_port: u16,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            records: Vec::new(),
            next_id: 1,
            vault_executable,
            listener_port,
            events,
        }
    }

    /// Register a vault and start its process. Labels are unique.
    pub fn add(&mut self, info: VaultInfo) -> Result<ProcessId> {
        if info.label.is_empty() {
            bail!("vault label must not be empty");
        }
        if info.chunkstore_path.as_os_str().is_empty() {
            bail!("vault chunkstore path must not be empty");
        }
        if self.records.iter().any(|r| r.info.label == info.label) {
            bail!("vault label {} already exists", info.label);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.records.push(ProcessRecord {
            id,
            info,
            status: ProcessStatus::Stopped,
            pid: None,
            connection: None,
            stop_requested: false,
            restart_count: 0,
            joined_network: false,
            kill: None,
        });
        self.start(id)?;
        Ok(id)
    }

    /// Spawn the vault executable for a registered record.
    pub fn start(&mut self, id: ProcessId) -> Result<()> {
        let listener_port = self.listener_port;
        let executable = self.vault_executable.clone();
        let events = self.events.clone();
        let record = self
            .record_mut(id)
            .context("starting unknown vault process")?;
        if record.is_live() {
            bail!("vault process {} already running", record.info.label);
        }

        let mut child = tokio::process::Command::new(&executable)
            .arg("--vm-port")
            .arg(listener_port.to_string())
            .arg("--vault-label")
            .arg(&record.info.label)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning vault executable {}", executable.display()))?;

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        record.pid = pid;
        record.status = ProcessStatus::Starting;
        record.stop_requested = false;
        record.connection = None;
        record.joined_network = false;
        record.kill = Some(kill_tx);
        tracing::info!(label = %record.info.label, pid, "vault process spawned");

        tokio::spawn(async move {
            let exit_code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await.ok().and_then(|s| s.code())
                }
            };
            let _ = events.send(Event::ChildExited {
                process_id: id,
                exit_code,
            });
        });
        Ok(())
    }

    /// Cooperative stop: mark the record, let the caller send the shutdown
    /// request, and arm the kill fallback.
    pub fn stop(&mut self, id: ProcessId) -> Option<Connection> {
        let events = self.events.clone();
        let record = self.record_mut(id)?;
        if !record.is_live() {
            return None;
        }
        record.stop_requested = true;
        record.status = ProcessStatus::Stopping;
        let connection = record.connection.clone();

        // If the child ignores the request, the fallback kills it.
        tokio::spawn(async move {
            tokio::time::sleep(STOP_TIMEOUT).await;
            let _ = events.send(Event::ChildStopTimeout { process_id: id });
        });
        connection
    }

    /// Unconditional termination.
    pub fn kill(&mut self, id: ProcessId) {
        if let Some(record) = self.record_mut(id) {
            record.stop_requested = true;
            if let Some(kill) = record.kill.take() {
                tracing::warn!(label = %record.info.label, "killing vault process");
                let _ = kill.send(());
            }
        }
    }

    /// Kill and respawn (exit handling performs the actual respawn since
    /// `stop_requested` stays false).
    pub fn restart(&mut self, id: ProcessId) {
        if let Some(record) = self.record_mut(id) {
            record.stop_requested = false;
            if let Some(kill) = record.kill.take() {
                let _ = kill.send(());
            }
        }
    }

    /// Stop tracking liveness: an exit will not trigger a restart.
    pub fn let_die(&mut self, id: ProcessId) {
        if let Some(record) = self.record_mut(id) {
            record.stop_requested = true;
        }
    }

    pub fn let_all_die(&mut self) {
        for record in &mut self.records {
            record.stop_requested = true;
        }
    }

    /// True once no record refers to a running process.
    pub fn all_stopped(&self) -> bool {
        self.records.iter().all(|record| !record.is_live())
    }

    pub fn status(&self, id: ProcessId) -> Option<ProcessStatus> {
        self.records
            .iter()
            .find(|record| record.id == id)
            .map(|record| record.status)
    }

    /// Digest a child exit into the action the supervisor should take.
    pub fn handle_exit(&mut self, id: ProcessId, exit_code: Option<i32>) -> Option<ExitAction> {
        let record = self.record_mut(id)?;
        record.pid = None;
        record.connection = None;
        record.kill = None;
        tracing::info!(label = %record.info.label, ?exit_code, "vault process exited");

        if record.stop_requested {
            record.status = ProcessStatus::Stopped;
            return Some(ExitAction::Expected);
        }

        record.restart_count += 1;
        if record.restart_count > MAX_RESTARTS {
            tracing::error!(
                label = %record.info.label,
                restarts = record.restart_count,
                "vault keeps crashing, giving up"
            );
            record.status = ProcessStatus::Failed;
            return Some(ExitAction::GiveUp);
        }
        record.status = ProcessStatus::Stopped;
        Some(ExitAction::Restart)
    }

    /// A child reported in with its pid: bind the connection to its record.
    pub fn handle_vault_started(&mut self, connection: Connection, pid: u32) -> Option<ProcessId> {
        let record = self
            .records
            .iter_mut()
            .find(|record| record.pid == Some(pid) && record.status == ProcessStatus::Starting)?;
        record.connection = Some(connection);
        record.status = ProcessStatus::Running;
        Some(record.id)
    }

    /// The vault's application layer is up; the crash counter resets so a
    /// later crash starts a fresh restart budget.
    pub fn handle_joined_network(&mut self, connection_id: u64) -> Option<ProcessId> {
        let record = self.records.iter_mut().find(|record| {
            record
                .connection
                .as_ref()
                .map(|c| c.id() == connection_id)
                .unwrap_or(false)
        })?;
        record.joined_network = true;
        record.restart_count = 0;
        Some(record.id)
    }

    pub fn record(&self, id: ProcessId) -> Option<&ProcessRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    pub fn record_mut(&mut self, id: ProcessId) -> Option<&mut ProcessRecord> {
        self.records.iter_mut().find(|record| record.id == id)
    }

    pub fn find_by_label(&self, label: &str) -> Option<&ProcessRecord> {
        self.records.iter().find(|record| record.info.label == label)
    }

    pub fn find_by_connection(&self, connection_id: u64) -> Option<&ProcessRecord> {
        self.records.iter().find(|record| {
            record
                .connection
                .as_ref()
                .map(|c| c.id() == connection_id)
                .unwrap_or(false)
        })
    }

    pub fn update_info(&mut self, id: ProcessId, info: VaultInfo) {
        if let Some(record) = self.record_mut(id) {
            record.info = info;
        }
    }

    pub fn all_records(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.records.iter()
    }

    pub fn all_infos(&self) -> Vec<&VaultInfo> {
        self.records.iter().map(|record| &record.info).collect()
    }

    pub fn live_ids(&self) -> Vec<ProcessId> {
        self.records
            .iter()
            .filter(|record| record.is_live())
            .map(|record| record.id)
            .collect()
    }
}
