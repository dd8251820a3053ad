//! cairnd — the vault supervisor.
//!
//! Spawns and monitors vault processes, persists their encrypted
//! configuration, and mediates credentialed control-plane requests over a
//! loopback transport.

pub mod client;
pub mod config_file;
pub mod connection;
pub mod connections;
pub mod dispatcher;
pub mod manager;
pub mod process;
pub mod vault_info;

pub use client::ClientController;
pub use config_file::ConfigFileHandler;
pub use manager::VaultManager;
pub use process::{ProcessManager, ProcessStatus};
pub use vault_info::{PmidAndSigner, VaultInfo};
