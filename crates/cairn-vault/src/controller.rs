//! Child-side vault controller.
//!
//! Runs inside each vault process. Connects back to the supervisor on the
//! loopback port passed on the command line, reports its pid, receives its
//! credentials, and obeys shutdown requests by invoking a stop callback
//! installed by the host process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cairn_core::crypto::{self, Keypair};
use cairn_core::wire::{self, MessageType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};

/// Bound on waiting for the supervisor to deliver credentials.
pub const IDENTITY_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on retrying the shutdown acknowledgement.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a vault needs to run, as delivered by the supervisor.
#[derive(Clone)]
pub struct VaultCredentials {
    pub pmid: Arc<Keypair>,
    pub anpmid: Arc<Keypair>,
    pub chunkstore_path: PathBuf,
    pub max_disk_usage: u64,
    pub bootstrap_contacts: Vec<String>,
}

pub type StopCallback = Box<dyn Fn() + Send + Sync>;

struct ControllerState {
    credentials: watch::Receiver<Option<VaultCredentials>>,
    max_disk_usage: watch::Receiver<u64>,
    shutdown: Arc<Notify>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// Handle to the controller; the host process keeps one for the lifetime
/// of the vault.
pub struct VaultController {
    state: ControllerState,
}

impl VaultController {
    /// Connect to the supervisor, report the pid, and start the message
    /// loop. `on_stop` runs when the supervisor requests shutdown.
    pub async fn start(vm_port: u16, label: &str, on_stop: StopCallback) -> Result<Self> {
        let mut stream = TcpStream::connect(("127.0.0.1", vm_port))
            .await
            .context("connecting to vault manager")?;
        tracing::info!(port = vm_port, label, "connected to vault manager");

        let started = wire::wrap(
            MessageType::VaultStarted,
            &wire::VaultStarted {
                process_id: std::process::id(),
            },
        )?;
        write_frame(&mut stream, started).await?;

        let (credentials_tx, credentials_rx) = watch::channel(None);
        let (max_tx, max_rx) = watch::channel(0u64);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let shutdown = Arc::new(Notify::new());

        let (mut read_half, mut write_half) = stream.into_split();

        // Writer: flush queued frames.
        tokio::spawn(async move {
            while let Some(body) = outbound_rx.recv().await {
                let Ok(frame) = wire::encode_frame(body) else {
                    continue;
                };
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        // Reader: handle supervisor messages for the life of the process.
        {
            let shutdown = shutdown.clone();
            let outbound = outbound_tx.clone();
            tokio::spawn(async move {
                loop {
                    let mut header = [0u8; wire::FRAME_HEADER_SIZE];
                    if read_half.read_exact(&mut header).await.is_err() {
                        break;
                    }
                    let length = u32::from_be_bytes(header) as usize;
                    if length > wire::MAX_FRAME_SIZE {
                        break;
                    }
                    let mut body = vec![0u8; length];
                    if read_half.read_exact(&mut body).await.is_err() {
                        break;
                    }
                    let Ok((message_type, payload)) = wire::unwrap(&body) else {
                        continue;
                    };
                    match message_type {
                        MessageType::VaultStartedResponse => {
                            match decode_credentials(&payload) {
                                Ok(credentials) => {
                                    let _ = max_tx.send(credentials.max_disk_usage);
                                    let _ = credentials_tx.send(Some(credentials));
                                }
                                Err(error) => {
                                    tracing::error!(%error, "bad credentials from supervisor");
                                }
                            }
                        }
                        MessageType::MaxDiskUsageUpdate => {
                            if let Ok(update) =
                                wire::parse_payload::<wire::MaxDiskUsageUpdate>(&payload)
                            {
                                tracing::info!(max = update.max_disk_usage, "disk budget updated");
                                let _ = max_tx.send(update.max_disk_usage);
                            }
                        }
                        MessageType::VaultShutdownRequest => {
                            tracing::info!("shutdown requested by supervisor");
                            on_stop();
                            shutdown.notify_waiters();
                            // Acknowledge until the supervisor hangs up.
                            let outbound = outbound.clone();
                            tokio::spawn(async move {
                                let deadline = tokio::time::Instant::now() + RPC_TIMEOUT;
                                while tokio::time::Instant::now() < deadline {
                                    let Ok(body) =
                                        wire::wrap_empty(MessageType::VaultShutdownResponse)
                                    else {
                                        return;
                                    };
                                    if outbound.send(body).is_err() {
                                        return;
                                    }
                                    tokio::time::sleep(Duration::from_secs(1)).await;
                                }
                            });
                        }
                        other => {
                            tracing::debug!(?other, "unhandled supervisor message");
                        }
                    }
                }
                tracing::warn!("supervisor connection closed");
                shutdown.notify_waiters();
            });
        }

        Ok(Self {
            state: ControllerState {
                credentials: credentials_rx,
                max_disk_usage: max_rx,
                shutdown,
                outbound: outbound_tx,
            },
        })
    }

    /// The vault's credentials, waiting up to [`IDENTITY_WAIT_TIMEOUT`]
    /// for the supervisor to deliver them.
    pub async fn identity(&self) -> Option<VaultCredentials> {
        let mut credentials = self.state.credentials.clone();
        let wait = tokio::time::timeout(IDENTITY_WAIT_TIMEOUT, async {
            loop {
                if let Some(credentials) = credentials.borrow().clone() {
                    return credentials;
                }
                if credentials.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        });
        wait.await.ok()
    }

    /// Current disk budget; follows `MaxDiskUsageUpdate`s.
    pub fn max_disk_usage(&self) -> u64 {
        *self.state.max_disk_usage.borrow()
    }

    /// Tell the supervisor the vault's application layer is up.
    pub fn notify_joined_network(&self) {
        if let Ok(body) = wire::wrap_empty(MessageType::JoinedNetwork) {
            let _ = self.state.outbound.send(body);
        }
    }

    /// Forward a log line to the supervisor (and on to the owner).
    pub fn send_log_message(&self, message: String) {
        if let Ok(body) = wire::wrap(MessageType::LogMessage, &wire::LogMessage { message }) {
            let _ = self.state.outbound.send(body);
        }
    }

    /// Resolves when the supervisor requests shutdown or hangs up.
    pub async fn wait_for_shutdown(&self) {
        self.state.shutdown.notified().await;
    }
}

fn decode_credentials(payload: &[u8]) -> Result<VaultCredentials> {
    let response: wire::VaultStartedResponse = wire::parse_payload(payload)?;
    let plain = crypto::open(&response.aes_key, &response.aes_nonce, &response.sealed_pmid)
        .map_err(|e| anyhow::anyhow!("unsealing credentials: {e}"))?;
    let sealed: wire::SealedPmid =
        serde_json::from_slice(&plain).context("parsing unsealed credentials")?;
    Ok(VaultCredentials {
        pmid: Arc::new(Keypair::from_private(sealed.pmid_private)),
        anpmid: Arc::new(Keypair::from_private(sealed.anpmid_private)),
        chunkstore_path: PathBuf::from(response.chunkstore_path),
        max_disk_usage: response.max_disk_usage,
        bootstrap_contacts: response.bootstrap_contacts,
    })
}

async fn write_frame(stream: &mut TcpStream, body: Vec<u8>) -> Result<()> {
    let frame = wire::encode_frame(body)?;
    stream.write_all(&frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_decode_from_a_sealed_response() {
        let pmid = Keypair::generate();
        let anpmid = Keypair::generate();
        let aes_key = crypto::random_bytes(crypto::AES_KEY_SIZE);
        let aes_nonce = crypto::random_bytes(crypto::AES_NONCE_SIZE);

        let sealed = wire::SealedPmid {
            pmid_private: *pmid.private_bytes(),
            anpmid_private: *anpmid.private_bytes(),
        };
        let sealed_pmid = crypto::seal(
            &aes_key,
            &aes_nonce,
            &serde_json::to_vec(&sealed).unwrap(),
        )
        .unwrap();

        let response = wire::VaultStartedResponse {
            sealed_pmid,
            aes_key,
            aes_nonce,
            chunkstore_path: "/tmp/vault-chunks".into(),
            max_disk_usage: 42,
            bootstrap_contacts: vec!["10.0.0.1:5483".into()],
        };
        let payload = serde_json::to_vec(&response).unwrap();

        let credentials = decode_credentials(&payload).unwrap();
        assert_eq!(credentials.pmid.public, pmid.public);
        assert_eq!(credentials.anpmid.public, anpmid.public);
        assert_eq!(credentials.chunkstore_path, PathBuf::from("/tmp/vault-chunks"));
        assert_eq!(credentials.max_disk_usage, 42);
        assert_eq!(credentials.bootstrap_contacts.len(), 1);
    }

    #[test]
    fn tampered_credentials_are_rejected() {
        let pmid = Keypair::generate();
        let aes_key = crypto::random_bytes(crypto::AES_KEY_SIZE);
        let aes_nonce = crypto::random_bytes(crypto::AES_NONCE_SIZE);
        let sealed = wire::SealedPmid {
            pmid_private: *pmid.private_bytes(),
            anpmid_private: *pmid.private_bytes(),
        };
        let mut sealed_pmid = crypto::seal(
            &aes_key,
            &aes_nonce,
            &serde_json::to_vec(&sealed).unwrap(),
        )
        .unwrap();
        sealed_pmid[0] ^= 0xff;

        let response = wire::VaultStartedResponse {
            sealed_pmid,
            aes_key,
            aes_nonce,
            chunkstore_path: "/tmp/vault-chunks".into(),
            max_disk_usage: 0,
            bootstrap_contacts: Vec::new(),
        };
        let payload = serde_json::to_vec(&response).unwrap();
        assert!(decode_credentials(&payload).is_err());
    }
}
