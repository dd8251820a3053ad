//! Persisted vault configuration.
//!
//! One file holds a per-installation AES key and nonce in the clear plus
//! the configured vault records, whose PMID credentials are sealed with
//! that key. The key pair is generated on first run and never rewritten.
//! Every save is whole-file atomic: write to a temp file, then rename.

use std::path::PathBuf;

use anyhow::{Context, Result};
use cairn_core::crypto::{self, Keypair};
use cairn_core::wire::SealedPmid;
use serde::{Deserialize, Serialize};

use crate::vault_info::{PmidAndSigner, VaultInfo};

#[derive(Serialize, Deserialize)]
struct ConfigEnvelope {
    aes_key: Vec<u8>,
    aes_nonce: Vec<u8>,
    vaults: Vec<StoredVault>,
}

#[derive(Serialize, Deserialize)]
struct StoredVault {
    label: String,
    chunkstore_path: PathBuf,
    max_disk_usage: u64,
    owner_name: Option<String>,
    requested_to_run: bool,
    /// `SealedPmid`, AES-sealed with the envelope's key and nonce.
    sealed_keys: Vec<u8>,
}

/// Loads, caches and atomically rewrites the vault config file.
pub struct ConfigFileHandler {
    path: PathBuf,
    aes_key: Vec<u8>,
    aes_nonce: Vec<u8>,
}

impl ConfigFileHandler {
    /// Open an existing config file or create an empty one with fresh key
    /// material.
    pub fn open(path: PathBuf) -> Result<Self> {
        if path.exists() {
            let envelope = Self::parse(&path)?;
            Ok(Self {
                path,
                aes_key: envelope.aes_key,
                aes_nonce: envelope.aes_nonce,
            })
        } else {
            let handler = Self {
                path,
                aes_key: crypto::random_bytes(crypto::AES_KEY_SIZE),
                aes_nonce: crypto::random_bytes(crypto::AES_NONCE_SIZE),
            };
            handler.write(Vec::new())?;
            tracing::info!(path = %handler.path.display(), "created config file");
            Ok(handler)
        }
    }

    pub fn aes_key(&self) -> &[u8] {
        &self.aes_key
    }

    pub fn aes_nonce(&self) -> &[u8] {
        &self.aes_nonce
    }

    /// Seal a PMID bundle the way the config file does; also used for the
    /// credentials sent to a starting vault.
    pub fn seal_pmid(&self, keys: &PmidAndSigner) -> Result<Vec<u8>> {
        let sealed = SealedPmid {
            pmid_private: *keys.pmid.private_bytes(),
            anpmid_private: *keys.anpmid.private_bytes(),
        };
        let plain = serde_json::to_vec(&sealed).context("serialising credentials")?;
        crypto::seal(&self.aes_key, &self.aes_nonce, &plain)
            .map_err(|e| anyhow::anyhow!("sealing credentials: {e}"))
    }

    fn parse(path: &PathBuf) -> Result<ConfigEnvelope> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// All configured vaults, credentials unsealed.
    pub fn read(&self) -> Result<Vec<VaultInfo>> {
        let envelope = Self::parse(&self.path)?;
        let mut vaults = Vec::new();
        for stored in envelope.vaults {
            let plain = crypto::open(&self.aes_key, &self.aes_nonce, &stored.sealed_keys)
                .map_err(|e| anyhow::anyhow!("unsealing credentials for {}: {e}", stored.label))?;
            let sealed: SealedPmid =
                serde_json::from_slice(&plain).context("parsing unsealed credentials")?;
            vaults.push(VaultInfo {
                label: stored.label,
                chunkstore_path: stored.chunkstore_path,
                max_disk_usage: stored.max_disk_usage,
                owner_name: stored.owner_name,
                pmid_and_signer: PmidAndSigner {
                    pmid: Keypair::from_private(sealed.pmid_private),
                    anpmid: Keypair::from_private(sealed.anpmid_private),
                },
                requested_to_run: stored.requested_to_run,
            });
        }
        Ok(vaults)
    }

    /// Replace the stored vault list.
    pub fn write(&self, vaults: Vec<&VaultInfo>) -> Result<()> {
        let mut stored = Vec::with_capacity(vaults.len());
        for vault in vaults {
            stored.push(StoredVault {
                label: vault.label.clone(),
                chunkstore_path: vault.chunkstore_path.clone(),
                max_disk_usage: vault.max_disk_usage,
                owner_name: vault.owner_name.clone(),
                requested_to_run: vault.requested_to_run,
                sealed_keys: self.seal_pmid(&vault.pmid_and_signer)?,
            });
        }
        let envelope = ConfigEnvelope {
            aes_key: self.aes_key.clone(),
            aes_nonce: self.aes_nonce.clone(),
            vaults: stored,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config dir {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(&envelope).context("serialising config")?;
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, bytes)
            .with_context(|| format!("writing config file {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming config file into {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_path() -> PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "cairn-config-{}-{}/vaults.cfg",
            std::process::id(),
            id
        ))
    }

    fn sample_vault(label: &str) -> VaultInfo {
        VaultInfo {
            label: label.to_string(),
            chunkstore_path: PathBuf::from("/tmp/chunkstore"),
            max_disk_usage: 1 << 30,
            owner_name: Some("maid-owner".into()),
            pmid_and_signer: PmidAndSigner::generate(),
            requested_to_run: true,
        }
    }

    #[test]
    fn fresh_file_gets_key_material() {
        let path = temp_path();
        let handler = ConfigFileHandler::open(path.clone()).unwrap();
        assert!(path.exists());
        assert_eq!(handler.aes_key().len(), crypto::AES_KEY_SIZE);
        assert_eq!(handler.aes_nonce().len(), crypto::AES_NONCE_SIZE);
        assert!(handler.read().unwrap().is_empty());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn key_material_survives_reopen() {
        let path = temp_path();
        let (key, nonce) = {
            let handler = ConfigFileHandler::open(path.clone()).unwrap();
            (handler.aes_key().to_vec(), handler.aes_nonce().to_vec())
        };
        let handler = ConfigFileHandler::open(path.clone()).unwrap();
        assert_eq!(handler.aes_key(), key.as_slice());
        assert_eq!(handler.aes_nonce(), nonce.as_slice());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn vaults_round_trip_with_sealed_credentials() {
        let path = temp_path();
        let handler = ConfigFileHandler::open(path.clone()).unwrap();
        let vault = sample_vault("vault1");
        let pmid_public = vault.pmid_and_signer.pmid.public;
        handler.write(vec![&vault]).unwrap();

        // Credentials are not on disk in the clear.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains(&hex::encode(vault.pmid_and_signer.pmid.private_bytes().as_slice())));

        let restored = handler.read().unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].label, "vault1");
        assert_eq!(restored[0].max_disk_usage, 1 << 30);
        assert_eq!(restored[0].owner_name.as_deref(), Some("maid-owner"));
        assert_eq!(restored[0].pmid_and_signer.pmid.public, pmid_public);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn corrupt_file_fails_to_open() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not a config").unwrap();
        assert!(ConfigFileHandler::open(path.clone()).is_err());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn tampered_credentials_fail_to_unseal() {
        let path = temp_path();
        let handler = ConfigFileHandler::open(path.clone()).unwrap();
        handler.write(vec![&sample_vault("vault1")]).unwrap();

        let mut raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        raw["vaults"][0]["sealed_keys"][0] =
            serde_json::Value::from(raw["vaults"][0]["sealed_keys"][0].as_u64().unwrap() ^ 0xff);
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        assert!(handler.read().is_err());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
