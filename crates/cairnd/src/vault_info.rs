//! Runtime description of one configured vault.

use std::path::PathBuf;

use cairn_core::crypto::Keypair;
use cairn_core::wire;

/// A vault identity: the PMID keypair plus the ANPMID credential that
/// signs it.
pub struct PmidAndSigner {
    pub pmid: Keypair,
    pub anpmid: Keypair,
}

impl PmidAndSigner {
    pub fn generate() -> Self {
        Self {
            pmid: Keypair::generate(),
            anpmid: Keypair::generate(),
        }
    }

    pub fn to_wire(&self) -> wire::PmidAndSigner {
        wire::PmidAndSigner {
            pmid: wire::WireKeypair {
                public: self.pmid.public.to_vec(),
                private: self.pmid.private_bytes().to_vec(),
            },
            anpmid: wire::WireKeypair {
                public: self.anpmid.public.to_vec(),
                private: self.anpmid.private_bytes().to_vec(),
            },
        }
    }
}

impl Clone for PmidAndSigner {
    fn clone(&self) -> Self {
        Self {
            pmid: self.pmid.clone(),
            anpmid: self.anpmid.clone(),
        }
    }
}

/// One configured vault, as the supervisor sees it at runtime.
pub struct VaultInfo {
    pub label: String,
    pub chunkstore_path: PathBuf,
    pub max_disk_usage: u64,
    /// Validated client that owns this vault; empty until claimed.
    pub owner_name: Option<String>,
    pub pmid_and_signer: PmidAndSigner,
    pub requested_to_run: bool,
}

impl Clone for VaultInfo {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            chunkstore_path: self.chunkstore_path.clone(),
            max_disk_usage: self.max_disk_usage,
            owner_name: self.owner_name.clone(),
            pmid_and_signer: self.pmid_and_signer.clone(),
            requested_to_run: self.requested_to_run,
        }
    }
}
