//! Chunk managers — the seam between the scheduler and the network.
//!
//! A `ChunkManager` executes storage verbs against the backend and reports
//! each completion through one of four signals. `LocalChunkManager`
//! simulates the networked backend against a CAA-guarded file store on
//! local disk, with a cross-process lock-record protocol for modifies.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use cairn_core::crypto::Keypair;
use cairn_core::{crypto, ChunkId, SignedData};
use parking_lot::{Mutex, RwLock};

use crate::authority::{self, ChunkActionAuthority};
use crate::store::{BufferedChunkStore, ChunkStore, FileChunkStore, ThreadsafeChunkStore};

/// A lock record older than this is stale and may be overwritten.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Length of a lock record's transaction id.
const LOCK_TRANSACTION_ID_LEN: usize = 32;

/// Completion verdict delivered with each signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    Success,
    /// `get_and_lock` found the local version already current.
    NotModified,
    GetFailure,
    StoreFailure,
    ModifyFailure,
    DeleteFailure,
}

impl OpResult {
    pub fn is_success(self) -> bool {
        matches!(self, OpResult::Success)
    }
}

pub type OpResultHandler = Arc<dyn Fn(&ChunkId, OpResult) + Send + Sync>;

/// The four completion signals every manager emits.
#[derive(Default)]
pub struct ManagerSignals {
    handlers: RwLock<Handlers>,
}

#[derive(Default)]
struct Handlers {
    got: Vec<OpResultHandler>,
    stored: Vec<OpResultHandler>,
    modified: Vec<OpResultHandler>,
    deleted: Vec<OpResultHandler>,
}

impl ManagerSignals {
    pub fn on_chunk_got(&self, handler: OpResultHandler) {
        self.handlers.write().got.push(handler);
    }

    pub fn on_chunk_stored(&self, handler: OpResultHandler) {
        self.handlers.write().stored.push(handler);
    }

    pub fn on_chunk_modified(&self, handler: OpResultHandler) {
        self.handlers.write().modified.push(handler);
    }

    pub fn on_chunk_deleted(&self, handler: OpResultHandler) {
        self.handlers.write().deleted.push(handler);
    }

    pub fn emit_got(&self, name: &ChunkId, result: OpResult) {
        for handler in self.handlers.read().got.iter() {
            handler(name, result);
        }
    }

    pub fn emit_stored(&self, name: &ChunkId, result: OpResult) {
        for handler in self.handlers.read().stored.iter() {
            handler(name, result);
        }
    }

    pub fn emit_modified(&self, name: &ChunkId, result: OpResult) {
        for handler in self.handlers.read().modified.iter() {
            handler(name, result);
        }
    }

    pub fn emit_deleted(&self, name: &ChunkId, result: OpResult) {
        for handler in self.handlers.read().deleted.iter() {
            handler(name, result);
        }
    }
}

/// Backend executor for the remote chunk store. Verbs complete by emitting
/// the matching signal with `(name, result)`; they never return values.
pub trait ChunkManager: Send + Sync {
    fn get_chunk(&self, name: &ChunkId, local_version: Option<Vec<u8>>, keys: &Keypair, lock: bool);
    fn store_chunk(&self, name: &ChunkId, keys: &Keypair);
    fn delete_chunk(&self, name: &ChunkId, keys: &Keypair);
    fn modify_chunk(&self, name: &ChunkId, content: Bytes, keys: &Keypair);
    fn signals(&self) -> &ManagerSignals;
}

/// Simulates the remote backend with a second, CAA-guarded file store.
///
/// Gets optionally take a cross-process lock: a record file under
/// `lock_directory` named by the base-32 chunk name, containing
/// `"<unix_seconds> <transaction id>"`. The matching `modify_chunk`
/// consumes the record. Records older than [`LOCK_TIMEOUT`] are stale.
pub struct LocalChunkManager {
    local_store: Arc<BufferedChunkStore>,
    simulation: ChunkActionAuthority,
    simulation_store: Arc<dyn ChunkStore>,
    signals: ManagerSignals,
    lock_directory: PathBuf,
    current_transactions: Mutex<HashMap<ChunkId, String>>,
    get_delay: Duration,
    action_delay: Duration,
}

impl LocalChunkManager {
    /// `get_delay` is an artificial per-get pause for testability; mutating
    /// verbs pause three times as long. Zero disables both.
    pub fn open(
        local_store: Arc<BufferedChunkStore>,
        simulation_directory: impl Into<PathBuf>,
        lock_directory: impl Into<PathBuf>,
        get_delay: Duration,
    ) -> Option<Self> {
        let lock_directory = lock_directory.into();
        if let Err(e) = std::fs::create_dir_all(&lock_directory) {
            tracing::error!(error = %e, "failed to create lock directory");
            return None;
        }

        let file_store = FileChunkStore::open(simulation_directory, 5)?;
        let simulation_store: Arc<dyn ChunkStore> =
            Arc::new(ThreadsafeChunkStore::new(file_store));

        Some(Self {
            local_store,
            simulation: ChunkActionAuthority::new(simulation_store.clone()),
            simulation_store,
            signals: ManagerSignals::default(),
            lock_directory,
            current_transactions: Mutex::new(HashMap::new()),
            get_delay,
            action_delay: get_delay * 3,
        })
    }

    pub fn storage_size(&self) -> u64 {
        self.simulation_store.size()
    }

    pub fn storage_capacity(&self) -> u64 {
        self.simulation_store.capacity()
    }

    fn lock_file(&self, name: &ChunkId) -> PathBuf {
        self.lock_directory.join(name.to_base32())
    }

    fn unix_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Wait for any live lock record to expire, then write our own.
    fn acquire_lock_record(&self, name: &ChunkId) {
        let path = self.lock_file(name);
        while path.exists() {
            let timestamp = std::fs::read_to_string(&path)
                .ok()
                .and_then(|content| {
                    content
                        .split_whitespace()
                        .next()
                        .and_then(|t| t.parse::<u64>().ok())
                });
            match timestamp {
                Some(timestamp) if Self::unix_now() <= timestamp + LOCK_TIMEOUT.as_secs() => {
                    tracing::debug!(chunk = %name, "lock record held, waiting");
                    std::thread::sleep(Duration::from_secs(1));
                }
                // Stale or unreadable: take it over.
                _ => break,
            }
        }

        let transaction_id = crypto::random_alphanumeric(LOCK_TRANSACTION_ID_LEN);
        let record = format!("{} {}", Self::unix_now(), transaction_id);
        if let Err(e) = std::fs::write(&path, record) {
            tracing::error!(chunk = %name, error = %e, "failed to write lock record");
            return;
        }
        self.current_transactions
            .lock()
            .insert(name.clone(), transaction_id);
        tracing::debug!(chunk = %name, "wrote lock record");
    }

    /// Delete our lock record, if the one on disk is still ours.
    fn consume_lock_record(&self, name: &ChunkId) {
        let path = self.lock_file(name);
        if !path.exists() {
            return;
        }
        let expected = self.current_transactions.lock().remove(name);
        let Some(expected) = expected else {
            return;
        };
        let on_disk = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| content.split_whitespace().nth(1).map(str::to_string));
        if on_disk.as_deref() == Some(expected.as_str()) {
            let _ = std::fs::remove_file(&path);
            tracing::debug!(chunk = %name, "removed lock record");
        }
    }
}

impl ChunkManager for LocalChunkManager {
    fn get_chunk(
        &self,
        name: &ChunkId,
        local_version: Option<Vec<u8>>,
        keys: &Keypair,
        lock: bool,
    ) {
        if !self.get_delay.is_zero() {
            std::thread::sleep(self.get_delay);
        }

        if self.local_store.has(name) {
            self.signals.emit_got(name, OpResult::Success);
            return;
        }

        let local_version = local_version.filter(|v| !v.is_empty());
        if lock {
            if let Some(local_version) = &local_version {
                if self.simulation.version(name).as_ref() == Some(local_version) {
                    tracing::debug!(chunk = %name, "local and remote versions match");
                    self.signals.emit_got(name, OpResult::NotModified);
                    return;
                }
            }
            self.acquire_lock_record(name);
        }

        let content = match self.simulation.get(name, None, &keys.public) {
            Ok(content) => content,
            Err(error) => {
                tracing::error!(chunk = %name, %error, "backend get refused");
                self.signals.emit_got(name, OpResult::GetFailure);
                return;
            }
        };

        if !self.local_store.store(name, content) {
            tracing::error!(chunk = %name, "failed to store fetched chunk locally");
            self.signals.emit_got(name, OpResult::GetFailure);
            return;
        }

        self.signals.emit_got(name, OpResult::Success);
    }

    fn store_chunk(&self, name: &ChunkId, keys: &Keypair) {
        if !self.action_delay.is_zero() {
            std::thread::sleep(self.action_delay);
        }

        let Some(content) = self.local_store.get(name) else {
            tracing::error!(chunk = %name, "no local copy to forward");
            self.signals.emit_stored(name, OpResult::StoreFailure);
            return;
        };

        // Hashable chunks need no key; the content authenticates itself.
        let public_key: &[u8] = if authority::is_cacheable(name) {
            &[]
        } else {
            &keys.public
        };
        if let Err(error) = self.simulation.store(name, content, public_key) {
            tracing::error!(chunk = %name, %error, "backend store refused");
            self.signals.emit_stored(name, OpResult::StoreFailure);
            return;
        }

        self.signals.emit_stored(name, OpResult::Success);
    }

    fn delete_chunk(&self, name: &ChunkId, keys: &Keypair) {
        if !self.action_delay.is_zero() {
            std::thread::sleep(self.action_delay);
        }

        let mut proof = Vec::new();
        let mut public_key: &[u8] = &[];
        if !authority::is_cacheable(name) {
            let signed = SignedData::sign(crypto::random_bytes(16), keys);
            match signed.encode() {
                Ok(encoded) => proof = encoded,
                Err(error) => {
                    tracing::error!(chunk = %name, %error, "failed to build ownership proof");
                    self.signals.emit_deleted(name, OpResult::DeleteFailure);
                    return;
                }
            }
            public_key = &keys.public;
        }

        if let Err(error) = self.simulation.delete(name, &proof, public_key) {
            tracing::error!(chunk = %name, %error, "backend delete refused");
            self.signals.emit_deleted(name, OpResult::DeleteFailure);
            return;
        }

        self.signals.emit_deleted(name, OpResult::Success);
    }

    fn modify_chunk(&self, name: &ChunkId, content: Bytes, keys: &Keypair) {
        if !self.action_delay.is_zero() {
            std::thread::sleep(self.action_delay);
        }

        self.consume_lock_record(name);

        if let Err(error) = self.simulation.modify(name, &content, &keys.public) {
            tracing::error!(chunk = %name, %error, "backend modify refused");
            self.signals.emit_modified(name, OpResult::ModifyFailure);
            return;
        }

        self.signals.emit_modified(name, OpResult::Success);
    }

    fn signals(&self) -> &ManagerSignals {
        &self.signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::ChunkType;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    struct Fixture {
        manager: LocalChunkManager,
        local: Arc<BufferedChunkStore>,
        root: PathBuf,
    }

    fn fixture() -> Fixture {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "cairn-local-manager-{}-{}",
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_dir_all(&root);
        let local =
            Arc::new(BufferedChunkStore::open(root.join("buffer"), Vec::new(), 4).unwrap());
        let manager = LocalChunkManager::open(
            local.clone(),
            root.join("simulation"),
            root.join("locks"),
            Duration::ZERO,
        )
        .unwrap();
        Fixture {
            manager,
            local,
            root,
        }
    }

    fn default_name(content: &[u8]) -> ChunkId {
        ChunkId::new(crypto::content_hash(content).to_vec())
    }

    fn collect_results(signals: &ManagerSignals) -> Arc<Mutex<Vec<(ChunkId, OpResult)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = |seen: &Arc<Mutex<Vec<(ChunkId, OpResult)>>>| -> OpResultHandler {
            let seen = seen.clone();
            Arc::new(move |name: &ChunkId, result: OpResult| {
                seen.lock().push((name.clone(), result));
            })
        };
        signals.on_chunk_got(recorder(&seen));
        signals.on_chunk_stored(recorder(&seen));
        signals.on_chunk_modified(recorder(&seen));
        signals.on_chunk_deleted(recorder(&seen));
        seen
    }

    #[test]
    fn store_then_get_round_trips_through_simulation() {
        let fx = fixture();
        let seen = collect_results(fx.manager.signals());
        let keys = Keypair::generate();
        let name = default_name(b"hello backend");

        fx.local.store(&name, Bytes::from_static(b"hello backend"));
        fx.manager.store_chunk(&name, &keys);
        assert_eq!(seen.lock().last().unwrap().1, OpResult::Success);

        // Drop the local copy, then fetch it back from the simulation.
        fx.local.delete(&name);
        fx.manager.get_chunk(&name, None, &keys, false);
        assert_eq!(seen.lock().last().unwrap().1, OpResult::Success);
        assert_eq!(
            fx.local.get(&name).unwrap(),
            Bytes::from_static(b"hello backend")
        );
        let _ = std::fs::remove_dir_all(&fx.root);
    }

    #[test]
    fn get_of_locally_cached_chunk_short_circuits() {
        let fx = fixture();
        let seen = collect_results(fx.manager.signals());
        let keys = Keypair::generate();
        let name = default_name(b"cached");
        fx.local.store(&name, Bytes::from_static(b"cached"));

        fx.manager.get_chunk(&name, None, &keys, false);
        assert_eq!(seen.lock().last().unwrap().1, OpResult::Success);
        let _ = std::fs::remove_dir_all(&fx.root);
    }

    #[test]
    fn get_missing_chunk_fails() {
        let fx = fixture();
        let seen = collect_results(fx.manager.signals());
        let keys = Keypair::generate();
        fx.manager
            .get_chunk(&default_name(b"nowhere"), None, &keys, false);
        assert_eq!(seen.lock().last().unwrap().1, OpResult::GetFailure);
        let _ = std::fs::remove_dir_all(&fx.root);
    }

    #[test]
    fn matching_version_reports_not_modified() {
        let fx = fixture();
        let seen = collect_results(fx.manager.signals());
        let keys = Keypair::generate();
        let name =
            ChunkId::apply_type(&crypto::content_hash(b"vtest"), ChunkType::ModifiableByOwner)
                .unwrap();

        let record = SignedData::sign(b"versioned".to_vec(), &keys);
        let encoded = record.encode().unwrap();
        fx.local.store(&name, Bytes::from(encoded.clone()));
        fx.manager.store_chunk(&name, &keys);
        fx.local.delete(&name);

        let version = crypto::version_hash(&encoded).to_vec();
        fx.manager.get_chunk(&name, Some(version), &keys, true);
        assert_eq!(seen.lock().last().unwrap().1, OpResult::NotModified);
        let _ = std::fs::remove_dir_all(&fx.root);
    }

    #[test]
    fn locked_get_writes_record_and_modify_consumes_it() {
        let fx = fixture();
        let keys = Keypair::generate();
        let name =
            ChunkId::apply_type(&crypto::content_hash(b"locked"), ChunkType::ModifiableByOwner)
                .unwrap();

        let v1 = SignedData::sign(b"locked v1".to_vec(), &keys);
        fx.local.store(&name, Bytes::from(v1.encode().unwrap()));
        fx.manager.store_chunk(&name, &keys);
        fx.local.delete(&name);

        fx.manager.get_chunk(&name, None, &keys, true);
        let lock_path = fx.root.join("locks").join(name.to_base32());
        assert!(lock_path.exists());
        let record = std::fs::read_to_string(&lock_path).unwrap();
        let mut parts = record.split_whitespace();
        assert!(parts.next().unwrap().parse::<u64>().is_ok());
        assert_eq!(parts.next().unwrap().len(), 32);

        let v2 = SignedData::sign(b"locked v2".to_vec(), &keys);
        fx.manager
            .modify_chunk(&name, Bytes::from(v2.encode().unwrap()), &keys);
        assert!(!lock_path.exists());
        let _ = std::fs::remove_dir_all(&fx.root);
    }

    #[test]
    fn delete_builds_ownership_proof_for_signed_types() {
        let fx = fixture();
        let seen = collect_results(fx.manager.signals());
        let keys = Keypair::generate();
        let name =
            ChunkId::apply_type(&crypto::content_hash(b"owned"), ChunkType::ModifiableByOwner)
                .unwrap();

        let record = SignedData::sign(b"owned data".to_vec(), &keys);
        fx.local.store(&name, Bytes::from(record.encode().unwrap()));
        fx.manager.store_chunk(&name, &keys);

        fx.manager.delete_chunk(&name, &keys);
        assert_eq!(seen.lock().last().unwrap().1, OpResult::Success);
        assert!(fx.manager.simulation.has(&name, None, &keys.public).is_err());
        let _ = std::fs::remove_dir_all(&fx.root);
    }

    #[test]
    fn stale_lock_record_is_taken_over() {
        let fx = fixture();
        let keys = Keypair::generate();
        let name = default_name(b"stale lock");

        // Plant a record well past the staleness threshold.
        let lock_path = fx.root.join("locks").join(name.to_base32());
        let stale = LocalChunkManager::unix_now() - LOCK_TIMEOUT.as_secs() - 5;
        std::fs::write(&lock_path, format!("{stale} {}", "x".repeat(32))).unwrap();

        fx.manager.acquire_lock_record(&name);
        let record = std::fs::read_to_string(&lock_path).unwrap();
        assert!(!record.contains(&"x".repeat(32)));
        let _ = std::fs::remove_dir_all(&fx.root);
    }
}
