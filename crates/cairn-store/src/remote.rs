//! Remote chunk store — the client-side operation scheduler.
//!
//! Serialises, deduplicates and coalesces per-chunk operations across
//! concurrent callers. Pending operations live in an insertion-ordered
//! table keyed by chunk name (non-unique) and transaction id (unique,
//! random, non-zero); a bounded number run against the chunk manager at a
//! time, and completions arrive through the manager's signals.
//!
//! One mutex guards all scheduler state; one condvar wakes waiters on any
//! table change. The mutex is released for exactly two things: calls into
//! the downstream chunk manager, and user callbacks.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use cairn_core::crypto::{self, Keypair};
use cairn_core::{ChunkId, SignedData};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::authority::{self, ChunkActionAuthority};
use crate::manager::{ChunkManager, LocalChunkManager, OpResult};
use crate::store::{BufferedChunkStore, ChunkStore};

/// Default bound on operations processed in parallel.
pub const MAX_ACTIVE_OPS: usize = 4;
/// Time to wait in `wait_for_completion` before failing.
pub const COMPLETION_WAIT_TIMEOUT: Duration = Duration::from_secs(180);
/// Time to wait for conflicting or in-flight ops before failing.
pub const OPERATION_WAIT_TIMEOUT: Duration = Duration::from_secs(150);
/// Period in which a previously failed get is not retried.
pub const GET_RETRY_TIMEOUT: Duration = Duration::from_secs(3);

/// Operation kinds, also the statistics index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Get = 0,
    GetLock = 1,
    Store = 2,
    Modify = 3,
    Delete = 4,
}

const OP_TYPE_COUNT: usize = 5;

impl OpType {
    fn index(self) -> usize {
        self as usize
    }

    fn label(self) -> &'static str {
        match self {
            OpType::Get => "get",
            OpType::GetLock => "get and lock",
            OpType::Store => "store",
            OpType::Modify => "modify",
            OpType::Delete => "delete",
        }
    }

    fn is_get(self) -> bool {
        matches!(self, OpType::Get | OpType::GetLock)
    }
}

/// Completion callback for the mutating verbs.
pub type OpCallback = Box<dyn FnOnce(bool) + Send>;

/// Observer invoked with the pending-op count from `wait_for_completion`.
pub type PendingOpsObserver = Box<dyn Fn(usize) + Send + Sync>;

/// Outcome of `get_and_lock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetAndLockOutcome {
    Content(Bytes),
    /// The supplied local version is already current; no content returned.
    NotModified,
    Failure,
}

/// Per-verb counters: attempted, succeeded, skipped (coalesced away), and
/// the bytes moved by successful ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpStats {
    pub count: [u64; OP_TYPE_COUNT],
    pub success: [u64; OP_TYPE_COUNT],
    pub skip: [u64; OP_TYPE_COUNT],
    pub size: [u64; OP_TYPE_COUNT],
}

struct PendingOp {
    transaction_id: u32,
    name: ChunkId,
    op_type: OpType,
    callback: Option<OpCallback>,
    keys: Keypair,
    local_version: Option<Vec<u8>>,
    content: Bytes,
    active: bool,
    ready: bool,
}

#[derive(PartialEq, Eq)]
enum WaitResult {
    Success,
    Cancelled,
    Timeout,
}

struct State {
    /// Insertion-ordered pending operations.
    pending: Vec<PendingOp>,
    active_ops_count: usize,
    max_active_ops: usize,
    /// Names some getter is still waiting to read back, with waiter counts.
    waiting_gets: HashMap<ChunkId, u32>,
    /// Names whose `get_and_lock` came back "not modified".
    not_modified_gets: HashSet<ChunkId>,
    /// Recently failed gets, suppressed until the retry timeout passes.
    failed_gets: HashMap<ChunkId, Instant>,
    failed_ops: Vec<(ChunkId, OpType)>,
    stats: OpStats,
    operation_wait_timeout: Duration,
    completion_wait_timeout: Duration,
    pending_ops_observer: Option<PendingOpsObserver>,
}

impl State {
    fn has_pending_for(&self, name: &ChunkId) -> bool {
        self.pending.iter().any(|op| &op.name == name)
    }

    fn position_by_id(&self, transaction_id: u32) -> Option<usize> {
        self.pending
            .iter()
            .position(|op| op.transaction_id == transaction_id)
    }

    fn remove_by_id(&mut self, transaction_id: u32) {
        if let Some(index) = self.position_by_id(transaction_id) {
            self.pending.remove(index);
        }
    }

    /// First pending op for `name`, in insertion order.
    fn first_for_name(&self, name: &ChunkId) -> Option<&PendingOp> {
        self.pending.iter().find(|op| &op.name == name)
    }
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
    chunk_store: Arc<BufferedChunkStore>,
    manager: Arc<dyn ChunkManager>,
    authority: Arc<ChunkActionAuthority>,
}

/// The scheduler. Construct with [`RemoteChunkStore::new`]; all verbs take
/// `&self` and are safe to call from any thread.
pub struct RemoteChunkStore {
    inner: Arc<Inner>,
}

impl RemoteChunkStore {
    pub fn new(
        chunk_store: Arc<BufferedChunkStore>,
        manager: Arc<dyn ChunkManager>,
        authority: Arc<ChunkActionAuthority>,
    ) -> Arc<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                pending: Vec::new(),
                active_ops_count: 0,
                max_active_ops: MAX_ACTIVE_OPS,
                waiting_gets: HashMap::new(),
                not_modified_gets: HashSet::new(),
                failed_gets: HashMap::new(),
                failed_ops: Vec::new(),
                stats: OpStats::default(),
                operation_wait_timeout: OPERATION_WAIT_TIMEOUT,
                completion_wait_timeout: COMPLETION_WAIT_TIMEOUT,
                pending_ops_observer: None,
            }),
            cond: Condvar::new(),
            chunk_store,
            manager: manager.clone(),
            authority,
        });

        // The signal handlers must not keep the scheduler alive: the
        // manager holds them for its own lifetime.
        for op_type in [OpType::Get, OpType::Store, OpType::Modify, OpType::Delete] {
            let weak: Weak<Inner> = Arc::downgrade(&inner);
            let handler: crate::manager::OpResultHandler = Arc::new(move |name, result| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_op_result(op_type, name, result);
                }
            });
            match op_type {
                OpType::Get => manager.signals().on_chunk_got(handler),
                OpType::Store => manager.signals().on_chunk_stored(handler),
                OpType::Modify => manager.signals().on_chunk_modified(handler),
                OpType::Delete => manager.signals().on_chunk_deleted(handler),
                OpType::GetLock => unreachable!(),
            }
        }

        Arc::new(Self { inner })
    }

    /// Synchronous read. Returns empty bytes on any failure or timeout.
    pub fn get(&self, name: &ChunkId, keys: &Keypair) -> Bytes {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !authority::is_valid_name(name) {
            tracing::error!(chunk = %name, "get: invalid chunk name");
            return Bytes::new();
        }

        if authority::is_cacheable(name) && !state.has_pending_for(name) {
            if let Some(content) = inner.chunk_store.get(name) {
                tracing::debug!(chunk = %name, "get: served from local store");
                return content;
            }
        }

        let id = inner.enqueue_op(&mut state, name, OpData::get(keys.clone()));
        inner.process_pending_ops(&mut state);
        if !inner.wait_for_get_ops(&mut state, name, id) {
            tracing::error!(chunk = %name, transaction_id = id, "get: timed out");
            return Bytes::new();
        }

        let Some(content) = inner.chunk_store.get(name) else {
            tracing::error!(chunk = %name, transaction_id = id, "get: retrieval failed");
            return Bytes::new();
        };

        inner.release_got_chunk(&mut state, name, id);
        inner.process_pending_ops(&mut state);
        content
    }

    /// Read gated on a version check, taking the cross-process lock on the
    /// backend. `NotModified` means the supplied version is current.
    pub fn get_and_lock(
        &self,
        name: &ChunkId,
        local_version: Option<Vec<u8>>,
        keys: &Keypair,
    ) -> GetAndLockOutcome {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !authority::is_valid_name(name) {
            tracing::error!(chunk = %name, "get_and_lock: invalid chunk name");
            return GetAndLockOutcome::Failure;
        }

        if authority::is_cacheable(name) && !state.has_pending_for(name) {
            if let Some(content) = inner.chunk_store.get(name) {
                return GetAndLockOutcome::Content(content);
            }
        }

        let id = inner.enqueue_op(
            &mut state,
            name,
            OpData::get_lock(keys.clone(), local_version),
        );
        inner.process_pending_ops(&mut state);
        if !inner.wait_for_get_ops(&mut state, name, id) {
            tracing::error!(chunk = %name, transaction_id = id, "get_and_lock: timed out");
            return GetAndLockOutcome::Failure;
        }

        let content = inner.chunk_store.get(name);
        let not_modified = state.not_modified_gets.remove(name);
        if content.is_none() && !not_modified {
            tracing::error!(chunk = %name, transaction_id = id, "get_and_lock: retrieval failed");
            return GetAndLockOutcome::Failure;
        }

        inner.release_got_chunk(&mut state, name, id);
        inner.process_pending_ops(&mut state);
        if not_modified {
            GetAndLockOutcome::NotModified
        } else {
            GetAndLockOutcome::Content(content.unwrap_or_default())
        }
    }

    /// Queue a store. Returns false only on pre-submission failure (local
    /// validation or timeout); the verdict otherwise arrives via `callback`.
    pub fn store(
        &self,
        name: &ChunkId,
        content: Bytes,
        callback: Option<OpCallback>,
        keys: &Keypair,
    ) -> bool {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let id = inner.enqueue_op(&mut state, name, OpData::store(keys.clone(), callback));
        match inner.wait_for_conflicting_ops(&mut state, name, OpType::Store, id) {
            WaitResult::Success => {}
            WaitResult::Cancelled => return true,
            WaitResult::Timeout => return false,
        }

        if let Err(error) = inner.authority.store(name, content, &keys.public) {
            tracing::error!(chunk = %name, %error, "store: local validation failed");
            state.remove_by_id(id);
            inner.cond.notify_all();
            return false;
        }

        if let Some(index) = state.position_by_id(id) {
            state.pending[index].ready = true;
        }
        inner.process_pending_ops(&mut state);
        true
    }

    /// Queue a delete. Symmetric to `store`; may be absorbed entirely by a
    /// pending store/modify for the same name, which also counts as success.
    pub fn delete(&self, name: &ChunkId, callback: Option<OpCallback>, keys: &Keypair) -> bool {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let id = inner.enqueue_op(&mut state, name, OpData::delete(keys.clone(), callback));
        match inner.wait_for_conflicting_ops(&mut state, name, OpType::Delete, id) {
            WaitResult::Success => {}
            WaitResult::Cancelled => return true,
            WaitResult::Timeout => return false,
        }

        let proof = SignedData::sign(crypto::random_bytes(16), keys)
            .encode()
            .unwrap_or_default();
        if let Err(error) = inner.authority.delete(name, &proof, &keys.public) {
            tracing::error!(chunk = %name, %error, "delete: local validation failed");
            state.remove_by_id(id);
            inner.cond.notify_all();
            return false;
        }

        if let Some(index) = state.position_by_id(id) {
            state.pending[index].ready = true;
        }
        inner.process_pending_ops(&mut state);
        true
    }

    /// Queue a modify. Fails fast for unmodifiable types; never blocks on
    /// conflicting ops — coalescing handles back-to-back modifies.
    pub fn modify(
        &self,
        name: &ChunkId,
        content: Bytes,
        callback: Option<OpCallback>,
        keys: &Keypair,
    ) -> bool {
        if !authority::is_modifiable(name) {
            tracing::error!(chunk = %name, "modify: chunk type not modifiable");
            return false;
        }

        let inner = &self.inner;
        let mut state = inner.state.lock();
        inner.enqueue_op(
            &mut state,
            name,
            OpData::modify(keys.clone(), callback, content),
        );
        inner.process_pending_ops(&mut state);
        true
    }

    /// Block until every pending op completes, signalling the current count
    /// to the observer on each pass. False on timeout, with state intact.
    pub fn wait_for_completion(&self) -> bool {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        while !state.pending.is_empty() {
            tracing::debug!(
                pending = state.pending.len(),
                active = state.active_ops_count,
                "waiting for completion"
            );
            if let Some(observer) = &state.pending_ops_observer {
                observer(state.pending.len());
            }
            let timeout = state.completion_wait_timeout;
            if inner.cond.wait_for(&mut state, timeout).timed_out() {
                tracing::error!(
                    pending = state.pending.len(),
                    active = state.active_ops_count,
                    "wait_for_completion timed out"
                );
                return false;
            }
        }
        true
    }

    pub fn set_pending_ops_observer(&self, observer: PendingOpsObserver) {
        self.inner.state.lock().pending_ops_observer = Some(observer);
    }

    pub fn set_max_active_ops(&self, max_active_ops: usize) {
        self.inner.state.lock().max_active_ops = max_active_ops.max(1);
    }

    pub fn set_operation_wait_timeout(&self, timeout: Duration) {
        self.inner.state.lock().operation_wait_timeout = timeout;
    }

    pub fn set_completion_wait_timeout(&self, timeout: Duration) {
        self.inner.state.lock().completion_wait_timeout = timeout;
    }

    pub fn num_pending_ops(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn stats(&self) -> OpStats {
        self.inner.state.lock().stats
    }

    pub fn failed_ops(&self) -> Vec<(ChunkId, OpType)> {
        self.inner.state.lock().failed_ops.clone()
    }

    /// Dump per-verb counters and the live op table to the log.
    pub fn log_stats(&self) {
        let state = self.inner.state.lock();
        for op_type in [
            OpType::Get,
            OpType::GetLock,
            OpType::Store,
            OpType::Modify,
            OpType::Delete,
        ] {
            let i = op_type.index();
            tracing::info!(
                op = op_type.label(),
                success = state.stats.success[i],
                skipped = state.stats.skip[i],
                attempted = state.stats.count[i],
                bytes = state.stats.size[i],
                "op stats"
            );
        }
        for op in &state.pending {
            tracing::warn!(
                chunk = %op.name,
                op = op.op_type.label(),
                active = op.active,
                "still pending"
            );
        }
        for (name, op_type) in &state.failed_ops {
            tracing::warn!(chunk = %name, op = op_type.label(), "failed op");
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.chunk_store.is_empty()
    }

    pub fn clear(&self) {
        self.inner.chunk_store.clear();
    }

    pub fn local_store(&self) -> &Arc<BufferedChunkStore> {
        &self.inner.chunk_store
    }
}

/// Constructor bundle for `enqueue_op`.
struct OpData {
    op_type: OpType,
    callback: Option<OpCallback>,
    keys: Keypair,
    local_version: Option<Vec<u8>>,
    content: Bytes,
    ready: bool,
}

impl OpData {
    fn get(keys: Keypair) -> Self {
        OpData {
            op_type: OpType::Get,
            callback: None,
            keys,
            local_version: None,
            content: Bytes::new(),
            ready: true,
        }
    }

    fn get_lock(keys: Keypair, local_version: Option<Vec<u8>>) -> Self {
        OpData {
            op_type: OpType::GetLock,
            callback: None,
            keys,
            local_version,
            content: Bytes::new(),
            ready: true,
        }
    }

    fn store(keys: Keypair, callback: Option<OpCallback>) -> Self {
        OpData {
            op_type: OpType::Store,
            callback,
            keys,
            local_version: None,
            content: Bytes::new(),
            ready: false,
        }
    }

    fn delete(keys: Keypair, callback: Option<OpCallback>) -> Self {
        OpData {
            op_type: OpType::Delete,
            callback,
            keys,
            local_version: None,
            content: Bytes::new(),
            ready: false,
        }
    }

    fn modify(keys: Keypair, callback: Option<OpCallback>, content: Bytes) -> Self {
        OpData {
            op_type: OpType::Modify,
            callback,
            keys,
            local_version: None,
            content,
            ready: true,
        }
    }
}

impl Inner {
    /// Enqueue an operation, applying the coalescing rules against the most
    /// recent pending op for the same name. Returns 0 when the new op was
    /// absorbed entirely (delete-after-store/modify).
    fn enqueue_op(&self, state: &mut MutexGuard<'_, State>, name: &ChunkId, op: OpData) -> u32 {
        state.stats.count[op.op_type.index()] += 1;

        let previous = state
            .pending
            .iter()
            .rposition(|pending| &pending.name == name)
            .filter(|&index| !state.pending[index].active);
        if let Some(index) = previous {
            let previous_type = state.pending[index].op_type;
            let mut cancel_previous = false;
            let mut cancel_current = false;
            if op.op_type == OpType::Modify
                && previous_type == OpType::Modify
                && authority::modify_replaces(name)
            {
                // Back-to-back replace-semantics modifies: only the newest
                // content can ever win, so the older op is moot.
                cancel_previous = true;
            } else if op.op_type == OpType::Delete
                && matches!(previous_type, OpType::Store | OpType::Modify)
            {
                // A delete right behind an unsent store/modify absorbs both.
                cancel_previous = true;
                cancel_current = true;
            }

            if cancel_previous {
                tracing::debug!(
                    chunk = %name,
                    cancelled = previous_type.label(),
                    by = op.op_type.label(),
                    "coalescing pending ops"
                );
                let callback = state.pending[index].callback.take();
                state.stats.skip[previous_type.index()] += 1;
                state.pending.remove(index);
                self.cond.notify_all();
                if let Some(callback) = callback {
                    // The cancelled op reports success: its effect is
                    // subsumed by the op that displaced it.
                    MutexGuard::unlocked(state, || callback(true));
                }
            }
            if cancel_current {
                state.stats.skip[op.op_type.index()] += 1;
                // The absorbed delete still owes the caller a vanished
                // chunk; drop the copy the cancelled store left locally.
                self.chunk_store.delete(name);
                return 0;
            }
        }

        let mut transaction_id = crypto::random_nonzero_u32();
        while state.position_by_id(transaction_id).is_some() {
            transaction_id = crypto::random_nonzero_u32();
        }
        state.pending.push(PendingOp {
            transaction_id,
            name: name.clone(),
            op_type: op.op_type,
            callback: op.callback,
            keys: op.keys,
            local_version: op.local_version,
            content: op.content,
            active: false,
            ready: op.ready,
        });
        transaction_id
    }

    /// Wait until the op with `transaction_id` is the earliest pending op
    /// for `name`, it is cancelled, or the operation timeout passes.
    fn wait_for_conflicting_ops(
        &self,
        state: &mut MutexGuard<'_, State>,
        name: &ChunkId,
        op_type: OpType,
        transaction_id: u32,
    ) -> WaitResult {
        if transaction_id == 0 {
            return WaitResult::Cancelled;
        }
        loop {
            if state.position_by_id(transaction_id).is_none() {
                tracing::warn!(
                    chunk = %name,
                    op = op_type.label(),
                    transaction_id,
                    "pending op was cancelled"
                );
                return WaitResult::Cancelled;
            }
            if state
                .first_for_name(name)
                .map(|op| op.transaction_id == transaction_id)
                .unwrap_or(false)
            {
                return WaitResult::Success;
            }
            let timeout = state.operation_wait_timeout;
            if self.cond.wait_for(state, timeout).timed_out() {
                tracing::error!(
                    chunk = %name,
                    op = op_type.label(),
                    transaction_id,
                    "timed out waiting for conflicting ops"
                );
                state.remove_by_id(transaction_id);
                self.cond.notify_all();
                state.failed_ops.push((name.clone(), op_type));
                return WaitResult::Timeout;
            }
        }
    }

    /// Wait until the get op with `transaction_id` has been completed and
    /// removed from the table.
    fn wait_for_get_ops(
        &self,
        state: &mut MutexGuard<'_, State>,
        name: &ChunkId,
        transaction_id: u32,
    ) -> bool {
        while state.position_by_id(transaction_id).is_some() {
            let timeout = state.operation_wait_timeout;
            if self.cond.wait_for(state, timeout).timed_out() {
                tracing::error!(chunk = %name, transaction_id, "timed out waiting for get");
                state.remove_by_id(transaction_id);
                self.cond.notify_all();
                return false;
            }
        }
        true
    }

    /// A getter is done with its local copy; when no other getter wants it,
    /// evict it (cacheable chunks lazily, others immediately).
    fn release_got_chunk(&self, state: &mut MutexGuard<'_, State>, name: &ChunkId, id: u32) {
        let another_get_queued = state
            .first_for_name(name)
            .map(|op| op.op_type.is_get())
            .unwrap_or(false);

        if let Some(count) = state.waiting_gets.get_mut(name) {
            *count -= 1;
            if *count == 0 {
                state.waiting_gets.remove(name);
            }
        }

        if !another_get_queued && !state.waiting_gets.contains_key(name) {
            tracing::debug!(chunk = %name, transaction_id = id, "get done, releasing local copy");
            if authority::is_cacheable(name) {
                self.chunk_store.mark_for_deletion(name);
            } else {
                self.chunk_store.delete(name);
            }
        }
    }

    /// One scheduling pass: activate ops front-to-back while slots remain.
    /// An op is skipped while an earlier active or not-yet-ready op for the
    /// same name sits in front of it, and gets are skipped for any name
    /// already picked in this pass.
    fn process_pending_ops(&self, state: &mut MutexGuard<'_, State>) {
        // Failed gets become retryable again after the suppression window.
        let now = Instant::now();
        state
            .failed_gets
            .retain(|_, failed_at| now.duration_since(*failed_at) < GET_RETRY_TIMEOUT);

        let mut processed_gets: HashSet<ChunkId> = HashSet::new();
        while state.active_ops_count < state.max_active_ops {
            let mut blocked: HashSet<ChunkId> = HashSet::new();
            let mut selected: Option<usize> = None;
            for (index, op) in state.pending.iter().enumerate() {
                if op.active || !op.ready {
                    blocked.insert(op.name.clone());
                } else if !blocked.contains(&op.name)
                    && (!op.op_type.is_get() || !processed_gets.contains(&op.name))
                {
                    selected = Some(index);
                    break;
                }
            }

            let Some(index) = selected else {
                return;
            };

            let name = state.pending[index].name.clone();
            let op_type = state.pending[index].op_type;

            if op_type.is_get() {
                if self.chunk_store.has(&name) {
                    tracing::debug!(chunk = %name, "get satisfied from local store");
                    *state.waiting_gets.entry(name.clone()).or_insert(0) += 1;
                    state.pending.remove(index);
                    self.cond.notify_all();
                    return;
                }
                if state.failed_gets.contains_key(&name) {
                    tracing::warn!(chunk = %name, "get failed recently, not retrying yet");
                    state.pending.remove(index);
                    self.cond.notify_all();
                    return;
                }
                processed_gets.insert(name.clone());
            }

            let op = &mut state.pending[index];
            op.active = true;
            let local_version = op.local_version.clone();
            let keys = op.keys.clone();
            let content = op.content.clone();
            state.active_ops_count += 1;

            let manager = self.manager.clone();
            MutexGuard::unlocked(state, move || match op_type {
                OpType::Get => manager.get_chunk(&name, local_version, &keys, false),
                OpType::GetLock => manager.get_chunk(&name, local_version, &keys, true),
                OpType::Store => manager.store_chunk(&name, &keys),
                OpType::Modify => manager.modify_chunk(&name, content, &keys),
                OpType::Delete => manager.delete_chunk(&name, &keys),
            });
        }
    }

    /// Completion handler wired to the manager's signals.
    fn on_op_result(&self, op_type: OpType, name: &ChunkId, result: OpResult) {
        let mut state = self.state.lock();

        // First active op matching name and type; a got-signal also matches
        // a pending GetLock.
        let position = state.pending.iter().position(|op| {
            &op.name == name
                && (op.op_type == op_type
                    || (op.op_type == OpType::GetLock && op_type == OpType::Get))
                && op.active
        });
        let Some(index) = position else {
            tracing::warn!(chunk = %name, op = op_type.label(), ?result, "unrecognised completion");
            return;
        };
        let effective_type = state.pending[index].op_type;

        match result {
            OpResult::Success => {
                state.stats.success[effective_type.index()] += 1;
                let moved = match effective_type {
                    OpType::Get | OpType::GetLock | OpType::Store => {
                        self.chunk_store.size_of(name)
                    }
                    OpType::Modify => state.pending[index].content.len() as u64,
                    OpType::Delete => 0,
                };
                state.stats.size[effective_type.index()] += moved;
                // Any success clears the retry suppression for the name.
                state.failed_gets.remove(name);
                if effective_type.is_get() {
                    *state.waiting_gets.entry(name.clone()).or_insert(0) += 1;
                }
            }
            OpResult::NotModified => {
                tracing::debug!(chunk = %name, "local version is current");
                state.not_modified_gets.insert(name.clone());
            }
            _ => {
                tracing::error!(chunk = %name, op = op_type.label(), ?result, "op failed");
                if effective_type.is_get() {
                    state.failed_gets.insert(name.clone(), Instant::now());
                }
                state.failed_ops.push((name.clone(), effective_type));
            }
        }

        // Once a store has gone out, the local copy has served its purpose.
        // Cacheable chunks linger until space is needed; a failed cacheable
        // store keeps its local copy either way.
        if effective_type == OpType::Store {
            if authority::is_cacheable(name) {
                self.chunk_store.mark_for_deletion(name);
            } else {
                self.chunk_store.delete(name);
            }
        }

        let callback = state.pending[index].callback.take();
        state.active_ops_count = state.active_ops_count.saturating_sub(1);
        state.pending.remove(index);
        self.cond.notify_all();

        if let Some(callback) = callback {
            MutexGuard::unlocked(&mut state, || callback(result.is_success()));
        }

        if !effective_type.is_get() {
            self.process_pending_ops(&mut state);
        }
    }
}

/// Assemble the whole local pipeline: buffered store, action authority,
/// local chunk manager, and the scheduler on top.
pub fn create_local_chunk_store(
    buffered_path: impl Into<PathBuf>,
    simulation_path: impl Into<PathBuf>,
    lock_path: impl Into<PathBuf>,
    delay: Duration,
) -> Option<Arc<RemoteChunkStore>> {
    let buffered = Arc::new(BufferedChunkStore::open(buffered_path, Vec::new(), 5)?);
    buffered.set_cache_capacity(64 << 20);

    let authority = Arc::new(ChunkActionAuthority::new(
        buffered.clone() as Arc<dyn ChunkStore>
    ));
    let manager = Arc::new(LocalChunkManager::open(
        buffered.clone(),
        simulation_path,
        lock_path,
        delay,
    )?);

    Some(RemoteChunkStore::new(buffered, manager, authority))
}
