//! cairn-store — the chunk storage pipeline.
//!
//! Layers, bottom to top:
//!   - `store`: byte stores (memory, file, threadsafe wrapper, buffered)
//!   - `authority`: per-type validation rules over any byte store
//!   - `manager`: backend executors (local simulation with lock records)
//!   - `remote`: the per-chunk operation scheduler clients talk to

pub mod authority;
pub mod manager;
pub mod remote;
pub mod store;

pub use authority::{ChunkActionAuthority, ChunkActionError};
pub use manager::{ChunkManager, LocalChunkManager, ManagerSignals, OpResult};
pub use remote::{create_local_chunk_store, GetAndLockOutcome, OpType, RemoteChunkStore};
pub use store::{
    BufferedChunkStore, ChunkData, ChunkStore, FileChunkStore, MemoryChunkStore, RawChunkStore,
    ThreadsafeChunkStore,
};
