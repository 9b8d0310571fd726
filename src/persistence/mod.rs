//! Persistence layer: shared key-value stores and collection snapshots.

pub mod serialization;
pub mod kv;
pub mod file_kv;
pub mod file_lock;
pub mod snapshot;

pub use file_kv::FileKv;
pub use file_lock::FileLock;
pub use kv::{KvStore, MemoryKv};
pub use snapshot::{PersonId, Snapshot, SnapshotStore};
