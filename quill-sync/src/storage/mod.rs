//! Local durable storage of document snapshots.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  record_change / flush  ┌──────────────┐
//! │ Persistence  │ ──────────────────────► │ SnapshotStore│
//! │ (write-behind│                         │ Memory/Rocks │
//! │  counters)   │ ◄────── load ────────── │              │
//! └──────┬───────┘                         └──────┬───────┘
//!        │ on startup                             │ column families
//!        ▼                                        ▼
//! ┌──────────────┐            ┌──────────────────────────────────┐
//! │ Replicated   │            │ CF "snapshots": Snapshot (LZ4)   │
//! │ Document     │            │ CF "metadata": size, timestamps  │
//! └──────────────┘            └──────────────────────────────────┘
//! ```
//!
//! Snapshots are whole-state writes, so a crash between two saves loses at
//! most the unsaved tail; it never leaves a torn document behind.

pub mod memory;
pub mod persistence;
pub mod rocks;
pub mod snapshot;

pub use memory::MemoryStore;
pub use persistence::{Persistence, PersistenceConfig, PersistenceStats};
pub use rocks::{RocksStore, SnapshotMetadata, StoreConfig};
pub use snapshot::{Snapshot, SNAPSHOT_FORMAT};

use thiserror::Error;
use uuid::Uuid;

use crate::core::DecodeError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("snapshot decode failed: {0}")]
    Codec(#[from] DecodeError),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store unavailable")]
    Unavailable,
    /// Persistence keeps failing and too much is held only in memory.
    #[error("persistence exhausted after {failures} failed writes ({unsaved} unsaved changes)")]
    Exhausted { failures: u32, unsaved: u64 },
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Byte-level snapshot storage keyed by document id.
pub trait SnapshotStore: Send + 'static {
    fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the stored snapshot atomically.
    fn save(&self, doc_id: Uuid, bytes: &[u8]) -> Result<(), StorageError>;

    fn delete(&self, doc_id: Uuid) -> Result<(), StorageError>;
}
