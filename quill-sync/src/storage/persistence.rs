//! Write-behind snapshot cache for one document.
//!
//! Saves are whole-state and batched: every `save_every` recorded changes,
//! plus an explicit [`Persistence::flush`] at teardown. A failed write is
//! logged and retried on the next change; only a store that keeps failing
//! while unsaved changes pile up is reported as [`StorageError::Exhausted`].

use uuid::Uuid;

use super::{Snapshot, SnapshotStore, StorageError};
use crate::core::ReplicatedDocument;

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Save after this many recorded changes.
    pub save_every: u64,
    pub max_consecutive_failures: u32,
    /// Unsaved changes tolerated once writes keep failing.
    pub max_unsaved_ops: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            save_every: 20,
            max_consecutive_failures: 5,
            max_unsaved_ops: 10_000,
        }
    }
}

impl PersistenceConfig {
    /// Save on every change.
    pub fn for_testing() -> Self {
        Self {
            save_every: 1,
            max_consecutive_failures: 3,
            max_unsaved_ops: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    pub saves: u64,
    pub failures: u64,
    pub unsaved: u64,
}

pub struct Persistence {
    store: Box<dyn SnapshotStore>,
    doc_id: Uuid,
    config: PersistenceConfig,
    unsaved: u64,
    consecutive_failures: u32,
    stats: PersistenceStats,
}

impl Persistence {
    pub fn new(store: Box<dyn SnapshotStore>, doc_id: Uuid, config: PersistenceConfig) -> Self {
        Self {
            store,
            doc_id,
            config,
            unsaved: 0,
            consecutive_failures: 0,
            stats: PersistenceStats::default(),
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            unsaved: self.unsaved,
            ..self.stats
        }
    }

    /// Latest snapshot, or `None` if absent or unreadable.
    ///
    /// A bad snapshot only costs a full catch-up from the network.
    pub fn load(&self) -> Option<Snapshot> {
        let bytes = match self.store.load(self.doc_id) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                log::error!("Failed to read snapshot for {}: {e}", self.doc_id);
                return None;
            }
        };
        match Snapshot::decode(&bytes) {
            Ok(snapshot) if snapshot.doc_id == self.doc_id => Some(snapshot),
            Ok(snapshot) => {
                log::warn!("snapshot stored under {} belongs to {}", self.doc_id, snapshot.doc_id);
                None
            }
            Err(e) => {
                log::error!("Discarding unreadable snapshot for {}: {e}", self.doc_id);
                None
            }
        }
    }

    /// Load the snapshot into `doc`; returns whether anything was restored.
    pub fn restore(&self, doc: &mut ReplicatedDocument) -> bool {
        let Some(snapshot) = self.load() else {
            return false;
        };
        match snapshot.restore_into(doc) {
            Ok(applied) => {
                log::info!("Restored {} ops for {} from local snapshot", applied, self.doc_id);
                applied > 0
            }
            Err(e) => {
                log::error!("Snapshot for {} could not be merged: {e}", self.doc_id);
                false
            }
        }
    }

    /// Note one merged change and save if the batch is full.
    pub fn record_change(&mut self, doc: &ReplicatedDocument) -> Result<(), StorageError> {
        self.unsaved += 1;
        if self.unsaved >= self.config.save_every {
            self.save(doc)?;
        }
        Ok(())
    }

    /// Save if anything is unsaved.
    pub fn flush(&mut self, doc: &ReplicatedDocument) -> Result<(), StorageError> {
        if self.unsaved == 0 {
            return Ok(());
        }
        self.save(doc)
    }

    /// Write the current state now.
    ///
    /// Write errors are absorbed; `Err` only means the store is exhausted.
    pub fn save(&mut self, doc: &ReplicatedDocument) -> Result<(), StorageError> {
        let bytes = Snapshot::capture(self.doc_id, doc).encode();
        match self.store.save(self.doc_id, &bytes) {
            Ok(()) => {
                self.unsaved = 0;
                self.consecutive_failures = 0;
                self.stats.saves += 1;
                Ok(())
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.stats.failures += 1;
                log::error!(
                    "Snapshot write for {} failed ({} in a row): {e}",
                    self.doc_id,
                    self.consecutive_failures
                );
                if self.consecutive_failures >= self.config.max_consecutive_failures
                    && self.unsaved > self.config.max_unsaved_ops
                {
                    return Err(StorageError::Exhausted {
                        failures: self.consecutive_failures,
                        unsaved: self.unsaved,
                    });
                }
                Ok(())
            }
        }
    }
}
