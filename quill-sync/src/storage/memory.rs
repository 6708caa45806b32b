//! In-memory snapshot store for tests and ephemeral sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::{SnapshotStore, StorageError};

#[derive(Default)]
struct Inner {
    snapshots: Mutex<HashMap<Uuid, Vec<u8>>>,
    failing: AtomicBool,
    writes: AtomicU64,
}

/// Clones share the same contents, so a test can keep a handle on a store it
/// gave to a session.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshots(&self) -> MutexGuard<'_, HashMap<Uuid, Vec<u8>>> {
        self.inner
            .snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every subsequent operation fail with [`StorageError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, doc_id: Uuid) -> bool {
        self.snapshots().contains_key(&doc_id)
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable);
        }
        Ok(())
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StorageError> {
        self.check()?;
        Ok(self.snapshots().get(&doc_id).cloned())
    }

    fn save(&self, doc_id: Uuid, bytes: &[u8]) -> Result<(), StorageError> {
        self.check()?;
        self.snapshots().insert(doc_id, bytes.to_vec());
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, doc_id: Uuid) -> Result<(), StorageError> {
        self.check()?;
        self.snapshots().remove(&doc_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_contents() {
        let store = MemoryStore::new();
        let handle = store.clone();
        let id = Uuid::new_v4();
        store.save(id, b"state").unwrap();
        assert_eq!(handle.load(id).unwrap(), Some(b"state".to_vec()));
        assert_eq!(handle.writes(), 1);
        handle.delete(id).unwrap();
        assert!(!store.contains(id));
    }

    #[test]
    fn test_failing_store() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert_eq!(store.save(Uuid::new_v4(), b"x"), Err(StorageError::Unavailable));
        store.set_failing(false);
        assert_eq!(store.load(Uuid::new_v4()), Ok(None));
    }
}
