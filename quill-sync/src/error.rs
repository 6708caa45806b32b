//! Crate-level error taxonomy.
//!
//! Each layer has its own error type; [`SessionError`] is what callers of
//! the session handle see.

use thiserror::Error;

pub use crate::adapter::{AdapterError, StructureError};
pub use crate::adapter::tree::TreeError;
pub use crate::core::{CoreError, DecodeError};
pub use crate::storage::StorageError;
pub use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<TreeError> for SessionError {
    fn from(e: TreeError) -> Self {
        SessionError::Adapter(AdapterError::Tree(e))
    }
}

impl SessionError {
    /// Resource exhaustion; the only errors reported as fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Core(CoreError::PendingOverflow { .. })
                | SessionError::Storage(StorageError::Exhausted { .. })
        )
    }
}
