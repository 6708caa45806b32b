//! On-disk snapshot record.
//!
//! Layout: LZ4 block (`compress_prepend_size`) around a bincode-encoded
//! [`Snapshot`]. The inner `state` is [`ReplicatedDocument::encode_state`]
//! output, so loading is a plain `decode_and_merge`.
//!
//! [`ReplicatedDocument::encode_state`]: crate::core::ReplicatedDocument::encode_state

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use super::StorageError;
use crate::core::delta::{decode_exact, encode};
use crate::core::{CoreError, DecodeError, ReplicatedDocument};

pub const SNAPSHOT_FORMAT: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format: u8,
    pub doc_id: Uuid,
    /// Seconds since the Unix epoch.
    pub saved_at: u64,
    pub state: Vec<u8>,
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Snapshot {
    pub fn capture(doc_id: Uuid, doc: &ReplicatedDocument) -> Self {
        Self {
            format: SNAPSHOT_FORMAT,
            doc_id,
            saved_at: unix_now(),
            state: doc.encode_state(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        lz4_flex::compress_prepend_size(&encode(self))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StorageError::Compression(e.to_string()))?;
        let snapshot: Self = decode_exact(&raw)?;
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(DecodeError::UnsupportedFormat(snapshot.format).into());
        }
        Ok(snapshot)
    }

    /// Seed `doc` with this snapshot's state.
    pub fn restore_into(&self, doc: &mut ReplicatedDocument) -> Result<usize, StorageError> {
        let report = doc.decode_and_merge(&self.state).map_err(|e| match e {
            CoreError::Decode(e) => StorageError::Codec(e),
            other => StorageError::Codec(DecodeError::Invalid(other.to_string())),
        })?;
        Ok(report.applied)
    }
}
