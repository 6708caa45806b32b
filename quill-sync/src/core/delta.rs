//! Operations exchanged between replicas and their binary encoding.
//!
//! Wire format (bincode, standard config):
//! ```text
//! Delta       = { replica, clock, prev, op }
//! op          = Insert { origin?, content[], attrs{} }
//!             | Delete { targets[IdSpan] }
//!             | Format { targets[IdSpan], key, value? }
//! UpdateBatch = { format: u8, ops: [Delta] }   (catch-up diffs, full state)
//! ```
//!
//! Every delta names its replica and clock range explicitly, so a batch can be
//! filtered against any state vector without a shared schema handshake.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use super::ids::{IdSpan, OpId, ReplicaId};

/// Current batch format byte.
pub const BATCH_FORMAT: u8 = 1;

/// Highest clock any op may consume. Remote clocks past it are rejected, so
/// local clock arithmetic never overflows.
pub const MAX_CLOCK: u64 = u64::MAX >> 1;

/// Upper bound for a single decoded payload.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Attribute map carried by inserted atoms (`bold`, `block`, …).
pub type Attrs = BTreeMap<String, String>;

/// Attribute key holding the block kind of a [`Atom::Break`].
pub const BLOCK_ATTR: &str = "block";

/// Failure to decode bytes received from the network or disk.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("{trailing} trailing bytes after payload")]
    Trailing { trailing: usize },
    #[error("unsupported format version {0}")]
    UnsupportedFormat(u8),
    #[error("invalid operation: {0}")]
    Invalid(String),
}

pub(crate) fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_PAYLOAD_BYTES>()
}

/// Encode any serde value with the wire configuration.
pub(crate) fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    // Only in-memory structures are encoded here; failure would mean the limit
    // was exceeded, in which case receivers would reject the payload anyway.
    bincode::serde::encode_to_vec(value, wire_config()).unwrap_or_default()
}

/// Decode a value, rejecting trailing bytes (truncation and concatenation both fail).
pub(crate) fn decode_exact<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, wire_config())
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if read != bytes.len() {
        return Err(DecodeError::Trailing { trailing: bytes.len() - read });
    }
    Ok(value)
}

/// One element of the replicated sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Atom {
    Char(char),
    /// Block boundary; the block kind lives in the [`BLOCK_ATTR`] attribute.
    Break,
}

impl Atom {
    pub fn as_char(&self) -> char {
        match self {
            Atom::Char(c) => *c,
            Atom::Break => '\n',
        }
    }
}

/// Convert text into character atoms.
pub fn atoms(text: &str) -> Vec<Atom> {
    text.chars().map(Atom::Char).collect()
}

/// The mutation carried by a [`Delta`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert a run after `origin` (`None` = document start).
    Insert {
        origin: Option<OpId>,
        content: Vec<Atom>,
        attrs: Attrs,
    },
    /// Tombstone the listed elements.
    Delete { targets: Vec<IdSpan> },
    /// Set (or clear, with `None`) one attribute on the listed elements.
    Format {
        targets: Vec<IdSpan>,
        key: String,
        value: Option<String>,
    },
}

/// An immutable, replica-stamped operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub replica: ReplicaId,
    /// First clock consumed by this op.
    pub clock: u64,
    /// Last clock this replica emitted before this op (0 = first op).
    pub prev: u64,
    pub op: OpKind,
}

impl Delta {
    /// Number of clocks consumed.
    pub fn span(&self) -> u64 {
        match &self.op {
            OpKind::Insert { content, .. } => content.len() as u64,
            OpKind::Delete { .. } | OpKind::Format { .. } => 1,
        }
    }

    /// Last clock consumed.
    pub fn last_clock(&self) -> u64 {
        self.clock + self.span() - 1
    }

    pub fn id(&self) -> OpId {
        OpId::new(self.replica.clone(), self.clock)
    }

    pub fn kind_name(&self) -> &'static str {
        match self.op {
            OpKind::Insert { .. } => "insert",
            OpKind::Delete { .. } => "delete",
            OpKind::Format { .. } => "format",
        }
    }

    /// Structural checks that do not depend on document state.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.clock == 0 {
            return Err(DecodeError::Invalid("clock must start at 1".into()));
        }
        if self.clock > MAX_CLOCK {
            return Err(DecodeError::Invalid(format!("clock {} beyond {MAX_CLOCK}", self.clock)));
        }
        if self.prev >= self.clock {
            return Err(DecodeError::Invalid(format!(
                "prev clock {} not below clock {}",
                self.prev, self.clock
            )));
        }
        let targets = match &self.op {
            OpKind::Insert { content, .. } => {
                if content.is_empty() {
                    return Err(DecodeError::Invalid("empty insert".into()));
                }
                if self.clock + (content.len() as u64 - 1) > MAX_CLOCK {
                    return Err(DecodeError::Invalid("clock range overflow".into()));
                }
                return Ok(());
            }
            OpKind::Delete { targets } => targets,
            OpKind::Format { targets, key, .. } => {
                if key.is_empty() {
                    return Err(DecodeError::Invalid("empty attribute key".into()));
                }
                targets
            }
        };
        if targets.is_empty() {
            return Err(DecodeError::Invalid("no targets".into()));
        }
        if targets
            .iter()
            .any(|t| t.len == 0 || t.start == 0 || t.start.checked_add(t.len).is_none())
        {
            return Err(DecodeError::Invalid("degenerate target span".into()));
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    /// Decode and validate one delta.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let delta: Delta = decode_exact(bytes)?;
        delta.validate()?;
        Ok(delta)
    }
}

/// An ordered set of deltas: a catch-up diff or a full-state export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateBatch {
    pub format: u8,
    pub ops: Vec<Delta>,
}

impl UpdateBatch {
    pub fn new(ops: Vec<Delta>) -> Self {
        Self { format: BATCH_FORMAT, ops }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    /// Decode and validate every op; one bad op rejects the whole batch.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let batch: UpdateBatch = decode_exact(bytes)?;
        if batch.format != BATCH_FORMAT {
            return Err(DecodeError::UnsupportedFormat(batch.format));
        }
        for op in &batch.ops {
            op.validate()?;
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(clock: u64, prev: u64, text: &str) -> Delta {
        Delta {
            replica: ReplicaId::new("alice-1"),
            clock,
            prev,
            op: OpKind::Insert {
                origin: None,
                content: atoms(text),
                attrs: Attrs::new(),
            },
        }
    }

    #[test]
    fn test_insert_span() {
        let d = insert(5, 4, "abc");
        assert_eq!(d.span(), 3);
        assert_eq!(d.last_clock(), 7);
        assert_eq!(d.kind_name(), "insert");
    }

    #[test]
    fn test_delta_codec() {
        let d = insert(1, 0, "hello");
        let decoded = Delta::decode(&d.encode()).unwrap();
        assert_eq!(decoded, d);
    }

    #[test]
    fn test_truncated_delta_rejected() {
        let bytes = insert(1, 0, "hello").encode();
        let truncated = &bytes[..bytes.len() - 2];
        assert!(matches!(Delta::decode(truncated), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = insert(1, 0, "x").encode();
        bytes.push(0);
        assert_eq!(
            Delta::decode(&bytes),
            Err(DecodeError::Trailing { trailing: 1 })
        );
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Delta::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(Delta::decode(&[]).is_err());
    }

    #[test]
    fn test_invalid_ops_rejected() {
        assert!(insert(1, 0, "").validate().is_err());
        assert!(insert(0, 0, "a").validate().is_err());
        assert!(insert(3, 3, "a").validate().is_err());

        let empty_span = Delta {
            replica: ReplicaId::new("r"),
            clock: 2,
            prev: 1,
            op: OpKind::Delete {
                targets: vec![IdSpan::new(ReplicaId::new("r"), 1, 0)],
            },
        };
        assert!(empty_span.validate().is_err());
        assert!(Delta::decode(&empty_span.encode()).is_err());
    }

    #[test]
    fn test_clock_bound_enforced() {
        assert!(insert(MAX_CLOCK, 0, "a").validate().is_ok());
        assert!(insert(MAX_CLOCK, 0, "ab").validate().is_err());
        assert!(insert(MAX_CLOCK + 1, 0, "a").validate().is_err());
        assert!(insert(u64::MAX, 0, "a").validate().is_err());
        assert!(Delta::decode(&insert(u64::MAX, 3, "abc").encode()).is_err());
    }

    #[test]
    fn test_batch_format_checked() {
        let mut batch = UpdateBatch::new(vec![insert(1, 0, "a")]);
        assert_eq!(UpdateBatch::decode(&batch.encode()).unwrap(), batch);
        batch.format = 9;
        assert_eq!(
            UpdateBatch::decode(&batch.encode()),
            Err(DecodeError::UnsupportedFormat(9))
        );
    }

    #[test]
    fn test_break_renders_newline() {
        assert_eq!(Atom::Break.as_char(), '\n');
        assert_eq!(Atom::Char('q').as_char(), 'q');
    }
}
