//! Replica identity, operation ids and state vectors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Globally unique identity of one replica within a session.
///
/// Formatted as `{user_id}-{random}` so two tabs of the same user never collide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(String);

impl ReplicaId {
    /// Create a fresh replica id for `user_id` with a random suffix.
    pub fn generate(user_id: &str) -> Self {
        let random = Uuid::new_v4().simple().to_string();
        Self(format!("{user_id}-{}", &random[..8]))
    }

    /// Wrap an existing id (tests, replays).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable 64-bit FNV-1a hash, used for cursor colours.
    pub fn stable_hash(&self) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in self.0.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        hash
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a single sequence element: `(clock, replica)`.
///
/// The derived ordering compares `clock` first and `replica` second. This is
/// the canonical total order used for the concurrent-insert tie-break and for
/// last-writer-wins attributes; it must never change once documents exist.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub clock: u64,
    pub replica: ReplicaId,
}

impl OpId {
    pub fn new(replica: ReplicaId, clock: u64) -> Self {
        Self { clock, replica }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.replica)
    }
}

/// A run of element ids from one replica with consecutive clocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdSpan {
    pub replica: ReplicaId,
    pub start: u64,
    pub len: u64,
}

impl IdSpan {
    pub fn new(replica: ReplicaId, start: u64, len: u64) -> Self {
        Self { replica, start, len }
    }

    pub fn ids(&self) -> impl Iterator<Item = OpId> + '_ {
        (self.start..self.start + self.len).map(move |clock| OpId::new(self.replica.clone(), clock))
    }

    /// Try to extend this span by one id; returns `false` if not adjacent.
    pub fn push(&mut self, id: &OpId) -> bool {
        if id.replica == self.replica && id.clock == self.start + self.len {
            self.len += 1;
            true
        } else {
            false
        }
    }

    /// Collapse a list of ids (in document order) into spans.
    pub fn from_ids<'a>(ids: impl IntoIterator<Item = &'a OpId>) -> Vec<IdSpan> {
        let mut spans: Vec<IdSpan> = Vec::new();
        for id in ids {
            let extended = spans.last_mut().map_or(false, |span| span.push(id));
            if !extended {
                spans.push(IdSpan::new(id.replica.clone(), id.clock, 1));
            }
        }
        spans
    }
}

/// Highest integrated clock per replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    clocks: BTreeMap<ReplicaId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest clock integrated from `replica` (0 if none).
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.clocks.get(replica).copied().unwrap_or(0)
    }

    /// Raise the entry for `replica`; never lowers it.
    pub fn advance(&mut self, replica: &ReplicaId, clock: u64) {
        let entry = self.clocks.entry(replica.clone()).or_insert(0);
        if clock > *entry {
            *entry = clock;
        }
    }

    /// Whether the op identified by `id` has already been integrated.
    pub fn contains(&self, id: &OpId) -> bool {
        id.clock <= self.get(&id.replica)
    }

    /// Whether `self` has integrated something `other` has not.
    pub fn is_ahead_of(&self, other: &StateVector) -> bool {
        self.clocks
            .iter()
            .any(|(replica, clock)| *clock > other.get(replica))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.clocks.iter()
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        crate::core::delta::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, crate::core::delta::DecodeError> {
        crate::core::delta::decode_exact(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_id_format() {
        let id = ReplicaId::generate("alice");
        assert!(id.as_str().starts_with("alice-"));
        assert_eq!(id.as_str().len(), "alice-".len() + 8);
        assert_ne!(id, ReplicaId::generate("alice"));
    }

    #[test]
    fn test_op_id_order_clock_first() {
        let a = OpId::new(ReplicaId::new("z"), 1);
        let b = OpId::new(ReplicaId::new("a"), 2);
        let c = OpId::new(ReplicaId::new("b"), 2);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_spans_from_ids() {
        let r1 = ReplicaId::new("r1");
        let r2 = ReplicaId::new("r2");
        let ids = vec![
            OpId::new(r1.clone(), 1),
            OpId::new(r1.clone(), 2),
            OpId::new(r2.clone(), 7),
            OpId::new(r1.clone(), 3),
        ];
        let spans = IdSpan::from_ids(&ids);
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0], IdSpan::new(r1.clone(), 1, 2));
        assert_eq!(spans[1], IdSpan::new(r2, 7, 1));
        assert_eq!(spans[2].ids().count(), 1);
    }

    #[test]
    fn test_state_vector_advance_is_monotonic() {
        let r = ReplicaId::new("r");
        let mut sv = StateVector::new();
        sv.advance(&r, 5);
        sv.advance(&r, 3);
        assert_eq!(sv.get(&r), 5);
        assert!(sv.contains(&OpId::new(r.clone(), 5)));
        assert!(!sv.contains(&OpId::new(r, 6)));
    }

    #[test]
    fn test_state_vector_ahead() {
        let mut a = StateVector::new();
        let mut b = StateVector::new();
        a.advance(&ReplicaId::new("x"), 2);
        b.advance(&ReplicaId::new("x"), 2);
        assert!(!a.is_ahead_of(&b));
        a.advance(&ReplicaId::new("y"), 1);
        assert!(a.is_ahead_of(&b));
        assert!(!b.is_ahead_of(&a));
    }

    #[test]
    fn test_state_vector_codec() {
        let mut sv = StateVector::new();
        sv.advance(&ReplicaId::new("alice-1"), 42);
        let decoded = StateVector::decode(&sv.encode()).unwrap();
        assert_eq!(decoded, sv);
    }
}
