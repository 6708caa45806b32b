//! The replicated document: local edits, remote merge, causal buffering,
//! full-state export and catch-up diffs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use super::delta::{Atom, Attrs, DecodeError, Delta, OpKind, UpdateBatch, MAX_CLOCK};
use super::ids::{IdSpan, OpId, ReplicaId, StateVector};
use super::sequence::{DocumentState, Sequence};

/// Tunables for the replicated document.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Maximum number of causally-unready ops kept in the pending buffer.
    pub max_pending: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self { max_pending: 10_000 }
    }
}

impl CoreConfig {
    pub fn for_testing() -> Self {
        Self { max_pending: 64 }
    }
}

/// Errors raised by the document core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("invalid edit: {0}")]
    InvalidIntent(String),
    #[error("pending buffer full ({limit} ops)")]
    PendingOverflow { limit: usize },
}

/// A structural edit expressed against the current visible positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditIntent {
    Insert {
        index: usize,
        content: Vec<Atom>,
        attrs: Attrs,
    },
    Delete {
        index: usize,
        len: usize,
    },
    Format {
        index: usize,
        len: usize,
        key: String,
        value: Option<String>,
    },
}

impl EditIntent {
    /// Plain text insert without attributes.
    pub fn insert_text(index: usize, text: &str) -> Self {
        EditIntent::Insert {
            index,
            content: super::delta::atoms(text),
            attrs: Attrs::new(),
        }
    }

    pub fn delete(index: usize, len: usize) -> Self {
        EditIntent::Delete { index, len }
    }
}

/// Shape of the document after a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSummary {
    pub visible_len: usize,
    pub elements: usize,
    pub tombstones: usize,
    /// Buffered ops released by this merge.
    pub drained: usize,
}

/// Outcome of [`ReplicatedDocument::apply_remote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyResult {
    /// Already integrated; nothing changed.
    Duplicate,
    /// Integrated (plus any buffered ops it unblocked).
    Applied(StateSummary),
    /// Missing a dependency; buffered until it arrives.
    Pending,
}

impl ApplyResult {
    pub fn changed(&self) -> bool {
        matches!(self, ApplyResult::Applied(_))
    }
}

/// Counts from merging a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub applied: usize,
    pub duplicates: usize,
    pub pending: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.applied > 0
    }
}

/// Cursor anchor that survives concurrent edits.
///
/// Points at the element right of the caret; `None` means end of document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelativePosition {
    pub anchor: Option<OpId>,
}

/// One replica's copy of the document.
pub struct ReplicatedDocument {
    replica: ReplicaId,
    /// Lamport clock: highest clock seen or emitted.
    clock: u64,
    /// Last clock emitted by this replica.
    last_local: u64,
    seq: Sequence,
    state_vector: StateVector,
    /// Every integrated op, in integration (causal) order.
    log: Vec<Delta>,
    pending: BTreeMap<OpId, Delta>,
    config: CoreConfig,
}

impl ReplicatedDocument {
    pub fn new(replica: ReplicaId) -> Self {
        Self::with_config(replica, CoreConfig::default())
    }

    pub fn with_config(replica: ReplicaId, config: CoreConfig) -> Self {
        Self {
            replica,
            clock: 0,
            last_local: 0,
            seq: Sequence::new(),
            state_vector: StateVector::new(),
            log: Vec::new(),
            pending: BTreeMap::new(),
            config,
        }
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    pub fn state(&self) -> &DocumentState {
        self.seq.state()
    }

    pub fn content(&self) -> String {
        self.seq.state().content()
    }

    pub fn len(&self) -> usize {
        self.seq.visible_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of ops integrated so far.
    pub fn op_count(&self) -> usize {
        self.log.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn summary(&self, drained: usize) -> StateSummary {
        let state = self.seq.state();
        StateSummary {
            visible_len: self.seq.visible_len(),
            elements: state.elements.len(),
            tombstones: state.tombstones(),
            drained,
        }
    }

    // ─── Local edits ────────────────────────────────────────────────

    /// Stamp `intent` with the next clock, integrate it and return the delta.
    pub fn apply_local(&mut self, intent: EditIntent) -> Result<Delta, CoreError> {
        let len = self.len();
        let op = match intent {
            EditIntent::Insert { index, content, attrs } => {
                if content.is_empty() {
                    return Err(CoreError::InvalidIntent("empty insert".into()));
                }
                if index > len {
                    return Err(CoreError::InvalidIntent(format!(
                        "insert at {index} beyond length {len}"
                    )));
                }
                let origin = match index {
                    0 => None,
                    i => self.seq.visible_id(i - 1).cloned(),
                };
                OpKind::Insert { origin, content, attrs }
            }
            EditIntent::Delete { index, len: count } => OpKind::Delete {
                targets: self.local_targets(index, count, len)?,
            },
            EditIntent::Format { index, len: count, key, value } => {
                if key.is_empty() {
                    return Err(CoreError::InvalidIntent("empty attribute key".into()));
                }
                OpKind::Format {
                    targets: self.local_targets(index, count, len)?,
                    key,
                    value,
                }
            }
        };

        let delta = Delta {
            replica: self.replica.clone(),
            clock: self.clock.saturating_add(1),
            prev: self.last_local,
            op,
        };
        if delta.clock.saturating_add(delta.span() - 1) > MAX_CLOCK {
            return Err(CoreError::InvalidIntent("clock space exhausted".into()));
        }
        self.integrate(&delta);
        log::trace!("local {} {}", delta.kind_name(), delta.id());
        Ok(delta)
    }

    fn local_targets(&self, index: usize, count: usize, len: usize) -> Result<Vec<IdSpan>, CoreError> {
        if count == 0 {
            return Err(CoreError::InvalidIntent("empty range".into()));
        }
        if index.checked_add(count).map_or(true, |end| end > len) {
            return Err(CoreError::InvalidIntent(format!(
                "range {index}+{count} beyond length {len}"
            )));
        }
        Ok(IdSpan::from_ids(&self.seq.visible_ids(index, count)))
    }

    // ─── Remote merge ───────────────────────────────────────────────

    /// Merge a delta produced by any replica.
    pub fn apply_remote(&mut self, delta: Delta) -> Result<ApplyResult, CoreError> {
        delta.validate()?;

        if self.state_vector.contains(&delta.id()) {
            return Ok(ApplyResult::Duplicate);
        }

        if !self.is_ready(&delta) {
            let id = delta.id();
            if self.pending.contains_key(&id) {
                return Ok(ApplyResult::Pending);
            }
            if self.pending.len() >= self.config.max_pending {
                return Err(CoreError::PendingOverflow {
                    limit: self.config.max_pending,
                });
            }
            log::debug!("buffering {} {} until its dependencies arrive", delta.kind_name(), id);
            self.pending.insert(id, delta);
            return Ok(ApplyResult::Pending);
        }

        self.integrate(&delta);
        let drained = self.drain_pending();
        Ok(ApplyResult::Applied(self.summary(drained)))
    }

    /// Decode one delta and merge it. Malformed bytes change nothing.
    pub fn apply_remote_bytes(&mut self, bytes: &[u8]) -> Result<ApplyResult, CoreError> {
        let delta = Delta::decode(bytes).map_err(|e| {
            log::warn!("rejecting malformed delta ({} bytes): {e}", bytes.len());
            e
        })?;
        self.apply_remote(delta)
    }

    fn is_ready(&self, delta: &Delta) -> bool {
        if self.state_vector.get(&delta.replica) != delta.prev {
            return false;
        }
        match &delta.op {
            OpKind::Insert { origin, .. } => origin.as_ref().map_or(true, |o| self.seq.contains(o)),
            OpKind::Delete { targets } | OpKind::Format { targets, .. } => {
                targets.iter().all(|t| self.seq.contains_span(t))
            }
        }
    }

    fn integrate(&mut self, delta: &Delta) {
        match &delta.op {
            OpKind::Insert { origin, content, attrs } => {
                self.seq.integrate_insert(origin.as_ref(), &delta.id(), content, attrs);
            }
            OpKind::Delete { targets } => {
                self.seq.delete(targets);
            }
            OpKind::Format { targets, key, value } => {
                self.seq.format(targets, key, value.as_deref(), &delta.id());
            }
        }

        let last = delta.last_clock();
        self.state_vector.advance(&delta.replica, last);
        self.clock = self.clock.max(last);
        if delta.replica == self.replica {
            self.last_local = self.last_local.max(last);
        }
        self.log.push(delta.clone());
    }

    /// Re-evaluate the pending buffer until nothing more becomes ready.
    fn drain_pending(&mut self) -> usize {
        let mut drained = 0;
        loop {
            let sv = &self.state_vector;
            self.pending.retain(|id, _| !sv.contains(id));

            let ready = self
                .pending
                .iter()
                .find(|(_, delta)| self.is_ready(delta))
                .map(|(id, _)| id.clone());
            let Some(id) = ready else { break };
            if let Some(delta) = self.pending.remove(&id) {
                self.integrate(&delta);
                drained += 1;
            }
        }
        drained
    }

    // ─── State exchange ─────────────────────────────────────────────

    /// Every op a peer with state vector `since` is missing, as an encoded batch.
    pub fn diff_since(&self, since: &StateVector) -> Vec<u8> {
        let ops = self
            .log
            .iter()
            .filter(|d| d.clock > since.get(&d.replica))
            .cloned()
            .collect();
        UpdateBatch::new(ops).encode()
    }

    /// Full-state export (the diff against an empty state vector).
    pub fn encode_state(&self) -> Vec<u8> {
        self.diff_since(&StateVector::new())
    }

    /// Merge a full-state export or catch-up diff.
    ///
    /// The batch is decoded and validated as a whole before anything is applied.
    pub fn decode_and_merge(&mut self, bytes: &[u8]) -> Result<MergeReport, CoreError> {
        let batch = UpdateBatch::decode(bytes).map_err(|e| {
            log::warn!("rejecting malformed update batch ({} bytes): {e}", bytes.len());
            e
        })?;

        let mut report = MergeReport::default();
        for delta in batch.ops {
            match self.apply_remote(delta)? {
                ApplyResult::Applied(summary) => report.applied += 1 + summary.drained,
                ApplyResult::Duplicate => report.duplicates += 1,
                ApplyResult::Pending => report.pending += 1,
            }
        }
        // Ops counted as pending may have been released later in the batch.
        report.pending = report.pending.min(self.pending.len());
        Ok(report)
    }

    // ─── Relative positions ─────────────────────────────────────────

    pub fn relative_position(&self, index: usize) -> RelativePosition {
        RelativePosition {
            anchor: self.seq.visible_id(index).cloned(),
        }
    }

    /// Current visible index of `pos`, clamped to the document length.
    pub fn resolve(&self, pos: &RelativePosition) -> usize {
        match &pos.anchor {
            None => self.len(),
            Some(anchor) => self
                .seq
                .visible_index_of(anchor)
                .map_or(self.len(), |(index, _)| index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(name: &str) -> ReplicatedDocument {
        ReplicatedDocument::with_config(ReplicaId::new(name), CoreConfig::for_testing())
    }

    #[test]
    fn test_local_insert_and_delete() {
        let mut a = doc("a");
        a.apply_local(EditIntent::insert_text(0, "hello")).unwrap();
        a.apply_local(EditIntent::insert_text(5, " world")).unwrap();
        a.apply_local(EditIntent::delete(0, 6)).unwrap();
        assert_eq!(a.content(), "world");
        assert_eq!(a.clock(), 12);
        assert_eq!(a.state_vector().get(&ReplicaId::new("a")), 12);
    }

    #[test]
    fn test_local_clock_is_monotonic() {
        let mut a = doc("a");
        let first = a.apply_local(EditIntent::insert_text(0, "ab")).unwrap();
        let second = a.apply_local(EditIntent::delete(0, 1)).unwrap();
        assert_eq!(first.clock, 1);
        assert_eq!(second.clock, 3);
        assert_eq!(second.prev, 2);
    }

    #[test]
    fn test_invalid_intents() {
        let mut a = doc("a");
        assert!(matches!(
            a.apply_local(EditIntent::insert_text(1, "x")),
            Err(CoreError::InvalidIntent(_))
        ));
        assert!(a.apply_local(EditIntent::insert_text(0, "")).is_err());
        assert!(a.apply_local(EditIntent::delete(0, 1)).is_err());
        a.apply_local(EditIntent::insert_text(0, "x")).unwrap();
        assert!(a.apply_local(EditIntent::delete(0, 0)).is_err());
        assert_eq!(a.clock(), 1);
    }

    #[test]
    fn test_clock_exhaustion_is_refused() {
        let mut a = doc("a");
        a.apply_local(EditIntent::insert_text(0, "x")).unwrap();
        assert!(matches!(
            a.apply_local(EditIntent::delete(usize::MAX, 2)),
            Err(CoreError::InvalidIntent(_))
        ));

        let far = Delta {
            replica: ReplicaId::new("b"),
            clock: MAX_CLOCK,
            prev: 0,
            op: OpKind::Insert {
                origin: None,
                content: vec![Atom::Char('y')],
                attrs: Attrs::new(),
            },
        };
        assert!(matches!(a.apply_remote(far), Ok(ApplyResult::Applied(_))));
        assert_eq!(a.clock(), MAX_CLOCK);
        assert!(matches!(
            a.apply_local(EditIntent::insert_text(0, "z")),
            Err(CoreError::InvalidIntent(_))
        ));
        assert_eq!(a.content(), "yx");
    }

    #[test]
    fn test_remote_apply_and_duplicate() {
        let mut a = doc("a");
        let mut b = doc("b");
        let d = a.apply_local(EditIntent::insert_text(0, "hi")).unwrap();

        assert!(b.apply_remote(d.clone()).unwrap().changed());
        assert_eq!(b.apply_remote(d).unwrap(), ApplyResult::Duplicate);
        assert_eq!(b.content(), "hi");
        // Lamport: b's next op sorts after a's.
        let next = b.apply_local(EditIntent::insert_text(2, "!")).unwrap();
        assert_eq!(next.clock, 3);
    }

    #[test]
    fn test_out_of_order_is_buffered() {
        let mut a = doc("a");
        let mut b = doc("b");
        let d1 = a.apply_local(EditIntent::insert_text(0, "ab")).unwrap();
        let d2 = a.apply_local(EditIntent::delete(0, 1)).unwrap();

        assert_eq!(b.apply_remote(d2.clone()).unwrap(), ApplyResult::Pending);
        assert_eq!(b.apply_remote(d2).unwrap(), ApplyResult::Pending);
        assert_eq!(b.pending_count(), 1);

        match b.apply_remote(d1).unwrap() {
            ApplyResult::Applied(summary) => assert_eq!(summary.drained, 1),
            other => panic!("expected Applied, got {other:?}"),
        }
        assert_eq!(b.content(), "b");
        assert_eq!(b.pending_count(), 0);
    }

    #[test]
    fn test_cross_replica_dependency_is_buffered() {
        let mut a = doc("a");
        let mut b = doc("b");
        let mut c = doc("c");
        let d1 = a.apply_local(EditIntent::insert_text(0, "x")).unwrap();
        b.apply_remote(d1.clone()).unwrap();
        let d2 = b.apply_local(EditIntent::delete(0, 1)).unwrap();

        assert_eq!(c.apply_remote(d2).unwrap(), ApplyResult::Pending);
        assert!(c.apply_remote(d1).unwrap().changed());
        assert_eq!(c.content(), "");
        assert_eq!(c.state(), b.state());
    }

    #[test]
    fn test_pending_overflow() {
        let mut a = doc("a");
        let mut b = ReplicatedDocument::with_config(ReplicaId::new("b"), CoreConfig { max_pending: 1 });
        a.apply_local(EditIntent::insert_text(0, "a")).unwrap();
        let d2 = a.apply_local(EditIntent::insert_text(1, "b")).unwrap();
        let d3 = a.apply_local(EditIntent::insert_text(2, "c")).unwrap();
        assert_eq!(b.apply_remote(d2).unwrap(), ApplyResult::Pending);
        assert_eq!(
            b.apply_remote(d3),
            Err(CoreError::PendingOverflow { limit: 1 })
        );
    }

    #[test]
    fn test_malformed_bytes_leave_state_untouched() {
        let mut a = doc("a");
        a.apply_local(EditIntent::insert_text(0, "keep")).unwrap();
        let before = a.state().clone();
        assert!(matches!(
            a.apply_remote_bytes(&[1, 2, 3]),
            Err(CoreError::Decode(_))
        ));
        assert!(a.decode_and_merge(&[9, 9]).is_err());
        assert_eq!(a.state(), &before);
    }

    #[test]
    fn test_diff_since_is_minimal() {
        let mut a = doc("a");
        let mut b = doc("b");
        a.apply_local(EditIntent::insert_text(0, "one")).unwrap();
        b.decode_and_merge(&a.encode_state()).unwrap();
        a.apply_local(EditIntent::insert_text(3, "two")).unwrap();

        let diff = a.diff_since(b.state_vector());
        let batch = UpdateBatch::decode(&diff).unwrap();
        assert_eq!(batch.ops.len(), 1);

        let report = b.decode_and_merge(&diff).unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(b.content(), "onetwo");
    }

    #[test]
    fn test_format_attribute() {
        let mut a = doc("a");
        a.apply_local(EditIntent::insert_text(0, "bold")).unwrap();
        a.apply_local(EditIntent::Format {
            index: 1,
            len: 2,
            key: "bold".into(),
            value: Some("true".into()),
        })
        .unwrap();
        let bold: Vec<bool> = a
            .state()
            .visible()
            .map(|e| e.attr("bold").is_some())
            .collect();
        assert_eq!(bold, vec![false, true, true, false]);
    }

    #[test]
    fn test_relative_position_survives_remote_insert() {
        let mut a = doc("a");
        let mut b = doc("b");
        let d = a.apply_local(EditIntent::insert_text(0, "abc")).unwrap();
        b.apply_remote(d).unwrap();

        let caret = a.relative_position(2); // before 'c'
        let d = b.apply_local(EditIntent::insert_text(0, "XY")).unwrap();
        a.apply_remote(d).unwrap();
        assert_eq!(a.resolve(&caret), 4);
        assert_eq!(a.resolve(&a.relative_position(a.len())), a.len());
    }
}
