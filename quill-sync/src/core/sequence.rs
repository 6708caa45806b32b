//! Replicated growable array with tombstones and per-key LWW attributes.
//!
//! Elements are kept in document order, deleted ones included. An insert is
//! placed after its origin, skipping every element with a greater
//! `(clock, replica)` id. Because ids are Lamport stamps, anything inserted
//! after a greater sibling is itself greater, so whole sibling subtrees are
//! skipped and concurrent siblings end up in descending id order on every
//! replica.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use super::delta::{Atom, Attrs};
use super::ids::{IdSpan, OpId};

/// An attribute value together with the op that wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamped {
    pub stamp: OpId,
    pub value: Option<String>,
}

/// One element of the sequence (live or tombstoned).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub id: OpId,
    pub atom: Atom,
    pub deleted: bool,
    pub attrs: BTreeMap<String, Stamped>,
}

impl Element {
    /// Live attribute values (cleared keys omitted).
    pub fn attr_values(&self) -> Attrs {
        self.attrs
            .iter()
            .filter_map(|(k, v)| v.value.as_ref().map(|value| (k.clone(), value.clone())))
            .collect()
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(|s| s.value.as_deref())
    }
}

/// Materialised document state, including tombstones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentState {
    pub elements: Vec<Element>,
}

impl DocumentState {
    /// Visible elements in order.
    pub fn visible(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter().filter(|e| !e.deleted)
    }

    /// Visible content, breaks rendered as `\n`.
    pub fn content(&self) -> String {
        self.visible().map(|e| e.atom.as_char()).collect()
    }

    pub fn tombstones(&self) -> usize {
        self.elements.iter().filter(|e| e.deleted).count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sequence {
    state: DocumentState,
    known: HashSet<OpId>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.known.contains(id)
    }

    pub fn contains_span(&self, span: &IdSpan) -> bool {
        span.ids().all(|id| self.known.contains(&id))
    }

    fn position(&self, id: &OpId) -> Option<usize> {
        self.state.elements.iter().position(|e| &e.id == id)
    }

    /// Integrate a run of atoms whose ids are `first..first+len` of one replica.
    ///
    /// The caller guarantees causal readiness (origin present, ids unseen).
    pub fn integrate_insert(
        &mut self,
        origin: Option<&OpId>,
        first: &OpId,
        content: &[Atom],
        attrs: &Attrs,
    ) {
        let mut pos = match origin {
            Some(origin) => self.position(origin).map_or(0, |p| p + 1),
            None => 0,
        };
        while pos < self.state.elements.len() && self.state.elements[pos].id > *first {
            pos += 1;
        }

        let run = content.iter().enumerate().map(|(i, atom)| {
            let id = OpId::new(first.replica.clone(), first.clock + i as u64);
            let attrs = attrs
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        Stamped {
                            stamp: id.clone(),
                            value: Some(v.clone()),
                        },
                    )
                })
                .collect();
            Element {
                id,
                atom: *atom,
                deleted: false,
                attrs,
            }
        });
        let run: Vec<Element> = run.collect();
        for element in &run {
            self.known.insert(element.id.clone());
        }
        self.state.elements.splice(pos..pos, run);
    }

    /// Tombstone every element in `targets`. Returns how many were newly deleted.
    pub fn delete(&mut self, targets: &[IdSpan]) -> usize {
        let wanted: HashSet<OpId> = targets.iter().flat_map(|t| t.ids()).collect();
        let mut removed = 0;
        for element in self.state.elements.iter_mut() {
            if !element.deleted && wanted.contains(&element.id) {
                element.deleted = true;
                removed += 1;
            }
        }
        removed
    }

    /// Write `key = value` on every target whose current stamp is older than `stamp`.
    pub fn format(&mut self, targets: &[IdSpan], key: &str, value: Option<&str>, stamp: &OpId) -> usize {
        let wanted: HashSet<OpId> = targets.iter().flat_map(|t| t.ids()).collect();
        let mut changed = 0;
        for element in self.state.elements.iter_mut() {
            if !wanted.contains(&element.id) {
                continue;
            }
            let newer = element
                .attrs
                .get(key)
                .map_or(true, |current| *stamp > current.stamp);
            if newer {
                element.attrs.insert(
                    key.to_string(),
                    Stamped {
                        stamp: stamp.clone(),
                        value: value.map(str::to_string),
                    },
                );
                changed += 1;
            }
        }
        changed
    }

    pub fn visible_len(&self) -> usize {
        self.state.visible().count()
    }

    /// Id of the visible element at `index`.
    pub fn visible_id(&self, index: usize) -> Option<&OpId> {
        self.state.visible().nth(index).map(|e| &e.id)
    }

    /// Ids of the visible elements in `index..index + len` (fewer if out of range).
    pub fn visible_ids(&self, index: usize, len: usize) -> Vec<OpId> {
        self.state
            .visible()
            .skip(index)
            .take(len)
            .map(|e| e.id.clone())
            .collect()
    }

    /// Visible index of element `id`: the number of live elements before it,
    /// and whether the element itself is live.
    pub fn visible_index_of(&self, id: &OpId) -> Option<(usize, bool)> {
        let mut live_before = 0;
        for element in &self.state.elements {
            if &element.id == id {
                return Some((live_before, !element.deleted));
            }
            if !element.deleted {
                live_before += 1;
            }
        }
        None
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    pub fn element_count(&self) -> usize {
        self.state.elements.len()
    }
}
