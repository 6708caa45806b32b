//! Bridge between the editor's block tree and the replicated sequence.
//!
//! ```text
//!   tree edit ──► listener ──► apply_local_edit ──► EditIntent* ──► RDC ──► Delta*
//!                   ▲                                                       │
//!                   │ (suppressed while a guard is held)                    ▼
//!   tree ◄── materialize_remote_state ◄── RDC ◄── apply_remote ◄──────── wire
//! ```
//!
//! The replicated sequence is the tree flattened: every block contributes a
//! [`Atom::Break`] carrying `block=<kind>`, followed by its characters, each
//! carrying its run marks as attributes.
//!
//! If the replicated structure cannot be mapped back onto blocks (text before
//! the first break, an unknown block kind, or a tree that refuses a patch) the
//! tree is reset to a plain-text rendition: one paragraph per break, no marks.

pub mod guard;
pub mod tree;

use std::sync::Arc;
use thiserror::Error;

use crate::core::{Atom, Attrs, CoreError, Delta, DocumentState, EditIntent, ReplicatedDocument, BLOCK_ATTR};
use guard::{GuardFlags, GuardKind, ScopedFlag};
use tree::{Block, BlockKind, ChangeListener, Marks, TreeError, TreeModel, TreeMutation};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
    #[error("core error: {0}")]
    Core(#[from] CoreError),
    #[error("cannot project edit: {0}")]
    Projection(String),
}

/// Why replicated state could not be mapped onto blocks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructureError {
    #[error("text before the first block break")]
    OrphanText,
    #[error("unknown block kind {0:?}")]
    UnknownBlockKind(String),
}

/// Outcome of [`DocumentAdapter::materialize_remote_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Materialized {
    Unchanged,
    /// Tree patched with this many mutations.
    Patched(usize),
    /// Tree reset to the plain-text rendition.
    Fallback,
    /// A guard was held; nothing was touched.
    Skipped,
}

/// Outcome of the one-time bootstrap decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Replicated content was written into the tree.
    Materialized(Materialized),
    /// Tree content was seeded into an empty document.
    Seeded(Vec<Delta>),
    Nothing,
    /// The latch had already fired.
    AlreadyBootstrapped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub local_edits: u64,
    pub materializations: u64,
    pub fallbacks: u64,
}

/// Position of one block inside the visible replicated sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockSpan {
    /// Index of the block's break, `None` for leading text with no break.
    break_at: Option<usize>,
    text_start: usize,
    text_end: usize,
}

impl BlockSpan {
    fn start(&self) -> usize {
        self.break_at.unwrap_or(self.text_start)
    }

    fn text_len(&self) -> usize {
        self.text_end - self.text_start
    }
}

fn layout(state: &DocumentState) -> Vec<BlockSpan> {
    let mut spans: Vec<BlockSpan> = Vec::new();
    for (index, element) in state.visible().enumerate() {
        match element.atom {
            Atom::Break => spans.push(BlockSpan {
                break_at: Some(index),
                text_start: index + 1,
                text_end: index + 1,
            }),
            Atom::Char(_) => match spans.last_mut() {
                Some(span) => span.text_end = index + 1,
                None => spans.push(BlockSpan {
                    break_at: None,
                    text_start: 0,
                    text_end: 1,
                }),
            },
        }
    }
    spans
}

fn char_marks(attrs: Attrs) -> Marks {
    attrs.into_iter().filter(|(k, _)| k != BLOCK_ATTR).collect()
}

/// Map replicated state onto blocks.
pub fn build_blocks(state: &DocumentState) -> Result<Vec<Block>, StructureError> {
    let mut blocks: Vec<(BlockKind, Vec<(char, Marks)>)> = Vec::new();
    for element in state.visible() {
        match element.atom {
            Atom::Break => {
                let kind = match element.attr(BLOCK_ATTR) {
                    None => BlockKind::Paragraph,
                    Some(name) => BlockKind::parse(name)
                        .ok_or_else(|| StructureError::UnknownBlockKind(name.to_string()))?,
                };
                blocks.push((kind, Vec::new()));
            }
            Atom::Char(c) => {
                let (_, chars) = blocks.last_mut().ok_or(StructureError::OrphanText)?;
                chars.push((c, char_marks(element.attr_values())));
            }
        }
    }
    Ok(blocks
        .into_iter()
        .map(|(kind, chars)| Block::from_chars(kind, chars))
        .collect())
}

/// Degraded rendition: one paragraph per break, marks dropped.
pub fn plain_text_blocks(state: &DocumentState) -> Vec<Block> {
    layout(state)
        .into_iter()
        .map(|span| {
            let text: String = state
                .visible()
                .skip(span.text_start)
                .take(span.text_len())
                .map(|e| e.atom.as_char())
                .collect();
            Block::paragraph(&text)
        })
        .collect()
}

fn block_attrs(kind: BlockKind) -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert(BLOCK_ATTR.to_string(), kind.name());
    attrs
}

/// Intents inserting `block` (break plus runs) at visible index `at`.
fn insert_block_intents(at: usize, block: &Block) -> Vec<EditIntent> {
    let mut intents = vec![EditIntent::Insert {
        index: at,
        content: vec![Atom::Break],
        attrs: block_attrs(block.kind),
    }];
    let mut offset = at + 1;
    for run in &block.runs {
        let content: Vec<Atom> = run.text.chars().map(Atom::Char).collect();
        if content.is_empty() {
            continue;
        }
        let len = content.len();
        intents.push(EditIntent::Insert {
            index: offset,
            content,
            attrs: run.marks.clone(),
        });
        offset += len;
    }
    intents
}

fn remove_span_intent(span: &BlockSpan) -> Option<EditIntent> {
    let len = span.text_end - span.start();
    (len > 0).then(|| EditIntent::delete(span.start(), len))
}

/// Block-level patch turning `old` into `new`: keep the common prefix and
/// suffix, replace the middle pairwise, then insert or remove the remainder.
fn diff_blocks(old: &[Block], new: &[Block]) -> Vec<TreeMutation> {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];
    let shared = old_mid.len().min(new_mid.len());

    let mut mutations = Vec::new();
    for (i, block) in new_mid.iter().take(shared).enumerate() {
        if old_mid[i] != *block {
            mutations.push(TreeMutation::ReplaceBlock {
                index: prefix + i,
                block: block.clone(),
            });
        }
    }
    for (i, block) in new_mid.iter().enumerate().skip(shared) {
        mutations.push(TreeMutation::InsertBlock {
            index: prefix + i,
            block: block.clone(),
        });
    }
    for _ in shared..old_mid.len() {
        mutations.push(TreeMutation::RemoveBlock { index: prefix + shared });
    }
    mutations
}

/// The structured document adapter.
pub struct DocumentAdapter {
    flags: Arc<GuardFlags>,
    bootstrapped: bool,
    /// Blank blocks the tree showed at bootstrap with no replicated
    /// counterpart yet. Their breaks are written with the first local edit.
    placeholder: Vec<Block>,
    stats: AdapterStats,
}

impl Default for DocumentAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentAdapter {
    pub fn new() -> Self {
        Self {
            flags: GuardFlags::new(),
            bootstrapped: false,
            placeholder: Vec::new(),
            stats: AdapterStats::default(),
        }
    }

    pub fn guards(&self) -> &Arc<GuardFlags> {
        &self.flags
    }

    pub fn stats(&self) -> AdapterStats {
        self.stats
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// Build the tree change listener.
    ///
    /// The guard check runs synchronously inside the tree's notification, so
    /// the adapter's own writes never reach `sink`.
    pub fn listener<F>(&self, mut sink: F) -> ChangeListener
    where
        F: FnMut(TreeMutation) + Send + 'static,
    {
        let flags = Arc::clone(&self.flags);
        Box::new(move |mutation: &TreeMutation| {
            if flags.any_held() {
                flags.record_suppressed();
                log::trace!("suppressed tree notification while a guard is held");
                return;
            }
            sink(mutation.clone());
        })
    }

    // ─── Local direction ────────────────────────────────────────────

    /// Translate a tree mutation into edit intents against the current
    /// replicated view. Intents are meant to be applied in order.
    pub fn project_local_edit(
        &self,
        mutation: &TreeMutation,
        doc: &ReplicatedDocument,
    ) -> Result<Vec<EditIntent>, AdapterError> {
        let spans = layout(doc.state());
        let span_of = |index: usize| {
            spans.get(index).copied().ok_or_else(|| {
                AdapterError::Projection(format!(
                    "block {index} not in replicated view ({} blocks)",
                    spans.len()
                ))
            })
        };
        let check_text = |span: &BlockSpan, offset: usize, len: usize| {
            if offset + len > span.text_len() {
                return Err(AdapterError::Projection(format!(
                    "range {offset}+{len} beyond block length {}",
                    span.text_len()
                )));
            }
            Ok(span.text_start + offset)
        };

        let intents = match mutation {
            TreeMutation::InsertText { block, offset, text, marks } => {
                let span = span_of(*block)?;
                let at = check_text(&span, *offset, 0)?;
                let content: Vec<Atom> = text.chars().map(Atom::Char).collect();
                if content.is_empty() {
                    Vec::new()
                } else {
                    vec![EditIntent::Insert {
                        index: at,
                        content,
                        attrs: marks.clone(),
                    }]
                }
            }
            TreeMutation::DeleteText { block, offset, len } => {
                let span = span_of(*block)?;
                let at = check_text(&span, *offset, *len)?;
                if *len == 0 {
                    Vec::new()
                } else {
                    vec![EditIntent::delete(at, *len)]
                }
            }
            TreeMutation::FormatText { block, offset, len, key, value } => {
                let span = span_of(*block)?;
                let at = check_text(&span, *offset, *len)?;
                if *len == 0 {
                    Vec::new()
                } else {
                    vec![EditIntent::Format {
                        index: at,
                        len: *len,
                        key: key.clone(),
                        value: value.clone(),
                    }]
                }
            }
            TreeMutation::InsertBlock { index, block } => {
                let at = match spans.get(*index) {
                    Some(span) => span.start(),
                    None if *index == spans.len() => doc.len(),
                    None => {
                        return Err(AdapterError::Projection(format!(
                            "cannot insert block at {index} ({} blocks)",
                            spans.len()
                        )))
                    }
                };
                let mut intents = insert_block_intents(at, block);
                // Leading text would join the new block; give it its own break.
                if spans.get(*index).is_some_and(|span| span.break_at.is_none()) {
                    intents.push(EditIntent::Insert {
                        index: at + 1 + block.len(),
                        content: vec![Atom::Break],
                        attrs: block_attrs(BlockKind::Paragraph),
                    });
                }
                intents
            }
            TreeMutation::RemoveBlock { index } => {
                let span = span_of(*index)?;
                remove_span_intent(&span).into_iter().collect()
            }
            TreeMutation::ReplaceBlock { index, block } => {
                let span = span_of(*index)?;
                let mut intents: Vec<EditIntent> = remove_span_intent(&span).into_iter().collect();
                intents.extend(insert_block_intents(span.start(), block));
                intents
            }
            TreeMutation::SetBlockKind { index, kind } => {
                let span = span_of(*index)?;
                match span.break_at {
                    Some(at) => vec![EditIntent::Format {
                        index: at,
                        len: 1,
                        key: BLOCK_ATTR.to_string(),
                        value: Some(kind.name()),
                    }],
                    // Leading text gains an explicit break.
                    None => vec![EditIntent::Insert {
                        index: 0,
                        content: vec![Atom::Break],
                        attrs: block_attrs(*kind),
                    }],
                }
            }
            TreeMutation::Reset { blocks } => {
                let mut intents = Vec::new();
                if !doc.is_empty() {
                    intents.push(EditIntent::delete(0, doc.len()));
                }
                let mut at = 0;
                for block in blocks {
                    intents.extend(insert_block_intents(at, block));
                    at += 1 + block.len();
                }
                intents
            }
        };
        Ok(intents)
    }

    /// Project a tree mutation and apply it to the document.
    ///
    /// Runs under the applying-local guard; a re-entrant call is refused.
    pub fn apply_local_edit(
        &mut self,
        mutation: &TreeMutation,
        doc: &mut ReplicatedDocument,
    ) -> Result<Vec<Delta>, AdapterError> {
        let _guard = ScopedFlag::acquire(&self.flags, GuardKind::ApplyingLocal)
            .ok_or_else(|| AdapterError::Projection("local edit already in progress".into()))?;

        let blank = std::mem::take(&mut self.placeholder);
        let intents = if !blank.is_empty() && doc.is_empty() {
            match self.project_over_placeholder(&blank, mutation, doc) {
                Ok(intents) => {
                    log::debug!("first local edit writes {} placeholder blocks", blank.len());
                    intents
                }
                Err(e) => {
                    self.placeholder = blank;
                    return Err(e);
                }
            }
        } else {
            self.project_local_edit(mutation, doc)?
        };

        let mut deltas = Vec::with_capacity(intents.len());
        for intent in intents {
            deltas.push(doc.apply_local(intent)?);
        }
        self.stats.local_edits += 1;
        Ok(deltas)
    }

    /// Intents writing the placeholder breaks, then `mutation` projected on
    /// top of them. Worked out on a scratch copy so a refused edit leaves the
    /// document untouched.
    fn project_over_placeholder(
        &self,
        blank: &[Block],
        mutation: &TreeMutation,
        doc: &ReplicatedDocument,
    ) -> Result<Vec<EditIntent>, AdapterError> {
        let mut scratch = ReplicatedDocument::new(doc.replica_id().clone());
        let mut intents = Vec::new();
        let mut at = 0;
        for block in blank {
            for intent in insert_block_intents(at, block) {
                scratch.apply_local(intent.clone())?;
                intents.push(intent);
            }
            at += 1 + block.len();
        }
        intents.extend(self.project_local_edit(mutation, &scratch)?);
        Ok(intents)
    }

    // ─── Remote direction ───────────────────────────────────────────

    /// Bring the tree in line with the replicated state.
    pub fn materialize_remote_state(
        &mut self,
        doc: &ReplicatedDocument,
        tree: &mut dyn TreeModel,
    ) -> Result<Materialized, AdapterError> {
        if self.flags.applying_local() {
            return Ok(Materialized::Skipped);
        }
        let Some(_guard) = ScopedFlag::acquire(&self.flags, GuardKind::ApplyingRemote) else {
            return Ok(Materialized::Skipped);
        };
        if !self.placeholder.is_empty() {
            // Nothing replicated yet: the tree's blank blocks stay.
            if doc.is_empty() {
                return Ok(Materialized::Unchanged);
            }
            self.placeholder.clear();
        }

        let target = match build_blocks(doc.state()) {
            Ok(blocks) => blocks,
            Err(e) => {
                log::warn!("replicated structure unusable ({e}), falling back to plain text");
                return self.fallback(doc, tree);
            }
        };

        let mutations = diff_blocks(tree.blocks(), &target);
        if mutations.is_empty() {
            return Ok(Materialized::Unchanged);
        }
        for mutation in &mutations {
            if let Err(e) = tree.apply(mutation) {
                log::warn!("tree refused patch ({e}), falling back to plain text");
                return self.fallback(doc, tree);
            }
        }
        self.stats.materializations += 1;
        log::debug!("materialized {} block mutations", mutations.len());
        Ok(Materialized::Patched(mutations.len()))
    }

    fn fallback(
        &mut self,
        doc: &ReplicatedDocument,
        tree: &mut dyn TreeModel,
    ) -> Result<Materialized, AdapterError> {
        let blocks = plain_text_blocks(doc.state());
        tree.apply(&TreeMutation::Reset { blocks })?;
        self.stats.fallbacks += 1;
        Ok(Materialized::Fallback)
    }

    /// One-time reconciliation between a freshly loaded document and the tree.
    ///
    /// Replicated content wins when present; otherwise existing tree content
    /// seeds an empty document. A blank tree seeds nothing yet: its empty
    /// blocks are written with the first local edit, so idle replicas never
    /// add empty paragraphs.
    pub fn bootstrap(
        &mut self,
        doc: &mut ReplicatedDocument,
        tree: &mut dyn TreeModel,
    ) -> Result<BootstrapOutcome, AdapterError> {
        if self.bootstrapped {
            return Ok(BootstrapOutcome::AlreadyBootstrapped);
        }
        self.bootstrapped = true;

        if !doc.is_empty() {
            let outcome = self.materialize_remote_state(doc, tree)?;
            log::info!("bootstrap: materialized replicated state ({outcome:?})");
            return Ok(BootstrapOutcome::Materialized(outcome));
        }
        if tree.is_blank() {
            self.placeholder = tree.blocks().to_vec();
            return Ok(BootstrapOutcome::Nothing);
        }

        let blocks = tree.blocks().to_vec();
        let mut deltas = Vec::new();
        for (index, block) in blocks.into_iter().enumerate() {
            deltas.extend(self.apply_local_edit(&TreeMutation::InsertBlock { index, block }, doc)?);
        }
        log::info!("bootstrap: seeded document with {} ops from the tree", deltas.len());
        Ok(BootstrapOutcome::Seeded(deltas))
    }

    /// Drop both guards (teardown).
    pub fn release_guards(&self) {
        self.flags.release_all();
    }
}
