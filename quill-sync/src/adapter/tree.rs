//! The rich-text tree model as seen by the adapter.
//!
//! The editing surface owns its tree; the adapter only needs a block list,
//! a mutation API and a synchronous change notification. [`RichTree`] is a
//! complete in-memory implementation used by the demo and the tests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Inline marks on a run of text (`bold = true`, `link = https://…`).
pub type Marks = BTreeMap<String, String>;

/// Kind of a top-level block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    Paragraph,
    Heading(u8),
    ListItem,
    Quote,
    Code,
}

impl BlockKind {
    /// Name stored in the replicated `block` attribute.
    pub fn name(&self) -> String {
        match self {
            BlockKind::Paragraph => "paragraph".to_string(),
            BlockKind::Heading(level) => format!("heading{level}"),
            BlockKind::ListItem => "list_item".to_string(),
            BlockKind::Quote => "quote".to_string(),
            BlockKind::Code => "code".to_string(),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "paragraph" => Some(BlockKind::Paragraph),
            "list_item" => Some(BlockKind::ListItem),
            "quote" => Some(BlockKind::Quote),
            "code" => Some(BlockKind::Code),
            _ => {
                let level: u8 = name.strip_prefix("heading")?.parse().ok()?;
                (1..=6).contains(&level).then_some(BlockKind::Heading(level))
            }
        }
    }
}

/// A run of text sharing one set of marks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRun {
    pub text: String,
    pub marks: Marks,
}

impl TextRun {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            marks: Marks::new(),
        }
    }

    pub fn marked(text: impl Into<String>, key: &str, value: &str) -> Self {
        let mut marks = Marks::new();
        marks.insert(key.to_string(), value.to_string());
        Self {
            text: text.into(),
            marks,
        }
    }
}

/// A top-level block: kind plus coalesced text runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub kind: BlockKind,
    pub runs: Vec<TextRun>,
}

impl Block {
    pub fn new(kind: BlockKind, runs: Vec<TextRun>) -> Self {
        Self::from_chars(kind, Self { kind, runs }.chars())
    }

    pub fn paragraph(text: &str) -> Self {
        Self::new(BlockKind::Paragraph, vec![TextRun::plain(text)])
    }

    pub fn heading(level: u8, text: &str) -> Self {
        Self::new(BlockKind::Heading(level), vec![TextRun::plain(text)])
    }

    pub fn text(&self) -> String {
        self.runs.iter().map(|r| r.text.as_str()).collect()
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.runs.iter().map(|r| r.text.chars().count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten to one entry per char.
    pub fn chars(&self) -> Vec<(char, Marks)> {
        self.runs
            .iter()
            .flat_map(|run| run.text.chars().map(move |c| (c, run.marks.clone())))
            .collect()
    }

    /// Rebuild from chars, coalescing equal marks and dropping empty runs.
    pub fn from_chars(kind: BlockKind, chars: Vec<(char, Marks)>) -> Self {
        let mut runs: Vec<TextRun> = Vec::new();
        for (c, marks) in chars {
            match runs.last_mut() {
                Some(run) if run.marks == marks => run.text.push(c),
                _ => runs.push(TextRun {
                    text: c.to_string(),
                    marks,
                }),
            }
        }
        Self { kind, runs }
    }
}

/// A change to the tree, either requested by the editor or emitted as a
/// notification after it has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeMutation {
    InsertText {
        block: usize,
        offset: usize,
        text: String,
        marks: Marks,
    },
    DeleteText {
        block: usize,
        offset: usize,
        len: usize,
    },
    FormatText {
        block: usize,
        offset: usize,
        len: usize,
        key: String,
        value: Option<String>,
    },
    InsertBlock {
        index: usize,
        block: Block,
    },
    RemoveBlock {
        index: usize,
    },
    ReplaceBlock {
        index: usize,
        block: Block,
    },
    SetBlockKind {
        index: usize,
        kind: BlockKind,
    },
    /// Replace the whole tree.
    Reset {
        blocks: Vec<Block>,
    },
}

impl TreeMutation {
    pub fn insert_text(block: usize, offset: usize, text: &str) -> Self {
        TreeMutation::InsertText {
            block,
            offset,
            text: text.to_string(),
            marks: Marks::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("block {index} out of range (tree has {len} blocks)")]
    BlockOutOfRange { index: usize, len: usize },
    #[error("offset {offset}+{len} out of range in block {block} (length {block_len})")]
    OffsetOutOfRange {
        block: usize,
        offset: usize,
        len: usize,
        block_len: usize,
    },
    #[error("mutation rejected: {0}")]
    Rejected(String),
}

/// Synchronous change notification fired by the tree after each mutation.
pub type ChangeListener = Box<dyn FnMut(&TreeMutation) + Send>;

/// The tree API the adapter depends on.
pub trait TreeModel: Send {
    fn blocks(&self) -> &[Block];

    /// Apply one mutation and notify the listener. Must be all-or-nothing.
    fn apply(&mut self, mutation: &TreeMutation) -> Result<(), TreeError>;

    fn set_change_listener(&mut self, listener: Option<ChangeListener>);

    /// Empty, or a single empty block (what editors show for a new document).
    fn is_blank(&self) -> bool {
        let blocks = self.blocks();
        blocks.is_empty() || (blocks.len() == 1 && blocks[0].is_empty())
    }

    fn plain_text(&self) -> String {
        self.blocks()
            .iter()
            .map(Block::text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// In-memory rich-text tree.
#[derive(Default)]
pub struct RichTree {
    blocks: Vec<Block>,
    listener: Option<ChangeListener>,
}

impl RichTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blocks(blocks: Vec<Block>) -> Self {
        Self {
            blocks,
            listener: None,
        }
    }

    fn block_mut(&mut self, index: usize) -> Result<&mut Block, TreeError> {
        let len = self.blocks.len();
        self.blocks
            .get_mut(index)
            .ok_or(TreeError::BlockOutOfRange { index, len })
    }

    fn check_range(&self, block: usize, offset: usize, len: usize) -> Result<(), TreeError> {
        let count = self.blocks.len();
        let target = self
            .blocks
            .get(block)
            .ok_or(TreeError::BlockOutOfRange { index: block, len: count })?;
        let block_len = target.len();
        if offset + len > block_len {
            return Err(TreeError::OffsetOutOfRange {
                block,
                offset,
                len,
                block_len,
            });
        }
        Ok(())
    }

    fn mutate(&mut self, mutation: &TreeMutation) -> Result<(), TreeError> {
        match mutation {
            TreeMutation::InsertText { block, offset, text, marks } => {
                self.check_range(*block, *offset, 0)?;
                let target = self.block_mut(*block)?;
                let mut chars = target.chars();
                let insert = text.chars().map(|c| (c, marks.clone()));
                chars.splice(*offset..*offset, insert);
                *target = Block::from_chars(target.kind, chars);
            }
            TreeMutation::DeleteText { block, offset, len } => {
                self.check_range(*block, *offset, *len)?;
                let target = self.block_mut(*block)?;
                let mut chars = target.chars();
                chars.drain(*offset..*offset + *len);
                *target = Block::from_chars(target.kind, chars);
            }
            TreeMutation::FormatText { block, offset, len, key, value } => {
                self.check_range(*block, *offset, *len)?;
                let target = self.block_mut(*block)?;
                let mut chars = target.chars();
                for (_, marks) in &mut chars[*offset..*offset + *len] {
                    match value {
                        Some(v) => marks.insert(key.clone(), v.clone()),
                        None => marks.remove(key),
                    };
                }
                *target = Block::from_chars(target.kind, chars);
            }
            TreeMutation::InsertBlock { index, block } => {
                if *index > self.blocks.len() {
                    return Err(TreeError::BlockOutOfRange {
                        index: *index,
                        len: self.blocks.len(),
                    });
                }
                self.blocks.insert(*index, block.clone());
            }
            TreeMutation::RemoveBlock { index } => {
                self.block_mut(*index)?;
                self.blocks.remove(*index);
            }
            TreeMutation::ReplaceBlock { index, block } => {
                *self.block_mut(*index)? = block.clone();
            }
            TreeMutation::SetBlockKind { index, kind } => {
                self.block_mut(*index)?.kind = *kind;
            }
            TreeMutation::Reset { blocks } => {
                self.blocks = blocks.clone();
            }
        }
        Ok(())
    }
}

impl TreeModel for RichTree {
    fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    fn apply(&mut self, mutation: &TreeMutation) -> Result<(), TreeError> {
        self.mutate(mutation)?;
        if let Some(listener) = self.listener.as_mut() {
            listener(mutation);
        }
        Ok(())
    }

    fn set_change_listener(&mut self, listener: Option<ChangeListener>) {
        self.listener = listener;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_block_kind_names() {
        for kind in [
            BlockKind::Paragraph,
            BlockKind::Heading(2),
            BlockKind::ListItem,
            BlockKind::Quote,
            BlockKind::Code,
        ] {
            assert_eq!(BlockKind::parse(&kind.name()), Some(kind));
        }
        assert_eq!(BlockKind::parse("heading9"), None);
        assert_eq!(BlockKind::parse("table"), None);
    }

    #[test]
    fn test_runs_coalesce() {
        let block = Block::new(
            BlockKind::Paragraph,
            vec![TextRun::plain("ab"), TextRun::plain(""), TextRun::plain("c")],
        );
        assert_eq!(block.runs.len(), 1);
        assert_eq!(block.text(), "abc");
    }

    #[test]
    fn test_text_mutations() {
        let mut tree = RichTree::with_blocks(vec![Block::paragraph("hello")]);
        tree.apply(&TreeMutation::insert_text(0, 5, " world")).unwrap();
        tree.apply(&TreeMutation::FormatText {
            block: 0,
            offset: 0,
            len: 5,
            key: "bold".into(),
            value: Some("true".into()),
        })
        .unwrap();
        assert_eq!(tree.blocks()[0].runs.len(), 2);
        tree.apply(&TreeMutation::DeleteText { block: 0, offset: 0, len: 6 }).unwrap();
        assert_eq!(tree.plain_text(), "world");
        assert_eq!(tree.blocks()[0].runs.len(), 1);
    }

    #[test]
    fn test_out_of_range_is_rejected_without_notification() {
        let fired = Arc::new(Mutex::new(0));
        let counter = fired.clone();
        let mut tree = RichTree::with_blocks(vec![Block::paragraph("x")]);
        tree.set_change_listener(Some(Box::new(move |_| *counter.lock().unwrap() += 1)));

        assert!(tree.apply(&TreeMutation::insert_text(3, 0, "y")).is_err());
        assert!(tree
            .apply(&TreeMutation::DeleteText { block: 0, offset: 0, len: 2 })
            .is_err());
        assert_eq!(*fired.lock().unwrap(), 0);

        tree.apply(&TreeMutation::RemoveBlock { index: 0 }).unwrap();
        assert_eq!(*fired.lock().unwrap(), 1);
        assert!(tree.is_blank());
    }
}
