//! Replicated document core.
//!
//! ```text
//! EditIntent ──► ReplicatedDocument::apply_local ──► Delta ──► wire
//!                        │
//!   wire ──► Delta ──► apply_remote ──► Sequence (RGA + tombstones)
//!                        │
//!                        └── pending buffer (causally unready ops)
//! ```

pub mod delta;
pub mod document;
pub mod ids;
pub mod sequence;

pub use delta::{atoms, Atom, Attrs, DecodeError, Delta, OpKind, UpdateBatch, BLOCK_ATTR, MAX_CLOCK};
pub use document::{
    ApplyResult, CoreConfig, CoreError, EditIntent, MergeReport, RelativePosition,
    ReplicatedDocument, StateSummary,
};
pub use ids::{IdSpan, OpId, ReplicaId, StateVector};
pub use sequence::{DocumentState, Element, Stamped};
