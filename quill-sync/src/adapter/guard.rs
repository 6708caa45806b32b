//! Scoped re-entrancy flags shared between the adapter and the tree listener.
//!
//! A [`ScopedFlag`] sets its flag on acquisition and clears it on drop, so the
//! flag is released on every exit path, early returns and unwinding included.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardKind {
    /// The adapter is writing replicated state into the tree.
    ApplyingRemote,
    /// The adapter is projecting a tree edit into the replicated document.
    ApplyingLocal,
}

/// Flags read synchronously by the tree change listener.
#[derive(Debug, Default)]
pub struct GuardFlags {
    applying_remote: AtomicBool,
    applying_local: AtomicBool,
    suppressed: AtomicU64,
}

impl GuardFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn flag(&self, kind: GuardKind) -> &AtomicBool {
        match kind {
            GuardKind::ApplyingRemote => &self.applying_remote,
            GuardKind::ApplyingLocal => &self.applying_local,
        }
    }

    pub fn is_held(&self, kind: GuardKind) -> bool {
        self.flag(kind).load(Ordering::SeqCst)
    }

    pub fn applying_remote(&self) -> bool {
        self.is_held(GuardKind::ApplyingRemote)
    }

    pub fn applying_local(&self) -> bool {
        self.is_held(GuardKind::ApplyingLocal)
    }

    /// True while either direction is in flight; tree notifications are then
    /// the adapter's own writes and must not be projected again.
    pub fn any_held(&self) -> bool {
        self.applying_remote() || self.applying_local()
    }

    /// Count a notification dropped because a guard was held.
    pub fn record_suppressed(&self) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Force both flags down (teardown).
    pub fn release_all(&self) {
        self.applying_remote.store(false, Ordering::SeqCst);
        self.applying_local.store(false, Ordering::SeqCst);
    }
}

/// RAII holder of one guard flag.
#[derive(Debug)]
pub struct ScopedFlag {
    flags: Arc<GuardFlags>,
    kind: GuardKind,
}

impl ScopedFlag {
    /// Set `kind`, or return `None` if it is already held (re-entrant call).
    pub fn acquire(flags: &Arc<GuardFlags>, kind: GuardKind) -> Option<Self> {
        flags
            .flag(kind)
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        Some(Self {
            flags: Arc::clone(flags),
            kind,
        })
    }

    pub fn kind(&self) -> GuardKind {
        self.kind
    }
}

impl Drop for ScopedFlag {
    fn drop(&mut self) {
        self.flags.flag(self.kind).store(false, Ordering::SeqCst);
    }
}
