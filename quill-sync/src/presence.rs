//! Awareness: who is in the document, where their cursor is, and whether
//! they are still around.
//!
//! ## Architecture
//!
//! ```text
//! set_local_field(Cursor(..))
//!       │  (only changed fields, seq += 1)
//!       ▼
//! AwarenessUpdate { version, patches: [EntryPatch { replica, seq, fields }] }
//!       │
//!       ▼   (document channel, best effort)
//! remote AwarenessTable::on_remote_update()
//!       │  (stale seq ignored, Offline removes)
//!       ▼
//! entries(now)  ── silence > timeout ──► hidden, then purged
//! ```
//!
//! Fields travel as `(tag, bytes)` pairs so a replica running an older build
//! skips fields it does not know instead of rejecting the whole update.
//! Nothing here is persisted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::core::delta::{decode_exact, encode};
use crate::core::{DecodeError, RelativePosition, ReplicaId};

/// Current awareness wire version.
pub const AWARENESS_VERSION: u8 = 1;

// ───────────────────────────────────────────────────────────────────
// Field schema
// ───────────────────────────────────────────────────────────────────

/// RGBA colour for a remote caret and selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid colour for a replica.
    ///
    /// The hue comes from the replica id hash; saturation and lightness are
    /// fixed so every cursor reads well on a light background.
    pub fn for_replica(replica: &ReplicaId) -> Self {
        let hue = ((replica.stable_hash() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb`, alpha dropped.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Caret (`anchor == head`) or selection, anchored on document elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: RelativePosition,
    pub head: RelativePosition,
}

impl CursorRange {
    pub fn caret(at: RelativePosition) -> Self {
        Self {
            anchor: at.clone(),
            head: at,
        }
    }

    pub fn is_caret(&self) -> bool {
        self.anchor == self.head
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Connectivity {
    #[default]
    Online,
    Away,
    Offline,
}

/// One awareness field. Each variant has a fixed wire tag.
#[derive(Debug, Clone, PartialEq)]
pub enum AwarenessField {
    Identity { name: String },
    Color(CursorColor),
    Cursor(Option<CursorRange>),
    Connectivity(Connectivity),
}

impl AwarenessField {
    pub const TAG_IDENTITY: u8 = 1;
    pub const TAG_COLOR: u8 = 2;
    pub const TAG_CURSOR: u8 = 3;
    pub const TAG_CONNECTIVITY: u8 = 4;

    pub fn tag(&self) -> u8 {
        match self {
            AwarenessField::Identity { .. } => Self::TAG_IDENTITY,
            AwarenessField::Color(_) => Self::TAG_COLOR,
            AwarenessField::Cursor(_) => Self::TAG_CURSOR,
            AwarenessField::Connectivity(_) => Self::TAG_CONNECTIVITY,
        }
    }

    fn to_tagged(&self) -> TaggedField {
        let bytes = match self {
            AwarenessField::Identity { name } => encode(name),
            AwarenessField::Color(color) => encode(color),
            AwarenessField::Cursor(cursor) => encode(cursor),
            AwarenessField::Connectivity(c) => encode(c),
        };
        TaggedField {
            tag: self.tag(),
            bytes,
        }
    }

    /// `Ok(None)` for tags this build does not know.
    fn from_tagged(field: &TaggedField) -> Result<Option<Self>, DecodeError> {
        let value = match field.tag {
            Self::TAG_IDENTITY => AwarenessField::Identity {
                name: decode_exact(&field.bytes)?,
            },
            Self::TAG_COLOR => AwarenessField::Color(decode_exact(&field.bytes)?),
            Self::TAG_CURSOR => AwarenessField::Cursor(decode_exact(&field.bytes)?),
            Self::TAG_CONNECTIVITY => AwarenessField::Connectivity(decode_exact(&field.bytes)?),
            _ => return Ok(None),
        };
        Ok(Some(value))
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire protocol
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedField {
    pub tag: u8,
    pub bytes: Vec<u8>,
}

/// Changes to one replica's entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPatch {
    pub replica: ReplicaId,
    /// Per-replica sequence; patches at or below the last seen are stale.
    pub seq: u64,
    pub fields: Vec<TaggedField>,
}

/// Payload of an awareness message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub version: u8,
    pub patches: Vec<EntryPatch>,
}

impl AwarenessUpdate {
    fn single(replica: ReplicaId, seq: u64, fields: &[AwarenessField]) -> Self {
        Self {
            version: AWARENESS_VERSION,
            patches: vec![EntryPatch {
                replica,
                seq,
                fields: fields.iter().map(AwarenessField::to_tagged).collect(),
            }],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let update: Self = decode_exact(bytes)?;
        if update.version != AWARENESS_VERSION {
            return Err(DecodeError::UnsupportedFormat(update.version));
        }
        Ok(update)
    }
}

// ───────────────────────────────────────────────────────────────────
// Entries
// ───────────────────────────────────────────────────────────────────

/// The fields one replica publishes about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessState {
    pub identity: Option<String>,
    pub color: CursorColor,
    pub cursor: Option<CursorRange>,
    pub connectivity: Connectivity,
}

impl AwarenessState {
    fn for_replica(replica: &ReplicaId) -> Self {
        Self {
            identity: None,
            color: CursorColor::for_replica(replica),
            cursor: None,
            connectivity: Connectivity::Online,
        }
    }

    /// Apply one field; `true` if anything changed.
    fn set(&mut self, field: AwarenessField) -> bool {
        match field {
            AwarenessField::Identity { name } => {
                let changed = self.identity.as_deref() != Some(name.as_str());
                self.identity = Some(name);
                changed
            }
            AwarenessField::Color(color) => std::mem::replace(&mut self.color, color) != color,
            AwarenessField::Cursor(cursor) => {
                let changed = self.cursor != cursor;
                self.cursor = cursor;
                changed
            }
            AwarenessField::Connectivity(c) => std::mem::replace(&mut self.connectivity, c) != c,
        }
    }

    fn fields(&self) -> Vec<AwarenessField> {
        let mut fields = Vec::with_capacity(4);
        if let Some(name) = &self.identity {
            fields.push(AwarenessField::Identity { name: name.clone() });
        }
        fields.push(AwarenessField::Color(self.color));
        fields.push(AwarenessField::Cursor(self.cursor.clone()));
        fields.push(AwarenessField::Connectivity(self.connectivity));
        fields
    }
}

/// A remote replica as currently known.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub replica: ReplicaId,
    pub state: AwarenessState,
    pub seq: u64,
    pub last_seen: Instant,
}

impl AwarenessEntry {
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    /// Display name, falling back to the replica id.
    pub fn display_name(&self) -> &str {
        self.state.identity.as_deref().unwrap_or(self.replica.as_str())
    }
}

/// What a remote update did to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Joined(ReplicaId),
    Updated(ReplicaId),
    Left(ReplicaId),
}

#[derive(Debug, Clone)]
pub struct AwarenessConfig {
    /// Silence after which a remote entry expires.
    pub timeout: Duration,
    /// How often the local entry is re-broadcast.
    pub heartbeat: Duration,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }
}

impl AwarenessConfig {
    /// Heartbeat at half the timeout, so one lost heartbeat never expires a peer.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            heartbeat: timeout / 2,
        }
    }

    pub fn for_testing() -> Self {
        Self::with_timeout(Duration::from_millis(300))
    }
}

/// Local awareness state plus the last known state of every remote replica.
pub struct AwarenessTable {
    local_replica: ReplicaId,
    local: AwarenessState,
    local_seq: u64,
    remote: HashMap<ReplicaId, AwarenessEntry>,
    /// Last seq of replicas that left, so a delayed older patch cannot bring
    /// them back. Kept for one timeout.
    departed: HashMap<ReplicaId, (u64, Instant)>,
    config: AwarenessConfig,
}

impl AwarenessTable {
    pub fn new(local_replica: ReplicaId, config: AwarenessConfig) -> Self {
        let local = AwarenessState::for_replica(&local_replica);
        Self {
            local_replica,
            local,
            local_seq: 0,
            remote: HashMap::new(),
            departed: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &AwarenessConfig {
        &self.config
    }

    pub fn local(&self) -> &AwarenessState {
        &self.local
    }

    /// Update a local field. `None` when the value did not change.
    pub fn set_local_field(&mut self, field: AwarenessField) -> Option<AwarenessUpdate> {
        if !self.local.set(field.clone()) {
            return None;
        }
        self.local_seq += 1;
        Some(AwarenessUpdate::single(
            self.local_replica.clone(),
            self.local_seq,
            &[field],
        ))
    }

    /// Full local entry; sent on connect and as the heartbeat.
    pub fn local_state_update(&mut self) -> AwarenessUpdate {
        self.local_seq += 1;
        AwarenessUpdate::single(self.local_replica.clone(), self.local_seq, &self.local.fields())
    }

    /// Going-offline signal. Peers drop the entry on receipt.
    pub fn offline_update(&mut self) -> AwarenessUpdate {
        self.local.connectivity = Connectivity::Offline;
        self.local_seq += 1;
        AwarenessUpdate::single(
            self.local_replica.clone(),
            self.local_seq,
            &[AwarenessField::Connectivity(Connectivity::Offline)],
        )
    }

    /// Merge an update received from the network.
    pub fn on_remote_update(&mut self, update: &AwarenessUpdate, now: Instant) -> Vec<PresenceChange> {
        let mut changes = Vec::new();
        for patch in &update.patches {
            if patch.replica == self.local_replica {
                continue;
            }
            let known = self.remote.get(&patch.replica);
            let floor = known.map(|e| e.seq).or_else(|| self.departed_seq(&patch.replica, now));
            if floor.is_some_and(|seq| patch.seq <= seq) {
                log::trace!("stale awareness seq {} from {}", patch.seq, patch.replica);
                continue;
            }
            let joined = known.is_none();

            let mut state = known
                .map(|e| e.state.clone())
                .unwrap_or_else(|| AwarenessState::for_replica(&patch.replica));
            for tagged in &patch.fields {
                match AwarenessField::from_tagged(tagged) {
                    Ok(Some(field)) => {
                        state.set(field);
                    }
                    Ok(None) => log::trace!("ignoring unknown awareness field {}", tagged.tag),
                    Err(e) => log::warn!("bad awareness field {} from {}: {e}", tagged.tag, patch.replica),
                }
            }

            if state.connectivity == Connectivity::Offline {
                self.departed.insert(patch.replica.clone(), (patch.seq, now));
                if self.remote.remove(&patch.replica).is_some() {
                    log::debug!("{} went offline", patch.replica);
                    changes.push(PresenceChange::Left(patch.replica.clone()));
                }
                continue;
            }
            self.departed.remove(&patch.replica);

            self.remote.insert(
                patch.replica.clone(),
                AwarenessEntry {
                    replica: patch.replica.clone(),
                    state,
                    seq: patch.seq,
                    last_seen: now,
                },
            );
            changes.push(if joined {
                PresenceChange::Joined(patch.replica.clone())
            } else {
                PresenceChange::Updated(patch.replica.clone())
            });
        }
        changes
    }

    /// Drop entries silent for longer than the timeout.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<ReplicaId> {
        let timeout = self.config.timeout;
        let stale: Vec<ReplicaId> = self
            .remote
            .values()
            .filter(|e| e.is_expired(now, timeout))
            .map(|e| e.replica.clone())
            .collect();
        for id in &stale {
            if let Some(entry) = self.remote.remove(id) {
                self.departed.insert(id.clone(), (entry.seq, now));
            }
            log::debug!("awareness entry for {id} expired");
        }
        self.departed
            .retain(|_, (_, at)| now.saturating_duration_since(*at) <= timeout);
        stale
    }

    fn departed_seq(&self, replica: &ReplicaId, now: Instant) -> Option<u64> {
        self.departed
            .get(replica)
            .filter(|(_, at)| now.saturating_duration_since(*at) <= self.config.timeout)
            .map(|(seq, _)| *seq)
    }

    /// Live remote entries, ordered by replica id. Expired entries are never
    /// returned even before the next purge.
    pub fn entries(&self, now: Instant) -> Vec<AwarenessEntry> {
        let mut live: Vec<AwarenessEntry> = self
            .remote
            .values()
            .filter(|e| !e.is_expired(now, self.config.timeout))
            .cloned()
            .collect();
        live.sort_by(|a, b| a.replica.cmp(&b.replica));
        live
    }

    pub fn live_count(&self, now: Instant) -> usize {
        self.remote
            .values()
            .filter(|e| !e.is_expired(now, self.config.timeout))
            .count()
    }

    pub fn get(&self, replica: &ReplicaId) -> Option<&AwarenessEntry> {
        self.remote.get(replica)
    }

    pub fn clear(&mut self) {
        self.remote.clear();
        self.departed.clear();
    }
}
