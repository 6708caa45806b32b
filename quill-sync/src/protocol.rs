//! Envelope for everything published on a document channel.
//!
//! Wire format (bincode, standard config):
//! ```text
//! ┌────────┬──────────┬──────────┬──────────┬──────────┬──────────┐
//! │ format │ msg_type │ origin   │ doc_id   │ target?  │ payload  │
//! │ 1 byte │ 1 byte   │ varlen   │ 16 bytes │ varlen   │ variable │
//! └────────┴──────────┴──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Channels:
//! - `quill/<doc_id>`: deltas, awareness and catch-up requests (fan-out)
//! - `quill/<doc_id>/<replica_id>`: catch-up replies addressed to one replica
//!
//! Performance target: envelope overhead < 64 bytes for a typical delta.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::delta::{decode_exact, encode};
use crate::core::{DecodeError, ReplicaId};

/// Current envelope format byte.
pub const PROTOCOL_VERSION: u8 = 1;

const CHANNEL_PREFIX: &str = "quill";

/// Broadcast channel shared by every replica of `doc_id`.
pub fn document_channel(doc_id: &Uuid) -> String {
    format!("{CHANNEL_PREFIX}/{doc_id}")
}

/// Channel only `replica` listens on, for addressed replies.
pub fn direct_channel(doc_id: &Uuid, replica: &ReplicaId) -> String {
    format!("{CHANNEL_PREFIX}/{doc_id}/{replica}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector of the sender, asking for what it is missing
    CatchUpRequest = 1,
    /// `diff_since` answer to a catch-up request
    CatchUpResponse = 2,
    /// One incremental delta
    Delta = 3,
    /// Awareness patch
    Awareness = 4,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub format: u8,
    pub msg_type: MessageType,
    /// Replica that produced the message (echo detection key).
    pub origin: ReplicaId,
    pub doc_id: Uuid,
    /// Addressee for directed messages; `None` = everyone.
    pub target: Option<ReplicaId>,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, origin: ReplicaId, doc_id: Uuid, payload: Vec<u8>) -> Self {
        Self {
            format: PROTOCOL_VERSION,
            msg_type,
            origin,
            doc_id,
            target: None,
            payload,
        }
    }

    pub fn delta(origin: ReplicaId, doc_id: Uuid, delta_bytes: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, origin, doc_id, delta_bytes)
    }

    pub fn catch_up_request(origin: ReplicaId, doc_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::CatchUpRequest, origin, doc_id, state_vector)
    }

    /// A catch-up request aimed at one replica (the reverse leg of a two-way catch-up).
    pub fn directed_catch_up_request(
        origin: ReplicaId,
        doc_id: Uuid,
        target: ReplicaId,
        state_vector: Vec<u8>,
    ) -> Self {
        Self {
            target: Some(target),
            ..Self::catch_up_request(origin, doc_id, state_vector)
        }
    }

    pub fn catch_up_response(
        origin: ReplicaId,
        doc_id: Uuid,
        target: ReplicaId,
        batch: Vec<u8>,
    ) -> Self {
        Self {
            target: Some(target),
            ..Self::new(MessageType::CatchUpResponse, origin, doc_id, batch)
        }
    }

    pub fn awareness(origin: ReplicaId, doc_id: Uuid, update: Vec<u8>) -> Self {
        Self::new(MessageType::Awareness, origin, doc_id, update)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    /// Decode an envelope; unknown format versions are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let msg: SyncMessage = decode_exact(bytes)?;
        if msg.format != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedFormat(msg.format));
        }
        Ok(msg)
    }

    /// Channel this message should be published on.
    pub fn channel(&self) -> String {
        match &self.target {
            Some(target) => direct_channel(&self.doc_id, target),
            None => document_channel(&self.doc_id),
        }
    }

    pub fn is_from(&self, replica: &ReplicaId) -> bool {
        &self.origin == replica
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica() -> ReplicaId {
        ReplicaId::new("alice-0a1b2c3d")
    }

    #[test]
    fn test_delta_envelope_roundtrip() {
        let doc = Uuid::new_v4();
        let msg = SyncMessage::delta(replica(), doc, vec![1, 2, 3]);
        let decoded = SyncMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.msg_type, MessageType::Delta);
        assert!(decoded.is_from(&replica()));
    }

    #[test]
    fn test_channels() {
        let doc = Uuid::nil();
        assert_eq!(
            document_channel(&doc),
            "quill/00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            direct_channel(&doc, &replica()),
            "quill/00000000-0000-0000-0000-000000000000/alice-0a1b2c3d"
        );

        let reply = SyncMessage::catch_up_response(ReplicaId::new("bob-1"), doc, replica(), vec![]);
        assert_eq!(reply.channel(), direct_channel(&doc, &replica()));
        let broadcast = SyncMessage::catch_up_request(replica(), doc, vec![]);
        assert_eq!(broadcast.channel(), document_channel(&doc));
    }

    #[test]
    fn test_unknown_format_rejected() {
        let mut msg = SyncMessage::awareness(replica(), Uuid::new_v4(), vec![9]);
        msg.format = 7;
        assert_eq!(
            SyncMessage::decode(&msg.encode()),
            Err(DecodeError::UnsupportedFormat(7))
        );
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        let mut bytes = SyncMessage::delta(replica(), Uuid::new_v4(), vec![]).encode();
        bytes.truncate(bytes.len() - 1);
        assert!(SyncMessage::decode(&bytes).is_err());
    }

    #[test]
    fn test_delta_size_efficient() {
        let msg = SyncMessage::delta(replica(), Uuid::new_v4(), vec![0u8; 50]);
        let overhead = msg.encode().len() - 50;
        assert!(overhead < 64, "envelope overhead {overhead} too large");
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::CatchUpRequest as u8, 1);
        assert_eq!(MessageType::CatchUpResponse as u8, 2);
        assert_eq!(MessageType::Delta as u8, 3);
        assert_eq!(MessageType::Awareness as u8, 4);
    }
}
