// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Realtime wire schema.
//!
//! Peers exchange JSON packets over an opaque duplex transport. Every value
//! entry pairs the sender's **pre-merge hash** with the new value so a
//! receiver can tell three situations apart without any peer coordination:
//!
//! * the received value hashes like its own store value — a spurious
//!   re-broadcast of its own write, ignored;
//! * its store hash equals the sender's pre-merge hash — a fast-forward,
//!   applied directly;
//! * anything else — both sides moved, so the conflict primitive merges and
//!   the merged value is re-broadcast for convergence.
//!
//! Frames on the wire are `u32` big-endian length + JSON bytes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use trellis_ident::NodeId;
use trellis_merge::ValueHash;

/// Packet entry for one node's content: (pre-merge hash, new lines).
pub type ContentEntry = (ValueHash, Vec<String>);

/// Packet entry for one node's children: (pre-merge hash, new id list).
pub type ChildrenEntry = (ValueHash, Vec<NodeId>);

/// Seconds after which an inbound packet is too stale to apply.
pub const STALE_PACKET_SECS: u64 = 5;

/// Seconds after which a presence record no longer counts as online.
pub const PRESENCE_TTL_SECS: u64 = 5;

/// Stable error name a hub answers with when its presence table cannot
/// serve ranged queries.
pub const ERR_PRESENCE_INDEX: &str = "E_PRESENCE_INDEX";

/// One client's value updates, broadcast to every peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastPacket {
    /// Sender's client id; receivers drop their own packets.
    pub client_id: String,
    /// Sender's offset-corrected wallclock, seconds.
    pub timestamp: u64,
    /// Content updates per node.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub content: BTreeMap<NodeId, ContentEntry>,
    /// Children updates per node.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<NodeId, ChildrenEntry>,
}

impl BroadcastPacket {
    /// True when the packet carries no value updates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.children.is_empty()
    }
}

/// Hub error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Stable identifier (e.g. [`ERR_PRESENCE_INDEX`]).
    pub name: String,
    /// Human readable message.
    pub message: String,
}

/// Wire message kinds between a client and the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Client introduction, first message on a connection.
    Hello {
        /// Connecting client's id.
        client_id: String,
    },
    /// Value updates, fanned out to all other clients.
    Broadcast(BroadcastPacket),
    /// Presence heartbeat (client → hub).
    Presence {
        /// Reporting client.
        client_id: String,
        /// Offset-corrected wallclock, seconds.
        timestamp: u64,
    },
    /// Ranged presence query: every client seen at or after `since`.
    PresenceQuery {
        /// Lower timestamp bound, seconds.
        since: u64,
    },
    /// Presence answer (hub → client).
    PresenceSnapshot {
        /// Client id → last heartbeat seconds.
        clients: BTreeMap<String, u64>,
    },
    /// Protocol or processing error.
    Error(ErrorPayload),
}

impl Message {
    /// Canonical op string for logging.
    #[must_use]
    pub fn op_name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Broadcast(_) => "broadcast",
            Message::Presence { .. } => "presence",
            Message::PresenceQuery { .. } => "presence_query",
            Message::PresenceSnapshot { .. } => "presence_snapshot",
            Message::Error(_) => "error",
        }
    }
}

/// Maximum frame payload (8 MiB) to bound a misbehaving peer.
pub const MAX_FRAME: usize = 8 * 1024 * 1024;

/// Wire codec failures.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// JSON encode/decode failure.
    #[error("packet codec: {0}")]
    Codec(#[from] serde_json::Error),
    /// Peer declared a frame larger than [`MAX_FRAME`].
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

/// Encodes a message into a length-prefixed frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, ProtoError> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME {
        return Err(ProtoError::FrameTooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&u32::try_from(body.len()).unwrap_or(u32::MAX).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(None)` while the buffer holds an incomplete frame; on success
/// returns the message and the bytes consumed.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Message, usize)>, ProtoError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME {
        return Err(ProtoError::FrameTooLarge(len));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let msg = serde_json::from_slice(&buf[4..4 + len])?;
    Ok(Some((msg, 4 + len)))
}

/// Drops presence records older than the TTL; returns whether any peer
/// other than `own_id` remains online.
pub fn prune_presence(clients: &mut BTreeMap<String, u64>, now: u64, own_id: &str) -> bool {
    clients.retain(|_, seen| *seen + PRESENCE_TTL_SECS >= now);
    clients.keys().any(|id| id != own_id)
}
