// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identifier types and codecs shared across Trellis.
//!
//! Two identifier spaces exist:
//!
//! * [`NodeId`] — the globally unique, time-prefixed 16-byte identity of a
//!   node. Opaque to consumers; only [`NodeId::generate`] (and the store's
//!   bootstrap path that calls it) mints new ones.
//! * [`ShortId`] — a compact, store-local rendering alias. Allocation lives
//!   in the store; this crate only owns the base-32 codec and the width math.
//!
//! Rendered buffer lines carry a [`NodeTag`] (`[](XID)  `) binding a list
//! item to a node. The tag codec is hand-rolled so the parser never needs a
//! regex engine on its hot path.

mod base32;
mod tag;

pub use base32::{compact_decode, compact_encode, encoded_width};
pub use tag::{parse_tag, render_tag, NodeTag};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Default width in bytes of the short-id counter.
pub const DEFAULT_SHORT_ID_BYTES: usize = 2;

/// Errors produced by identifier parsing and the short-id codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentError {
    /// Text did not parse as a node id (UUID form).
    #[error("invalid node id: {0:?}")]
    InvalidNodeId(String),
    /// Text did not decode as a compact short id of the configured width.
    #[error("invalid short id: {0:?}")]
    InvalidShortId(String),
}

/// Globally unique, time-prefixed identifier of a node.
///
/// Layout: 6 bytes big-endian millisecond timestamp ∥ 10 random bytes.
/// Collision-free by construction on a single client; cross-client collisions
/// are astronomically improbable. The text form is the hyphenated UUID
/// rendering of the same 16 bytes.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Mints a fresh time-prefixed id.
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        let mut suffix = [0u8; 10];
        rand::thread_rng().fill_bytes(&mut suffix);
        Self::from_parts(millis, suffix)
    }

    /// Deterministic constructor sharing the layout of [`NodeId::generate`];
    /// used by tests that need reproducible ids.
    #[must_use]
    pub fn from_parts(millis: u128, suffix: [u8; 10]) -> Self {
        let mut bytes = [0u8; 16];
        // 48-bit millisecond prefix keeps ids sortable by creation time.
        bytes[..6].copy_from_slice(&millis.to_be_bytes()[10..16]);
        bytes[6..].copy_from_slice(&suffix);
        Self(Uuid::from_bytes(bytes))
    }

    /// Reconstructs an id from its canonical 16 bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Canonical byte representation (LMDB key form).
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Millisecond timestamp embedded in the id prefix.
    #[must_use]
    pub fn timestamp_millis(&self) -> u64 {
        let b = self.0.as_bytes();
        let mut out = [0u8; 8];
        out[2..].copy_from_slice(&b[..6]);
        u64::from_be_bytes(out)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for NodeId {
    type Err = IdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| IdentError::InvalidNodeId(s.to_owned()))
    }
}

/// Compact rendering alias for a [`NodeId`].
///
/// The string form of a fixed-width big-endian counter, base-32 encoded with
/// leading zeros stripped (see [`compact_encode`]). Stable forever once
/// allocated; never recycled.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShortId(String);

impl ShortId {
    /// Encodes raw counter bytes into their compact text form.
    #[must_use]
    pub fn from_counter_bytes(bytes: &[u8]) -> Self {
        Self(compact_encode(bytes))
    }

    /// Wraps an already-encoded short id (e.g. parsed out of a buffer tag).
    #[must_use]
    pub fn from_encoded(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Decodes back into the fixed-width counter bytes.
    pub fn counter_bytes(&self, width: usize) -> Result<Vec<u8>, IdentError> {
        compact_decode(&self.0, width)
    }

    /// Text form, as embedded in buffer tags.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
