// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! LMDB-backed graph store for Trellis.
//!
//! The store is the authoritative local state. It owns node content and
//! adjacency exclusively; everything else (buffers, files, peers) is a
//! projection reconciled back through the sync paths.
//!
//! # Tables
//!
//! One LMDB environment with named databases, all keyed by the 16 raw
//! [`NodeId`] bytes except `metadata` (ASCII string keys) and
//! `short_id_to_node` (counter bytes):
//!
//! | table | value |
//! |---|---|
//! | `content` | JSON list of lines |
//! | `children` / `parents` | JSON list of node ids (mutually consistent) |
//! | `views` / `transposed_views` | JSON expansion tree |
//! | `unsynced_content` / `unsynced_children` / `unsynced_views` | empty marker |
//! | `bloom_filters` | keyword filter bytes |
//! | `node_to_short_id` / `short_id_to_node` | raw counter bytes / id bytes |
//! | `metadata` | JSON scalars and records |
//!
//! # Invariants
//!
//! * The root node always exists (`ensure_root`), recorded under the
//!   `root_id` metadata key.
//! * `b ∈ children(a) ⇔ a ∈ parents(b)` after every adjacency write
//!   (`set_descendants` diffs and fixes both directions).
//! * Content is never empty; absent content reads as `KeyNotFound` and
//!   callers that want the rendered default use [`Store::content_or_default`].
//! * Short ids are allocated monotonically and never recycled.
//!
//! # Transactions
//!
//! LMDB is single-writer. One editing cycle (parse → sync → render) runs
//! inside a single [`Store::with_write`] closure; `MDB_MAP_FULL` aborts the
//! attempt, doubles the map under a cross-process advisory lock, and re-runs
//! the closure.

// LMDB environment open/resize are unsafe in heed; confined to `kv`.
#![allow(unsafe_code)]

mod bloom;
mod graph;
mod kv;
mod meta;
mod shortid;
mod view;

pub use bloom::{normalized_prefixes, KeywordFilter};
pub use graph::empty_content;
pub use kv::Store;
pub use meta::Client;
pub use view::{View, ViewTree};

// The transaction types are part of this crate's API surface; consumers
// never need a direct LMDB dependency.
pub use heed3::{RoTxn, RwTxn};

use trellis_ident::NodeId;

/// Errors surfaced by the store layer.
///
/// `KeyNotFound` is semantic absence, not failure: callers translate it
/// (e.g. absent content becomes the single-empty-line default).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested key has no value in the touched table.
    #[error("key not found")]
    KeyNotFound,
    /// A short id did not resolve to a node.
    #[error("unknown short id {0:?}")]
    InvalidShortId(String),
    /// The configured short-id width does not match the width this store was
    /// created with. Changing width requires a store-wide re-encode pass,
    /// never a silent switch.
    #[error("short id width mismatch: store uses {stored} bytes, configuration asks for {configured}")]
    ShortIdWidth {
        /// Width recorded in store metadata.
        stored: usize,
        /// Width requested by configuration.
        configured: usize,
    },
    /// Every counter value of the configured width is allocated.
    #[error("short id space exhausted at width {0}")]
    ShortIdSpaceExhausted(usize),
    /// Identifier parsing failed while decoding stored values.
    #[error(transparent)]
    Ident(#[from] trellis_ident::IdentError),
    /// LMDB backend error.
    #[error("storage backend: {0}")]
    Backend(#[from] heed3::Error),
    /// JSON value codec error.
    #[error("value codec: {0}")]
    Codec(#[from] serde_json::Error),
    /// Filesystem error (environment directory, resize lock).
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True when the underlying LMDB map ran out of space and the operation
    /// should be retried after a resize.
    #[must_use]
    pub fn is_map_full(&self) -> bool {
        matches!(
            self,
            StoreError::Backend(heed3::Error::Mdb(heed3::MdbError::MapFull))
        )
    }
}

/// Raw key bytes for a node-keyed table.
#[inline]
#[must_use]
pub(crate) fn node_key(id: NodeId) -> [u8; 16] {
    *id.as_bytes()
}
