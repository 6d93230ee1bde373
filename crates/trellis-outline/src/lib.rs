// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Outline buffer grammar: parse a Markdown buffer into node mutations,
//! render a view back into buffer lines, and apply the difference through a
//! narrow editor port.
//!
//! The grammar is deliberately small — lists and inline node tags, nothing
//! else. The first buffer line is the root node's header; every list item
//! below is one node occurrence:
//!
//! ```text
//! [](nROOT)  Root first content line
//! - [](nA)  Alpha
//!   continuation line of Alpha
//!   - [](nB)  nested child of Alpha
//! + [](nC)  collapsed occurrence
//! ```
//!
//! Bullets encode expansion intent (`-` expanded, `+` collapsed, `*` expand
//! request, `1.`–`9.` ordered tail), the tag binds the item to a node, and
//! indentation nests items. The parser never writes to the store; it
//! produces a [`View`] plus a [`ChangeSet`] that buffer sync consumes.
//!
//! Round-trip invariant: rendering a view and parsing the output against the
//! render's [`LastSync`] yields the same view and an empty change set.

mod diff;
mod parse;
mod port;
mod render;

pub use diff::apply_buffer_edits;
pub use parse::parse_buffer;
pub use port::{EditorPort, MemoryBuffer};
pub use render::{render_view, RenderOutput};

use std::collections::{BTreeMap, BTreeSet};
use trellis_ident::NodeId;
use trellis_store::StoreError;

// Re-exported so callers name one crate for the parse→render cycle types.
pub use trellis_store::{View, ViewTree};

/// Half-open range of buffer lines.
pub type LineRange = (usize, usize);

/// Nesting step in spaces per outline level.
pub const LEVEL_SPACES: usize = 4;

/// Structural parse failures. Both are recoverable: the orchestrator
/// highlights the offending ranges and keeps the buffer read-only until the
/// user resolves them.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The same node appeared twice as immediate siblings under one parent.
    #[error("node {node} appears twice among siblings at lines {ranges:?}")]
    DuplicateSibling {
        /// The duplicated node.
        node: NodeId,
        /// Line ranges of the earlier and the later occurrence.
        ranges: (LineRange, LineRange),
    },
    /// A node's first occurrence types a child set that differs from the
    /// last-synced one; the parser cannot tell an edit from an elision.
    #[error("children of node {node} are uncertain at lines {range:?}")]
    UncertainChildren {
        /// The ambiguous node.
        node: NodeId,
        /// Line range of the occurrence.
        range: LineRange,
    },
    /// Tag resolution or store access failed (e.g. an unknown short id).
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-node snapshot taken at render time: the common ancestor for every
/// three-way merge until the next render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    /// Content lines as last rendered.
    pub content: Vec<String>,
    /// Child ids as last rendered (order-insensitive identity).
    pub children: BTreeSet<NodeId>,
}

/// Snapshot of everything the last render put into the buffer.
#[derive(Debug, Clone, Default)]
pub struct LastSync {
    nodes: BTreeMap<NodeId, NodeSnapshot>,
    /// First buffer line of each rendered node occurrence.
    pub line_index: BTreeMap<usize, NodeId>,
}

impl LastSync {
    /// Empty snapshot (nothing rendered yet).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot for one node, when it was rendered.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&NodeSnapshot> {
        self.nodes.get(&id)
    }

    /// Records a node's snapshot (first render of the node wins within one
    /// render pass).
    pub fn insert(&mut self, id: NodeId, snapshot: NodeSnapshot) {
        self.nodes.entry(id).or_insert(snapshot);
    }

    /// Forgets one node, forcing the next parse to treat it as first-seen.
    /// Used when the user resolves an uncertain-children prompt with
    /// "continue".
    pub fn forget(&mut self, id: NodeId) {
        self.nodes.remove(&id);
    }

    /// Number of snapshotted nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when nothing was rendered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node whose header line is at or above `line`.
    #[must_use]
    pub fn node_at_line(&self, line: usize) -> Option<NodeId> {
        self.line_index.range(..=line).next_back().map(|(_, id)| *id)
    }
}

/// The parser's output: per-node new content and/or new children.
/// Ephemeral; buffer sync consumes and discards it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// New content lines per changed node.
    pub content: BTreeMap<NodeId, Vec<String>>,
    /// New ordered child list per changed node.
    pub children: BTreeMap<NodeId, Vec<NodeId>>,
}

impl ChangeSet {
    /// True when the parse found nothing to write.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.children.is_empty()
    }
}
