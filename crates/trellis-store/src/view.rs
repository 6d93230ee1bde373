// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Persisted view state: what a buffer shows of the graph.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use trellis_ident::NodeId;

/// Expansion tree of a view.
///
/// Maps each visible occurrence to either its own sub-tree (`Some`, the
/// occurrence is expanded) or `None` (collapsed). The graph may be cyclic;
/// views are always finite, so they bound every traversal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewTree(pub BTreeMap<NodeId, Option<ViewTree>>);

impl ViewTree {
    /// Empty tree (a root with no expanded children).
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// True when no occurrence is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of direct occurrences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// A renderable view: root node, walk direction, expansion tree.
///
/// `transposed` views walk `parents` instead of `children` and are persisted
/// in their own table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    /// Root node of the buffer this view backs.
    pub root: NodeId,
    /// Whether the walk follows reverse adjacency.
    pub transposed: bool,
    /// Expansion state below the root.
    pub tree: ViewTree,
}

impl View {
    /// A collapsed view of `root`.
    #[must_use]
    pub fn collapsed(root: NodeId, transposed: bool) -> Self {
        Self {
            root,
            transposed,
            tree: ViewTree::new(),
        }
    }
}
