// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! (View, store) → buffer lines.
//!
//! Iterative pre-order walk from the view's root, bounded by the expansion
//! tree and the optional fold level — the graph may be cyclic, the view
//! never is. Adjacency is read as stored; the only store write on this path
//! is lazy short-id allocation.

use crate::{LastSync, NodeSnapshot, View, ViewTree, LEVEL_SPACES};
use std::collections::BTreeSet;
use trellis_ident::{render_tag, NodeId};
use trellis_store::{RwTxn, Store, StoreError};

/// Result of materializing a view.
pub struct RenderOutput {
    /// The buffer lines, never empty.
    pub lines: Vec<String>,
    /// Snapshot of every rendered node, the common ancestor for the next
    /// round of three-way merges.
    pub last_sync: LastSync,
}

struct Frame {
    node: NodeId,
    /// Sibling tree containing this occurrence (`None` past a collapsed or
    /// synthesized boundary).
    context: Option<ViewTree>,
    prev_level: usize,
    /// Frames below level 0 (the root) use `in_tree = false`.
    in_tree: bool,
    prev_ordered: bool,
}

/// Renders `view` into buffer lines and a fresh [`LastSync`].
///
/// `fold_level` caps how deep sub-trees are emitted (level 1 = only the
/// root's direct children). `long_ids` switches tags to full UUID form.
pub fn render_view(
    store: &Store,
    txn: &mut RwTxn<'_>,
    view: &View,
    fold_level: Option<usize>,
    long_ids: bool,
) -> Result<RenderOutput, StoreError> {
    let mut last_sync = LastSync::new();
    let mut lines: Vec<String> = Vec::new();

    let mut root_context = ViewTree::new();
    root_context
        .0
        .insert(view.root, Some(view.tree.clone()));

    let mut stack = vec![Frame {
        node: view.root,
        context: Some(root_context),
        prev_level: 0,
        in_tree: false,
        prev_ordered: false,
    }];

    while let Some(frame) = stack.pop() {
        let node = frame.node;
        let Some(content) = store.content_opt(txn, node)? else {
            // Stale reference: the node vanished under this view. Skip; the
            // adjacency prune on the next store write drains it.
            continue;
        };

        let children = store.descendants(txn, node, view.transposed)?;
        let children_context: Option<ViewTree> = frame
            .context
            .as_ref()
            .and_then(|ctx| ctx.0.get(&node).cloned())
            .flatten();

        if last_sync.get(node).is_none() {
            last_sync.insert(
                node,
                NodeSnapshot {
                    content: content.clone(),
                    children: children.iter().copied().collect::<BTreeSet<_>>(),
                },
            );
        }
        last_sync.line_index.insert(lines.len(), node);

        let expanded = children.is_empty() || children_context.is_some();
        let ordered = expanded
            && (children.len() == 1 || frame.prev_ordered)
            && frame.in_tree
            && frame.context.as_ref().is_some_and(|ctx| ctx.len() == 1);
        let level = if frame.in_tree {
            if ordered && frame.prev_ordered {
                frame.prev_level
            } else {
                frame.prev_level + 1
            }
        } else {
            0
        };

        let within_fold = fold_level.is_none_or(|cap| level + 1 <= cap);
        let show_children = expanded && within_fold;
        if show_children {
            let ctx = match children_context {
                Some(tree) if !tree.is_empty() => tree,
                // Expanded with nothing recorded below: show every child
                // collapsed.
                _ => ViewTree(children.iter().map(|child| (*child, None)).collect()),
            };
            for child in children.iter().rev() {
                stack.push(Frame {
                    node: *child,
                    context: Some(ctx.clone()),
                    prev_level: level,
                    in_tree: true,
                    prev_ordered: ordered,
                });
            }
        }

        emit_node_lines(
            store,
            txn,
            &mut lines,
            &content,
            node,
            level,
            // Leaves always read as expanded; only a hidden subtree shows
            // the collapsed bullet.
            children.is_empty() || show_children,
            ordered,
            view.transposed,
            long_ids,
        )?;
    }

    if lines.is_empty() {
        lines.push(String::new());
    }
    Ok(RenderOutput { lines, last_sync })
}

/// Appends one node's header and continuation lines.
#[allow(clippy::too_many_arguments)]
fn emit_node_lines(
    store: &Store,
    txn: &mut RwTxn<'_>,
    out: &mut Vec<String>,
    content: &[String],
    node: NodeId,
    level: usize,
    expanded: bool,
    ordered: bool,
    transposed: bool,
    long_ids: bool,
) -> Result<(), StoreError> {
    let tag = node_tag(store, txn, node, transposed, long_ids)?;
    let first = content.first().cloned().unwrap_or_default();

    if level == 0 {
        out.push(format!("{tag}{first}"));
        out.extend(content.iter().skip(1).cloned());
        return Ok(());
    }

    let offset = if ordered { 3 } else { 2 };
    let space_count = LEVEL_SPACES * (level - 1) + offset;
    let prefix = " ".repeat(space_count);
    let bullet = if ordered {
        "1."
    } else if expanded {
        "-"
    } else {
        "+"
    };
    out.push(format!(
        "{}{} {}{}",
        &prefix[..space_count - offset],
        bullet,
        tag,
        first
    ));
    for line in content.iter().skip(1) {
        out.push(format!("{prefix}{line}"));
    }
    Ok(())
}

/// Renders the node's tag, allocating a short id on first render.
fn node_tag(
    store: &Store,
    txn: &mut RwTxn<'_>,
    node: NodeId,
    transposed: bool,
    long_ids: bool,
) -> Result<String, StoreError> {
    let ancestors = store.descendants(txn, node, !transposed)?;
    let multi_parent = ancestors.len() > 1;
    let id_text = if long_ids {
        node.to_string()
    } else {
        store.short_id(txn, node)?.to_string()
    };
    Ok(render_tag(&id_text, transposed, multi_parent))
}
