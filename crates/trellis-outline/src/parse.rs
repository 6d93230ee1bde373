// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Buffer → (View, ChangeSet) parser.
//!
//! Two passes. The first scans lines into a flat item list with parent
//! links: a bullet line opens an item nested under the closest shallower
//! item, a non-bullet line continues the most recent item, and an ordered
//! bullet chains onto its previous sibling instead of beside it. The second
//! pass walks the item tree, resolves expansion intent against the last
//! rendered snapshot, detects duplicate siblings, and accumulates the change
//! set.
//!
//! The parser never writes to the store; it only resolves short ids through
//! it. Every node id referenced by the returned view is either pre-existing
//! or present in the change set.

use crate::{ChangeSet, LastSync, ParseError, View, ViewTree};
use std::collections::BTreeSet;
use std::str::FromStr;
use trellis_ident::{parse_tag, NodeId, ShortId};
use trellis_merge::{merge_children, merge_content};
use trellis_store::{RoTxn, Store};

/// Expansion intent carried by a bullet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bullet {
    /// The buffer's first line; always expanded.
    Root,
    /// `-`
    Expanded,
    /// `+`
    Collapsed,
    /// `*`
    ToExpand,
    /// `1.` through `9.`
    Ordered,
}

/// One list item occurrence in the buffer.
struct Item {
    /// First line of the item.
    start: usize,
    /// One past the item's last line (continuations and subtree included).
    end: usize,
    /// Column of the bullet character.
    indent: usize,
    bullet: Bullet,
    /// Bound or freshly minted node.
    node: NodeId,
    /// Tag-stripped first line plus continuation lines.
    content: Vec<String>,
    /// Child items in document order.
    children: Vec<usize>,
}

/// Parses `lines` as the buffer of `root`, producing the buffer's view and
/// the mutations it implies relative to `last_sync`.
pub fn parse_buffer(
    store: &Store,
    txn: &RoTxn<'_>,
    lines: &[String],
    root: NodeId,
    last_sync: &LastSync,
    transposed: bool,
) -> Result<(View, ChangeSet), ParseError> {
    let items = scan_items(store, txn, lines, root)?;
    let mut parser = Pass2 {
        items: &items,
        last_sync,
        changes: ChangeSet::default(),
    };

    let mut root_tree = ViewTree::new();
    for &child in &items[0].children {
        parser.process_item(child, 0, &mut root_tree)?;
    }
    let ordered_children: Vec<NodeId> = items[0]
        .children
        .iter()
        .map(|&child| items[child].node)
        .collect();
    parser.record_node(root, &items[0].content, Some(ordered_children.as_slice()));

    let view = View {
        root,
        transposed,
        tree: root_tree,
    };
    Ok((view, parser.changes))
}

/// First pass: lines → item tree. Item 0 is the root.
fn scan_items(
    store: &Store,
    txn: &RoTxn<'_>,
    lines: &[String],
    root: NodeId,
) -> Result<Vec<Item>, ParseError> {
    let first_line = lines.first().map(String::as_str).unwrap_or_default();
    let root_content = match parse_tag(first_line) {
        // The buffer's identity comes from its file, not the typed tag; a
        // present tag is stripped, whatever it says.
        Some((_, rest)) => rest.to_owned(),
        None => first_line.to_owned(),
    };

    let mut items = vec![Item {
        start: 0,
        end: lines.len().max(1),
        indent: 0,
        bullet: Bullet::Root,
        node: root,
        content: vec![root_content],
        children: Vec::new(),
    }];

    // Stack of open items: (item index, bullet column). Root sits below all
    // bullets, so it never pops.
    let mut stack: Vec<(usize, usize)> = vec![(0, 0)];

    for (line_no, line) in lines.iter().enumerate().skip(1) {
        let Some((indent, bullet, after_bullet)) = split_bullet(line) else {
            // Continuation of the most recent item, its indentation prefix
            // stripped up to the content column.
            let current = items.len() - 1;
            let offset = content_offset(&items[current]);
            let strip = leading_spaces(line).min(offset);
            items[current].content.push(line[strip..].to_owned());
            continue;
        };

        while stack.len() > 1 && stack[stack.len() - 1].1 >= indent {
            stack.pop();
        }
        let mut parent = stack[stack.len() - 1].0;
        if bullet == Bullet::Ordered {
            // Ordered tail: chain under the previous sibling of equal
            // indentation instead of standing beside it.
            while let Some(&last) = items[parent].children.last() {
                if items[last].indent == indent {
                    parent = last;
                } else {
                    break;
                }
            }
        }

        let (node, first_content) = match parse_tag(after_bullet) {
            Some((tag, rest)) => (resolve_tag_id(store, txn, &tag.id)?, rest.to_owned()),
            None => (NodeId::generate(), after_bullet.to_owned()),
        };

        let idx = items.len();
        items.push(Item {
            start: line_no,
            end: lines.len(), // provisional; fixed up below
            indent,
            bullet,
            node,
            content: vec![first_content],
            children: Vec::new(),
        });
        items[parent].children.push(idx);
        stack.push((idx, indent));
    }

    // Item ranges: a child ends where its next sibling starts; the last
    // child inherits its parent's end. Parents precede children in the
    // vector, so one forward pass settles every range.
    for idx in 0..items.len() {
        let end = items[idx].end;
        let children = items[idx].children.clone();
        for pair in children.windows(2) {
            items[pair[0]].end = items[pair[1]].start;
        }
        if let Some(&last) = children.last() {
            items[last].end = end;
        }
    }

    Ok(items)
}

/// Splits a line into (bullet column, bullet, rest) when it opens an item.
fn split_bullet(line: &str) -> Option<(usize, Bullet, &str)> {
    let indent = leading_spaces(line);
    let rest = &line[indent..];
    let mut bytes = rest.bytes();
    let bullet = match bytes.next()? {
        b'-' => Bullet::Expanded,
        b'+' => Bullet::Collapsed,
        b'*' => Bullet::ToExpand,
        b'1'..=b'9' => {
            if bytes.next() == Some(b'.') && matches!(bytes.next(), Some(b' ') | None) {
                let after = rest.get(3..).unwrap_or("");
                return Some((indent, Bullet::Ordered, after));
            }
            return None;
        }
        _ => return None,
    };
    match rest.as_bytes().get(1) {
        Some(b' ') => Some((indent, bullet, rest.get(2..).unwrap_or(""))),
        None => Some((indent, bullet, "")),
        Some(_) => None,
    }
}

fn leading_spaces(line: &str) -> usize {
    line.bytes().take_while(|b| *b == b' ').count()
}

/// Column where an item's content starts (continuation lines align here).
fn content_offset(item: &Item) -> usize {
    let bullet_width = match item.bullet {
        Bullet::Root => return 0,
        Bullet::Ordered => 3,
        _ => 2,
    };
    item.indent + bullet_width
}

/// Resolves a tag's id text: full UUID form first, short id otherwise.
fn resolve_tag_id(store: &Store, txn: &RoTxn<'_>, id_text: &str) -> Result<NodeId, ParseError> {
    if let Ok(node) = NodeId::from_str(id_text) {
        return Ok(node);
    }
    Ok(store.node_for_short_id(txn, &ShortId::from_encoded(id_text))?)
}

struct Pass2<'a> {
    items: &'a [Item],
    last_sync: &'a LastSync,
    changes: ChangeSet,
}

impl Pass2<'_> {
    /// Processes one non-root item into its parent's sibling tree.
    fn process_item(
        &mut self,
        idx: usize,
        parent_idx: usize,
        siblings: &mut ViewTree,
    ) -> Result<(), ParseError> {
        // Copy the shared slice reference out so the recursion below can
        // borrow `self` mutably while `item` stays alive.
        let items = self.items;
        let item = &items[idx];

        let mut sub_tree = ViewTree::new();
        for &child in &item.children {
            self.process_item(child, idx, &mut sub_tree)?;
        }

        if siblings.0.contains_key(&item.node) {
            let earlier = self.items[parent_idx]
                .children
                .iter()
                .map(|&sibling| &self.items[sibling])
                .find(|sibling| sibling.node == item.node && sibling.start < item.start)
                .map_or((item.start, item.end), |sibling| (sibling.start, sibling.end));
            return Err(ParseError::DuplicateSibling {
                node: item.node,
                ranges: (earlier, (item.start, item.end)),
            });
        }

        let (expand, consider) = self.expansion_intent(item, parent_idx, &sub_tree)?;

        let ordered_children: Vec<NodeId> = item
            .children
            .iter()
            .map(|&child| self.items[child].node)
            .collect();
        let considered = if consider {
            Some(ordered_children.as_slice())
        } else {
            None
        };
        self.record_node(item.node, &item.content, considered);

        siblings
            .0
            .insert(item.node, if expand { Some(sub_tree) } else { None });
        Ok(())
    }

    /// Expansion intent of one occurrence.
    ///
    /// Returns `(expand, consider)`: whether the view shows the subtree, and
    /// whether the typed children count as an edit. A child already seen
    /// under this parent keeps the store untouched unless its bullet says
    /// expanded; a first-seen child with a subtree either matches the last
    /// rendered child set or is ambiguous.
    fn expansion_intent(
        &self,
        item: &Item,
        parent_idx: usize,
        sub_tree: &ViewTree,
    ) -> Result<(bool, bool), ParseError> {
        let parent_node = self.items[parent_idx].node;
        let not_new = self
            .last_sync
            .get(parent_node)
            .is_some_and(|snapshot| snapshot.children.contains(&item.node));

        let consider = if not_new {
            !matches!(item.bullet, Bullet::Collapsed | Bullet::ToExpand)
        } else if sub_tree.is_empty() {
            false
        } else {
            if let Some(snapshot) = self.last_sync.get(item.node) {
                let typed: BTreeSet<NodeId> = sub_tree.0.keys().copied().collect();
                if typed != snapshot.children {
                    return Err(ParseError::UncertainChildren {
                        node: item.node,
                        range: (item.start, item.end),
                    });
                }
            }
            true
        };

        let expand = item.bullet == Bullet::ToExpand
            || (item.bullet != Bullet::Collapsed && !sub_tree.is_empty());
        Ok((expand, consider))
    }

    /// Accumulates one occurrence into the change set, merging with earlier
    /// occurrences of the same node (clones share identity: editing any
    /// occurrence edits the node).
    fn record_node(&mut self, node: NodeId, content: &[String], children: Option<&[NodeId]>) {
        let Some(snapshot) = self.last_sync.get(node) else {
            self.changes.content.insert(node, content.to_vec());
            if let Some(children) = children {
                self.changes.children.insert(node, children.to_vec());
            }
            return;
        };

        if snapshot.content != content {
            let merged = match self.changes.content.get(&node) {
                Some(earlier) => merge_content(content, earlier),
                None => content.to_vec(),
            };
            self.changes.content.insert(node, merged);
        }

        if let Some(children) = children {
            let typed: BTreeSet<NodeId> = children.iter().copied().collect();
            if typed != snapshot.children {
                let merged = match self.changes.children.get(&node) {
                    Some(earlier) => merge_children(earlier, children),
                    None => children.to_vec(),
                };
                self.changes.children.insert(node, merged);
            }
        }
    }
}
