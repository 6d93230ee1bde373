// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Typed graph operations over the KV tables.

use crate::kv::{get_json, put_json};
use crate::view::{View, ViewTree};
use crate::{node_key, Store, StoreError};
use heed3::{RoTxn, RwTxn};
use std::collections::BTreeSet;
use trellis_ident::NodeId;

/// The rendered stand-in for absent content: one empty line.
#[must_use]
pub fn empty_content() -> Vec<String> {
    vec![String::new()]
}

impl Store {
    /// Content lines of `id`. Absence is [`StoreError::KeyNotFound`].
    pub fn content(&self, txn: &RoTxn<'_>, id: NodeId) -> Result<Vec<String>, StoreError> {
        self.content_opt(txn, id)?.ok_or(StoreError::KeyNotFound)
    }

    /// Content lines of `id`, or `None` when the node has none (invalid).
    pub fn content_opt(
        &self,
        txn: &RoTxn<'_>,
        id: NodeId,
    ) -> Result<Option<Vec<String>>, StoreError> {
        get_json(self.tables.content, txn, &node_key(id))
    }

    /// Content lines of `id`, defaulting to the single empty line.
    pub fn content_or_default(
        &self,
        txn: &RoTxn<'_>,
        id: NodeId,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self.content_opt(txn, id)?.unwrap_or_else(empty_content))
    }

    /// Writes content lines, marks the node content-unsynced, and drops the
    /// node's cached keyword filter.
    pub fn set_content(
        &self,
        txn: &mut RwTxn<'_>,
        id: NodeId,
        lines: &[String],
    ) -> Result<(), StoreError> {
        let key = node_key(id);
        put_json(self.tables.content, txn, &key, &lines)?;
        self.tables.unsynced_content.put(txn, &key, b"")?;
        self.tables.bloom_filters.delete(txn, &key)?;
        Ok(())
    }

    /// A node is valid while it has content.
    pub fn is_valid(&self, txn: &RoTxn<'_>, id: NodeId) -> Result<bool, StoreError> {
        Ok(self.tables.content.get(txn, &node_key(id))?.is_some())
    }

    /// Raw descendant list in the requested direction. Absent reads as empty.
    pub fn descendants(
        &self,
        txn: &RoTxn<'_>,
        id: NodeId,
        transposed: bool,
    ) -> Result<Vec<NodeId>, StoreError> {
        let table = if transposed {
            self.tables.parents
        } else {
            self.tables.children
        };
        Ok(get_json(table, txn, &node_key(id))?.unwrap_or_default())
    }

    /// Descendant list with invalid entries pruned.
    ///
    /// A descendant whose content vanished is deleted outright and the
    /// adjacency rewritten, so the lazily-accumulating garbage from remote
    /// deletions drains on first touch.
    pub fn valid_descendants(
        &self,
        txn: &mut RwTxn<'_>,
        id: NodeId,
        transposed: bool,
    ) -> Result<Vec<NodeId>, StoreError> {
        let all = self.descendants(txn, id, transposed)?;
        let mut invalid: Vec<NodeId> = Vec::new();
        for descendant in &all {
            if !self.is_valid(txn, *descendant)? {
                invalid.push(*descendant);
            }
        }
        if invalid.is_empty() {
            return Ok(all);
        }
        for descendant in &invalid {
            self.delete_node(txn, *descendant)?;
        }
        let kept: Vec<NodeId> = all
            .into_iter()
            .filter(|descendant| !invalid.contains(descendant))
            .collect();
        self.write_adjacency(txn, id, &kept, transposed)?;
        Ok(kept)
    }

    /// Replaces the descendant list of `id`, updating the reverse direction
    /// for every edge added or removed so both adjacency tables stay
    /// mutually consistent.
    pub fn set_descendants(
        &self,
        txn: &mut RwTxn<'_>,
        id: NodeId,
        ids: &[NodeId],
        transposed: bool,
    ) -> Result<(), StoreError> {
        let previous = self.valid_descendants(txn, id, transposed)?;

        let mut next: Vec<NodeId> = Vec::with_capacity(ids.len());
        for candidate in ids {
            if !next.contains(candidate) {
                next.push(*candidate);
            }
        }

        for added in next.iter().filter(|n| !previous.contains(n)) {
            let mut ancestors = self.descendants(txn, *added, !transposed)?;
            if !ancestors.contains(&id) {
                ancestors.push(id);
            }
            self.write_adjacency(txn, *added, &ancestors, !transposed)?;
        }
        for removed in previous.iter().filter(|p| !next.contains(p)) {
            let mut ancestors = self.descendants(txn, *removed, !transposed)?;
            ancestors.retain(|ancestor| *ancestor != id);
            self.write_adjacency(txn, *removed, &ancestors, !transposed)?;
        }

        self.write_adjacency(txn, id, &next, transposed)
    }

    /// Raw adjacency write in one direction plus the unsynced-children mark
    /// when the forward direction changed.
    fn write_adjacency(
        &self,
        txn: &mut RwTxn<'_>,
        id: NodeId,
        ids: &[NodeId],
        transposed: bool,
    ) -> Result<(), StoreError> {
        let key = node_key(id);
        let table = if transposed {
            self.tables.parents
        } else {
            self.tables.children
        };
        put_json(table, txn, &key, &ids)?;
        if !transposed {
            self.tables.unsynced_children.put(txn, &key, b"")?;
        }
        Ok(())
    }

    /// Loads the persisted view of `root` (collapsed when none stored).
    pub fn view(
        &self,
        txn: &RoTxn<'_>,
        root: NodeId,
        transposed: bool,
    ) -> Result<View, StoreError> {
        let table = if transposed {
            self.tables.transposed_views
        } else {
            self.tables.views
        };
        let tree: Option<ViewTree> = get_json(table, txn, &node_key(root))?;
        Ok(View {
            root,
            transposed,
            tree: tree.unwrap_or_default(),
        })
    }

    /// Persists a view under its root id; non-transposed views are marked
    /// unsynced.
    pub fn set_view(&self, txn: &mut RwTxn<'_>, view: &View) -> Result<(), StoreError> {
        let key = node_key(view.root);
        let table = if view.transposed {
            self.tables.transposed_views
        } else {
            self.tables.views
        };
        put_json(table, txn, &key, &view.tree)?;
        if !view.transposed {
            self.tables.unsynced_views.put(txn, &key, b"")?;
        }
        Ok(())
    }

    /// True while the node's content has not been consumed by a peer sync.
    pub fn is_unsynced_content(&self, txn: &RoTxn<'_>, id: NodeId) -> Result<bool, StoreError> {
        Ok(self
            .tables
            .unsynced_content
            .get(txn, &node_key(id))?
            .is_some())
    }

    /// True while the node's children have not been consumed by a peer sync.
    pub fn is_unsynced_children(&self, txn: &RoTxn<'_>, id: NodeId) -> Result<bool, StoreError> {
        Ok(self
            .tables
            .unsynced_children
            .get(txn, &node_key(id))?
            .is_some())
    }

    /// Drains both unsynced value tables, returning every node that needs to
    /// reach peers. Each id is reported once.
    pub fn pop_unsynced_ids(&self, txn: &mut RwTxn<'_>) -> Result<Vec<NodeId>, StoreError> {
        let mut ids: BTreeSet<NodeId> = BTreeSet::new();
        for table in [self.tables.unsynced_content, self.tables.unsynced_children] {
            for entry in table.iter(txn)? {
                let (key, _) = entry?;
                ids.insert(id_from_key(key)?);
            }
        }
        for id in &ids {
            let key = node_key(*id);
            self.tables.unsynced_content.delete(txn, &key)?;
            self.tables.unsynced_children.delete(txn, &key)?;
        }
        Ok(ids.into_iter().collect())
    }

    /// Clears the unsynced value marks of one node.
    pub fn clear_unsynced(&self, txn: &mut RwTxn<'_>, id: NodeId) -> Result<(), StoreError> {
        let key = node_key(id);
        self.tables.unsynced_content.delete(txn, &key)?;
        self.tables.unsynced_children.delete(txn, &key)?;
        Ok(())
    }

    /// Removes a node's values and view state, and marks every unsynced
    /// table so peers learn about the removal. Short-id mappings are kept
    /// (never recycled); stale references in other nodes' adjacency drain
    /// through [`Store::valid_descendants`].
    pub fn delete_node(&self, txn: &mut RwTxn<'_>, id: NodeId) -> Result<(), StoreError> {
        let key = node_key(id);
        for table in [
            self.tables.content,
            self.tables.children,
            self.tables.parents,
            self.tables.views,
            self.tables.transposed_views,
            self.tables.bloom_filters,
        ] {
            table.delete(txn, &key)?;
        }
        self.tables.unsynced_content.put(txn, &key, b"")?;
        self.tables.unsynced_children.put(txn, &key, b"")?;
        self.tables.unsynced_views.put(txn, &key, b"")?;
        Ok(())
    }

    /// Every node id with content, in key order.
    pub fn node_ids(&self, txn: &RoTxn<'_>) -> Result<Vec<NodeId>, StoreError> {
        let mut ids = Vec::new();
        for entry in self.tables.content.iter(txn)? {
            let (key, _) = entry?;
            ids.push(id_from_key(key)?);
        }
        Ok(ids)
    }

    /// Nodes present in the children table but unreachable from the root.
    /// Collection is explicit: nothing here deletes anything.
    pub fn orphans(&self, txn: &RoTxn<'_>) -> Result<Vec<NodeId>, StoreError> {
        let root = self.root_id(txn)?;
        let mut visited: BTreeSet<NodeId> = BTreeSet::new();
        visited.insert(root);
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            for child in self.descendants(txn, id, false)? {
                if visited.insert(child) {
                    stack.push(child);
                }
            }
        }
        let mut orphans = Vec::new();
        for entry in self.tables.children.iter(txn)? {
            let (key, _) = entry?;
            let id = id_from_key(key)?;
            if !visited.contains(&id) {
                orphans.push(id);
            }
        }
        Ok(orphans)
    }
}

/// Reconstructs a node id from a raw table key.
pub(crate) fn id_from_key(key: &[u8]) -> Result<NodeId, StoreError> {
    let bytes: [u8; 16] = key.try_into().map_err(|_| {
        StoreError::Ident(trellis_ident::IdentError::InvalidNodeId(format!(
            "{}-byte key",
            key.len()
        )))
    })?;
    Ok(NodeId::from_bytes(bytes))
}
