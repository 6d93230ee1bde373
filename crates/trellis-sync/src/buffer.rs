// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Buffer → store reconciliation.
//!
//! Consumes the parser's [`ChangeSet`] against the last rendered snapshot:
//! values overwrite when only the buffer moved, merge when the store moved
//! too. Every touched node lands in the returned [`BroadcastPacket`] paired
//! with the hash of the value the store held *before* this write, which is
//! what lets peers recognize their own packets coming back.

use std::collections::{BTreeMap, BTreeSet};
use trellis_ident::NodeId;
use trellis_merge::{children_hash, content_hash, resolve_children, resolve_content};
use trellis_outline::{ChangeSet, LastSync, View};
use trellis_proto::BroadcastPacket;
use trellis_store::{empty_content, RwTxn, Store, StoreError};

/// Applies one parse's changes inside the editing cycle's transaction.
///
/// When `root_view` is given it is persisted under its main id. The
/// returned packet carries every touched value; the caller stamps client id
/// and timestamp before broadcasting.
pub fn sync_with_store(
    store: &Store,
    txn: &mut RwTxn<'_>,
    root_view: Option<&View>,
    changes: &ChangeSet,
    last_sync: &LastSync,
) -> Result<BroadcastPacket, StoreError> {
    if let Some(view) = root_view {
        store.set_view(txn, view)?;
    }
    let transposed = root_view.is_some_and(|view| view.transposed);

    let mut packet = BroadcastPacket::default();
    sync_content(store, txn, changes, last_sync, &mut packet)?;
    sync_descendants(store, txn, changes, last_sync, transposed, &mut packet)?;
    Ok(packet)
}

fn sync_content(
    store: &Store,
    txn: &mut RwTxn<'_>,
    changes: &ChangeSet,
    last_sync: &LastSync,
    packet: &mut BroadcastPacket,
) -> Result<(), StoreError> {
    for (node, lines) in &changes.content {
        let stored = store.content_opt(txn, *node)?;
        let snapshot = last_sync.get(*node).map(|s| &s.content);
        let merged = resolve_content(lines.clone(), stored.as_ref(), snapshot);

        let overridden = stored.unwrap_or_else(empty_content);
        packet
            .content
            .insert(*node, (content_hash(&overridden), merged.clone()));

        store.set_content(txn, *node, &merged)?;
    }
    Ok(())
}

fn sync_descendants(
    store: &Store,
    txn: &mut RwTxn<'_>,
    changes: &ChangeSet,
    last_sync: &LastSync,
    transposed: bool,
    packet: &mut BroadcastPacket,
) -> Result<(), StoreError> {
    // Resolve every change against the pre-write store state first, then
    // write: within one parse the entries are independent edits of the same
    // generation, not a sequence.
    let mut resolved: Vec<(NodeId, Vec<NodeId>, Vec<NodeId>)> = Vec::new();
    for (node, ids) in &changes.children {
        let stored = store.descendants(txn, *node, transposed)?;
        let stored_set: BTreeSet<NodeId> = stored.iter().copied().collect();
        let snapshot_matches = last_sync
            .get(*node)
            .is_some_and(|s| s.children == stored_set);
        let merged = resolve_children(
            ids.clone(),
            Some(&stored),
            snapshot_matches.then_some(&stored),
        );
        resolved.push((*node, stored, merged));
    }

    if transposed {
        // The buffer edited parent lists; peers only understand children.
        // Capture the pre-write children of every affected parent, write,
        // then broadcast those parents' new child lists.
        let mut pre_children: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for (_, stored, merged) in &resolved {
            for parent in stored.iter().chain(merged.iter()) {
                if !pre_children.contains_key(parent) {
                    pre_children.insert(*parent, store.descendants(txn, *parent, false)?);
                }
            }
        }
        for (node, _, merged) in &resolved {
            store.set_descendants(txn, *node, merged, true)?;
        }
        for (parent, pre) in pre_children {
            let post = store.descendants(txn, parent, false)?;
            packet.children.insert(parent, (children_hash(&pre), post));
        }
    } else {
        for (node, stored, merged) in &resolved {
            packet
                .children
                .insert(*node, (children_hash(stored), merged.clone()));
            store.set_descendants(txn, *node, merged, false)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use tempfile::TempDir;
    use trellis_ident::DEFAULT_SHORT_ID_BYTES;
    use trellis_merge::CONFLICT_MARKER;
    use trellis_outline::NodeSnapshot;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    fn node(tag: u8) -> NodeId {
        NodeId::from_parts(u128::from(tag), [tag; 10])
    }

    fn open() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("db"), DEFAULT_SHORT_ID_BYTES).unwrap();
        (dir, store)
    }

    #[test]
    fn clean_overwrite_when_store_matches_snapshot() {
        let (_dir, store) = open();
        let a = node(1);
        store
            .with_write(|txn| store.set_content(txn, a, &lines(&["old"])))
            .unwrap();

        let mut last_sync = LastSync::new();
        last_sync.insert(
            a,
            NodeSnapshot {
                content: lines(&["old"]),
                children: Default::default(),
            },
        );
        let mut changes = ChangeSet::default();
        changes.content.insert(a, lines(&["new"]));

        let packet = store
            .with_write(|txn| sync_with_store(&store, txn, None, &changes, &last_sync))
            .unwrap();

        let txn = store.read_txn().unwrap();
        assert_eq!(store.content(&txn, a).unwrap(), lines(&["new"]));
        // Packet pairs the pre-write hash with the final value.
        let (hash, value) = packet.content.get(&a).unwrap();
        assert_eq!(*hash, content_hash(&lines(&["old"])));
        assert_eq!(value, &lines(&["new"]));
    }

    #[test]
    fn merge_when_store_moved_behind_the_buffer() {
        let (_dir, store) = open();
        let a = node(1);
        // Rendered as "old", but a peer sync advanced the store since.
        store
            .with_write(|txn| store.set_content(txn, a, &lines(&["theirs"])))
            .unwrap();

        let mut last_sync = LastSync::new();
        last_sync.insert(
            a,
            NodeSnapshot {
                content: lines(&["old"]),
                children: Default::default(),
            },
        );
        let mut changes = ChangeSet::default();
        changes.content.insert(a, lines(&["ours"]));

        store
            .with_write(|txn| sync_with_store(&store, txn, None, &changes, &last_sync))
            .unwrap();

        let txn = store.read_txn().unwrap();
        let merged = store.content(&txn, a).unwrap();
        assert!(merged.contains(&CONFLICT_MARKER.to_owned()));
        assert!(merged.contains(&"ours".to_owned()));
        assert!(merged.contains(&"theirs".to_owned()));
    }

    #[test]
    fn children_union_and_reverse_adjacency() {
        let (_dir, store) = open();
        let (p, a, b, c) = (node(1), node(2), node(3), node(4));
        store
            .with_write(|txn| {
                for id in [p, a, b, c] {
                    store.set_content(txn, id, &lines(&["x"]))?;
                }
                store.set_descendants(txn, p, &[a, b], false)
            })
            .unwrap();

        // Buffer typed [a, c]; snapshot was [a] so the store moved too and
        // the sets union instead of overwrite.
        let mut last_sync = LastSync::new();
        last_sync.insert(
            p,
            NodeSnapshot {
                content: lines(&["x"]),
                children: [a].into_iter().collect(),
            },
        );
        let mut changes = ChangeSet::default();
        changes.children.insert(p, vec![a, c]);

        let packet = store
            .with_write(|txn| sync_with_store(&store, txn, None, &changes, &last_sync))
            .unwrap();

        let txn = store.read_txn().unwrap();
        assert_eq!(store.descendants(&txn, p, false).unwrap(), vec![a, c, b]);
        assert_eq!(store.descendants(&txn, c, true).unwrap(), vec![p]);
        let (hash, value) = packet.children.get(&p).unwrap();
        assert_eq!(*hash, children_hash(&[a, b]));
        assert_eq!(value, &vec![a, c, b]);
    }
}
