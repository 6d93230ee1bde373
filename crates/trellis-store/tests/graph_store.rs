// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Store-level invariants exercised against a real LMDB environment.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use tempfile::TempDir;
use trellis_ident::{NodeId, DEFAULT_SHORT_ID_BYTES};
use trellis_store::{Store, StoreError, View, ViewTree};

fn open_store(dir: &TempDir) -> Store {
    Store::open(dir.path().join("db"), DEFAULT_SHORT_ID_BYTES).expect("open store")
}

fn lines(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

fn node(tag: u8) -> NodeId {
    NodeId::from_parts(u128::from(tag), [tag; 10])
}

#[test]
fn root_is_created_once_and_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let root = {
        let store = open_store(&dir);
        let root = store.with_write(|txn| store.ensure_root(txn)).unwrap();
        let txn = store.read_txn().unwrap();
        assert_eq!(store.content(&txn, root).unwrap(), lines(&[""]));
        assert!(store.descendants(&txn, root, false).unwrap().is_empty());
        root
    };

    let store = open_store(&dir);
    let again = store.with_write(|txn| store.ensure_root(txn)).unwrap();
    assert_eq!(again, root);
}

#[test]
fn adjacency_stays_mutually_consistent() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let (parent, a, b, c) = (node(1), node(2), node(3), node(4));

    store
        .with_write(|txn| {
            for id in [parent, a, b, c] {
                store.set_content(txn, id, &lines(&["x"]))?;
            }
            store.set_descendants(txn, parent, &[a, b], false)?;
            Ok(())
        })
        .unwrap();

    {
        let txn = store.read_txn().unwrap();
        assert_eq!(store.descendants(&txn, parent, false).unwrap(), vec![a, b]);
        assert_eq!(store.descendants(&txn, a, true).unwrap(), vec![parent]);
        assert_eq!(store.descendants(&txn, b, true).unwrap(), vec![parent]);
    }

    // Replace b with c: b loses the parent edge, c gains it.
    store
        .with_write(|txn| store.set_descendants(txn, parent, &[a, c], false))
        .unwrap();
    let txn = store.read_txn().unwrap();
    assert_eq!(store.descendants(&txn, parent, false).unwrap(), vec![a, c]);
    assert!(store.descendants(&txn, b, true).unwrap().is_empty());
    assert_eq!(store.descendants(&txn, c, true).unwrap(), vec![parent]);
}

#[test]
fn invalid_descendants_are_pruned_on_touch() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let (parent, child, ghost) = (node(1), node(2), node(3));

    store
        .with_write(|txn| {
            store.set_content(txn, parent, &lines(&["p"]))?;
            store.set_content(txn, child, &lines(&["c"]))?;
            store.set_content(txn, ghost, &lines(&["g"]))?;
            store.set_descendants(txn, parent, &[child, ghost], false)?;
            // Simulate a remote deletion reaching the store.
            store.delete_node(txn, ghost)?;
            Ok(())
        })
        .unwrap();

    let kept = store
        .with_write(|txn| store.valid_descendants(txn, parent, false))
        .unwrap();
    assert_eq!(kept, vec![child]);

    let txn = store.read_txn().unwrap();
    assert_eq!(store.descendants(&txn, parent, false).unwrap(), vec![child]);
}

#[test]
fn unsynced_marks_set_and_drain() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let (a, b) = (node(1), node(2));

    store
        .with_write(|txn| {
            store.set_content(txn, a, &lines(&["a"]))?;
            store.set_content(txn, b, &lines(&["b"]))?;
            store.set_descendants(txn, a, &[b], false)?;
            Ok(())
        })
        .unwrap();

    {
        let txn = store.read_txn().unwrap();
        assert!(store.is_unsynced_content(&txn, a).unwrap());
        assert!(store.is_unsynced_children(&txn, a).unwrap());
        assert!(store.is_unsynced_content(&txn, b).unwrap());
    }

    let popped = store
        .with_write(|txn| store.pop_unsynced_ids(txn))
        .unwrap();
    assert!(popped.contains(&a) && popped.contains(&b));

    let txn = store.read_txn().unwrap();
    assert!(!store.is_unsynced_content(&txn, a).unwrap());
    assert!(!store.is_unsynced_children(&txn, a).unwrap());
    let again = store.with_write(|txn| store.pop_unsynced_ids(txn)).unwrap();
    assert!(again.is_empty());
}

#[test]
fn short_ids_are_unique_monotonic_and_resolvable() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let ids: Vec<NodeId> = (1..=5u8).map(node).collect();

    let shorts = store
        .with_write(|txn| {
            let mut out = Vec::new();
            for id in &ids {
                out.push(store.short_id(txn, *id)?);
            }
            // Re-requesting returns the same alias.
            assert_eq!(store.short_id(txn, ids[0])?, out[0]);
            Ok(out)
        })
        .unwrap();

    let mut unique = shorts.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), shorts.len());

    let txn = store.read_txn().unwrap();
    for (id, short) in ids.iter().zip(&shorts) {
        assert_eq!(store.node_for_short_id(&txn, short).unwrap(), *id);
    }
    assert!(matches!(
        store.node_for_short_id(&txn, &trellis_ident::ShortId::from_encoded("ZZZ")),
        Err(StoreError::InvalidShortId(_))
    ));
}

#[test]
fn short_id_width_change_is_refused() {
    let dir = TempDir::new().unwrap();
    {
        let _store = open_store(&dir);
    }
    let err = Store::open(dir.path().join("db"), 4).unwrap_err();
    assert!(matches!(
        err,
        StoreError::ShortIdWidth {
            stored: 2,
            configured: 4
        }
    ));
}

#[test]
fn views_round_trip_per_direction() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let (root, child) = (node(1), node(2));

    let mut tree = ViewTree::new();
    tree.0.insert(child, None);
    let view = View {
        root,
        transposed: false,
        tree,
    };

    store.with_write(|txn| store.set_view(txn, &view)).unwrap();
    let txn = store.read_txn().unwrap();
    assert_eq!(store.view(&txn, root, false).unwrap(), view);
    // The transposed slot is independent and still collapsed.
    assert!(store.view(&txn, root, true).unwrap().tree.is_empty());
}

#[test]
fn orphans_are_reported_not_deleted() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let stray = node(9);

    let root = store
        .with_write(|txn| {
            let root = store.ensure_root(txn)?;
            store.set_content(txn, stray, &lines(&["stray"]))?;
            store.set_descendants(txn, stray, &[], false)?;
            Ok(root)
        })
        .unwrap();

    let txn = store.read_txn().unwrap();
    let orphans = store.orphans(&txn).unwrap();
    assert_eq!(orphans, vec![stray]);
    assert_ne!(orphans[0], root);
    assert!(store.is_valid(&txn, stray).unwrap());
}

#[test]
fn client_identity_is_stable() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let first = store.with_write(|txn| store.client(txn)).unwrap();
    let second = store.with_write(|txn| store.client(txn)).unwrap();
    assert_eq!(first, second);
    assert!(first.client_name.starts_with("trellis:"));
}
