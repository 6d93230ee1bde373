// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Directory sync against a real git remote shared by two peers.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;
use trellis_ident::{NodeId, DEFAULT_SHORT_ID_BYTES};
use trellis_merge::CONFLICT_MARKER;
use trellis_store::{Client, Store};
use trellis_sync::gitdir::GitSync;

fn lines(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

fn node(tag: u8) -> NodeId {
    NodeId::from_parts(u128::from(tag), [tag; 10])
}

struct Peer {
    _dir: TempDir,
    store: Store,
    sync: GitSync,
}

fn bare_remote(dir: &TempDir) -> String {
    let path = dir.path().join("remote.git");
    let status = Command::new("git")
        .args(["init", "--bare", path.to_str().unwrap()])
        .output()
        .expect("git available");
    assert!(status.status.success());
    path.display().to_string()
}

fn peer(name: &str, remote: &str) -> Peer {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path().join("db"), DEFAULT_SHORT_ID_BYTES).unwrap();
    let sync = GitSync::new(
        store.clone(),
        dir.path().join("git"),
        Some(remote.to_owned()),
        "main".to_owned(),
        false,
    );
    let client = Client {
        client_id: format!("0000000{}-0000-0000-0000-000000000000", name.len()),
        client_name: format!("trellis:{name}"),
    };
    sync.bootstrap(&client).unwrap();
    Peer {
        _dir: dir,
        store,
        sync,
    }
}

fn git_file(peer: &Peer, id: NodeId) -> PathBuf {
    peer.sync.node_path(id)
}

#[test]
fn nodes_travel_between_peers_through_the_remote() {
    let remote_dir = TempDir::new().unwrap();
    let remote = bare_remote(&remote_dir);
    let one = peer("one", &remote);
    let two = peer("two", &remote);

    let (parent, child) = (node(1), node(2));
    one.store
        .with_write(|txn| {
            one.store.set_content(txn, parent, &lines(&["Parent"]))?;
            one.store.set_content(txn, child, &lines(&["Child"]))?;
            one.store.set_descendants(txn, parent, &[child], false)?;
            Ok(())
        })
        .unwrap();

    // Peer one publishes; its files land in the remote.
    one.sync.sync().unwrap();
    assert!(git_file(&one, parent).is_file());

    // Peer two pulls them into its store.
    let changed = two.sync.sync().unwrap();
    assert!(changed, "remote changes must be reported");
    {
        let txn = two.store.read_txn().unwrap();
        assert_eq!(two.store.content(&txn, parent).unwrap(), lines(&["Parent"]));
        assert_eq!(two.store.content(&txn, child).unwrap(), lines(&["Child"]));
        assert_eq!(
            two.store.descendants(&txn, parent, false).unwrap(),
            vec![child]
        );
        assert_eq!(
            two.store.descendants(&txn, child, true).unwrap(),
            vec![parent]
        );
    }

    // Peer two edits and pushes; peer one converges.
    two.store
        .with_write(|txn| {
            two.store
                .set_content(txn, child, &lines(&["Child renamed"]))
        })
        .unwrap();
    two.sync.sync().unwrap();
    let changed = one.sync.sync().unwrap();
    assert!(changed);
    let txn = one.store.read_txn().unwrap();
    assert_eq!(
        one.store.content(&txn, child).unwrap(),
        lines(&["Child renamed"])
    );
}

#[test]
fn unsynced_local_content_merges_with_remote_changes() {
    let remote_dir = TempDir::new().unwrap();
    let remote = bare_remote(&remote_dir);
    let one = peer("one", &remote);
    let two = peer("two", &remote);

    let n = node(1);
    one.store
        .with_write(|txn| one.store.set_content(txn, n, &lines(&["base"])))
        .unwrap();
    one.sync.sync().unwrap();
    two.sync.sync().unwrap();

    // Peer one edits and publishes; peer two edits locally but has not
    // synced yet.
    one.store
        .with_write(|txn| one.store.set_content(txn, n, &lines(&["from one"])))
        .unwrap();
    one.sync.sync().unwrap();
    two.store
        .with_write(|txn| two.store.set_content(txn, n, &lines(&["from two"])))
        .unwrap();

    // Peer two's cycle sees its own unsynced content and the remote change
    // at once: the conflict primitive keeps both arms.
    two.sync.sync().unwrap();
    let txn = two.store.read_txn().unwrap();
    let merged = two.store.content(&txn, n).unwrap();
    assert!(merged.contains(&CONFLICT_MARKER.to_owned()), "{merged:?}");
    assert!(merged.contains(&"from one".to_owned()));
    assert!(merged.contains(&"from two".to_owned()));
    drop(txn);

    // And the merged value flows back to peer one on the next cycles.
    two.sync.sync().unwrap();
    one.sync.sync().unwrap();
    let txn = one.store.read_txn().unwrap();
    assert_eq!(one.store.content(&txn, n).unwrap(), merged);
}

#[test]
fn deleted_nodes_lose_their_file_and_parents_regenerate() {
    let remote_dir = TempDir::new().unwrap();
    let remote = bare_remote(&remote_dir);
    let one = peer("one", &remote);

    let (parent, child) = (node(1), node(2));
    one.store
        .with_write(|txn| {
            one.store.set_content(txn, parent, &lines(&["Parent"]))?;
            one.store.set_content(txn, child, &lines(&["Child"]))?;
            one.store.set_descendants(txn, parent, &[child], false)?;
            Ok(())
        })
        .unwrap();
    one.sync.sync().unwrap();
    assert!(git_file(&one, child).is_file());

    one.store
        .with_write(|txn| one.store.delete_node(txn, child))
        .unwrap();
    one.sync.sync().unwrap();

    assert!(!git_file(&one, child).exists(), "deleted node file removed");
    let parent_file = std::fs::read_to_string(git_file(&one, parent)).unwrap();
    assert!(
        !parent_file.contains(&child.to_string()),
        "parent regenerated without the deleted child"
    );
}
