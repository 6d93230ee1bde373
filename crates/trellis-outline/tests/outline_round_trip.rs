// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Parser/renderer round trips against a real store.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use tempfile::TempDir;
use trellis_ident::{NodeId, DEFAULT_SHORT_ID_BYTES};
use trellis_outline::{
    parse_buffer, render_view, ChangeSet, LastSync, NodeSnapshot, ParseError, View, ViewTree,
};
use trellis_store::Store;

struct Fixture {
    _dir: TempDir,
    store: Store,
    root: NodeId,
    alpha: NodeId,
    bravo: NodeId,
}

fn lines(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

/// Store with root "Root" and two children "Alpha" / "Bravo".
fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path().join("db"), DEFAULT_SHORT_ID_BYTES).unwrap();
    let root = store.with_write(|txn| store.ensure_root(txn)).unwrap();
    let alpha = NodeId::from_parts(10, [1; 10]);
    let bravo = NodeId::from_parts(20, [2; 10]);
    store
        .with_write(|txn| {
            store.set_content(txn, root, &lines(&["Root"]))?;
            store.set_content(txn, alpha, &lines(&["Alpha"]))?;
            store.set_content(txn, bravo, &lines(&["Bravo"]))?;
            store.set_descendants(txn, root, &[alpha, bravo], false)?;
            Ok(())
        })
        .unwrap();
    Fixture {
        _dir: dir,
        store,
        root,
        alpha,
        bravo,
    }
}

fn render(fx: &Fixture, view: &View) -> (Vec<String>, LastSync) {
    let mut txn = fx.store.write_txn().unwrap();
    let out = render_view(&fx.store, &mut txn, view, None, false).unwrap();
    txn.commit().unwrap();
    (out.lines, out.last_sync)
}

fn parse(
    fx: &Fixture,
    buffer: &[String],
    last_sync: &LastSync,
) -> Result<(View, ChangeSet), ParseError> {
    let txn = fx.store.read_txn().unwrap();
    parse_buffer(&fx.store, &txn, buffer, fx.root, last_sync, false)
}

#[test]
fn initial_render_parses_back_clean() {
    let fx = fixture();
    let view = View::collapsed(fx.root, false);
    let (buffer, last_sync) = render(&fx, &view);

    // Root header carries the tag; children render as top-level bullets.
    assert!(buffer[0].ends_with("Root"));
    assert!(buffer[0].starts_with("[](n"));
    assert_eq!(buffer.len(), 3);
    assert!(buffer[1].starts_with("- [](n"));
    assert!(buffer[1].ends_with("Alpha"));
    assert!(buffer[2].ends_with("Bravo"));

    let (parsed, changes) = parse(&fx, &buffer, &last_sync).unwrap();
    assert!(changes.is_empty(), "round trip must be clean: {changes:?}");
    assert_eq!(parsed.root, fx.root);
    let expected: Vec<(NodeId, bool)> = vec![(fx.alpha, false), (fx.bravo, false)];
    let got: Vec<(NodeId, bool)> = parsed
        .tree
        .0
        .iter()
        .map(|(id, sub)| (*id, sub.is_some()))
        .collect();
    assert_eq!(got, expected);

    // Rendering the parsed view reproduces the buffer exactly.
    let (buffer2, last_sync2) = render(&fx, &parsed);
    assert_eq!(buffer2, buffer);
    let (parsed2, changes2) = parse(&fx, &buffer2, &last_sync2).unwrap();
    assert!(changes2.is_empty());
    assert_eq!(parsed2, parsed);
}

#[test]
fn rename_root_line_yields_content_change_only() {
    let fx = fixture();
    let (mut buffer, last_sync) = render(&fx, &View::collapsed(fx.root, false));
    let tag_end = buffer[0].find(") ").unwrap() + 3;
    buffer[0] = format!("{}Root renamed", &buffer[0][..tag_end]);

    let (_, changes) = parse(&fx, &buffer, &last_sync).unwrap();
    assert_eq!(
        changes.content.get(&fx.root),
        Some(&lines(&["Root renamed"]))
    );
    assert!(changes.children.is_empty());

    // Reverse adjacency is untouched by a content-only parse.
    let txn = fx.store.read_txn().unwrap();
    assert_eq!(
        fx.store.descendants(&txn, fx.alpha, true).unwrap(),
        vec![fx.root]
    );
}

#[test]
fn untagged_sibling_mints_a_new_node() {
    let fx = fixture();
    let (mut buffer, last_sync) = render(&fx, &View::collapsed(fx.root, false));
    buffer.push("- New node".to_owned());

    let (view, changes) = parse(&fx, &buffer, &last_sync).unwrap();
    let minted: Vec<NodeId> = changes
        .content
        .keys()
        .filter(|id| ![fx.root, fx.alpha, fx.bravo].contains(id))
        .copied()
        .collect();
    assert_eq!(minted.len(), 1);
    let new_node = minted[0];
    assert_eq!(changes.content.get(&new_node), Some(&lines(&["New node"])));
    assert_eq!(
        changes.children.get(&fx.root),
        Some(&vec![fx.alpha, fx.bravo, new_node])
    );
    assert!(view.tree.0.contains_key(&new_node));
}

#[test]
fn duplicate_sibling_is_an_error_with_both_ranges() {
    let fx = fixture();
    let buffer = vec![
        format!("[](n{})  R", fx.root),
        format!("- [](n{})  a", fx.alpha),
        format!("- [](n{})  a", fx.alpha),
    ];
    let err = parse(&fx, &buffer, &LastSync::new()).unwrap_err();
    match err {
        ParseError::DuplicateSibling { node, ranges } => {
            assert_eq!(node, fx.alpha);
            assert_eq!(ranges, ((1, 2), (2, 3)));
        }
        other => panic!("expected DuplicateSibling, got {other:?}"),
    }
}

#[test]
fn first_occurrence_with_divergent_children_is_uncertain() {
    let fx = fixture();
    let hidden = NodeId::from_parts(30, [3; 10]);
    let typed = NodeId::from_parts(40, [4; 10]);
    fx.store
        .with_write(|txn| {
            store_content(txn, &fx, hidden, "hidden")?;
            store_content(txn, &fx, typed, "typed")?;
            Ok(())
        })
        .unwrap();

    // Alpha was last rendered (elsewhere) with child `hidden`; the buffer
    // types child `typed` on alpha's first occurrence here.
    let mut last_sync = LastSync::new();
    last_sync.insert(
        fx.root,
        NodeSnapshot {
            content: lines(&["Root"]),
            children: [fx.bravo].into_iter().collect(),
        },
    );
    last_sync.insert(
        fx.alpha,
        NodeSnapshot {
            content: lines(&["Alpha"]),
            children: [hidden].into_iter().collect(),
        },
    );

    let buffer = vec![
        format!("[](n{})  Root", fx.root),
        format!("- [](n{})  Alpha", fx.alpha),
        format!("    - [](n{})  typed", typed),
    ];
    let err = parse(&fx, &buffer, &last_sync).unwrap_err();
    match err {
        ParseError::UncertainChildren { node, range } => {
            assert_eq!(node, fx.alpha);
            assert_eq!(range, (1, 3));
        }
        other => panic!("expected UncertainChildren, got {other:?}"),
    }
}

fn store_content(
    txn: &mut trellis_store::RwTxn<'_>,
    fx: &Fixture,
    id: NodeId,
    text: &str,
) -> Result<(), trellis_store::StoreError> {
    fx.store.set_content(txn, id, &[text.to_owned()])
}

#[test]
fn continuation_lines_round_trip() {
    let fx = fixture();
    fx.store
        .with_write(|txn| {
            fx.store
                .set_content(txn, fx.alpha, &lines(&["Alpha", "second line", "third"]))
        })
        .unwrap();

    let (buffer, last_sync) = render(&fx, &View::collapsed(fx.root, false));
    assert!(buffer.contains(&"  second line".to_owned()));

    let (_, changes) = parse(&fx, &buffer, &last_sync).unwrap();
    assert!(changes.is_empty(), "{changes:?}");
}

#[test]
fn single_child_chains_render_ordered_and_parse_back() {
    let fx = fixture();
    let charlie = NodeId::from_parts(30, [3; 10]);
    fx.store
        .with_write(|txn| {
            fx.store.set_content(txn, charlie, &lines(&["Charlie"]))?;
            fx.store.set_descendants(txn, fx.root, &[fx.alpha], false)?;
            fx.store.set_descendants(txn, fx.alpha, &[fx.bravo], false)?;
            fx.store.set_descendants(txn, fx.bravo, &[charlie], false)?;
            Ok(())
        })
        .unwrap();

    let mut bravo_tree = ViewTree::new();
    bravo_tree.0.insert(charlie, None);
    let mut alpha_tree = ViewTree::new();
    alpha_tree.0.insert(fx.bravo, Some(bravo_tree));
    let mut tree = ViewTree::new();
    tree.0.insert(fx.alpha, Some(alpha_tree));
    let view = View {
        root: fx.root,
        transposed: false,
        tree,
    };

    let (buffer, last_sync) = render(&fx, &view);
    // The single-child chain renders as an ordered tail, every link at the
    // same indentation instead of staircasing.
    let ordered: Vec<&String> = buffer
        .iter()
        .filter(|line| line.trim_start().starts_with("1."))
        .collect();
    assert_eq!(ordered.len(), 3, "{buffer:?}");
    let indent = |line: &str| line.len() - line.trim_start().len();
    assert!(ordered.iter().all(|line| indent(line) == indent(ordered[0])));

    let (parsed, changes) = parse(&fx, &buffer, &last_sync).unwrap();
    assert!(changes.is_empty(), "{changes:?}");
    assert_eq!(parsed, view);
}

#[test]
fn fold_level_caps_emitted_depth() {
    let fx = fixture();
    let deep = NodeId::from_parts(30, [3; 10]);
    fx.store
        .with_write(|txn| {
            fx.store.set_content(txn, deep, &lines(&["Deep"]))?;
            fx.store.set_descendants(txn, fx.alpha, &[deep], false)?;
            Ok(())
        })
        .unwrap();

    let mut alpha_tree = ViewTree::new();
    alpha_tree.0.insert(deep, None);
    let mut tree = ViewTree::new();
    tree.0.insert(fx.alpha, Some(alpha_tree));
    tree.0.insert(fx.bravo, None);
    let view = View {
        root: fx.root,
        transposed: false,
        tree,
    };

    let mut txn = fx.store.write_txn().unwrap();
    let capped = render_view(&fx.store, &mut txn, &view, Some(1), false).unwrap();
    txn.commit().unwrap();

    assert!(
        !capped.lines.iter().any(|line| line.contains("Deep")),
        "fold level 1 must hide grandchildren: {:?}",
        capped.lines
    );
    // Alpha still shows, collapsed, because its subtree is folded away.
    let alpha_line = capped
        .lines
        .iter()
        .find(|line| line.contains("Alpha"))
        .unwrap();
    assert!(alpha_line.trim_start().starts_with('+'));
}

#[test]
fn transposed_views_walk_parents() {
    let fx = fixture();
    let view = View::collapsed(fx.alpha, true);
    let mut txn = fx.store.write_txn().unwrap();
    let out = render_view(&fx.store, &mut txn, &view, None, false).unwrap();
    txn.commit().unwrap();

    assert!(out.lines[0].starts_with("[](t"));
    assert!(out.lines[0].ends_with("Alpha"));
    assert!(out.lines[1].ends_with("Root"));
}
