// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Deterministic conflict primitives shared by every Trellis sync path.
//!
//! Conflicts are never errors here. Two node value kinds exist and they merge
//! under deliberately different rules:
//!
//! * **Content** (ordered lines) merges into a sorted, deduplicated set of
//!   `<CONFLICT>`-separated segments. Sorting makes re-merging idempotent:
//!   the same pair of peers can exchange the merged value forever without
//!   the marker segments oscillating or multiplying.
//! * **Children** (ordered id sequence) merge as an ordered union — the
//!   incoming sequence first, then surviving local ids. Child sets behave
//!   like insertion-ordered CRDT sets, so no markers are introduced.
//!
//! The asymmetry is intentional and pinned by tests; do not "unify" the two
//! rules.
//!
//! [`resolve_with`] is the last-sync-aware three-way skeleton used
//! identically by buffer sync, directory sync, and realtime inbound: when the
//! store still matches the last-synced snapshot the incoming value simply
//! overwrites, otherwise both sides changed and the kind's merge runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use trellis_ident::NodeId;

/// Sentinel line separating conflicting content segments.
pub const CONFLICT_MARKER: &str = "<CONFLICT>";

/// A 32-byte blake3 value hash, rendered as lowercase hex.
///
/// Realtime packets carry these so peers can tell a spurious re-broadcast of
/// their own write from a genuine divergence.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ValueHash(pub [u8; 32]);

impl fmt::Display for ValueHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for ValueHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ValueHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error as DeError;
        let text = String::deserialize(deserializer)?;
        let bytes = text.as_bytes();
        if bytes.len() != 64 {
            return Err(DeError::custom("value hash must be 64 hex chars"));
        }
        let mut out = [0u8; 32];
        for (i, chunk) in bytes.chunks_exact(2).enumerate() {
            let hi = hex_nibble(chunk[0]).ok_or_else(|| DeError::custom("bad hex"))?;
            let lo = hex_nibble(chunk[1]).ok_or_else(|| DeError::custom("bad hex"))?;
            out[i] = (hi << 4) | lo;
        }
        Ok(Self(out))
    }
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Hash of a node's content lines.
///
/// Canonical encoding is length-prefixed line bytes under a domain prefix, so
/// the hash never depends on any serializer's whitespace choices.
#[must_use]
pub fn content_hash(lines: &[String]) -> ValueHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"content:");
    for line in lines {
        hasher.update(&(line.len() as u64).to_le_bytes());
        hasher.update(line.as_bytes());
    }
    ValueHash(hasher.finalize().into())
}

/// Hash of a node's child set identity.
///
/// Ids are hashed sorted: two peers holding the same children in different
/// insertion orders agree on identity, which is what re-broadcast
/// suppression needs.
#[must_use]
pub fn children_hash(ids: &[NodeId]) -> ValueHash {
    let mut sorted: Vec<&NodeId> = ids.iter().collect();
    sorted.sort();
    sorted.dedup();
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"children:");
    for id in sorted {
        hasher.update(id.as_bytes());
    }
    ValueHash(hasher.finalize().into())
}

/// Merges two content line lists.
///
/// Equal inputs pass through untouched. Otherwise both inputs are split at
/// [`CONFLICT_MARKER`] lines into segments, the segments are collected into a
/// sorted deduplicated set (old first, then new), and the set is joined back
/// with single markers between segments.
#[must_use]
pub fn merge_content(new: &[String], old: &[String]) -> Vec<String> {
    if new == old {
        return new.to_vec();
    }

    let mut segments: Vec<Vec<String>> = Vec::new();
    for segment in split_conflict_segments(old)
        .into_iter()
        .chain(split_conflict_segments(new))
    {
        if let Err(idx) = segments.binary_search(&segment) {
            segments.insert(idx, segment);
        }
    }

    let mut merged = Vec::new();
    for segment in &segments {
        merged.extend(segment.iter().cloned());
        merged.push(CONFLICT_MARKER.to_owned());
    }
    merged.pop();
    merged
}

/// Splits lines at conflict markers. A list without markers yields itself as
/// the only segment; N markers yield N+1 segments (possibly empty ones).
#[must_use]
pub fn split_conflict_segments(lines: &[String]) -> Vec<Vec<String>> {
    let mut segments = Vec::new();
    let mut start = 0;
    for (idx, line) in lines.iter().enumerate() {
        if line == CONFLICT_MARKER {
            segments.push(lines[start..idx].to_vec());
            start = idx + 1;
        }
    }
    segments.push(lines[start..].to_vec());
    segments
}

/// Merges two ordered child id sequences: the new sequence (deduplicated,
/// order kept) followed by old ids not already present.
#[must_use]
pub fn merge_children(new: &[NodeId], old: &[NodeId]) -> Vec<NodeId> {
    let mut merged: Vec<NodeId> = Vec::with_capacity(new.len() + old.len());
    for id in new.iter().chain(old.iter()) {
        if !merged.contains(id) {
            merged.push(*id);
        }
    }
    merged
}

/// The two conflict-able value kinds a node carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeValue {
    /// Ordered content lines (never empty; absent content is `[""]`).
    Content(Vec<String>),
    /// Ordered child id sequence.
    Children(Vec<NodeId>),
}

impl NodeValue {
    /// Merges `self` (the incoming side) with a stored value of the same
    /// kind. Kind mismatch cannot occur through the typed store tables; it
    /// resolves to the incoming side.
    #[must_use]
    pub fn merge_with(self, stored: &NodeValue) -> NodeValue {
        match (self, stored) {
            (NodeValue::Content(new), NodeValue::Content(old)) => {
                NodeValue::Content(merge_content(&new, old))
            }
            (NodeValue::Children(new), NodeValue::Children(old)) => {
                NodeValue::Children(merge_children(&new, old))
            }
            (incoming, _) => {
                debug_assert!(false, "node value kinds never mix");
                incoming
            }
        }
    }

    /// The kind's identity hash (see [`content_hash`] / [`children_hash`]).
    #[must_use]
    pub fn value_hash(&self) -> ValueHash {
        match self {
            NodeValue::Content(lines) => content_hash(lines),
            NodeValue::Children(ids) => children_hash(ids),
        }
    }
}

/// Last-sync-aware three-way resolution skeleton.
///
/// * store absent → the incoming value wins outright;
/// * store still equal to the last-synced snapshot → only the incoming side
///   changed, overwrite;
/// * otherwise both sides changed since the snapshot → run `merge`.
pub fn resolve_with<T, F>(incoming: T, store: Option<&T>, last_sync: Option<&T>, merge: F) -> T
where
    T: PartialEq,
    F: FnOnce(T, &T) -> T,
{
    match store {
        None => incoming,
        Some(stored) => {
            if last_sync == Some(stored) {
                incoming
            } else {
                merge(incoming, stored)
            }
        }
    }
}

/// [`resolve_with`] specialized to content lines.
#[must_use]
pub fn resolve_content(
    incoming: Vec<String>,
    store: Option<&Vec<String>>,
    last_sync: Option<&Vec<String>>,
) -> Vec<String> {
    resolve_with(incoming, store, last_sync, |new, old| {
        merge_content(&new, old)
    })
}

/// [`resolve_with`] specialized to child id sequences.
#[must_use]
pub fn resolve_children(
    incoming: Vec<NodeId>,
    store: Option<&Vec<NodeId>>,
    last_sync: Option<&Vec<NodeId>>,
) -> Vec<NodeId> {
    resolve_with(incoming, store, last_sync, |new, old| {
        merge_children(&new, old)
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn equal_content_passes_through() {
        let a = lines(&["Hello"]);
        assert_eq!(merge_content(&a, &a), a);
    }

    #[test]
    fn divergent_content_sorts_segments() {
        // Realtime conflict scenario: local moved to "Hello world", remote
        // broadcast "Hi" against the old hash.
        let merged = merge_content(&lines(&["Hi"]), &lines(&["Hello world"]));
        assert_eq!(merged, lines(&["Hello world", CONFLICT_MARKER, "Hi"]));
    }

    #[test]
    fn remerge_is_stable() {
        let merged = merge_content(&lines(&["Hi"]), &lines(&["Hello world"]));
        let again = merge_content(&merged, &lines(&["Hello world"]));
        assert_eq!(again, merged);
        let cross = merge_content(&lines(&["Hello world"]), &merged);
        assert_eq!(cross, merged);
    }

    #[test]
    fn duplicate_conflict_arms_collapse() {
        let conflicted = lines(&["a", CONFLICT_MARKER, "b"]);
        let merged = merge_content(&conflicted, &lines(&["b"]));
        assert_eq!(merged, lines(&["a", CONFLICT_MARKER, "b"]));
    }

    #[test]
    fn children_union_keeps_first_seen_order() {
        let a = NodeId::from_parts(1, [1; 10]);
        let b = NodeId::from_parts(2, [2; 10]);
        let c = NodeId::from_parts(3, [3; 10]);
        let merged = merge_children(&[b, c], &[a, b]);
        assert_eq!(merged, vec![b, c, a]);
    }

    #[test]
    fn children_union_is_idempotent() {
        let a = NodeId::from_parts(1, [1; 10]);
        let b = NodeId::from_parts(2, [2; 10]);
        let once = merge_children(&[a], &[b]);
        let twice = merge_children(&once, &[b]);
        assert_eq!(once, twice);
    }

    #[test]
    fn resolve_overwrites_when_store_matches_snapshot() {
        let store = lines(&["old"]);
        let out = resolve_content(lines(&["new"]), Some(&store), Some(&store));
        assert_eq!(out, lines(&["new"]));
    }

    #[test]
    fn resolve_merges_when_store_moved() {
        let store = lines(&["moved"]);
        let snapshot = lines(&["old"]);
        let out = resolve_content(lines(&["new"]), Some(&store), Some(&snapshot));
        assert_eq!(out, merge_content(&lines(&["new"]), &store));
    }

    #[test]
    fn resolve_without_snapshot_merges() {
        let store = lines(&["theirs"]);
        let out = resolve_content(lines(&["ours"]), Some(&store), None);
        assert!(out.contains(&CONFLICT_MARKER.to_owned()));
    }

    #[test]
    fn children_hash_ignores_order() {
        let a = NodeId::from_parts(1, [1; 10]);
        let b = NodeId::from_parts(2, [2; 10]);
        assert_eq!(children_hash(&[a, b]), children_hash(&[b, a]));
        assert_ne!(children_hash(&[a]), children_hash(&[a, b]));
    }

    #[test]
    fn content_hash_is_structural() {
        // Two lines "ab"+"c" must not collide with "a"+"bc".
        assert_ne!(
            content_hash(&lines(&["ab", "c"])),
            content_hash(&lines(&["a", "bc"]))
        );
    }

    #[test]
    fn value_hash_text_round_trips() {
        let hash = content_hash(&lines(&["x"]));
        let json = format!("\"{hash}\"");
        let back: ValueHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
