// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Line-embedded node tag codec.
//!
//! A rendered header line binds its list item to a node with the tag
//! `[](XID)  `: an empty Markdown link whose target starts with a marker
//! character and carries the node's id text. The marker encodes two bits:
//!
//! | marker | walk       | ancestry      |
//! |--------|------------|---------------|
//! | `n`    | children   | single parent |
//! | `N`    | children   | multi parent  |
//! | `t`    | parents    | single parent |
//! | `T`    | parents    | multi parent  |
//!
//! Up to two spaces after the closing paren separate the tag from content
//! and are consumed by the parser.

/// Maximum id text length inside a tag (full UUID form).
const MAX_TAG_ID_LEN: usize = 36;

/// A parsed node tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTag {
    /// Whether the tag marks a transposed (parent-walk) occurrence.
    pub transposed: bool,
    /// Whether the node had more than one ancestor when rendered.
    pub multi_parent: bool,
    /// Id text: a compact short id or a full UUID. Resolution against the
    /// store is the caller's job.
    pub id: String,
}

/// Renders a tag for a header line.
#[must_use]
pub fn render_tag(id_text: &str, transposed: bool, multi_parent: bool) -> String {
    let marker = match (transposed, multi_parent) {
        (false, false) => 'n',
        (false, true) => 'N',
        (true, false) => 't',
        (true, true) => 'T',
    };
    format!("[]({marker}{id_text})  ")
}

/// Parses a tag at the start of `line`, returning the tag and the remaining
/// content. `None` when the line does not start with a well-formed tag.
#[must_use]
pub fn parse_tag(line: &str) -> Option<(NodeTag, &str)> {
    let rest = line.strip_prefix("[](")?;
    let marker = *rest.as_bytes().first()?;
    let (transposed, multi_parent) = match marker {
        b'n' => (false, false),
        b'N' => (false, true),
        b't' => (true, false),
        b'T' => (true, true),
        _ => return None,
    };
    let body = &rest[1..];
    let close = body.find(')')?;
    let id = &body[..close];
    if id.is_empty() || id.len() > MAX_TAG_ID_LEN || !id.bytes().all(is_id_byte) {
        return None;
    }
    let mut tail = &body[close + 1..];
    for _ in 0..2 {
        if let Some(stripped) = tail.strip_prefix(' ') {
            tail = stripped;
        }
    }
    Some((
        NodeTag {
            transposed,
            multi_parent,
            id: id.to_owned(),
        },
        tail,
    ))
}

fn is_id_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-'
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn round_trip_short_and_long_ids() {
        for (id, transposed, multi) in [
            ("Q", false, false),
            ("B7", false, true),
            ("0190a6f2-1111-7abc-8def-0123456789ab", true, false),
            ("ZZ", true, true),
        ] {
            let line = format!("{}hello world", render_tag(id, transposed, multi));
            let (tag, rest) = parse_tag(&line).unwrap();
            assert_eq!(tag.id, id);
            assert_eq!(tag.transposed, transposed);
            assert_eq!(tag.multi_parent, multi);
            assert_eq!(rest, "hello world");
        }
    }

    #[test]
    fn consumes_at_most_two_spaces() {
        let (_, rest) = parse_tag("[](nQ)    indented").unwrap();
        assert_eq!(rest, "  indented");
    }

    #[test]
    fn plain_links_are_not_tags() {
        assert!(parse_tag("[](https://example.com) x").is_none());
        assert!(parse_tag("[](n) empty id").is_none());
        assert!(parse_tag("[text](nQ)").is_none());
        assert!(parse_tag("no tag here").is_none());
    }
}
