// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Out-of-process node previews.
//!
//! A preview stacks three panes: the node's content, its children, and its
//! parents, each padded to a share of the requested height so a picker UI
//! (fzf-style) gets a stable layout. A tiny single-accept RPC listener
//! serves `(method, args)` JSON requests on localhost so external tools can
//! reuse the running process instead of paying a cold start.

use serde_json::{json, Value};
use std::collections::BTreeSet;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use trellis_ident::NodeId;
use trellis_store::{RoTxn, Store, StoreError};

/// Default RPC port.
pub const PREVIEW_PORT: u16 = 1200;

/// Default preview depth below the node.
pub const PREVIEW_DEPTH: usize = 3;

/// Preview pane sizes from the fzf preview environment, `(width, height)`.
#[must_use]
pub fn preview_dimensions() -> (usize, usize) {
    let read = |key: &str, default: usize| {
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(default)
            .saturating_sub(1)
            .max(1)
    };
    (
        read("FZF_PREVIEW_COLUMNS", 10),
        read("FZF_PREVIEW_LINES", 20),
    )
}

/// Renders the preview of `node`: content, then children, then parents.
pub fn preview_node(
    store: &Store,
    node: NodeId,
    width: usize,
    height: usize,
    depth: usize,
) -> Result<Vec<String>, StoreError> {
    let txn = store.read_txn()?;
    let min_content_height = height / 4;
    let min_children_height = height / 2;
    let min_parents_height = height.saturating_sub(min_children_height + min_content_height);

    let mut lines = store.content(&txn, node)?;
    pad_lines(&mut lines, width, min_content_height);

    for (transposed, min_height) in [(false, min_children_height), (true, min_parents_height)] {
        let mut section = descendant_preview_lines(
            store,
            &txn,
            node,
            transposed,
            width,
            depth.saturating_sub(1),
        )?;
        pad_lines(&mut section, width, min_height);
        lines.append(&mut section);
    }
    Ok(lines)
}

/// One pane of descendants, depth-first with a level cap. Cycles are cut by
/// both the cap and a visited set.
fn descendant_preview_lines(
    store: &Store,
    txn: &RoTxn<'_>,
    node: NodeId,
    transposed: bool,
    width: usize,
    max_level: usize,
) -> Result<Vec<String>, StoreError> {
    let roots = valid_descendants(store, txn, node, transposed)?;
    let mut lines = Vec::new();
    if roots.is_empty() {
        return Ok(lines);
    }
    lines.push(if transposed { "━" } else { "─" }.repeat(width));

    let mut visited: BTreeSet<NodeId> = BTreeSet::new();
    let mut stack: Vec<(NodeId, usize)> = roots.into_iter().rev().map(|id| (id, 0)).collect();
    while let Some((id, level)) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let sub = valid_descendants(store, txn, id, transposed)?;
        let has_other_ancestors = !store.descendants(txn, id, !transposed)?.is_empty();
        let content = store.content_or_default(txn, id)?;

        let indent = " ".repeat(4 * level);
        let bullet = if level == max_level && !sub.is_empty() {
            if transposed {
                '▶'
            } else {
                '‣'
            }
        } else if transposed {
            '●'
        } else {
            '•'
        };
        let marker = if has_other_ancestors { 'ॱ' } else { ' ' };

        let mut content = content.into_iter();
        let first = content.next().unwrap_or_default();
        lines.push(format!("{indent}{bullet}{marker}{first}"));
        for line in content {
            lines.push(format!("{indent}  {line}"));
        }

        if level < max_level {
            for child in sub.into_iter().rev() {
                stack.push((child, level + 1));
            }
        }
    }
    Ok(lines)
}

/// Read-only valid-descendant filter (the write-path prune is not available
/// on a preview transaction).
fn valid_descendants(
    store: &Store,
    txn: &RoTxn<'_>,
    node: NodeId,
    transposed: bool,
) -> Result<Vec<NodeId>, StoreError> {
    let mut out = Vec::new();
    for id in store.descendants(txn, node, transposed)? {
        if store.is_valid(txn, id)? {
            out.push(id);
        }
    }
    Ok(out)
}

/// Pads `lines` with blanks until their wrapped height reaches
/// `min_height`.
fn pad_lines(lines: &mut Vec<String>, width: usize, min_height: usize) {
    let width = width.max(1);
    let wrapped: usize = lines
        .iter()
        .map(|line| line.chars().count().div_ceil(width).max(1))
        .sum();
    for _ in wrapped..min_height {
        lines.push(String::new());
    }
}

/// Serves preview RPCs on `localhost:port`, one connection at a time.
///
/// Requests are newline-delimited JSON arrays `[method, args]`; the only
/// method is `preview_node(node_id, width, height, depth)`.
/// `close_connection` ends the session. Errors come back as
/// `{"error": text}` instead of tearing the connection down.
pub async fn run_preview_listener(store: Store, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, "preview listener ready");
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "preview connection");
        if let Err(err) = serve_connection(&store, stream).await {
            warn!(?err, "preview connection ended");
        }
    }
}

async fn serve_connection(store: &Store, stream: TcpStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let reply = match handle_request(store, line.trim()) {
            Ok(Some(value)) => value,
            Ok(None) => {
                // close_connection
                let bye = json!({"result": null}).to_string() + "\n";
                write_half.write_all(bye.as_bytes()).await?;
                return Ok(());
            }
            Err(text) => json!({ "error": text }),
        };
        let framed = reply.to_string() + "\n";
        write_half.write_all(framed.as_bytes()).await?;
    }
}

/// Dispatches one request line. `Ok(None)` closes the session.
fn handle_request(store: &Store, line: &str) -> Result<Option<Value>, String> {
    let (method, args): (String, Value) =
        serde_json::from_str(line).map_err(|err| format!("malformed request: {err}"))?;
    match method.as_str() {
        "close_connection" => Ok(None),
        "preview_node" => {
            let (node, width, height, depth): (String, usize, usize, usize) =
                serde_json::from_value(args).map_err(|err| format!("bad arguments: {err}"))?;
            let node: NodeId = node
                .parse()
                .map_err(|err| format!("bad node id: {err:?}"))?;
            let lines = preview_node(store, node, width, height, depth)
                .map_err(|err| format!("preview failed: {err}"))?;
            Ok(Some(json!({ "result": lines })))
        }
        other => Err(format!("unknown method {other:?}")),
    }
}
