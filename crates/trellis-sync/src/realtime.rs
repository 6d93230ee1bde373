// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Realtime sync client.
//!
//! A reconnecting TCP client around the framed JSON protocol in
//! `trellis-proto`. Inbound packets always go through the conflict
//! primitive — [`apply_broadcast`] is re-entrant under duplicate delivery —
//! and surviving conflicts are re-broadcast so every peer converges.
//! Outbound packets are opportunistic: they only leave when somebody else
//! is online, and a throttled trigger collapses bursts.

use crate::epoch_secs;
use crate::orchestrator::Trigger;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use trellis_merge::{children_hash, content_hash, merge_children, merge_content};
use trellis_proto::{
    decode_frame, encode_frame, BroadcastPacket, Message, ProtoError, ERR_PRESENCE_INDEX,
    PRESENCE_TTL_SECS, STALE_PACKET_SECS,
};
use trellis_store::{RwTxn, Store, StoreError};

/// Reconnect backoff after a lost or failed connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Presence heartbeat period.
const PRESENCE_PERIOD: Duration = Duration::from_secs(1);

/// Outbound throttle: bursts inside this window collapse into one send.
const BROADCAST_THROTTLE: Duration = Duration::from_millis(100);

/// Realtime channel failures.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// The hub refused the ranged presence query. Operator action is
    /// required; retrying blindly would only repeat the refusal.
    #[error(
        "the realtime backend rejected the presence query ({0}); \
         enable the presence index on the hub and restart it"
    )]
    IndexDisabled(String),
    /// Wire codec failure.
    #[error(transparent)]
    Proto(#[from] ProtoError),
    /// Store layer failure while applying a packet.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Socket failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Applies one inbound packet to the store.
///
/// Per entry: a value hashing like the local one is a spurious re-broadcast
/// and is skipped; a local hash equal to the sender's pre-merge hash is a
/// fast-forward; anything else merges and joins the returned conflict
/// packet. Returns the conflicts plus whether any store value changed.
pub fn apply_broadcast(
    store: &Store,
    txn: &mut RwTxn<'_>,
    packet: &BroadcastPacket,
) -> Result<(BroadcastPacket, bool), StoreError> {
    let mut conflicts = BroadcastPacket::default();
    let mut changed = false;

    for (node, (last_hash, lines)) in &packet.content {
        let local = store.content_opt(txn, *node)?;
        let local_hash = local.as_ref().map(|value| content_hash(value));
        let downstream_hash = content_hash(lines);
        if local_hash == Some(downstream_hash) {
            continue;
        }
        let mut value = lines.clone();
        if let Some(local_lines) = &local {
            if local_hash != Some(*last_hash) {
                value = merge_content(lines, local_lines);
                if value != *lines {
                    conflicts
                        .content
                        .insert(*node, (downstream_hash, value.clone()));
                }
            }
        }
        store.set_content(txn, *node, &value)?;
        changed = true;
    }

    for (node, (last_hash, ids)) in &packet.children {
        let local = store.descendants(txn, *node, false)?;
        let local_hash = children_hash(&local);
        let downstream_hash = children_hash(ids);
        if local_hash == downstream_hash {
            continue;
        }
        let mut value = ids.clone();
        if !local.is_empty() && local_hash != *last_hash {
            value = merge_children(ids, &local);
            if value != *ids {
                conflicts
                    .children
                    .insert(*node, (downstream_hash, value.clone()));
            }
        }
        store.set_descendants(txn, *node, &value, false)?;
        changed = true;
    }

    Ok((conflicts, changed))
}

/// Shared state between the client loops and the rest of the process.
pub struct RealtimeHandle {
    outbound: mpsc::Sender<BroadcastPacket>,
    others_online: AtomicBool,
    clock_offset: AtomicI64,
    /// This client's stable id.
    pub client_id: String,
}

impl RealtimeHandle {
    /// True while another peer heartbeated within the presence TTL.
    #[must_use]
    pub fn others_online(&self) -> bool {
        self.others_online.load(Ordering::SeqCst)
    }

    /// Offset-corrected wallclock seconds.
    #[must_use]
    pub fn now_secs(&self) -> u64 {
        let offset = self.clock_offset.load(Ordering::SeqCst);
        epoch_secs().saturating_add_signed(offset)
    }

    /// Adjusts the wallclock offset (e.g. from an external time source).
    pub fn set_clock_offset(&self, offset_secs: i64) {
        self.clock_offset.store(offset_secs, Ordering::SeqCst);
    }

    /// Queues a buffer-sync packet for opportunistic broadcast. Dropped
    /// when empty or when nobody else is online.
    pub fn broadcast(&self, mut packet: BroadcastPacket) {
        if packet.is_empty() || !self.others_online() {
            return;
        }
        packet.client_id.clone_from(&self.client_id);
        packet.timestamp = self.now_secs();
        if self.outbound.try_send(packet).is_err() {
            debug!("outbound queue full, dropping packet (peers re-converge via git)");
        }
    }
}

/// The reconnecting realtime client.
pub struct RealtimeClient {
    store: Store,
    hub_addr: String,
    handle: Arc<RealtimeHandle>,
    outbound: mpsc::Receiver<BroadcastPacket>,
    buffer_trigger: Trigger,
}

impl RealtimeClient {
    /// Creates the client and its shared handle.
    #[must_use]
    pub fn new(
        store: Store,
        hub_addr: String,
        client_id: String,
        buffer_trigger: Trigger,
    ) -> (Self, Arc<RealtimeHandle>) {
        let (tx, rx) = mpsc::channel(64);
        let handle = Arc::new(RealtimeHandle {
            outbound: tx,
            others_online: AtomicBool::new(false),
            clock_offset: AtomicI64::new(0),
            client_id,
        });
        (
            Self {
                store,
                hub_addr,
                handle: Arc::clone(&handle),
                outbound: rx,
                buffer_trigger,
            },
            handle,
        )
    }

    /// Runs the client until an unrecoverable error. Connection losses
    /// back off [`RECONNECT_DELAY`] and reconnect; an index-disabled answer
    /// from the hub is surfaced instead of retried.
    pub async fn run(mut self) -> Result<(), RealtimeError> {
        loop {
            match self.session().await {
                Ok(()) => return Ok(()),
                Err(RealtimeError::IndexDisabled(msg)) => {
                    return Err(RealtimeError::IndexDisabled(msg));
                }
                Err(err) => {
                    warn!(?err, "realtime session ended, reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    /// One connection's lifetime.
    async fn session(&mut self) -> Result<(), RealtimeError> {
        let store = self.store.clone();
        let handle = Arc::clone(&self.handle);
        let trigger = self.buffer_trigger.clone();

        let stream = TcpStream::connect(&self.hub_addr).await?;
        info!(addr = %self.hub_addr, "realtime connected");
        let (mut reader, mut writer) = stream.into_split();

        writer
            .write_all(&encode_frame(&Message::Hello {
                client_id: handle.client_id.clone(),
            })?)
            .await?;

        let mut presence_tick = tokio::time::interval(PRESENCE_PERIOD);
        let mut acc: Vec<u8> = Vec::with_capacity(16 * 1024);
        let mut read_buf = vec![0u8; 16 * 1024];

        loop {
            tokio::select! {
                read = reader.read(&mut read_buf) => {
                    let n = read?;
                    if n == 0 {
                        return Err(RealtimeError::Io(std::io::Error::other(
                            "hub closed the connection",
                        )));
                    }
                    acc.extend_from_slice(&read_buf[..n]);
                    while let Some((msg, used)) = decode_frame(&acc)? {
                        acc.drain(..used);
                        if let Some(reply) = handle_inbound(&store, &handle, &trigger, msg)? {
                            writer.write_all(&encode_frame(&reply)?).await?;
                        }
                    }
                }
                packet = self.outbound.recv() => {
                    let Some(packet) = packet else {
                        return Ok(());
                    };
                    writer.write_all(&encode_frame(&Message::Broadcast(packet))?).await?;
                    // Collapse bursts: anything queued in the throttle
                    // window rides the next iteration.
                    tokio::time::sleep(BROADCAST_THROTTLE).await;
                }
                _ = presence_tick.tick() => {
                    let now = handle.now_secs();
                    writer.write_all(&encode_frame(&Message::Presence {
                        client_id: handle.client_id.clone(),
                        timestamp: now,
                    })?).await?;
                    writer.write_all(&encode_frame(&Message::PresenceQuery {
                        since: now.saturating_sub(PRESENCE_TTL_SECS),
                    })?).await?;
                }
            }
        }
    }
}

/// Handles one inbound message; returns an optional reply frame.
fn handle_inbound(
    store: &Store,
    handle: &RealtimeHandle,
    buffer_trigger: &Trigger,
    msg: Message,
) -> Result<Option<Message>, RealtimeError> {
    match msg {
        Message::Broadcast(packet) => {
            if packet.client_id == handle.client_id
                || packet.timestamp + STALE_PACKET_SECS < handle.now_secs()
                || packet.is_empty()
            {
                return Ok(None);
            }
            debug!(from = %packet.client_id, "applying remote packet");
            let (conflicts, changed) =
                store.with_write(|txn| apply_broadcast(store, txn, &packet))?;
            if changed {
                buffer_trigger.set();
            }
            if conflicts.is_empty() {
                Ok(None)
            } else {
                let mut conflicts = conflicts;
                conflicts.client_id.clone_from(&handle.client_id);
                conflicts.timestamp = handle.now_secs();
                Ok(Some(Message::Broadcast(conflicts)))
            }
        }
        Message::PresenceSnapshot { mut clients } => {
            let others =
                trellis_proto::prune_presence(&mut clients, handle.now_secs(), &handle.client_id);
            handle.others_online.store(others, Ordering::SeqCst);
            Ok(None)
        }
        Message::Error(payload) if payload.name == ERR_PRESENCE_INDEX => {
            Err(RealtimeError::IndexDisabled(payload.message))
        }
        Message::Error(payload) => {
            warn!(name = %payload.name, msg = %payload.message, "hub error");
            Ok(None)
        }
        other => {
            debug!(op = other.op_name(), "ignoring unexpected message");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::collections::BTreeMap as Map;
    use tempfile::TempDir;
    use trellis_ident::{NodeId, DEFAULT_SHORT_ID_BYTES};
    use trellis_merge::CONFLICT_MARKER;

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

    fn content_packet(node: NodeId, last: &[String], new: &[&str]) -> BroadcastPacket {
        let mut content = Map::new();
        content.insert(node, (content_hash(last), lines(new)));
        BroadcastPacket {
            client_id: "peer".to_owned(),
            timestamp: 0,
            content,
            children: Map::new(),
        }
    }

    #[test]
    fn fast_forward_applies_directly() {
        let (_dir, store) = open();
        let a = node(1);
        store
            .with_write(|txn| store.set_content(txn, a, &lines(&["Hello"])))
            .unwrap();

        let packet = content_packet(a, &lines(&["Hello"]), &["Hi"]);
        let (conflicts, changed) = store
            .with_write(|txn| apply_broadcast(&store, txn, &packet))
            .unwrap();

        assert!(changed);
        assert!(conflicts.is_empty());
        let txn = store.read_txn().unwrap();
        assert_eq!(store.content(&txn, a).unwrap(), lines(&["Hi"]));
    }

    #[test]
    fn spurious_rebroadcast_is_ignored() {
        let (_dir, store) = open();
        let a = node(1);
        store
            .with_write(|txn| store.set_content(txn, a, &lines(&["Hi"])))
            .unwrap();

        let packet = content_packet(a, &lines(&["whatever"]), &["Hi"]);
        let (conflicts, changed) = store
            .with_write(|txn| apply_broadcast(&store, txn, &packet))
            .unwrap();
        assert!(!changed);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn three_way_conflict_merges_and_rebroadcasts() {
        let (_dir, store) = open();
        let a = node(1);
        // The store moved to "Hello world" after the peer last saw "Hello".
        store
            .with_write(|txn| store.set_content(txn, a, &lines(&["Hello world"])))
            .unwrap();

        let packet = content_packet(a, &lines(&["Hello"]), &["Hi"]);
        let (conflicts, changed) = store
            .with_write(|txn| apply_broadcast(&store, txn, &packet))
            .unwrap();

        assert!(changed);
        let expected = lines(&["Hello world", CONFLICT_MARKER, "Hi"]);
        let txn = store.read_txn().unwrap();
        assert_eq!(store.content(&txn, a).unwrap(), expected);

        // The re-broadcast carries the merged value under the downstream
        // hash so other peers recognize and converge on it.
        let (hash, value) = conflicts.content.get(&a).unwrap();
        assert_eq!(*hash, content_hash(&lines(&["Hi"])));
        assert_eq!(value, &expected);
    }

    #[test]
    fn repeated_delivery_is_idempotent() {
        let (_dir, store) = open();
        let a = node(1);
        store
            .with_write(|txn| store.set_content(txn, a, &lines(&["Hello world"])))
            .unwrap();

        let packet = content_packet(a, &lines(&["Hello"]), &["Hi"]);
        for _ in 0..3 {
            store
                .with_write(|txn| apply_broadcast(&store, txn, &packet))
                .unwrap();
        }
        let txn = store.read_txn().unwrap();
        assert_eq!(
            store.content(&txn, a).unwrap(),
            lines(&["Hello world", CONFLICT_MARKER, "Hi"])
        );
    }

    #[test]
    fn children_updates_maintain_reverse_adjacency() {
        let (_dir, store) = open();
        let (p, a, b) = (node(1), node(2), node(3));
        store
            .with_write(|txn| {
                for id in [p, a, b] {
                    store.set_content(txn, id, &lines(&["x"]))?;
                }
                store.set_descendants(txn, p, &[a], false)
            })
            .unwrap();

        // Peer saw [a] and adds b.
        let mut children = Map::new();
        children.insert(p, (children_hash(&[a]), vec![a, b]));
        let packet = BroadcastPacket {
            client_id: "peer".to_owned(),
            timestamp: 0,
            content: Map::new(),
            children,
        };
        let (conflicts, changed) = store
            .with_write(|txn| apply_broadcast(&store, txn, &packet))
            .unwrap();
        assert!(changed);
        assert!(conflicts.is_empty());

        let txn = store.read_txn().unwrap();
        assert_eq!(store.descendants(&txn, p, false).unwrap(), vec![a, b]);
        assert_eq!(store.descendants(&txn, b, true).unwrap(), vec![p]);
    }
}
