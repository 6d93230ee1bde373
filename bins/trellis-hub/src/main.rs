// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Minimal TCP hub for the Trellis realtime channel.
//!
//! The sync engine treats its transport as opaque; this hub is the
//! reference backend. It fans broadcast packets out to every other
//! connection and keeps the shared presence map. Nothing here inspects
//! packet contents — conflict resolution is entirely client-side.

use anyhow::Result;
use clap::Parser;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use trellis_proto::{
    decode_frame, encode_frame, ErrorPayload, Message, ERR_PRESENCE_INDEX, MAX_FRAME,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Listen port.
    #[clap(short, long, default_value_t = 9341)]
    port: u16,

    /// Disable the presence index (clients get an error on ranged
    /// presence queries; exists to exercise their failure path).
    #[clap(long)]
    no_presence_index: bool,
}

struct ConnState {
    client_id: Option<String>,
    tx: tokio::sync::mpsc::Sender<Vec<u8>>,
}

#[derive(Default)]
struct HubState {
    next_conn_id: u64,
    conns: HashMap<u64, ConnState>,
    presence: BTreeMap<String, u64>,
    presence_index: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let hub = Arc::new(Mutex::new(HubState {
        presence_index: !args.no_presence_index,
        ..HubState::default()
    }));

    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    info!(port = args.port, "trellis hub listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "connection");
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, hub).await {
                warn!(?err, "client handler error");
            }
        });
    }
}

async fn handle_client(stream: TcpStream, hub: Arc<Mutex<HubState>>) -> Result<()> {
    let (mut reader, writer) = tokio::io::split(stream);

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(256);
    let conn_id = {
        let mut h = hub.lock().await;
        let id = h.next_conn_id;
        h.next_conn_id += 1;
        h.conns.insert(
            id,
            ConnState {
                client_id: None,
                tx,
            },
        );
        id
    };

    tokio::spawn(async move {
        let mut ws = writer;
        while let Some(buf) = rx.recv().await {
            if ws.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    let mut read_buf = vec![0u8; 16 * 1024];
    let mut acc: Vec<u8> = Vec::with_capacity(32 * 1024);
    let result = loop {
        let n = match reader.read(&mut read_buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(err) => break Err(err.into()),
        };
        acc.extend_from_slice(&read_buf[..n]);
        if acc.len() > MAX_FRAME + 4 {
            warn!(conn_id, "oversized frame, dropping connection");
            break Ok(());
        }
        loop {
            match decode_frame(&acc) {
                Ok(None) => break,
                Ok(Some((msg, used))) => {
                    acc.drain(..used);
                    handle_message(msg, conn_id, &hub).await;
                }
                Err(err) => {
                    warn!(?err, conn_id, "undecodable packet, dropping connection");
                    cleanup(conn_id, &hub).await;
                    return Ok(());
                }
            }
        }
    };

    cleanup(conn_id, &hub).await;
    result
}

async fn cleanup(conn_id: u64, hub: &Arc<Mutex<HubState>>) {
    let mut h = hub.lock().await;
    if let Some(conn) = h.conns.remove(&conn_id) {
        if let Some(client_id) = conn.client_id {
            h.presence.remove(&client_id);
        }
    }
}

/// Handles one inbound message from a connection.
async fn handle_message(msg: Message, conn_id: u64, hub: &Arc<Mutex<HubState>>) {
    match msg {
        Message::Hello { client_id } => {
            let mut h = hub.lock().await;
            if let Some(conn) = h.conns.get_mut(&conn_id) {
                debug!(conn_id, %client_id, "hello");
                conn.client_id = Some(client_id);
            }
        }
        Message::Broadcast(packet) => {
            let (frame, peers) = {
                let h = hub.lock().await;
                let frame = match encode_frame(&Message::Broadcast(packet)) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(?err, "unencodable broadcast");
                        return;
                    }
                };
                let peers: Vec<_> = h
                    .conns
                    .iter()
                    .filter(|(id, _)| **id != conn_id)
                    .map(|(_, conn)| conn.tx.clone())
                    .collect();
                (frame, peers)
            };
            for tx in peers {
                let _ = tx.send(frame.clone()).await;
            }
        }
        Message::Presence {
            client_id,
            timestamp,
        } => {
            let mut h = hub.lock().await;
            h.presence.insert(client_id, timestamp);
        }
        Message::PresenceQuery { since } => {
            let reply = {
                let h = hub.lock().await;
                if h.presence_index {
                    let clients: BTreeMap<String, u64> = h
                        .presence
                        .iter()
                        .filter(|(_, seen)| **seen >= since)
                        .map(|(id, seen)| (id.clone(), *seen))
                        .collect();
                    Message::PresenceSnapshot { clients }
                } else {
                    Message::Error(ErrorPayload {
                        name: ERR_PRESENCE_INDEX.to_owned(),
                        message: "ranged presence queries need the presence index; \
                                  restart the hub without --no-presence-index"
                            .to_owned(),
                    })
                }
            };
            send_to(conn_id, &reply, hub).await;
        }
        Message::PresenceSnapshot { .. } | Message::Error(_) => {
            // Client-bound messages; ignore from clients.
        }
    }
}

async fn send_to(conn_id: u64, msg: &Message, hub: &Arc<Mutex<HubState>>) {
    let tx = {
        let h = hub.lock().await;
        h.conns.get(&conn_id).map(|conn| conn.tx.clone())
    };
    let Some(tx) = tx else { return };
    match encode_frame(msg) {
        Ok(frame) => {
            let _ = tx.send(frame).await;
        }
        Err(err) => warn!(?err, "unencodable reply"),
    }
}
