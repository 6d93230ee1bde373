// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The per-edit cycle: parse → sync → render → write back, in one store
//! transaction, plus the debounced trigger the background loops use to
//! request a re-render.

use crate::buffer::sync_with_store;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use trellis_ident::NodeId;
use trellis_outline::{
    apply_buffer_edits, parse_buffer, render_view, EditorPort, LastSync, LineRange, ParseError,
};
use trellis_proto::BroadcastPacket;
use trellis_store::{Store, StoreError};

/// Set-and-wake trigger. Producers [`Trigger::set`] from any task or
/// thread; the single consumer clears the flag, runs, sleeps its throttle,
/// and rechecks — bursts collapse into one wake.
#[derive(Clone, Default)]
pub struct Trigger {
    pending: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Trigger {
    /// Fresh, unset trigger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a wake. Idempotent between consumer runs.
    pub fn set(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// True when a wake is pending (cleared by [`Trigger::wait`]).
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Waits for the next wake and clears it.
    pub async fn wait(&self) {
        loop {
            if self.pending.swap(false, Ordering::SeqCst) {
                return;
            }
            self.notify.notified().await;
        }
    }
}

/// Host-side choice when a parse is uncertain about a node's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UncertainChoice {
    /// Disable parsing until the user re-enables it.
    Pause,
    /// Forget the node's snapshot and re-parse (the typed children win).
    Continue,
}

/// Everything the cycle needs from the host editor beyond the line buffer.
pub trait EditorHost: EditorPort {
    /// Enables or disables buffer writes (disabled while a parse error is
    /// outstanding).
    fn set_writable(&mut self, writable: bool);
    /// Highlights the given line ranges as erroneous.
    fn highlight(&mut self, ranges: &[LineRange]);
    /// Clears previous error highlights.
    fn clear_highlights(&mut self);
    /// Asks the user how to treat an uncertain child set.
    fn confirm_uncertain(&mut self, node: NodeId, range: LineRange) -> UncertainChoice;
    /// Surfaces a non-fatal notice.
    fn notify(&mut self, message: &str);
}

/// Outcome of one editing cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Parse, sync, and render completed; the packet awaits broadcast.
    Synced(BroadcastPacket),
    /// A parse error is outstanding; the buffer was left untouched and
    /// writes are disabled.
    Blocked,
    /// Parsing is administratively disabled.
    Disabled,
}

/// Drives editing cycles for one buffer.
pub struct Orchestrator {
    store: Store,
    last_sync: LastSync,
    enabled: bool,
    long_ids: bool,
    fold_level: Option<usize>,
}

impl Orchestrator {
    /// New orchestrator over `store`.
    #[must_use]
    pub fn new(store: Store, long_ids: bool) -> Self {
        Self {
            store,
            last_sync: LastSync::new(),
            enabled: true,
            long_ids,
            fold_level: None,
        }
    }

    /// Re-enables parsing after an [`UncertainChoice::Pause`].
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether parsing is currently enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Caps the depth of the next renders (`None` lifts the cap).
    pub fn set_fold_level(&mut self, fold_level: Option<usize>) {
        self.fold_level = fold_level;
    }

    /// Last-render snapshot for the buffer (peer syncs three-way against
    /// it).
    #[must_use]
    pub fn last_sync(&self) -> &LastSync {
        &self.last_sync
    }

    /// Runs one editing cycle for the buffer showing `main_id`.
    ///
    /// Parse errors never reach the store: `DuplicateSibling` highlights
    /// both ranges and blocks writes; `UncertainChildren` asks the host and
    /// either re-parses without the node's snapshot or pauses parsing.
    pub fn sync_cycle(
        &mut self,
        host: &mut dyn EditorHost,
        main_id: NodeId,
        transposed: bool,
    ) -> Result<CycleOutcome, StoreError> {
        if !self.enabled {
            return Ok(CycleOutcome::Disabled);
        }

        let store = self.store.clone();
        let long_ids = self.long_ids;
        let fold_level = self.fold_level;
        let lines = host.lines();
        let last_sync = &mut self.last_sync;
        let enabled = &mut self.enabled;

        // One write transaction spans parse → sync → render, so the cycle
        // is atomic with respect to the peer sync loops. `with_write`
        // re-runs the whole closure after a map resize.
        enum Inner {
            Synced(BroadcastPacket, trellis_outline::RenderOutput),
            Duplicate(NodeId, (LineRange, LineRange)),
            Paused,
        }

        let inner = store.with_write(|txn| {
            let (view, changes) = loop {
                match parse_buffer(&store, txn, &lines, main_id, last_sync, transposed) {
                    Ok(parsed) => break parsed,
                    Err(ParseError::DuplicateSibling { node, ranges }) => {
                        return Ok(Inner::Duplicate(node, ranges));
                    }
                    Err(ParseError::UncertainChildren { node, range }) => {
                        match host.confirm_uncertain(node, range) {
                            UncertainChoice::Continue => last_sync.forget(node),
                            UncertainChoice::Pause => return Ok(Inner::Paused),
                        }
                    }
                    Err(ParseError::Store(err)) => return Err(err),
                }
            };

            let packet = sync_with_store(&store, txn, Some(&view), &changes, last_sync)?;
            let rendered = render_view(&store, txn, &view, fold_level, long_ids)?;
            Ok(Inner::Synced(packet, rendered))
        })?;

        match inner {
            Inner::Duplicate(node, ranges) => {
                host.highlight(&[ranges.0, ranges.1]);
                host.set_writable(false);
                host.notify(&format!(
                    "duplicate sibling {node} at lines {} and {}",
                    ranges.0 .0, ranges.1 .0
                ));
                Ok(CycleOutcome::Blocked)
            }
            Inner::Paused => {
                *enabled = false;
                host.set_writable(false);
                Ok(CycleOutcome::Blocked)
            }
            Inner::Synced(packet, rendered) => {
                host.clear_highlights();
                host.set_writable(true);
                apply_buffer_edits(host, &rendered.lines);
                self.last_sync = rendered.last_sync;
                Ok(CycleOutcome::Synced(packet))
            }
        }
    }

    /// Resolves which node a buffer shows; falls back to the root when the
    /// requested node is not valid.
    pub fn resolve_main_id(&self, requested: Option<NodeId>) -> Result<NodeId, StoreError> {
        let txn = self.store.read_txn()?;
        if let Some(id) = requested {
            if self.store.is_valid(&txn, id)? {
                return Ok(id);
            }
        }
        self.store.root_id(&txn)
    }
}

