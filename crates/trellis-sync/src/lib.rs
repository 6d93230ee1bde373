// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The Trellis sync engine.
//!
//! Three reconciliation paths keep the store, the outline buffer, and the
//! file-per-node git directory convergent, all through the same three-way
//! merge primitive:
//!
//! * [`buffer::sync_with_store`] — parser output → store, emitting the
//!   realtime broadcast packet;
//! * [`gitdir::GitSync`] — file directory ↔ store through a git
//!   fetch/merge/push loop;
//! * [`realtime`] — remote packets → store, re-broadcasting surviving
//!   conflicts.
//!
//! [`orchestrator`] drives the per-edit cycle (parse → sync → render →
//! write-back) inside one store transaction, and [`preview`] serves
//! out-of-process node previews.

pub mod buffer;
pub mod gitdir;
pub mod orchestrator;
pub mod preview;
pub mod realtime;

pub use gitdir::GitError;
pub use realtime::RealtimeError;

use trellis_store::StoreError;

/// Umbrella error for daemon-level plumbing.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Store layer failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Directory sync failure.
    #[error(transparent)]
    Git(#[from] GitError),
    /// Realtime channel failure.
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] trellis_config::ConfigError),
    /// Filesystem failure outside the store.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Seconds since the Unix epoch on the local clock.
#[must_use]
pub(crate) fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
