// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! LMDB environment, named tables, and the resize-on-`MapFull` write loop.

use crate::StoreError;
use fs2::FileExt;
use heed3::types::{Bytes, Str};
use heed3::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Initial LMDB map size. Doubled on demand, never shrunk.
const INITIAL_MAP_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound on consecutive resize attempts for one write closure.
const MAX_GROW_RETRIES: usize = 8;

/// Lock file guarding cross-process map resizes.
const RESIZE_LOCK_FILE: &str = "trellis.resize.lock";

const DB_CONTENT: &str = "content";
const DB_CHILDREN: &str = "children";
const DB_PARENTS: &str = "parents";
const DB_VIEWS: &str = "views";
const DB_TRANSPOSED_VIEWS: &str = "transposed_views";
const DB_UNSYNCED_CONTENT: &str = "unsynced_content";
const DB_UNSYNCED_CHILDREN: &str = "unsynced_children";
const DB_UNSYNCED_VIEWS: &str = "unsynced_views";
const DB_BLOOM_FILTERS: &str = "bloom_filters";
const DB_NODE_TO_SHORT_ID: &str = "node_to_short_id";
const DB_SHORT_ID_TO_NODE: &str = "short_id_to_node";
const DB_METADATA: &str = "metadata";

/// All named databases, created once when the environment opens.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Tables {
    pub(crate) content: Database<Bytes, Bytes>,
    pub(crate) children: Database<Bytes, Bytes>,
    pub(crate) parents: Database<Bytes, Bytes>,
    pub(crate) views: Database<Bytes, Bytes>,
    pub(crate) transposed_views: Database<Bytes, Bytes>,
    pub(crate) unsynced_content: Database<Bytes, Bytes>,
    pub(crate) unsynced_children: Database<Bytes, Bytes>,
    pub(crate) unsynced_views: Database<Bytes, Bytes>,
    pub(crate) bloom_filters: Database<Bytes, Bytes>,
    pub(crate) node_to_short_id: Database<Bytes, Bytes>,
    pub(crate) short_id_to_node: Database<Bytes, Bytes>,
    pub(crate) metadata: Database<Str, Bytes>,
}

/// Handle to one Trellis store. Cheap to clone; safe to share across tasks
/// (LMDB serializes writers internally).
#[derive(Clone, Debug)]
pub struct Store {
    pub(crate) env: Env,
    pub(crate) tables: Tables,
    dir: PathBuf,
    pub(crate) short_id_width: usize,
}

impl Store {
    /// Opens (or creates) the store at `dir` with the configured short-id
    /// counter width. All tables are created in one transaction; the width
    /// guard runs before the first commit.
    pub fn open(dir: impl AsRef<Path>, short_id_width: usize) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        // SAFETY: the directory is a dedicated LMDB environment; no other
        // map of it exists in this process (heed deduplicates handles).
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(INITIAL_MAP_SIZE)
                .max_dbs(12)
                .open(&dir)?
        };

        let mut wtxn = env.write_txn()?;
        let tables = Tables {
            content: named(&env, &mut wtxn, DB_CONTENT)?,
            children: named(&env, &mut wtxn, DB_CHILDREN)?,
            parents: named(&env, &mut wtxn, DB_PARENTS)?,
            views: named(&env, &mut wtxn, DB_VIEWS)?,
            transposed_views: named(&env, &mut wtxn, DB_TRANSPOSED_VIEWS)?,
            unsynced_content: named(&env, &mut wtxn, DB_UNSYNCED_CONTENT)?,
            unsynced_children: named(&env, &mut wtxn, DB_UNSYNCED_CHILDREN)?,
            unsynced_views: named(&env, &mut wtxn, DB_UNSYNCED_VIEWS)?,
            bloom_filters: named(&env, &mut wtxn, DB_BLOOM_FILTERS)?,
            node_to_short_id: named(&env, &mut wtxn, DB_NODE_TO_SHORT_ID)?,
            short_id_to_node: named(&env, &mut wtxn, DB_SHORT_ID_TO_NODE)?,
            metadata: env
                .database_options()
                .types::<Str, Bytes>()
                .name(DB_METADATA)
                .create(&mut wtxn)?,
        };

        let store = Self {
            env: env.clone(),
            tables,
            dir,
            short_id_width,
        };
        store.guard_short_id_width(&mut wtxn)?;
        wtxn.commit()?;
        Ok(store)
    }

    /// Begins a read transaction.
    pub fn read_txn(&self) -> Result<RoTxn<'_, heed3::WithTls>, StoreError> {
        Ok(self.env.read_txn()?)
    }

    /// Begins a raw write transaction. Prefer [`Store::with_write`], which
    /// handles `MapFull` resizing; use this only when the caller owns the
    /// commit point (e.g. one editing cycle spanning parse → sync → render).
    pub fn write_txn(&self) -> Result<RwTxn<'_>, StoreError> {
        Ok(self.env.write_txn()?)
    }

    /// Runs `f` inside a write transaction and commits. When the map fills
    /// up the attempt is aborted, the map doubled under the cross-process
    /// resize lock, and `f` re-run from scratch — so `f` must be safe to
    /// repeat (all sync-path closures are: they re-read before writing).
    pub fn with_write<R>(
        &self,
        mut f: impl FnMut(&mut RwTxn<'_>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        for _ in 0..MAX_GROW_RETRIES {
            let mut txn = self.env.write_txn()?;
            match f(&mut txn).and_then(|value| {
                txn.commit()?;
                Ok(value)
            }) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_map_full() => self.grow()?,
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::Backend(heed3::Error::Mdb(
            heed3::MdbError::MapFull,
        )))
    }

    /// Doubles the LMDB map size. Guarded by an advisory file lock so two
    /// processes sharing the environment never resize concurrently.
    fn grow(&self) -> Result<(), StoreError> {
        let lock_path = self.dir.join(RESIZE_LOCK_FILE);
        let lock = File::create(&lock_path)?;
        lock.lock_exclusive()?;
        let current = self.env.info().map_size;
        // SAFETY: no transaction of ours is live here; the write loop only
        // calls grow() after aborting its transaction.
        unsafe {
            self.env.resize(current * 2)?;
        }
        lock.unlock()?;
        Ok(())
    }
}

fn named(
    env: &Env,
    wtxn: &mut RwTxn<'_>,
    name: &str,
) -> Result<Database<Bytes, Bytes>, StoreError> {
    Ok(env
        .database_options()
        .types::<Bytes, Bytes>()
        .name(name)
        .create(wtxn)?)
}

/// Reads a JSON value. `Ok(None)` is semantic absence.
pub(crate) fn get_json<T: DeserializeOwned>(
    db: Database<Bytes, Bytes>,
    txn: &RoTxn<'_>,
    key: &[u8],
) -> Result<Option<T>, StoreError> {
    match db.get(txn, key)? {
        None => Ok(None),
        Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
    }
}

/// Writes a JSON value, overwriting any previous one.
pub(crate) fn put_json<T: Serialize>(
    db: Database<Bytes, Bytes>,
    txn: &mut RwTxn<'_>,
    key: &[u8],
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value)?;
    db.put(txn, key, &bytes)?;
    Ok(())
}
