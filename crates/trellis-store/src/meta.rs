// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Singleton metadata: root id, client identity, store-level flags.

use crate::{node_key, Store, StoreError};
use heed3::{RoTxn, RwTxn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use trellis_ident::NodeId;

const ROOT_ID_KEY: &str = "root_id";
const CLIENT_KEY: &str = "client";
const ENCRYPTION_KEY: &str = "db_encryption_enabled";
const SHORT_ID_BYTES_KEY: &str = "short_id_bytes";

/// Identity of this store's client, shared with peers over the realtime
/// channel and used as the git committer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// Globally unique client id (UUID text).
    pub client_id: String,
    /// Short human-readable name.
    pub client_name: String,
}

impl Store {
    /// The root node id. The root is created by [`Store::ensure_root`]
    /// before anything reads it; absence afterwards is a hard error.
    pub fn root_id(&self, txn: &RoTxn<'_>) -> Result<NodeId, StoreError> {
        self.get_meta(txn, ROOT_ID_KEY)?.ok_or(StoreError::KeyNotFound)
    }

    /// Creates the root node (single empty line, no edges) on first open and
    /// records it under the singleton metadata key.
    pub fn ensure_root(&self, txn: &mut RwTxn<'_>) -> Result<NodeId, StoreError> {
        if let Some(existing) = self.get_meta::<NodeId>(txn, ROOT_ID_KEY)? {
            return Ok(existing);
        }
        let root = NodeId::generate();
        let key = node_key(root);
        let empty_lines: Vec<String> = vec![String::new()];
        let no_ids: Vec<NodeId> = Vec::new();
        crate::kv::put_json(self.tables.content, txn, &key, &empty_lines)?;
        crate::kv::put_json(self.tables.children, txn, &key, &no_ids)?;
        crate::kv::put_json(self.tables.parents, txn, &key, &no_ids)?;
        self.put_meta(txn, ROOT_ID_KEY, &root)?;
        Ok(root)
    }

    /// Returns the client record, minting one on first call.
    pub fn client(&self, txn: &mut RwTxn<'_>) -> Result<Client, StoreError> {
        if let Some(existing) = self.get_meta::<Client>(txn, CLIENT_KEY)? {
            return Ok(existing);
        }
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(4)
            .map(char::from)
            .collect();
        let client = Client {
            client_id: NodeId::generate().to_string(),
            client_name: format!("trellis:{suffix}"),
        };
        self.put_meta(txn, CLIENT_KEY, &client)?;
        Ok(client)
    }

    /// Whether store values are recorded as encrypted.
    pub fn db_encrypted(&self, txn: &RoTxn<'_>) -> Result<bool, StoreError> {
        Ok(self.get_meta(txn, ENCRYPTION_KEY)?.unwrap_or(false))
    }

    /// Records the store-level encryption flag.
    pub fn set_db_encrypted(&self, txn: &mut RwTxn<'_>, enabled: bool) -> Result<(), StoreError> {
        self.put_meta(txn, ENCRYPTION_KEY, &enabled)
    }

    /// Refuses to open a store whose short ids were written at a different
    /// counter width. Re-encoding every stored mapping is the only safe way
    /// to change the width, and that is an explicit migration, not an open.
    pub(crate) fn guard_short_id_width(&self, txn: &mut RwTxn<'_>) -> Result<(), StoreError> {
        match self.get_meta::<usize>(txn, SHORT_ID_BYTES_KEY)? {
            None => self.put_meta(txn, SHORT_ID_BYTES_KEY, &self.short_id_width),
            Some(stored) if stored == self.short_id_width => Ok(()),
            Some(stored) => Err(StoreError::ShortIdWidth {
                stored,
                configured: self.short_id_width,
            }),
        }
    }

    fn get_meta<T: DeserializeOwned>(
        &self,
        txn: &RoTxn<'_>,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.tables.metadata.get(txn, key)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
        }
    }

    fn put_meta<T: Serialize>(
        &self,
        txn: &mut RwTxn<'_>,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        self.tables.metadata.put(txn, key, &bytes)?;
        Ok(())
    }
}
