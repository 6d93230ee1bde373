// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Lazy, monotonic short-id allocation.
//!
//! The counter is derived from the last key of `short_id_to_node` rather
//! than a separate cell, so allocation survives crashes without a second
//! write and can never hand out a used value.

use crate::graph::id_from_key;
use crate::{node_key, Store, StoreError};
use heed3::{RoTxn, RwTxn};
use trellis_ident::{NodeId, ShortId};

impl Store {
    /// Returns the node's short id, allocating the next counter value on
    /// first use. Allocation is monotonic; ids are never recycled.
    pub fn short_id(&self, txn: &mut RwTxn<'_>, id: NodeId) -> Result<ShortId, StoreError> {
        let key = node_key(id);
        if let Some(bytes) = self.tables.node_to_short_id.get(txn, &key)? {
            return Ok(ShortId::from_counter_bytes(bytes));
        }

        let counter = match self.tables.short_id_to_node.last(txn)? {
            Some((last_key, _)) => counter_from_bytes(last_key) + 1,
            None => 0,
        };
        let width = self.short_id_width;
        if width < 16 && counter >= 1u128 << (8 * width as u32) {
            return Err(StoreError::ShortIdSpaceExhausted(width));
        }
        let counter_bytes = counter_to_bytes(counter, width);

        self.tables.node_to_short_id.put(txn, &key, &counter_bytes)?;
        self.tables
            .short_id_to_node
            .put(txn, &counter_bytes, &key)?;
        Ok(ShortId::from_counter_bytes(&counter_bytes))
    }

    /// Resolves a short id parsed out of a buffer tag.
    pub fn node_for_short_id(
        &self,
        txn: &RoTxn<'_>,
        short: &ShortId,
    ) -> Result<NodeId, StoreError> {
        let counter_bytes = short
            .counter_bytes(self.short_id_width)
            .map_err(|_| StoreError::InvalidShortId(short.as_str().to_owned()))?;
        match self.tables.short_id_to_node.get(txn, &counter_bytes)? {
            Some(id_bytes) => id_from_key(id_bytes),
            None => Err(StoreError::InvalidShortId(short.as_str().to_owned())),
        }
    }
}

fn counter_from_bytes(bytes: &[u8]) -> u128 {
    bytes
        .iter()
        .fold(0u128, |acc, byte| (acc << 8) | u128::from(*byte))
}

fn counter_to_bytes(counter: u128, width: usize) -> Vec<u8> {
    let mut out = vec![0u8; width];
    let be = counter.to_be_bytes();
    let start = be.len() - width.min(be.len());
    out.copy_from_slice(&be[start..]);
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn counter_codec_round_trips() {
        for counter in [0u128, 1, 255, 256, 65_535] {
            let bytes = counter_to_bytes(counter, 2);
            assert_eq!(bytes.len(), 2);
            assert_eq!(counter_from_bytes(&bytes), counter);
        }
    }
}
