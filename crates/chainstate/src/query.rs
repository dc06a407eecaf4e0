//! Read-only view of the confirmed index.

use std::sync::Arc;

use pepexd_consensus::Hash256;
use pepexd_primitives::outpoint::OutPoint;
use pepexd_primitives::script::ScriptHash;
use pepexd_storage::{KeyValueStore, StoreError};

use crate::address_index::AddressIndex;
use crate::history::{HistoryEntry, HistoryIndex};
use crate::index::{ChainIndex, ChainTip, HeaderRecord};
use crate::txindex::{TxIndex, TxLocation};
use crate::utxo::{OutputRecord, UtxoSet};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UtxoRow {
    pub outpoint: OutPoint,
    pub value: i64,
    pub height: u32,
}

/// Queries never write. Several calls only line up with each other when the caller
/// holds off commits in between (the mempool tracker's read lock does this).
pub struct ChainQuery<S> {
    store: Arc<S>,
}

impl<S> Clone for ChainQuery<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KeyValueStore> ChainQuery<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn tip(&self) -> Result<Option<ChainTip>, StoreError> {
        ChainIndex::new(self.store.as_ref()).tip()
    }

    /// Confirmed balance: the sum of unspent outputs paying `script_hash`.
    pub fn balance(&self, script_hash: &ScriptHash) -> Result<i64, StoreError> {
        Ok(self.utxos(script_hash)?.iter().map(|row| row.value).sum())
    }

    pub fn history(&self, script_hash: &ScriptHash) -> Result<Vec<HistoryEntry>, StoreError> {
        HistoryIndex::new(self.store.as_ref()).scan(script_hash)
    }

    pub fn utxos(&self, script_hash: &ScriptHash) -> Result<Vec<UtxoRow>, StoreError> {
        let outpoints = AddressIndex::new(self.store.as_ref()).scan(script_hash)?;
        let utxos = UtxoSet::new(self.store.as_ref());
        let mut rows = Vec::with_capacity(outpoints.len());
        for outpoint in outpoints {
            let record = utxos.get(&outpoint)?.ok_or_else(|| {
                StoreError::Backend("address index points at a spent output".to_string())
            })?;
            rows.push(UtxoRow {
                outpoint,
                value: record.value,
                height: record.height,
            });
        }
        rows.sort_by(|a, b| a.height.cmp(&b.height).then(a.outpoint.cmp(&b.outpoint)));
        Ok(rows)
    }

    pub fn header(&self, height: u32) -> Result<Option<HeaderRecord>, StoreError> {
        ChainIndex::new(self.store.as_ref()).header(height)
    }

    pub fn height_of(&self, hash: &Hash256) -> Result<Option<u32>, StoreError> {
        ChainIndex::new(self.store.as_ref()).height_of(hash)
    }

    pub fn tx_location(&self, txid: &Hash256) -> Result<Option<TxLocation>, StoreError> {
        TxIndex::new(self.store.as_ref()).get(txid)
    }

    /// Raw transaction bytes, while its block is still retained.
    pub fn raw_tx(&self, txid: &Hash256) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(location) = self.tx_location(txid)? else {
            return Ok(None);
        };
        let Some(block) = ChainIndex::new(self.store.as_ref()).raw_block(location.height)? else {
            return Ok(None);
        };
        let start = location.offset as usize;
        let end = start + location.len as usize;
        block
            .get(start..end)
            .map(|bytes| Some(bytes.to_vec()))
            .ok_or_else(|| StoreError::Backend("tx span outside raw block".to_string()))
    }

    /// The output as created, spent or not.
    pub fn output(&self, outpoint: &OutPoint) -> Result<Option<OutputRecord>, StoreError> {
        UtxoSet::new(self.store.as_ref()).output(outpoint)
    }

    pub fn unspent(&self, outpoint: &OutPoint) -> Result<Option<OutputRecord>, StoreError> {
        UtxoSet::new(self.store.as_ref()).get(outpoint)
    }
}
