//! Transaction index helpers backed by the storage trait.

use pepexd_consensus::Hash256;
use pepexd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

const TX_LOCATION_LEN: usize = 16;

/// Where a confirmed transaction sits: its block and its byte span inside the raw block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxLocation {
    pub height: u32,
    pub position: u32,
    pub offset: u32,
    pub len: u32,
}

impl TxLocation {
    pub fn encode(&self) -> [u8; TX_LOCATION_LEN] {
        let mut out = [0u8; TX_LOCATION_LEN];
        out[0..4].copy_from_slice(&self.height.to_le_bytes());
        out[4..8].copy_from_slice(&self.position.to_le_bytes());
        out[8..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TX_LOCATION_LEN {
            return None;
        }
        let word = |at: usize| -> Option<u32> {
            Some(u32::from_le_bytes(bytes[at..at + 4].try_into().ok()?))
        };
        Some(Self {
            height: word(0)?,
            position: word(4)?,
            offset: word(8)?,
            len: word(12)?,
        })
    }
}

pub struct TxIndex<S> {
    store: S,
}

impl<S> TxIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> TxIndex<S> {
    pub fn insert(&self, batch: &mut WriteBatch, txid: &Hash256, location: TxLocation) {
        batch.put(Column::TxIndex, txid, location.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, txid: &Hash256) {
        batch.delete(Column::TxIndex, txid);
    }

    pub fn get(&self, txid: &Hash256) -> Result<Option<TxLocation>, StoreError> {
        let bytes = match self.store.get(Column::TxIndex, txid)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        TxLocation::decode(&bytes)
            .ok_or_else(|| StoreError::Backend("invalid tx index entry".to_string()))
            .map(Some)
    }
}
