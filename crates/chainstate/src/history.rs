//! Per-script-hash transaction history.

use pepexd_consensus::Hash256;
use pepexd_primitives::script::ScriptHash;
use pepexd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

const SCRIPT_HASH_LEN: usize = 32;
const HEIGHT_LEN: usize = 4;
const POSITION_LEN: usize = 4;
const TXID_LEN: usize = 32;

const KEY_LEN: usize = SCRIPT_HASH_LEN + HEIGHT_LEN + POSITION_LEN + TXID_LEN;
const VALUE_LEN: usize = 16;

/// Amounts a transaction moved into (`funded`) and out of (`spent`) one script hash.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HistoryDelta {
    pub funded: i64,
    pub spent: i64,
}

impl HistoryDelta {
    pub fn net(&self) -> i64 {
        self.funded - self.spent
    }

    fn encode(&self) -> [u8; VALUE_LEN] {
        let mut out = [0u8; VALUE_LEN];
        out[..8].copy_from_slice(&self.funded.to_le_bytes());
        out[8..].copy_from_slice(&self.spent.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != VALUE_LEN {
            return None;
        }
        Some(Self {
            funded: i64::from_le_bytes(bytes[..8].try_into().ok()?),
            spent: i64::from_le_bytes(bytes[8..].try_into().ok()?),
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HistoryEntry {
    pub height: u32,
    /// Index of the transaction within its block.
    pub position: u32,
    pub txid: Hash256,
    pub delta: HistoryDelta,
}

/// Big-endian height and position so a prefix scan walks the script's history in
/// blockchain order.
pub fn history_key(
    script_hash: &ScriptHash,
    height: u32,
    position: u32,
    txid: &Hash256,
) -> [u8; KEY_LEN] {
    let height_end = SCRIPT_HASH_LEN + HEIGHT_LEN;
    let position_end = height_end + POSITION_LEN;
    let mut key = [0u8; KEY_LEN];
    key[..SCRIPT_HASH_LEN].copy_from_slice(script_hash.as_bytes());
    key[SCRIPT_HASH_LEN..height_end].copy_from_slice(&height.to_be_bytes());
    key[height_end..position_end].copy_from_slice(&position.to_be_bytes());
    key[position_end..].copy_from_slice(txid);
    key
}

fn parse_history_key(key: &[u8]) -> Option<(u32, u32, Hash256)> {
    if key.len() != KEY_LEN {
        return None;
    }
    let height_end = SCRIPT_HASH_LEN + HEIGHT_LEN;
    let position_end = height_end + POSITION_LEN;
    let height = u32::from_be_bytes(key[SCRIPT_HASH_LEN..height_end].try_into().ok()?);
    let position = u32::from_be_bytes(key[height_end..position_end].try_into().ok()?);
    let txid: Hash256 = key[position_end..].try_into().ok()?;
    Some((height, position, txid))
}

pub struct HistoryIndex<S> {
    store: S,
}

impl<S> HistoryIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> HistoryIndex<S> {
    pub fn insert(
        &self,
        batch: &mut WriteBatch,
        script_hash: &ScriptHash,
        height: u32,
        position: u32,
        txid: &Hash256,
        delta: HistoryDelta,
    ) {
        let key = history_key(script_hash, height, position, txid);
        batch.put(Column::History, key, delta.encode());
    }

    pub fn delete(
        &self,
        batch: &mut WriteBatch,
        script_hash: &ScriptHash,
        height: u32,
        position: u32,
        txid: &Hash256,
    ) {
        batch.delete(Column::History, history_key(script_hash, height, position, txid));
    }

    /// Every confirmed entry, ordered by height then position in the block.
    pub fn scan(&self, script_hash: &ScriptHash) -> Result<Vec<HistoryEntry>, StoreError> {
        let mut entries = Vec::new();
        self.store
            .for_each_prefix(Column::History, script_hash.as_bytes(), &mut |key, value| {
                let (height, position, txid) = parse_history_key(key)
                    .ok_or_else(|| StoreError::Backend("invalid history key".to_string()))?;
                let delta = HistoryDelta::decode(value)
                    .ok_or_else(|| StoreError::Backend("invalid history value".to_string()))?;
                entries.push(HistoryEntry {
                    height,
                    position,
                    txid,
                    delta,
                });
                Ok(())
            })?;
        Ok(entries)
    }
}
