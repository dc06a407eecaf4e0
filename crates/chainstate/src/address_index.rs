//! Script hash to unspent outpoint index backed by the storage trait.

use pepexd_primitives::outpoint::OutPoint;
use pepexd_primitives::script::ScriptHash;
use pepexd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::utxo::{OutPointKey, OUTPOINT_KEY_LEN};

const SCRIPT_HASH_LEN: usize = 32;
const KEY_LEN: usize = SCRIPT_HASH_LEN + OUTPOINT_KEY_LEN;

pub fn address_outpoint_key(script_hash: &ScriptHash, outpoint: &OutPoint) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key[..SCRIPT_HASH_LEN].copy_from_slice(script_hash.as_bytes());
    key[SCRIPT_HASH_LEN..].copy_from_slice(OutPointKey::new(outpoint).as_bytes());
    key
}

pub struct AddressIndex<S> {
    store: S,
}

impl<S> AddressIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> AddressIndex<S> {
    pub fn insert(&self, batch: &mut WriteBatch, script_hash: &ScriptHash, outpoint: &OutPoint) {
        batch.put(Column::AddressUtxo, address_outpoint_key(script_hash, outpoint), []);
    }

    pub fn delete(&self, batch: &mut WriteBatch, script_hash: &ScriptHash, outpoint: &OutPoint) {
        batch.delete(Column::AddressUtxo, address_outpoint_key(script_hash, outpoint));
    }

    /// Unspent outpoints paying `script_hash`, in key order.
    pub fn scan(&self, script_hash: &ScriptHash) -> Result<Vec<OutPoint>, StoreError> {
        let mut outpoints = Vec::new();
        self.store.for_each_prefix(
            Column::AddressUtxo,
            script_hash.as_bytes(),
            &mut |key, _| {
                let outpoint = key
                    .get(SCRIPT_HASH_LEN..)
                    .and_then(OutPointKey::from_slice)
                    .map(|key| key.outpoint())
                    .ok_or_else(|| StoreError::Backend("invalid address utxo key".to_string()))?;
                outpoints.push(outpoint);
                Ok(())
            },
        )?;
        Ok(outpoints)
    }
}
