//! Header tables, the chain tip marker and the schema tag.

use pepexd_consensus::Hash256;
use pepexd_storage::{clear_column, Column, KeyValueStore, StoreError, WriteBatch};

const META_TIP_KEY: &[u8] = b"tip";
const META_SCHEMA_KEY: &[u8] = b"schema_version";

/// Bumped whenever a table layout changes; older directories must be reindexed.
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainTip {
    pub height: u32,
    pub hash: Hash256,
}

impl ChainTip {
    fn encode(&self) -> [u8; 36] {
        let mut out = [0u8; 36];
        out[..4].copy_from_slice(&self.height.to_le_bytes());
        out[4..].copy_from_slice(&self.hash);
        out
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 36 {
            return None;
        }
        Some(Self {
            height: u32::from_le_bytes(bytes[..4].try_into().ok()?),
            hash: bytes[4..].try_into().ok()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeaderRecord {
    pub hash: Hash256,
    pub raw: Vec<u8>,
}

pub fn height_key(height: u32) -> [u8; 4] {
    height.to_be_bytes()
}

pub struct ChainIndex<S> {
    store: S,
}

impl<S> ChainIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> ChainIndex<S> {
    pub fn tip(&self) -> Result<Option<ChainTip>, StoreError> {
        match self.store.get(Column::Meta, META_TIP_KEY)? {
            Some(bytes) => ChainTip::decode(&bytes)
                .map(Some)
                .ok_or_else(|| StoreError::Backend("invalid tip marker".to_string())),
            None => Ok(None),
        }
    }

    pub fn set_tip(&self, batch: &mut WriteBatch, tip: Option<ChainTip>) {
        match tip {
            Some(tip) => batch.put(Column::Meta, META_TIP_KEY, tip.encode()),
            None => batch.delete(Column::Meta, META_TIP_KEY),
        }
    }

    pub fn header(&self, height: u32) -> Result<Option<HeaderRecord>, StoreError> {
        let Some(bytes) = self.store.get(Column::HeaderByHeight, &height_key(height))? else {
            return Ok(None);
        };
        if bytes.len() < 32 {
            return Err(StoreError::Backend("invalid header entry".to_string()));
        }
        let (hash, raw) = bytes.split_at(32);
        let hash: Hash256 = hash
            .try_into()
            .map_err(|_| StoreError::Backend("invalid header entry".to_string()))?;
        Ok(Some(HeaderRecord {
            hash,
            raw: raw.to_vec(),
        }))
    }

    pub fn block_hash(&self, height: u32) -> Result<Option<Hash256>, StoreError> {
        Ok(self.header(height)?.map(|record| record.hash))
    }

    pub fn height_of(&self, hash: &Hash256) -> Result<Option<u32>, StoreError> {
        let Some(bytes) = self.store.get(Column::HeightByHash, hash)? else {
            return Ok(None);
        };
        let bytes: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("invalid height entry".to_string()))?;
        Ok(Some(u32::from_le_bytes(bytes)))
    }

    pub fn put_header(&self, batch: &mut WriteBatch, height: u32, hash: &Hash256, raw: &[u8]) {
        let mut value = Vec::with_capacity(32 + raw.len());
        value.extend_from_slice(hash);
        value.extend_from_slice(raw);
        batch.put(Column::HeaderByHeight, height_key(height), value);
        batch.put(Column::HeightByHash, hash, height.to_le_bytes());
    }

    pub fn delete_header(&self, batch: &mut WriteBatch, height: u32, hash: &Hash256) {
        batch.delete(Column::HeaderByHeight, height_key(height));
        batch.delete(Column::HeightByHash, hash);
    }

    pub fn raw_block(&self, height: u32) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(Column::BlockByHeight, &height_key(height))
    }

    pub fn put_raw_block(&self, batch: &mut WriteBatch, height: u32, raw: &[u8]) {
        batch.put(Column::BlockByHeight, height_key(height), raw);
    }

    pub fn delete_raw_block(&self, batch: &mut WriteBatch, height: u32) {
        batch.delete(Column::BlockByHeight, height_key(height));
    }

    /// Heights that still have a stored raw block, ascending.
    pub fn raw_block_heights(&self) -> Result<Vec<u32>, StoreError> {
        let mut heights = Vec::new();
        self.store
            .for_each_prefix(Column::BlockByHeight, &[], &mut |key, _| {
                let key: [u8; 4] = key
                    .try_into()
                    .map_err(|_| StoreError::Backend("invalid raw block key".to_string()))?;
                heights.push(u32::from_be_bytes(key));
                Ok(())
            })?;
        Ok(heights)
    }

    pub fn schema_version(&self) -> Result<Option<u32>, StoreError> {
        let Some(bytes) = self.store.get(Column::Meta, META_SCHEMA_KEY)? else {
            return Ok(None);
        };
        let bytes: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("invalid schema version".to_string()))?;
        Ok(Some(u32::from_le_bytes(bytes)))
    }

    pub fn stamp_schema(&self) -> Result<(), StoreError> {
        self.store
            .put(Column::Meta, META_SCHEMA_KEY, &SCHEMA_VERSION.to_le_bytes())
    }

    /// Drops every table, then stamps the current schema.
    pub fn wipe(&self) -> Result<u64, StoreError> {
        let mut removed = 0;
        for column in Column::ALL {
            removed += clear_column(&self.store, column)?;
        }
        self.stamp_schema()?;
        Ok(removed)
    }
}
