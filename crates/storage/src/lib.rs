//! Column-oriented key-value storage with atomic batches.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod cache;
pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

pub use cache::{CacheConfig, CacheStats, CachedStore};

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
    LockPoisoned(&'static str),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
            StoreError::LockPoisoned(what) => write!(f, "{what} lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    /// Schema version, chain tip marker, indexer flags.
    Meta,
    /// height (u32 BE) -> block hash || raw header.
    HeaderByHeight,
    /// block hash -> height (u32 LE).
    HeightByHash,
    /// height (u32 BE) -> raw block, kept only inside the retention window.
    BlockByHeight,
    /// outpoint -> output record. Never deleted by spends so rollback can restore them.
    TxOut,
    /// outpoint -> output record, unspent outputs only.
    Utxo,
    /// script hash || outpoint -> empty.
    AddressUtxo,
    /// script hash || height (u32 BE) || txid -> funded/spent totals.
    History,
    /// txid -> height and position in block.
    TxIndex,
}

impl Column {
    pub const ALL: [Column; 9] = [
        Column::Meta,
        Column::HeaderByHeight,
        Column::HeightByHash,
        Column::BlockByHeight,
        Column::TxOut,
        Column::Utxo,
        Column::AddressUtxo,
        Column::History,
        Column::TxIndex,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::Meta => "meta",
            Column::HeaderByHeight => "header_by_height",
            Column::HeightByHash => "height_by_hash",
            Column::BlockByHeight => "block_by_height",
            Column::TxOut => "txout",
            Column::Utxo => "utxo",
            Column::AddressUtxo => "address_utxo",
            Column::History => "history",
            Column::TxIndex => "tx_index",
        }
    }
}

#[derive(Clone, Debug)]
pub struct WriteKey(SmallVec<[u8; 80]>);

impl WriteKey {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl AsRef<[u8]> for WriteKey {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for WriteKey {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteKey {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for WriteKey {
    fn from(value: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

impl<const N: usize> From<&[u8; N]> for WriteKey {
    fn from(value: &[u8; N]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
pub struct WriteValue(SmallVec<[u8; 32]>);

impl WriteValue {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0.into_vec()
    }
}

impl AsRef<[u8]> for WriteValue {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for WriteValue {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteValue {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for WriteValue {
    fn from(value: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

impl<const N: usize> From<&[u8; N]> for WriteValue {
    fn from(value: &[u8; N]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        column: Column,
        key: WriteKey,
        value: WriteValue,
    },
    Delete {
        column: Column,
        key: WriteKey,
    },
}

#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<WriteKey>, value: impl Into<WriteValue>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<WriteKey>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    /// Entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;
    /// Applies every op or none; readers never observe a partial batch.
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
    /// Durability checkpoint: everything committed so far survives a crash.
    fn flush(&self) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.as_ref().delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.as_ref().for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.as_ref().flush()
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for &T {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        (**self).put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        (**self).delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        (**self).scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        (**self).for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        (**self).write_batch(batch)
    }

    fn flush(&self) -> Result<(), StoreError> {
        (**self).flush()
    }
}

/// Deletes every key in `column`, committing in bounded batches.
pub fn clear_column<S: KeyValueStore + ?Sized>(
    store: &S,
    column: Column,
) -> Result<u64, StoreError> {
    const CHUNK: usize = 10_000;
    let mut removed = 0u64;
    loop {
        let mut batch = WriteBatch::new();
        let mut visitor = |key: &[u8], _value: &[u8]| {
            if batch.len() >= CHUNK {
                return Err(StoreError::Backend(CHUNK_FULL.to_string()));
            }
            batch.delete(column, key);
            Ok(())
        };
        let outcome = store.for_each_prefix(column, &[], &mut visitor);
        match outcome {
            Ok(()) => {}
            Err(StoreError::Backend(message)) if message == CHUNK_FULL => {}
            Err(err) => return Err(err),
        }
        if batch.is_empty() {
            return Ok(removed);
        }
        removed += batch.len() as u64;
        store.write_batch(&batch)?;
    }
}

const CHUNK_FULL: &str = "clear_column chunk full";
