//! Output records and the unspent set backed by the storage trait.

use pepexd_primitives::encoding::{DecodeError, Decoder, Encoder};
use pepexd_primitives::outpoint::OutPoint;
use pepexd_primitives::script::ScriptHash;
use pepexd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub const OUTPOINT_KEY_LEN: usize = 36;

const FLAG_COINBASE: u8 = 1;

/// What the index remembers about one transaction output.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OutputRecord {
    pub value: i64,
    pub script_hash: ScriptHash,
    pub height: u32,
    pub is_coinbase: bool,
}

impl OutputRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(45);
        encoder.write_i64_le(self.value);
        encoder.write_bytes(self.script_hash.as_bytes());
        encoder.write_u32_le(self.height);
        encoder.write_u8(if self.is_coinbase { FLAG_COINBASE } else { 0 });
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_hash = ScriptHash(decoder.read_fixed::<32>()?);
        let height = decoder.read_u32_le()?;
        let flags = decoder.read_u8()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            value,
            script_hash,
            height,
            is_coinbase: flags & FLAG_COINBASE != 0,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OutPointKey([u8; OUTPOINT_KEY_LEN]);

impl OutPointKey {
    pub fn new(outpoint: &OutPoint) -> Self {
        let mut bytes = [0u8; OUTPOINT_KEY_LEN];
        bytes[..32].copy_from_slice(&outpoint.hash);
        bytes[32..].copy_from_slice(&outpoint.index.to_le_bytes());
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; OUTPOINT_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn outpoint(&self) -> OutPoint {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&self.0[..32]);
        let mut index = [0u8; 4];
        index.copy_from_slice(&self.0[32..]);
        OutPoint::new(hash, u32::from_le_bytes(index))
    }
}

fn decode_record(bytes: &[u8]) -> Result<OutputRecord, StoreError> {
    OutputRecord::decode(bytes)
        .map_err(|err| StoreError::Backend(format!("output record: {err}")))
}

/// Unspent outputs (`Utxo`) and the permanent output log (`TxOut`).
pub struct UtxoSet<S> {
    store: S,
}

impl<S> UtxoSet<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> UtxoSet<S> {
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<OutputRecord>, StoreError> {
        self.read(Column::Utxo, outpoint)
    }

    /// The output as created, whether or not it has been spent since.
    pub fn output(&self, outpoint: &OutPoint) -> Result<Option<OutputRecord>, StoreError> {
        self.read(Column::TxOut, outpoint)
    }

    fn read(
        &self,
        column: Column,
        outpoint: &OutPoint,
    ) -> Result<Option<OutputRecord>, StoreError> {
        let key = OutPointKey::new(outpoint);
        match self.store.get(column, key.as_bytes())? {
            Some(bytes) => decode_record(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn put(&self, batch: &mut WriteBatch, outpoint: &OutPoint, record: &OutputRecord) {
        batch.put(Column::Utxo, OutPointKey::new(outpoint).as_bytes(), record.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        batch.delete(Column::Utxo, OutPointKey::new(outpoint).as_bytes());
    }

    pub fn put_output(&self, batch: &mut WriteBatch, outpoint: &OutPoint, record: &OutputRecord) {
        batch.put(Column::TxOut, OutPointKey::new(outpoint).as_bytes(), record.encode());
    }

    pub fn delete_output(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        batch.delete(Column::TxOut, OutPointKey::new(outpoint).as_bytes());
    }
}
