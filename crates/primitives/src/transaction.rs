//! PEPEPOW transactions.
//!
//! PEPEPOW inherits Dash's DIP2 layout: the 32-bit header word carries a
//! 16-bit version and a 16-bit special transaction type, and special
//! transactions append a length-prefixed extra payload after the lock time.
//! Payload contents are kept as opaque bytes; the indexer never interprets them.

use pepexd_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

/// Special transactions with a version below this are treated as legacy.
pub const MIN_SPECIAL_TX_VERSION: u32 = 3;

pub const TX_TYPE_NORMAL: u16 = 0;
pub const TX_TYPE_PROVIDER_REGISTER: u16 = 1;
pub const TX_TYPE_PROVIDER_UPDATE_SERVICE: u16 = 2;
pub const TX_TYPE_PROVIDER_UPDATE_REGISTRAR: u16 = 3;
pub const TX_TYPE_PROVIDER_UPDATE_REVOKE: u16 = 4;
pub const TX_TYPE_COINBASE: u16 = 5;
pub const TX_TYPE_QUORUM_COMMITMENT: u16 = 6;

#[derive(Clone, Debug, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transaction {
    /// Full header word for legacy transactions, low 16 bits for special ones.
    pub version: u32,
    pub tx_type: u16,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
    pub extra_payload: Vec<u8>,
}

impl Transaction {
    pub fn header(&self) -> u32 {
        if self.tx_type == TX_TYPE_NORMAL {
            self.version
        } else {
            (u32::from(self.tx_type) << 16) | (self.version & 0xffff)
        }
    }

    pub fn is_special(&self) -> bool {
        self.tx_type != TX_TYPE_NORMAL
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.header());
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(encoder);
        }
        encoder.write_u32_le(self.lock_time);
        if self.is_special() {
            encoder.write_var_bytes(&self.extra_payload);
        }
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    /// Decodes one standalone transaction; every byte must be consumed.
    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, TransactionDecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(TransactionDecodeError::Decode(DecodeError::TrailingBytes));
        }
        Ok(tx)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, TransactionDecodeError> {
        let header = decoder.read_u32_le()?;
        let mut tx_type = (header >> 16) as u16;
        let mut version = header;
        if tx_type != TX_TYPE_NORMAL {
            version = header & 0xffff;
            if version < MIN_SPECIAL_TX_VERSION {
                version = header;
                tx_type = TX_TYPE_NORMAL;
            }
        }

        let vin = read_vec::<TxIn>(decoder)?;
        let vout = read_vec::<TxOut>(decoder)?;
        let lock_time = decoder.read_u32_le()?;
        let extra_payload = if tx_type != TX_TYPE_NORMAL {
            decoder.read_var_bytes().map_err(|err| match err {
                DecodeError::UnexpectedEof => TransactionDecodeError::InvalidTransactionFormat(
                    "extra payload overruns transaction data",
                ),
                other => TransactionDecodeError::Decode(other),
            })?
        } else {
            Vec::new()
        };

        Ok(Self {
            version,
            tx_type,
            vin,
            vout,
            lock_time,
            extra_payload,
        })
    }

    pub fn total_output_value(&self) -> Option<i64> {
        self.vout
            .iter()
            .try_fold(0i64, |acc, out| acc.checked_add(out.value))
    }
}

fn read_vec<T: Decodable>(decoder: &mut Decoder) -> Result<Vec<T>, DecodeError> {
    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
    let mut items = Vec::with_capacity(count.min(decoder.remaining()));
    for _ in 0..count {
        items.push(T::consensus_decode(decoder)?);
    }
    Ok(items)
}

#[derive(Debug)]
pub enum TransactionDecodeError {
    Decode(DecodeError),
    InvalidTransactionFormat(&'static str),
}

impl From<DecodeError> for TransactionDecodeError {
    fn from(error: DecodeError) -> Self {
        TransactionDecodeError::Decode(error)
    }
}

impl std::fmt::Display for TransactionDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionDecodeError::Decode(error) => write!(f, "{error}"),
            TransactionDecodeError::InvalidTransactionFormat(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for TransactionDecodeError {}
