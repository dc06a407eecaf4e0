//! Block header and block types.

use pepexd_consensus::constants::HEADER_SIZE;
use pepexd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::transaction::{Transaction, TransactionDecodeError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::consensus_decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(header)
    }

    pub fn consensus_decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

/// Position of one transaction inside a serialized block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxSpan {
    pub txid: Hash256,
    pub offset: u32,
    pub len: u32,
}

#[derive(Clone, Debug)]
pub struct Block {
    pub header: BlockHeader,
    /// Header bytes exactly as served, the input to the header hash.
    pub raw_header: Vec<u8>,
    pub transactions: Vec<Transaction>,
    pub tx_spans: Vec<TxSpan>,
}

impl Block {
    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, BlockDecodeError> {
        let mut decoder = Decoder::new(bytes);
        let raw_header = decoder.read_slice(HEADER_SIZE)?.to_vec();
        let header = BlockHeader::consensus_decode(&raw_header)?;

        let count = decoder.read_varint()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut transactions = Vec::with_capacity(count.min(decoder.remaining()));
        let mut tx_spans = Vec::with_capacity(count.min(decoder.remaining()));
        for _ in 0..count {
            let start = decoder.position();
            transactions.push(Transaction::decode_from(&mut decoder)?);
            let raw = decoder.consumed_since(start);
            tx_spans.push(TxSpan {
                txid: sha256d(raw),
                offset: u32::try_from(start).map_err(|_| DecodeError::SizeTooLarge)?,
                len: u32::try_from(raw.len()).map_err(|_| DecodeError::SizeTooLarge)?,
            });
        }
        if !decoder.is_empty() {
            return Err(BlockDecodeError::Decode(DecodeError::TrailingBytes));
        }
        Ok(Self {
            header,
            raw_header,
            transactions,
            tx_spans,
        })
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&self.raw_header);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_into(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn txid(&self, index: usize) -> Option<&Hash256> {
        self.tx_spans.get(index).map(|span| &span.txid)
    }

    /// Pairs each transaction with its id, in block order.
    pub fn iter_with_txids(&self) -> impl DoubleEndedIterator<Item = (&Transaction, &Hash256)> {
        self.transactions
            .iter()
            .zip(self.tx_spans.iter().map(|span| &span.txid))
    }
}

#[derive(Debug)]
pub enum BlockDecodeError {
    Decode(DecodeError),
    Transaction(TransactionDecodeError),
}

impl From<DecodeError> for BlockDecodeError {
    fn from(error: DecodeError) -> Self {
        BlockDecodeError::Decode(error)
    }
}

impl From<TransactionDecodeError> for BlockDecodeError {
    fn from(error: TransactionDecodeError) -> Self {
        BlockDecodeError::Transaction(error)
    }
}

impl std::fmt::Display for BlockDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockDecodeError::Decode(error) => write!(f, "{error}"),
            BlockDecodeError::Transaction(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for BlockDecodeError {}
