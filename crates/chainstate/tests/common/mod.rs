#![allow(dead_code)]

use std::sync::Arc;

use pepexd_chainstate::{ChainSource, Indexer, IndexerConfig, SourceError};
use pepexd_consensus::constants::HASH_CUTOVER_HEIGHT;
use pepexd_consensus::Hash256;
use pepexd_pow::{HashSelector, LegacyBackend, SphStage};
use pepexd_primitives::block::BlockHeader;
use pepexd_primitives::encoding::Encoder;
use pepexd_primitives::hash::sha256;
use pepexd_primitives::outpoint::OutPoint;
use pepexd_primitives::script::ScriptHash;
use pepexd_primitives::transaction::{Transaction, TxIn, TxOut};
use pepexd_storage::memory::MemoryStore;
use pepexd_storage::{Column, KeyValueStore, ScanResult};

/// Deterministic stand-in for the native transforms.
pub struct FakeSph;

impl LegacyBackend for FakeSph {
    fn digest512(&self, stage: SphStage, data: &[u8]) -> [u8; 64] {
        let mut tagged = vec![stage as u8];
        tagged.extend_from_slice(data);
        let lo = sha256(&tagged);
        tagged.push(0xff);
        let hi = sha256(&tagged);
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&lo);
        out[32..].copy_from_slice(&hi);
        out
    }
}

pub fn selector() -> HashSelector {
    HashSelector::new(HASH_CUTOVER_HEIGHT, Arc::new(FakeSph))
}

pub fn script(tag: u8) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

pub fn sh(tag: u8) -> ScriptHash {
    ScriptHash::from_script(&script(tag))
}

fn make_tx(vin: Vec<TxIn>, vout: Vec<TxOut>) -> Transaction {
    Transaction {
        version: 1,
        tx_type: 0,
        vin,
        vout,
        lock_time: 0,
        extra_payload: Vec::new(),
    }
}

pub fn coinbase(height: u32, tag: u8, value: i64) -> Transaction {
    let mut script_sig = height.to_le_bytes().to_vec();
    script_sig.push(tag);
    make_tx(
        vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vec![TxOut {
            value,
            script_pubkey: script(tag),
        }],
    )
}

pub fn spend(inputs: &[OutPoint], outputs: &[(u8, i64)]) -> Transaction {
    make_tx(
        inputs
            .iter()
            .map(|prevout| TxIn {
                prevout: *prevout,
                script_sig: vec![0x51],
                sequence: u32::MAX,
            })
            .collect(),
        outputs
            .iter()
            .map(|(tag, value)| TxOut {
                value: *value,
                script_pubkey: script(*tag),
            })
            .collect(),
    )
}

#[derive(Clone, Debug)]
pub struct TestBlock {
    pub height: u32,
    pub hash: Hash256,
    pub raw: Vec<u8>,
    pub txids: Vec<Hash256>,
}

impl TestBlock {
    pub fn outpoint(&self, tx: usize, index: u32) -> OutPoint {
        OutPoint::new(self.txids[tx], index)
    }
}

pub fn build_block(height: u32, prev: Hash256, nonce: u32, txs: &[Transaction]) -> TestBlock {
    let header = BlockHeader {
        version: 0x2000_0000,
        prev_block: prev,
        merkle_root: [0u8; 32],
        time: 1_600_000_000 + height,
        bits: 0x1e0f_fff0,
        nonce,
    };
    let raw_header = header.consensus_encode();
    let hash = selector().hash(height, &raw_header).expect("fake hash");
    let mut encoder = Encoder::new();
    encoder.write_bytes(&raw_header);
    encoder.write_varint(txs.len() as u64);
    for tx in txs {
        tx.encode_into(&mut encoder);
    }
    TestBlock {
        height,
        hash,
        raw: encoder.into_inner(),
        txids: txs.iter().map(Transaction::txid).collect(),
    }
}

/// Chain of coinbase-only blocks; block `h` pays 50 coins to tag `h`.
pub fn plain_chain(len: u32, nonce: u32) -> Vec<TestBlock> {
    let mut blocks: Vec<TestBlock> = Vec::new();
    for height in 0..len {
        let prev = blocks.last().map_or([0u8; 32], |block| block.hash);
        let tx = coinbase(height, height as u8, 50);
        blocks.push(build_block(height, prev, nonce, &[tx]));
    }
    blocks
}

pub fn extend(blocks: &mut Vec<TestBlock>, nonce: u32, txs: Vec<Transaction>) -> TestBlock {
    let height = blocks.len() as u32;
    let prev = blocks.last().map_or([0u8; 32], |block| block.hash);
    let block = build_block(height, prev, nonce, &txs);
    blocks.push(block.clone());
    block
}

pub struct FakeChain {
    pub blocks: Vec<TestBlock>,
}

impl ChainSource for FakeChain {
    fn best_height_and_hash(&self) -> Result<(u32, Hash256), SourceError> {
        let tip = self
            .blocks
            .last()
            .ok_or_else(|| SourceError("empty chain".to_string()))?;
        Ok((tip.height, tip.hash))
    }

    fn block_hash(&self, height: u32) -> Result<Option<Hash256>, SourceError> {
        Ok(self.blocks.get(height as usize).map(|block| block.hash))
    }

    fn block(&self, hash: &Hash256) -> Result<Vec<u8>, SourceError> {
        self.blocks
            .iter()
            .find(|block| &block.hash == hash)
            .map(|block| block.raw.clone())
            .ok_or_else(|| SourceError("unknown block".to_string()))
    }
}

pub fn open_indexer(store: &Arc<MemoryStore>, reorg_limit: u32) -> Indexer<MemoryStore> {
    Indexer::open(Arc::clone(store), selector(), IndexerConfig::new(reorg_limit))
        .expect("open indexer")
}

pub fn apply_all(indexer: &mut Indexer<MemoryStore>, blocks: &[TestBlock]) {
    for block in blocks {
        indexer
            .advance(block.height, block.hash, &block.raw)
            .expect("advance");
    }
}

pub fn snapshot(store: &MemoryStore) -> Vec<(Column, ScanResult)> {
    Column::ALL
        .iter()
        .map(|column| (*column, store.dump(*column).expect("dump")))
        .collect()
}

pub fn utxo_count(store: &MemoryStore) -> usize {
    store.len(Column::Utxo).expect("len")
}

pub fn has_key(store: &MemoryStore, column: Column, key: &[u8]) -> bool {
    store.get(column, key).expect("get").is_some()
}
