//! Synthetic chains for unit tests.

use std::sync::Arc;

use pepexd_chainstate::{Indexer, IndexerConfig};
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

use crate::mempool::Tracker;

pub struct FakeSph;

impl LegacyBackend for FakeSph {
    fn digest512(&self, stage: SphStage, data: &[u8]) -> [u8; 64] {
        let mut tagged = vec![stage as u8];
        tagged.extend_from_slice(data);
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&sha256(&tagged));
        tagged.push(0xff);
        out[32..].copy_from_slice(&sha256(&tagged));
        out
    }
}

pub fn selector() -> HashSelector {
    HashSelector::new(HASH_CUTOVER_HEIGHT, Arc::new(FakeSph))
}

pub fn script(tag: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

pub fn sh(tag: u8) -> ScriptHash {
    ScriptHash::from_script(&script(tag))
}

pub fn coinbase(height: u32, tag: u8, value: i64) -> Transaction {
    let mut script_sig = height.to_le_bytes().to_vec();
    script_sig.push(tag);
    Transaction {
        version: 1,
        tx_type: 0,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: script(tag),
        }],
        lock_time: 0,
        extra_payload: Vec::new(),
    }
}

pub fn spend(inputs: &[OutPoint], outputs: &[(u8, i64)]) -> Transaction {
    Transaction {
        version: 1,
        tx_type: 0,
        vin: inputs
            .iter()
            .map(|prevout| TxIn {
                prevout: *prevout,
                script_sig: vec![0x51],
                sequence: u32::MAX,
            })
            .collect(),
        vout: outputs
            .iter()
            .map(|(tag, value)| TxOut {
                value: *value,
                script_pubkey: script(*tag),
            })
            .collect(),
        lock_time: 0,
        extra_payload: Vec::new(),
    }
}

pub struct TestBlock {
    pub height: u32,
    pub hash: Hash256,
    pub raw: Vec<u8>,
}

/// Appends a block holding `txs` to `chain` and returns it.
pub fn extend<'a>(chain: &'a mut Vec<TestBlock>, txs: &[Transaction]) -> &'a TestBlock {
    let height = chain.len() as u32;
    let prev = chain.last().map_or([0u8; 32], |block| block.hash);
    let header = BlockHeader {
        version: 0x2000_0000,
        prev_block: prev,
        merkle_root: [0u8; 32],
        time: 1_600_000_000 + height,
        bits: 0x1e0f_fff0,
        nonce: 7,
    };
    let raw_header = header.consensus_encode();
    let hash = selector().hash(height, &raw_header).expect("fake hash");
    let mut encoder = Encoder::new();
    encoder.write_bytes(&raw_header);
    encoder.write_varint(txs.len() as u64);
    for tx in txs {
        tx.encode_into(&mut encoder);
    }
    chain.push(TestBlock {
        height,
        hash,
        raw: encoder.into_inner(),
    });
    &chain[chain.len() - 1]
}

/// Indexer whose commits go through `tracker`.
pub fn gated_indexer(
    store: &Arc<MemoryStore>,
    tracker: &Arc<Tracker<MemoryStore>>,
) -> Indexer<MemoryStore> {
    Indexer::open(Arc::clone(store), selector(), IndexerConfig::new(10))
        .expect("open indexer")
        .with_commit_gate(Arc::clone(tracker) as Arc<dyn pepexd_chainstate::CommitGate>)
}
