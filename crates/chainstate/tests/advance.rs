mod common;

use std::collections::HashMap;
use std::sync::Arc;

use pepexd_chainstate::utxo::OutputRecord;
use pepexd_chainstate::{
    AdvanceOutcome, ChainQuery, IndexError, Indexer, IndexerConfig, IndexerState, SCHEMA_VERSION,
};
use pepexd_primitives::outpoint::OutPoint;
use pepexd_primitives::script::ScriptHash;
use pepexd_storage::memory::MemoryStore;
use pepexd_storage::{Column, KeyValueStore};

use common::*;

#[test]
fn reapplying_an_indexed_block_is_a_noop() {
    let store = Arc::new(MemoryStore::new());
    let mut indexer = open_indexer(&store, 100);
    let blocks = plain_chain(3, 0);
    apply_all(&mut indexer, &blocks);
    let before = snapshot(&store);

    for block in &blocks {
        let outcome = indexer
            .advance(block.height, block.hash, &block.raw)
            .expect("re-advance");
        assert_eq!(outcome, AdvanceOutcome::AlreadyApplied);
    }
    assert_eq!(snapshot(&store), before);
    let query = ChainQuery::new(Arc::clone(&store));
    assert_eq!(query.balance(&sh(1)).expect("balance"), 50);
}

#[test]
fn wrong_claimed_hash_is_fatal_and_leaves_tip() {
    let store = Arc::new(MemoryStore::new());
    let mut indexer = open_indexer(&store, 100);
    let blocks = plain_chain(2, 0);
    apply_all(&mut indexer, &blocks[..1]);

    let mut claimed = blocks[1].hash;
    claimed[0] ^= 1;
    let err = indexer
        .advance(1, claimed, &blocks[1].raw)
        .expect_err("mismatch");
    assert!(matches!(err, IndexError::HashMismatch { height: 1, .. }));
    assert!(err.is_fatal());
    assert_eq!(indexer.tip().map(|tip| tip.height), Some(0));
    assert_eq!(utxo_count(&store), 1);
}

#[test]
fn block_that_does_not_link_to_tip_is_fatal() {
    let store = Arc::new(MemoryStore::new());
    let mut indexer = open_indexer(&store, 100);
    let blocks = plain_chain(1, 0);
    apply_all(&mut indexer, &blocks);

    let orphan = build_block(1, [0x42; 32], 0, &[coinbase(1, 1, 50)]);
    let err = indexer
        .advance(1, orphan.hash, &orphan.raw)
        .expect_err("linkage");
    assert!(matches!(err, IndexError::Linkage { height: 1, .. }));
    assert!(err.is_fatal());

    let err = indexer
        .advance(5, orphan.hash, &orphan.raw)
        .expect_err("gap");
    assert!(matches!(err, IndexError::NotNextBlock { height: 5, tip: Some(0) }));
}

#[test]
fn malformed_block_and_unknown_input_are_fatal() {
    let store = Arc::new(MemoryStore::new());
    let mut indexer = open_indexer(&store, 100);
    let mut blocks = plain_chain(1, 0);
    apply_all(&mut indexer, &blocks);

    let ghost = OutPoint::new([0x77; 32], 0);
    let bad = extend(
        &mut blocks,
        0,
        vec![coinbase(1, 1, 50), spend(&[ghost], &[(2, 10)])],
    );
    let err = indexer
        .advance(bad.height, bad.hash, &bad.raw)
        .expect_err("missing input");
    assert!(matches!(err, IndexError::MissingInput { height: 1, outpoint } if outpoint == ghost));
    assert_eq!(indexer.tip().map(|tip| tip.height), Some(0));

    let mut raw = bad.raw.clone();
    raw.push(0);
    let err = indexer
        .advance(bad.height, bad.hash, &raw)
        .expect_err("trailing");
    assert!(matches!(err, IndexError::MalformedBlock { height: 1, .. }));

    let truncated = &bad.raw[..bad.raw.len() - 3];
    let err = indexer
        .advance(bad.height, bad.hash, truncated)
        .expect_err("truncated");
    assert!(matches!(err, IndexError::MalformedBlock { height: 1, .. }));
    assert!(err.is_fatal());
}

#[test]
fn negative_output_value_is_fatal() {
    let store = Arc::new(MemoryStore::new());
    let mut indexer = open_indexer(&store, 100);
    let mut blocks = plain_chain(1, 0);
    apply_all(&mut indexer, &blocks);

    let coin = blocks[0].outpoint(0, 0);
    let bad = extend(
        &mut blocks,
        0,
        vec![coinbase(1, 1, 50), spend(&[coin], &[(2, -1)])],
    );
    let err = indexer
        .advance(bad.height, bad.hash, &bad.raw)
        .expect_err("negative value");
    assert!(matches!(err, IndexError::ValueOutOfRange { height: 1, value: -1, .. }));
    assert!(err.is_fatal());
    assert_eq!(indexer.tip().map(|tip| tip.height), Some(0));
    assert_eq!(utxo_count(&store), 1);
}

#[test]
fn double_spend_inside_one_block_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let mut indexer = open_indexer(&store, 100);
    let mut blocks = plain_chain(1, 0);
    apply_all(&mut indexer, &blocks);
    let coin = blocks[0].outpoint(0, 0);
    let bad = extend(
        &mut blocks,
        0,
        vec![
            coinbase(1, 1, 50),
            spend(&[coin], &[(2, 50)]),
            spend(&[coin], &[(3, 50)]),
        ],
    );
    let err = indexer
        .advance(bad.height, bad.hash, &bad.raw)
        .expect_err("double spend");
    assert!(matches!(err, IndexError::MissingInput { .. }));
}

#[test]
fn intra_block_chain_keeps_only_final_outputs() {
    let store = Arc::new(MemoryStore::new());
    let mut indexer = open_indexer(&store, 100);
    let mut blocks = plain_chain(1, 0);
    apply_all(&mut indexer, &blocks);
    let before = snapshot(&store);

    let first = spend(&[blocks[0].outpoint(0, 0)], &[(0x10, 40), (0x11, 10)]);
    let second = spend(&[OutPoint::new(first.txid(), 0)], &[(0x12, 40)]);
    let block = extend(
        &mut blocks,
        0,
        vec![coinbase(1, 1, 50), first.clone(), second.clone()],
    );
    indexer
        .advance(block.height, block.hash, &block.raw)
        .expect("advance");

    let query = ChainQuery::new(Arc::clone(&store));
    assert_eq!(query.balance(&sh(0x10)).expect("balance"), 0);
    assert_eq!(query.balance(&sh(0x11)).expect("balance"), 10);
    assert_eq!(query.balance(&sh(0x12)).expect("balance"), 40);
    let history = query.history(&sh(0x10)).expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history.iter().map(|e| e.delta.net()).sum::<i64>(), 0);
    assert!(query
        .output(&OutPoint::new(first.txid(), 0))
        .expect("output")
        .is_some());

    indexer.rollback_tip().expect("rollback");
    assert_eq!(snapshot(&store), before);
}

#[test]
fn same_block_history_follows_block_position() {
    let store = Arc::new(MemoryStore::new());
    let mut indexer = open_indexer(&store, 100);
    let mut blocks = plain_chain(2, 0);
    apply_all(&mut indexer, &blocks);

    let mut pair = vec![
        spend(&[blocks[0].outpoint(0, 0)], &[(0xaa, 50)]),
        spend(&[blocks[1].outpoint(0, 0)], &[(0xaa, 50)]),
    ];
    // Put the larger txid first so block order and txid order disagree.
    pair.sort_by_key(|tx| std::cmp::Reverse(tx.txid()));
    let mut txs = vec![coinbase(2, 2, 50)];
    txs.extend(pair.iter().cloned());
    let block = extend(&mut blocks, 0, txs);
    indexer
        .advance(block.height, block.hash, &block.raw)
        .expect("advance");

    let query = ChainQuery::new(Arc::clone(&store));
    let history = query.history(&sh(0xaa)).expect("history");
    let order: Vec<_> = history.iter().map(|entry| (entry.position, entry.txid)).collect();
    assert_eq!(order, vec![(1, pair[0].txid()), (2, pair[1].txid())]);

    indexer.rollback_tip().expect("rollback");
    assert!(query.history(&sh(0xaa)).expect("history").is_empty());
}

#[test]
fn op_return_outputs_are_logged_but_not_spendable() {
    let store = Arc::new(MemoryStore::new());
    let mut indexer = open_indexer(&store, 100);
    let mut blocks = plain_chain(1, 0);
    apply_all(&mut indexer, &blocks);

    let mut tx = spend(&[blocks[0].outpoint(0, 0)], &[(0x20, 49)]);
    tx.vout.push(pepexd_primitives::transaction::TxOut {
        value: 0,
        script_pubkey: vec![0x6a, 0x04, 1, 2, 3, 4],
    });
    let block = extend(&mut blocks, 0, vec![coinbase(1, 1, 50), tx.clone()]);
    indexer
        .advance(block.height, block.hash, &block.raw)
        .expect("advance");

    let query = ChainQuery::new(Arc::clone(&store));
    let burn = OutPoint::new(tx.txid(), 1);
    assert!(query.output(&burn).expect("output").is_some());
    assert!(query.unspent(&burn).expect("unspent").is_none());
    let burn_sh = ScriptHash::from_script(&[0x6a, 0x04, 1, 2, 3, 4]);
    assert!(query.history(&burn_sh).expect("history").is_empty());
}

#[test]
fn confirmed_balance_equals_sum_of_unspent_outputs() {
    let store = Arc::new(MemoryStore::new());
    let mut indexer = open_indexer(&store, 100);
    let mut blocks = plain_chain(3, 0);
    let c0 = blocks[0].outpoint(0, 0);
    let c1 = blocks[1].outpoint(0, 0);
    extend(
        &mut blocks,
        0,
        vec![coinbase(3, 0x30, 50), spend(&[c0, c1], &[(2, 70), (0x31, 30)])],
    );
    apply_all(&mut indexer, &blocks);

    let mut sums: HashMap<ScriptHash, i64> = HashMap::new();
    for (_, value) in store.dump(Column::Utxo).expect("dump") {
        let record = OutputRecord::decode(&value).expect("record");
        *sums.entry(record.script_hash).or_default() += record.value;
    }
    let query = ChainQuery::new(Arc::clone(&store));
    for tag in [0u8, 1, 2, 0x30, 0x31] {
        let script_hash = sh(tag);
        let expected = sums.get(&script_hash).copied().unwrap_or(0);
        assert_eq!(query.balance(&script_hash).expect("balance"), expected, "tag {tag}");
        let history_net: i64 = query
            .history(&script_hash)
            .expect("history")
            .iter()
            .map(|entry| entry.delta.net())
            .sum();
        assert_eq!(history_net, expected, "history tag {tag}");
    }
    assert_eq!(query.balance(&sh(2)).expect("balance"), 120);
}

#[test]
fn queries_resolve_transactions_and_headers() {
    let store = Arc::new(MemoryStore::new());
    let mut indexer = open_indexer(&store, 100);
    let mut blocks = plain_chain(2, 0);
    let tx = spend(&[blocks[0].outpoint(0, 0)], &[(0x40, 50)]);
    let block = extend(&mut blocks, 0, vec![coinbase(2, 2, 50), tx.clone()]);
    apply_all(&mut indexer, &blocks);

    let query = ChainQuery::new(Arc::clone(&store));
    let location = query
        .tx_location(&tx.txid())
        .expect("location")
        .expect("indexed");
    assert_eq!(location.height, 2);
    assert_eq!(location.position, 1);
    assert_eq!(
        query.raw_tx(&tx.txid()).expect("raw tx"),
        Some(tx.consensus_encode())
    );
    let header = query.header(2).expect("header").expect("stored");
    assert_eq!(header.hash, block.hash);
    assert_eq!(header.raw, block.raw[..80].to_vec());
    assert_eq!(query.height_of(&block.hash).expect("height"), Some(2));
    assert_eq!(query.tip().expect("tip").map(|tip| tip.height), Some(2));
    assert!(query.raw_tx(&[0u8; 32]).expect("unknown").is_none());
}

#[test]
fn schema_mismatch_is_rejected_at_open() {
    let store = Arc::new(MemoryStore::new());
    store
        .put(Column::Meta, b"schema_version", &(SCHEMA_VERSION + 1).to_le_bytes())
        .expect("put");
    let err = Indexer::open(Arc::clone(&store), selector(), IndexerConfig::new(100))
        .err()
        .expect("schema error");
    assert!(matches!(err, IndexError::Schema { .. }));
    assert!(err.to_string().contains("--reindex"));
}

#[test]
fn genesis_must_match_configured_hash() {
    let store = Arc::new(MemoryStore::new());
    let mut config = IndexerConfig::new(100);
    config.expected_genesis = Some([0x11; 32]);
    let mut indexer = Indexer::open(Arc::clone(&store), selector(), config).expect("open");
    let blocks = plain_chain(1, 0);
    let err = indexer
        .advance(0, blocks[0].hash, &blocks[0].raw)
        .expect_err("genesis");
    assert!(matches!(err, IndexError::GenesisMismatch { .. }));
}

#[test]
fn sync_step_is_bounded_and_reports_state() {
    let store = Arc::new(MemoryStore::new());
    let mut config = IndexerConfig::new(100);
    config.max_blocks_per_step = 4;
    let mut indexer = Indexer::open(Arc::clone(&store), selector(), config).expect("open");
    let chain = FakeChain {
        blocks: plain_chain(10, 0),
    };

    let progress = indexer.sync_step(&chain).expect("step");
    assert_eq!(progress.applied, 4);
    assert_eq!(progress.daemon_height, 9);
    assert_eq!(indexer.state(), IndexerState::CatchingUp);

    indexer.sync_step(&chain).expect("step");
    let progress = indexer.sync_step(&chain).expect("step");
    assert_eq!(progress.applied, 2);
    assert_eq!(indexer.state(), IndexerState::Synced);

    let progress = indexer.sync_step(&chain).expect("idle step");
    assert_eq!(progress.applied, 0);
    assert_eq!(indexer.state(), IndexerState::Synced);
}

#[test]
fn prune_drops_raw_blocks_outside_retention() {
    let store = Arc::new(MemoryStore::new());
    let blocks = plain_chain(20, 0);
    {
        let mut indexer = open_indexer(&store, 100);
        apply_all(&mut indexer, &blocks);
    }
    assert_eq!(store.len(Column::BlockByHeight).expect("len"), 20);

    let mut config = IndexerConfig::new(3);
    config.raw_block_retention = 5;
    let indexer = Indexer::open(Arc::clone(&store), selector(), config).expect("reopen");
    assert_eq!(indexer.tip().map(|tip| tip.height), Some(19));
    assert_eq!(indexer.prune_raw_blocks().expect("prune"), 15);
    assert_eq!(store.len(Column::BlockByHeight).expect("len"), 5);
    assert_eq!(indexer.prune_raw_blocks().expect("prune again"), 0);
}
