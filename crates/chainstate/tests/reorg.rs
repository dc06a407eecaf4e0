mod common;

use std::sync::Arc;

use pepexd_chainstate::utxo::OutPointKey;
use pepexd_chainstate::{ChainQuery, IndexError, IndexerState};
use pepexd_storage::memory::MemoryStore;
use pepexd_storage::Column;

use common::*;

const K: u32 = 4;

/// Heights 0..=6 where block K spends the coinbase of block K-1.
fn branch_a() -> Vec<TestBlock> {
    let mut blocks = plain_chain(K, 0);
    let spent = blocks[(K - 1) as usize].outpoint(0, 0);
    extend(
        &mut blocks,
        0,
        vec![
            coinbase(K, K as u8, 50),
            spend(&[spent], &[(0xaa, 30), (0xbb, 20)]),
        ],
    );
    extend(&mut blocks, 0, vec![coinbase(K + 1, 0x55, 50)]);
    extend(&mut blocks, 0, vec![coinbase(K + 2, 0x56, 50)]);
    blocks
}

/// Forks off branch A at K-3 and outgrows it. Block K-1' spends the ancestor's coinbase.
fn branch_b(a: &[TestBlock]) -> Vec<TestBlock> {
    let mut blocks: Vec<TestBlock> = a[..(K - 2) as usize].to_vec();
    extend(&mut blocks, 7, vec![coinbase(K - 2, 0xc0, 50)]);
    let ancestor_coin = blocks[(K - 3) as usize].outpoint(0, 0);
    extend(
        &mut blocks,
        7,
        vec![
            coinbase(K - 1, 0xc1, 50),
            spend(&[ancestor_coin], &[(0xcc, 45)]),
        ],
    );
    for tag in 0xc2..0xc7u8 {
        let height = blocks.len() as u32;
        extend(&mut blocks, 7, vec![coinbase(height, tag, 50)]);
    }
    blocks
}

#[test]
fn spend_of_previous_block_moves_funds_and_records_history() {
    let store = Arc::new(MemoryStore::new());
    let mut indexer = open_indexer(&store, 100);
    let blocks = branch_a();
    apply_all(&mut indexer, &blocks);

    let spent = blocks[(K - 1) as usize].outpoint(0, 0);
    assert!(!has_key(
        &store,
        Column::Utxo,
        OutPointKey::new(&spent).as_bytes()
    ));
    assert!(has_key(
        &store,
        Column::TxOut,
        OutPointKey::new(&spent).as_bytes()
    ));

    let query = ChainQuery::new(Arc::clone(&store));
    let creator = query.history(&sh((K - 1) as u8)).expect("history");
    assert_eq!(creator.len(), 2);
    assert_eq!(creator[0].height, K - 1);
    assert_eq!(creator[0].delta.funded, 50);
    assert_eq!(creator[1].height, K);
    assert_eq!(creator[1].txid, blocks[K as usize].txids[1]);
    assert_eq!(creator[1].delta.spent, 50);
    assert_eq!(query.balance(&sh((K - 1) as u8)).expect("balance"), 0);

    let payee = query.history(&sh(0xaa)).expect("history");
    assert_eq!(payee.len(), 1);
    assert_eq!(payee[0].height, K);
    assert_eq!(query.balance(&sh(0xaa)).expect("balance"), 30);
    assert_eq!(query.balance(&sh(0xbb)).expect("balance"), 20);
}

#[test]
fn reorg_at_k_minus_two_matches_fresh_index_of_new_branch() {
    let a = branch_a();
    let b = branch_b(&a);

    let store = Arc::new(MemoryStore::new());
    let mut indexer = open_indexer(&store, 100);
    let chain_a = FakeChain { blocks: a.clone() };
    let progress = indexer.sync_step(&chain_a).expect("sync a");
    assert_eq!(progress.applied, a.len() as u32);
    assert_eq!(indexer.state(), IndexerState::Synced);

    let chain_b = FakeChain { blocks: b.clone() };
    assert_eq!(indexer.find_common_ancestor(&chain_b).expect("ancestor"), K - 3);
    let progress = indexer.sync_step(&chain_b).expect("sync b");
    assert_eq!(progress.rolled_back, a.len() as u32 - (K - 2));
    assert_eq!(progress.applied, b.len() as u32 - (K - 2));
    assert_eq!(indexer.tip().map(|tip| tip.hash), b.last().map(|block| block.hash));

    let fresh_store = Arc::new(MemoryStore::new());
    let mut fresh = open_indexer(&fresh_store, 100);
    fresh.sync_step(&chain_b).expect("fresh sync");
    assert_eq!(snapshot(&store), snapshot(&fresh_store));

    let query = ChainQuery::new(Arc::clone(&store));
    assert!(query.history(&sh(0xaa)).expect("history").is_empty());
    assert!(query.history(&sh((K - 1) as u8)).expect("history").is_empty());
    assert_eq!(query.balance(&sh(0xcc)).expect("balance"), 45);
    assert_eq!(query.balance(&sh((K - 3) as u8)).expect("balance"), 0);
}

#[test]
fn rollback_then_reapply_restores_identical_tables() {
    let store = Arc::new(MemoryStore::new());
    let mut indexer = open_indexer(&store, 100);
    let blocks = branch_a();
    apply_all(&mut indexer, &blocks);
    let before = snapshot(&store);

    for _ in 0..3 {
        indexer.rollback_tip().expect("rollback");
    }
    assert_eq!(indexer.tip().map(|tip| tip.height), Some(K - 1));
    apply_all(&mut indexer, &blocks[K as usize..]);

    assert_eq!(snapshot(&store), before);
}

#[test]
fn depth_guard_allows_limit_and_refuses_one_more() {
    let limit = 3;
    let a = plain_chain(9, 0);

    let at_limit = {
        let mut blocks = a[..=(8 - limit) as usize].to_vec();
        for _ in 0..limit + 1 {
            let height = blocks.len() as u32;
            extend(&mut blocks, 1, vec![coinbase(height, 0xd0, 50)]);
        }
        blocks
    };
    let store = Arc::new(MemoryStore::new());
    let mut indexer = open_indexer(&store, limit);
    apply_all(&mut indexer, &a);
    let progress = indexer
        .sync_step(&FakeChain { blocks: at_limit.clone() })
        .expect("reorg at limit");
    assert_eq!(progress.rolled_back, limit);
    assert_eq!(indexer.tip().map(|tip| tip.hash), at_limit.last().map(|b| b.hash));

    let too_deep = {
        let mut blocks = a[..(8 - limit) as usize].to_vec();
        for _ in 0..limit + 3 {
            let height = blocks.len() as u32;
            extend(&mut blocks, 2, vec![coinbase(height, 0xd1, 50)]);
        }
        blocks
    };
    let store = Arc::new(MemoryStore::new());
    let mut indexer = open_indexer(&store, limit);
    apply_all(&mut indexer, &a);
    let before = snapshot(&store);
    let err = indexer
        .sync_step(&FakeChain { blocks: too_deep })
        .expect_err("too deep");
    assert!(matches!(
        err,
        IndexError::ReorgTooDeep { depth, limit: 3 } if depth == limit + 1
    ));
    assert!(err.is_fatal());
    assert_eq!(indexer.tip().map(|tip| tip.height), Some(8));
    assert_eq!(snapshot(&store), before);

    let err = indexer.reorg_to(8 - limit - 1).expect_err("direct reorg too deep");
    assert!(matches!(err, IndexError::ReorgTooDeep { .. }));
}

#[test]
fn rollback_beyond_retained_blocks_is_fatal() {
    let store = Arc::new(MemoryStore::new());
    let mut indexer = open_indexer(&store, 2);
    let blocks = plain_chain(30, 0);
    apply_all(&mut indexer, &blocks);
    let retention = indexer.config().raw_block_retention;
    assert_eq!(store.len(Column::BlockByHeight).expect("len"), retention as usize);

    for _ in 0..retention {
        indexer.rollback_tip().expect("retained rollback");
    }
    let err = indexer.rollback_tip().expect_err("pruned");
    assert!(matches!(err, IndexError::RollbackUnavailable { .. }));
}
