//! Block indexer: applies blocks in height order and rolls them back by replay.
//!
//! Every block, forward or backward, becomes exactly one [`WriteBatch`]. The tip
//! marker is written inside the same batch, so the tables and the tip can never
//! disagree. Rollback needs no undo log: the raw block is kept for the retention
//! window and its effects are recomputed and inverted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use pepexd_consensus::constants::RAW_BLOCK_RETENTION_SLACK;
use pepexd_consensus::money::money_range;
use pepexd_consensus::{hash256_to_hex, Hash256};
use pepexd_pow::{HashError, HashSelector};
use pepexd_primitives::block::{Block, BlockDecodeError};
use pepexd_primitives::outpoint::OutPoint;
use pepexd_primitives::script::{is_unspendable, ScriptHash};
use pepexd_storage::{KeyValueStore, StoreError, WriteBatch};

use crate::address_index::AddressIndex;
use crate::history::{HistoryDelta, HistoryIndex};
use crate::index::{ChainIndex, ChainTip, SCHEMA_VERSION};
use crate::txindex::{TxIndex, TxLocation};
use crate::utxo::{OutputRecord, UtxoSet};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexerState {
    CatchingUp,
    Synced,
    Reorging,
}

impl IndexerState {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexerState::CatchingUp => "catching-up",
            IndexerState::Synced => "synced",
            IndexerState::Reorging => "reorging",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdvanceOutcome {
    Applied,
    /// The block at this height is already indexed with the same hash.
    AlreadyApplied,
}

/// Failure talking to the block source. Always transient.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceError(pub String);

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SourceError {}

/// Where blocks come from. The daemon client implements this.
pub trait ChainSource {
    fn best_height_and_hash(&self) -> Result<(u32, Hash256), SourceError>;
    /// `None` when `height` is above the source's best chain.
    fn block_hash(&self, height: u32) -> Result<Option<Hash256>, SourceError>;
    fn block(&self, hash: &Hash256) -> Result<Vec<u8>, SourceError>;
}

#[derive(Clone, Copy, Debug)]
pub enum ChainEvent<'a> {
    Connected {
        height: u32,
        hash: Hash256,
        block: &'a Block,
    },
    Disconnected {
        height: u32,
        hash: Hash256,
        block: &'a Block,
    },
}

/// Wraps each block commit so other state can change in the same critical section.
pub trait CommitGate: Send + Sync {
    fn commit(
        &self,
        event: ChainEvent<'_>,
        commit: &mut dyn FnMut() -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;
}

/// Commits with no surrounding coordination.
pub struct DirectCommit;

impl CommitGate for DirectCommit {
    fn commit(
        &self,
        _event: ChainEvent<'_>,
        commit: &mut dyn FnMut() -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        commit()
    }
}

#[derive(Debug)]
pub enum IndexError {
    HashMismatch {
        height: u32,
        claimed: Hash256,
        computed: Hash256,
    },
    Linkage {
        height: u32,
        expected_prev: Hash256,
        found_prev: Hash256,
    },
    NotNextBlock {
        height: u32,
        tip: Option<u32>,
    },
    GenesisMismatch {
        expected: Hash256,
        found: Hash256,
    },
    ReorgTooDeep {
        depth: u32,
        limit: u32,
    },
    MalformedBlock {
        height: u32,
        error: BlockDecodeError,
    },
    MissingInput {
        height: u32,
        outpoint: OutPoint,
    },
    ValueOutOfRange {
        height: u32,
        outpoint: OutPoint,
        value: i64,
    },
    RollbackUnavailable {
        height: u32,
    },
    Schema {
        found: u32,
        expected: u32,
    },
    Hash(HashError),
    Store(StoreError),
    Source(SourceError),
}

impl IndexError {
    /// Fatal errors stop indexing; only source I/O is worth retrying.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, IndexError::Source(_))
    }
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::HashMismatch {
                height,
                claimed,
                computed,
            } => write!(
                f,
                "header hash mismatch at height {height}: daemon {} computed {}",
                hash256_to_hex(claimed),
                hash256_to_hex(computed)
            ),
            IndexError::Linkage {
                height,
                expected_prev,
                found_prev,
            } => write!(
                f,
                "block {height} does not link to tip: expected prev {} found {}",
                hash256_to_hex(expected_prev),
                hash256_to_hex(found_prev)
            ),
            IndexError::NotNextBlock { height, tip } => match tip {
                Some(tip) => write!(f, "block {height} is not the successor of tip {tip}"),
                None => write!(f, "block {height} offered to an empty index"),
            },
            IndexError::GenesisMismatch { expected, found } => write!(
                f,
                "genesis mismatch: expected {} found {}",
                hash256_to_hex(expected),
                hash256_to_hex(found)
            ),
            IndexError::ReorgTooDeep { depth, limit } => {
                write!(f, "reorg depth {depth} exceeds limit {limit}")
            }
            IndexError::MalformedBlock { height, error } => {
                write!(f, "malformed block at height {height}: {error}")
            }
            IndexError::MissingInput { height, outpoint } => write!(
                f,
                "block {height} spends unknown output {}:{}",
                hash256_to_hex(&outpoint.hash),
                outpoint.index
            ),
            IndexError::ValueOutOfRange {
                height,
                outpoint,
                value,
            } => write!(
                f,
                "block {height} output {}:{} has out-of-range value {value}",
                hash256_to_hex(&outpoint.hash),
                outpoint.index
            ),
            IndexError::RollbackUnavailable { height } => {
                write!(f, "raw block {height} is not retained; cannot roll back")
            }
            IndexError::Schema { found, expected } => write!(
                f,
                "index schema version {found} does not match {expected}; restart with --reindex"
            ),
            IndexError::Hash(err) => write!(f, "{err}"),
            IndexError::Store(err) => write!(f, "{err}"),
            IndexError::Source(err) => write!(f, "daemon: {err}"),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<StoreError> for IndexError {
    fn from(err: StoreError) -> Self {
        IndexError::Store(err)
    }
}

impl From<HashError> for IndexError {
    fn from(err: HashError) -> Self {
        IndexError::Hash(err)
    }
}

impl From<SourceError> for IndexError {
    fn from(err: SourceError) -> Self {
        IndexError::Source(err)
    }
}

/// Stamps an empty directory, rejects one written by a different layout.
pub fn ensure_schema_version<S: KeyValueStore>(store: &S) -> Result<(), IndexError> {
    let index = ChainIndex::new(store);
    match index.schema_version()? {
        Some(found) if found == SCHEMA_VERSION => Ok(()),
        Some(found) => Err(IndexError::Schema {
            found,
            expected: SCHEMA_VERSION,
        }),
        None if index.tip()?.is_some() => Err(IndexError::Schema {
            found: 0,
            expected: SCHEMA_VERSION,
        }),
        None => {
            index.stamp_schema()?;
            Ok(())
        }
    }
}

#[derive(Clone, Debug)]
pub struct IndexerConfig {
    pub reorg_limit: u32,
    pub raw_block_retention: u32,
    pub max_blocks_per_step: u32,
    pub expected_genesis: Option<Hash256>,
}

impl IndexerConfig {
    pub fn new(reorg_limit: u32) -> Self {
        Self {
            reorg_limit,
            raw_block_retention: reorg_limit.saturating_add(RAW_BLOCK_RETENTION_SLACK),
            max_blocks_per_step: 500,
            expected_genesis: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SyncProgress {
    pub applied: u32,
    pub rolled_back: u32,
    pub daemon_height: u32,
}

/// Net table changes of one block. Each key appears at most once.
#[derive(Default)]
struct BlockEffects {
    /// Every output the block creates, for the permanent `TxOut` log.
    outputs: Vec<(OutPoint, OutputRecord)>,
    /// Outputs still unspent at the end of the block.
    added: Vec<(OutPoint, OutputRecord)>,
    /// Earlier outputs this block spends.
    spent: Vec<(OutPoint, OutputRecord)>,
    /// Keyed by script hash, then position in the block.
    history: BTreeMap<(ScriptHash, u32, Hash256), HistoryDelta>,
    txs: Vec<(Hash256, TxLocation)>,
}

fn block_effects(
    block: &Block,
    height: u32,
    resolve: &mut dyn FnMut(&OutPoint) -> Result<Option<OutputRecord>, IndexError>,
) -> Result<BlockEffects, IndexError> {
    let mut effects = BlockEffects::default();
    let mut created: HashMap<OutPoint, OutputRecord> = HashMap::new();
    let mut spent_earlier: HashSet<OutPoint> = HashSet::new();

    for (position, ((tx, txid), span)) in block
        .iter_with_txids()
        .zip(block.tx_spans.iter())
        .enumerate()
    {
        effects.txs.push((
            *txid,
            TxLocation {
                height,
                position: position as u32,
                offset: span.offset,
                len: span.len,
            },
        ));

        if !tx.is_coinbase() {
            for input in &tx.vin {
                let prevout = input.prevout;
                let record = match created.remove(&prevout) {
                    Some(record) => record,
                    None => {
                        if !spent_earlier.insert(prevout) {
                            return Err(IndexError::MissingInput {
                                height,
                                outpoint: prevout,
                            });
                        }
                        let record = resolve(&prevout)?.ok_or(IndexError::MissingInput {
                            height,
                            outpoint: prevout,
                        })?;
                        effects.spent.push((prevout, record));
                        record
                    }
                };
                effects
                    .history
                    .entry((record.script_hash, position as u32, *txid))
                    .or_default()
                    .spent += record.value;
            }
        }

        for (index, output) in tx.vout.iter().enumerate() {
            let outpoint = OutPoint::new(*txid, index as u32);
            if !money_range(output.value) {
                return Err(IndexError::ValueOutOfRange {
                    height,
                    outpoint,
                    value: output.value,
                });
            }
            let record = OutputRecord {
                value: output.value,
                script_hash: ScriptHash::from_script(&output.script_pubkey),
                height,
                is_coinbase: tx.is_coinbase(),
            };
            effects.outputs.push((outpoint, record));
            if is_unspendable(&output.script_pubkey) {
                continue;
            }
            created.insert(outpoint, record);
            effects
                .history
                .entry((record.script_hash, position as u32, *txid))
                .or_default()
                .funded += record.value;
        }
    }

    let mut added: Vec<(OutPoint, OutputRecord)> = created.into_iter().collect();
    added.sort_by(|a, b| a.0.cmp(&b.0));
    effects.added = added;
    Ok(effects)
}

pub struct Indexer<S> {
    store: Arc<S>,
    selector: HashSelector,
    config: IndexerConfig,
    gate: Arc<dyn CommitGate>,
    tip: Option<ChainTip>,
    state: IndexerState,
}

impl<S: KeyValueStore> Indexer<S> {
    pub fn open(
        store: Arc<S>,
        selector: HashSelector,
        config: IndexerConfig,
    ) -> Result<Self, IndexError> {
        ensure_schema_version(store.as_ref())?;
        let tip = ChainIndex::new(store.as_ref()).tip()?;
        Ok(Self {
            store,
            selector,
            config,
            gate: Arc::new(DirectCommit),
            tip,
            state: IndexerState::CatchingUp,
        })
    }

    pub fn with_commit_gate(mut self, gate: Arc<dyn CommitGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn tip(&self) -> Option<ChainTip> {
        self.tip
    }

    pub fn state(&self) -> IndexerState {
        self.state
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn next_height(&self) -> u32 {
        self.tip.map_or(0, |tip| tip.height + 1)
    }

    /// Applies the block at `height`, which must extend the current tip.
    pub fn advance(
        &mut self,
        height: u32,
        hash: Hash256,
        raw_block: &[u8],
    ) -> Result<AdvanceOutcome, IndexError> {
        let chain = ChainIndex::new(self.store.as_ref());
        if let Some(tip) = self.tip {
            if height <= tip.height && chain.block_hash(height)? == Some(hash) {
                return Ok(AdvanceOutcome::AlreadyApplied);
            }
        }
        if height != self.next_height() {
            return Err(IndexError::NotNextBlock {
                height,
                tip: self.tip.map(|tip| tip.height),
            });
        }

        let block = Block::consensus_decode(raw_block)
            .map_err(|error| IndexError::MalformedBlock { height, error })?;
        let computed = self.selector.hash(height, &block.raw_header)?;
        if computed != hash {
            return Err(IndexError::HashMismatch {
                height,
                claimed: hash,
                computed,
            });
        }
        match self.tip {
            Some(tip) if block.header.prev_block != tip.hash => {
                return Err(IndexError::Linkage {
                    height,
                    expected_prev: tip.hash,
                    found_prev: block.header.prev_block,
                });
            }
            None => {
                if let Some(expected) = self.config.expected_genesis {
                    if expected != hash {
                        return Err(IndexError::GenesisMismatch {
                            expected,
                            found: hash,
                        });
                    }
                }
            }
            Some(_) => {}
        }

        let utxos = UtxoSet::new(self.store.as_ref());
        let effects = block_effects(&block, height, &mut |outpoint| Ok(utxos.get(outpoint)?))?;

        let mut batch = WriteBatch::new();
        self.write_connect(&mut batch, &effects, height);
        chain.put_header(&mut batch, height, &hash, &block.raw_header);
        chain.put_raw_block(&mut batch, height, raw_block);
        if let Some(expired) = height.checked_sub(self.config.raw_block_retention) {
            chain.delete_raw_block(&mut batch, expired);
        }
        let tip = ChainTip { height, hash };
        chain.set_tip(&mut batch, Some(tip));

        let event = ChainEvent::Connected {
            height,
            hash,
            block: &block,
        };
        let store = self.store.as_ref();
        self.gate.commit(event, &mut || store.write_batch(&batch))?;
        self.tip = Some(tip);
        pepexd_log::log_debug!(
            "indexed block {height} {} ({} txs, {} spent, {} created)",
            hash256_to_hex(&hash),
            block.transactions.len(),
            effects.spent.len(),
            effects.added.len(),
        );
        Ok(AdvanceOutcome::Applied)
    }

    fn write_connect(&self, batch: &mut WriteBatch, effects: &BlockEffects, height: u32) {
        let utxos = UtxoSet::new(self.store.as_ref());
        let addresses = AddressIndex::new(self.store.as_ref());
        let history = HistoryIndex::new(self.store.as_ref());
        let txindex = TxIndex::new(self.store.as_ref());

        for (outpoint, record) in &effects.outputs {
            utxos.put_output(batch, outpoint, record);
        }
        for (outpoint, record) in &effects.spent {
            utxos.delete(batch, outpoint);
            addresses.delete(batch, &record.script_hash, outpoint);
        }
        for (outpoint, record) in &effects.added {
            utxos.put(batch, outpoint, record);
            addresses.insert(batch, &record.script_hash, outpoint);
        }
        for ((script_hash, position, txid), delta) in &effects.history {
            history.insert(batch, script_hash, height, *position, txid, *delta);
        }
        for (txid, location) in &effects.txs {
            txindex.insert(batch, txid, *location);
        }
    }

    fn write_disconnect(&self, batch: &mut WriteBatch, effects: &BlockEffects, height: u32) {
        let utxos = UtxoSet::new(self.store.as_ref());
        let addresses = AddressIndex::new(self.store.as_ref());
        let history = HistoryIndex::new(self.store.as_ref());
        let txindex = TxIndex::new(self.store.as_ref());

        for (outpoint, _) in &effects.outputs {
            utxos.delete_output(batch, outpoint);
        }
        for (outpoint, record) in &effects.added {
            utxos.delete(batch, outpoint);
            addresses.delete(batch, &record.script_hash, outpoint);
        }
        for (outpoint, record) in &effects.spent {
            utxos.put(batch, outpoint, record);
            addresses.insert(batch, &record.script_hash, outpoint);
        }
        for (script_hash, position, txid) in effects.history.keys() {
            history.delete(batch, script_hash, height, *position, txid);
        }
        for (txid, _) in &effects.txs {
            txindex.delete(batch, txid);
        }
    }

    /// Undoes the tip block by replaying its stored raw bytes in reverse.
    pub fn rollback_tip(&mut self) -> Result<ChainTip, IndexError> {
        let tip = self.tip.ok_or(IndexError::RollbackUnavailable { height: 0 })?;
        if tip.height == 0 {
            return Err(IndexError::RollbackUnavailable { height: 0 });
        }
        let chain = ChainIndex::new(self.store.as_ref());
        let raw = chain
            .raw_block(tip.height)?
            .ok_or(IndexError::RollbackUnavailable { height: tip.height })?;
        let block = Block::consensus_decode(&raw).map_err(|error| IndexError::MalformedBlock {
            height: tip.height,
            error,
        })?;

        let utxos = UtxoSet::new(self.store.as_ref());
        let effects =
            block_effects(&block, tip.height, &mut |outpoint| Ok(utxos.output(outpoint)?))?;

        let parent = ChainTip {
            height: tip.height - 1,
            hash: block.header.prev_block,
        };
        let mut batch = WriteBatch::new();
        self.write_disconnect(&mut batch, &effects, tip.height);
        chain.delete_header(&mut batch, tip.height, &tip.hash);
        chain.delete_raw_block(&mut batch, tip.height);
        chain.set_tip(&mut batch, Some(parent));

        let event = ChainEvent::Disconnected {
            height: tip.height,
            hash: tip.hash,
            block: &block,
        };
        let store = self.store.as_ref();
        self.gate.commit(event, &mut || store.write_batch(&batch))?;
        self.tip = Some(parent);
        pepexd_log::log_info!(
            "rolled back block {} {}",
            tip.height,
            hash256_to_hex(&tip.hash)
        );
        Ok(parent)
    }

    /// Highest height where the local and source chains agree, within the reorg limit.
    pub fn find_common_ancestor(&self, source: &dyn ChainSource) -> Result<u32, IndexError> {
        let Some(tip) = self.tip else {
            return Ok(0);
        };
        let chain = ChainIndex::new(self.store.as_ref());
        let floor = tip.height.saturating_sub(self.config.reorg_limit);
        let mut height = tip.height;
        loop {
            let local = chain.block_hash(height)?;
            let remote = source.block_hash(height)?;
            if local.is_some() && local == remote {
                return Ok(height);
            }
            if height == 0 {
                return Err(IndexError::GenesisMismatch {
                    expected: local.unwrap_or_default(),
                    found: remote.unwrap_or_default(),
                });
            }
            if height == floor {
                return Err(IndexError::ReorgTooDeep {
                    depth: tip.height - floor + 1,
                    limit: self.config.reorg_limit,
                });
            }
            height -= 1;
        }
    }

    /// Rolls back to `ancestor`. Refuses before touching anything if that is too deep.
    pub fn reorg_to(&mut self, ancestor: u32) -> Result<u32, IndexError> {
        let Some(tip) = self.tip else {
            return Ok(0);
        };
        if ancestor >= tip.height {
            return Ok(0);
        }
        let depth = tip.height - ancestor;
        if depth > self.config.reorg_limit {
            return Err(IndexError::ReorgTooDeep {
                depth,
                limit: self.config.reorg_limit,
            });
        }
        pepexd_log::log_warn!(
            "reorg: rolling back {depth} blocks from {} to {ancestor}",
            tip.height
        );
        self.state = IndexerState::Reorging;
        while self.tip.is_some_and(|tip| tip.height > ancestor) {
            self.rollback_tip()?;
        }
        self.state = IndexerState::CatchingUp;
        Ok(depth)
    }

    /// One bounded pass: follow a fork back if needed, then apply new blocks.
    pub fn sync_step(&mut self, source: &dyn ChainSource) -> Result<SyncProgress, IndexError> {
        let (best_height, best_hash) = source.best_height_and_hash()?;
        let mut progress = SyncProgress {
            daemon_height: best_height,
            ..SyncProgress::default()
        };

        if let Some(tip) = self.tip {
            if tip.hash == best_hash {
                self.state = IndexerState::Synced;
                return Ok(progress);
            }
            if source.block_hash(tip.height)? != Some(tip.hash) {
                let ancestor = self.find_common_ancestor(source)?;
                progress.rolled_back = self.reorg_to(ancestor)?;
            }
        }

        self.state = IndexerState::CatchingUp;
        while progress.applied < self.config.max_blocks_per_step {
            let height = self.next_height();
            if height > best_height {
                break;
            }
            let Some(hash) = source.block_hash(height)? else {
                break;
            };
            let raw = source.block(&hash)?;
            match self.advance(height, hash, &raw) {
                Ok(AdvanceOutcome::Applied) => progress.applied += 1,
                Ok(AdvanceOutcome::AlreadyApplied) => {}
                Err(IndexError::Linkage { .. }) if self.source_moved(source)? => {
                    // The source reorganized between calls; the next pass rolls back.
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        if self.tip.is_some_and(|tip| tip.height >= best_height) {
            self.state = IndexerState::Synced;
        }
        Ok(progress)
    }

    fn source_moved(&self, source: &dyn ChainSource) -> Result<bool, IndexError> {
        let Some(tip) = self.tip else {
            return Ok(false);
        };
        Ok(source.block_hash(tip.height)? != Some(tip.hash))
    }

    /// Deletes raw blocks that fell out of the retention window.
    pub fn prune_raw_blocks(&self) -> Result<u64, IndexError> {
        let Some(tip) = self.tip else {
            return Ok(0);
        };
        let chain = ChainIndex::new(self.store.as_ref());
        let keep_from = (tip.height + 1).saturating_sub(self.config.raw_block_retention);
        let mut batch = WriteBatch::new();
        for height in chain.raw_block_heights()? {
            if height >= keep_from {
                break;
            }
            chain.delete_raw_block(&mut batch, height);
        }
        let pruned = batch.len() as u64;
        if pruned > 0 {
            self.store.write_batch(&batch)?;
            pepexd_log::log_info!("pruned {pruned} raw blocks below height {keep_from}");
        }
        Ok(pruned)
    }
}
