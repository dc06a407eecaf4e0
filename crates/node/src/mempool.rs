//! Unconfirmed transactions and their overlay on the confirmed index.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, RwLock, RwLockReadGuard};

use pepexd_chainstate::{ChainEvent, ChainQuery, ChainTip, CommitGate, HeaderRecord};
use pepexd_consensus::{hash256_to_hex, Hash256};
use pepexd_primitives::block::Block;
use pepexd_primitives::hash::Sha256Stream;
use pepexd_primitives::outpoint::OutPoint;
use pepexd_primitives::script::{is_unspendable, ScriptHash};
use pepexd_primitives::transaction::Transaction;
use pepexd_storage::{KeyValueStore, StoreError};

use crate::daemon::{DaemonClient, DaemonError};
use crate::fee_estimator::BacklogTx;
use crate::hex_encode;

#[derive(Debug)]
pub enum MempoolError {
    MissingInput(OutPoint),
    /// `spender` is `None` when the output was spent by a confirmed block.
    ConflictingInput {
        outpoint: OutPoint,
        spender: Option<Hash256>,
    },
    AlreadyInMempool,
    AlreadyConfirmed,
    InvalidTransaction(&'static str),
    Daemon(DaemonError),
    Store(StoreError),
    LockPoisoned,
}

impl fmt::Display for MempoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MempoolError::MissingInput(outpoint) => write!(
                f,
                "missing input {}:{}",
                hash256_to_hex(&outpoint.hash),
                outpoint.index
            ),
            MempoolError::ConflictingInput { outpoint, spender } => {
                let spender = match spender {
                    Some(txid) => hash256_to_hex(txid),
                    None => "a confirmed transaction".to_string(),
                };
                write!(
                    f,
                    "input {}:{} already spent by {spender}",
                    hash256_to_hex(&outpoint.hash),
                    outpoint.index
                )
            }
            MempoolError::AlreadyInMempool => write!(f, "transaction already in mempool"),
            MempoolError::AlreadyConfirmed => write!(f, "transaction already confirmed"),
            MempoolError::InvalidTransaction(reason) => write!(f, "invalid transaction: {reason}"),
            MempoolError::Daemon(err) => write!(f, "{err}"),
            MempoolError::Store(err) => write!(f, "{err}"),
            MempoolError::LockPoisoned => write!(f, "mempool lock poisoned"),
        }
    }
}

impl std::error::Error for MempoolError {}

impl From<StoreError> for MempoolError {
    fn from(err: StoreError) -> Self {
        MempoolError::Store(err)
    }
}

impl From<DaemonError> for MempoolError {
    fn from(err: DaemonError) -> Self {
        MempoolError::Daemon(err)
    }
}

/// Value and owner of an output a mempool transaction spends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Prevout {
    pub value: i64,
    pub script_hash: ScriptHash,
}

pub enum ConfirmedOutput {
    Unspent(Prevout),
    Spent,
    Missing,
}

/// The parts of the confirmed index the mempool reads.
pub trait ConfirmedView {
    fn lookup(&self, outpoint: &OutPoint) -> Result<ConfirmedOutput, StoreError>;
    fn is_confirmed(&self, txid: &Hash256) -> Result<bool, StoreError>;
}

impl<S: KeyValueStore> ConfirmedView for ChainQuery<S> {
    fn lookup(&self, outpoint: &OutPoint) -> Result<ConfirmedOutput, StoreError> {
        if let Some(record) = self.unspent(outpoint)? {
            return Ok(ConfirmedOutput::Unspent(Prevout {
                value: record.value,
                script_hash: record.script_hash,
            }));
        }
        if self.output(outpoint)?.is_some() {
            return Ok(ConfirmedOutput::Spent);
        }
        Ok(ConfirmedOutput::Missing)
    }

    fn is_confirmed(&self, txid: &Hash256) -> Result<bool, StoreError> {
        Ok(self.tx_location(txid)?.is_some())
    }
}

pub struct MempoolEntry {
    pub txid: Hash256,
    pub tx: Transaction,
    pub size: usize,
    pub fee: i64,
    pub inputs: Vec<(OutPoint, Prevout)>,
    /// Mempool transactions whose outputs this one spends.
    pub parents: BTreeSet<Hash256>,
    /// Net value moved per script hash.
    pub deltas: BTreeMap<ScriptHash, i64>,
}

impl MempoolEntry {
    /// Satoshis per byte.
    pub fn fee_rate(&self) -> f64 {
        self.fee as f64 / self.size.max(1) as f64
    }

    pub fn has_unconfirmed_parents(&self) -> bool {
        !self.parents.is_empty()
    }

    /// Electrum height convention: `-1` with unconfirmed parents, otherwise `0`.
    pub fn electrum_height(&self) -> i64 {
        if self.has_unconfirmed_parents() {
            -1
        } else {
            0
        }
    }
}

#[derive(Default)]
struct ScriptOverlay {
    txs: BTreeMap<Hash256, i64>,
    outputs: BTreeSet<OutPoint>,
}

impl ScriptOverlay {
    fn is_empty(&self) -> bool {
        self.txs.is_empty() && self.outputs.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct MempoolDelta {
    pub added: Vec<Hash256>,
    pub removed: Vec<Hash256>,
    pub touched: BTreeSet<ScriptHash>,
}

impl MempoolDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Default)]
pub struct MempoolState {
    entries: HashMap<Hash256, MempoolEntry>,
    spent: HashMap<OutPoint, Hash256>,
    created: HashMap<OutPoint, Prevout>,
    children: HashMap<Hash256, BTreeSet<Hash256>>,
    by_script: HashMap<ScriptHash, ScriptOverlay>,
    total_bytes: usize,
}

impl MempoolState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }

    /// Reported txids this state does not hold yet.
    pub fn missing(&self, reported: &[Hash256]) -> Vec<Hash256> {
        reported
            .iter()
            .filter(|txid| !self.entries.contains_key(*txid))
            .copied()
            .collect()
    }

    pub fn insert(
        &mut self,
        tx: &Transaction,
        size: usize,
        view: &dyn ConfirmedView,
    ) -> Result<Vec<ScriptHash>, MempoolError> {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyInMempool);
        }
        if tx.is_coinbase() {
            return Err(MempoolError::InvalidTransaction("coinbase outside a block"));
        }
        if view.is_confirmed(&txid)? {
            return Err(MempoolError::AlreadyConfirmed);
        }

        let mut inputs = Vec::with_capacity(tx.vin.len());
        let mut parents = BTreeSet::new();
        let mut seen = HashSet::with_capacity(tx.vin.len());
        for input in &tx.vin {
            let outpoint = input.prevout;
            if !seen.insert(outpoint) {
                return Err(MempoolError::InvalidTransaction("duplicate input"));
            }
            if let Some(spender) = self.spent.get(&outpoint) {
                return Err(MempoolError::ConflictingInput {
                    outpoint,
                    spender: Some(*spender),
                });
            }
            if let Some(prevout) = self.created.get(&outpoint) {
                parents.insert(outpoint.hash);
                inputs.push((outpoint, *prevout));
                continue;
            }
            match view.lookup(&outpoint)? {
                ConfirmedOutput::Unspent(prevout) => inputs.push((outpoint, prevout)),
                ConfirmedOutput::Spent => {
                    return Err(MempoolError::ConflictingInput {
                        outpoint,
                        spender: None,
                    })
                }
                ConfirmedOutput::Missing => return Err(MempoolError::MissingInput(outpoint)),
            }
        }

        let value_in = inputs
            .iter()
            .try_fold(0i64, |acc, (_, prevout)| acc.checked_add(prevout.value))
            .ok_or(MempoolError::InvalidTransaction("input value overflow"))?;
        let value_out = tx
            .total_output_value()
            .ok_or(MempoolError::InvalidTransaction("output value out of range"))?;
        let fee = value_in - value_out;
        if fee < 0 {
            return Err(MempoolError::InvalidTransaction("outputs exceed inputs"));
        }

        let mut deltas: BTreeMap<ScriptHash, i64> = BTreeMap::new();
        for (_, prevout) in &inputs {
            *deltas.entry(prevout.script_hash).or_default() -= prevout.value;
        }
        let mut outputs = Vec::with_capacity(tx.vout.len());
        for (index, output) in tx.vout.iter().enumerate() {
            if is_unspendable(&output.script_pubkey) {
                continue;
            }
            let script_hash = ScriptHash::from_script(&output.script_pubkey);
            *deltas.entry(script_hash).or_default() += output.value;
            outputs.push((
                OutPoint::new(txid, index as u32),
                Prevout {
                    value: output.value,
                    script_hash,
                },
            ));
        }

        for (outpoint, _) in &inputs {
            self.spent.insert(*outpoint, txid);
        }
        for parent in &parents {
            self.children.entry(*parent).or_default().insert(txid);
        }
        for (outpoint, prevout) in outputs {
            self.created.insert(outpoint, prevout);
            self.by_script
                .entry(prevout.script_hash)
                .or_default()
                .outputs
                .insert(outpoint);
        }
        for (script_hash, delta) in &deltas {
            self.by_script
                .entry(*script_hash)
                .or_default()
                .txs
                .insert(txid, *delta);
        }
        self.total_bytes = self.total_bytes.saturating_add(size);
        let touched = deltas.keys().copied().collect();
        self.entries.insert(
            txid,
            MempoolEntry {
                txid,
                tx: tx.clone(),
                size,
                fee,
                inputs,
                parents,
                deltas,
            },
        );
        Ok(touched)
    }

    /// Removes one entry. Children keep their links to outputs it created.
    fn remove_entry(
        &mut self,
        txid: &Hash256,
        touched: &mut BTreeSet<ScriptHash>,
    ) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        for (outpoint, _) in &entry.inputs {
            if self.spent.get(outpoint) == Some(txid) {
                self.spent.remove(outpoint);
            }
        }
        for index in 0..entry.tx.vout.len() {
            let outpoint = OutPoint::new(*txid, index as u32);
            if let Some(prevout) = self.created.remove(&outpoint) {
                if let Some(overlay) = self.by_script.get_mut(&prevout.script_hash) {
                    overlay.outputs.remove(&outpoint);
                }
            }
        }
        for script_hash in entry.deltas.keys() {
            if let Some(overlay) = self.by_script.get_mut(script_hash) {
                overlay.txs.remove(txid);
                if overlay.is_empty() {
                    self.by_script.remove(script_hash);
                }
            }
            touched.insert(*script_hash);
        }
        for parent in &entry.parents {
            if let Some(children) = self.children.get_mut(parent) {
                children.remove(txid);
                if children.is_empty() {
                    self.children.remove(parent);
                }
            }
        }
        if let Some(children) = self.children.remove(txid) {
            for child in children {
                if let Some(child_entry) = self.entries.get_mut(&child) {
                    child_entry.parents.remove(txid);
                }
            }
        }
        Some(entry)
    }

    /// Removes `txid` and everything spending its outputs, children first.
    fn remove_with_descendants(
        &mut self,
        txid: &Hash256,
        touched: &mut BTreeSet<ScriptHash>,
    ) -> Vec<Hash256> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(*txid, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            if !visited.insert(current) {
                continue;
            }
            stack.push((current, true));
            if let Some(children) = self.children.get(&current) {
                stack.extend(children.iter().map(|child| (*child, false)));
            }
        }
        order
            .into_iter()
            .filter(|txid| self.remove_entry(txid, touched).is_some())
            .collect()
    }

    /// Reconciles with the daemon's txid list. `fetched` holds the transactions from
    /// [`MempoolState::missing`]; they are inserted parents first.
    pub fn apply_refresh(
        &mut self,
        reported: &[Hash256],
        fetched: Vec<(Transaction, usize)>,
        view: &dyn ConfirmedView,
    ) -> Result<MempoolDelta, MempoolError> {
        let mut delta = MempoolDelta::default();
        let reported_set: HashSet<Hash256> = reported.iter().copied().collect();

        let evicted: Vec<Hash256> = self
            .entries
            .keys()
            .filter(|txid| !reported_set.contains(*txid))
            .copied()
            .collect();
        for txid in evicted {
            if self.entries.contains_key(&txid) {
                let removed = self.remove_with_descendants(&txid, &mut delta.touched);
                delta.removed.extend(removed);
            }
        }

        let mut pending = fetched;
        loop {
            let pending_ids: HashSet<Hash256> = pending.iter().map(|(tx, _)| tx.txid()).collect();
            let mut waiting = Vec::new();
            let mut progressed = false;
            for (tx, size) in pending {
                match self.insert(&tx, size, view) {
                    Ok(scripts) => {
                        delta.added.push(tx.txid());
                        delta.touched.extend(scripts);
                        progressed = true;
                    }
                    Err(MempoolError::MissingInput(outpoint))
                        if pending_ids.contains(&outpoint.hash) =>
                    {
                        waiting.push((tx, size));
                    }
                    Err(MempoolError::AlreadyInMempool | MempoolError::AlreadyConfirmed) => {}
                    Err(MempoolError::Store(err)) => return Err(MempoolError::Store(err)),
                    Err(err) => {
                        log_debug!("mempool skipped {}: {err}", hash256_to_hex(&tx.txid()));
                    }
                }
            }
            if waiting.is_empty() {
                break;
            }
            if !progressed {
                for (tx, _) in &waiting {
                    log_debug!(
                        "mempool skipped {}: parents unavailable",
                        hash256_to_hex(&tx.txid())
                    );
                }
                break;
            }
            pending = waiting;
        }
        Ok(delta)
    }

    /// Drops transactions the block confirmed and everything that conflicts with it.
    pub fn confirm_block(
        &mut self,
        block: &Block,
        touched: &mut BTreeSet<ScriptHash>,
    ) -> Vec<Hash256> {
        let mut removed = Vec::new();
        for (tx, txid) in block.iter_with_txids() {
            if self.remove_entry(txid, touched).is_some() {
                removed.push(*txid);
            }
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.vin {
                if let Some(spender) = self.spent.get(&input.prevout).copied() {
                    let conflicts = self.remove_with_descendants(&spender, touched);
                    if !conflicts.is_empty() {
                        log_debug!(
                            "block tx {} invalidated {} mempool txs",
                            hash256_to_hex(txid),
                            conflicts.len()
                        );
                    }
                    removed.extend(conflicts);
                }
            }
        }
        removed
    }

    /// Empties the pool; the next refresh reloads it against the new chain.
    pub fn clear(&mut self, touched: &mut BTreeSet<ScriptHash>) -> Vec<Hash256> {
        for overlay_hash in self.by_script.keys() {
            touched.insert(*overlay_hash);
        }
        let removed = self.entries.keys().copied().collect();
        *self = Self::default();
        removed
    }

    pub fn unconfirmed_delta(&self, script_hash: &ScriptHash) -> i64 {
        self.by_script
            .get(script_hash)
            .map_or(0, |overlay| overlay.txs.values().sum())
    }

    /// Mempool transactions touching `script_hash`, in txid order.
    pub fn script_entries(&self, script_hash: &ScriptHash) -> Vec<&MempoolEntry> {
        let Some(overlay) = self.by_script.get(script_hash) else {
            return Vec::new();
        };
        overlay
            .txs
            .keys()
            .filter_map(|txid| self.entries.get(txid))
            .collect()
    }

    /// Outputs paying `script_hash` that no other mempool transaction spends.
    pub fn script_unspent(&self, script_hash: &ScriptHash) -> Vec<(OutPoint, i64)> {
        let Some(overlay) = self.by_script.get(script_hash) else {
            return Vec::new();
        };
        overlay
            .outputs
            .iter()
            .filter(|outpoint| !self.spent.contains_key(*outpoint))
            .filter_map(|outpoint| {
                self.created
                    .get(outpoint)
                    .map(|prevout| (*outpoint, prevout.value))
            })
            .collect()
    }

    pub fn backlog(&self) -> Vec<BacklogTx> {
        self.entries
            .values()
            .map(|entry| BacklogTx {
                fee_rate: entry.fee_rate(),
                size: entry.size,
            })
            .collect()
    }
}

/// Daemon calls the tracker needs.
pub trait MempoolSource {
    fn mempool_txids(&self) -> Result<Vec<Hash256>, DaemonError>;
    fn raw_transaction(&self, txid: &Hash256) -> Result<Option<Vec<u8>>, DaemonError>;
}

impl MempoolSource for DaemonClient {
    fn mempool_txids(&self) -> Result<Vec<Hash256>, DaemonError> {
        self.get_raw_mempool()
    }

    fn raw_transaction(&self, txid: &Hash256) -> Result<Option<Vec<u8>>, DaemonError> {
        self.get_raw_transaction(txid)
    }
}

/// Changes since the last notification round.
#[derive(Debug, Default)]
pub struct PendingChanges {
    pub touched: BTreeSet<ScriptHash>,
    pub tip_changed: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Balance {
    pub confirmed: i64,
    pub unconfirmed: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HistoryItem {
    pub txid: Hash256,
    /// Block height, or `0`/`-1` for mempool transactions.
    pub height: i64,
    pub fee: Option<i64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnspentItem {
    pub outpoint: OutPoint,
    pub value: i64,
    /// `0` for mempool outputs.
    pub height: u32,
}

/// Shared mempool plus the confirmed index it overlays. Commits and refreshes hold
/// the write lock; queries hold the read lock for their whole computation.
pub struct Tracker<S> {
    state: RwLock<MempoolState>,
    query: ChainQuery<S>,
    pending: Mutex<PendingChanges>,
}

impl<S: KeyValueStore> Tracker<S> {
    pub fn new(query: ChainQuery<S>) -> Self {
        Self {
            state: RwLock::new(MempoolState::new()),
            query,
            pending: Mutex::new(PendingChanges::default()),
        }
    }

    pub fn view(&self) -> Result<MempoolView<'_, S>, MempoolError> {
        let state = self.state.read().map_err(|_| MempoolError::LockPoisoned)?;
        Ok(MempoolView {
            state,
            query: &self.query,
        })
    }

    pub fn refresh(&self, source: &dyn MempoolSource) -> Result<MempoolDelta, MempoolError> {
        let reported = source.mempool_txids()?;
        let wanted = {
            let state = self.state.read().map_err(|_| MempoolError::LockPoisoned)?;
            state.missing(&reported)
        };

        let mut fetched = Vec::with_capacity(wanted.len());
        for txid in wanted {
            match source.raw_transaction(&txid) {
                Ok(Some(raw)) => match Transaction::consensus_decode(&raw) {
                    Ok(tx) => fetched.push((tx, raw.len())),
                    Err(err) => {
                        log_warn!("mempool tx {} did not parse: {err}", hash256_to_hex(&txid));
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    log_warn!("mempool fetch of {} failed: {err}", hash256_to_hex(&txid));
                }
            }
        }

        let delta = {
            let mut state = self.state.write().map_err(|_| MempoolError::LockPoisoned)?;
            state.apply_refresh(&reported, fetched, &self.query)?
        };
        if !delta.touched.is_empty() {
            let mut pending = self.pending.lock().map_err(|_| MempoolError::LockPoisoned)?;
            pending.touched.extend(delta.touched.iter().copied());
        }
        Ok(delta)
    }

    pub fn take_pending(&self) -> Result<PendingChanges, MempoolError> {
        let mut pending = self.pending.lock().map_err(|_| MempoolError::LockPoisoned)?;
        Ok(std::mem::take(&mut *pending))
    }

    /// `(transactions, bytes)`.
    pub fn size(&self) -> Result<(usize, usize), MempoolError> {
        let state = self.state.read().map_err(|_| MempoolError::LockPoisoned)?;
        Ok((state.len(), state.total_bytes()))
    }

    /// Script hashes a block pays to or spends from.
    fn block_script_hashes(
        &self,
        block: &Block,
        touched: &mut BTreeSet<ScriptHash>,
    ) -> Result<(), StoreError> {
        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.vin {
                    if let Some(record) = self.query.output(&input.prevout)? {
                        touched.insert(record.script_hash);
                    }
                }
            }
            for output in &tx.vout {
                if !is_unspendable(&output.script_pubkey) {
                    touched.insert(ScriptHash::from_script(&output.script_pubkey));
                }
            }
        }
        Ok(())
    }
}

impl<S: KeyValueStore> CommitGate for Tracker<S> {
    fn commit(
        &self,
        event: ChainEvent<'_>,
        commit: &mut dyn FnMut() -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned("mempool"))?;
        commit()?;

        let mut touched = BTreeSet::new();
        let block = match event {
            ChainEvent::Connected { height, block, .. } => {
                let removed = state.confirm_block(block, &mut touched);
                if !removed.is_empty() {
                    log_debug!("block {height} removed {} mempool txs", removed.len());
                }
                block
            }
            ChainEvent::Disconnected { height, block, .. } => {
                let removed = state.clear(&mut touched);
                log_info!(
                    "block {height} disconnected; dropped {} mempool txs for re-fetch",
                    removed.len()
                );
                block
            }
        };
        self.block_script_hashes(block, &mut touched)?;
        drop(state);

        let mut pending = self
            .pending
            .lock()
            .map_err(|_| StoreError::LockPoisoned("mempool notifications"))?;
        pending.touched.append(&mut touched);
        pending.tip_changed = true;
        Ok(())
    }
}

/// Confirmed index and mempool at one consistent point.
pub struct MempoolView<'a, S> {
    state: RwLockReadGuard<'a, MempoolState>,
    query: &'a ChainQuery<S>,
}

impl<S: KeyValueStore> MempoolView<'_, S> {
    pub fn state(&self) -> &MempoolState {
        &self.state
    }

    pub fn tip(&self) -> Result<Option<ChainTip>, StoreError> {
        self.query.tip()
    }

    pub fn header(&self, height: u32) -> Result<Option<HeaderRecord>, StoreError> {
        self.query.header(height)
    }

    pub fn balance(&self, script_hash: &ScriptHash) -> Result<Balance, StoreError> {
        Ok(Balance {
            confirmed: self.query.balance(script_hash)?,
            unconfirmed: self.state.unconfirmed_delta(script_hash),
        })
    }

    /// Confirmed history in blockchain order, then mempool entries.
    pub fn history(&self, script_hash: &ScriptHash) -> Result<Vec<HistoryItem>, StoreError> {
        let mut items: Vec<HistoryItem> = self
            .query
            .history(script_hash)?
            .into_iter()
            .map(|entry| HistoryItem {
                txid: entry.txid,
                height: i64::from(entry.height),
                fee: None,
            })
            .collect();
        items.extend(self.mempool(script_hash));
        Ok(items)
    }

    pub fn mempool(&self, script_hash: &ScriptHash) -> Vec<HistoryItem> {
        self.state
            .script_entries(script_hash)
            .into_iter()
            .map(|entry| HistoryItem {
                txid: entry.txid,
                height: entry.electrum_height(),
                fee: Some(entry.fee),
            })
            .collect()
    }

    /// Confirmed outputs not spent in the mempool, then mempool outputs.
    pub fn unspent(&self, script_hash: &ScriptHash) -> Result<Vec<UnspentItem>, StoreError> {
        let mut items: Vec<UnspentItem> = self
            .query
            .utxos(script_hash)?
            .into_iter()
            .filter(|row| self.state.spender(&row.outpoint).is_none())
            .map(|row| UnspentItem {
                outpoint: row.outpoint,
                value: row.value,
                height: row.height,
            })
            .collect();
        items.extend(
            self.state
                .script_unspent(script_hash)
                .into_iter()
                .map(|(outpoint, value)| UnspentItem {
                    outpoint,
                    value,
                    height: 0,
                }),
        );
        Ok(items)
    }

    /// Electrum status: hex sha256 over `"txid:height:"` for each history item.
    pub fn status(&self, script_hash: &ScriptHash) -> Result<Option<String>, StoreError> {
        Ok(status_hash(&self.history(script_hash)?))
    }

    /// Raw transaction from the mempool or a retained block.
    pub fn transaction(&self, txid: &Hash256) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(entry) = self.state.get(txid) {
            return Ok(Some(entry.tx.consensus_encode()));
        }
        self.query.raw_tx(txid)
    }
}

pub fn status_hash(history: &[HistoryItem]) -> Option<String> {
    if history.is_empty() {
        return None;
    }
    let mut stream = Sha256Stream::new();
    for item in history {
        stream.update(format!("{}:{}:", hash256_to_hex(&item.txid), item.height).as_bytes());
    }
    Some(hex_encode(&stream.finish()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pepexd_storage::memory::MemoryStore;

    use super::*;
    use crate::testutil::{coinbase, extend, gated_indexer, sh, spend, TestBlock};

    #[derive(Default)]
    struct FakeConfirmed {
        unspent: HashMap<OutPoint, Prevout>,
        spent: HashSet<OutPoint>,
        confirmed: HashSet<Hash256>,
    }

    impl ConfirmedView for FakeConfirmed {
        fn lookup(&self, outpoint: &OutPoint) -> Result<ConfirmedOutput, StoreError> {
            if let Some(prevout) = self.unspent.get(outpoint) {
                return Ok(ConfirmedOutput::Unspent(*prevout));
            }
            if self.spent.contains(outpoint) {
                return Ok(ConfirmedOutput::Spent);
            }
            Ok(ConfirmedOutput::Missing)
        }

        fn is_confirmed(&self, txid: &Hash256) -> Result<bool, StoreError> {
            Ok(self.confirmed.contains(txid))
        }
    }

    fn funded(tag: u8, value: i64) -> (FakeConfirmed, OutPoint) {
        let mut view = FakeConfirmed::default();
        let outpoint = OutPoint::new([tag; 32], 0);
        view.unspent.insert(
            outpoint,
            Prevout {
                value,
                script_hash: sh(tag),
            },
        );
        (view, outpoint)
    }

    fn sized(tx: Transaction) -> (Transaction, usize) {
        let size = tx.consensus_encode().len();
        (tx, size)
    }

    #[test]
    fn insert_tracks_fee_and_deltas() {
        let (view, outpoint) = funded(1, 1000);
        let tx = spend(&[outpoint], &[(2, 600), (1, 300)]);
        let mut state = MempoolState::new();
        let touched = state.insert(&tx, 200, &view).expect("insert");
        let touched: BTreeSet<ScriptHash> = touched.into_iter().collect();
        assert_eq!(touched, [sh(1), sh(2)].into_iter().collect());

        let entry = state.get(&tx.txid()).expect("entry");
        assert_eq!(entry.fee, 100);
        assert!((entry.fee_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(state.unconfirmed_delta(&sh(1)), -700);
        assert_eq!(state.unconfirmed_delta(&sh(2)), 600);
        assert_eq!(state.total_bytes(), 200);
        assert!(matches!(
            state.insert(&tx, 200, &view),
            Err(MempoolError::AlreadyInMempool)
        ));
    }

    #[test]
    fn rejects_double_spends_and_confirmed_spends() {
        let (mut view, outpoint) = funded(1, 1000);
        let mut state = MempoolState::new();
        state
            .insert(&spend(&[outpoint], &[(2, 900)]), 100, &view)
            .expect("first");
        let rival = spend(&[outpoint], &[(3, 900)]);
        assert!(matches!(
            state.insert(&rival, 100, &view),
            Err(MempoolError::ConflictingInput { spender: Some(_), .. })
        ));

        let spent = OutPoint::new([9u8; 32], 1);
        view.spent.insert(spent);
        assert!(matches!(
            state.insert(&spend(&[spent], &[(3, 1)]), 100, &view),
            Err(MempoolError::ConflictingInput { spender: None, .. })
        ));
        let unknown = OutPoint::new([8u8; 32], 0);
        assert!(matches!(
            state.insert(&spend(&[unknown], &[(3, 1)]), 100, &view),
            Err(MempoolError::MissingInput(_))
        ));
        let mut fresh = MempoolState::new();
        assert!(matches!(
            fresh.insert(&spend(&[outpoint], &[(3, 2000)]), 100, &FakeConfirmed::default()),
            Err(MempoolError::MissingInput(_))
        ));
    }

    #[test]
    fn refresh_orders_parents_before_children() {
        let (view, outpoint) = funded(1, 1000);
        let parent = spend(&[outpoint], &[(2, 900)]);
        let child = spend(&[OutPoint::new(parent.txid(), 0)], &[(3, 800)]);
        let grandchild = spend(&[OutPoint::new(child.txid(), 0)], &[(4, 700)]);
        let reported = vec![grandchild.txid(), child.txid(), parent.txid()];

        let mut state = MempoolState::new();
        let fetched = vec![sized(grandchild.clone()), sized(child.clone()), sized(parent.clone())];
        let delta = state.apply_refresh(&reported, fetched, &view).expect("refresh");
        assert_eq!(delta.added, vec![parent.txid(), child.txid(), grandchild.txid()]);
        assert!(delta.removed.is_empty());
        assert_eq!(state.len(), 3);
        assert_eq!(state.get(&parent.txid()).expect("parent").electrum_height(), 0);
        assert_eq!(state.get(&child.txid()).expect("child").electrum_height(), -1);

        // The daemon dropped the parent: its descendants go with it.
        let delta = state
            .apply_refresh(&[child.txid(), grandchild.txid()], Vec::new(), &view)
            .expect("refresh");
        assert_eq!(delta.removed.len(), 3);
        assert!(state.is_empty());
        assert_eq!(state.total_bytes(), 0);
        assert_eq!(state.unconfirmed_delta(&sh(3)), 0);
        assert!(delta.touched.contains(&sh(4)));
    }

    #[test]
    fn refresh_skips_orphans_and_confirmed() {
        let (mut view, outpoint) = funded(1, 1000);
        let confirmed = spend(&[outpoint], &[(2, 900)]);
        view.confirmed.insert(confirmed.txid());
        let orphan = spend(&[OutPoint::new([7u8; 32], 3)], &[(2, 1)]);
        let reported = vec![confirmed.txid(), orphan.txid()];
        let mut state = MempoolState::new();
        let delta = state
            .apply_refresh(&reported, vec![sized(confirmed), sized(orphan)], &view)
            .expect("refresh");
        assert!(delta.added.is_empty());
        assert!(state.is_empty());
    }

    #[test]
    fn unspent_overlay_hides_mempool_spends() {
        let (view, outpoint) = funded(1, 1000);
        let parent = spend(&[outpoint], &[(2, 500), (2, 400)]);
        let child = spend(&[OutPoint::new(parent.txid(), 0)], &[(3, 450)]);
        let mut state = MempoolState::new();
        state.insert(&parent, 100, &view).expect("parent");
        state.insert(&child, 100, &view).expect("child");

        let outputs = state.script_unspent(&sh(2));
        assert_eq!(outputs, vec![(OutPoint::new(parent.txid(), 1), 400)]);
        assert_eq!(state.unconfirmed_delta(&sh(2)), 400);
        assert_eq!(state.script_entries(&sh(2)).len(), 2);
    }

    #[test]
    fn status_hash_matches_manual_digest() {
        assert_eq!(status_hash(&[]), None);
        let items = vec![
            HistoryItem {
                txid: [1u8; 32],
                height: 5,
                fee: None,
            },
            HistoryItem {
                txid: [2u8; 32],
                height: -1,
                fee: Some(10),
            },
        ];
        let text = format!(
            "{}:5:{}:-1:",
            hash256_to_hex(&[1u8; 32]),
            hash256_to_hex(&[2u8; 32])
        );
        let expected = hex_encode(&pepexd_primitives::hash::sha256(text.as_bytes()));
        assert_eq!(status_hash(&items), Some(expected));
    }

    struct FakeDaemon {
        txs: Vec<Transaction>,
    }

    impl MempoolSource for FakeDaemon {
        fn mempool_txids(&self) -> Result<Vec<Hash256>, DaemonError> {
            Ok(self.txs.iter().map(Transaction::txid).collect())
        }

        fn raw_transaction(&self, txid: &Hash256) -> Result<Option<Vec<u8>>, DaemonError> {
            Ok(self
                .txs
                .iter()
                .find(|tx| &tx.txid() == txid)
                .map(Transaction::consensus_encode))
        }
    }

    fn apply(indexer: &mut pepexd_chainstate::Indexer<MemoryStore>, block: &TestBlock) {
        indexer
            .advance(block.height, block.hash, &block.raw)
            .expect("advance");
    }

    #[test]
    fn unconfirmed_chain_confirms_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(Tracker::new(ChainQuery::new(Arc::clone(&store))));
        let mut indexer = gated_indexer(&store, &tracker);
        let mut chain: Vec<TestBlock> = Vec::new();
        let genesis_coinbase = coinbase(0, 1, 5000);
        apply(&mut indexer, extend(&mut chain, &[genesis_coinbase.clone()]));

        // Address 2 is paid by a mempool tx, then address 3 by a mempool child of it.
        let parent = spend(&[OutPoint::new(genesis_coinbase.txid(), 0)], &[(2, 4900)]);
        let child = spend(&[OutPoint::new(parent.txid(), 0)], &[(3, 4800)]);
        let daemon = FakeDaemon {
            txs: vec![child.clone(), parent.clone()],
        };
        let delta = tracker.refresh(&daemon).expect("refresh");
        assert_eq!(delta.added.len(), 2);
        {
            let view = tracker.view().expect("view");
            assert_eq!(
                view.balance(&sh(3)).expect("balance"),
                Balance {
                    confirmed: 0,
                    unconfirmed: 4800
                }
            );
            assert_eq!(
                view.balance(&sh(1)).expect("balance"),
                Balance {
                    confirmed: 5000,
                    unconfirmed: -5000
                }
            );
            let mempool = view.mempool(&sh(3));
            assert_eq!(mempool.len(), 1);
            assert_eq!(mempool[0].height, -1);
            assert_eq!(mempool[0].fee, Some(100));
            let unspent = view.unspent(&sh(3)).expect("unspent");
            assert_eq!(unspent.len(), 1);
            assert_eq!(unspent[0].height, 0);
            assert!(view.unspent(&sh(1)).expect("unspent").is_empty());
        }
        tracker.take_pending().expect("pending");

        let block = extend(&mut chain, &[coinbase(1, 9, 50), parent.clone(), child.clone()]);
        apply(&mut indexer, block);

        let view = tracker.view().expect("view");
        assert!(view.state().is_empty());
        assert_eq!(
            view.balance(&sh(3)).expect("balance"),
            Balance {
                confirmed: 4800,
                unconfirmed: 0
            }
        );
        let history = view.history(&sh(3)).expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].txid, child.txid());
        assert_eq!(history[0].height, 1);
        // Paid by the parent and spent by the child: each listed once, in block order.
        let history = view.history(&sh(2)).expect("history");
        let txids: Vec<_> = history.iter().map(|entry| entry.txid).collect();
        assert_eq!(txids, vec![parent.txid(), child.txid()]);
        assert!(history.iter().all(|entry| entry.height == 1));
        drop(view);

        let pending = tracker.take_pending().expect("pending");
        assert!(pending.tip_changed);
        assert!(pending.touched.contains(&sh(1)));
        assert!(pending.touched.contains(&sh(3)));

        // A stale daemon snapshot listing the confirmed txs must not re-add them.
        let delta = tracker.refresh(&daemon).expect("refresh");
        assert!(delta.added.is_empty());
        assert!(tracker.view().expect("view").state().is_empty());
    }

    #[test]
    fn confirmed_conflict_evicts_descendants() {
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(Tracker::new(ChainQuery::new(Arc::clone(&store))));
        let mut indexer = gated_indexer(&store, &tracker);
        let mut chain: Vec<TestBlock> = Vec::new();
        let funding = coinbase(0, 1, 5000);
        apply(&mut indexer, extend(&mut chain, &[funding.clone()]));

        let funding_out = OutPoint::new(funding.txid(), 0);
        let ours = spend(&[funding_out], &[(2, 4900)]);
        let ours_child = spend(&[OutPoint::new(ours.txid(), 0)], &[(3, 4800)]);
        let daemon = FakeDaemon {
            txs: vec![ours.clone(), ours_child.clone()],
        };
        tracker.refresh(&daemon).expect("refresh");
        assert_eq!(tracker.size().expect("size").0, 2);

        let rival = spend(&[funding_out], &[(4, 4950)]);
        apply(&mut indexer, extend(&mut chain, &[coinbase(1, 9, 50), rival]));
        let view = tracker.view().expect("view");
        assert!(view.state().is_empty());
        assert_eq!(view.balance(&sh(3)).expect("balance"), Balance::default());
        assert_eq!(view.balance(&sh(4)).expect("balance").confirmed, 4950);
    }

    #[test]
    fn rollback_clears_pool_for_refetch() {
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(Tracker::new(ChainQuery::new(Arc::clone(&store))));
        let mut indexer = gated_indexer(&store, &tracker);
        let mut chain: Vec<TestBlock> = Vec::new();
        let funding = coinbase(0, 1, 5000);
        apply(&mut indexer, extend(&mut chain, &[funding.clone()]));
        apply(&mut indexer, extend(&mut chain, &[coinbase(1, 9, 50)]));

        let pending_tx = spend(&[OutPoint::new(funding.txid(), 0)], &[(2, 4900)]);
        let daemon = FakeDaemon {
            txs: vec![pending_tx.clone()],
        };
        tracker.refresh(&daemon).expect("refresh");
        tracker.take_pending().expect("pending");

        indexer.rollback_tip().expect("rollback");
        assert_eq!(tracker.size().expect("size"), (0, 0));
        let pending = tracker.take_pending().expect("pending");
        assert!(pending.tip_changed);
        assert!(pending.touched.contains(&sh(2)));
        assert!(pending.touched.contains(&sh(9)));

        let delta = tracker.refresh(&daemon).expect("refresh");
        assert_eq!(delta.added, vec![pending_tx.txid()]);
    }
}
