//! Read-through cache in front of a [`KeyValueStore`].
//!
//! Point lookups on `Utxo` and `TxOut` and 32-byte script-hash scans on
//! `History` and `AddressUtxo` are cached. Every write goes through the
//! commit gate, which excludes readers while the inner batch lands and the
//! touched entries are evicted, so a reader never fills the cache with a
//! value older than the last commit.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

const PAGE_PREFIX_LEN: usize = 32;

#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    pub point_entries: usize,
    pub page_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            point_entries: 200_000,
            page_entries: 20_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub point_hits: u64,
    pub point_misses: u64,
    pub page_hits: u64,
    pub page_misses: u64,
    pub invalidations: u64,
    pub point_len: usize,
    pub page_len: usize,
}

fn point_cached(column: Column) -> bool {
    matches!(column, Column::Utxo | Column::TxOut)
}

fn page_cached(column: Column) -> bool {
    matches!(column, Column::History | Column::AddressUtxo)
}

struct Lru<K, V> {
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
    order: VecDeque<(K, u64)>,
    next_stamp: u64,
}

impl<K: Clone + Eq + Hash, V: Clone> Lru<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_stamp: 0,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn bump_stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp = self.next_stamp.wrapping_add(1);
        stamp
    }

    fn get(&mut self, key: &K) -> Option<V> {
        let stamp = self.bump_stamp();
        let (value, entry_stamp) = self.entries.get_mut(key)?;
        *entry_stamp = stamp;
        let value = value.clone();
        self.order.push_back((key.clone(), stamp));
        self.compact();
        Some(value)
    }

    fn insert(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        let stamp = self.bump_stamp();
        self.entries.insert(key.clone(), (value, stamp));
        self.order.push_back((key, stamp));
        self.evict();
        self.compact();
    }

    fn remove(&mut self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| keep(key));
        before - self.entries.len()
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            let Some((key, stamp)) = self.order.pop_front() else {
                break;
            };
            let current = self.entries.get(&key).map(|(_, entry_stamp)| *entry_stamp);
            if current == Some(stamp) {
                self.entries.remove(&key);
            }
        }
    }

    // Stale order entries pile up on every hit; rebuild once they dominate.
    fn compact(&mut self) {
        if self.order.len() <= self.entries.len().saturating_mul(2).max(64) {
            return;
        }
        let entries = &self.entries;
        self.order.retain(|(key, stamp)| {
            entries
                .get(key)
                .is_some_and(|(_, entry_stamp)| entry_stamp == stamp)
        });
    }
}

type PointKey = (Column, Vec<u8>);
type PageKey = (Column, [u8; PAGE_PREFIX_LEN]);

struct CacheState {
    points: Lru<PointKey, Option<Vec<u8>>>,
    pages: Lru<PageKey, Arc<ScanResult>>,
}

pub struct CachedStore<S> {
    inner: S,
    gate: RwLock<()>,
    state: Mutex<CacheState>,
    point_hits: AtomicU64,
    point_misses: AtomicU64,
    page_hits: AtomicU64,
    page_misses: AtomicU64,
    invalidations: AtomicU64,
}

impl<S: KeyValueStore> CachedStore<S> {
    pub fn new(inner: S, config: CacheConfig) -> Self {
        Self {
            inner,
            gate: RwLock::new(()),
            state: Mutex::new(CacheState {
                points: Lru::new(config.point_entries),
                pages: Lru::new(config.page_entries),
            }),
            point_hits: AtomicU64::new(0),
            point_misses: AtomicU64::new(0),
            page_hits: AtomicU64::new(0),
            page_misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn stats(&self) -> CacheStats {
        let (point_len, page_len) = match self.state.lock() {
            Ok(state) => (state.points.len(), state.pages.len()),
            Err(_) => (0, 0),
        };
        CacheStats {
            point_hits: self.point_hits.load(Ordering::Relaxed),
            point_misses: self.point_misses.load(Ordering::Relaxed),
            page_hits: self.page_hits.load(Ordering::Relaxed),
            page_misses: self.page_misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            point_len,
            page_len,
        }
    }

    /// Drops every cached entry. Used after bulk column wipes.
    pub fn clear(&self) -> Result<(), StoreError> {
        let _gate = self.write_gate()?;
        let mut state = self.lock_state()?;
        let removed = state.points.retain(|_| false) + state.pages.retain(|_| false);
        self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
        Ok(())
    }

    fn read_gate(&self) -> Result<RwLockReadGuard<'_, ()>, StoreError> {
        self.gate
            .read()
            .map_err(|_| StoreError::LockPoisoned("cache gate"))
    }

    fn write_gate(&self) -> Result<RwLockWriteGuard<'_, ()>, StoreError> {
        self.gate
            .write()
            .map_err(|_| StoreError::LockPoisoned("cache gate"))
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, CacheState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::LockPoisoned("cache state"))
    }

    fn cached_page(
        &self,
        column: Column,
        prefix: [u8; PAGE_PREFIX_LEN],
    ) -> Result<Arc<ScanResult>, StoreError> {
        let key = (column, prefix);
        if let Some(page) = self.lock_state()?.pages.get(&key) {
            self.page_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(page);
        }
        self.page_misses.fetch_add(1, Ordering::Relaxed);
        let page = Arc::new(self.inner.scan_prefix(column, &prefix)?);
        self.lock_state()?.pages.insert(key, page.clone());
        Ok(page)
    }

    fn invalidate<'k>(
        &self,
        touched: impl IntoIterator<Item = (Column, &'k [u8])>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock_state()?;
        let mut removed = 0u64;
        for (column, key) in touched {
            if point_cached(column) && state.points.remove(&(column, key.to_vec())) {
                removed += 1;
            }
            if page_cached(column) && key.len() >= PAGE_PREFIX_LEN {
                let mut prefix = [0u8; PAGE_PREFIX_LEN];
                prefix.copy_from_slice(&key[..PAGE_PREFIX_LEN]);
                if state.pages.remove(&(column, prefix)) {
                    removed += 1;
                }
            }
        }
        self.invalidations.fetch_add(removed, Ordering::Relaxed);
        Ok(())
    }
}

fn page_prefix(column: Column, prefix: &[u8]) -> Option<[u8; PAGE_PREFIX_LEN]> {
    if !page_cached(column) {
        return None;
    }
    prefix.try_into().ok()
}

impl<S: KeyValueStore> KeyValueStore for CachedStore<S> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let _gate = self.read_gate()?;
        if !point_cached(column) {
            return self.inner.get(column, key);
        }
        let cache_key = (column, key.to_vec());
        if let Some(value) = self.lock_state()?.points.get(&cache_key) {
            self.point_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        self.point_misses.fetch_add(1, Ordering::Relaxed);
        let value = self.inner.get(column, key)?;
        self.lock_state()?.points.insert(cache_key, value.clone());
        Ok(value)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let _gate = self.write_gate()?;
        self.inner.put(column, key, value)?;
        self.invalidate([(column, key)])
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let _gate = self.write_gate()?;
        self.inner.delete(column, key)?;
        self.invalidate([(column, key)])
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let _gate = self.read_gate()?;
        match page_prefix(column, prefix) {
            Some(prefix) => Ok(self.cached_page(column, prefix)?.as_ref().clone()),
            None => self.inner.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let _gate = self.read_gate()?;
        match page_prefix(column, prefix) {
            Some(prefix) => {
                let page = self.cached_page(column, prefix)?;
                for (key, value) in page.iter() {
                    visitor(key, value)?;
                }
                Ok(())
            }
            None => self.inner.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let _gate = self.write_gate()?;
        self.inner.write_batch(batch)?;
        self.invalidate(batch.iter().map(|op| match op {
            WriteOp::Put { column, key, .. } => (*column, key.as_slice()),
            WriteOp::Delete { column, key } => (*column, key.as_slice()),
        }))
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[test]
    fn lru_evicts_least_recently_used() {
        let mut lru: Lru<u32, u32> = Lru::new(2);
        lru.insert(1, 10);
        lru.insert(2, 20);
        assert_eq!(lru.get(&1), Some(10));
        lru.insert(3, 30);
        assert_eq!(lru.get(&2), None);
        assert_eq!(lru.get(&1), Some(10));
        assert_eq!(lru.get(&3), Some(30));
    }

    #[test]
    fn lru_order_queue_stays_bounded() {
        let mut lru: Lru<u32, u32> = Lru::new(4);
        for key in 0..4 {
            lru.insert(key, key);
        }
        for _ in 0..10_000 {
            assert_eq!(lru.get(&0), Some(0));
        }
        assert!(lru.order.len() <= 64);
    }

    #[test]
    fn point_lookup_hits_after_first_read() {
        let store = CachedStore::new(MemoryStore::new(), CacheConfig::default());
        store.put(Column::Utxo, b"op", b"coin").expect("put");
        assert_eq!(store.get(Column::Utxo, b"op").expect("get"), Some(b"coin".to_vec()));
        assert_eq!(store.get(Column::Utxo, b"op").expect("get"), Some(b"coin".to_vec()));
        let stats = store.stats();
        assert_eq!(stats.point_misses, 1);
        assert_eq!(stats.point_hits, 1);
    }

    #[test]
    fn batch_commit_invalidates_cached_miss() {
        let store = CachedStore::new(MemoryStore::new(), CacheConfig::default());
        assert_eq!(store.get(Column::Utxo, b"op").expect("get"), None);
        let mut batch = WriteBatch::new();
        batch.put(Column::Utxo, b"op", b"coin");
        store.write_batch(&batch).expect("commit");
        assert_eq!(store.get(Column::Utxo, b"op").expect("get"), Some(b"coin".to_vec()));
    }

    #[test]
    fn page_cache_tracks_script_hash_writes() {
        let store = CachedStore::new(MemoryStore::new(), CacheConfig::default());
        let sh = [7u8; 32];
        let mut first = sh.to_vec();
        first.extend_from_slice(&[0, 0, 0, 1]);
        store.put(Column::History, &first, b"a").expect("put");
        assert_eq!(store.scan_prefix(Column::History, &sh).expect("scan").len(), 1);

        let mut second = sh.to_vec();
        second.extend_from_slice(&[0, 0, 0, 2]);
        let mut batch = WriteBatch::new();
        batch.put(Column::History, second.clone(), b"b".as_slice());
        store.write_batch(&batch).expect("commit");

        let rows = store.scan_prefix(Column::History, &sh).expect("scan");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].0, second);

        let mut visited = 0;
        store
            .for_each_prefix(Column::History, &sh, &mut |_, _| {
                visited += 1;
                Ok(())
            })
            .expect("visit");
        assert_eq!(visited, 2);
        assert!(store.stats().page_hits >= 1);
    }

    #[test]
    fn other_prefix_lengths_bypass_page_cache() {
        let store = CachedStore::new(MemoryStore::new(), CacheConfig::default());
        store.put(Column::History, &[1u8; 40], b"x").expect("put");
        assert_eq!(store.scan_prefix(Column::History, &[1u8; 4]).expect("scan").len(), 1);
        let stats = store.stats();
        assert_eq!(stats.page_hits + stats.page_misses, 0);
    }
}
