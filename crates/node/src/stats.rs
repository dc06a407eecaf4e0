//! Shared runtime counters read by the admin `getinfo` surface.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use pepexd_chainstate::{ChainTip, IndexerState};
use pepexd_consensus::hash256_to_hex;
use pepexd_storage::cache::CacheStats;
use serde::Serialize;

const NO_HEIGHT: u64 = u64::MAX;

/// Updated by the indexer, mempool and session tasks; read without locks.
pub struct NodeStats {
    started: Instant,
    db_height: AtomicU64,
    db_tip: Mutex<Option<String>>,
    daemon_height: AtomicU64,
    indexer_state: AtomicU8,
    behind: AtomicBool,
    indexer_error: Mutex<Option<String>>,
    sessions: AtomicUsize,
    subscriptions: AtomicUsize,
    mempool_txs: AtomicUsize,
    mempool_bytes: AtomicUsize,
    notifications: AtomicU64,
    daemon_failures: AtomicU32,
}

impl Default for NodeStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            db_height: AtomicU64::new(NO_HEIGHT),
            db_tip: Mutex::new(None),
            daemon_height: AtomicU64::new(NO_HEIGHT),
            indexer_state: AtomicU8::new(state_code(IndexerState::CatchingUp)),
            behind: AtomicBool::new(true),
            indexer_error: Mutex::new(None),
            sessions: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
            mempool_txs: AtomicUsize::new(0),
            mempool_bytes: AtomicUsize::new(0),
            notifications: AtomicU64::new(0),
            daemon_failures: AtomicU32::new(0),
        }
    }
}

fn state_code(state: IndexerState) -> u8 {
    match state {
        IndexerState::CatchingUp => 0,
        IndexerState::Synced => 1,
        IndexerState::Reorging => 2,
    }
}

fn state_from_code(code: u8) -> IndexerState {
    match code {
        1 => IndexerState::Synced,
        2 => IndexerState::Reorging,
        _ => IndexerState::CatchingUp,
    }
}

fn load_height(value: &AtomicU64) -> Option<u32> {
    match value.load(Ordering::Relaxed) {
        NO_HEIGHT => None,
        height => u32::try_from(height).ok(),
    }
}

impl NodeStats {
    pub fn record_tip(&self, tip: Option<ChainTip>) {
        let height = tip.map_or(NO_HEIGHT, |tip| u64::from(tip.height));
        self.db_height.store(height, Ordering::Relaxed);
        if let Ok(mut guard) = self.db_tip.lock() {
            *guard = tip.map(|tip| hash256_to_hex(&tip.hash));
        }
    }

    pub fn record_daemon_height(&self, height: u32) {
        self.daemon_height
            .store(u64::from(height), Ordering::Relaxed);
        self.daemon_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_indexer_state(&self, state: IndexerState) {
        self.indexer_state.store(state_code(state), Ordering::Relaxed);
        self.behind
            .store(state != IndexerState::Synced, Ordering::Relaxed);
    }

    pub fn is_behind(&self) -> bool {
        self.behind.load(Ordering::Relaxed)
    }

    /// A transient daemon failure; the index is serving possibly stale data.
    pub fn record_daemon_failure(&self) -> u32 {
        self.behind.store(true, Ordering::Relaxed);
        self.daemon_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Indexing stopped for good; queries keep serving the last consistent tip.
    pub fn record_indexer_error(&self, message: String) {
        self.behind.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.indexer_error.lock() {
            *guard = Some(message);
        }
    }

    pub fn indexer_error(&self) -> Option<String> {
        self.indexer_error
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    pub fn record_mempool(&self, txs: usize, bytes: usize) {
        self.mempool_txs.store(txs, Ordering::Relaxed);
        self.mempool_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn session_opened(&self) -> usize {
        self.sessions.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn session_closed(&self, subscriptions: usize) {
        self.sessions.fetch_sub(1, Ordering::Relaxed);
        self.subscriptions
            .fetch_sub(subscriptions, Ordering::Relaxed);
    }

    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }

    pub fn subscribed(&self) {
        self.subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unsubscribed(&self) {
        self.subscriptions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_notifications(&self, sent: u64) {
        self.notifications.fetch_add(sent, Ordering::Relaxed);
    }

    pub fn snapshot(&self, cache: Option<CacheStats>) -> InfoSnapshot {
        let alerts = pepexd_log::alerts_snapshot(ALERTS_IN_INFO)
            .into_iter()
            .map(|alert| AlertView {
                ts_ms: alert.ts_ms,
                level: alert.level.as_str(),
                target: alert.target,
                msg: alert.msg,
            })
            .collect();
        InfoSnapshot {
            db_height: load_height(&self.db_height),
            db_tip: self.db_tip.lock().ok().and_then(|guard| guard.clone()),
            daemon_height: load_height(&self.daemon_height),
            indexer_state: state_from_code(self.indexer_state.load(Ordering::Relaxed)).as_str(),
            sessions: self.sessions.load(Ordering::Relaxed),
            subs: self.subscriptions.load(Ordering::Relaxed),
            mempool_txs: self.mempool_txs.load(Ordering::Relaxed),
            mempool_bytes: self.mempool_bytes.load(Ordering::Relaxed),
            cache: cache.map(CacheView::from),
            behind: self.behind.load(Ordering::Relaxed),
            indexer_error: self.indexer_error(),
            daemon_failures: self.daemon_failures.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            alerts,
            alert_total: pepexd_log::alert_total(),
            uptime_secs: self.started.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

const ALERTS_IN_INFO: usize = 16;

#[derive(Clone, Debug, Serialize)]
pub struct CacheView {
    pub point_hits: u64,
    pub point_misses: u64,
    pub page_hits: u64,
    pub page_misses: u64,
    pub invalidations: u64,
    pub point_len: usize,
    pub page_len: usize,
}

impl From<CacheStats> for CacheView {
    fn from(stats: CacheStats) -> Self {
        Self {
            point_hits: stats.point_hits,
            point_misses: stats.point_misses,
            page_hits: stats.page_hits,
            page_misses: stats.page_misses,
            invalidations: stats.invalidations,
            point_len: stats.point_len,
            page_len: stats.page_len,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AlertView {
    pub ts_ms: u64,
    pub level: &'static str,
    pub target: &'static str,
    pub msg: String,
}

/// The `getinfo` result. Field names follow the admin protocol.
#[derive(Clone, Debug, Serialize)]
pub struct InfoSnapshot {
    #[serde(rename = "db height")]
    pub db_height: Option<u32>,
    #[serde(rename = "db tip")]
    pub db_tip: Option<String>,
    #[serde(rename = "daemon height")]
    pub daemon_height: Option<u32>,
    #[serde(rename = "indexer state")]
    pub indexer_state: &'static str,
    pub sessions: usize,
    pub subs: usize,
    #[serde(rename = "mempool txs")]
    pub mempool_txs: usize,
    #[serde(rename = "mempool bytes")]
    pub mempool_bytes: usize,
    pub cache: Option<CacheView>,
    pub behind: bool,
    #[serde(rename = "indexer error")]
    pub indexer_error: Option<String>,
    #[serde(rename = "daemon failures")]
    pub daemon_failures: u32,
    pub notifications: u64,
    pub alerts: Vec<AlertView>,
    #[serde(rename = "alert total")]
    pub alert_total: u64,
    #[serde(rename = "uptime secs")]
    pub uptime_secs: u64,
    pub version: &'static str,
}
