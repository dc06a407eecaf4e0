use pepexd_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

#[allow(unused_macros)]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Trace, $($arg)*);
    }};
}

mod admin;
mod config;
mod daemon;
mod electrum;
mod fee_estimator;
mod mempool;
mod stats;
#[cfg(test)]
mod testutil;
mod verify;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use pepexd_chainstate::index::ChainIndex;
use pepexd_chainstate::{
    ChainQuery, ChainSource, CommitGate, Indexer, IndexerConfig, IndexerState, SyncProgress,
};
use pepexd_consensus::constants::DEFAULT_ADMIN_PORT;
use pepexd_consensus::hash256_to_hex;
use pepexd_consensus::params::{chain_params, Network};
use pepexd_pow::{HashSelector, NativeBackend};
use pepexd_storage::cache::CachedStore;
use pepexd_storage::fjall::{FjallOptions, FjallStats, FjallStore};
use pepexd_storage::memory::MemoryStore;
use pepexd_storage::{Column, KeyValueStore, PrefixVisitor, StoreError, WriteBatch};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};

use crate::admin::{AdminContext, CacheReport};
use crate::config::{next_value, parse_args, usage, Backend, CliAction, Config};
use crate::daemon::{Backoff, DaemonClient};
use crate::electrum::{publish_pending, ElectrumContext, Notification};
use crate::mempool::Tracker;
use crate::stats::NodeStats;
use crate::verify::{parse_verify_args, run_verify, VerifyAction};

const NOTIFICATION_CAPACITY: usize = 1024;
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);
const CLI_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl Store {
    fn fjall_stats(&self) -> Option<FjallStats> {
        match self {
            Store::Fjall(store) => Some(store.stats()),
            Store::Memory(_) => None,
        }
    }
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.put(column, key, value),
            Store::Fjall(store) => store.put(column, key, value),
        }
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(column, key),
            Store::Fjall(store) => store.delete(column, key),
        }
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }

    fn flush(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.flush(),
            Store::Fjall(store) => store.flush(),
        }
    }
}

pub(crate) fn open_store(
    backend: Backend,
    db_path: &Path,
    cache_bytes: Option<u64>,
) -> Result<Store, String> {
    match backend {
        Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
        Backend::Fjall => {
            fs::create_dir_all(db_path).map_err(|err| {
                format!("failed to create db dir {}: {err}", db_path.display())
            })?;
            let options = FjallOptions {
                cache_bytes,
                ..FjallOptions::default()
            };
            let store = FjallStore::open_with_options(db_path, options)
                .map_err(|err| format!("failed to open {}: {err}", db_path.display()))?;
            Ok(Store::Fjall(store))
        }
    }
}

pub fn parse_hex_bytes(value: &str) -> Option<Vec<u8>> {
    let mut hex = value.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.len() % 2 == 1 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    let mut iter = hex.as_bytes().iter().copied();
    while let (Some(high), Some(low)) = (iter.next(), iter.next()) {
        let high = (high as char).to_digit(16)? as u8;
        let low = (low as char).to_digit(16)? as u8;
        bytes.push(high << 4 | low);
    }
    Some(bytes)
}

pub fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len().saturating_mul(2));
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Sleeps in short slices so a shutdown request is noticed promptly.
fn pause(shutdown: &watch::Receiver<bool>, duration: Duration) {
    let mut remaining = duration;
    while !remaining.is_zero() && !*shutdown.borrow() {
        let slice = remaining.min(SHUTDOWN_POLL);
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}

#[derive(Debug, PartialEq)]
enum IndexerPass {
    Progressed(SyncProgress),
    Idle,
    Retry(Duration),
    Stop,
}

fn indexer_pass<S: KeyValueStore>(
    indexer: &mut Indexer<S>,
    source: &dyn ChainSource,
    stats: &NodeStats,
    backoff: &mut Backoff,
) -> IndexerPass {
    let progress = match indexer.sync_step(source) {
        Ok(progress) => progress,
        Err(err) if err.is_fatal() => {
            log_error!("Indexing stopped: {err}");
            stats.record_indexer_error(err.to_string());
            return IndexerPass::Stop;
        }
        Err(err) => {
            let failures = stats.record_daemon_failure();
            let delay = backoff.next_delay();
            log_warn!("Daemon unavailable ({failures} in a row): {err}; retrying in {delay:?}");
            return IndexerPass::Retry(delay);
        }
    };

    backoff.reset();
    stats.record_daemon_height(progress.daemon_height);
    stats.record_tip(indexer.tip());
    stats.record_indexer_state(indexer.state());
    if progress.rolled_back > 0 {
        log_warn!("Reorg: rolled back {} blocks", progress.rolled_back);
    }
    if progress.applied == 0 && progress.rolled_back == 0 {
        return IndexerPass::Idle;
    }
    if let Some(tip) = indexer.tip() {
        log_info!(
            "Indexed to height {} of {} ({})",
            tip.height,
            progress.daemon_height,
            indexer.state().as_str()
        );
    }
    if let Err(err) = indexer.prune_raw_blocks() {
        log_error!("Indexing stopped: {err}");
        stats.record_indexer_error(err.to_string());
        return IndexerPass::Stop;
    }
    IndexerPass::Progressed(progress)
}

fn run_indexer_loop<S: KeyValueStore>(
    mut indexer: Indexer<S>,
    daemon: Arc<DaemonClient>,
    stats: Arc<NodeStats>,
    events: Sender<SyncProgress>,
    poll: Duration,
    shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::default();
    while !*shutdown.borrow() {
        match indexer_pass(&mut indexer, daemon.as_ref(), &stats, &mut backoff) {
            IndexerPass::Progressed(progress) => {
                // A full channel already holds a wake-up for the mempool loop.
                if let Err(TrySendError::Disconnected(_)) = events.try_send(progress) {
                    return;
                }
                if indexer.state() == IndexerState::Synced {
                    pause(&shutdown, poll);
                }
            }
            IndexerPass::Idle => pause(&shutdown, poll),
            IndexerPass::Retry(delay) => pause(&shutdown, delay),
            IndexerPass::Stop => return,
        }
    }
}

/// While catching up most of the pool spends outputs not indexed yet. Once indexing
/// has stopped for good the tip is frozen, so the pool is refreshed against it.
fn mempool_refresh_due(stats: &NodeStats) -> bool {
    !stats.is_behind() || stats.indexer_error().is_some()
}

fn run_mempool_loop<S: KeyValueStore>(
    tracker: Arc<Tracker<S>>,
    daemon: Arc<DaemonClient>,
    stats: Arc<NodeStats>,
    notifications: broadcast::Sender<Notification>,
    events: Receiver<SyncProgress>,
    poll: Duration,
    shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        match events.recv_timeout(poll) {
            Ok(progress) => log_debug!(
                "mempool woken by indexer: {} applied, {} rolled back",
                progress.applied,
                progress.rolled_back
            ),
            Err(RecvTimeoutError::Timeout) => {}
            // Indexing stopped; keep the pool fresh for the tip we still serve.
            Err(RecvTimeoutError::Disconnected) => pause(&shutdown, poll),
        }

        if mempool_refresh_due(&stats) {
            match tracker.refresh(daemon.as_ref()) {
                Ok(delta) if !delta.is_empty() => {
                    log_debug!(
                        "mempool: {} added, {} removed, {} scripts touched",
                        delta.added.len(),
                        delta.removed.len(),
                        delta.touched.len()
                    );
                }
                Ok(_) => {}
                Err(err) => log_warn!("Mempool refresh failed: {err}"),
            }
        }

        match tracker.size() {
            Ok((txs, bytes)) => stats.record_mempool(txs, bytes),
            Err(err) => log_warn!("Mempool size unavailable: {err}"),
        }
        match publish_pending(&tracker, &notifications) {
            Ok(0) => {}
            Ok(changed) => log_trace!("published {changed} script hash changes"),
            Err(err) => log_warn!("Failed to publish notifications: {err}"),
        }
    }
}

fn spawn_named<F>(name: &str, body: F) -> Result<thread::JoinHandle<()>, String>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|err| format!("failed to spawn {name} thread: {err}"))
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    log_warn!("failed to install SIGTERM handler: {err}");
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        log_info!("Signal received; requesting shutdown.");
        let _ = shutdown_tx.send(true);
    });
}

pub async fn run_entry() -> Result<(), String> {
    let config = match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            return Ok(());
        }
        CliAction::PrintVersion => {
            println!("pepexd {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        CliAction::Run(config) => config,
    };
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
        ..logging::LogConfig::default()
    });
    run_node(config).await
}

async fn run_node(config: Config) -> Result<(), String> {
    let params = chain_params(Network::Mainnet);
    log_info!(
        "pepexd {} starting ({} backend, data dir {})",
        env!("CARGO_PKG_VERSION"),
        config.backend.as_str(),
        config.data_dir.display()
    );

    // Fail before touching the index when the legacy hash libraries are missing.
    let legacy = NativeBackend::load(config.hash_lib_dir.as_deref())
        .map_err(|err| format!("hash backend: {err}"))?;
    let selector = HashSelector::new(config.cutover_height, Arc::new(legacy));

    let store = open_store(
        config.backend,
        &config.db_path(),
        Some(config.db_cache_bytes),
    )?;
    if config.reindex {
        let removed = ChainIndex::new(&store)
            .wipe()
            .map_err(|err| format!("reindex wipe failed: {err}"))?;
        log_warn!("--reindex: removed {removed} records; rebuilding from genesis");
    }
    let store = Arc::new(CachedStore::new(store, config.cache));

    let tracker = Arc::new(Tracker::new(ChainQuery::new(Arc::clone(&store))));
    let indexer_config = IndexerConfig {
        expected_genesis: Some(params.hash_genesis_block),
        ..IndexerConfig::new(config.reorg_limit)
    };
    let indexer = Indexer::open(Arc::clone(&store), selector, indexer_config)
        .map_err(|err| err.to_string())?
        .with_commit_gate(Arc::clone(&tracker) as Arc<dyn CommitGate>);

    let stats = Arc::new(NodeStats::default());
    stats.record_tip(indexer.tip());
    match indexer.tip() {
        Some(tip) => log_info!(
            "Index tip {} at height {}",
            hash256_to_hex(&tip.hash),
            tip.height
        ),
        None => log_info!("Index is empty; syncing from genesis"),
    }

    let electrum_listener = TcpListener::bind(config.electrum_addr)
        .await
        .map_err(|err| format!("failed to bind {}: {err}", config.electrum_addr))?;
    let admin_listener = TcpListener::bind(config.admin_addr)
        .await
        .map_err(|err| format!("failed to bind {}: {err}", config.admin_addr))?;
    if !config.admin_addr.ip().is_loopback() {
        log_warn!(
            "Admin endpoint bound to non-loopback address {}",
            config.admin_addr
        );
    }

    let daemon = Arc::new(DaemonClient::new(&config.daemon));
    let (notify_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = bounded(1);
    let poll = Duration::from_millis(config.poll_ms);

    let mut workers = Vec::new();
    {
        let daemon = Arc::clone(&daemon);
        let stats = Arc::clone(&stats);
        let shutdown = shutdown_rx.clone();
        workers.push(spawn_named("indexer", move || {
            run_indexer_loop(indexer, daemon, stats, event_tx, poll, shutdown)
        })?);
    }
    {
        let tracker = Arc::clone(&tracker);
        let daemon = Arc::clone(&daemon);
        let stats = Arc::clone(&stats);
        let notify_tx = notify_tx.clone();
        let shutdown = shutdown_rx.clone();
        workers.push(spawn_named("mempool", move || {
            run_mempool_loop(tracker, daemon, stats, notify_tx, event_rx, poll, shutdown)
        })?);
    }

    let electrum_ctx = Arc::new(ElectrumContext {
        tracker,
        daemon,
        stats: Arc::clone(&stats),
        notifications: notify_tx,
        request_timeout: Duration::from_secs(config.request_timeout_secs),
        max_sessions: config.max_sessions,
        genesis_hash: params.hash_genesis_block,
    });
    let electrum_task = tokio::spawn(electrum::serve(
        electrum_listener,
        electrum_ctx,
        shutdown_rx.clone(),
    ));
    let admin_ctx = Arc::new(AdminContext {
        stats,
        cache: Arc::clone(&store) as Arc<dyn CacheReport>,
    });
    let admin_task = tokio::spawn(admin::serve_admin(
        admin_listener,
        admin_ctx,
        shutdown_rx.clone(),
    ));

    spawn_signal_handler(shutdown_tx);
    let mut shutdown_wait = shutdown_rx;
    while !*shutdown_wait.borrow() {
        if shutdown_wait.changed().await.is_err() {
            break;
        }
    }

    log_info!("Shutting down");
    for (name, task) in [("electrum", electrum_task), ("admin", admin_task)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log_warn!("{name} server stopped with error: {err}"),
            Err(err) => log_warn!("{name} server task failed: {err}"),
        }
    }
    // A rollback in progress finishes before its thread observes the flag.
    let joined = tokio::task::spawn_blocking(move || {
        for worker in workers {
            if worker.join().is_err() {
                log_error!("worker thread panicked");
            }
        }
    })
    .await;
    if let Err(err) = joined {
        log_warn!("failed to join worker threads: {err}");
    }

    store
        .flush()
        .map_err(|err| format!("final flush failed: {err}"))?;
    if let Some(fjall) = store.inner().fjall_stats() {
        log_info!(
            "Store closed: {} bytes on disk, {} commits",
            fjall.disk_space_bytes,
            fjall.commits
        );
    }
    log_info!("Shutdown complete");
    Ok(())
}

#[derive(Debug, PartialEq)]
enum AdminCommand {
    GetInfo { admin: String },
    PrintHelp,
}

fn parse_cli_args<I>(raw_args: I) -> Result<AdminCommand, String>
where
    I: IntoIterator<Item = String>,
{
    let mut admin = format!("127.0.0.1:{DEFAULT_ADMIN_PORT}");
    let mut command: Option<String> = None;
    let mut args = raw_args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" | "help" => return Ok(AdminCommand::PrintHelp),
            "--admin" => admin = next_value(&mut args, &arg)?,
            other if command.is_none() && !other.starts_with('-') => {
                command = Some(other.to_string());
            }
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }
    match command.as_deref() {
        None | Some("getinfo") => Ok(AdminCommand::GetInfo { admin }),
        Some(other) => Err(format!("unknown command '{other}'\n{}", usage())),
    }
}

pub async fn run_cli_entry() -> Result<(), String> {
    let admin = match parse_cli_args(std::env::args().skip(1))? {
        AdminCommand::PrintHelp => {
            println!("{}", usage());
            return Ok(());
        }
        AdminCommand::GetInfo { admin } => admin,
    };
    let info = admin::request_info(&admin, CLI_TIMEOUT).await?;
    let text = serde_json::to_string_pretty(&info).map_err(|err| err.to_string())?;
    println!("{text}");
    Ok(())
}

/// Returns whether every sampled height matched.
pub fn run_verify_entry() -> Result<bool, String> {
    let config = match parse_verify_args(std::env::args().skip(1))? {
        VerifyAction::PrintHelp => {
            println!("{}", usage());
            return Ok(true);
        }
        VerifyAction::Run(config) => config,
    };
    logging::init(logging::LogConfig::default());
    let summary = run_verify(&config)?;
    let text = serde_json::to_string_pretty(&summary).map_err(|err| err.to_string())?;
    println!("{text}");
    Ok(summary.all_match)
}
