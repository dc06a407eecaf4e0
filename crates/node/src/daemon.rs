//! Blocking JSON-RPC client for the coin daemon.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use base64::Engine;
use pepexd_chainstate::{ChainSource, SourceError};
use pepexd_consensus::{hash256_from_hex, hash256_to_hex, Hash256};
use pepexd_primitives::hash::sha256d;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{hex_encode, parse_hex_bytes};

const BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(8);
const RECENT_BROADCAST_TTL: Duration = Duration::from_secs(600);
const RECENT_BROADCAST_MAX: usize = 1024;
const MAX_ERROR_BODY: usize = 256;

pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
pub const RPC_INVALID_PARAMETER: i64 = -8;
pub const RPC_METHOD_NOT_FOUND: i64 = -32601;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

#[derive(Debug)]
pub enum DaemonError {
    Transport(String),
    Http { status: i32, body: String },
    Rpc { code: i64, message: String },
    InvalidResponse(String),
}

impl DaemonError {
    /// Worth retrying: the request may not have reached the daemon.
    pub fn is_transient(&self) -> bool {
        matches!(self, DaemonError::Transport(_) | DaemonError::Http { .. })
    }

    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            DaemonError::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonError::Transport(message) => write!(f, "daemon unreachable: {message}"),
            DaemonError::Http { status, body } => write!(f, "daemon http {status}: {body}"),
            DaemonError::Rpc { code, message } => write!(f, "daemon error {code}: {message}"),
            DaemonError::InvalidResponse(message) => {
                write!(f, "invalid daemon response: {message}")
            }
        }
    }
}

impl std::error::Error for DaemonError {}

impl From<DaemonError> for SourceError {
    fn from(err: DaemonError) -> Self {
        SourceError(err.to_string())
    }
}

/// Exponential retry delay: 250ms doubling up to 8s.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    initial: Duration,
    next: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            next: initial,
            cap,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_INITIAL, BACKOFF_CAP)
    }
}

/// One HTTP POST of a JSON body, returning the status code and response text.
pub trait RpcTransport: Send + Sync {
    fn post(&self, body: &str) -> Result<(i32, String), DaemonError>;
}

struct HttpTransport {
    url: String,
    auth: Option<String>,
    timeout_secs: u64,
}

impl RpcTransport for HttpTransport {
    fn post(&self, body: &str) -> Result<(i32, String), DaemonError> {
        let mut request = minreq::post(&self.url)
            .with_header("Content-Type", "application/json")
            .with_body(body.to_string())
            .with_timeout(self.timeout_secs);
        if let Some(auth) = &self.auth {
            request = request.with_header("Authorization", auth.clone());
        }
        let response = request
            .send()
            .map_err(|err| DaemonError::Transport(err.to_string()))?;
        let text = response
            .as_str()
            .map_err(|err| DaemonError::InvalidResponse(err.to_string()))?
            .to_string();
        Ok((response.status_code, text))
    }
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Default)]
struct RecentBroadcasts {
    entries: VecDeque<(Hash256, Instant)>,
}

impl RecentBroadcasts {
    fn contains(&mut self, txid: &Hash256, now: Instant) -> bool {
        while let Some((_, at)) = self.entries.front() {
            if now.duration_since(*at) < RECENT_BROADCAST_TTL {
                break;
            }
            self.entries.pop_front();
        }
        self.entries.iter().any(|(seen, _)| seen == txid)
    }

    fn insert(&mut self, txid: Hash256, now: Instant) {
        self.entries.push_back((txid, now));
        while self.entries.len() > RECENT_BROADCAST_MAX {
            self.entries.pop_front();
        }
    }
}

pub struct DaemonClient {
    transport: Box<dyn RpcTransport>,
    max_attempts: u32,
    backoff: Backoff,
    next_id: AtomicU64,
    broadcasts: Mutex<RecentBroadcasts>,
}

impl DaemonClient {
    pub fn new(config: &DaemonConfig) -> Self {
        let auth = config.user.as_ref().map(|user| {
            let password = config.password.as_deref().unwrap_or_default();
            let credentials = format!("{user}:{password}");
            let token = base64::engine::general_purpose::STANDARD.encode(credentials);
            format!("Basic {token}")
        });
        let transport = HttpTransport {
            url: config.url.clone(),
            auth,
            timeout_secs: config.timeout_secs.max(1),
        };
        Self::with_transport(Box::new(transport), config.max_attempts, Backoff::default())
    }

    pub fn with_transport(
        transport: Box<dyn RpcTransport>,
        max_attempts: u32,
        backoff: Backoff,
    ) -> Self {
        Self {
            transport,
            max_attempts: max_attempts.max(1),
            backoff,
            next_id: AtomicU64::new(1),
            broadcasts: Mutex::new(RecentBroadcasts::default()),
        }
    }

    /// Single attempt, no retry.
    pub fn call_once(&self, method: &str, params: Value) -> Result<Value, DaemonError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string();
        let (status, text) = self.transport.post(&body)?;
        let response: RpcResponse = match serde_json::from_str(&text) {
            Ok(response) => response,
            Err(err) if status == 200 => return Err(DaemonError::InvalidResponse(err.to_string())),
            Err(_) => {
                let mut body = text;
                body.truncate(MAX_ERROR_BODY);
                return Err(DaemonError::Http { status, body });
            }
        };
        if let Some(error) = response.error {
            return Err(DaemonError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result)
    }

    /// Retries transient failures with backoff. Only for idempotent methods.
    pub fn call(&self, method: &str, params: Value) -> Result<Value, DaemonError> {
        let mut backoff = self.backoff;
        backoff.reset();
        let mut attempt = 1;
        loop {
            match self.call_once(method, params.clone()) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = backoff.next_delay();
                    log_warn!(
                        "daemon {method} failed (attempt {attempt}/{}): {err}; retrying in {}ms",
                        self.max_attempts,
                        delay.as_millis()
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn get_block_count(&self) -> Result<u32, DaemonError> {
        let value = self.call("getblockcount", json!([]))?;
        value
            .as_u64()
            .and_then(|count| u32::try_from(count).ok())
            .ok_or_else(|| DaemonError::InvalidResponse(format!("bad block count {value}")))
    }

    pub fn get_best_block_hash(&self) -> Result<Hash256, DaemonError> {
        parse_hash(&self.call("getbestblockhash", json!([]))?)
    }

    /// `None` when the daemon has no block at `height`.
    pub fn get_block_hash(&self, height: u32) -> Result<Option<Hash256>, DaemonError> {
        match self.call("getblockhash", json!([height])) {
            Ok(value) => parse_hash(&value).map(Some),
            Err(err) if err.rpc_code() == Some(RPC_INVALID_PARAMETER) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Vec<u8>, DaemonError> {
        let value = self.call("getblock", json!([hash256_to_hex(hash), 0]))?;
        parse_hex_value(&value)
    }

    pub fn get_raw_mempool(&self) -> Result<Vec<Hash256>, DaemonError> {
        let value = self.call("getrawmempool", json!([]))?;
        let items = value
            .as_array()
            .ok_or_else(|| DaemonError::InvalidResponse("getrawmempool: not an array".into()))?;
        items.iter().map(parse_hash).collect()
    }

    /// `None` when the daemon does not know the transaction.
    pub fn get_raw_transaction(&self, txid: &Hash256) -> Result<Option<Vec<u8>>, DaemonError> {
        match self.call("getrawtransaction", json!([hash256_to_hex(txid), 0])) {
            Ok(value) => parse_hex_value(&value).map(Some),
            Err(err) if err.rpc_code() == Some(RPC_INVALID_ADDRESS_OR_KEY) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Never retried blindly. After a transport failure the daemon is asked whether
    /// it already has the transaction before the failure is reported.
    pub fn send_raw_transaction(&self, raw: &[u8]) -> Result<Hash256, DaemonError> {
        let txid = sha256d(raw);
        if self.recently_broadcast(&txid) {
            log_debug!("duplicate broadcast of {}", hash256_to_hex(&txid));
            return Ok(txid);
        }
        match self.call_once("sendrawtransaction", json!([hex_encode(raw)])) {
            Ok(value) => {
                let accepted = parse_hash(&value)?;
                self.remember_broadcast(accepted);
                Ok(accepted)
            }
            Err(err) if err.is_transient() => match self.get_raw_transaction(&txid) {
                Ok(Some(_)) => {
                    log_info!(
                        "broadcast of {} reached the daemon despite: {err}",
                        hash256_to_hex(&txid)
                    );
                    self.remember_broadcast(txid);
                    Ok(txid)
                }
                _ => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Fee rate in coins per kB, when the daemon has an estimate.
    pub fn estimate_smart_fee(&self, target_blocks: u32) -> Result<Option<f64>, DaemonError> {
        match self.call("estimatesmartfee", json!([target_blocks])) {
            Ok(value) => Ok(value
                .get("feerate")
                .and_then(Value::as_f64)
                .filter(|rate| *rate > 0.0)),
            Err(err) if err.rpc_code() == Some(RPC_METHOD_NOT_FOUND) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn get_network_info(&self) -> Result<Value, DaemonError> {
        self.call("getnetworkinfo", json!([]))
    }

    fn recently_broadcast(&self, txid: &Hash256) -> bool {
        match self.broadcasts.lock() {
            Ok(mut recent) => recent.contains(txid, Instant::now()),
            Err(_) => false,
        }
    }

    fn remember_broadcast(&self, txid: Hash256) {
        if let Ok(mut recent) = self.broadcasts.lock() {
            recent.insert(txid, Instant::now());
        }
    }
}

impl ChainSource for DaemonClient {
    fn best_height_and_hash(&self) -> Result<(u32, Hash256), SourceError> {
        let best = self.get_best_block_hash()?;
        let height = self.get_block_count()?;
        let hash = self.get_block_hash(height)?.ok_or_else(|| {
            SourceError(format!("daemon has no block at its best height {height}"))
        })?;
        // Disagreement means a block arrived between calls; the next pass sees it settled.
        if hash != best {
            return Err(SourceError(format!("daemon tip moved while reading height {height}")));
        }
        Ok((height, hash))
    }

    fn block_hash(&self, height: u32) -> Result<Option<Hash256>, SourceError> {
        Ok(self.get_block_hash(height)?)
    }

    fn block(&self, hash: &Hash256) -> Result<Vec<u8>, SourceError> {
        Ok(self.get_block(hash)?)
    }
}

fn parse_hash(value: &Value) -> Result<Hash256, DaemonError> {
    let text = value
        .as_str()
        .ok_or_else(|| DaemonError::InvalidResponse(format!("expected hash, got {value}")))?;
    hash256_from_hex(text).map_err(|err| DaemonError::InvalidResponse(format!("{err}: {text}")))
}

fn parse_hex_value(value: &Value) -> Result<Vec<u8>, DaemonError> {
    value
        .as_str()
        .and_then(parse_hex_bytes)
        .ok_or_else(|| DaemonError::InvalidResponse("expected hex string".into()))
}
