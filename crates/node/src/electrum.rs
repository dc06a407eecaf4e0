//! Electrum protocol server: newline-delimited JSON-RPC 2.0 over TCP.
//!
//! Every query is answered from one [`MempoolView`](crate::mempool::MempoolView), so the
//! confirmed index and the mempool overlay are read at the same point. Store and daemon
//! work runs on the blocking pool under the per-request timeout.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pepexd_chainstate::ChainTip;
use pepexd_consensus::constants::{
    ELECTRUM_PROTOCOL_MAX, ELECTRUM_PROTOCOL_MIN, MIN_RELAY_FEE_PER_KB,
};
use pepexd_consensus::money::COIN;
use pepexd_consensus::{hash256_from_hex, hash256_to_hex, Hash256};
use pepexd_primitives::script::ScriptHash;
use pepexd_primitives::transaction::Transaction;
use pepexd_storage::{KeyValueStore, StoreError};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};

use crate::daemon::{DaemonClient, DaemonError};
use crate::fee_estimator::{estimate_fee_rate, fee_histogram, sat_per_byte_to_coin_per_kb};
use crate::mempool::{HistoryItem, MempoolError, Tracker};
use crate::stats::NodeStats;
use crate::{hex_encode, parse_hex_bytes};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

const MAX_LINE_BYTES: usize = 1024 * 1024;
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

impl From<StoreError> for RpcError {
    fn from(err: StoreError) -> Self {
        RpcError::internal(format!("index read failed: {err}"))
    }
}

impl From<MempoolError> for RpcError {
    fn from(err: MempoolError) -> Self {
        RpcError::internal(err.to_string())
    }
}

impl From<DaemonError> for RpcError {
    fn from(err: DaemonError) -> Self {
        match err {
            DaemonError::Rpc { message, .. } => RpcError::internal(message),
            other => RpcError::internal(format!("daemon unavailable: {other}")),
        }
    }
}

/// One parsed request. `id` is `null` when the client sent none.
pub(crate) struct Call {
    pub id: Value,
    pub method: String,
    pub params: Vec<Value>,
}

/// A request line: a single call or a batch. Calls that failed to parse already
/// carry their error response.
pub(crate) struct Envelope {
    pub batch: bool,
    pub calls: Vec<Result<Call, Value>>,
}

pub(crate) fn success(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "result": result, "id": id})
}

pub(crate) fn failure(id: Value, err: &RpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": {"code": err.code, "message": err.message},
        "id": id,
    })
}

fn notification(method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "method": method, "params": params})
}

/// `Err` holds the parse-error response for the whole line.
pub(crate) fn parse_envelope(line: &str) -> Result<Envelope, Value> {
    let value: Value = serde_json::from_str(line).map_err(|err| {
        failure(
            Value::Null,
            &RpcError::new(PARSE_ERROR, format!("parse error: {err}")),
        )
    })?;
    match value {
        Value::Array(items) if items.is_empty() => Err(failure(
            Value::Null,
            &RpcError::new(INVALID_REQUEST, "empty batch"),
        )),
        Value::Array(items) => Ok(Envelope {
            batch: true,
            calls: items.into_iter().map(parse_call).collect(),
        }),
        other => Ok(Envelope {
            batch: false,
            calls: vec![parse_call(other)],
        }),
    }
}

fn parse_call(value: Value) -> Result<Call, Value> {
    let Value::Object(mut object) = value else {
        return Err(failure(
            Value::Null,
            &RpcError::new(INVALID_REQUEST, "request must be an object"),
        ));
    };
    let id = object.remove("id").unwrap_or(Value::Null);
    let Some(Value::String(method)) = object.remove("method") else {
        return Err(failure(
            id,
            &RpcError::new(INVALID_REQUEST, "missing method"),
        ));
    };
    let params = match object.remove("params") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(params)) => params,
        Some(_) => {
            return Err(failure(
                id,
                &RpcError::invalid_params("params must be an array"),
            ))
        }
    };
    Ok(Call { id, method, params })
}

pub(crate) fn seal(batch: bool, mut responses: Vec<Value>) -> String {
    if batch {
        Value::Array(responses).to_string()
    } else {
        responses.pop().unwrap_or(Value::Null).to_string()
    }
}

/// Reads one newline-terminated request into `buf`, never buffering more than
/// `MAX_LINE_BYTES`. Partial input stays in `buf`, so a call cancelled by `select!`
/// resumes where it left off. `Ok(None)` is a clean end of stream.
pub(crate) async fn read_request_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> Result<Option<String>, String> {
    loop {
        let allowance = (MAX_LINE_BYTES + 1).saturating_sub(buf.len()) as u64;
        let read = (&mut *reader)
            .take(allowance)
            .read_until(b'\n', buf)
            .await
            .map_err(|err| err.to_string())?;
        let complete = buf.last() == Some(&b'\n');
        if complete {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        } else if buf.len() > MAX_LINE_BYTES {
            return Err(format!("request line exceeds {MAX_LINE_BYTES} bytes"));
        } else if read == 0 && buf.is_empty() {
            return Ok(None);
        } else if read != 0 {
            continue;
        }
        let bytes = std::mem::take(buf);
        return String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| "request line is not valid utf-8".to_string());
    }
}

pub(crate) async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> Result<(), String> {
    let mut bytes = Vec::with_capacity(line.len() + 1);
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(b'\n');
    writer.write_all(&bytes).await.map_err(|err| err.to_string())
}

fn param<'a>(params: &'a [Value], index: usize, name: &str) -> Result<&'a Value, RpcError> {
    params
        .get(index)
        .ok_or_else(|| RpcError::invalid_params(format!("missing parameter '{name}'")))
}

fn script_hash_param(params: &[Value]) -> Result<ScriptHash, RpcError> {
    param(params, 0, "scripthash")?
        .as_str()
        .and_then(ScriptHash::from_electrum_hex)
        .ok_or_else(|| RpcError::invalid_params("invalid scripthash"))
}

fn u32_param(params: &[Value], index: usize, name: &str) -> Result<u32, RpcError> {
    param(params, index, name)?
        .as_u64()
        .and_then(|value| u32::try_from(value).ok())
        .ok_or_else(|| RpcError::invalid_params(format!("invalid {name}")))
}

fn txid_param(params: &[Value]) -> Result<Hash256, RpcError> {
    let text = param(params, 0, "tx_hash")?
        .as_str()
        .ok_or_else(|| RpcError::invalid_params("tx_hash must be a string"))?;
    hash256_from_hex(text)
        .map_err(|err| RpcError::invalid_params(format!("invalid tx_hash: {err}")))
}

fn server_software() -> String {
    format!("pepexd {}", env!("CARGO_PKG_VERSION"))
}

fn parse_version(text: &str) -> Option<Vec<u32>> {
    text.split('.').map(|part| part.parse().ok()).collect()
}

/// Picks the highest protocol both sides support. The client may send one version or a
/// `[min, max]` pair; a missing version means the minimum.
fn negotiate_version(params: &[Value]) -> Result<Value, RpcError> {
    let (client_min, client_max) = match params.get(1) {
        None | Some(Value::Null) => (ELECTRUM_PROTOCOL_MIN, ELECTRUM_PROTOCOL_MIN),
        Some(Value::String(version)) => (version.as_str(), version.as_str()),
        Some(Value::Array(range)) if range.len() == 2 => {
            match (range[0].as_str(), range[1].as_str()) {
                (Some(min), Some(max)) => (min, max),
                _ => return Err(RpcError::invalid_params("invalid protocol version range")),
            }
        }
        Some(_) => return Err(RpcError::invalid_params("invalid protocol version")),
    };
    let parse = |text: &str| {
        parse_version(text)
            .ok_or_else(|| RpcError::invalid_params(format!("invalid protocol version {text}")))
    };
    let server_min = parse(ELECTRUM_PROTOCOL_MIN)?;
    let server_max = parse(ELECTRUM_PROTOCOL_MAX)?;
    let (client_min, client_max_text) = (parse(client_min)?, client_max);
    let client_max = parse(client_max)?;

    let (negotiated, text) = if client_max < server_max {
        (client_max, client_max_text)
    } else {
        (server_max, ELECTRUM_PROTOCOL_MAX)
    };
    if negotiated < server_min || negotiated < client_min {
        return Err(RpcError::invalid_params(format!(
            "unsupported protocol version; server supports {ELECTRUM_PROTOCOL_MIN} to \
             {ELECTRUM_PROTOCOL_MAX}"
        )));
    }
    Ok(json!([server_software(), text]))
}

/// Pushed to every session after a mempool refresh or a tip change.
#[derive(Clone, Debug)]
pub struct Notification {
    pub tip: Option<ChainTip>,
    pub touched: Arc<BTreeSet<ScriptHash>>,
}

/// Publishes the tracker's pending changes. Returns how many script hashes changed.
pub fn publish_pending<S: KeyValueStore>(
    tracker: &Tracker<S>,
    sender: &broadcast::Sender<Notification>,
) -> Result<usize, MempoolError> {
    let pending = tracker.take_pending()?;
    if pending.touched.is_empty() && !pending.tip_changed {
        return Ok(0);
    }
    let tip = tracker.view()?.tip()?;
    let changed = pending.touched.len();
    // No receivers just means no sessions are connected.
    let _ = sender.send(Notification {
        tip,
        touched: Arc::new(pending.touched),
    });
    Ok(changed)
}

pub struct ElectrumContext<S> {
    pub tracker: Arc<Tracker<S>>,
    pub daemon: Arc<DaemonClient>,
    pub stats: Arc<NodeStats>,
    pub notifications: broadcast::Sender<Notification>,
    pub request_timeout: Duration,
    pub max_sessions: usize,
    pub genesis_hash: Hash256,
}

impl<S: KeyValueStore> ElectrumContext<S> {
    /// Stateless methods. Session-bound ones go through [`dispatch`].
    fn query(&self, method: &str, params: &[Value]) -> Result<Value, RpcError> {
        match method {
            "server.ping" => Ok(Value::Null),
            "server.banner" => Ok(json!(format!("Welcome to {}", server_software()))),
            "server.donation_address" => Ok(json!("")),
            "server.peers.subscribe" => Ok(json!([])),
            "server.features" => Ok(self.features()),
            "blockchain.headers.subscribe" => {
                Ok(self.tip_header()?.map_or(Value::Null, |(_, header)| header))
            }
            "blockchain.block.header" => self.block_header(params),
            "blockchain.estimatefee" => self.estimate_fee(u32_param(params, 0, "number")?),
            "blockchain.relayfee" => Ok(json!(self.relay_fee())),
            "blockchain.scripthash.get_balance" => {
                let script_hash = script_hash_param(params)?;
                let balance = self.tracker.view()?.balance(&script_hash)?;
                Ok(json!({"confirmed": balance.confirmed, "unconfirmed": balance.unconfirmed}))
            }
            "blockchain.scripthash.get_history" => {
                let script_hash = script_hash_param(params)?;
                let history = self.tracker.view()?.history(&script_hash)?;
                Ok(Value::Array(history.iter().map(history_json).collect()))
            }
            "blockchain.scripthash.get_mempool" => {
                let script_hash = script_hash_param(params)?;
                let mempool = self.tracker.view()?.mempool(&script_hash);
                Ok(Value::Array(mempool.iter().map(history_json).collect()))
            }
            "blockchain.scripthash.listunspent" => {
                let script_hash = script_hash_param(params)?;
                let unspent = self.tracker.view()?.unspent(&script_hash)?;
                Ok(Value::Array(
                    unspent
                        .iter()
                        .map(|item| {
                            json!({
                                "tx_hash": hash256_to_hex(&item.outpoint.hash),
                                "tx_pos": item.outpoint.index,
                                "height": item.height,
                                "value": item.value,
                            })
                        })
                        .collect(),
                ))
            }
            "blockchain.transaction.get" => self.transaction(params),
            "blockchain.transaction.broadcast" => self.broadcast(params),
            "mempool.get_fee_histogram" => {
                let backlog = self.tracker.view()?.state().backlog();
                Ok(Value::Array(
                    fee_histogram(&backlog)
                        .into_iter()
                        .map(|(rate, size)| json!([rate, size]))
                        .collect(),
                ))
            }
            _ => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("unknown method '{method}'"),
            )),
        }
    }

    /// Coin per kB. The daemon's configured floor, else the chain default.
    fn relay_fee(&self) -> f64 {
        let reported = self
            .daemon
            .get_network_info()
            .map(|info| info.get("relayfee").and_then(Value::as_f64));
        match reported {
            Ok(Some(fee)) => fee,
            Ok(None) => MIN_RELAY_FEE_PER_KB as f64 / COIN as f64,
            Err(err) => {
                log_debug!("getnetworkinfo failed, using default relay fee: {err}");
                MIN_RELAY_FEE_PER_KB as f64 / COIN as f64
            }
        }
    }

    fn features(&self) -> Value {
        json!({
            "genesis_hash": hash256_to_hex(&self.genesis_hash),
            "hosts": {},
            "protocol_min": ELECTRUM_PROTOCOL_MIN,
            "protocol_max": ELECTRUM_PROTOCOL_MAX,
            "server_version": server_software(),
            "hash_function": "sha256",
            "pruning": Value::Null,
        })
    }

    fn header_json(&self, height: u32) -> Result<Option<Value>, RpcError> {
        let view = self.tracker.view()?;
        Ok(view
            .header(height)?
            .map(|record| json!({"hex": hex_encode(&record.raw), "height": height})))
    }

    fn tip_header(&self) -> Result<Option<(ChainTip, Value)>, RpcError> {
        let view = self.tracker.view()?;
        let Some(tip) = view.tip()? else {
            return Ok(None);
        };
        Ok(view.header(tip.height)?.map(|record| {
            (
                tip,
                json!({"hex": hex_encode(&record.raw), "height": tip.height}),
            )
        }))
    }

    fn block_header(&self, params: &[Value]) -> Result<Value, RpcError> {
        let height = u32_param(params, 0, "height")?;
        let cp_height = params.get(1).and_then(Value::as_u64).unwrap_or(0);
        if cp_height != 0 {
            return Err(RpcError::invalid_params(
                "checkpoint merkle proofs are not supported",
            ));
        }
        let view = self.tracker.view()?;
        let record = view
            .header(height)?
            .ok_or_else(|| RpcError::invalid_params(format!("height {height} out of range")))?;
        Ok(json!(hex_encode(&record.raw)))
    }

    /// Coins per kB: the daemon's estimate, else the mempool backlog, else `-1`.
    fn estimate_fee(&self, target_blocks: u32) -> Result<Value, RpcError> {
        match self.daemon.estimate_smart_fee(target_blocks) {
            Ok(Some(rate)) => return Ok(json!(rate)),
            Ok(None) => {}
            Err(err) => log_debug!("estimatesmartfee failed, using mempool backlog: {err}"),
        }
        let backlog = self.tracker.view()?.state().backlog();
        Ok(match estimate_fee_rate(&backlog, target_blocks) {
            Some(rate) => json!(sat_per_byte_to_coin_per_kb(rate)),
            None => json!(-1),
        })
    }

    fn transaction(&self, params: &[Value]) -> Result<Value, RpcError> {
        let txid = txid_param(params)?;
        if params.get(1).and_then(Value::as_bool).unwrap_or(false) {
            return Err(RpcError::invalid_params(
                "verbose transactions are not supported",
            ));
        }
        let local = self.tracker.view()?.transaction(&txid)?;
        let raw = match local {
            Some(raw) => raw,
            None => self
                .daemon
                .get_raw_transaction(&txid)?
                .ok_or_else(|| RpcError::invalid_params("unknown transaction"))?,
        };
        Ok(json!(hex_encode(&raw)))
    }

    fn broadcast(&self, params: &[Value]) -> Result<Value, RpcError> {
        let raw = param(params, 0, "raw_tx")?
            .as_str()
            .and_then(parse_hex_bytes)
            .ok_or_else(|| RpcError::invalid_params("raw_tx must be hex"))?;
        Transaction::consensus_decode(&raw)
            .map_err(|err| RpcError::invalid_params(format!("transaction did not parse: {err}")))?;
        let txid = self.daemon.send_raw_transaction(&raw)?;
        log_info!("broadcast {}", hash256_to_hex(&txid));
        Ok(json!(hash256_to_hex(&txid)))
    }

    pub fn status(&self, script_hash: &ScriptHash) -> Result<Option<String>, RpcError> {
        Ok(self.tracker.view()?.status(script_hash)?)
    }

    /// Statuses for several script hashes, read from one view.
    fn statuses(
        &self,
        script_hashes: &[ScriptHash],
    ) -> Result<Vec<(ScriptHash, Option<String>)>, RpcError> {
        let view = self.tracker.view()?;
        script_hashes
            .iter()
            .map(|script_hash| Ok((*script_hash, view.status(script_hash)?)))
            .collect()
    }
}

fn history_json(item: &HistoryItem) -> Value {
    let mut entry = json!({"tx_hash": hash256_to_hex(&item.txid), "height": item.height});
    if let Some(fee) = item.fee {
        entry["fee"] = json!(fee);
    }
    entry
}

async fn run_blocking<S, T, F>(ctx: &Arc<ElectrumContext<S>>, work: F) -> Result<T, RpcError>
where
    S: KeyValueStore + 'static,
    T: Send + 'static,
    F: FnOnce(&ElectrumContext<S>) -> Result<T, RpcError> + Send + 'static,
{
    let timeout = ctx.request_timeout;
    let ctx = Arc::clone(ctx);
    let task = tokio::task::spawn_blocking(move || work(&ctx));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => Err(RpcError::internal(format!("request task failed: {err}"))),
        Err(_) => Err(RpcError::internal("request timed out")),
    }
}

#[derive(Default)]
struct Session {
    /// Last status sent for each subscribed script hash.
    scripts: HashMap<ScriptHash, Option<String>>,
    headers_subscribed: bool,
    last_tip: Option<ChainTip>,
    client: Option<String>,
}

async fn dispatch<S: KeyValueStore + 'static>(
    ctx: &Arc<ElectrumContext<S>>,
    session: &mut Session,
    method: String,
    params: Vec<Value>,
) -> Result<Value, RpcError> {
    match method.as_str() {
        "server.version" => {
            let result = negotiate_version(&params)?;
            if let Some(client) = params.first().and_then(Value::as_str) {
                session.client = Some(client.to_string());
            }
            Ok(result)
        }
        "blockchain.scripthash.subscribe" => {
            let script_hash = script_hash_param(&params)?;
            let status = run_blocking(ctx, move |ctx| ctx.status(&script_hash)).await?;
            if session.scripts.insert(script_hash, status.clone()).is_none() {
                ctx.stats.subscribed();
            }
            Ok(json!(status))
        }
        "blockchain.scripthash.unsubscribe" => {
            let script_hash = script_hash_param(&params)?;
            let removed = session.scripts.remove(&script_hash).is_some();
            if removed {
                ctx.stats.unsubscribed();
            }
            Ok(json!(removed))
        }
        "blockchain.headers.subscribe" => {
            let current = run_blocking(ctx, |ctx| ctx.tip_header()).await?;
            session.headers_subscribed = true;
            session.last_tip = current.as_ref().map(|(tip, _)| *tip);
            Ok(current.map_or(Value::Null, |(_, header)| header))
        }
        _ => run_blocking(ctx, move |ctx| ctx.query(&method, &params)).await,
    }
}

async fn handle_line<S: KeyValueStore + 'static>(
    ctx: &Arc<ElectrumContext<S>>,
    session: &mut Session,
    line: &str,
) -> String {
    let envelope = match parse_envelope(line) {
        Ok(envelope) => envelope,
        Err(response) => return response.to_string(),
    };
    let mut responses = Vec::with_capacity(envelope.calls.len());
    for call in envelope.calls {
        let response = match call {
            Ok(Call { id, method, params }) => {
                match dispatch(ctx, session, method, params).await {
                    Ok(result) => success(id, result),
                    Err(err) => failure(id, &err),
                }
            }
            Err(response) => response,
        };
        responses.push(response);
    }
    seal(envelope.batch, responses)
}

/// Notifications owed to this session. `None` means the broadcast lagged and every
/// subscription is rechecked.
async fn pending_notifications<S: KeyValueStore + 'static>(
    ctx: &Arc<ElectrumContext<S>>,
    session: &mut Session,
    note: Option<Notification>,
) -> Result<Vec<Value>, RpcError> {
    let mut out = Vec::new();
    if session.headers_subscribed {
        let tip = match &note {
            Some(note) => note.tip,
            None => run_blocking(ctx, |ctx| Ok(ctx.tracker.view()?.tip()?)).await?,
        };
        if tip != session.last_tip {
            if let Some(tip) = tip {
                let header = run_blocking(ctx, move |ctx| ctx.header_json(tip.height)).await?;
                if let Some(header) = header {
                    out.push(notification("blockchain.headers.subscribe", json!([header])));
                }
            }
            session.last_tip = tip;
        }
    }

    let candidates: Vec<ScriptHash> = match &note {
        Some(note) => session
            .scripts
            .keys()
            .filter(|script_hash| note.touched.contains(*script_hash))
            .copied()
            .collect(),
        None => session.scripts.keys().copied().collect(),
    };
    if candidates.is_empty() {
        return Ok(out);
    }
    let statuses = run_blocking(ctx, move |ctx| ctx.statuses(&candidates)).await?;
    for (script_hash, status) in statuses {
        let Some(last) = session.scripts.get_mut(&script_hash) else {
            continue;
        };
        if *last != status {
            *last = status.clone();
            out.push(notification(
                "blockchain.scripthash.subscribe",
                json!([script_hash.to_electrum_hex(), status]),
            ));
        }
    }
    Ok(out)
}

async fn run_session<S: KeyValueStore + 'static>(
    ctx: Arc<ElectrumContext<S>>,
    stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    let mut notes = ctx.notifications.subscribe();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut pending = Vec::new();
    let mut session = Session::default();

    let result = 'session: loop {
        tokio::select! {
            line = read_request_line(&mut reader, &mut pending) => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break Ok(()),
                    Err(err) => break Err(err),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = handle_line(&ctx, &mut session, &line).await;
                if let Err(err) = write_line(&mut write_half, &reply).await {
                    break Err(err);
                }
            }
            note = notes.recv() => {
                let note = match note {
                    Ok(note) => Some(note),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log_debug!("session lagged {skipped} notifications; rechecking");
                        None
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ok(()),
                };
                let pushes = match pending_notifications(&ctx, &mut session, note).await {
                    Ok(pushes) => pushes,
                    Err(err) => {
                        log_warn!("notification check failed: {err}");
                        continue;
                    }
                };
                ctx.stats.record_notifications(pushes.len() as u64);
                for push in pushes {
                    if let Err(err) = write_line(&mut write_half, &push.to_string()).await {
                        break 'session Err(err);
                    }
                }
            }
            _ = shutdown.changed() => break Ok(()),
        }
    };
    ctx.stats.session_closed(session.scripts.len());
    if let Some(client) = session.client {
        log_debug!("session with {client} ended");
    }
    result
}

async fn reject_busy(stream: TcpStream) {
    let (_, mut write_half) = stream.into_split();
    let reply = failure(Value::Null, &RpcError::internal("server busy"));
    let _ = write_line(&mut write_half, &reply.to_string()).await;
}

/// Accepts sessions until `shutdown` flips.
pub async fn serve<S: KeyValueStore + 'static>(
    listener: TcpListener,
    ctx: Arc<ElectrumContext<S>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    if let Ok(addr) = listener.local_addr() {
        log_info!("Electrum server listening on {addr}");
    }
    loop {
        let accepted: std::io::Result<(TcpStream, SocketAddr)> = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => return Ok(()),
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                log_warn!("electrum accept failed: {err}");
                tokio::time::sleep(ACCEPT_RETRY).await;
                continue;
            }
        };
        if ctx.stats.sessions() >= ctx.max_sessions {
            log_warn!(
                "rejecting session from {peer}: {} sessions open",
                ctx.max_sessions
            );
            tokio::spawn(reject_busy(stream));
            continue;
        }
        ctx.stats.session_opened();
        let session_ctx = Arc::clone(&ctx);
        let session_shutdown = shutdown.clone();
        tokio::spawn(async move {
            log_debug!("session from {peer}");
            if let Err(err) = run_session(session_ctx, stream, session_shutdown).await {
                log_debug!("session {peer} closed: {err}");
            }
        });
    }
}
