//! Read-only operator endpoint: the same line protocol as the Electrum server, serving
//! `getinfo` on a separate localhost listener.

use std::sync::Arc;
use std::time::Duration;

use pepexd_storage::cache::{CacheStats, CachedStore};
use pepexd_storage::KeyValueStore;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::electrum::{
    failure, parse_envelope, read_request_line, seal, success, write_line, Call, RpcError,
    METHOD_NOT_FOUND,
};
use crate::stats::NodeStats;

const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Source of the store cache counters reported by `getinfo`.
pub trait CacheReport: Send + Sync {
    fn cache_stats(&self) -> Option<CacheStats>;
}

impl<S: KeyValueStore> CacheReport for CachedStore<S> {
    fn cache_stats(&self) -> Option<CacheStats> {
        Some(self.stats())
    }
}

pub struct AdminContext {
    pub stats: Arc<NodeStats>,
    pub cache: Arc<dyn CacheReport>,
}

impl AdminContext {
    fn call(&self, method: &str) -> Result<Value, RpcError> {
        match method {
            "getinfo" => serde_json::to_value(self.stats.snapshot(self.cache.cache_stats()))
                .map_err(|err| RpcError::internal(format!("getinfo encode failed: {err}"))),
            "ping" => Ok(Value::Null),
            _ => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("unknown admin method '{method}'"),
            )),
        }
    }

    fn answer(&self, line: &str) -> String {
        let envelope = match parse_envelope(line) {
            Ok(envelope) => envelope,
            Err(response) => return response.to_string(),
        };
        let responses = envelope
            .calls
            .into_iter()
            .map(|call| match call {
                Ok(Call { id, method, .. }) => match self.call(&method) {
                    Ok(result) => success(id, result),
                    Err(err) => failure(id, &err),
                },
                Err(response) => response,
            })
            .collect();
        seal(envelope.batch, responses)
    }
}

async fn handle_connection(
    ctx: Arc<AdminContext>,
    stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut pending = Vec::new();
    loop {
        let line = tokio::select! {
            line = read_request_line(&mut reader, &mut pending) => line?,
            _ = shutdown.changed() => return Ok(()),
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        write_line(&mut write_half, &ctx.answer(&line)).await?;
    }
}

pub async fn serve_admin(
    listener: TcpListener,
    ctx: Arc<AdminContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    if let Ok(addr) = listener.local_addr() {
        log_info!("Admin endpoint listening on {addr}");
    }
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => return Ok(()),
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                log_warn!("admin accept failed: {err}");
                tokio::time::sleep(ACCEPT_RETRY).await;
                continue;
            }
        };
        let ctx = Arc::clone(&ctx);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(ctx, stream, shutdown).await {
                log_debug!("admin connection {peer} closed: {err}");
            }
        });
    }
}

/// Sends one `getinfo` request to a running daemon and returns the result object.
pub async fn request_info(addr: &str, timeout: Duration) -> Result<Value, String> {
    let exchange = async {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| format!("failed to connect to {addr}: {err}"))?;
        let (read_half, mut write_half) = stream.into_split();
        write_line(&mut write_half, r#"{"jsonrpc":"2.0","id":1,"method":"getinfo"}"#).await?;
        let mut reader = BufReader::new(read_half);
        read_request_line(&mut reader, &mut Vec::new())
            .await?
            .ok_or_else(|| format!("{addr} closed the connection"))
    };
    let line = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| format!("getinfo to {addr} timed out"))??;
    let mut reply: Value =
        serde_json::from_str(&line).map_err(|err| format!("invalid getinfo reply: {err}"))?;
    if let Some(error) = reply.get("error").filter(|error| !error.is_null()) {
        return Err(format!("getinfo failed: {error}"));
    }
    Ok(reply
        .get_mut("result")
        .map(Value::take)
        .unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use pepexd_storage::cache::CacheConfig;
    use pepexd_storage::memory::MemoryStore;

    use super::*;

    fn context() -> Arc<AdminContext> {
        let store = CachedStore::new(MemoryStore::new(), CacheConfig::default());
        Arc::new(AdminContext {
            stats: Arc::new(NodeStats::default()),
            cache: Arc::new(store),
        })
    }

    #[test]
    fn getinfo_reports_cache_and_heights() {
        let ctx = context();
        ctx.stats.record_daemon_height(42);
        let reply: Value =
            serde_json::from_str(&ctx.answer(r#"{"id":7,"method":"getinfo"}"#)).expect("json");
        assert_eq!(reply["id"], 7);
        let info = &reply["result"];
        assert_eq!(info["daemon height"], 42);
        assert_eq!(info["db height"], Value::Null);
        assert_eq!(info["cache"]["point_hits"], 0);
        assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn unknown_methods_are_rejected() {
        let ctx = context();
        let reply: Value =
            serde_json::from_str(&ctx.answer(r#"{"id":1,"method":"stop"}"#)).expect("json");
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
        let reply: Value = serde_json::from_str(&ctx.answer("not json")).expect("json");
        assert_eq!(reply["error"]["code"], crate::electrum::PARSE_ERROR);
    }

    #[tokio::test]
    async fn cli_request_round_trips() {
        let ctx = context();
        ctx.stats.record_mempool(2, 500);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve_admin(listener, ctx, shutdown_rx));

        let info = request_info(&addr, Duration::from_secs(5))
            .await
            .expect("getinfo");
        assert_eq!(info["mempool txs"], 2);
        assert_eq!(info["mempool bytes"], 500);
        assert_eq!(info["behind"], true);

        shutdown_tx.send(true).expect("shutdown");
        server.await.expect("join").expect("serve");
    }
}
