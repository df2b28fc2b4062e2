//! WebSocket JSON-RPC transport to the TrueNAS middleware.
//!
//! One persistent connection per command invocation. Calls are serialized
//! behind a mutex: a request is written and the socket is drained until the
//! matching response id arrives, skipping interleaved event notifications.

use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::errors::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The RPC seam the typed facade talks through. Production uses [`WsRpc`];
/// tests substitute a scripted transport.
pub trait Transport: Send + Sync {
    fn call<'a>(&'a self, method: &'a str, params: Value) -> BoxFuture<'a, Result<Value>>;
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

pub struct WsRpc {
    ws: tokio::sync::Mutex<WsStream>,
    next_id: AtomicU64,
}

fn transport_err(e: tokio_tungstenite::tungstenite::Error) -> Error {
    Error::Transport(e.to_string())
}

impl WsRpc {
    /// Opens the WebSocket session and authenticates with the API key.
    pub async fn connect(host: &str, port: u16, api_key: &str, insecure: bool) -> Result<WsRpc> {
        let url = format!("wss://{host}:{port}/api/current");
        debug!("connecting to {url}");

        let ws = if insecure {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| Error::Transport(e.to_string()))?;
            let (ws, _) = connect_async_tls_with_config(
                url.as_str(),
                None,
                false,
                Some(Connector::NativeTls(tls)),
            )
            .await
            .map_err(transport_err)?;
            ws
        } else {
            let (ws, _) = connect_async(url.as_str()).await.map_err(transport_err)?;
            ws
        };

        let rpc = WsRpc {
            ws: tokio::sync::Mutex::new(ws),
            next_id: AtomicU64::new(1),
        };

        let ok = rpc.call_inner("auth.login_with_api_key", json!([api_key])).await?;
        if ok.as_bool() != Some(true) {
            return Err(Error::Auth("API key rejected".into()));
        }

        Ok(rpc)
    }

    async fn call_inner(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        trace!("rpc -> {method} (id {id})");

        let mut ws = self.ws.lock().await;
        ws.send(Message::Text(request.to_string()))
            .await
            .map_err(transport_err)?;

        loop {
            let msg = ws
                .next()
                .await
                .ok_or_else(|| Error::Transport("connection closed".into()))?
                .map_err(transport_err)?;

            match msg {
                Message::Text(text) => {
                    let reply: Value = serde_json::from_str(&text)?;
                    if reply.get("id").and_then(Value::as_u64) != Some(id) {
                        // Event notification or a stale job update; skip.
                        trace!("rpc <- skipped non-matching message");
                        continue;
                    }
                    if let Some(err) = reply.get("error") {
                        let message = err
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error");
                        return Err(Error::RemoteApi(format!("{method}: {message}")));
                    }
                    return Ok(reply.get("result").cloned().unwrap_or(Value::Null));
                }
                Message::Ping(payload) => {
                    ws.send(Message::Pong(payload)).await.map_err(transport_err)?;
                }
                Message::Close(_) => {
                    return Err(Error::Transport("connection closed".into()));
                }
                _ => {}
            }
        }
    }
}

impl Transport for WsRpc {
    fn call<'a>(&'a self, method: &'a str, params: Value) -> BoxFuture<'a, Result<Value>> {
        Box::pin(self.call_inner(method, params))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async {
            let mut ws = self.ws.lock().await;
            // Idempotent: closing an already-closed stream is not an error.
            let _ = ws.close(None).await;
            Ok(())
        })
    }
}
