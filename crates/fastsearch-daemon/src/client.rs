//! Minimal framed JSON-RPC client: the daemon's own liveness probe, the
//! `status`/`stop` subcommands, and the integration tests all go through
//! here.

use anyhow::{Result, anyhow, bail};
use fastsearch_rpc::{JsonRpcRequest, JsonRpcResponse, read_frame, write_frame};
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tokio::net::UnixStream;

/// Send one request over a fresh connection and return its `result`.
pub async fn request(socket_path: &Path, method: &str, params: Value) -> Result<Value> {
    let stream = UnixStream::connect(socket_path).await?;
    let (mut reader, mut writer) = stream.into_split();

    let req = JsonRpcRequest::new(method, params, json!(1));
    write_frame(&mut writer, &serde_json::to_vec(&req)?).await?;

    let payload = read_frame(&mut reader)
        .await?
        .ok_or_else(|| anyhow!("daemon closed the connection"))?;
    let response: JsonRpcResponse = serde_json::from_slice(&payload)?;
    if let Some(error) = response.error {
        bail!("rpc error {}: {}", error.code, error.message);
    }
    response
        .result
        .ok_or_else(|| anyhow!("response carries neither result nor error"))
}

/// True when a live daemon answers `ping` on the socket within two seconds.
pub async fn ping(socket_path: &Path) -> bool {
    let probe = request(socket_path, "ping", json!({}));
    match tokio::time::timeout(Duration::from_secs(2), probe).await {
        Ok(Ok(value)) => value.get("pong").and_then(Value::as_bool) == Some(true),
        _ => false,
    }
}
