//! Daemon mode – newline-delimited JSON requests over a Unix socket.
//!
//! Request:  `{"id": "1", "method": "set_location", "params": {...}}`
//! Response: `{"id": "1", "result": <OperationResult>}` or
//!           `{"id": "1", "error": {"code": ..., "message": ...}}`

use anyhow::Context;
use locsim_engine::types::*;
use locsim_engine::{CommandRegistry, SimContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

#[derive(Debug, Deserialize)]
struct DaemonRequest {
    #[serde(default = "unknown_id")]
    id: String,
    method: String,
    #[serde(default)]
    params: Value,
}

fn unknown_id() -> String {
    "unknown".into()
}

#[derive(Debug, Serialize)]
struct DaemonResponse {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<OperationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorInfo>,
}

impl DaemonResponse {
    fn invalid(id: String, message: String) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorInfo {
                code: ErrorCode::InvalidInput,
                message,
                details: Value::Null,
            }),
        }
    }
}

pub async fn run_daemon(
    socket_path: PathBuf,
    ctx: SimContext,
    registry: CommandRegistry,
) -> anyhow::Result<()> {
    // Stale socket from an earlier run.
    let _ = std::fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("cannot bind socket {}", socket_path.display()))?;
    tracing::info!(socket = %socket_path.display(), "locsimctl daemon listening");

    let shared = Arc::new((ctx, registry));
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let (ctx, registry) = &*shared;
                    if let Err(e) = handle_connection(stream, ctx, registry).await {
                        tracing::debug!(error = %e, "connection closed");
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "accept error"),
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    ctx: &SimContext,
    registry: &CommandRegistry,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_request(&line, ctx, registry).await;
        let mut resp_json = serde_json::to_string(&response).unwrap_or_else(|_| "{}".into());
        resp_json.push('\n');
        writer.write_all(resp_json.as_bytes()).await?;
    }
    Ok(())
}

async fn handle_request(
    line: &str,
    ctx: &SimContext,
    registry: &CommandRegistry,
) -> DaemonResponse {
    let req: DaemonRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return DaemonResponse::invalid(unknown_id(), format!("invalid JSON request: {}", e)),
    };

    if !registry.list().contains(&req.method.as_str()) {
        let message = format!("unknown method: {}", req.method);
        return DaemonResponse::invalid(req.id, message);
    }

    let result = registry.execute(&req.method, req.params, ctx).await;
    DaemonResponse {
        id: req.id,
        result: Some(result),
        error: None,
    }
}
