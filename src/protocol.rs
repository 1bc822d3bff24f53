//! Newline-delimited JSON-RPC 2.0 over stdio.
//!
//! One reader loop parses requests, `tools/call` requests run on their own
//! task, and every response goes through a single writer task so frames
//! never interleave on stdout.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dispatch::{DispatchError, DispatchErrorCode, ToolDispatcher};
use crate::tool_registry;

pub const SERVER_NAME: &str = "linux-bash-gateway";
const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";
const CHANNEL_CAPACITY: usize = 128;

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Serves stdin/stdout until stdin closes.
pub async fn serve_stdio(dispatcher: Arc<ToolDispatcher>) -> Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    serve(stdin, tokio::io::stdout(), dispatcher).await
}

pub async fn serve<R, W>(reader: R, writer: W, dispatcher: Arc<ToolDispatcher>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outgoing_tx, outgoing_rx) = mpsc::channel::<Value>(CHANNEL_CAPACITY);
    let writer_handle = tokio::spawn(write_frames(writer, outgoing_rx));

    let mut calls = JoinSet::new();
    let mut lines = reader.lines();
    while let Some(line) = lines
        .next_line()
        .await
        .context("failed reading request stream")?
    {
        if line.trim().is_empty() {
            continue;
        }
        handle_line(&line, &dispatcher, &outgoing_tx, &mut calls).await;
    }
    debug!("request stream closed (EOF)");

    while let Some(joined) = calls.join_next().await {
        if let Err(err) = joined {
            error!("tool call task failed: {err}");
        }
    }
    drop(outgoing_tx);
    writer_handle
        .await
        .context("response writer task panicked")?
        .context("failed writing responses")?;
    info!("stdio session finished");
    Ok(())
}

async fn write_frames<W>(mut writer: W, mut outgoing_rx: mpsc::Receiver<Value>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outgoing_rx.recv().await {
        let mut line = serde_json::to_string(&frame).context("failed serializing response")?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    writer.shutdown().await.ok();
    Ok(())
}

async fn handle_line(
    line: &str,
    dispatcher: &Arc<ToolDispatcher>,
    outgoing_tx: &mpsc::Sender<Value>,
    calls: &mut JoinSet<()>,
) {
    let message = match serde_json::from_str::<IncomingMessage>(line) {
        Ok(message) => message,
        Err(err) => {
            warn!("failed parsing JSON-RPC frame: {err}");
            send(
                outgoing_tx,
                error_frame(Value::Null, PARSE_ERROR, format!("parse error: {err}"), None),
            )
            .await;
            return;
        }
    };

    let Some(method) = message.method else {
        if message.id.is_some() {
            debug!("ignoring JSON-RPC response frame");
        } else {
            send(
                outgoing_tx,
                error_frame(Value::Null, INVALID_REQUEST, "missing method", None),
            )
            .await;
        }
        return;
    };
    let Some(id) = message.id else {
        debug!("ignoring notification {method}");
        return;
    };

    let frame = match method.as_str() {
        "initialize" => result_frame(id, initialize_result(message.params.as_ref())),
        "ping" => result_frame(id, json!({})),
        "tools/list" => result_frame(id, json!({ "tools": tool_registry::list_tools() })),
        "tools/call" => {
            let params = match message
                .params
                .map(serde_json::from_value::<ToolCallParams>)
                .transpose()
            {
                Ok(Some(params)) => params,
                Ok(None) => {
                    let frame = error_frame(id, INVALID_PARAMS, "missing tool call params", None);
                    send(outgoing_tx, frame).await;
                    return;
                }
                Err(err) => {
                    let frame = error_frame(
                        id,
                        INVALID_PARAMS,
                        format!("invalid tool call params: {err}"),
                        None,
                    );
                    send(outgoing_tx, frame).await;
                    return;
                }
            };
            let dispatcher = Arc::clone(dispatcher);
            let outgoing_tx = outgoing_tx.clone();
            calls.spawn(async move {
                let frame = match dispatcher.dispatch(&params.name, &params.arguments).await {
                    Ok(envelope) => result_frame(
                        id,
                        json!({
                            "content": [{ "type": "text", "text": envelope.to_pretty_json() }]
                        }),
                    ),
                    Err(err) => dispatch_error_frame(id, &err),
                };
                send(&outgoing_tx, frame).await;
            });
            return;
        }
        other => error_frame(
            id,
            METHOD_NOT_FOUND,
            format!("method not found: {other}"),
            None,
        ),
    };
    send(outgoing_tx, frame).await;
}

fn initialize_result(params: Option<&Value>) -> Value {
    let protocol_version = params
        .and_then(|params| params.get("protocolVersion"))
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_PROTOCOL_VERSION);
    json!({
        "protocolVersion": protocol_version,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

fn dispatch_error_frame(id: Value, err: &DispatchError) -> Value {
    let code = match err.code {
        DispatchErrorCode::UnknownTool => METHOD_NOT_FOUND,
        DispatchErrorCode::InvalidArguments => INVALID_PARAMS,
        DispatchErrorCode::NoTargetEnvironment => INTERNAL_ERROR,
    };
    error_frame(
        id,
        code,
        err.message.clone(),
        Some(json!({ "code": err.code.as_str() })),
    )
}

fn result_frame(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_frame(id: Value, code: i64, message: impl Into<String>, data: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message.into() });
    if let Some(data) = data {
        error["data"] = data;
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

async fn send(outgoing_tx: &mpsc::Sender<Value>, frame: Value) {
    if outgoing_tx.send(frame).await.is_err() {
        warn!("response writer closed; dropping frame");
    }
}
