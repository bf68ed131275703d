//! Subprocess plugin transport: spawn, magic-cookie handshake, then
//! length-prefixed JSON-RPC 2.0 over the child's stdio.
//!
//! Framing mirrors the `Content-Length: N\r\n\r\n<json>` convention used
//! elsewhere in this ecosystem for stdio-piped plugin protocols.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::types::DecodeResult;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("plugin did not present the expected handshake cookie")]
    HandshakeFailure,
    #[error("plugin RPC error ({code}): {message}")]
    Rpc { code: i64, message: String },
    #[error("plugin call timed out")]
    Timeout,
    #[error("plugin subprocess is not running")]
    NotRunning,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Handshake parameters exchanged with every spawned plugin.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub protocol_version: u32,
    pub cookie_key: String,
    pub cookie_value: String,
    pub load_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct HandshakeHeader {
    #[allow(dead_code)]
    protocol_version: u32,
    #[allow(dead_code)]
    transport: String,
    cookie: String,
}

#[derive(Debug, Serialize)]
struct RpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[allow(dead_code)]
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

struct Transport {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// A spawned plugin subprocess with its negotiated RPC channel.
///
/// `decode`/`encode` take `&self` (the [`super::manager::PluginManager`]
/// holds handles behind a read lock it releases before awaiting the RPC
/// call); the transport's own mutex serializes concurrent callers of the
/// same handle rather than assuming single-writer access.
pub struct PluginProcess {
    child: Mutex<Child>,
    transport: Mutex<Transport>,
    request_id: AtomicU64,
}

impl PluginProcess {
    /// Spawn `path`, set the cookie key/value in its environment, and read
    /// back the framed handshake header. Fails the whole operation if the
    /// cookie doesn't match or the header can't be parsed within
    /// `handshake.load_timeout`.
    pub async fn spawn(path: &str, handshake: &HandshakeConfig) -> Result<Self, RpcError> {
        let mut cmd = Command::new(path);
        cmd.env(&handshake.cookie_key, &handshake.cookie_value)
            .env(
                "PLUGIN_PROTOCOL_VERSION",
                handshake.protocol_version.to_string(),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(path.to_string(), stderr));
        }
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RpcError::Protocol("plugin has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RpcError::Protocol("plugin has no stdout".into()))?;

        let mut reader = BufReader::new(stdout);
        let header: HandshakeHeader = tokio::time::timeout(
            handshake.load_timeout,
            read_handshake_header(&mut reader),
        )
        .await
        .map_err(|_| RpcError::Timeout)??;

        if header.cookie != handshake.cookie_value {
            return Err(RpcError::HandshakeFailure);
        }

        Ok(Self {
            child: Mutex::new(child),
            transport: Mutex::new(Transport {
                stdin,
                stdout: reader,
            }),
            request_id: AtomicU64::new(1),
        })
    }

    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.id()
    }

    pub async fn kill(&self) {
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
        let _ = child.wait().await;
    }

    /// Returns `true` once the child has exited (non-blocking check).
    pub async fn has_exited(&self) -> bool {
        matches!(self.child.lock().await.try_wait(), Ok(Some(_)))
    }

    pub async fn decode(&self, payload: &[u8], is_client: bool) -> Result<DecodeResult, RpcError> {
        let params = serde_json::json!({
            "payload": base64::engine::general_purpose::STANDARD.encode(payload),
            "is_client": is_client,
        });
        self.call("Decode", Some(params)).await
    }

    pub async fn encode(&self, data: Value) -> Result<Value, RpcError> {
        let params = serde_json::json!({ "data": data });
        self.call("Encode", Some(params)).await
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, RpcError> {
        let id = self.next_id();
        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        };
        let content = serde_json::to_string(&request)?;
        let frame = format!("Content-Length: {}\r\n\r\n{}", content.len(), content);

        let mut transport = self.transport.lock().await;
        if self.has_exited().await {
            return Err(RpcError::NotRunning);
        }
        transport.stdin.write_all(frame.as_bytes()).await?;
        transport.stdin.flush().await?;

        loop {
            let raw = read_raw_message(&mut transport.stdout).await?;
            if raw.get("id").and_then(Value::as_u64) != Some(id) {
                continue;
            }
            let response: RpcResponse = serde_json::from_value(raw)?;
            if let Some(err) = response.error {
                return Err(RpcError::Rpc {
                    code: err.code,
                    message: err.message,
                });
            }
            let result = response.result.unwrap_or(Value::Null);
            return Ok(serde_json::from_value(result)?);
        }
    }
}

async fn read_handshake_header(
    reader: &mut BufReader<ChildStdout>,
) -> Result<HandshakeHeader, RpcError> {
    let line = read_line(reader).await?;
    serde_json::from_str(line.trim()).map_err(Into::into)
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<String, RpcError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(RpcError::NotRunning);
    }
    Ok(line)
}

async fn read_raw_message(reader: &mut BufReader<ChildStdout>) -> Result<Value, RpcError> {
    let mut content_length: Option<usize> = None;
    loop {
        let line = read_line(reader).await?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        if let Some(rest) = trimmed.strip_prefix("Content-Length:") {
            content_length = Some(
                rest.trim()
                    .parse()
                    .map_err(|e| RpcError::Protocol(format!("bad Content-Length: {e}")))?,
            );
        }
    }
    let len = content_length
        .ok_or_else(|| RpcError::Protocol("missing Content-Length header".into()))?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

async fn forward_stderr(plugin_path: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let msg = line.trim_end();
                if !msg.is_empty() {
                    tracing::warn!(plugin = %plugin_path, "[plugin-stderr] {msg}");
                }
            }
        }
    }
}
