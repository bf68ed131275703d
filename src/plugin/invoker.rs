//! Typed, timeout- and retry-bearing facade over the [`PluginManager`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::manager::{PluginError, PluginManager};
use super::types::DecodeResult;

#[derive(Error, Debug)]
pub enum InvokerError {
    #[error("decode call to '{plugin}' timed out after {timeout_ms}ms")]
    Timeout { plugin: String, timeout_ms: u64 },
    #[error("decode call to '{plugin}' failed after {attempts} attempt(s): {source}")]
    Failed {
        plugin: String,
        attempts: u32,
        #[source]
        source: PluginError,
    },
}

impl InvokerError {
    /// Transient errors are those whose string form contains "timeout",
    /// "deadline exceeded", "connection", or "network".
    pub fn is_transient(&self) -> bool {
        let text = self.to_string().to_lowercase();
        text.contains("timeout")
            || text.contains("deadline exceeded")
            || text.contains("connection")
            || text.contains("network")
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay: Duration,
}

/// One decode invocation: the plugin to call, the payload, and the
/// timeout/retry/tracing context around it.
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    pub plugin_name: String,
    pub is_client: bool,
    pub payload: Vec<u8>,
    pub timeout: Duration,
    pub retry: Option<RetryConfig>,
    pub verbose: bool,
    pub proxy_id: String,
    pub conn_id: String,
    pub direction: String,
}

impl DecodeRequest {
    pub fn default_timeout() -> Duration {
        Duration::from_millis(5000)
    }
}

pub struct PluginInvoker {
    manager: Arc<PluginManager>,
}

impl PluginInvoker {
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self { manager }
    }

    /// Computes a deadline `now + timeout` and enforces cancellation there.
    /// Without retry, calls the plugin once; with retry, attempts up to
    /// `max_attempts` times, sleeping `delay` between attempts, but only
    /// retrying transient errors; non-transient errors surface immediately.
    pub async fn invoke_decode(&self, req: &DecodeRequest) -> Result<DecodeResult, InvokerError> {
        if req.verbose {
            tracing::debug!(
                plugin = %req.plugin_name,
                proxy_id = %req.proxy_id,
                conn_id = %req.conn_id,
                direction = %req.direction,
                "invoking decoder plugin"
            );
        }

        let Some(retry) = &req.retry else {
            return self.call_once(req).await;
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = self.call_once(req).await;
            match result {
                Ok(decoded) => return Ok(decoded),
                Err(e) if attempts < retry.max_attempts && e.is_transient() => {
                    tokio::time::sleep(retry.delay).await;
                    continue;
                }
                Err(e) => {
                    return Err(InvokerError::Failed {
                        plugin: req.plugin_name.clone(),
                        attempts,
                        source: into_plugin_error(e),
                    })
                }
            }
        }
    }

    async fn call_once(&self, req: &DecodeRequest) -> Result<DecodeResult, InvokerError> {
        let call = self
            .manager
            .decode(&req.plugin_name, req.is_client, &req.payload);

        match tokio::time::timeout(req.timeout, call).await {
            Ok(Ok(decoded)) => Ok(decoded),
            Ok(Err(e)) => Err(InvokerError::Failed {
                plugin: req.plugin_name.clone(),
                attempts: 1,
                source: e,
            }),
            Err(_) => Err(InvokerError::Timeout {
                plugin: req.plugin_name.clone(),
                timeout_ms: req.timeout.as_millis() as u64,
            }),
        }
    }
}

/// Recovers a [`PluginError`] from a wrapped [`InvokerError::Failed`] for the
/// retry loop's final-error wrapping; timeouts are represented directly as
/// `InvokerError::Timeout` since they carry no inner `PluginError`.
fn into_plugin_error(e: InvokerError) -> PluginError {
    match e {
        InvokerError::Failed { source, .. } => source,
        InvokerError::Timeout { plugin, timeout_ms } => {
            PluginError::Rpc(super::rpc::RpcError::Protocol(format!(
                "timeout invoking '{plugin}' after {timeout_ms}ms"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::manager::ManagerConfig;

    fn invoker() -> PluginInvoker {
        PluginInvoker::new(Arc::new(PluginManager::new(ManagerConfig::default())))
    }

    fn base_req(plugin: &str) -> DecodeRequest {
        DecodeRequest {
            plugin_name: plugin.to_string(),
            is_client: true,
            payload: b"hi".to_vec(),
            timeout: Duration::from_millis(50),
            retry: None,
            verbose: false,
            proxy_id: "p1".to_string(),
            conn_id: "c1".to_string(),
            direction: "out".to_string(),
        }
    }

    #[tokio::test]
    async fn decode_without_plugin_loaded_fails() {
        let invoker = invoker();
        let result = invoker.invoke_decode(&base_req("demo")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn non_transient_error_does_not_retry() {
        // "plugin not loaded" contains none of the transient keywords, so the
        // retry loop must surface it after exactly one attempt.
        let invoker = invoker();
        let mut req = base_req("demo");
        req.retry = Some(RetryConfig {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        });
        let result = invoker.invoke_decode(&req).await;
        assert!(matches!(result, Err(InvokerError::Failed { attempts, .. }) if attempts == 1));
    }

    #[test]
    fn transient_classification() {
        let e = InvokerError::Timeout {
            plugin: "demo".to_string(),
            timeout_ms: 10,
        };
        assert!(e.is_transient());
    }
}
