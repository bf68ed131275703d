//! Lifecycle of decoder subprocesses and their RPC channels.
//!
//! One `RwLock` protects both maps so Register/Load/Unload are linearizable
//! with respect to each other; `Decode` takes the read lock only long enough
//! to clone the handle `Arc`, then calls the RPC without holding it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::RwLock;

use super::rpc::{HandshakeConfig, PluginProcess, RpcError};
use super::types::{DecodeResult, PluginRecord, PluginRecordSeed, PluginStatus};

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("plugin '{0}' already exists")]
    AlreadyExists(String),
    #[error("plugin '{0}' not found")]
    NotFound(String),
    #[error("plugin '{0}' is not loaded")]
    NotLoaded(String),
    #[error("plugin '{0}' is not in a loadable state (must be registered, stopped, or error)")]
    NotLoadable(String),
    #[error("plugin '{0}' is not running")]
    NotRunning(String),
    #[error("at the manager's concurrency cap ({0} plugins running)")]
    ConcurrencyCapReached(usize),
    #[error("handshake with plugin '{0}' failed: {1}")]
    HandshakeFailed(String, RpcError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Operational knobs carried over from the original's `ManagerConfig`.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub handshake: HandshakeConfig,
    pub max_concurrent_plugins: usize,
    pub auto_load_plugins: Vec<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig {
                protocol_version: 1,
                cookie_key: "DECODER_PLUGIN_COOKIE".to_string(),
                cookie_value: "openworld-decoder-plugin".to_string(),
                load_timeout: Duration::from_secs(30),
            },
            max_concurrent_plugins: 10,
            auto_load_plugins: Vec::new(),
        }
    }
}

struct State {
    records: HashMap<String, PluginRecord>,
    handles: HashMap<String, Arc<PluginProcess>>,
}

/// Owns the map of plugin records and the map of live plugin handles.
///
/// Invariant: a `PluginRecord` is `running` iff a handle exists in the
/// manager's map under the same name.
pub struct PluginManager {
    config: ManagerConfig,
    state: RwLock<State>,
}

impl PluginManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(State {
                records: HashMap::new(),
                handles: HashMap::new(),
            }),
        }
    }

    /// Feed boot-time records from an external store. Mirrors the boot
    /// procedure: `Register` every seed, never `Load` unless the name also
    /// appears in `auto_load_plugins`.
    pub async fn seed_from_source(&self, seeds: impl IntoIterator<Item = PluginRecordSeed>) {
        for seed in seeds {
            if let Err(e) = self.register(&seed.name, &seed.path).await {
                tracing::warn!(name = %seed.name, error = %e, "failed to register seeded plugin record");
            }
        }
    }

    /// Load every name present in both `registered` records and
    /// `auto_load_plugins`, logging (not failing) on error.
    pub async fn auto_load(&self) {
        let names = self.config.auto_load_plugins.clone();
        for name in names {
            if let Err(e) = self.load(&name).await {
                tracing::warn!(name = %name, error = %e, "auto-load of plugin failed");
            }
        }
    }

    pub async fn register(&self, name: &str, path: &str) -> Result<(), PluginError> {
        let mut state = self.state.write().await;
        if state.records.contains_key(name) {
            return Err(PluginError::AlreadyExists(name.to_string()));
        }
        state.records.insert(
            name.to_string(),
            PluginRecord {
                name: name.to_string(),
                path: path.to_string(),
                status: PluginStatus::Registered,
                last_error: None,
                loaded_at: None,
                updated_at: now_secs(),
            },
        );
        Ok(())
    }

    pub async fn load(&self, name: &str) -> Result<(), PluginError> {
        let mut state = self.state.write().await;
        let record = state
            .records
            .get(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?
            .clone();

        if !matches!(
            record.status,
            PluginStatus::Registered | PluginStatus::Stopped | PluginStatus::Error
        ) {
            return Err(PluginError::NotLoadable(name.to_string()));
        }
        if state.handles.len() >= self.config.max_concurrent_plugins {
            return Err(PluginError::ConcurrencyCapReached(
                self.config.max_concurrent_plugins,
            ));
        }

        match PluginProcess::spawn(&record.path, &self.config.handshake).await {
            Ok(process) => {
                state.handles.insert(name.to_string(), Arc::new(process));
                let rec = state.records.get_mut(name).expect("checked above");
                rec.status = PluginStatus::Running;
                rec.last_error = None;
                rec.loaded_at = Some(now_secs());
                rec.updated_at = now_secs();
                Ok(())
            }
            Err(e) => {
                let rec = state.records.get_mut(name).expect("checked above");
                rec.status = PluginStatus::Error;
                rec.last_error = Some(e.to_string());
                rec.updated_at = now_secs();
                Err(PluginError::HandshakeFailed(name.to_string(), e))
            }
        }
    }

    pub async fn unload(&self, name: &str) -> Result<(), PluginError> {
        let mut state = self.state.write().await;
        let record = state
            .records
            .get(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        if record.status != PluginStatus::Running {
            return Err(PluginError::NotRunning(name.to_string()));
        }
        if let Some(handle) = state.handles.remove(name) {
            handle.kill().await;
        }
        let rec = state.records.get_mut(name).expect("checked above");
        rec.status = PluginStatus::Stopped;
        rec.updated_at = now_secs();
        Ok(())
    }

    /// Looks up the handle and delegates to the decoder client. Takes the
    /// read lock only to clone the `Arc`, releasing it before the RPC call.
    pub async fn decode(
        &self,
        name: &str,
        is_client: bool,
        payload: &[u8],
    ) -> Result<DecodeResult, PluginError> {
        let handle = {
            let state = self.state.read().await;
            state.handles.get(name).cloned()
        };
        let handle = handle.ok_or_else(|| PluginError::NotLoaded(name.to_string()))?;
        Ok(handle.decode(payload, is_client).await?)
    }

    pub async fn list(&self) -> Vec<PluginRecord> {
        self.state.read().await.records.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Option<PluginRecord> {
        self.state.read().await.records.get(name).cloned()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PluginManager {
        PluginManager::new(ManagerConfig::default())
    }

    #[tokio::test]
    async fn register_duplicate_fails() {
        let m = manager();
        m.register("demo", "/bin/true").await.unwrap();
        assert!(matches!(
            m.register("demo", "/bin/true").await,
            Err(PluginError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn load_unknown_plugin_fails() {
        let m = manager();
        assert!(matches!(m.load("ghost").await, Err(PluginError::NotFound(_))));
    }

    #[tokio::test]
    async fn load_nonexistent_executable_transitions_to_error() {
        let m = manager();
        m.register("demo", "/no/such/executable").await.unwrap();
        assert!(m.load("demo").await.is_err());
        let record = m.get("demo").await.unwrap();
        assert_eq!(record.status, PluginStatus::Error);
        assert!(record.last_error.is_some());
    }

    #[tokio::test]
    async fn unload_requires_running() {
        let m = manager();
        m.register("demo", "/bin/true").await.unwrap();
        assert!(matches!(
            m.unload("demo").await,
            Err(PluginError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn decode_without_load_is_not_loaded() {
        let m = manager();
        m.register("demo", "/bin/true").await.unwrap();
        assert!(matches!(
            m.decode("demo", true, b"x").await,
            Err(PluginError::NotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn list_is_superset_of_successful_gets() {
        let m = manager();
        m.register("a", "/bin/true").await.unwrap();
        m.register("b", "/bin/true").await.unwrap();
        let names: Vec<_> = m.list().await.into_iter().map(|r| r.name).collect();
        assert!(names.contains(&"a".to_string()));
        assert!(names.contains(&"b".to_string()));
        assert!(m.get("a").await.is_some());
        assert!(m.get("ghost").await.is_none());
    }

    #[tokio::test]
    async fn concurrency_cap_rejects_beyond_limit() {
        let mut config = ManagerConfig::default();
        config.max_concurrent_plugins = 0;
        let m = PluginManager::new(config);
        m.register("demo", "/bin/true").await.unwrap();
        assert!(matches!(
            m.load("demo").await,
            Err(PluginError::ConcurrencyCapReached(0))
        ));
    }
}
