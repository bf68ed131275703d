//! Map of running listeners keyed by proxy ID.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::listener::Listener;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("proxy '{0}' is already running")]
    AlreadyRunning(String),
    #[error("proxy '{0}' not found")]
    NotFound(String),
}

struct Entry {
    listener: Arc<Listener>,
    accept_task: JoinHandle<()>,
}

/// One mutex guards the map of running proxies.
#[derive(Default)]
pub struct ProxyRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `server` under `id`, refusing duplicates, and launch its
    /// accept loop on a background task.
    pub async fn start_proxy(&self, id: String, server: Arc<Listener>) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&id) {
            return Err(RegistryError::AlreadyRunning(id));
        }

        let task_server = Arc::clone(&server);
        let task_id = id.clone();
        let accept_task = tokio::spawn(async move {
            if let Err(e) = task_server.serve().await {
                tracing::warn!(proxy_id = %task_id, error = %e, "listener accept loop exited with error");
            }
        });

        entries.insert(
            id,
            Entry {
                listener: server,
                accept_task,
            },
        );
        Ok(())
    }

    /// Close the listener and remove the entry.
    pub async fn stop_proxy(&self, id: &str) -> Result<(), RegistryError> {
        let entry = {
            let mut entries = self.entries.lock().await;
            entries.remove(id)
        }
        .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        entry.listener.close().await;
        entry.accept_task.abort();
        Ok(())
    }

    /// Consistent snapshot of the currently running proxy IDs.
    pub async fn list(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.entries.lock().await.contains_key(id)
    }
}
