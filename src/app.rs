//! Assembles the Plugin Manager, Proxy Registry, and Event Bus from a loaded
//! config and exposes the admin-facing operations the CLI (and any other
//! embedding binary) drives.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

use crate::cipher::CipherSpec;
use crate::common::{DirectDialer, Dialer};
use crate::config::{AppConfig, ProxyDef};
use crate::event::{Event, EventBus, Listener as EventListener};
use crate::filter::{FilterError, SimpleFilter};
use crate::hook::TrafficHook;
use crate::listener::{HookFactory, Listener, ListenerError};
use crate::plugin::{
    InvokerError, PluginError, PluginInvoker, PluginManager, PluginRecord, PluginRecordSource,
};
use crate::registry::{ProxyRegistry, RegistryError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("invalid listen address '{0}': {1}")]
    InvalidListenAddr(String, std::net::AddrParseError),
    #[error("empty cipher method or password for proxy '{0}'")]
    EmptyCipherCredentials(String),
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// Owns the three shared collaborators and the loaded config needed to
/// build per-proxy hook factories at `start_proxy` time.
pub struct App {
    config: AppConfig,
    plugin_manager: Arc<PluginManager>,
    proxy_registry: Arc<ProxyRegistry>,
    event_bus: Arc<EventBus>,
    dialer: Arc<dyn Dialer>,
}

impl App {
    pub async fn new(config: AppConfig) -> Self {
        let plugin_manager = Arc::new(PluginManager::new(config.manager_config()));
        let proxy_registry = Arc::new(ProxyRegistry::new());
        let event_bus = Arc::new(EventBus::new());
        let dialer: Arc<dyn Dialer> = Arc::new(DirectDialer::default());

        let app = Self {
            config,
            plugin_manager,
            proxy_registry,
            event_bus,
            dialer,
        };
        app.auto_load_at_boot().await;
        app
    }

    /// Feed boot-time records from an external store, then auto-load.
    pub async fn seed_plugins(&self, source: &dyn PluginRecordSource) {
        self.plugin_manager
            .seed_from_source(source.load_records())
            .await;
        self.plugin_manager.auto_load().await;
    }

    /// A `registered` record named by `manager.auto-load-plugins` is loaded.
    /// Independently, if `debug.default-plugin-name` names a registered
    /// plugin not already covered by that list, it is loaded too.
    async fn auto_load_at_boot(&self) {
        self.plugin_manager.auto_load().await;

        if let Some(name) = &self.config.debug.default_plugin_name {
            if !self.config.manager.auto_load_plugins.contains(name) {
                if let Some(record) = self.plugin_manager.get(name).await {
                    if record.status == crate::plugin::PluginStatus::Registered {
                        if let Err(e) = self.plugin_manager.load(name).await {
                            tracing::warn!(name = %name, error = %e, "debug default plugin auto-load failed");
                        }
                    }
                }
            }
        }
    }

    pub async fn register_plugin(&self, name: &str, path: &str) -> Result<(), AppError> {
        Ok(self.plugin_manager.register(name, path).await?)
    }

    pub async fn load_plugin(&self, name: &str) -> Result<(), AppError> {
        Ok(self.plugin_manager.load(name).await?)
    }

    pub async fn unload_plugin(&self, name: &str) -> Result<(), AppError> {
        Ok(self.plugin_manager.unload(name).await?)
    }

    pub async fn list_plugins(&self) -> Vec<PluginRecord> {
        self.plugin_manager.list().await
    }

    pub async fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.event_bus.subscribe(listener).await;
    }

    pub async fn list_proxies(&self) -> Vec<String> {
        self.proxy_registry.list().await
    }

    pub async fn stop_proxy(&self, id: &str) -> Result<(), AppError> {
        self.proxy_registry.stop_proxy(id).await?;
        self.event_bus
            .emit(Event::ProxyStopped {
                proxy_id: id.to_string(),
            })
            .await;
        Ok(())
    }

    /// Validates `def`'s business rules, binds a [`Listener`], builds the
    /// hook factory closure, and registers it with the proxy registry.
    pub async fn start_proxy(&self, def: &ProxyDef) -> Result<(), AppError> {
        if def.method.trim().is_empty() || def.password.trim().is_empty() {
            return Err(AppError::EmptyCipherCredentials(def.id.clone()));
        }
        let listen_addr: SocketAddr = def
            .listen_addr
            .parse()
            .map_err(|e| AppError::InvalidListenAddr(def.listen_addr.clone(), e))?;
        let filter = SimpleFilter::compile(&def.block_ips, &def.block_ports)?;

        let hook_factory = self.build_hook_factory(def.id.clone(), filter);
        let cipher_spec = CipherSpec {
            method: def.method.clone(),
            password: def.password.clone(),
        };

        let listener = Arc::new(
            Listener::bind(
                def.id.clone(),
                listen_addr,
                cipher_spec,
                Arc::clone(&self.dialer),
                hook_factory,
            )
            .await?,
        );
        self.proxy_registry
            .start_proxy(def.id.clone(), listener)
            .await?;
        self.event_bus
            .emit(Event::ProxyStarted {
                proxy_id: def.id.clone(),
            })
            .await;
        Ok(())
    }

    /// Start every proxy in the loaded config whose `enabled` flag is set.
    pub async fn start_enabled_proxies(&self) -> Result<(), AppError> {
        let defs = self.config.proxies.clone();
        for def in defs.iter().filter(|d| d.enabled) {
            self.start_proxy(def).await?;
        }
        Ok(())
    }

    pub async fn stop_all_proxies(&self) {
        let ids = self.proxy_registry.list().await;
        for id in ids {
            if let Err(e) = self.stop_proxy(&id).await {
                tracing::warn!(proxy_id = %id, error = %e, "failed to stop proxy");
            }
        }
    }

    fn build_hook_factory(&self, proxy_id: String, filter: SimpleFilter) -> HookFactory {
        let invoker = Arc::new(PluginInvoker::new(Arc::clone(&self.plugin_manager)));
        let filter = if filter.is_empty() { None } else { Some(filter) };
        let config = self.config.traffic_hook_config();
        let bus = Arc::clone(&self.event_bus);

        Arc::new(move |conn_id: String| {
            TrafficHook::new(
                proxy_id.clone(),
                conn_id,
                filter.clone(),
                Some(Arc::clone(&invoker)),
                config.clone(),
                Arc::clone(&bus),
            )
        })
    }
}

/// Classifies an invoker-level decode failure for admin-facing diagnostics
/// (not on the hot path: the hook applies the fallback policy itself).
pub fn describe_decode_error(err: &InvokerError) -> String {
    if err.is_transient() {
        format!("transient: {err}")
    } else {
        format!("fatal: {err}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn proxy_def(id: &str, listen_addr: &str) -> ProxyDef {
        ProxyDef {
            id: id.to_string(),
            listen_addr: listen_addr.to_string(),
            method: "aes-256-gcm".to_string(),
            password: "hunter2".to_string(),
            block_ips: Vec::new(),
            block_ports: Vec::new(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn start_proxy_rejects_empty_credentials() {
        let app = App::new(AppConfig::default()).await;
        let mut def = proxy_def("p1", "127.0.0.1:0");
        def.password.clear();
        assert!(matches!(
            app.start_proxy(&def).await,
            Err(AppError::EmptyCipherCredentials(_))
        ));
    }

    #[tokio::test]
    async fn start_proxy_rejects_invalid_listen_addr() {
        let app = App::new(AppConfig::default()).await;
        let def = proxy_def("p1", "not-an-address");
        assert!(matches!(
            app.start_proxy(&def).await,
            Err(AppError::InvalidListenAddr(_, _))
        ));
    }

    #[tokio::test]
    async fn start_then_stop_proxy_round_trips() {
        let app = App::new(AppConfig::default()).await;
        let def = proxy_def("p1", "127.0.0.1:0");
        app.start_proxy(&def).await.unwrap();
        assert_eq!(app.list_proxies().await, vec!["p1".to_string()]);
        app.stop_proxy("p1").await.unwrap();
        assert!(app.list_proxies().await.is_empty());
    }

    #[tokio::test]
    async fn plugin_admin_operations_round_trip() {
        let app = App::new(AppConfig::default()).await;
        app.register_plugin("demo", "/bin/true").await.unwrap();
        let names: Vec<_> = app.list_plugins().await.into_iter().map(|r| r.name).collect();
        assert!(names.contains(&"demo".to_string()));
    }
}
