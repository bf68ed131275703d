//! Per-connection policy object consulted once per packet.

use std::sync::Arc;
use std::time::Duration;

use crate::event::{Event, EventBus};
use crate::filter::SimpleFilter;
use crate::packet::{Direction, PacketContext};
use crate::plugin::{DecodeRequest, PluginInvoker};

/// What to do when the decoder plugin fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackBehavior {
    Pass,
    Drop,
    Fallback,
}

impl FallbackBehavior {
    /// Unknown config values behave as `pass`.
    pub fn parse(s: &str) -> Self {
        match s {
            "drop" => FallbackBehavior::Drop,
            "fallback" => FallbackBehavior::Fallback,
            "pass" => FallbackBehavior::Pass,
            _ => FallbackBehavior::Pass,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrafficHookConfig {
    pub enabled: bool,
    pub decoder_plugin: Option<String>,
    pub fallback_behavior: FallbackBehavior,
    pub timeout: Duration,
    pub log_decode_errors: bool,
    /// Globally designated default plugin retried by the `fallback` policy.
    pub default_plugin_name: Option<String>,
}

impl Default for TrafficHookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            decoder_plugin: None,
            fallback_behavior: FallbackBehavior::Pass,
            timeout: DecodeRequest::default_timeout(),
            log_decode_errors: true,
            default_plugin_name: None,
        }
    }
}

/// Created once per accepted connection by the listener's hook factory.
/// `on_packet` returns `true` to continue forwarding, `false` to abort the
/// connection.
pub struct TrafficHook {
    proxy_id: String,
    conn_id: String,
    filter: Option<SimpleFilter>,
    invoker: Option<Arc<PluginInvoker>>,
    config: TrafficHookConfig,
    bus: Arc<EventBus>,
}

impl TrafficHook {
    pub fn new(
        proxy_id: String,
        conn_id: String,
        filter: Option<SimpleFilter>,
        invoker: Option<Arc<PluginInvoker>>,
        config: TrafficHookConfig,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            proxy_id,
            conn_id,
            filter,
            invoker,
            config,
            bus,
        }
    }

    pub async fn on_packet(&self, ctx: &PacketContext) -> bool {
        // Historical behavior, preserved deliberately (see DESIGN.md): a
        // matching simple filter only logs, it does not actually block.
        if let Some(filter) = &self.filter {
            if filter.matches(ctx) {
                tracing::info!(
                    proxy_id = %self.proxy_id,
                    conn_id = %self.conn_id,
                    "destination matched the block list (logged, not enforced)"
                );
                return true;
            }
        }

        let Some(invoker) = &self.invoker else {
            self.emit_traffic(ctx, None, None).await;
            return true;
        };
        if !self.config.enabled {
            self.emit_traffic(ctx, None, None).await;
            return true;
        }
        let Some(plugin_name) = &self.config.decoder_plugin else {
            self.emit_traffic(ctx, None, None).await;
            return true;
        };

        match self.invoke(invoker, plugin_name, ctx).await {
            Ok(decoded) => {
                self.bus
                    .emit(Event::Parsed {
                        proxy_id: self.proxy_id.clone(),
                        conn_id: self.conn_id.clone(),
                        decoded,
                    })
                    .await;
                true
            }
            Err(err) => self.apply_fallback(ctx, plugin_name, err).await,
        }
    }

    async fn invoke(
        &self,
        invoker: &PluginInvoker,
        plugin_name: &str,
        ctx: &PacketContext,
    ) -> Result<crate::plugin::DecodeResult, crate::plugin::InvokerError> {
        let req = DecodeRequest {
            plugin_name: plugin_name.to_string(),
            is_client: ctx.direction == Direction::Out,
            payload: ctx.payload.clone(),
            timeout: self.config.timeout,
            retry: None,
            verbose: false,
            proxy_id: self.proxy_id.clone(),
            conn_id: self.conn_id.clone(),
            direction: direction_str(ctx.direction).to_string(),
        };
        invoker.invoke_decode(&req).await
    }

    async fn apply_fallback(
        &self,
        ctx: &PacketContext,
        plugin_name: &str,
        err: crate::plugin::InvokerError,
    ) -> bool {
        if self.config.log_decode_errors {
            tracing::warn!(
                proxy_id = %self.proxy_id,
                conn_id = %self.conn_id,
                plugin = %plugin_name,
                error = %err,
                "decoder plugin failed"
            );
        }

        match self.config.fallback_behavior {
            FallbackBehavior::Drop => false,
            FallbackBehavior::Pass => {
                self.emit_traffic(ctx, Some(err.to_string()), Some(plugin_name.to_string()))
                    .await;
                true
            }
            FallbackBehavior::Fallback => {
                let Some(default_name) = &self.config.default_plugin_name else {
                    self.emit_traffic(ctx, Some(err.to_string()), Some(plugin_name.to_string()))
                        .await;
                    return true;
                };
                if default_name == plugin_name {
                    self.emit_traffic(ctx, Some(err.to_string()), Some(plugin_name.to_string()))
                        .await;
                    return true;
                }
                let Some(invoker) = &self.invoker else {
                    self.emit_traffic(ctx, Some(err.to_string()), Some(plugin_name.to_string()))
                        .await;
                    return true;
                };
                match self.invoke(invoker, default_name, ctx).await {
                    Ok(decoded) => {
                        self.bus
                            .emit(Event::Parsed {
                                proxy_id: self.proxy_id.clone(),
                                conn_id: self.conn_id.clone(),
                                decoded,
                            })
                            .await;
                        true
                    }
                    Err(second_err) => {
                        self.emit_traffic(
                            ctx,
                            Some(second_err.to_string()),
                            Some(default_name.clone()),
                        )
                        .await;
                        true
                    }
                }
            }
        }
    }

    async fn emit_traffic(
        &self,
        ctx: &PacketContext,
        decode_error: Option<String>,
        decoder_plugin: Option<String>,
    ) {
        self.bus
            .emit(Event::Traffic {
                proxy_id: self.proxy_id.clone(),
                conn_id: self.conn_id.clone(),
                payload: ctx.payload.clone(),
                decode_error,
                decoder_plugin,
            })
            .await;
    }
}

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Out => "out",
        Direction::In => "in",
        Direction::Unknown => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Protocol;
    use crate::plugin::ManagerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    fn ctx(payload: &[u8]) -> PacketContext {
        PacketContext::new(
            "c1",
            Direction::Out,
            Protocol::Tcp,
            None,
            None,
            Some("10.0.0.1".parse().unwrap()),
            Some(80),
            payload,
        )
    }

    async fn count_traffic_events(bus: &Arc<EventBus>) -> Arc<AtomicUsize> {
        let count = StdArc::new(AtomicUsize::new(0));
        let count2 = StdArc::clone(&count);
        bus.subscribe(StdArc::new(move |env: &crate::event::EventEnvelope| {
            if matches!(env.event, Event::Traffic { .. }) {
                count2.fetch_add(1, Ordering::SeqCst);
            }
        }))
        .await;
        count
    }

    #[tokio::test]
    async fn no_filter_no_plugin_emits_traffic_and_continues() {
        let bus = Arc::new(EventBus::new());
        let count = count_traffic_events(&bus).await;
        let hook = TrafficHook::new(
            "p1".to_string(),
            "c1".to_string(),
            None,
            None,
            TrafficHookConfig::default(),
            bus,
        );
        assert!(hook.on_packet(&ctx(b"ping")).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn matching_filter_logs_but_still_forwards() {
        let bus = Arc::new(EventBus::new());
        let filter = SimpleFilter::compile(&["10.0.0.0/8".to_string()], &[]).unwrap();
        let hook = TrafficHook::new(
            "p1".to_string(),
            "c1".to_string(),
            Some(filter),
            None,
            TrafficHookConfig::default(),
            bus,
        );
        assert!(hook.on_packet(&ctx(b"x")).await);
    }

    #[tokio::test]
    async fn disabled_plugin_invoker_falls_through_to_traffic_event() {
        let bus = Arc::new(EventBus::new());
        let count = count_traffic_events(&bus).await;
        let manager = Arc::new(crate::plugin::PluginManager::new(ManagerConfig::default()));
        let invoker = Arc::new(crate::plugin::PluginInvoker::new(manager));
        let mut config = TrafficHookConfig::default();
        config.enabled = false;
        config.decoder_plugin = Some("demo".to_string());
        let hook = TrafficHook::new(
            "p1".to_string(),
            "c1".to_string(),
            None,
            Some(invoker),
            config,
            bus,
        );
        assert!(hook.on_packet(&ctx(b"x")).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unloaded_plugin_with_pass_fallback_forwards_and_emits_traffic() {
        let bus = Arc::new(EventBus::new());
        let count = count_traffic_events(&bus).await;
        let manager = Arc::new(crate::plugin::PluginManager::new(ManagerConfig::default()));
        let invoker = Arc::new(crate::plugin::PluginInvoker::new(manager));
        let mut config = TrafficHookConfig::default();
        config.enabled = true;
        config.decoder_plugin = Some("demo".to_string());
        config.fallback_behavior = FallbackBehavior::Pass;
        let hook = TrafficHook::new(
            "p1".to_string(),
            "c1".to_string(),
            None,
            Some(invoker),
            config,
            bus,
        );
        assert!(hook.on_packet(&ctx(b"x")).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unloaded_plugin_with_drop_fallback_aborts_connection() {
        let bus = Arc::new(EventBus::new());
        let manager = Arc::new(crate::plugin::PluginManager::new(ManagerConfig::default()));
        let invoker = Arc::new(crate::plugin::PluginInvoker::new(manager));
        let mut config = TrafficHookConfig::default();
        config.enabled = true;
        config.decoder_plugin = Some("demo".to_string());
        config.fallback_behavior = FallbackBehavior::Drop;
        let hook = TrafficHook::new(
            "p1".to_string(),
            "c1".to_string(),
            None,
            Some(invoker),
            config,
            bus,
        );
        assert!(!hook.on_packet(&ctx(b"x")).await);
    }

    #[test]
    fn unknown_fallback_behaves_as_pass() {
        assert_eq!(FallbackBehavior::parse("what"), FallbackBehavior::Pass);
        assert_eq!(FallbackBehavior::parse("drop"), FallbackBehavior::Drop);
        assert_eq!(FallbackBehavior::parse("fallback"), FallbackBehavior::Fallback);
    }
}
