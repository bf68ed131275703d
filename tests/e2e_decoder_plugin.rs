//! Exercises the plugin manager/invoker/hook stack against real subprocess
//! fixtures under `tests/fixtures/`: a conforming decoder and one that
//! crashes mid-session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use openworld::event::{Event, EventBus, EventEnvelope};
use openworld::hook::{FallbackBehavior, TrafficHook, TrafficHookConfig};
use openworld::packet::{Direction, PacketContext, Protocol};
use openworld::plugin::{PluginInvoker, PluginManager};

fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

fn ctx(payload: &[u8]) -> PacketContext {
    PacketContext::new(
        "conn-1",
        Direction::Out,
        Protocol::Tcp,
        Some("127.0.0.1".parse().unwrap()),
        Some(5000),
        Some("93.184.216.34".parse().unwrap()),
        Some(443),
        payload,
    )
}

#[tokio::test]
async fn decoder_success_emits_parsed_event() {
    let manager = Arc::new(PluginManager::new(Default::default()));
    manager
        .register("echo", &fixture("echo_decoder.sh"))
        .await
        .unwrap();
    manager.load("echo").await.unwrap();

    let invoker = Arc::new(PluginInvoker::new(Arc::clone(&manager)));
    let bus = Arc::new(EventBus::new());

    let received: Arc<Mutex<Vec<EventEnvelope>>> = Default::default();
    let sink = Arc::clone(&received);
    bus.subscribe(Arc::new(move |env: &EventEnvelope| {
        sink.lock().unwrap().push(env.clone());
    }))
    .await;

    let config = TrafficHookConfig {
        enabled: true,
        decoder_plugin: Some("echo".to_string()),
        fallback_behavior: FallbackBehavior::Pass,
        timeout: Duration::from_secs(2),
        log_decode_errors: true,
        default_plugin_name: None,
    };
    let hook = TrafficHook::new(
        "proxy-1".to_string(),
        "conn-1".to_string(),
        None,
        Some(invoker),
        config,
        Arc::clone(&bus),
    );

    let forwarded = hook.on_packet(&ctx(b"hello")).await;
    assert!(forwarded);

    let events = received.lock().unwrap();
    assert!(events.iter().any(|e| matches!(e.event, Event::Parsed { .. })));

    manager.unload("echo").await.unwrap();
}

#[tokio::test]
async fn crashing_plugin_falls_back_to_drop() {
    let manager = Arc::new(PluginManager::new(Default::default()));
    manager
        .register("flaky", &fixture("crashing_decoder.sh"))
        .await
        .unwrap();
    manager.load("flaky").await.unwrap();

    let invoker = Arc::new(PluginInvoker::new(Arc::clone(&manager)));
    let bus = Arc::new(EventBus::new());

    let config = TrafficHookConfig {
        enabled: true,
        decoder_plugin: Some("flaky".to_string()),
        fallback_behavior: FallbackBehavior::Drop,
        timeout: Duration::from_secs(2),
        log_decode_errors: true,
        default_plugin_name: None,
    };
    let hook = TrafficHook::new(
        "proxy-1".to_string(),
        "conn-1".to_string(),
        None,
        Some(invoker),
        config,
        bus,
    );

    let forwarded = hook.on_packet(&ctx(b"hello")).await;
    assert!(!forwarded, "drop fallback must abort the connection");
}

#[tokio::test]
async fn crashing_plugin_falls_back_to_pass() {
    let manager = Arc::new(PluginManager::new(Default::default()));
    manager
        .register("flaky", &fixture("crashing_decoder.sh"))
        .await
        .unwrap();
    manager.load("flaky").await.unwrap();

    let invoker = Arc::new(PluginInvoker::new(Arc::clone(&manager)));
    let bus = Arc::new(EventBus::new());

    let config = TrafficHookConfig {
        enabled: true,
        decoder_plugin: Some("flaky".to_string()),
        fallback_behavior: FallbackBehavior::Pass,
        timeout: Duration::from_secs(2),
        log_decode_errors: true,
        default_plugin_name: None,
    };
    let hook = TrafficHook::new(
        "proxy-1".to_string(),
        "conn-1".to_string(),
        None,
        Some(invoker),
        config,
        bus,
    );

    let forwarded = hook.on_packet(&ctx(b"hello")).await;
    assert!(forwarded, "pass fallback must still forward the packet");
}
