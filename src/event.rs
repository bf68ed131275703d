//! Fan-out of typed events to subscribers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::RwLock;

use crate::plugin::types::DecodeResult;

/// Tagged union of everything the core can report to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    ProxyStarted {
        proxy_id: String,
    },
    ProxyStopped {
        proxy_id: String,
    },
    RuleUpdated {
        proxy_id: String,
    },
    PluginLoaded {
        name: String,
    },
    Traffic {
        proxy_id: String,
        conn_id: String,
        payload: Vec<u8>,
        /// Present when this event was emitted as a decode fallback.
        #[serde(skip_serializing_if = "Option::is_none")]
        decode_error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        decoder_plugin: Option<String>,
    },
    Parsed {
        proxy_id: String,
        conn_id: String,
        decoded: DecodeResult,
    },
}

/// Envelope shape documented in the external interfaces: `type`, `data`, `timestamp`.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: Event,
    pub timestamp: u64,
}

impl Event {
    pub fn into_envelope(self) -> EventEnvelope {
        EventEnvelope {
            event: self,
            timestamp: now_secs(),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A single subscriber capability. Implementors must not block for long:
/// the bus does not buffer and a slow listener slows every emitter.
pub trait Listener: Send + Sync {
    fn handle(&self, event: &EventEnvelope);
}

impl<F> Listener for F
where
    F: Fn(&EventEnvelope) + Send + Sync,
{
    fn handle(&self, event: &EventEnvelope) {
        self(event)
    }
}

/// Subscribe appends; Emit invokes every listener synchronously in
/// subscription order while holding a read lock (so Emits can run
/// concurrently with each other, excluded only by a concurrent Subscribe).
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, listener: Arc<dyn Listener>) {
        self.listeners.write().await.push(listener);
    }

    /// Invoke every listener in subscription order. A listener that panics
    /// is isolated: the panic is caught so it cannot affect other listeners
    /// or the emitting task.
    pub async fn emit(&self, event: Event) {
        let envelope = event.into_envelope();
        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            let listener = Arc::clone(listener);
            let envelope_ref = &envelope;
            let result = catch_unwind(AssertUnwindSafe(|| listener.handle(envelope_ref)));
            if result.is_err() {
                tracing::warn!("event listener panicked; isolated from other subscribers");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn emit_reaches_subscriber() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        bus.subscribe(Arc::new(move |_: &EventEnvelope| {
            count2.fetch_add(1, Ordering::SeqCst);
        }))
        .await;

        bus.emit(Event::ProxyStarted {
            proxy_id: "p1".to_string(),
        })
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribing_twice_delivers_twice() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let listener: Arc<dyn Listener> = Arc::new({
            let count = Arc::clone(&count);
            move |_: &EventEnvelope| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        bus.subscribe(Arc::clone(&listener)).await;
        bus.subscribe(Arc::clone(&listener)).await;

        bus.emit(Event::ProxyStarted {
            proxy_id: "p1".to_string(),
        })
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        bus.subscribe(Arc::new(|_: &EventEnvelope| {
            panic!("boom");
        }))
        .await;
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        bus.subscribe(Arc::new(move |_: &EventEnvelope| {
            count2.fetch_add(1, Ordering::SeqCst);
        }))
        .await;

        bus.emit(Event::ProxyStarted {
            proxy_id: "p1".to_string(),
        })
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_serializes_with_envelope_fields() {
        let envelope = Event::Traffic {
            proxy_id: "p1".to_string(),
            conn_id: "c1".to_string(),
            payload: b"ping".to_vec(),
            decode_error: None,
            decoder_plugin: None,
        }
        .into_envelope();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "Traffic");
        assert!(json.get("timestamp").is_some());
    }
}
