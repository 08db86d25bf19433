//! Message-bus adapter: uniform publish/subscribe over pluggable brokers
//!
//! Two backends fulfill one contract: the classic AMQP broker (topic
//! exchanges, dead-letter queues, publisher confirms) and the managed topic
//! bus (subjects, queue groups). The backend is a tagged variant chosen from
//! configuration at startup; everything downstream depends only on
//! [`EventBus`].
//!
//! Handler dispatch is keyed by the event-type string: each type registers a
//! typed decoder together with its handler list at startup, so delivery
//! never searches loaded modules for a matching runtime type.

pub mod managed;
pub mod rabbit;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::EventBusConfig;
use crate::error::{Error, Result};

pub use managed::NatsTransport;
pub use rabbit::RabbitTransport;

/// Event-type stems published by the gateway itself
pub mod event_types {
    pub const API_REQUEST_PROCESSED: &str = "ApiRequestProcessed";
    pub const GATEWAY_ERROR_OCCURRED: &str = "GatewayErrorOccurred";
}

/// A fire-and-forget integration event
///
/// Serialized as camel-cased JSON; the payload fields sit beside the
/// envelope fields at the top level. Published to a topic derived from the
/// event-type name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationEvent {
    /// Unique per emission
    pub event_id: Uuid,

    /// UTC emission timestamp
    pub timestamp: DateTime<Utc>,

    /// Correlation id propagated from the originating request
    pub correlation_id: String,

    /// Emitting system
    pub source: String,

    /// Event-type name (`ApiRequestProcessed`)
    pub event_type: String,

    /// Payload fields
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl IntegrationEvent {
    /// Create an event with a fresh id and the current timestamp
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        correlation_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        let data = match data {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: correlation_id.into(),
            source: source.into(),
            event_type: event_type.into(),
            data,
        }
    }

    /// The topic/exchange stem: the lowercased event-type name
    pub fn topic(&self) -> String {
        self.event_type.to_lowercase()
    }
}

/// Type-erased decoded event payload
pub type AnyEvent = Arc<dyn Any + Send + Sync>;

type Decoder = Arc<dyn Fn(&IntegrationEvent) -> Result<AnyEvent> + Send + Sync>;
type HandlerFuture = Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>>;
type EventHandler = Arc<dyn Fn(AnyEvent) -> HandlerFuture + Send + Sync>;

struct RegistryEntry {
    decoder: Decoder,
    handlers: Vec<EventHandler>,
}

/// What dispatch concluded for one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every handler completed
    Handled,
    /// A handler (or the decoder) failed
    Failed(String),
    /// The type is registered but has no handlers left
    NoHandlers,
    /// The type was never registered
    UnknownType,
}

/// What the consumer should do with the delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryVerdict {
    /// Acknowledge
    Ack,
    /// Return for redelivery
    Requeue,
    /// Route to the dead-letter destination
    DeadLetter,
    /// Discard without requeue
    Abandon,
}

/// Map a dispatch outcome and delivery count onto a consumer action
///
/// A failing handler requeues while deliveries stay under the budget and
/// dead-letters once it is reached; unknown types dead-letter immediately;
/// a missing handler list abandons.
pub fn delivery_verdict(outcome: &DispatchOutcome, deliveries: u32, max_deliveries: u32) -> DeliveryVerdict {
    match outcome {
        DispatchOutcome::Handled => DeliveryVerdict::Ack,
        DispatchOutcome::NoHandlers => DeliveryVerdict::Abandon,
        DispatchOutcome::UnknownType => DeliveryVerdict::DeadLetter,
        DispatchOutcome::Failed(_) => {
            if deliveries < max_deliveries {
                DeliveryVerdict::Requeue
            } else {
                DeliveryVerdict::DeadLetter
            }
        }
    }
}

/// Per-event-type decoders and handler lists
#[derive(Default)]
pub struct HandlerRegistry {
    entries: DashMap<String, RegistryEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for an event type
    ///
    /// The first registration for a type installs its decoder; later
    /// registrations must use the same payload type.
    pub fn subscribe<T, F, Fut>(&self, event_type: &str, handler: F)
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |any| {
            let event = any
                .downcast::<T>()
                .expect("handler registered for a different payload type");
            Box::pin(handler(event))
        });

        let mut entry = self
            .entries
            .entry(event_type.to_string())
            .or_insert_with(|| RegistryEntry {
                decoder: Arc::new(|event: &IntegrationEvent| {
                    let value = serde_json::Value::Object(event.data.clone());
                    let decoded: T = serde_json::from_value(value).map_err(|e| {
                        Error::Bus(format!(
                            "Failed to decode '{}' payload: {}",
                            event.event_type, e
                        ))
                    })?;
                    Ok(Arc::new(decoded) as AnyEvent)
                }),
                handlers: Vec::new(),
            });
        entry.handlers.push(handler);
    }

    /// Drop every handler (and the decoder) for an event type
    pub fn unsubscribe(&self, event_type: &str) -> bool {
        self.entries.remove(event_type).is_some()
    }

    /// Event types with registered decoders
    pub fn event_types(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Decode once and run each handler sequentially
    pub async fn dispatch(&self, event: &IntegrationEvent) -> DispatchOutcome {
        let (decoder, handlers) = {
            let Some(entry) = self.entries.get(&event.event_type) else {
                return DispatchOutcome::UnknownType;
            };
            (entry.decoder.clone(), entry.handlers.clone())
        };

        if handlers.is_empty() {
            return DispatchOutcome::NoHandlers;
        }

        let decoded = match decoder(event) {
            Ok(decoded) => decoded,
            Err(e) => return DispatchOutcome::Failed(e.to_string()),
        };

        for handler in handlers {
            if let Err(message) = handler(decoded.clone()).await {
                return DispatchOutcome::Failed(message);
            }
        }
        DispatchOutcome::Handled
    }
}

/// The broker contract both backends fulfill
#[async_trait::async_trait]
pub trait EventTransport: Send + Sync {
    /// Publish one event to its type's topic
    async fn publish(&self, event: &IntegrationEvent) -> Result<()>;

    /// Publish a batch; the whole batch confirms within the batch deadline
    async fn publish_batch(&self, events: &[IntegrationEvent]) -> Result<()>;

    /// Send a command to a named queue
    async fn send_command(&self, queue: &str, command: &IntegrationEvent) -> Result<()>;

    /// Deliver an event at (not before) a future instant
    async fn schedule(&self, event: &IntegrationEvent, deliver_at: DateTime<Utc>) -> Result<()>;

    /// Begin consuming every event type the registry knows
    async fn start(&self, registry: Arc<HandlerRegistry>) -> Result<()>;

    /// Close consumers and connections
    async fn stop(&self) -> Result<()>;
}

/// The configured backend, tagged at startup
pub enum BusBackend {
    Classic(RabbitTransport),
    Managed(NatsTransport),
}

/// The message bus the pipeline publishes outcome events through
pub struct EventBus {
    backend: BusBackend,
    registry: Arc<HandlerRegistry>,
}

impl EventBus {
    /// Connect the backend named in configuration
    pub async fn from_config(config: &EventBusConfig) -> Result<Self> {
        let backend = match config.broker_type.as_str() {
            "classic-broker" => {
                let rabbit = config.rabbitmq.as_ref().ok_or_else(|| {
                    Error::Bus("broker_type is classic-broker but [event_bus.rabbitmq] is missing".to_string())
                })?;
                BusBackend::Classic(RabbitTransport::connect(rabbit).await?)
            }
            "managed-bus" => {
                let nats = config.nats.as_ref().ok_or_else(|| {
                    Error::Bus("broker_type is managed-bus but [event_bus.nats] is missing".to_string())
                })?;
                BusBackend::Managed(NatsTransport::connect(nats).await?)
            }
            other => {
                return Err(Error::Bus(format!(
                    "Unknown broker type '{}' (expected classic-broker or managed-bus)",
                    other
                )))
            }
        };

        Ok(Self {
            backend,
            registry: Arc::new(HandlerRegistry::new()),
        })
    }

    /// Wrap an already connected backend (used by tests and embedders)
    pub fn with_backend(backend: BusBackend) -> Self {
        Self {
            backend,
            registry: Arc::new(HandlerRegistry::new()),
        }
    }

    fn transport(&self) -> &dyn EventTransport {
        match &self.backend {
            BusBackend::Classic(t) => t,
            BusBackend::Managed(t) => t,
        }
    }

    pub async fn publish(&self, event: &IntegrationEvent) -> Result<()> {
        self.transport().publish(event).await
    }

    pub async fn publish_batch(&self, events: &[IntegrationEvent]) -> Result<()> {
        self.transport().publish_batch(events).await
    }

    pub async fn send_command(&self, queue: &str, command: &IntegrationEvent) -> Result<()> {
        self.transport().send_command(queue, command).await
    }

    pub async fn schedule(&self, event: &IntegrationEvent, deliver_at: DateTime<Utc>) -> Result<()> {
        self.transport().schedule(event, deliver_at).await
    }

    /// Cancel a scheduled delivery
    ///
    /// Not supported: scheduled messages are not tracked by id once handed
    /// to the broker, so this returns `false` without attempting anything.
    pub fn cancel_scheduled(&self, _event_id: Uuid) -> bool {
        false
    }

    /// Register a typed handler; takes effect at the next `start`
    pub fn subscribe<T, F, Fut>(&self, event_type: &str, handler: F)
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        self.registry.subscribe::<T, F, Fut>(event_type, handler);
    }

    /// Drop an event type's handlers
    pub fn unsubscribe(&self, event_type: &str) -> bool {
        self.registry.unsubscribe(event_type)
    }

    /// Start consuming registered event types
    pub async fn start(&self) -> Result<()> {
        self.transport().start(self.registry.clone()).await
    }

    /// Close consumers and connections
    pub async fn stop(&self) -> Result<()> {
        self.transport().stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Deserialize)]
    struct OrderPlaced {
        order_id: String,
        total: f64,
    }

    fn event(event_type: &str, data: serde_json::Value) -> IntegrationEvent {
        IntegrationEvent::new(event_type, "test", "corr-1", data)
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = event("ApiRequestProcessed", json!({ "statusCode": 200 }));
        let value = serde_json::to_value(&event).unwrap();

        assert!(value["eventId"].is_string());
        assert!(value["timestamp"].is_string());
        assert_eq!(value["correlationId"], "corr-1");
        assert_eq!(value["source"], "test");
        assert_eq!(value["eventType"], "ApiRequestProcessed");
        assert_eq!(value["statusCode"], 200);
    }

    #[test]
    fn test_topic_is_lowercased_type() {
        assert_eq!(event("ApiRequestProcessed", json!({})).topic(), "apirequestprocessed");
    }

    #[test]
    fn test_non_object_payload_is_wrapped() {
        let event = event("X", json!("scalar"));
        assert_eq!(event.data.get("payload"), Some(&json!("scalar")));
    }

    #[tokio::test]
    async fn test_dispatch_decodes_and_runs_handlers() {
        let registry = HandlerRegistry::new();
        let seen = Arc::new(AtomicU32::new(0));

        let seen_clone = seen.clone();
        registry.subscribe::<OrderPlaced, _, _>("OrderPlaced", move |order| {
            let seen = seen_clone.clone();
            async move {
                assert_eq!(order.order_id, "o-1");
                assert_eq!(order.total, 9.5);
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let seen_clone = seen.clone();
        registry.subscribe::<OrderPlaced, _, _>("OrderPlaced", move |_| {
            let seen = seen_clone.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let outcome = registry
            .dispatch(&event("OrderPlaced", json!({ "order_id": "o-1", "total": 9.5 })))
            .await;
        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_type() {
        let registry = HandlerRegistry::new();
        let outcome = registry.dispatch(&event("Never", json!({}))).await;
        assert_eq!(outcome, DispatchOutcome::UnknownType);
    }

    #[tokio::test]
    async fn test_dispatch_failed_handler_short_circuits() {
        let registry = HandlerRegistry::new();
        let ran_after = Arc::new(AtomicU32::new(0));

        registry.subscribe::<serde_json::Value, _, _>("X", |_| async {
            Err("boom".to_string())
        });
        let ran = ran_after.clone();
        registry.subscribe::<serde_json::Value, _, _>("X", move |_| {
            let ran = ran.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let outcome = registry.dispatch(&event("X", json!({}))).await;
        assert_eq!(outcome, DispatchOutcome::Failed("boom".to_string()));
        assert_eq!(ran_after.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatch_bad_payload_fails() {
        let registry = HandlerRegistry::new();
        registry.subscribe::<OrderPlaced, _, _>("OrderPlaced", |_| async { Ok(()) });

        let outcome = registry
            .dispatch(&event("OrderPlaced", json!({ "order_id": 42 })))
            .await;
        assert!(matches!(outcome, DispatchOutcome::Failed(_)));
    }

    #[test]
    fn test_delivery_verdicts() {
        let failed = DispatchOutcome::Failed("x".to_string());

        assert_eq!(
            delivery_verdict(&DispatchOutcome::Handled, 1, 3),
            DeliveryVerdict::Ack
        );
        assert_eq!(delivery_verdict(&failed, 1, 3), DeliveryVerdict::Requeue);
        assert_eq!(delivery_verdict(&failed, 2, 3), DeliveryVerdict::Requeue);
        assert_eq!(delivery_verdict(&failed, 3, 3), DeliveryVerdict::DeadLetter);
        assert_eq!(
            delivery_verdict(&DispatchOutcome::UnknownType, 1, 3),
            DeliveryVerdict::DeadLetter
        );
        assert_eq!(
            delivery_verdict(&DispatchOutcome::NoHandlers, 1, 3),
            DeliveryVerdict::Abandon
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_type() {
        let registry = HandlerRegistry::new();
        registry.subscribe::<serde_json::Value, _, _>("X", |_| async { Ok(()) });
        assert!(registry.unsubscribe("X"));
        assert!(!registry.unsubscribe("X"));

        let outcome = registry.dispatch(&event("X", json!({}))).await;
        assert_eq!(outcome, DispatchOutcome::UnknownType);
    }

    /// A handler that throws `max` times for the same message id results in
    /// exactly one dead-letter and no further deliveries
    #[tokio::test]
    async fn test_poison_message_reaches_dead_letter_exactly_once() {
        let registry = HandlerRegistry::new();
        registry.subscribe::<serde_json::Value, _, _>("Poison", |_| async {
            Err("always fails".to_string())
        });

        let max_deliveries = 3;
        let poison = event("Poison", json!({}));

        let mut dead_lettered = 0;
        let mut deliveries = 0;
        // Consumer loop: redeliver until the verdict stops asking for it
        loop {
            deliveries += 1;
            let outcome = registry.dispatch(&poison).await;
            match delivery_verdict(&outcome, deliveries, max_deliveries) {
                DeliveryVerdict::Requeue => continue,
                DeliveryVerdict::DeadLetter => {
                    dead_lettered += 1;
                    break;
                }
                other => panic!("unexpected verdict {:?}", other),
            }
        }

        assert_eq!(deliveries, max_deliveries);
        assert_eq!(dead_lettered, 1);
    }
}
