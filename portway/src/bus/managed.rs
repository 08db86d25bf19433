//! Managed topic bus backend (NATS)
//!
//! Per event type: a subject `{prefix}{type}` (lowercased) with one
//! queue-group subscription per consumer group. Envelope fields travel as
//! message headers; payloads are the JSON event. The core bus has no
//! broker-side redelivery or scheduling, so the adapter redelivers by
//! republishing with an incremented delivery-count header, dead-letters to
//! the `.dlq` subject once the budget is spent, and schedules with an
//! in-process timer.

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bus::{delivery_verdict, DeliveryVerdict, HandlerRegistry, IntegrationEvent};
use crate::config::NatsConfig;
use crate::error::{Error, Result};

/// Application-property header names
mod headers {
    pub const EVENT_ID: &str = "Event-Id";
    pub const CORRELATION_ID: &str = "Correlation-Id";
    pub const EVENT_TYPE: &str = "Event-Type";
    pub const SOURCE: &str = "Source";
    pub const TIMESTAMP: &str = "Timestamp";
    pub const DELIVERY_COUNT: &str = "Delivery-Count";
}

/// Managed bus transport
pub struct NatsTransport {
    client: async_nats::Client,
    config: NatsConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NatsTransport {
    /// Connect to the managed bus
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .name("portway")
            .connect(&config.url)
            .await
            .map_err(|e| {
                Error::Bus(format!(
                    "Failed to connect to NATS server at '{}': {}",
                    config.url, e
                ))
            })?;

        tracing::info!(url = %config.url, "NATS connected");

        Ok(Self {
            client,
            config: config.clone(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn subject(&self, topic: &str) -> String {
        format!("{}{}", self.config.prefix, topic)
    }

    fn headers_for(event: &IntegrationEvent, delivery_count: u32) -> async_nats::HeaderMap {
        let mut map = async_nats::HeaderMap::new();
        map.insert(headers::EVENT_ID, event.event_id.to_string().as_str());
        map.insert(headers::CORRELATION_ID, event.correlation_id.as_str());
        map.insert(headers::EVENT_TYPE, event.event_type.as_str());
        map.insert(headers::SOURCE, event.source.as_str());
        map.insert(headers::TIMESTAMP, event.timestamp.to_rfc3339().as_str());
        map.insert(
            headers::DELIVERY_COUNT,
            delivery_count.to_string().as_str(),
        );
        map
    }

    async fn publish_to(
        &self,
        subject: String,
        event: &IntegrationEvent,
        delivery_count: u32,
    ) -> Result<()> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| Error::Bus(format!("Failed to serialize event: {}", e)))?;

        self.client
            .publish_with_headers(
                subject.clone(),
                Self::headers_for(event, delivery_count),
                payload.into(),
            )
            .await
            .map_err(|e| Error::Bus(format!("Publish to '{}' failed: {}", subject, e)))?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| Error::Bus(format!("Flush failed: {}", e)))
    }

    async fn run_consumer(
        client: async_nats::Client,
        subject: String,
        group: String,
        registry: Arc<HandlerRegistry>,
        max_deliveries: u32,
    ) {
        let subscriber = client.queue_subscribe(subject.clone(), group).await;
        let mut subscriber = match subscriber {
            Ok(subscriber) => subscriber,
            Err(e) => {
                tracing::error!(subject, "Failed to subscribe: {}", e);
                return;
            }
        };

        while let Some(message) = subscriber.next().await {
            let event: IntegrationEvent = match serde_json::from_slice(&message.payload) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(subject, "Undecodable message, dead-lettering: {}", e);
                    let _ = client
                        .publish(format!("{}.dlq", subject), message.payload.clone())
                        .await;
                    continue;
                }
            };

            let count = message
                .headers
                .as_ref()
                .and_then(|h| h.get(headers::DELIVERY_COUNT))
                .and_then(|v| v.as_str().parse::<u32>().ok())
                .unwrap_or(1);

            let outcome = registry.dispatch(&event).await;
            match delivery_verdict(&outcome, count, max_deliveries) {
                DeliveryVerdict::Ack => {}
                DeliveryVerdict::Requeue => {
                    tracing::warn!(
                        subject,
                        event_type = %event.event_type,
                        delivery = count,
                        "Handler failed; redelivering"
                    );
                    if let Err(e) = client
                        .publish_with_headers(
                            subject.clone(),
                            Self::headers_for(&event, count + 1),
                            message.payload.clone(),
                        )
                        .await
                    {
                        tracing::warn!(subject, "Redelivery publish failed: {}", e);
                    }
                }
                DeliveryVerdict::DeadLetter => {
                    tracing::warn!(
                        subject,
                        event_type = %event.event_type,
                        delivery = count,
                        "Dead-lettering message"
                    );
                    if let Err(e) = client
                        .publish_with_headers(
                            format!("{}.dlq", subject),
                            Self::headers_for(&event, count),
                            message.payload.clone(),
                        )
                        .await
                    {
                        tracing::warn!(subject, "Dead-letter publish failed: {}", e);
                    }
                }
                DeliveryVerdict::Abandon => {
                    tracing::warn!(
                        subject,
                        event_type = %event.event_type,
                        "No handlers; abandoning message"
                    );
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl super::EventTransport for NatsTransport {
    async fn publish(&self, event: &IntegrationEvent) -> Result<()> {
        self.publish_to(self.subject(&event.topic()), event, 1).await?;
        self.flush().await
    }

    async fn publish_batch(&self, events: &[IntegrationEvent]) -> Result<()> {
        let max = self.config.max_batch_bytes;
        let mut batched = 0usize;

        for event in events {
            let size = serde_json::to_vec(event)
                .map_err(|e| Error::Bus(format!("Failed to serialize event: {}", e)))?
                .len();

            if size > max {
                return Err(Error::Bus(format!(
                    "Event {} ({} bytes) exceeds the batch limit of {} bytes",
                    event.event_id, size, max
                )));
            }

            // Flush the current batch and retry this event in a fresh one
            if batched + size > max {
                self.flush().await?;
                batched = 0;
            }

            self.publish_to(self.subject(&event.topic()), event, 1).await?;
            batched += size;
        }

        self.flush().await
    }

    async fn send_command(&self, queue: &str, command: &IntegrationEvent) -> Result<()> {
        self.publish_to(self.subject(queue), command, 1).await?;
        self.flush().await
    }

    async fn schedule(&self, event: &IntegrationEvent, deliver_at: DateTime<Utc>) -> Result<()> {
        // No broker-side scheduling on the core bus; an in-process timer
        // publishes when the instant arrives
        let delay = (deliver_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let client = self.client.clone();
        let subject = self.subject(&event.topic());
        let headers = Self::headers_for(event, 1);
        let payload = serde_json::to_vec(event)
            .map_err(|e| Error::Bus(format!("Failed to serialize event: {}", e)))?;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = client
                .publish_with_headers(subject.clone(), headers, payload.into())
                .await
            {
                tracing::warn!(subject, "Scheduled publish failed: {}", e);
            }
        });

        self.tasks.lock().await.push(handle);
        Ok(())
    }

    async fn start(&self, registry: Arc<HandlerRegistry>) -> Result<()> {
        let mut tasks = self.tasks.lock().await;

        for event_type in registry.event_types() {
            let subject = self.subject(&event_type.to_lowercase());
            tracing::info!(subject, "Consuming");
            tasks.push(tokio::spawn(Self::run_consumer(
                self.client.clone(),
                subject,
                self.config.subscription.clone(),
                registry.clone(),
                self.config.max_delivery_count,
            )));
        }

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            handle.abort();
        }

        if let Err(e) = self.flush().await {
            tracing::warn!("NATS flush on shutdown failed: {}", e);
        }
        tracing::info!("NATS disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_headers_carry_envelope_fields() {
        let event = IntegrationEvent::new("OrderPlaced", "portway", "corr-9", json!({}));
        let map = NatsTransport::headers_for(&event, 2);

        assert_eq!(
            map.get(headers::EVENT_ID).unwrap().as_str(),
            event.event_id.to_string()
        );
        assert_eq!(map.get(headers::CORRELATION_ID).unwrap().as_str(), "corr-9");
        assert_eq!(map.get(headers::EVENT_TYPE).unwrap().as_str(), "OrderPlaced");
        assert_eq!(map.get(headers::SOURCE).unwrap().as_str(), "portway");
        assert_eq!(map.get(headers::DELIVERY_COUNT).unwrap().as_str(), "2");
        assert!(map
            .get(headers::TIMESTAMP)
            .unwrap()
            .as_str()
            .contains('T'));
    }
}
