//! Classic broker backend (AMQP 0-9-1)
//!
//! Per event type: a durable topic exchange named `{prefix}{type}`
//! (lowercased) and, per subscription, a durable queue
//! `{prefix}{subscription}.{type}` bound by the lowercased type as routing
//! key. A shared dead-letter exchange and queue receive poison messages;
//! every primary queue's dead-letter routing points at it. Publishes use
//! publisher confirms with a bounded wait. Scheduling goes through a
//! per-type delay queue whose TTL-expired messages dead-letter back to the
//! target exchange.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bus::{delivery_verdict, DeliveryVerdict, HandlerRegistry, IntegrationEvent};
use crate::config::RabbitMqConfig;
use crate::error::{Error, Result};

/// Classic broker transport
pub struct RabbitTransport {
    connection: Connection,
    channel: Channel,
    config: RabbitMqConfig,
    declared: DashMap<String, ()>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl RabbitTransport {
    /// Connect and open a confirm-mode publisher channel
    pub async fn connect(config: &RabbitMqConfig) -> Result<Self> {
        let options = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = Connection::connect(&config.url, options).await.map_err(|e| {
            Error::Bus(format!(
                "Failed to connect to AMQP broker at '{}': {}",
                config.url, e
            ))
        })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::Bus(format!("Failed to open AMQP channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| Error::Bus(format!("Failed to enable publisher confirms: {}", e)))?;

        tracing::info!(url = %config.url, "AMQP broker connected");

        Ok(Self {
            connection,
            channel,
            config: config.clone(),
            declared: DashMap::new(),
            consumers: Mutex::new(Vec::new()),
        })
    }

    /// Declare the shared dead-letter exchange and queue once
    async fn ensure_dead_letter(&self) -> Result<()> {
        if self.declared.contains_key("__dead-letter") {
            return Ok(());
        }

        let dlx = dead_letter_exchange(&self.config.prefix);
        let dlq = dead_letter_queue(&self.config.prefix);

        self.channel
            .exchange_declare(
                &dlx,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Bus(format!("Failed to declare dead-letter exchange: {}", e)))?;

        self.channel
            .queue_declare(
                &dlq,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Bus(format!("Failed to declare dead-letter queue: {}", e)))?;

        self.channel
            .queue_bind(
                &dlq,
                &dlx,
                "#",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Bus(format!("Failed to bind dead-letter queue: {}", e)))?;

        self.declared.insert("__dead-letter".to_string(), ());
        Ok(())
    }

    /// Declare a type's exchange (and the dead-letter pair) once
    async fn ensure_exchange(&self, topic: &str) -> Result<String> {
        self.ensure_dead_letter().await?;

        let exchange = exchange_name(&self.config.prefix, topic);
        if self.declared.contains_key(&exchange) {
            return Ok(exchange);
        }

        self.channel
            .exchange_declare(
                &exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Bus(format!("Failed to declare exchange '{}': {}", exchange, e)))?;

        self.declared.insert(exchange.clone(), ());
        Ok(exchange)
    }

    fn properties(event: &IntegrationEvent) -> BasicProperties {
        BasicProperties::default()
            .with_content_type("application/json".into())
            .with_message_id(event.event_id.to_string().into())
            .with_correlation_id(event.correlation_id.clone().into())
            .with_delivery_mode(2)
    }

    /// Publish and await the broker's confirm within `deadline`
    async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        payload: &[u8],
        deadline: Duration,
    ) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| Error::Bus(format!("Publish to '{}' failed: {}", exchange, e)))?;

        let confirmation = tokio::time::timeout(deadline, confirm)
            .await
            .map_err(|_| {
                Error::Bus(format!(
                    "Publisher confirm for '{}' timed out after {:?}",
                    exchange, deadline
                ))
            })?
            .map_err(|e| Error::Bus(format!("Publisher confirm failed: {}", e)))?;

        match confirmation {
            Confirmation::Nack(_) => Err(Error::Bus(format!(
                "Broker refused publish to '{}'",
                exchange
            ))),
            _ => Ok(()),
        }
    }

    async fn run_consumer(
        channel: Channel,
        queue: String,
        topic: String,
        registry: Arc<HandlerRegistry>,
        max_deliveries: u32,
    ) {
        let consumer = channel
            .basic_consume(
                &queue,
                &format!("portway-{}", topic),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await;
        let mut consumer = match consumer {
            Ok(consumer) => consumer,
            Err(e) => {
                tracing::error!(queue, "Failed to start consumer: {}", e);
                return;
            }
        };

        // Delivery counts per message id; classic queues don't carry one
        let deliveries: DashMap<String, u32> = DashMap::new();

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::warn!(queue, "Consumer stream error: {}", e);
                    break;
                }
            };

            let event: IntegrationEvent = match serde_json::from_slice(&delivery.data) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(queue, "Undecodable delivery, dead-lettering: {}", e);
                    if let Err(e) = delivery
                        .reject(BasicRejectOptions { requeue: false })
                        .await
                    {
                        tracing::warn!(queue, "Reject failed: {}", e);
                    }
                    continue;
                }
            };

            let message_id = event.event_id.to_string();
            let count = {
                let mut entry = deliveries.entry(message_id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };

            let outcome = registry.dispatch(&event).await;
            match delivery_verdict(&outcome, count, max_deliveries) {
                DeliveryVerdict::Ack => {
                    deliveries.remove(&message_id);
                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                        tracing::warn!(queue, "Ack failed: {}", e);
                    }
                }
                DeliveryVerdict::Requeue => {
                    tracing::warn!(
                        queue,
                        event_type = %event.event_type,
                        delivery = count,
                        "Handler failed; requeueing"
                    );
                    if let Err(e) = delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await
                    {
                        tracing::warn!(queue, "Nack failed: {}", e);
                    }
                }
                DeliveryVerdict::DeadLetter | DeliveryVerdict::Abandon => {
                    deliveries.remove(&message_id);
                    tracing::warn!(
                        queue,
                        event_type = %event.event_type,
                        delivery = count,
                        "Dead-lettering delivery"
                    );
                    if let Err(e) = delivery
                        .reject(BasicRejectOptions { requeue: false })
                        .await
                    {
                        tracing::warn!(queue, "Reject failed: {}", e);
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl super::EventTransport for RabbitTransport {
    async fn publish(&self, event: &IntegrationEvent) -> Result<()> {
        let topic = event.topic();
        let exchange = self.ensure_exchange(&topic).await?;
        let payload = serde_json::to_vec(event)
            .map_err(|e| Error::Bus(format!("Failed to serialize event: {}", e)))?;

        self.publish_confirmed(
            &exchange,
            &topic,
            Self::properties(event),
            &payload,
            Duration::from_secs(self.config.confirm_timeout_secs),
        )
        .await
    }

    async fn publish_batch(&self, events: &[IntegrationEvent]) -> Result<()> {
        let deadline = Duration::from_secs(self.config.batch_confirm_timeout_secs);
        let mut confirms = Vec::with_capacity(events.len());

        for event in events {
            let topic = event.topic();
            let exchange = self.ensure_exchange(&topic).await?;
            let payload = serde_json::to_vec(event)
                .map_err(|e| Error::Bus(format!("Failed to serialize event: {}", e)))?;

            let confirm = self
                .channel
                .basic_publish(
                    &exchange,
                    &topic,
                    BasicPublishOptions::default(),
                    &payload,
                    Self::properties(event),
                )
                .await
                .map_err(|e| Error::Bus(format!("Publish to '{}' failed: {}", exchange, e)))?;
            confirms.push(confirm);
        }

        let all = futures_util::future::join_all(confirms);
        let confirmations = tokio::time::timeout(deadline, all).await.map_err(|_| {
            Error::Bus(format!(
                "Batch publisher confirm timed out after {:?}",
                deadline
            ))
        })?;

        for confirmation in confirmations {
            match confirmation
                .map_err(|e| Error::Bus(format!("Publisher confirm failed: {}", e)))?
            {
                Confirmation::Nack(_) => {
                    return Err(Error::Bus("Broker refused a batch publish".to_string()))
                }
                _ => continue,
            }
        }
        Ok(())
    }

    async fn send_command(&self, queue: &str, command: &IntegrationEvent) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Bus(format!("Failed to declare queue '{}': {}", queue, e)))?;

        let payload = serde_json::to_vec(command)
            .map_err(|e| Error::Bus(format!("Failed to serialize command: {}", e)))?;

        // Default exchange routes straight to the queue by name
        self.publish_confirmed(
            "",
            queue,
            Self::properties(command),
            &payload,
            Duration::from_secs(self.config.confirm_timeout_secs),
        )
        .await
    }

    async fn schedule(&self, event: &IntegrationEvent, deliver_at: DateTime<Utc>) -> Result<()> {
        let topic = event.topic();
        let exchange = self.ensure_exchange(&topic).await?;
        let delay_queue = delay_queue_name(&self.config.prefix, &topic);

        // TTL-expired messages dead-letter back to the target exchange
        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(exchange.clone().into()),
        );
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(topic.clone().into()),
        );
        self.channel
            .queue_declare(
                &delay_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| Error::Bus(format!("Failed to declare delay queue: {}", e)))?;

        let delay_ms = (deliver_at - Utc::now()).num_milliseconds().max(0);
        let payload = serde_json::to_vec(event)
            .map_err(|e| Error::Bus(format!("Failed to serialize event: {}", e)))?;
        let properties = Self::properties(event).with_expiration(delay_ms.to_string().into());

        self.publish_confirmed(
            "",
            &delay_queue,
            properties,
            &payload,
            Duration::from_secs(self.config.confirm_timeout_secs),
        )
        .await
    }

    async fn start(&self, registry: Arc<HandlerRegistry>) -> Result<()> {
        let mut consumers = self.consumers.lock().await;

        for event_type in registry.event_types() {
            let topic = event_type.to_lowercase();
            let exchange = self.ensure_exchange(&topic).await?;
            let queue = queue_name(&self.config.prefix, &self.config.subscription, &topic);

            let mut args = FieldTable::default();
            args.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(dead_letter_exchange(&self.config.prefix).into()),
            );
            args.insert(
                ShortString::from("x-dead-letter-routing-key"),
                AMQPValue::LongString(topic.clone().into()),
            );

            self.channel
                .queue_declare(
                    &queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    args,
                )
                .await
                .map_err(|e| Error::Bus(format!("Failed to declare queue '{}': {}", queue, e)))?;

            self.channel
                .queue_bind(
                    &queue,
                    &exchange,
                    &topic,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| Error::Bus(format!("Failed to bind queue '{}': {}", queue, e)))?;

            let channel = self
                .connection
                .create_channel()
                .await
                .map_err(|e| Error::Bus(format!("Failed to open consumer channel: {}", e)))?;
            channel
                .basic_qos(self.config.prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| Error::Bus(format!("Failed to set prefetch: {}", e)))?;

            tracing::info!(queue, topic, "Consuming");
            consumers.push(tokio::spawn(Self::run_consumer(
                channel,
                queue,
                topic,
                registry.clone(),
                self.config.max_delivery_count,
            )));
        }

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut consumers = self.consumers.lock().await;
        for handle in consumers.drain(..) {
            handle.abort();
        }

        if let Err(e) = self.channel.close(200, "shutdown").await {
            tracing::warn!("AMQP channel close failed: {}", e);
        }
        if let Err(e) = self.connection.close(200, "shutdown").await {
            tracing::warn!("AMQP connection close failed: {}", e);
        }

        tracing::info!("AMQP broker disconnected");
        Ok(())
    }
}

fn exchange_name(prefix: &str, topic: &str) -> String {
    format!("{}{}", prefix, topic)
}

fn queue_name(prefix: &str, subscription: &str, topic: &str) -> String {
    format!("{}{}.{}", prefix, subscription, topic)
}

fn delay_queue_name(prefix: &str, topic: &str) -> String {
    format!("{}delay.{}", prefix, topic)
}

fn dead_letter_exchange(prefix: &str) -> String {
    format!("{}dead-letter", prefix)
}

fn dead_letter_queue(prefix: &str) -> String {
    format!("{}dead-letter.queue", prefix)
}
