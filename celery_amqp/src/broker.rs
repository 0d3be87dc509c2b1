use crate::connector::Gateway;
use crate::properties::amqp_properties;
use celery_pool::Pool;
use celery_protocol::{Broker, TaskEnvelope, TransportError};
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, ExchangeKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Non-durable, non-auto-delete queue/exchange TTL: 24 hours, matching the
/// Celery worker's own declarations.
const QUEUE_TTL_MS: i64 = 86_400_000;

const MAX_BACKPRESSURE_RETRIES: u32 = 20;

/// An AMQP 0-9-1 (RabbitMQ) [`Broker`]: publishes task envelopes to the
/// default exchange (or a user-named direct exchange), honoring
/// write-backpressure by retrying until the publish is accepted into the
/// channel's write buffer.
pub struct AmqpBroker {
    name: Arc<str>,
    pool: Arc<Pool<Channel>>,
}

impl AmqpBroker {
    /// Builds a broker around `gateway`, maintaining a channel pool of at
    /// most `pool_size` channels (2 by default per the upstream Celery
    /// client).
    pub fn new(name: impl Into<Arc<str>>, gateway: Gateway, pool_size: usize) -> Self {
        let name = name.into();
        let pool_name = Arc::clone(&name);
        let pool = Pool::new(pool_name, pool_size, move || {
            let gateway = gateway.clone();
            async move { gateway.channel().await }
        })
        .into_shared();

        Self { name, pool }
    }

    async fn declare(&self, channel: &Channel, exchange: &str, routing_key: &str) -> Result<(), lapin::Error> {
        channel
            .queue_declare(
                routing_key,
                QueueDeclareOptions { durable: false, auto_delete: false, ..Default::default() },
                queue_ttl_arguments(),
            )
            .await?;

        // The default exchange cannot be (re-)declared.
        if !exchange.is_empty() {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Custom("direct".to_owned()),
                    ExchangeDeclareOptions { durable: false, auto_delete: false, ..Default::default() },
                    FieldTable::default(),
                )
                .await?;
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl Broker for AmqpBroker {
    async fn publish(&self, envelope: &TaskEnvelope) -> Result<String, TransportError> {
        let channel = self.pool.acquire().await;
        let exchange = envelope.properties.delivery_info.exchange.as_str();
        let routing_key = envelope.properties.delivery_info.routing_key.as_str();

        let result = self.publish_on_channel(&channel, envelope, exchange, routing_key).await;

        self.pool.release(channel).await;

        result
    }

    async fn close(&self) {
        self.pool
            .drain_all(|channel| async move {
                let _ = channel.close(0, "broker shutdown").await;
            })
            .await;
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl AmqpBroker {
    async fn publish_on_channel(
        &self,
        channel: &Channel,
        envelope: &TaskEnvelope,
        exchange: &str,
        routing_key: &str,
    ) -> Result<String, TransportError> {
        self.declare(channel, exchange, routing_key).await.map_err(|error| {
            TransportError::Transport(format!("failed to declare '{routing_key}': {error}"))
        })?;

        let properties = amqp_properties(envelope);
        let payload = envelope.body.as_bytes();

        let mut attempt = 0;
        loop {
            match channel
                .basic_publish(exchange, routing_key, BasicPublishOptions::default(), payload, properties.clone())
                .await
            {
                Ok(_confirmation) => return Ok("flushed to write buffer".to_owned()),

                Err(lapin::Error::IOError(_)) if attempt < MAX_BACKPRESSURE_RETRIES => {
                    attempt += 1;
                    warn!(
                        broker = self.name.as_ref(),
                        attempt, routing_key, "publish hit write backpressure; retrying",
                    );
                    sleep(Duration::from_millis(10 * attempt as u64)).await;
                }

                Err(error) => {
                    return Err(TransportError::Transport(format!(
                        "failed to publish to '{routing_key}': {error}"
                    )))
                }
            }
        }
    }
}

fn queue_ttl_arguments() -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert("x-expires".into(), lapin::types::AMQPValue::LongLongInt(QUEUE_TTL_MS));
    arguments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_ttl_is_24_hours_in_milliseconds() {
        assert_eq!(QUEUE_TTL_MS, 86_400_000);
    }
}
