use crate::connector::Gateway;
use celery_pool::{Leased, Pool};
use celery_protocol::{Backend, ResultEnvelope, TaskId, TransportError};
use celery_sync::{Latch, PromiseMap};
use futures::StreamExt;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::time::sleep;
use tracing::warn;

const QUEUE_TTL_MS: i64 = 86_400_000;
const MAX_BACKPRESSURE_RETRIES: u32 = 20;

/// A RabbitMQ RPC-pattern [`Backend`]: asserts a dedicated, per-client reply
/// queue (`reply_to`'d on every published task), and dispatches each
/// delivery to whichever caller is awaiting its `correlation_id`.
pub struct RpcBackend {
    name: Arc<str>,
    reply_queue: Arc<str>,
    pool: Arc<Pool<Channel>>,
    promises: Arc<PromiseMap<String, String>>,
    consumer_tag: Arc<str>,
    shutdown: Latch,
}

impl RpcBackend {
    /// Asserts the reply queue, begins consuming it with `no_ack`, and
    /// starts dispatching deliveries by correlation id. The dispatch loop
    /// runs until [`close`](Backend::close) is called.
    pub async fn start(
        name: impl Into<Arc<str>>,
        gateway: Gateway,
        reply_queue: impl Into<Arc<str>>,
        pool_size: usize,
    ) -> Result<Self, TransportError> {
        let name = name.into();
        let reply_queue = reply_queue.into();
        let shutdown = Latch::new();

        let pool_name = Arc::clone(&name);
        let pool = Pool::new(pool_name, pool_size, move || {
            let gateway = gateway.clone();
            async move { gateway.channel().await }
        })
        .into_shared();

        let promises = Arc::new(PromiseMap::new());

        let consumer_channel = pool.acquire().await;
        declare_reply_queue(&consumer_channel, &reply_queue).await.map_err(|error| {
            TransportError::Transport(format!("failed to declare reply queue '{reply_queue}': {error}"))
        })?;

        let consumer_tag: Arc<str> = Arc::from(format!("{reply_queue}-consumer"));
        let consumer = consumer_channel
            .basic_consume(
                &reply_queue,
                &consumer_tag,
                BasicConsumeOptions { no_ack: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|error| {
                TransportError::Transport(format!("failed to consume reply queue '{reply_queue}': {error}"))
            })?;

        spawn_dispatch_loop(
            Arc::clone(&promises),
            consumer,
            consumer_channel,
            Arc::clone(&consumer_tag),
            shutdown.gate(),
        );

        Ok(Self { name, reply_queue, pool, promises, consumer_tag, shutdown })
    }
}

async fn declare_reply_queue(channel: &Channel, reply_queue: &str) -> Result<(), lapin::Error> {
    let mut arguments = FieldTable::default();
    arguments.insert("x-expires".into(), lapin::types::AMQPValue::LongLongInt(QUEUE_TTL_MS));

    channel
        .queue_declare(
            reply_queue,
            QueueDeclareOptions { durable: false, auto_delete: false, ..Default::default() },
            arguments,
        )
        .await?;

    Ok(())
}

fn spawn_dispatch_loop(
    promises: Arc<PromiseMap<String, String>>,
    mut consumer: lapin::Consumer,
    consumer_channel: Leased<Channel>,
    consumer_tag: Arc<str>,
    shutdown: celery_sync::Gate,
) {
    tokio::spawn(async move {
        loop {
            select! {
                biased;
                _ = shutdown.opened() => break,
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else { break };

                    match delivery {
                        Ok(delivery) => {
                            let correlation_id = delivery
                                .properties
                                .correlation_id()
                                .as_ref()
                                .map(|s| s.as_str().to_owned());

                            let Some(correlation_id) = correlation_id else {
                                warn!("RPC reply delivery without a correlation id; dropping");
                                continue;
                            };

                            match String::from_utf8(delivery.data) {
                                Ok(payload) => {
                                    promises.resolve(correlation_id, payload).await;
                                }
                                Err(_) => {
                                    warn!(correlation_id, "RPC reply delivery was not valid UTF-8");
                                }
                            }
                        }
                        Err(error) => warn!(?error, "error reading from RPC reply queue"),
                    }
                }
            }
        }

        let _ = consumer_channel.basic_cancel(&consumer_tag, BasicCancelOptions::default()).await;
        drop(consumer_channel);
    });
}

#[async_trait::async_trait]
impl Backend for RpcBackend {
    async fn put(&self, envelope: &ResultEnvelope) -> Result<String, TransportError> {
        let channel = self.pool.acquire().await;
        let result = self.put_on_channel(&channel, envelope).await;
        self.pool.release(channel).await;
        result
    }

    async fn get(
        &self,
        task_id: &TaskId,
        timeout: Option<Duration>,
    ) -> Result<ResultEnvelope, TransportError> {
        let future = self.promises.get(task_id.as_str().to_owned());

        let payload = match timeout {
            None => future.await.map_err(|reason| TransportError::Transport(reason.to_string()))?,
            Some(timeout) => match tokio::time::timeout(timeout, future).await {
                Ok(Ok(payload)) => payload,
                Ok(Err(reason)) => return Err(TransportError::Transport(reason.to_string())),
                Err(_) => return Err(TransportError::Timeout),
            },
        };

        serde_json::from_str(&payload).map_err(|error| TransportError::Malformed(error.to_string()))
    }

    async fn delete(&self, task_id: &TaskId) -> Result<String, TransportError> {
        let existed = self.promises.delete(&task_id.as_str().to_owned()).await;
        Ok(if existed { "deleted".to_owned() } else { "no result found".to_owned() })
    }

    async fn close(&self) {
        self.promises.reject_all("disconnecting").await;

        // Wakes the dispatch loop, which cancels the consumer on its own
        // channel and returns that channel to the pool before exiting.
        self.shutdown.release();

        self.pool
            .drain_all(|channel| async move {
                let _ = channel.close(0, "rpc backend shutdown").await;
            })
            .await;
    }

    fn uri(&self) -> Option<String> {
        None
    }
}

impl RpcBackend {
    async fn put_on_channel(
        &self,
        channel: &Channel,
        envelope: &ResultEnvelope,
    ) -> Result<String, TransportError> {
        let payload = serde_json::to_vec(envelope)
            .map_err(|error| TransportError::Malformed(error.to_string()))?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_content_encoding("utf-8".into())
            .with_correlation_id(envelope.task_id.as_str().into())
            .with_delivery_mode(1)
            .with_priority(0);

        let mut attempt = 0;
        loop {
            match channel
                .basic_publish(
                    "",
                    &self.reply_queue,
                    BasicPublishOptions::default(),
                    &payload,
                    properties.clone(),
                )
                .await
            {
                Ok(_confirmation) => return Ok("flushed to write buffer".to_owned()),

                Err(lapin::Error::IOError(_)) if attempt < MAX_BACKPRESSURE_RETRIES => {
                    attempt += 1;
                    sleep(Duration::from_millis(10 * attempt as u64)).await;
                }

                Err(error) => {
                    return Err(TransportError::Transport(format!(
                        "failed to publish RPC reply: {error}"
                    )))
                }
            }
        }
    }

    /// A short, human-readable identifier for logging/diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }
}
