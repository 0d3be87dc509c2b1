use crate::config::ClientConfig;
use crate::uri::{self, Family};
use celery_amqp::{AmqpBroker, Connector, Handle, RpcBackend};
use celery_protocol::{Backend, Broker, DeliveryMode, FailoverStrategy, IgnoringBackend, RoundRobin, TransportError};
use celery_redis::{RedisBackend, RedisBroker};
use celery_sync::Latch;
use std::sync::Arc;
use thiserror::Error;

/// Failure while wiring up a [`Client`] from a [`ClientConfig`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// A broker or backend URI did not match any recognized scheme.
    #[error("unrecognized broker/backend URI scheme: '{0}'")]
    UnrecognizedScheme(String),
    /// A broker/backend URI was malformed for its family.
    #[error("invalid connection URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },
    /// Establishing a broker/backend connection failed.
    #[error("failed to connect: {0}")]
    Transport(#[from] TransportError),
    /// `broker_url` named no brokers at all.
    #[error("at least one broker URI must be configured")]
    NoBrokers,
}

/// Wires together one or more brokers (with failover), an optional result
/// backend, and the task defaults needed to build [`Task`](crate::Task)s.
///
/// This façade is deliberately thin: it recognizes URI schemes, constructs
/// the matching transport, and otherwise just stores configuration for
/// [`Task::apply`](crate::Task::apply) to consult.
pub struct Client {
    pub(crate) brokers: Vec<Arc<dyn Broker>>,
    pub(crate) failover: Arc<dyn FailoverStrategy>,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) app_id: Arc<str>,
    pub(crate) hostname: Arc<str>,
    pub(crate) queue: Arc<str>,
    pub(crate) delivery_mode: DeliveryMode,
    pub(crate) hard_time_limit: Option<u64>,
    pub(crate) soft_time_limit: Option<u64>,
    /// Kept alive so the AMQP connector(s) this client opened keep serving;
    /// releasing them tears the underlying connections down.
    shutdown_gates: Vec<Latch>,
}

impl Client {
    /// Connects every configured broker and, if present, the result backend.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let app_id: Arc<str> = Arc::from(config.app_id.unwrap_or_else(|| format!("{}@{}", std::process::id(), hostname())));

        let broker_uris = config.broker_url.into_vec();
        if broker_uris.is_empty() {
            return Err(ClientError::NoBrokers);
        }

        let mut brokers: Vec<Arc<dyn Broker>> = Vec::with_capacity(broker_uris.len());
        let mut shutdown_gates = Vec::new();

        for (index, uri) in broker_uris.iter().enumerate() {
            let name: Arc<str> = Arc::from(format!("broker-{index}"));
            let (family, normalized) = uri::recognize(uri).ok_or_else(|| ClientError::UnrecognizedScheme(uri.clone()))?;

            let broker: Arc<dyn Broker> = match family {
                Family::Amqp => {
                    let handle = Handle::from_uri(name.as_ref(), &normalized)
                        .map_err(|error| ClientError::InvalidUri { uri: uri.clone(), reason: error.to_string() })?;
                    let shutdown = Latch::new();
                    let gateway = Connector::start(&handle, shutdown.gate());
                    shutdown_gates.push(shutdown);
                    Arc::new(AmqpBroker::new(name, gateway, config.pool_size))
                }
                Family::Redis => Arc::new(RedisBroker::connect(name, &normalized).await?),
            };

            brokers.push(broker);
        }

        let backend: Arc<dyn Backend> = match &config.result_backend {
            None => Arc::new(IgnoringBackend),
            Some(uri) => {
                let (family, normalized) =
                    uri::recognize(uri).ok_or_else(|| ClientError::UnrecognizedScheme(uri.clone()))?;

                match family {
                    Family::Amqp => {
                        let handle = Handle::from_uri("result-backend", &normalized)
                            .map_err(|error| ClientError::InvalidUri { uri: uri.clone(), reason: error.to_string() })?;
                        let shutdown = Latch::new();
                        let gateway = Connector::start(&handle, shutdown.gate());
                        shutdown_gates.push(shutdown);
                        Arc::new(RpcBackend::start("result-backend", gateway, Arc::clone(&app_id), config.pool_size).await?)
                    }
                    Family::Redis => Arc::new(RedisBackend::connect("result-backend", &normalized).await?),
                }
            }
        };

        Ok(Self {
            brokers,
            failover: Arc::new(RoundRobin::new()),
            backend,
            app_id,
            hostname: Arc::from(hostname()),
            queue: Arc::from(config.queue),
            delivery_mode: config.delivery_mode,
            hard_time_limit: config.hard_time_limit,
            soft_time_limit: config.soft_time_limit,
            shutdown_gates,
        })
    }

    /// Builds a [`Task`](crate::Task) bound to this client, ready to
    /// [`apply`](crate::Task::apply).
    pub fn create_task(self: &Arc<Self>, name: impl Into<Arc<str>>) -> crate::task::Task {
        crate::task::Task::new(Arc::clone(self), name.into())
    }

    /// Closes every broker and the result backend, then releases the
    /// connectors this client started.
    pub async fn close(&self) {
        for broker in &self.brokers {
            broker.close().await;
        }
        self.backend.close().await;

        for gate in &self.shutdown_gates {
            gate.release();
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned())
}
