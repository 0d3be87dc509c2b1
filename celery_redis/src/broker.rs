use celery_protocol::{Broker, TaskEnvelope, TransportError};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;

/// The list key Celery workers `BRPOP` from.
const QUEUE_KEY: &str = "celery";

/// A Redis [`Broker`]: `LPUSH`es JSON-encoded task envelopes onto the
/// `celery` list.
pub struct RedisBroker {
    name: Arc<str>,
    connection: ConnectionManager,
}

impl RedisBroker {
    /// Connects to the Redis instance at `uri`.
    pub async fn connect(name: impl Into<Arc<str>>, uri: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(uri)
            .map_err(|error| TransportError::Transport(format!("invalid Redis URI: {error}")))?;

        let connection = client
            .get_connection_manager()
            .await
            .map_err(|error| TransportError::Transport(format!("failed to connect to Redis: {error}")))?;

        Ok(Self { name: name.into(), connection })
    }
}

#[async_trait::async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, envelope: &TaskEnvelope) -> Result<String, TransportError> {
        let payload = serde_json::to_string(envelope)
            .map_err(|error| TransportError::Malformed(error.to_string()))?;

        let mut connection = self.connection.clone();
        let response: i64 = connection
            .lpush(QUEUE_KEY, payload)
            .await
            .map_err(|error| TransportError::Transport(error.to_string()))?;

        Ok(response.to_string())
    }

    async fn close(&self) {
        // `ConnectionManager` has no explicit disconnect; dropping the last
        // clone tears the underlying connection down.
    }

    fn name(&self) -> &str {
        &self.name
    }
}
