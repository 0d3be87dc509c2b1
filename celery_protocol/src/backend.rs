use crate::envelope::TaskEnvelope;
use crate::result::ResultEnvelope;
use crate::task_id::TaskId;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Failure from a broker or result backend operation.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The underlying transport (AMQP, Redis) reported a failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// `get` timed out waiting for a result.
    #[error("timed out waiting for a result")]
    Timeout,
    /// The backend was closed and rejected every pending wait.
    #[error("backend is disconnecting")]
    Disconnecting,
    /// The payload could not be decoded as a result envelope.
    #[error("malformed result payload: {0}")]
    Malformed(String),
    /// The task was built with `ignore_result`, so no result was ever kept.
    #[error("result was ignored for this task")]
    Ignored,
}

/// A place a [`TaskEnvelope`] can be published to.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes `envelope`, returning the transport's response string.
    async fn publish(&self, envelope: &TaskEnvelope) -> Result<String, TransportError>;

    /// Shuts this broker down gracefully. Idempotent.
    async fn close(&self);

    /// A short, human-readable identifier for logging/diagnostics.
    fn name(&self) -> &str;
}

/// A place a [`ResultEnvelope`] can be stored and later retrieved by task id.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stores `envelope`, returning the transport's response string.
    async fn put(&self, envelope: &ResultEnvelope) -> Result<String, TransportError>;

    /// Awaits the result for `task_id`, optionally bounded by `timeout`.
    async fn get(
        &self,
        task_id: &TaskId,
        timeout: Option<Duration>,
    ) -> Result<ResultEnvelope, TransportError>;

    /// Forgets any pending or cached result for `task_id`.
    async fn delete(&self, task_id: &TaskId) -> Result<String, TransportError>;

    /// Shuts this backend down, rejecting all pending waits. Idempotent.
    async fn close(&self);

    /// A lossy reconstruction of the backend's connection URI, or `None` if
    /// this backend does not support it (e.g. the RPC backend).
    fn uri(&self) -> Option<String>;
}

/// A [`Backend`] that rejects every `get` immediately; used when a task is
/// built with `ignore_result`.
pub struct IgnoringBackend;

#[async_trait]
impl Backend for IgnoringBackend {
    async fn put(&self, _envelope: &ResultEnvelope) -> Result<String, TransportError> {
        Ok("ignored".to_owned())
    }

    async fn get(
        &self,
        _task_id: &TaskId,
        _timeout: Option<Duration>,
    ) -> Result<ResultEnvelope, TransportError> {
        Err(TransportError::Ignored)
    }

    async fn delete(&self, _task_id: &TaskId) -> Result<String, TransportError> {
        Ok("no result found".to_owned())
    }

    async fn close(&self) {}

    fn uri(&self) -> Option<String> {
        None
    }
}
