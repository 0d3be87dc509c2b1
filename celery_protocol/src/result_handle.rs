use crate::backend::{Backend, TransportError};
use crate::task_id::TaskId;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::time::Duration;

/// Wraps a single [`Backend::get`] call, started as a background task at
/// construction time. Exposes a memoized, timeout-racing [`get`](Self::get):
/// the first call (with or without a timeout) observes the underlying
/// result once it arrives; later calls replay the same memoized outcome,
/// whether the first call timed out or not — the background fetch keeps
/// running and future callers still see it land.
pub struct ResultHandle {
    task_id: TaskId,
    backend: Arc<dyn Backend>,
    state: Arc<RwLock<Option<Result<Value, TransportError>>>>,
    ready: Arc<Notify>,
}

impl ResultHandle {
    /// Starts awaiting `task_id`'s result on `backend` in the background.
    pub fn new(task_id: TaskId, backend: Arc<dyn Backend>) -> Self {
        let state = Arc::new(RwLock::new(None));
        let ready = Arc::new(Notify::new());

        let background_backend = Arc::clone(&backend);
        let background_task_id = task_id.clone();
        let background_state = Arc::clone(&state);
        let background_ready = Arc::clone(&ready);

        tokio::spawn(async move {
            let outcome = background_backend
                .get(&background_task_id, None)
                .await
                .map(|envelope| envelope.result);

            *background_state.write().await = Some(outcome);
            background_ready.notify_waiters();
        });

        Self { task_id, backend, state, ready }
    }

    /// Awaits the result, optionally bounded by `timeout`. A timeout yields
    /// [`TransportError::Timeout`] without cancelling the background fetch;
    /// a later `get` call (with or without a timeout) may still observe the
    /// eventual outcome.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Value, TransportError> {
        // Register intent to be notified *before* checking the current
        // state, so a settle landing in between is never missed: `Notify`
        // only guarantees delivery to waiters that already called
        // `notified()` by the time `notify_waiters` runs.
        let wait = self.ready.notified();

        if let Some(outcome) = self.state.read().await.clone() {
            return outcome;
        }

        match timeout {
            None => {
                wait.await;
            }
            Some(timeout) => {
                if tokio::time::timeout(timeout, wait).await.is_err() {
                    return Err(TransportError::Timeout);
                }
            }
        }

        match self.state.read().await.clone() {
            Some(outcome) => outcome,
            // Notified before the writer finished storing; re-check is cheap
            // and this path is only reachable on a narrow race window.
            None => Err(TransportError::Timeout),
        }
    }

    /// Removes this task's result from the backend.
    pub async fn delete(&self) -> Result<String, TransportError> {
        self.backend.delete(&self.task_id).await
    }

    /// The id of the task this handle tracks.
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }
}
