use crate::client::Client;
use celery_protocol::{
    build_envelope, CompressionKind, EnvelopeOptions, IgnoringBackend, JsonSerializer, Packer,
    ResultHandle, Serializer, TaskId, YamlSerializer,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// The wire serializer a task's body is packed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializerKind {
    /// `application/json`; the default.
    #[default]
    Json,
    /// `application/x-yaml`.
    Yaml,
}

/// Per-invocation overrides accepted by [`Task::apply`].
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Scheduled execution time; `None` runs as soon as a worker picks it up.
    pub eta: Option<DateTime<Utc>>,
    /// The point after which a worker should discard the task unexecuted.
    pub expires: Option<DateTime<Utc>>,
    /// 0 (lowest) through 255 (highest).
    pub priority: u8,
    /// Body compression.
    pub compression: CompressionKind,
    /// Body serialization format.
    pub serializer: SerializerKind,
    /// If set, the result backend is bypassed entirely for this task.
    pub ignore_result: bool,
    /// Overrides the client's default queue for this task only.
    pub queue: Option<String>,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            eta: None,
            expires: None,
            priority: 0,
            compression: CompressionKind::Identity,
            serializer: SerializerKind::default(),
            ignore_result: false,
            queue: None,
        }
    }
}

/// A bound task name, ready to be [`apply`](Task::apply)'d with arguments.
///
/// Constructed via [`Client::create_task`].
pub struct Task {
    client: Arc<Client>,
    name: Arc<str>,
}

const MAX_PUBLISH_RETRY_SLEEP: Duration = Duration::from_secs(5);

impl Task {
    pub(crate) fn new(client: Arc<Client>, name: Arc<str>) -> Self {
        Self { client, name }
    }

    /// Builds and publishes a task envelope for `(args, kwargs)`, returning a
    /// [`ResultHandle`] whose background fetch has already started.
    ///
    /// Publish failures trigger failover to the next broker (per the
    /// client's [`FailoverStrategy`](celery_protocol::FailoverStrategy)) and
    /// retry indefinitely; bound the wait with the result handle's own
    /// `get(timeout)` or with `options.expires`.
    pub async fn apply(&self, args: Value, kwargs: Value, options: ApplyOptions) -> ResultHandle {
        let task_id = TaskId::generate();

        let backend = if options.ignore_result {
            Arc::new(IgnoringBackend) as Arc<dyn celery_protocol::Backend>
        } else {
            Arc::clone(&self.client.backend)
        };
        let result_handle = ResultHandle::new(task_id.clone(), backend);

        let serializer: Box<dyn Serializer> = match options.serializer {
            SerializerKind::Json => Box::new(JsonSerializer),
            SerializerKind::Yaml => Box::new(YamlSerializer),
        };
        let packer = Packer::new(serializer, options.compression);

        let queue = options.queue.unwrap_or_else(|| self.client.queue.to_string());
        let origin = format!("{}@{}", std::process::id(), self.client.hostname);

        let envelope = build_envelope(
            &packer,
            EnvelopeOptions {
                task_id: &task_id,
                task_name: &self.name,
                queue: &queue,
                exchange: "",
                args,
                kwargs,
                reply_to: &self.client.app_id,
                origin: &origin,
                delivery_mode: self.client.delivery_mode,
                priority: options.priority,
                soft_time_limit: self.client.soft_time_limit,
                hard_time_limit: self.client.hard_time_limit,
                eta: options.eta,
                expires: options.expires,
                parent_id: None,
                root_id: None,
                group: None,
            },
        )
        .expect("packing a freshly built envelope body never fails for the built-in serializers");

        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            publish_with_failover(&client, &envelope).await;
        });

        result_handle
    }
}

async fn publish_with_failover(client: &Client, envelope: &celery_protocol::TaskEnvelope) {
    let mut attempt: u32 = 0;

    loop {
        let broker = client.failover.choose(&client.brokers);

        match broker.publish(envelope).await {
            Ok(_) => return,
            Err(error) => {
                attempt += 1;
                warn!(broker = broker.name(), attempt, task = %envelope.headers.task, %error, "publish failed; retrying via failover");
                tokio::time::sleep(backoff_sleep(attempt)).await;
            }
        }
    }
}

fn backoff_sleep(attempt: u32) -> Duration {
    Duration::from_millis(100 * attempt as u64).min(MAX_PUBLISH_RETRY_SLEEP)
}
