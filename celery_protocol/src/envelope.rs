use crate::packer::{PackError, Packer};
use crate::task_id::TaskId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

/// The `properties.delivery_info` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryInfo {
    /// The exchange the task was published to; `""` for the default
    /// exchange, which is the only exchange this library's broker publishes
    /// to today.
    pub exchange: String,
    /// The routing key, equal to the target queue name.
    pub routing_key: String,
}

/// Delivery mode for a task publish: `2` is persistent, `1` is transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Persistent delivery (`2`); the default.
    Persistent,
    /// Transient delivery (`1`).
    Transient,
}

impl DeliveryMode {
    fn as_wire_value(self) -> u8 {
        match self {
            DeliveryMode::Persistent => 2,
            DeliveryMode::Transient => 1,
        }
    }
}

/// The header map of a task envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskHeaders {
    pub id: String,
    pub task: String,
    pub root_id: String,
    pub parent_id: Option<String>,
    pub group: Option<String>,
    pub lang: &'static str,
    pub timelimit: (Option<u64>, Option<u64>),
    pub eta: Option<String>,
    pub expires: Option<String>,
    pub retries: u32,
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<&'static str>,
}

/// The properties map of a task envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskProperties {
    pub correlation_id: String,
    pub reply_to: String,
    pub content_type: &'static str,
    pub content_encoding: &'static str,
    pub body_encoding: &'static str,
    pub delivery_mode: u8,
    pub priority: u8,
    pub delivery_info: DeliveryInfo,
}

/// A fully built task envelope: the `(headers, properties, body)` triple
/// published to a broker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEnvelope {
    pub headers: TaskHeaders,
    pub properties: TaskProperties,
    pub body: String,
}

/// Everything the builder needs to assemble one [`TaskEnvelope`].
pub struct EnvelopeOptions<'a> {
    pub task_id: &'a TaskId,
    pub task_name: &'a str,
    pub queue: &'a str,
    pub exchange: &'a str,
    pub args: Value,
    pub kwargs: Value,
    pub reply_to: &'a str,
    pub origin: &'a str,
    pub delivery_mode: DeliveryMode,
    pub priority: u8,
    pub soft_time_limit: Option<u64>,
    pub hard_time_limit: Option<u64>,
    pub eta: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub parent_id: Option<String>,
    pub root_id: Option<String>,
    pub group: Option<String>,
}

/// Builds a [`TaskEnvelope`] per the wire invariants: `headers.id ==
/// properties.correlation_id`, `root_id` defaults to `id` when there is no
/// parent, `lang` is always `"py"`, and the body is the packed 3-tuple
/// `[args, kwargs, {callbacks, chain, chord, errbacks}]`.
pub fn build_envelope(packer: &Packer, options: EnvelopeOptions<'_>) -> Result<TaskEnvelope, PackError> {
    let id = options.task_id.as_str().to_owned();
    let root_id = options.root_id.unwrap_or_else(|| id.clone());

    let embedded = json!([
        options.args,
        options.kwargs,
        { "callbacks": Value::Null, "chain": Value::Null, "chord": Value::Null, "errbacks": Value::Null },
    ]);
    let packed = packer.pack(&embedded)?;

    let headers = TaskHeaders {
        id: id.clone(),
        task: options.task_name.to_owned(),
        root_id,
        parent_id: options.parent_id,
        group: options.group,
        lang: "py",
        timelimit: (options.soft_time_limit, options.hard_time_limit),
        eta: options.eta.map(|dt| dt.to_rfc3339()),
        expires: options.expires.map(|dt| dt.to_rfc3339()),
        retries: 0,
        origin: options.origin.to_owned(),
        compression: packed.compression_header,
    };

    let properties = TaskProperties {
        correlation_id: id,
        reply_to: options.reply_to.to_owned(),
        content_type: packed.content_type,
        content_encoding: "utf-8",
        body_encoding: packed.body_encoding,
        delivery_mode: options.delivery_mode.as_wire_value(),
        priority: options.priority,
        delivery_info: DeliveryInfo {
            exchange: options.exchange.to_owned(),
            routing_key: options.queue.to_owned(),
        },
    };

    Ok(TaskEnvelope { headers, properties, body: packed.body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packer::{CompressionKind, JsonSerializer};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn options(task_id: &TaskId) -> EnvelopeOptions<'_> {
        EnvelopeOptions {
            task_id,
            task_name: "tasks.add",
            queue: "celery",
            exchange: "",
            args: json!([1, 2]),
            kwargs: json!({}),
            reply_to: "app-1",
            origin: "123@host",
            delivery_mode: DeliveryMode::Persistent,
            priority: 0,
            soft_time_limit: None,
            hard_time_limit: None,
            eta: None,
            expires: None,
            parent_id: None,
            root_id: None,
            group: None,
        }
    }

    #[test]
    fn invariants_hold_for_a_root_task() {
        // Given
        let task_id = TaskId::generate();
        let packer = Packer::new(Box::new(JsonSerializer), CompressionKind::Identity);

        // When
        let envelope = build_envelope(&packer, options(&task_id)).unwrap();

        // Then
        assert_eq!(envelope.headers.id, task_id.as_str());
        assert_eq!(envelope.properties.correlation_id, task_id.as_str());
        assert_eq!(envelope.headers.root_id, envelope.headers.id);
        assert_eq!(envelope.headers.parent_id, None);
        assert_eq!(envelope.headers.lang, "py");
        assert_eq!(envelope.headers.compression, None);
        assert_eq!(envelope.properties.body_encoding, "utf-8");
        assert_eq!(envelope.properties.content_type, "application/json");
        assert_eq!(envelope.properties.content_encoding, "utf-8");
        assert_eq!(envelope.properties.delivery_mode, 2);
        assert_eq!(envelope.properties.delivery_info.exchange, "");
        assert_eq!(envelope.properties.delivery_info.routing_key, "celery");
        assert_eq!(envelope.properties.reply_to, "app-1");
    }

    #[test]
    fn transient_delivery_mode_is_one() {
        // Given
        let task_id = TaskId::generate();
        let packer = Packer::new(Box::new(JsonSerializer), CompressionKind::Identity);
        let mut opts = options(&task_id);
        opts.delivery_mode = DeliveryMode::Transient;

        // When
        let envelope = build_envelope(&packer, opts).unwrap();

        // Then
        assert_eq!(envelope.properties.delivery_mode, 1);
    }
}
