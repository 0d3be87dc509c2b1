use celery_protocol::TaskEnvelope;
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::BasicProperties;
use serde_json::Value;

/// Builds the `lapin` [`BasicProperties`] for publishing `envelope`, taking
/// `content_encoding`, `content_type`, `correlation_id`, `delivery_mode`,
/// `headers`, `priority`, and `reply_to` from the envelope's properties (and
/// the header map itself, for `headers`).
pub fn amqp_properties(envelope: &TaskEnvelope) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from(envelope.properties.content_type))
        .with_content_encoding(ShortString::from(envelope.properties.content_encoding))
        .with_correlation_id(ShortString::from(envelope.properties.correlation_id.as_str()))
        .with_delivery_mode(envelope.properties.delivery_mode)
        .with_priority(envelope.properties.priority)
        .with_reply_to(ShortString::from(envelope.properties.reply_to.as_str()))
        .with_headers(headers_field_table(envelope))
}

fn headers_field_table(envelope: &TaskEnvelope) -> FieldTable {
    let value = serde_json::to_value(&envelope.headers).expect("task headers are always JSON-able");
    match json_to_amqp_value(&value) {
        AMQPValue::FieldTable(table) => table,
        _ => FieldTable::default(),
    }
}

fn json_to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AMQPValue::LongLongInt(i)
            } else {
                AMQPValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => AMQPValue::LongString(LongString::from(s.as_str())),
        Value::Array(items) => {
            let mut array = FieldArray::default();
            for item in items {
                array.push(json_to_amqp_value(item));
            }
            AMQPValue::FieldArray(array)
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, item) in map {
                table.insert(key.as_str().into(), json_to_amqp_value(item));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use celery_protocol::{
        build_envelope, CompressionKind, DeliveryMode, EnvelopeOptions, JsonSerializer, Packer, TaskId,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn carries_the_fixed_property_set() {
        // Given
        let task_id = TaskId::generate();
        let packer = Packer::new(Box::new(JsonSerializer), CompressionKind::Identity);
        let envelope = build_envelope(
            &packer,
            EnvelopeOptions {
                task_id: &task_id,
                task_name: "tasks.add",
                queue: "celery",
                exchange: "",
                args: json!([1, 2]),
                kwargs: json!({}),
                reply_to: "app-1",
                origin: "1@host",
                delivery_mode: DeliveryMode::Persistent,
                priority: 5,
                soft_time_limit: None,
                hard_time_limit: None,
                eta: None,
                expires: None,
                parent_id: None,
                root_id: None,
                group: None,
            },
        )
        .unwrap();

        // When
        let properties = amqp_properties(&envelope);

        // Then
        assert_eq!(properties.correlation_id().as_ref().map(|s| s.as_str()), Some(task_id.as_str()));
        assert_eq!(properties.reply_to().as_ref().map(|s| s.as_str()), Some("app-1"));
        assert_eq!(properties.delivery_mode(), &Some(2));
        assert_eq!(properties.priority(), &Some(5));
        assert_eq!(properties.content_type().as_ref().map(|s| s.as_str()), Some("application/json"));
    }
}
