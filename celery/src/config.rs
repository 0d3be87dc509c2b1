use celery_protocol::DeliveryMode;
use serde::{Deserialize, Deserializer};

/// One or more broker URIs, accepted either as a single string or a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BrokerUrl {
    /// A single broker.
    Single(String),
    /// An ordered list of brokers, cycled through by the failover strategy.
    Many(Vec<String>),
}

impl BrokerUrl {
    /// Flattens this value into an ordered list of broker URIs.
    pub fn into_vec(self) -> Vec<String> {
        match self {
            BrokerUrl::Single(uri) => vec![uri],
            BrokerUrl::Many(uris) => uris,
        }
    }
}

fn deserialize_delivery_mode<'de, D>(deserializer: D) -> Result<DeliveryMode, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;

    match raw.as_str() {
        "persistent" => Ok(DeliveryMode::Persistent),
        "transient" => Ok(DeliveryMode::Transient),
        other => Err(serde::de::Error::custom(format!(
            "unknown delivery mode '{other}', expected 'persistent' or 'transient'"
        ))),
    }
}

fn default_queue() -> String {
    "celery".to_owned()
}

fn default_delivery_mode() -> DeliveryMode {
    DeliveryMode::Persistent
}

/// The configuration accepted by [`Client::connect`](crate::Client::connect):
/// broker/backend selection plus the task defaults applied when a task's own
/// invocation options don't override them.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// One or more broker URIs; brokers are cycled through on publish
    /// failure per the configured failover strategy.
    pub broker_url: BrokerUrl,

    /// The result backend URI, if results are collected at all.
    #[serde(default)]
    pub result_backend: Option<String>,

    /// This client's unique identifier: used as the AMQP RPC backend's reply
    /// queue name and as the `origin` header's `<pid>@<hostname>`-style
    /// qualifier when no hostname is otherwise available.
    #[serde(default)]
    pub app_id: Option<String>,

    /// The default queue new tasks are published to, unless overridden
    /// per-task.
    #[serde(default = "default_queue")]
    pub queue: String,

    /// The default delivery mode for published tasks.
    #[serde(default = "default_delivery_mode", deserialize_with = "deserialize_delivery_mode")]
    pub delivery_mode: DeliveryMode,

    /// The default hard time limit (seconds) applied to tasks that don't
    /// specify their own.
    #[serde(default)]
    pub hard_time_limit: Option<u64>,

    /// The default soft time limit (seconds) applied to tasks that don't
    /// specify their own.
    #[serde(default)]
    pub soft_time_limit: Option<u64>,

    /// The number of pooled channels/connections each AMQP broker/backend
    /// maintains.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    2
}
