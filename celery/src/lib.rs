#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Recognizes broker/backend URI schemes and selects their transport family.
mod uri;

/// Defines [`ClientConfig`], the configuration accepted by
/// [`Client::connect`](Client::connect).
mod config;
pub use self::config::{BrokerUrl, ClientConfig};

/// Implements the [`Client`] façade.
mod client;
pub use self::client::{Client, ClientError};

/// Implements the [`Task`] builder returned by [`Client::create_task`].
mod task;
pub use self::task::{ApplyOptions, SerializerKind, Task};

/// Re-exports the core protocol types callers commonly need alongside
/// [`Client`]/[`Task`]: envelope/result types, the broker/backend traits,
/// and the failover strategy trait.
pub use celery_protocol::{
    Backend, Broker, CompressionKind, FailoverStrategy, ResultEnvelope, ResultHandle, RoundRobin,
    TaskId, TaskStatus, TransportError,
};
