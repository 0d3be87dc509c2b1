#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Exposes a handle for a single RabbitMQ broker's connection credentials.
mod handle;
pub use self::handle::{Handle, HandleUriError};

/// Exposes machinery for maintaining a connection to a RabbitMQ cluster.
mod connector;
pub use self::connector::{Connector, Gateway};

/// Exposes the `lapin` property-building glue used by the broker and RPC
/// backend.
mod properties;
pub use self::properties::amqp_properties;

/// Exposes the AMQP broker ([`celery_protocol::Broker`] implementation).
mod broker;
pub use self::broker::AmqpBroker;

/// Exposes the RabbitMQ RPC result backend ([`celery_protocol::Backend`]
/// implementation).
mod rpc;
pub use self::rpc::RpcBackend;

mod error;
pub use self::error::AmqpError;
