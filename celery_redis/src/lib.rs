#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Exposes the Redis broker ([`celery_protocol::Broker`] implementation).
mod broker;
pub use self::broker::RedisBroker;

/// Exposes the Redis pub/sub result backend ([`celery_protocol::Backend`]
/// implementation).
mod backend;
pub use self::backend::RedisBackend;
