use thiserror::Error;

/// Errors raised by the AMQP broker and RPC result backend.
#[derive(Error, Debug)]
pub enum AmqpError {
    /// Declaring a queue or exchange failed.
    #[error("failed to declare '{name}': {source}")]
    Declaration {
        /// The name of the queue or exchange that failed to declare.
        name: String,
        /// The underlying `lapin` error.
        #[source]
        source: lapin::Error,
    },

    /// A publish (or `basic_get`/`basic_consume` setup) failed outright,
    /// rather than merely hitting write backpressure.
    #[error("failed to publish to '{routing_key}': {source}")]
    Publish {
        /// The routing key the publish targeted.
        routing_key: String,
        /// The underlying `lapin` error.
        #[source]
        source: lapin::Error,
    },

    /// Starting a consumer for the RPC reply queue failed.
    #[error("failed to start consuming '{queue}': {source}")]
    Consume {
        /// The queue that could not be consumed.
        queue: String,
        /// The underlying `lapin` error.
        #[source]
        source: lapin::Error,
    },

    /// A delivery on the reply queue was not valid UTF-8.
    #[error("reply queue delivery for correlation id '{correlation_id}' was not valid UTF-8")]
    InvalidReplyEncoding {
        /// The correlation id of the offending delivery.
        correlation_id: String,
    },
}
