#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

mod task_id;
pub use self::task_id::TaskId;

mod envelope;
pub use self::envelope::{
    build_envelope, DeliveryInfo, DeliveryMode, EnvelopeOptions, TaskEnvelope, TaskHeaders,
    TaskProperties,
};

mod result;
pub use self::result::{ResultEnvelope, TaskStatus};

mod packer;
pub use self::packer::{
    zlib_decompress, Compressor, CompressionKind, Encoder, JsonSerializer, PackError, Packed,
    Packer, Serializer, YamlSerializer,
};

mod backend;
pub use self::backend::{Backend, Broker, IgnoringBackend, TransportError};

mod failover;
pub use self::failover::{FailoverStrategy, RoundRobin};

mod result_handle;
pub use self::result_handle::ResultHandle;
