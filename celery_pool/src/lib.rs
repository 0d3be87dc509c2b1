#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

mod pool;
pub use self::pool::{Leased, Pool, PoolError};
