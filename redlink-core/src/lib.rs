//! Core types and traits for the redlink client
//!
//! This crate provides the fundamental types, configuration and error
//! definitions shared by the connection engine and any command-wrapper
//! layer built on top of it.

#![deny(warnings)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::{
    ConnectionConfig, PoolConfig, ProtocolVersion, RetryPolicy, TlsConfig, TopologyMode,
};
pub use error::{RedisError, RedisResult};
pub use types::{Endpoint, NodeInfo, SlotRange};
pub use value::Reply;
