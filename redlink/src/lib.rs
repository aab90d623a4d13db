//! Asynchronous client engine for a RESP-family key-value store
//!
//! `redlink` implements the protocol and connection core of a client:
//! a binary codec for the wire protocol (baseline and extended reply
//! types), pooled pipelined connections with strict per-connection
//! reply ordering, push-message subscriptions, and slot-based routing
//! across sharded deployments with MOVED/ASK redirect handling.
//!
//! # Quick Start
//!
//! ```no_run
//! use redlink::{Client, ConnectionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConnectionConfig::new("redis://localhost:6379");
//!     let client = Client::connect(config).await?;
//!
//!     client.set("mykey", "myvalue").await?;
//!     let value: Option<String> = client.get("mykey").await?;
//!     println!("Value: {:?}", value);
//!
//!     Ok(())
//! }
//! ```
//!
//! Anything beyond the typed helpers goes through the generic command
//! builder:
//!
//! ```no_run
//! # use redlink::{Client, Command, ConnectionConfig};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let client = Client::connect(ConnectionConfig::new("redis://localhost:6379")).await?;
//! let reply = client
//!     .execute(&Command::new("HSET").arg("user:1").arg("name").arg("alice"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]

pub mod client;
pub mod cluster;
pub mod command;
pub mod connection;
pub mod dispatcher;
pub mod pool;
pub mod protocol;
pub mod pubsub;

pub use client::Client;
pub use command::Command;

pub use redlink_core::{
    config::{ConnectionConfig, PoolConfig, ProtocolVersion, RetryPolicy, TlsConfig, TopologyMode},
    error::{RedisError, RedisResult},
    types::{Endpoint, NodeInfo, SlotRange},
    value::Reply,
};
