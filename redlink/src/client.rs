//! High-level client
//!
//! Ties the engine together: detects (or is told) whether the target is
//! a standalone server or a sharded deployment, then routes every
//! command through a dispatcher or the cluster router. A small set of
//! typed helpers shows the shape external command wrappers take; they
//! all reduce to building a `Command` and calling `execute`.

use crate::cluster::ClusterRouter;
use crate::command::Command;
use crate::connection::RedisConnection;
use crate::dispatcher::Dispatcher;
use crate::pubsub::Subscriber;
use redlink_core::{
    config::{ConnectionConfig, TopologyMode},
    error::{RedisError, RedisResult},
    types::Endpoint,
    value::Reply,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

enum Backend {
    Standalone(Dispatcher),
    Cluster(ClusterRouter),
}

struct ClientInner {
    backend: Backend,
    config: ConnectionConfig,
    endpoints: Vec<Endpoint>,
}

/// Asynchronous client handle; cheap to clone and share across tasks
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect using the given configuration.
    ///
    /// With `TopologyMode::Auto` the first reachable endpoint is probed
    /// to decide between standalone and cluster operation.
    pub async fn connect(config: ConnectionConfig) -> RedisResult<Self> {
        let endpoints = config.parse_endpoints();
        if endpoints.is_empty() && config.unix_socket.is_none() {
            return Err(RedisError::Config("no endpoints specified".to_string()));
        }

        let mode = match config.topology_mode {
            TopologyMode::Standalone => TopologyMode::Standalone,
            TopologyMode::Cluster => TopologyMode::Cluster,
            TopologyMode::Auto => Self::detect_topology(&endpoints, &config).await?,
        };

        let backend = match mode {
            TopologyMode::Cluster => {
                info!("connecting in cluster mode");
                Backend::Cluster(ClusterRouter::connect(endpoints.clone(), config.clone()).await?)
            }
            _ => {
                info!("connecting in standalone mode");
                let primary = endpoints
                    .first()
                    .cloned()
                    .unwrap_or_else(|| Endpoint::new("localhost", 6379));
                Backend::Standalone(Dispatcher::for_endpoint(primary, &config))
            }
        };

        Ok(Self {
            inner: Arc::new(ClientInner {
                backend,
                config,
                endpoints,
            }),
        })
    }

    /// Probe the deployment kind via a short-lived connection.
    async fn detect_topology(
        endpoints: &[Endpoint],
        config: &ConnectionConfig,
    ) -> RedisResult<TopologyMode> {
        if config.unix_socket.is_some() {
            // sharding is address-based; a socket path is standalone
            return Ok(TopologyMode::Standalone);
        }

        let mut last_error = RedisError::Config("no endpoints specified".to_string());
        for endpoint in endpoints {
            match RedisConnection::connect(endpoint, config.clone()).await {
                Ok(mut conn) => {
                    let probe = conn.execute(&Command::new("CLUSTER").arg("INFO")).await;
                    conn.close().await;

                    return Ok(match probe {
                        Ok(reply) => {
                            let text = reply.as_string().unwrap_or_default();
                            if text.contains("cluster_enabled:1") {
                                TopologyMode::Cluster
                            } else {
                                TopologyMode::Standalone
                            }
                        }
                        // servers without cluster support reject the probe
                        Err(RedisError::Server(_)) => TopologyMode::Standalone,
                        Err(e) => return Err(e),
                    });
                }
                Err(e) => {
                    warn!("topology probe via {endpoint} failed: {e}");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Execute one command
    pub async fn execute(&self, command: &Command) -> RedisResult<Reply> {
        match &self.inner.backend {
            Backend::Standalone(dispatcher) => dispatcher.execute(command).await,
            Backend::Cluster(router) => router.execute(command).await,
        }
    }

    /// Execute a batch of commands back-to-back on one connection,
    /// returning replies in command order
    pub async fn execute_batch(&self, commands: &[Command]) -> RedisResult<Vec<Reply>> {
        match &self.inner.backend {
            Backend::Standalone(dispatcher) => dispatcher.execute_batch(commands).await,
            Backend::Cluster(router) => router.execute_batch(commands).await,
        }
    }

    /// Open a dedicated push-mode connection for subscriptions.
    ///
    /// The connection never joins the request/response pool.
    pub async fn subscriber(&self) -> RedisResult<Subscriber> {
        let endpoint = self
            .inner
            .endpoints
            .first()
            .cloned()
            .unwrap_or_else(|| Endpoint::new("localhost", 6379));
        let connection = RedisConnection::connect(&endpoint, self.inner.config.clone()).await?;
        Ok(Subscriber::spawn(connection))
    }

    // Typed convenience layer; the full command vocabulary lives in
    // wrapper crates built on `execute`.

    /// Get the value of a key
    pub async fn get(&self, key: impl AsRef<str>) -> RedisResult<Option<String>> {
        let reply = self
            .execute(&Command::new("GET").arg(key.as_ref()))
            .await?;
        if reply.is_null() {
            Ok(None)
        } else {
            Ok(Some(reply.as_string()?))
        }
    }

    /// Set the value of a key
    pub async fn set(&self, key: impl AsRef<str>, value: impl AsRef<str>) -> RedisResult<bool> {
        let reply = self
            .execute(&Command::new("SET").arg(key.as_ref()).arg(value.as_ref()))
            .await?;
        Ok(matches!(reply, Reply::SimpleString(ref s) if s == "OK"))
    }

    /// Set with a time-to-live
    pub async fn set_ex(
        &self,
        key: impl AsRef<str>,
        value: impl AsRef<str>,
        ttl: Duration,
    ) -> RedisResult<bool> {
        let command = Command::new("SET")
            .arg(key.as_ref())
            .arg(value.as_ref())
            .arg("EX")
            .arg(ttl.as_secs());
        let reply = self.execute(&command).await?;
        Ok(matches!(reply, Reply::SimpleString(ref s) if s == "OK"))
    }

    /// Delete keys, returning how many existed
    pub async fn del(&self, keys: &[&str]) -> RedisResult<i64> {
        let command = Command::new("DEL").args(keys.iter().copied());
        self.execute(&command).await?.as_int()
    }

    /// Increment the integer value of a key by one
    pub async fn incr(&self, key: impl AsRef<str>) -> RedisResult<i64> {
        self.execute(&Command::new("INCR").arg(key.as_ref()))
            .await?
            .as_int()
    }

    /// Set a key's time to live
    pub async fn expire(&self, key: impl AsRef<str>, ttl: Duration) -> RedisResult<bool> {
        let command = Command::new("EXPIRE")
            .arg(key.as_ref())
            .arg(ttl.as_secs());
        self.execute(&command).await?.as_bool()
    }

    /// Publish a message, returning the number of receiving subscribers
    pub async fn publish(
        &self,
        channel: impl AsRef<str>,
        payload: impl AsRef<str>,
    ) -> RedisResult<i64> {
        let command = Command::new("PUBLISH")
            .arg(channel.as_ref())
            .arg(payload.as_ref());
        self.execute(&command).await?.as_int()
    }

    /// Check the connection
    pub async fn ping(&self) -> RedisResult<()> {
        let reply = self.execute(&Command::new("PING")).await?;
        match reply {
            Reply::SimpleString(ref s) if s == "PONG" => Ok(()),
            other => Err(RedisError::Protocol(format!(
                "unexpected PING reply: {other:?}"
            ))),
        }
    }
}
