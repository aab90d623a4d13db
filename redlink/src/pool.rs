//! Bounded connection pooling
//!
//! The pool lends pipelined connection handles for one endpoint, lazily
//! creating them up to a configured maximum. Waiters queue fairly behind
//! a semaphore; an acquire that outlives its timeout fails with
//! `PoolExhausted` rather than waiting forever. Closed connections are
//! discarded on sight and replaced lazily on the next acquire.

use crate::connection::RedisConnection;
use crate::dispatcher::PipelinedConnection;
use async_trait::async_trait;
use redlink_core::{
    config::{ConnectionConfig, PoolConfig},
    error::{RedisError, RedisResult},
    types::Endpoint,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::debug;

/// Source of new connections for a pool
///
/// The seam exists so pool behavior is testable without a server; the
/// production provider dials the endpoint and runs the handshake.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Open a fresh pipelined connection
    async fn connect(&self) -> RedisResult<PipelinedConnection>;
}

/// Provider that dials one server endpoint
pub struct ServerConnectionProvider {
    endpoint: Endpoint,
    config: ConnectionConfig,
}

impl ServerConnectionProvider {
    /// Create a provider for the given endpoint
    pub fn new(endpoint: Endpoint, config: ConnectionConfig) -> Self {
        Self { endpoint, config }
    }
}

#[async_trait]
impl ConnectionProvider for ServerConnectionProvider {
    async fn connect(&self) -> RedisResult<PipelinedConnection> {
        let connection = RedisConnection::connect(&self.endpoint, self.config.clone()).await?;
        Ok(PipelinedConnection::spawn(connection))
    }
}

/// A connection checked out of the pool
///
/// Holds the capacity permit for as long as it is out; dropping the
/// guard without releasing it discards the connection but frees the
/// capacity.
pub struct PooledConnection {
    connection: PipelinedConnection,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// A clone of the underlying handle, usable after release
    #[must_use]
    pub fn handle(&self) -> PipelinedConnection {
        self.connection.clone()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = PipelinedConnection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

/// Bounded pool of pipelined connections to one endpoint
pub struct ConnectionPool {
    provider: Arc<dyn ConnectionProvider>,
    idle: Mutex<Vec<PipelinedConnection>>,
    semaphore: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl ConnectionPool {
    /// Create a pool over the given provider
    pub fn new(provider: Arc<dyn ConnectionProvider>, config: &PoolConfig) -> Self {
        Self {
            provider,
            idle: Mutex::new(Vec::new()),
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            acquire_timeout: config.acquire_timeout,
        }
    }

    /// Acquire a connection, suspending while the pool is at capacity.
    ///
    /// Waiters are served in arrival order. Fails with `PoolExhausted`
    /// when no capacity frees up within the acquire timeout; never
    /// returns a closed connection.
    pub async fn acquire(&self) -> RedisResult<PooledConnection> {
        let permit = timeout(
            self.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| RedisError::PoolExhausted)?
        .map_err(|_| RedisError::Connect("connection pool closed".to_string()))?;

        loop {
            let candidate = self.idle.lock().await.pop();
            match candidate {
                Some(connection) if connection.is_closed() => {
                    debug!("discarding closed idle connection");
                }
                Some(connection) => {
                    return Ok(PooledConnection {
                        connection,
                        _permit: permit,
                    });
                }
                None => break,
            }
        }

        // below capacity and nothing idle: create lazily
        let connection = self.provider.connect().await?;
        Ok(PooledConnection {
            connection,
            _permit: permit,
        })
    }

    /// Return a connection to the idle set; an unhealthy connection is
    /// discarded instead and its capacity freed.
    pub async fn release(&self, pooled: PooledConnection) {
        let PooledConnection {
            connection,
            _permit,
        } = pooled;

        if connection.is_closed() {
            debug!("discarding unhealthy connection on release");
            return;
        }
        self.idle.lock().await.push(connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Transport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockProvider {
        connects: AtomicUsize,
    }

    impl MockProvider {
        fn new() -> Self {
            Self {
                connects: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ConnectionProvider for MockProvider {
        async fn connect(&self) -> RedisResult<PipelinedConnection> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (client, server) = tokio::io::duplex(256);
            // hold the server end open so the connection stays healthy
            tokio::spawn(async move {
                let _server = server;
                futures_util::future::pending::<()>().await;
            });
            let connection =
                RedisConnection::from_transport(Transport::Mem(client), ConnectionConfig::default());
            Ok(PipelinedConnection::spawn(connection))
        }
    }

    fn pool_with(max_size: usize, acquire_timeout: Duration) -> (ConnectionPool, Arc<MockProvider>) {
        let provider = Arc::new(MockProvider::new());
        let config = PoolConfig {
            max_size,
            acquire_timeout,
        };
        (
            ConnectionPool::new(Arc::clone(&provider) as Arc<dyn ConnectionProvider>, &config),
            provider,
        )
    }

    #[tokio::test]
    async fn test_never_exceeds_max_size() {
        let (pool, provider) = pool_with(2, Duration::from_millis(50));

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!(provider.connects.load(Ordering::SeqCst), 2);

        // at capacity: the next acquire must suspend, then fail
        let result = pool.acquire().await;
        assert!(matches!(result, Err(RedisError::PoolExhausted)));
        assert_eq!(provider.connects.load(Ordering::SeqCst), 2);

        drop((first, second));
    }

    #[tokio::test]
    async fn test_release_unblocks_waiter() {
        let (pool, provider) = pool_with(1, Duration::from_secs(1));

        let first = pool.acquire().await.unwrap();
        pool.release(first).await;

        let second = pool.acquire().await.unwrap();
        // the released connection was reused, not replaced
        assert_eq!(provider.connects.load(Ordering::SeqCst), 1);
        drop(second);
    }

    #[tokio::test]
    async fn test_closed_connection_is_discarded() {
        let (pool, provider) = pool_with(1, Duration::from_secs(1));

        let first = pool.acquire().await.unwrap();
        first.poison();
        pool.release(first).await;

        // discarded on release; the next acquire creates a replacement
        let second = pool.acquire().await.unwrap();
        assert!(!second.is_closed());
        assert_eq!(provider.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_frees_capacity() {
        struct FailingProvider;

        #[async_trait]
        impl ConnectionProvider for FailingProvider {
            async fn connect(&self) -> RedisResult<PipelinedConnection> {
                Err(RedisError::Connect("nobody home".to_string()))
            }
        }

        let config = PoolConfig {
            max_size: 1,
            acquire_timeout: Duration::from_millis(50),
        };
        let pool = ConnectionPool::new(Arc::new(FailingProvider), &config);

        for _ in 0..3 {
            // each failure must return the permit, not leak capacity
            assert!(matches!(pool.acquire().await, Err(RedisError::Connect(_))));
        }
    }
}
