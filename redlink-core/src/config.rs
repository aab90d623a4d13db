//! Configuration types for client connections

use crate::types::Endpoint;
use std::path::PathBuf;
use std::time::Duration;

/// Protocol version preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// Baseline protocol - Default
    #[default]
    Resp2,
    /// Extended protocol with double/boolean/map/set/push types
    Resp3,
}

/// Topology detection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopologyMode {
    /// Automatically detect topology (Standalone or Cluster)
    #[default]
    Auto,
    /// Force standalone mode
    Standalone,
    /// Force cluster mode
    Cluster,
}

/// Configuration for connection pooling
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections per endpoint
    pub max_size: usize,
    /// Timeout for acquiring a connection from the pool
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Retry policy for cluster redirects and endpoint failover
///
/// The redirect bound and backoff schedule are operational knobs, not
/// protocol requirements, so they are configurable rather than fixed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of MOVED/ASK redirects followed per command
    pub max_redirects: usize,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for the backoff delay
    pub max_backoff: Duration,
    /// Backoff multiplier applied per attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_redirects: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the given retry attempt (first retry is 0)
    #[must_use]
    pub fn backoff(&self, attempt: usize) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let delay = self.initial_backoff.mul_f64(factor.max(1.0));
        delay.min(self.max_backoff)
    }
}

/// Transport security settings
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Server name for certificate verification; defaults to the endpoint host
    pub server_name: Option<String>,
}

/// Configuration for a client connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection string, e.g. `redis://localhost:6379` or
    /// `redis://host1:6379,host2:6379` for multiple seed endpoints
    pub connection_string: String,

    /// Optional username for authentication (requires `password`)
    pub username: Option<String>,

    /// Optional password for authentication
    pub password: Option<String>,

    /// Database number selected after the handshake (standalone only)
    pub database: u8,

    /// Connection name registered with the server, if any
    pub client_name: Option<String>,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Interval between a request being sent and its reply completing
    pub operation_timeout: Duration,

    /// Enable TCP keepalive with the given idle time
    pub tcp_keepalive: Option<Duration>,

    /// Unix domain socket path; overrides TCP endpoints when set
    pub unix_socket: Option<PathBuf>,

    /// Topology detection mode
    pub topology_mode: TopologyMode,

    /// Preferred protocol version; the handshake falls back to the
    /// baseline when the server rejects the upgrade
    pub protocol_version: ProtocolVersion,

    /// Transport security; plain TCP when `None`
    pub tls: Option<TlsConfig>,

    /// Pool configuration
    pub pool: PoolConfig,

    /// Redirect/retry policy
    pub retry: RetryPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_string: "redis://localhost:6379".to_string(),
            username: None,
            password: None,
            database: 0,
            client_name: None,
            connect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30),
            tcp_keepalive: Some(Duration::from_secs(60)),
            unix_socket: None,
            topology_mode: TopologyMode::default(),
            protocol_version: ProtocolVersion::default(),
            tls: None,
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration with the given connection string
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Default::default()
        }
    }

    /// Set the username and password for authentication
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the password for authentication
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the database number
    #[must_use]
    pub const fn with_database(mut self, database: u8) -> Self {
        self.database = database;
        self
    }

    /// Set the connection name registered with the server
    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Set the connection timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the operation timeout
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the topology mode
    #[must_use]
    pub const fn with_topology_mode(mut self, mode: TopologyMode) -> Self {
        self.topology_mode = mode;
        self
    }

    /// Set the preferred protocol version
    #[must_use]
    pub const fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Enable transport security
    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Set the pool configuration
    #[must_use]
    pub const fn with_pool_config(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the retry policy
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Connect over a unix domain socket instead of TCP
    #[must_use]
    pub fn with_unix_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.unix_socket = Some(path.into());
        self
    }

    /// Parse seed endpoints from the connection string
    #[must_use]
    pub fn parse_endpoints(&self) -> Vec<Endpoint> {
        let conn_str = self.connection_string.trim();

        let addr_part = conn_str
            .strip_prefix("rediss://")
            .or_else(|| conn_str.strip_prefix("redis://"))
            .unwrap_or(conn_str);

        addr_part
            .split(',')
            .filter_map(|endpoint| {
                let endpoint = endpoint.trim();
                if endpoint.is_empty() {
                    return None;
                }

                if let Some((host, port_str)) = endpoint.rsplit_once(':') {
                    if let Ok(port) = port_str.parse::<u16>() {
                        return Some(Endpoint::new(host, port));
                    }
                }

                // default port when not specified
                Some(Endpoint::new(endpoint, 6379))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_endpoint() {
        let config = ConnectionConfig::new("redis://localhost:6379");
        assert_eq!(config.parse_endpoints(), vec![Endpoint::new("localhost", 6379)]);
    }

    #[test]
    fn test_parse_multiple_endpoints() {
        let config = ConnectionConfig::new("redis://a:7000,b:7001, c:7002");
        let endpoints = config.parse_endpoints();
        assert_eq!(
            endpoints,
            vec![
                Endpoint::new("a", 7000),
                Endpoint::new("b", 7001),
                Endpoint::new("c", 7002),
            ]
        );
    }

    #[test]
    fn test_parse_default_port() {
        let config = ConnectionConfig::new("somehost");
        assert_eq!(config.parse_endpoints(), vec![Endpoint::new("somehost", 6379)]);
    }

    #[test]
    fn test_builder_chain() {
        let config = ConnectionConfig::new("redis://localhost:6379")
            .with_credentials("app", "secret")
            .with_database(2)
            .with_client_name("worker-1")
            .with_topology_mode(TopologyMode::Cluster);
        assert_eq!(config.username.as_deref(), Some("app"));
        assert_eq!(config.database, 2);
        assert_eq!(config.topology_mode, TopologyMode::Cluster);
    }

    #[test]
    fn test_backoff_schedule() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
        // capped
        assert_eq!(retry.backoff(10), Duration::from_secs(2));
    }
}
