//! Error types for client operations

use std::io;
use thiserror::Error;

/// Result type used throughout the client
pub type RedisResult<T> = Result<T, RedisError>;

/// Error taxonomy for the protocol/connection/routing engine
///
/// Every failure surfaced to a caller is exactly one of these kinds;
/// redirects (`Moved`/`Ask`) are normally consumed by the cluster router
/// and only escape when routing gives up.
#[derive(Error, Debug)]
pub enum RedisError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Endpoint unreachable or transport-level connect failure
    #[error("Connect error: {0}")]
    Connect(String),

    /// Credential rejected during the handshake
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Wire protocol violation; the affected connection is unusable
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport EOF or IO failure with requests in flight
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// No connection became available within the acquire timeout
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Keys of a multi-key command hash to different cluster slots
    #[error("Cross-slot command: {0}")]
    CrossSlot(String),

    /// MOVED redirect in cluster mode
    #[error("MOVED redirect: slot {slot} to {host}:{port}")]
    Moved {
        /// Slot number that was moved
        slot: u16,
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },

    /// ASK redirect in cluster mode
    #[error("ASK redirect: slot {slot} to {host}:{port}")]
    Ask {
        /// Slot number for temporary redirect
        slot: u16,
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },

    /// Redirect retry bound exceeded
    #[error("Routing failed after {0} redirects")]
    Routing(usize),

    /// The whole batch was discarded by the server
    #[error("Transaction aborted")]
    TransactionAborted,

    /// Server returned an error reply
    #[error("Server error: {0}")]
    Server(String),

    /// Reply could not be converted to the requested type
    #[error("Type conversion error: {0}")]
    Type(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl RedisError {
    /// Classify an error reply by its leading token.
    ///
    /// Redirect markers become `Moved`/`Ask`, abort markers become
    /// `TransactionAborted`, authentication refusals become `Auth`;
    /// anything else is surfaced as `Server` with the original text.
    #[must_use]
    pub fn from_server_error(msg: &str) -> Self {
        if let Some(redirect) = Self::parse_redirect(msg) {
            return redirect;
        }

        let code = msg.split(' ').next().unwrap_or("");
        match code {
            "EXECABORT" => Self::TransactionAborted,
            "NOAUTH" | "WRONGPASS" => Self::Auth(msg.to_string()),
            "CROSSSLOT" => Self::CrossSlot(msg.to_string()),
            _ => Self::Server(msg.to_string()),
        }
    }

    /// Parse an error reply to check for MOVED or ASK redirects
    #[must_use]
    pub fn parse_redirect(msg: &str) -> Option<Self> {
        let (kind, rest) = msg.split_once(' ')?;
        if kind != "MOVED" && kind != "ASK" {
            return None;
        }

        let (slot_str, addr) = rest.split_once(' ')?;
        let slot = slot_str.parse::<u16>().ok()?;
        let (host, port_str) = addr.rsplit_once(':')?;
        let port = port_str.parse::<u16>().ok()?;

        Some(if kind == "MOVED" {
            Self::Moved {
                slot,
                host: host.to_string(),
                port,
            }
        } else {
            Self::Ask {
                slot,
                host: host.to_string(),
                port,
            }
        })
    }

    /// Check if this error is a redirect (MOVED or ASK)
    #[must_use]
    pub const fn is_redirect(&self) -> bool {
        matches!(self, Self::Moved { .. } | Self::Ask { .. })
    }

    /// Get the target address from a redirect error
    #[must_use]
    pub fn redirect_target(&self) -> Option<(String, u16)> {
        match self {
            Self::Moved { host, port, .. } | Self::Ask { host, port, .. } => {
                Some((host.clone(), *port))
            }
            _ => None,
        }
    }

    /// Get the slot number from a redirect error
    #[must_use]
    pub const fn redirect_slot(&self) -> Option<u16> {
        match self {
            Self::Moved { slot, .. } | Self::Ask { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    /// Whether retrying against a different endpoint may succeed
    #[must_use]
    pub const fn is_endpoint_failure(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::ConnectionLost(_) | Self::Io(_)
        )
    }
}
