//! Common types used throughout the library

use serde::{Deserialize, Serialize};
use std::fmt;

/// A server address (host and port)
///
/// Used as the key for topology entries and per-node dispatchers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or address
    pub host: String,
    /// Port number
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string; the last colon separates the port so
    /// bracketless IPv6-style hosts keep their colons
    #[must_use]
    pub fn parse(addr: &str) -> Option<Self> {
        let (host, port_str) = addr.rsplit_once(':')?;
        let port = port_str.parse::<u16>().ok()?;
        Some(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A contiguous slot range in a sharded deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    /// Start of the slot range (inclusive)
    pub start: u16,
    /// End of the slot range (inclusive)
    pub end: u16,
}

impl SlotRange {
    /// Create a new slot range
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Check if a slot is within this range
    #[must_use]
    pub const fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }
}

/// A node in a sharded deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node address
    pub endpoint: Endpoint,
    /// Slot ranges owned by this node
    pub slots: Vec<SlotRange>,
    /// Whether this is a replica rather than a primary
    pub is_replica: bool,
}

impl NodeInfo {
    /// Create a new primary node entry
    #[must_use]
    pub const fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            slots: Vec::new(),
            is_replica: false,
        }
    }

    /// Check if this node owns a given slot
    #[must_use]
    pub fn owns_slot(&self, slot: u16) -> bool {
        self.slots.iter().any(|range| range.contains(slot))
    }
}
