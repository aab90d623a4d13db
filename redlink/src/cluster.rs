//! Cluster routing
//!
//! Maps each command's key(s) to a hash slot, tracks which endpoint owns
//! each slot, and follows MOVED/ASK redirects up to a configurable
//! bound. The topology lives in an immutable snapshot behind a single
//! mutation point: readers clone an `Arc`, updates swap the whole
//! snapshot, so routing decisions never see a half-applied change.

use crate::command::Command;
use crate::dispatcher::Dispatcher;
use crc16::{State, XMODEM};
use redlink_core::{
    config::ConnectionConfig,
    error::{RedisError, RedisResult},
    types::{Endpoint, NodeInfo, SlotRange},
    value::Reply,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Total number of hash slots
pub const SLOT_COUNT: u16 = 16384;

/// Calculate the hash slot for a key.
///
/// If the key contains a hash tag (`{...}` with at least one character
/// inside), only the tag is hashed, so related keys can be pinned to one
/// slot. The hash is CRC16 (XMODEM) mod the slot count.
#[must_use]
pub fn calculate_slot(key: &[u8]) -> u16 {
    State::<XMODEM>::calculate(extract_hash_tag(key)) % SLOT_COUNT
}

fn extract_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(offset) = key[start + 1..].iter().position(|&b| b == b'}') {
            if offset > 0 {
                return &key[start + 1..start + 1 + offset];
            }
        }
    }
    key
}

/// Slot for a command's keys, rejecting multi-slot commands before any
/// network I/O. Keyless commands return `None` and may run anywhere.
pub fn slot_for_command(command: &Command) -> RedisResult<Option<u16>> {
    let mut slot = None;
    for key in command.keys() {
        let key_slot = calculate_slot(key);
        match slot {
            None => slot = Some(key_slot),
            Some(previous) if previous != key_slot => {
                return Err(RedisError::CrossSlot(format!(
                    "keys hash to slots {previous} and {key_slot}"
                )));
            }
            Some(_) => {}
        }
    }
    Ok(slot)
}

/// Slot shared by every command in a batch
pub fn slot_for_batch(commands: &[Command]) -> RedisResult<Option<u16>> {
    let mut slot = None;
    for command in commands {
        if let Some(command_slot) = slot_for_command(command)? {
            match slot {
                None => slot = Some(command_slot),
                Some(previous) if previous != command_slot => {
                    return Err(RedisError::CrossSlot(format!(
                        "batch touches slots {previous} and {command_slot}"
                    )));
                }
                Some(_) => {}
            }
        }
    }
    Ok(slot)
}

/// One immutable view of the slot → endpoint mapping
#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    slot_map: HashMap<u16, Endpoint>,
    nodes: Vec<NodeInfo>,
}

impl TopologySnapshot {
    /// Build a snapshot from a `CLUSTER SLOTS` reply.
    ///
    /// The reply is an array of ranges: `[start, end, primary,
    /// replica...]` where each node is `[host, port, ...]`.
    pub fn from_cluster_slots(reply: &Reply) -> RedisResult<Self> {
        let malformed = |what: &str| RedisError::Protocol(format!("malformed slots reply: {what}"));

        let ranges = match reply {
            Reply::Array(ranges) => ranges,
            _ => return Err(malformed("expected an array of ranges")),
        };

        let parse_node = |entry: &Reply| -> RedisResult<Endpoint> {
            let fields = entry
                .as_array()
                .map_err(|_| malformed("node entry is not an array"))?;
            if fields.len() < 2 {
                return Err(malformed("node entry too short"));
            }
            let host = fields[0]
                .as_string()
                .map_err(|_| malformed("node host"))?;
            let port = fields[1].as_int().map_err(|_| malformed("node port"))?;
            let port = u16::try_from(port).map_err(|_| malformed("node port range"))?;
            Ok(Endpoint::new(host, port))
        };

        let mut snapshot = Self::default();
        for entry in ranges {
            let fields = entry
                .as_array()
                .map_err(|_| malformed("range entry is not an array"))?;
            if fields.len() < 3 {
                continue;
            }

            let start = fields[0].as_int().map_err(|_| malformed("range start"))?;
            let end = fields[1].as_int().map_err(|_| malformed("range end"))?;
            let (start, end) = (
                u16::try_from(start).map_err(|_| malformed("range start"))?,
                u16::try_from(end).map_err(|_| malformed("range end"))?,
            );
            let range = SlotRange::new(start, end);

            let primary = parse_node(&fields[2])?;
            for slot in start..=end {
                snapshot.slot_map.insert(slot, primary.clone());
            }
            snapshot.record_node(primary, range, false);

            for replica_entry in &fields[3..] {
                let replica = parse_node(replica_entry)?;
                snapshot.record_node(replica, range, true);
            }
        }

        Ok(snapshot)
    }

    fn record_node(&mut self, endpoint: Endpoint, range: SlotRange, is_replica: bool) {
        match self.nodes.iter_mut().find(|node| node.endpoint == endpoint) {
            Some(node) => node.slots.push(range),
            None => {
                let mut node = NodeInfo::new(endpoint);
                node.is_replica = is_replica;
                node.slots.push(range);
                self.nodes.push(node);
            }
        }
    }

    /// Owner of the given slot
    #[must_use]
    pub fn endpoint_for_slot(&self, slot: u16) -> Option<&Endpoint> {
        self.slot_map.get(&slot)
    }

    /// All known nodes
    #[must_use]
    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    /// Number of slots with a known owner
    #[must_use]
    pub fn mapped_slots(&self) -> usize {
        self.slot_map.len()
    }

    /// Whether the slot space is fully covered
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.slot_map.len() == usize::from(SLOT_COUNT)
    }

    /// Whether the endpoint currently owns any slots
    #[must_use]
    pub fn owns_slots(&self, endpoint: &Endpoint) -> bool {
        self.slot_map.values().any(|owner| owner == endpoint)
    }
}

/// Shared topology with snapshot-swap updates
#[derive(Clone, Default)]
pub struct ClusterTopology {
    current: Arc<RwLock<Arc<TopologySnapshot>>>,
}

impl ClusterTopology {
    /// Create an empty topology
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot
    pub async fn snapshot(&self) -> Arc<TopologySnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    /// Owner of the given slot in the current snapshot
    pub async fn endpoint_for_slot(&self, slot: u16) -> Option<Endpoint> {
        self.snapshot().await.endpoint_for_slot(slot).cloned()
    }

    /// Apply one MOVED redirect: the slot's entry is rewritten in a new
    /// snapshot, everything else is carried over.
    pub async fn apply_moved(&self, slot: u16, endpoint: Endpoint) {
        let mut guard = self.current.write().await;
        let mut next = (**guard).clone();
        next.slot_map.insert(slot, endpoint);
        *guard = Arc::new(next);
    }

    /// Replace the whole topology, typically after a slots query
    pub async fn replace(&self, snapshot: TopologySnapshot) {
        *self.current.write().await = Arc::new(snapshot);
    }
}

/// Routes commands across a sharded deployment
pub struct ClusterRouter {
    topology: ClusterTopology,
    dispatchers: RwLock<HashMap<Endpoint, Arc<Dispatcher>>>,
    seeds: Vec<Endpoint>,
    config: ConnectionConfig,
}

impl ClusterRouter {
    /// Create a router over the given seed endpoints without contacting
    /// them yet
    #[must_use]
    pub fn new(seeds: Vec<Endpoint>, config: ConnectionConfig) -> Self {
        // database selection does not exist on sharded deployments
        let mut config = config;
        config.database = 0;

        Self {
            topology: ClusterTopology::new(),
            dispatchers: RwLock::new(HashMap::new()),
            seeds,
            config,
        }
    }

    /// Create a router and load the initial topology from the first
    /// reachable seed
    pub async fn connect(seeds: Vec<Endpoint>, config: ConnectionConfig) -> RedisResult<Self> {
        let router = Self::new(seeds, config);
        router.refresh_topology().await?;
        Ok(router)
    }

    /// The shared topology
    #[must_use]
    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    /// Execute a command against the endpoint owning its slot, following
    /// redirects up to the configured bound.
    pub async fn execute(&self, command: &Command) -> RedisResult<Reply> {
        let slot = slot_for_command(command)?;
        let mut endpoint = self.target_for(slot).await?;
        let mut asking = false;
        let mut redirects = 0;

        loop {
            let dispatcher = self.dispatcher_for(&endpoint).await;

            let result = if asking {
                // the preamble must reach the same connection as the
                // command itself, so both go out as one batch
                let prefixed = [Command::new("ASKING"), command.clone()];
                dispatcher
                    .execute_batch(&prefixed)
                    .await
                    .and_then(|mut replies| match replies.pop() {
                        Some(Reply::Error(msg)) => Err(RedisError::from_server_error(&msg)),
                        Some(reply) => Ok(reply),
                        None => Err(RedisError::Protocol("empty batch reply".to_string())),
                    })
            } else {
                dispatcher.execute(command).await
            };

            match result {
                Err(redirect @ (RedisError::Moved { .. } | RedisError::Ask { .. })) => {
                    redirects += 1;
                    if redirects > self.config.retry.max_redirects {
                        warn!("redirect bound exceeded for slot {slot:?}");
                        return Err(RedisError::Routing(self.config.retry.max_redirects));
                    }
                    tokio::time::sleep(self.config.retry.backoff(redirects - 1)).await;

                    match redirect {
                        RedisError::Moved {
                            slot: moved_slot,
                            host,
                            port,
                        } => {
                            let target = Endpoint::new(host, port);
                            debug!("slot {moved_slot} moved to {target}");
                            self.topology.apply_moved(moved_slot, target.clone()).await;
                            endpoint = target;
                            asking = false;
                        }
                        RedisError::Ask { host, port, .. } => {
                            // temporary: retry there without touching the map
                            endpoint = Endpoint::new(host, port);
                            asking = true;
                        }
                        _ => unreachable!("redirect match guarded above"),
                    }
                }
                Err(e) if e.is_endpoint_failure() => {
                    self.note_endpoint_failure(&endpoint).await;
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    /// Execute a batch on the endpoint owning the batch's slot
    pub async fn execute_batch(&self, commands: &[Command]) -> RedisResult<Vec<Reply>> {
        let slot = slot_for_batch(commands)?;
        let mut endpoint = self.target_for(slot).await?;
        let mut asking = false;
        let mut redirects = 0;

        loop {
            let dispatcher = self.dispatcher_for(&endpoint).await;

            let result = if asking {
                let mut prefixed = Vec::with_capacity(commands.len() + 1);
                prefixed.push(Command::new("ASKING"));
                prefixed.extend(commands.iter().cloned());
                dispatcher.execute_batch(&prefixed).await.map(|mut replies| {
                    if !replies.is_empty() {
                        replies.remove(0);
                    }
                    replies
                })
            } else {
                dispatcher.execute_batch(commands).await
            };

            match result {
                Ok(replies) => match find_redirect(&replies) {
                    Some(redirect) => {
                        redirects += 1;
                        if redirects > self.config.retry.max_redirects {
                            return Err(RedisError::Routing(self.config.retry.max_redirects));
                        }
                        tokio::time::sleep(self.config.retry.backoff(redirects - 1)).await;

                        match redirect {
                            RedisError::Moved {
                                slot: moved_slot,
                                host,
                                port,
                            } => {
                                let target = Endpoint::new(host, port);
                                self.topology.apply_moved(moved_slot, target.clone()).await;
                                endpoint = target;
                                asking = false;
                            }
                            RedisError::Ask { host, port, .. } => {
                                endpoint = Endpoint::new(host, port);
                                asking = true;
                            }
                            _ => unreachable!("find_redirect only yields redirects"),
                        }
                    }
                    None => return Ok(replies),
                },
                Err(e) if e.is_endpoint_failure() => {
                    self.note_endpoint_failure(&endpoint).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Refresh the slot map from the first node that answers a slots
    /// query; known primaries are tried before the configured seeds.
    pub async fn refresh_topology(&self) -> RedisResult<()> {
        let command = Command::new("CLUSTER").arg("SLOTS");

        let mut candidates: Vec<Endpoint> = self
            .topology
            .snapshot()
            .await
            .nodes()
            .iter()
            .filter(|node| !node.is_replica)
            .map(|node| node.endpoint.clone())
            .collect();
        for seed in &self.seeds {
            if !candidates.contains(seed) {
                candidates.push(seed.clone());
            }
        }
        if candidates.is_empty() {
            return Err(RedisError::Config("no seed endpoints".to_string()));
        }

        let mut last_error = RedisError::Connect("no endpoint reachable".to_string());
        for endpoint in candidates {
            let dispatcher = self.dispatcher_for(&endpoint).await;
            match dispatcher.execute(&command).await {
                Ok(reply) => {
                    let snapshot = TopologySnapshot::from_cluster_slots(&reply)?;
                    info!(
                        "topology refreshed: {} slots across {} nodes",
                        snapshot.mapped_slots(),
                        snapshot.nodes().len()
                    );
                    self.topology.replace(snapshot).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!("topology refresh via {endpoint} failed: {e}");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// A lost connection to an endpoint that owns slots may mean a
    /// failover happened; refresh rather than keep routing into a hole.
    async fn note_endpoint_failure(&self, endpoint: &Endpoint) {
        if self.topology.snapshot().await.owns_slots(endpoint) {
            if let Err(e) = self.refresh_topology().await {
                debug!("topology refresh after endpoint failure failed: {e}");
            }
        }
    }

    async fn target_for(&self, slot: Option<u16>) -> RedisResult<Endpoint> {
        if let Some(slot) = slot {
            if let Some(endpoint) = self.topology.endpoint_for_slot(slot).await {
                return Ok(endpoint);
            }
        }
        // keyless commands and not-yet-mapped slots go to a seed
        self.seeds
            .first()
            .cloned()
            .ok_or_else(|| RedisError::Config("no seed endpoints".to_string()))
    }

    async fn dispatcher_for(&self, endpoint: &Endpoint) -> Arc<Dispatcher> {
        if let Some(dispatcher) = self.dispatchers.read().await.get(endpoint) {
            return Arc::clone(dispatcher);
        }

        let mut dispatchers = self.dispatchers.write().await;
        Arc::clone(dispatchers.entry(endpoint.clone()).or_insert_with(|| {
            Arc::new(Dispatcher::for_endpoint(endpoint.clone(), &self.config))
        }))
    }
}

fn find_redirect(replies: &[Reply]) -> Option<RedisError> {
    replies.iter().find_map(|reply| match reply {
        Reply::Error(msg) => RedisError::parse_redirect(msg),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_slot_known_vectors() {
        // reference value from the cluster key hashing specification
        assert_eq!(calculate_slot(b"123456789"), 12739);
        assert!(calculate_slot(b"anything") < SLOT_COUNT);
    }

    #[test]
    fn test_hash_tags_pin_related_keys() {
        assert_eq!(
            calculate_slot(b"{user1000}.following"),
            calculate_slot(b"{user1000}.followers")
        );
        assert_eq!(extract_hash_tag(b"key"), b"key");
        assert_eq!(extract_hash_tag(b"{user}key"), b"user");
        assert_eq!(extract_hash_tag(b"prefix{user}key"), b"user");
        assert_eq!(extract_hash_tag(b"{user}"), b"user");
        // empty tag and unclosed braces hash the whole key
        assert_eq!(extract_hash_tag(b"{}"), b"{}");
        assert_eq!(extract_hash_tag(b"{"), b"{");
        assert_eq!(extract_hash_tag(b"no{hash"), b"no{hash");
    }

    #[test]
    fn test_slot_for_command() {
        let single = Command::new("GET").arg("mykey");
        assert_eq!(
            slot_for_command(&single).unwrap(),
            Some(calculate_slot(b"mykey"))
        );

        let keyless = Command::new("PING");
        assert_eq!(slot_for_command(&keyless).unwrap(), None);

        let same_slot = Command::new("MSET")
            .arg("{user}.a")
            .arg("1")
            .arg("{user}.b")
            .arg("2");
        assert!(slot_for_command(&same_slot).unwrap().is_some());
    }

    #[test]
    fn test_cross_slot_rejected_before_io() {
        // "foo" and "bar" hash to different slots
        assert_ne!(calculate_slot(b"foo"), calculate_slot(b"bar"));
        let command = Command::new("MSET").arg("foo").arg("1").arg("bar").arg("2");
        assert!(matches!(
            slot_for_command(&command),
            Err(RedisError::CrossSlot(_))
        ));

        let batch = [
            Command::new("GET").arg("foo"),
            Command::new("GET").arg("bar"),
        ];
        assert!(matches!(
            slot_for_batch(&batch),
            Err(RedisError::CrossSlot(_))
        ));
    }

    fn node_reply(host: &str, port: i64) -> Reply {
        Reply::Array(vec![Reply::from(host), Reply::Integer(port)])
    }

    #[test]
    fn test_snapshot_from_cluster_slots() {
        let reply = Reply::Array(vec![
            Reply::Array(vec![
                Reply::Integer(0),
                Reply::Integer(8191),
                node_reply("10.0.0.1", 7000),
                node_reply("10.0.0.4", 7003),
            ]),
            Reply::Array(vec![
                Reply::Integer(8192),
                Reply::Integer(16383),
                node_reply("10.0.0.2", 7001),
            ]),
        ]);

        let snapshot = TopologySnapshot::from_cluster_slots(&reply).unwrap();
        assert!(snapshot.is_complete());
        assert_eq!(
            snapshot.endpoint_for_slot(100),
            Some(&Endpoint::new("10.0.0.1", 7000))
        );
        assert_eq!(
            snapshot.endpoint_for_slot(9000),
            Some(&Endpoint::new("10.0.0.2", 7001))
        );
        // the replica is known but owns no slots in the map
        assert!(snapshot
            .nodes()
            .iter()
            .any(|node| node.is_replica && node.endpoint == Endpoint::new("10.0.0.4", 7003)));
        assert!(!snapshot.owns_slots(&Endpoint::new("10.0.0.4", 7003)));
    }

    #[test]
    fn test_snapshot_rejects_malformed_replies() {
        assert!(TopologySnapshot::from_cluster_slots(&Reply::Integer(1)).is_err());

        let bad_node = Reply::Array(vec![Reply::Array(vec![
            Reply::Integer(0),
            Reply::Integer(10),
            Reply::Array(vec![Reply::from("host-only")]),
        ])]);
        assert!(TopologySnapshot::from_cluster_slots(&bad_node).is_err());
    }

    #[tokio::test]
    async fn test_moved_updates_routing_for_next_command() {
        let topology = ClusterTopology::new();
        let slot = calculate_slot(b"mykey");

        let initial = {
            let reply = Reply::Array(vec![Reply::Array(vec![
                Reply::Integer(0),
                Reply::Integer(16383),
                node_reply("10.0.0.1", 7000),
            ])]);
            TopologySnapshot::from_cluster_slots(&reply).unwrap()
        };
        topology.replace(initial).await;
        assert_eq!(
            topology.endpoint_for_slot(slot).await,
            Some(Endpoint::new("10.0.0.1", 7000))
        );

        // after a simulated MOVED, the same slot routes straight to the
        // new owner; everything else is untouched
        topology
            .apply_moved(slot, Endpoint::new("10.0.0.2", 7001))
            .await;
        assert_eq!(
            topology.endpoint_for_slot(slot).await,
            Some(Endpoint::new("10.0.0.2", 7001))
        );
        let other_slot = if slot == 0 { 1 } else { slot - 1 };
        assert_eq!(
            topology.endpoint_for_slot(other_slot).await,
            Some(Endpoint::new("10.0.0.1", 7000))
        );
    }

    #[tokio::test]
    async fn test_snapshot_is_immutable_for_readers() {
        let topology = ClusterTopology::new();
        topology.apply_moved(5, Endpoint::new("a", 1)).await;

        let before = topology.snapshot().await;
        topology.apply_moved(5, Endpoint::new("b", 2)).await;

        // a snapshot taken before the swap still reads the old owner
        assert_eq!(before.endpoint_for_slot(5), Some(&Endpoint::new("a", 1)));
        assert_eq!(
            topology.endpoint_for_slot(5).await,
            Some(Endpoint::new("b", 2))
        );
    }

    #[test]
    fn test_find_redirect_in_batch_replies() {
        let replies = vec![
            Reply::SimpleString("OK".to_string()),
            Reply::Error("MOVED 42 10.0.0.9:7002".to_string()),
        ];
        assert!(matches!(
            find_redirect(&replies),
            Some(RedisError::Moved { slot: 42, .. })
        ));

        let replies = vec![Reply::Error("ERR plain".to_string())];
        assert!(find_redirect(&replies).is_none());
    }
}
