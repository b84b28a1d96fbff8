//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and key-value gossip for shared limiter state.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Prefix separating gossiped cache entries from other node state.
const ENTRY_PREFIX: &str = "cache|";

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "tollgate".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// Chitchat key under which a cache key is gossiped.
fn entry_key(key: &str) -> String {
    format!("{ENTRY_PREFIX}{key}")
}

/// Expiry times of the entries this node has published.
#[derive(Debug, Default)]
struct Expiries {
    by_key: HashMap<String, i64>,
    by_time: BTreeSet<(i64, String)>,
}

impl Expiries {
    /// Record when `key` expires, replacing any earlier record.
    fn track(&mut self, key: &str, expires_at: Option<i64>) {
        if let Some(previous) = self.by_key.remove(key) {
            self.by_time.remove(&(previous, key.to_string()));
        }
        if let Some(at) = expires_at {
            self.by_key.insert(key.to_string(), at);
            self.by_time.insert((at, key.to_string()));
        }
    }

    /// Forget and return every key expired at `now`.
    fn drain_expired(&mut self, now: i64) -> Vec<String> {
        let mut expired = Vec::new();
        while self.by_time.first().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, key)) = self.by_time.pop_first() {
                self.by_key.remove(&key);
                expired.push(key);
            }
        }
        expired
    }

    fn len(&self) -> usize {
        self.by_key.len()
    }
}

/// A running cluster node.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    config: ClusterConfig,
    /// Expiry index over our own published entries.
    expiries: Mutex<Expiries>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id.clone(),
            handle,
            config,
            expiries: Mutex::new(Expiries::default()),
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Publish `payload` for `key` in our own node state.
    ///
    /// `expires_at` is the epoch millisecond after which the entry is dead,
    /// `None` for never. Own entries already expired at `now` are deleted
    /// from node state in the same step. Peers see both changes after the
    /// next gossip round.
    pub async fn publish(&self, key: &str, payload: String, expires_at: Option<i64>, now: i64) {
        let chitchat_key = entry_key(key);
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        debug!(key = %chitchat_key, payload = %payload, "Publishing entry");
        let node_state = chitchat.self_node_state();
        node_state.set(&chitchat_key, payload);

        let mut expiries = self.expiries.lock();
        expiries.track(key, expires_at);
        for expired in expiries.drain_expired(now) {
            trace!(key = %expired, "Deleting expired entry");
            node_state.delete(&entry_key(&expired));
        }
    }

    /// Number of own entries that are still waiting to expire.
    pub fn tracked_entry_count(&self) -> usize {
        self.expiries.lock().len()
    }

    /// Collect every live node's payload for `key` as `(node_id, payload)`.
    pub async fn gather(&self, key: &str) -> Vec<(String, String)> {
        let chitchat_key = entry_key(key);
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;

        chitchat
            .live_nodes()
            .filter_map(|id| {
                let payload = chitchat.node_state(id)?.get(&chitchat_key)?;
                Some((id.node_id.clone(), payload.to_string()))
            })
            .collect()
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Get the IDs of all live nodes.
    pub async fn live_nodes(&self) -> Vec<String> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat
            .live_nodes()
            .map(|id| id.node_id.clone())
            .collect()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}
