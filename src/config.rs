use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::envelope::{ClusterId, NodeId};
use crate::error::{FlotillaError, Result};

/// A peer node in the local cluster, used for election quorum and for
/// maintaining management links.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub addr: String, // host:port format, supports both IP and hostnames
}

/// Configuration for a single coordination node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub cluster_id: ClusterId,
    pub listen_addr: SocketAddr,
    /// Other nodes of the local cluster.
    pub peers: Vec<PeerConfig>,
    /// Registry name of the election engine to run.
    pub election_impl: String,
    /// Leader-discovery attempts before a stale heartbeat is treated as a
    /// dead leader.
    pub discovery_retry_budget: u32,
    pub connect_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub heartbeat_interval: Duration,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            cluster_id: 1,
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:7400"
                .parse()
                .expect("default listen address is valid"),
            peers: Vec::new(),
            election_impl: "raft".to_string(),
            discovery_retry_budget: 2,
            connect_timeout: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(3),
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min_ms: 500,
            election_timeout_max_ms: 1000,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: NodeId, cluster_id: ClusterId, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            cluster_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: NodeId, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|p| p.node_id).collect()
    }
}

/// Address of one node of a remote cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
}

/// Static map of every known cluster and its nodes, loaded once at startup
/// and read-only afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterTopology {
    clusters: BTreeMap<ClusterId, Vec<NodeDescriptor>>,
}

impl ClusterTopology {
    pub fn new(clusters: BTreeMap<ClusterId, Vec<NodeDescriptor>>) -> Self {
        Self { clusters }
    }

    /// Load and validate a topology from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let topology: Self = serde_json::from_str(&raw)?;
        topology.validate()?;
        Ok(topology)
    }

    pub fn validate(&self) -> Result<()> {
        for (cluster, nodes) in &self.clusters {
            if nodes.is_empty() {
                return Err(FlotillaError::Topology(format!(
                    "cluster {cluster} has no nodes"
                )));
            }
        }
        Ok(())
    }

    pub fn clusters(&self) -> &BTreeMap<ClusterId, Vec<NodeDescriptor>> {
        &self.clusters
    }

    /// Nodes of one cluster, in the order they should be tried.
    pub fn nodes(&self, cluster: ClusterId) -> Option<&[NodeDescriptor]> {
        self.clusters.get(&cluster).map(|n| n.as_slice())
    }

    /// Every cluster id except the local one.
    pub fn remote_ids(&self, local: ClusterId) -> Vec<ClusterId> {
        self.clusters
            .keys()
            .filter(|id| **id != local)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node_id, 1);
        assert_eq!(cfg.cluster_id, 1);
        assert_eq!(cfg.election_impl, "raft");
        assert_eq!(cfg.discovery_retry_budget, 2);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.reconnect_backoff, Duration::from_secs(3));
        assert!(cfg.peers.is_empty());
    }

    #[test]
    fn node_config_with_peer() {
        let cfg = NodeConfig::default()
            .with_peer(2, "127.0.0.1:7401".to_string())
            .with_peer(3, "127.0.0.1:7402".to_string());
        assert_eq!(cfg.peer_ids(), vec![2, 3]);
        assert_eq!(cfg.peers[1].addr, "127.0.0.1:7402");
    }

    #[test]
    fn topology_remote_ids_exclude_local() {
        let mut clusters = BTreeMap::new();
        for id in [1u32, 2, 3] {
            clusters.insert(
                id,
                vec![NodeDescriptor {
                    node_id: id as u64 * 10,
                    host: "127.0.0.1".to_string(),
                    port: 7000 + id as u16,
                }],
            );
        }
        let topology = ClusterTopology::new(clusters);
        assert_eq!(topology.remote_ids(2), vec![1, 3]);
        assert_eq!(topology.nodes(3).unwrap()[0].node_id, 30);
    }

    #[test]
    fn topology_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"clusters":{{"1":[{{"node_id":11,"host":"10.0.0.1","port":7400}}],
                "2":[{{"node_id":21,"host":"10.0.0.2","port":7400}},
                     {{"node_id":22,"host":"10.0.0.3","port":7400}}]}}}}"#
        )
        .unwrap();

        let topology = ClusterTopology::from_file(file.path()).unwrap();
        assert_eq!(topology.clusters().len(), 2);
        assert_eq!(topology.nodes(2).unwrap().len(), 2);
    }

    #[test]
    fn topology_rejects_empty_cluster() {
        let mut clusters = BTreeMap::new();
        clusters.insert(4u32, Vec::new());
        let topology = ClusterTopology::new(clusters);
        assert!(topology.validate().is_err());
    }
}
