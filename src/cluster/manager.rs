use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ClusterTopology;
use crate::coordinator::Coordinator;
use crate::directory::ChannelHandle;
use crate::envelope::{ClusterId, JoinRequest, WireMessage};
use crate::transport::Connector;

/// Background process that keeps the local node connected into every other
/// known cluster.
///
/// Walks the remote cluster ids round-robin. Joining is suppressed until
/// this node itself knows a leader, so election churn does not cause join
/// storms. For an unconnected cluster the nodes are tried in listed order
/// and the first writable connection wins: it receives the join handshake
/// and is registered under the cluster id. Connections whose writer has
/// gone away are purged and re-attempted by the same loop, which never
/// terminates on error.
pub struct ClusterConnectionManager<C: Connector> {
    coordinator: Arc<Coordinator>,
    topology: ClusterTopology,
    connector: C,
    registry: HashMap<ClusterId, ChannelHandle>,
    connected_tx: watch::Sender<BTreeSet<ClusterId>>,
}

impl<C: Connector> ClusterConnectionManager<C> {
    /// Returns the manager and a watch handle publishing the set of
    /// currently connected clusters.
    pub fn new(
        coordinator: Arc<Coordinator>,
        topology: ClusterTopology,
        connector: C,
    ) -> (Self, watch::Receiver<BTreeSet<ClusterId>>) {
        let (connected_tx, connected_rx) = watch::channel(BTreeSet::new());
        (
            Self {
                coordinator,
                topology,
                connector,
                registry: HashMap::new(),
                connected_tx,
            },
            connected_rx,
        )
    }

    /// Run until the token is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let local = self.coordinator.config().cluster_id;
        let backoff = self.coordinator.config().reconnect_backoff;
        let targets = self.topology.remote_ids(local);
        if targets.is_empty() {
            tracing::info!("no remote clusters in topology");
        }

        let mut cursor = 0usize;
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // Joining other clusters while our own leadership is unsettled
            // only adds churn; wait until a leader is known.
            if self.coordinator.query_leader().is_none() {
                tracing::trace!("leader unknown, deferring cluster joins");
                if !sleep_or_cancel(backoff, &shutdown).await {
                    break;
                }
                continue;
            }

            if targets.is_empty() || cursor >= targets.len() {
                cursor = 0;
                if !sleep_or_cancel(backoff, &shutdown).await {
                    break;
                }
                continue;
            }

            let cluster = targets[cursor];
            cursor += 1;

            self.purge_closed();
            if self.registry.contains_key(&cluster) {
                continue;
            }
            self.try_join(cluster).await;
        }

        tracing::info!("cluster connection manager stopped");
    }

    /// Drop registry entries whose connection has gone away so the normal
    /// join path re-attempts them.
    fn purge_closed(&mut self) {
        let before = self.registry.len();
        self.registry.retain(|cluster, channel| {
            if channel.is_closed() {
                tracing::info!(cluster, "cluster connection lost, scheduling rejoin");
                false
            } else {
                true
            }
        });
        if self.registry.len() != before {
            self.publish();
        }
    }

    /// Try each node of `cluster` in listed order; first writable
    /// connection receives the join handshake and is registered.
    async fn try_join(&mut self, cluster: ClusterId) {
        let nodes = match self.topology.nodes(cluster) {
            Some(nodes) => nodes.to_vec(),
            None => return,
        };
        let from_cluster = self.coordinator.config().cluster_id;
        let from_node = self.coordinator.config().node_id;

        for node in nodes {
            let channel = match self.connector.connect(&node.host, node.port).await {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::debug!(
                        cluster,
                        node_id = node.node_id,
                        host = %node.host,
                        port = node.port,
                        error = %e,
                        "node unreachable, trying next"
                    );
                    continue;
                }
            };

            let join = JoinRequest {
                from_cluster,
                from_node,
                to_cluster: cluster,
                to_node: node.node_id,
            };
            if let Err(e) = channel.send(WireMessage::Join(join)) {
                tracing::debug!(cluster, node_id = node.node_id, error = %e, "join send failed, trying next");
                continue;
            }

            tracing::info!(cluster, node_id = node.node_id, "connection to cluster added");
            self.registry.insert(cluster, channel);
            self.publish();
            break;
        }
    }

    fn publish(&self) {
        let snapshot: BTreeSet<ClusterId> = self.registry.keys().copied().collect();
        let _ = self.connected_tx.send(snapshot);
    }
}

async fn sleep_or_cancel(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
