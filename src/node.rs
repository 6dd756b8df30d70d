use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterConnectionManager;
use crate::config::{ClusterTopology, NodeConfig, PeerConfig};
use crate::coordinator::Coordinator;
use crate::directory::{ConnectionPurpose, Directory, SharedDirectory};
use crate::election::EngineRegistry;
use crate::envelope::{Envelope, WireMessage};
use crate::error::Result;
use crate::transport::{self, Connector, TcpConnector};

/// A running coordination node: the coordinator plus its transport,
/// peer-link maintenance, leader heartbeats, and the cross-cluster
/// connection manager.
pub struct Node {
    config: NodeConfig,
    topology: ClusterTopology,
    coordinator: Arc<Coordinator>,
    directory: Arc<SharedDirectory>,
}

impl Node {
    pub fn new(config: NodeConfig, topology: ClusterTopology) -> Self {
        let directory = Arc::new(SharedDirectory::new());
        let coordinator = Coordinator::new(
            config.clone(),
            directory.clone(),
            EngineRegistry::with_builtins(),
        );
        Self {
            config,
            topology,
            coordinator,
            directory,
        }
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    /// Run the node until the token is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.coordinator.start()?;

        let connector = TcpConnector::new(self.config.connect_timeout);

        let heartbeats = tokio::spawn(heartbeat_loop(
            self.coordinator.clone(),
            self.directory.clone(),
            shutdown.clone(),
        ));
        let peer_links = tokio::spawn(maintain_peer_links(
            self.config.peers.clone(),
            self.coordinator.clone(),
            self.directory.clone(),
            connector.clone(),
            self.config.reconnect_backoff,
            shutdown.clone(),
        ));

        let (manager, _connected) =
            ClusterConnectionManager::new(self.coordinator.clone(), self.topology, connector);
        let clusters = tokio::spawn(manager.run(shutdown.clone()));

        let served = transport::serve(
            self.config.listen_addr,
            self.coordinator.clone(),
            self.directory.clone(),
            shutdown.clone(),
        )
        .await;

        shutdown.cancel();
        self.coordinator.shut_down();
        let _ = heartbeats.await;
        let _ = peer_links.await;
        let _ = clusters.await;
        tracing::info!(node_id = self.config.node_id, "node stopped");
        served
    }
}

/// While this node is the leader, refresh the local clock and announce
/// liveness to all peers every heartbeat interval.
async fn heartbeat_loop(
    coordinator: Arc<Coordinator>,
    directory: Arc<SharedDirectory>,
    shutdown: CancellationToken,
) {
    let me = coordinator.config().node_id;
    let mut ticker = tokio::time::interval(coordinator.config().heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if coordinator.query_leader() == Some(me) {
                    coordinator.heartbeat().touch();
                    directory.broadcast(Envelope::heartbeat(me));
                }
            }
        }
    }
}

/// Keep an outbound management link to every configured peer, retrying on
/// the reconnect backoff. Each fresh link opens with a leader query so a
/// newly joined node learns the leader quickly.
async fn maintain_peer_links<C: Connector>(
    peers: Vec<PeerConfig>,
    coordinator: Arc<Coordinator>,
    directory: Arc<SharedDirectory>,
    connector: C,
    backoff: Duration,
    shutdown: CancellationToken,
) {
    let me = coordinator.config().node_id;
    let mut ticker = tokio::time::interval(backoff);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for peer in &peers {
            if directory
                .lookup(peer.node_id, ConnectionPurpose::Management)
                .is_some()
            {
                continue;
            }
            let Some((host, port)) = parse_addr(&peer.addr) else {
                tracing::warn!(peer = peer.node_id, addr = %peer.addr, "bad peer address, skipping");
                continue;
            };
            match connector.connect(host, port).await {
                Ok(handle) => {
                    if let Err(e) = handle.send(WireMessage::Management(Envelope::who_is_leader(me)))
                    {
                        tracing::debug!(peer = peer.node_id, error = %e, "leader query on fresh link failed");
                    }
                    directory.register(peer.node_id, ConnectionPurpose::Management, handle);
                    tracing::info!(peer = peer.node_id, addr = %peer.addr, "peer link established");
                }
                Err(e) => {
                    tracing::debug!(peer = peer.node_id, addr = %peer.addr, error = %e, "peer unreachable, will retry")
                }
            }
        }
    }
}

fn parse_addr(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    Some((host, port.parse().ok()?))
}
