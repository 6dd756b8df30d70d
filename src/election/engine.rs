use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::directory::Directory;
use crate::envelope::{Envelope, NodeId};
use crate::heartbeat::HeartbeatClock;

/// Callback contract an engine uses to report back to its coordinator.
pub trait ElectionListener: Send + Sync {
    /// Report the outcome of an election cycle. On success the coordinator
    /// records the leader; in every case it releases the session slot.
    fn conclude_election(&self, success: bool, leader: Option<NodeId>);

    /// Ask whether a stale heartbeat should escalate to a new election.
    /// Returns `false` while leader-discovery retries are still in flight.
    fn assess_leader_health(&self) -> bool;
}

/// Timing knobs an engine monitor runs on.
#[derive(Debug, Clone)]
pub struct ElectionTiming {
    /// Monitor tick period, also the cadence of leader heartbeats.
    pub heartbeat_interval: Duration,
    pub timeout_min_ms: u64,
    pub timeout_max_ms: u64,
}

impl Default for ElectionTiming {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            timeout_min_ms: 500,
            timeout_max_ms: 1000,
        }
    }
}

/// Everything an engine needs, wired once at construction.
#[derive(Clone)]
pub struct EngineContext {
    pub node_id: NodeId,
    /// Other nodes of the local cluster; quorum is computed over these
    /// plus the local node.
    pub peers: Vec<NodeId>,
    pub directory: Arc<dyn Directory>,
    pub listener: Arc<dyn ElectionListener>,
    pub heartbeat: Arc<HeartbeatClock>,
    pub timing: ElectionTiming,
}

/// A pluggable election algorithm.
///
/// The coordinator treats implementations as black boxes: it feeds them
/// envelopes, broadcasts whatever they return, and waits for the
/// conclusion callback. Internal vote or term bookkeeping never leaks out.
pub trait ElectionEngine: Send + Sync {
    /// Consume one algorithm-internal envelope, optionally returning a
    /// reply to broadcast to all peers.
    fn process(&self, envelope: &Envelope) -> Option<Envelope>;

    /// Flag that locally appended log entries await replication.
    fn set_append_pending(&self, pending: bool);

    /// Release per-cycle state so the engine slot can be reused.
    fn clear(&self);

    /// Start the engine's background monitor, if it has one. The monitor
    /// must stop when the token is cancelled.
    fn spawn_monitor(self: Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>>;
}

/// Constructor for a registered engine implementation.
pub type EngineBuilder = fn(EngineContext) -> Arc<dyn ElectionEngine>;

/// Maps configuration names to engine constructors, resolved once at
/// session creation.
pub struct EngineRegistry {
    builders: HashMap<String, EngineBuilder>,
}

impl EngineRegistry {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registry with every built-in engine.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("raft", |ctx| super::raft::RaftEngine::build(ctx));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, builder: EngineBuilder) {
        self.builders.insert(name.into(), builder);
    }

    pub fn resolve(&self, name: &str) -> Option<EngineBuilder> {
        self.builders.get(name).copied()
    }

    pub fn names(&self) -> Vec<&str> {
        self.builders.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_include_raft() {
        let registry = EngineRegistry::with_builtins();
        assert!(registry.resolve("raft").is_some());
        assert!(registry.resolve("paxos").is_none());
        assert_eq!(registry.names(), vec!["raft"]);
    }
}
