use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::directory::{ConnectionPurpose, Directory};
use crate::election::engine::{ElectionTiming, EngineContext};
use crate::election::{ElectionEngine, ElectionListener, ElectionSession, EngineRegistry};
use crate::envelope::{ElectionAction, Envelope, NodeId, WireMessage};
use crate::error::{FlotillaError, Result};
use crate::heartbeat::HeartbeatClock;
use crate::log::ReplicatedLog;

/// Single authoritative owner of "who is the leader" and sole dispatcher
/// of inbound election-protocol envelopes.
///
/// Leader identity, the replicated log, and the one-election-in-flight
/// session all live here. Every method is synchronous and safe to call
/// from any task; locks guard short critical sections only and channel
/// sends never block.
pub struct Coordinator {
    config: NodeConfig,
    directory: Arc<dyn Directory>,
    registry: EngineRegistry,
    heartbeat: Arc<HeartbeatClock>,
    leader: RwLock<Option<NodeId>>,
    discovery_budget: Mutex<u32>,
    session: Mutex<Option<ElectionSession>>,
    cycle: AtomicU64,
    log: Mutex<ReplicatedLog>,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(
        config: NodeConfig,
        directory: Arc<dyn Directory>,
        registry: EngineRegistry,
    ) -> Arc<Self> {
        let budget = config.discovery_retry_budget;
        Arc::new(Self {
            config,
            directory,
            registry,
            heartbeat: Arc::new(HeartbeatClock::new()),
            leader: RwLock::new(None),
            discovery_budget: Mutex::new(budget),
            session: Mutex::new(None),
            cycle: AtomicU64::new(0),
            log: Mutex::new(ReplicatedLog::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn heartbeat(&self) -> Arc<HeartbeatClock> {
        self.heartbeat.clone()
    }

    /// Bring up the election machinery (session plus engine monitor).
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.ensure_election_session().map(|_| ())
    }

    /// Stop the engine monitor and release the session. Leader state is
    /// process-lifetime and stays as-is.
    pub fn shut_down(&self) {
        self.shutdown.cancel();
        if let Some(session) = self.session.lock().take() {
            session.engine().clear();
        }
    }

    /// Dispatch one inbound management envelope.
    ///
    /// Envelopes without an election payload are ignored. Leader-discovery
    /// queries are answered from the cached leader and never reach the
    /// engine; everything else is forwarded, and an engine reply is
    /// broadcast to all peers.
    pub fn handle_envelope(self: &Arc<Self>, envelope: &Envelope) {
        let Some(payload) = envelope.election.as_ref() else {
            return;
        };

        if payload.action == ElectionAction::WhoIsLeader {
            self.respond_leader_query(envelope);
            return;
        }

        let engine = match self.ensure_election_session() {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!(error = %e, "cannot process envelope without an election engine");
                return;
            }
        };
        if let Some(reply) = engine.process(envelope) {
            self.directory.broadcast(reply);
        }
    }

    /// Decide whether a stale heartbeat means the leader is dead.
    ///
    /// While discovery budget remains this sends one `WhoIsLeader` round to
    /// the peers and returns `false` ("not confirmed dead yet"). Once the
    /// budget is exhausted it returns `true` and the caller is expected to
    /// start an election. The budget refills when a leader is learned.
    pub fn assess_leader_health(&self) -> bool {
        {
            let mut budget = self.discovery_budget.lock();
            if *budget == 0 {
                return true;
            }
            *budget -= 1;
        }
        self.ask_who_is_leader();
        false
    }

    fn ask_who_is_leader(&self) {
        match *self.leader.read() {
            Some(leader) => {
                tracing::debug!(node_id = self.config.node_id, leader, "confirming current leader")
            }
            None => tracing::info!(node_id = self.config.node_id, "searching for the leader"),
        }
        self.directory
            .broadcast(Envelope::who_is_leader(self.config.node_id));
    }

    /// Cached leader identity; `None` until a first election concludes or
    /// a peer answers a discovery query.
    pub fn query_leader(&self) -> Option<NodeId> {
        let leader = *self.leader.read();
        if leader.is_none() {
            tracing::debug!(node_id = self.config.node_id, "leader unknown");
        }
        leader
    }

    /// Answer a `WhoIsLeader` query from its originator.
    ///
    /// Declines silently when we are equally ignorant; the querier retries
    /// on its own schedule. Responses go over the originator's management
    /// channel and are dropped silently when none is available.
    pub fn respond_leader_query(&self, query: &Envelope) {
        let Some(leader) = *self.leader.read() else {
            tracing::info!(
                node_id = self.config.node_id,
                peer = query.header.originator,
                "cannot answer leader query, leader unknown"
            );
            return;
        };

        let origin = query.header.originator;
        let reply = Envelope::leader_is(self.config.node_id, leader);
        match self.directory.lookup(origin, ConnectionPurpose::Management) {
            Some(channel) => match channel.send(WireMessage::Management(reply)) {
                Ok(()) => {
                    tracing::info!(node_id = self.config.node_id, peer = origin, leader, "answered leader query")
                }
                Err(e) => {
                    tracing::debug!(peer = origin, error = %e, "leader response dropped")
                }
            },
            None => tracing::debug!(peer = origin, "no management channel, leader response dropped"),
        }
    }

    /// Record a leader-issued entry locally and flag the engine that
    /// replication is owed. Does not replicate by itself.
    pub fn append_entry(self: &Arc<Self>, payload: impl Into<String>) -> u64 {
        let index = self.log.lock().append(payload);
        match self.ensure_election_session() {
            Ok(engine) => engine.set_append_pending(true),
            Err(e) => {
                tracing::error!(index, error = %e, "entry recorded but no engine to flag for replication")
            }
        }
        index
    }

    pub fn log_index(&self) -> u64 {
        self.log.lock().log_index()
    }

    pub fn prev_log_index(&self) -> u64 {
        self.log.lock().prev_log_index()
    }

    pub fn log_entry(&self, index: u64) -> Option<String> {
        self.log.lock().entry(index).map(str::to_owned)
    }

    /// Lazily create the singleton election session.
    ///
    /// At most one session ever exists; concurrent first-callers race on
    /// the slot lock and all but one observe the session already present.
    /// An unknown implementation name leaves the slot empty, so election
    /// paths keep no-oping until the configuration is fixed.
    pub fn ensure_election_session(self: &Arc<Self>) -> Result<Arc<dyn ElectionEngine>> {
        let mut slot = self.session.lock();
        if let Some(session) = slot.as_ref() {
            return Ok(session.engine());
        }

        let name = self.config.election_impl.as_str();
        let builder = self
            .registry
            .resolve(name)
            .ok_or_else(|| FlotillaError::UnknownElection(name.to_string()))?;

        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let listener: Arc<dyn ElectionListener> = self.clone();
        let ctx = EngineContext {
            node_id: self.config.node_id,
            peers: self.config.peer_ids(),
            directory: self.directory.clone(),
            listener,
            heartbeat: self.heartbeat.clone(),
            timing: ElectionTiming {
                heartbeat_interval: self.config.heartbeat_interval,
                timeout_min_ms: self.config.election_timeout_min_ms,
                timeout_max_ms: self.config.election_timeout_max_ms,
            },
        };
        let engine = builder(ctx);
        let session = ElectionSession::start(engine.clone(), cycle, &self.shutdown);
        tracing::info!(node_id = self.config.node_id, cycle, implementation = name, "election session created");
        *slot = Some(session);
        Ok(engine)
    }

    /// Number of the most recent election cycle (0 before any session).
    pub fn election_cycle(&self) -> u64 {
        self.cycle.load(Ordering::SeqCst)
    }

    pub fn has_session(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Remaining leader-discovery attempts before staleness escalates.
    pub fn discovery_budget(&self) -> u32 {
        *self.discovery_budget.lock()
    }

    fn conclude(&self, success: bool, leader: Option<NodeId>) {
        if success {
            if let Some(id) = leader {
                *self.leader.write() = Some(id);
                *self.discovery_budget.lock() = self.config.discovery_retry_budget;
                tracing::info!(node_id = self.config.node_id, leader = id, "election concluded");
            } else {
                tracing::warn!(node_id = self.config.node_id, "election succeeded without a leader id");
            }
        } else {
            tracing::info!(node_id = self.config.node_id, "election concluded without a winner");
        }

        // The session is released whether or not the election succeeded;
        // a failed cycle must be re-triggered externally.
        if let Some(session) = self.session.lock().take() {
            session.engine().clear();
            tracing::debug!(cycle = session.cycle(), "election session released");
        }
    }
}

impl ElectionListener for Coordinator {
    fn conclude_election(&self, success: bool, leader: Option<NodeId>) {
        self.conclude(success, leader);
    }

    fn assess_leader_health(&self) -> bool {
        Coordinator::assess_leader_health(self)
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
