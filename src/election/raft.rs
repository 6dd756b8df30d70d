use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::engine::{ElectionEngine, EngineContext};
use crate::envelope::{ElectionAction, Envelope, NodeId};

/// Generates a random election timeout within the configured range
fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min_ms..=max_ms))
}

/// Per-cycle role. There is no long-lived leader role here: winning an
/// election concludes the cycle and releases the session, after which the
/// coordinator's cached leader plus the heartbeat loop take over.
#[derive(Debug)]
enum Role {
    Follower,
    Candidate { votes: HashSet<NodeId> },
}

#[derive(Debug)]
struct EngineState {
    role: Role,
    term: u64,
    /// Term we last granted a vote in; one vote per term.
    voted_term: Option<u64>,
    timeout: Duration,
    append_pending: bool,
}

/// Built-in Raft-style election engine.
///
/// Runs term-based voting over the local cluster. The monitor task watches
/// heartbeat staleness; once the listener confirms the leader is presumed
/// dead it raises the term and broadcasts a vote request. A majority of
/// granted votes concludes the cycle and announces the winner with
/// `LeaderIs`, which in turn concludes the cycle on every peer.
pub struct RaftEngine {
    ctx: EngineContext,
    state: Mutex<EngineState>,
}

impl RaftEngine {
    pub fn build(ctx: EngineContext) -> Arc<dyn ElectionEngine> {
        let timeout =
            random_election_timeout(ctx.timing.timeout_min_ms, ctx.timing.timeout_max_ms);
        Arc::new(Self {
            ctx,
            state: Mutex::new(EngineState {
                role: Role::Follower,
                term: 0,
                voted_term: None,
                timeout,
                append_pending: false,
            }),
        })
    }

    /// Votes needed to win, over local peers plus this node.
    fn majority(&self) -> usize {
        (self.ctx.peers.len() + 1) / 2 + 1
    }

    fn random_timeout(&self) -> Duration {
        random_election_timeout(self.ctx.timing.timeout_min_ms, self.ctx.timing.timeout_max_ms)
    }

    /// Move to candidate in a fresh term and produce the vote request to
    /// broadcast. A single-node cluster wins immediately.
    fn start_election(&self) -> Option<Envelope> {
        let me = self.ctx.node_id;
        let mut state = self.state.lock();
        state.term += 1;
        let term = state.term;
        state.voted_term = Some(term);
        state.timeout = self.random_timeout();

        let mut votes = HashSet::new();
        votes.insert(me);
        let won = votes.len() >= self.majority();
        state.role = if won {
            Role::Follower
        } else {
            Role::Candidate { votes }
        };
        drop(state);

        // Our own candidacy counts as leader-liveness activity; without this
        // every monitor tick would restart the election.
        self.ctx.heartbeat.touch();

        if won {
            tracing::info!(node_id = me, term, "single-node cluster, assuming leadership");
            self.ctx.listener.conclude_election(true, Some(me));
            return Some(Envelope::election(me, ElectionAction::LeaderIs, term, Some(me)));
        }

        tracing::info!(node_id = me, term, "starting election");
        Some(Envelope::election(me, ElectionAction::RequestVote, term, Some(me)))
    }

    fn handle_vote_request(&self, candidate: NodeId, term: u64) -> Option<Envelope> {
        let me = self.ctx.node_id;
        let mut state = self.state.lock();

        if term < state.term {
            tracing::debug!(node_id = me, candidate, term, current = state.term, "stale vote request");
            return None;
        }
        if term > state.term {
            state.term = term;
            state.voted_term = None;
            state.role = Role::Follower;
        }
        if state.voted_term == Some(term) {
            tracing::debug!(node_id = me, candidate, term, "already voted this term");
            return None;
        }
        state.voted_term = Some(term);
        drop(state);

        // Granting a vote defers our own candidacy for a full timeout.
        self.ctx.heartbeat.touch();
        tracing::info!(node_id = me, candidate, term, "granting vote");
        Some(Envelope::election(me, ElectionAction::Vote, term, Some(candidate)))
    }

    fn handle_vote(&self, voter: NodeId, term: u64, candidate: Option<NodeId>) -> Option<Envelope> {
        let me = self.ctx.node_id;
        let needed = self.majority();
        let mut state = self.state.lock();

        let current_term = state.term;
        let Role::Candidate { votes } = &mut state.role else {
            return None;
        };
        if term != current_term || candidate != Some(me) {
            return None;
        }
        votes.insert(voter);
        let count = votes.len();
        if count < needed {
            tracing::debug!(node_id = me, voter, term, votes = count, needed, "vote received");
            return None;
        }

        // Cycle is over; the listener releases the session.
        state.role = Role::Follower;
        drop(state);

        tracing::info!(node_id = me, term, votes = count, "won election");
        self.ctx.listener.conclude_election(true, Some(me));
        Some(Envelope::election(me, ElectionAction::LeaderIs, term, Some(me)))
    }

    fn on_tick(&self) {
        let timeout = self.state.lock().timeout;
        if self.ctx.heartbeat.elapsed() <= timeout {
            return;
        }

        if !self.ctx.listener.assess_leader_health() {
            // A discovery round went out; give peers a full timeout to answer.
            self.ctx.heartbeat.touch();
            return;
        }

        if let Some(request) = self.start_election() {
            self.ctx.directory.broadcast(request);
        }
    }
}

impl ElectionEngine for RaftEngine {
    fn process(&self, envelope: &Envelope) -> Option<Envelope> {
        let payload = envelope.election.as_ref()?;
        match payload.action {
            // Leader discovery is answered by the coordinator before
            // envelopes reach the engine.
            ElectionAction::WhoIsLeader => None,
            ElectionAction::LeaderIs => {
                let leader = payload.leader?;
                tracing::debug!(node_id = self.ctx.node_id, leader, "leader announced");
                self.ctx.heartbeat.touch();
                self.ctx.listener.conclude_election(true, Some(leader));
                None
            }
            ElectionAction::Heartbeat => {
                tracing::trace!(
                    node_id = self.ctx.node_id,
                    leader = payload.leader,
                    "leader heartbeat"
                );
                self.ctx.heartbeat.touch();
                None
            }
            ElectionAction::RequestVote => {
                self.handle_vote_request(envelope.header.originator, payload.term)
            }
            ElectionAction::Vote => {
                self.handle_vote(envelope.header.originator, payload.term, payload.leader)
            }
        }
    }

    fn set_append_pending(&self, pending: bool) {
        self.state.lock().append_pending = pending;
        tracing::debug!(node_id = self.ctx.node_id, pending, "append pending flag updated");
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.role = Role::Follower;
        state.append_pending = false;
        state.timeout = self.random_timeout();
        tracing::debug!(node_id = self.ctx.node_id, term = state.term, "election state cleared");
    }

    fn spawn_monitor(self: Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let engine = self;
        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(engine.ctx.timing.heartbeat_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => engine.on_tick(),
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex as PlMutex;

    use super::*;
    use crate::directory::{ChannelHandle, ConnectionPurpose, Directory};
    use crate::election::engine::{ElectionListener, ElectionTiming};
    use crate::heartbeat::HeartbeatClock;

    #[derive(Default)]
    struct RecordingListener {
        conclusions: PlMutex<Vec<(bool, Option<NodeId>)>>,
        presume_dead: bool,
    }

    impl ElectionListener for RecordingListener {
        fn conclude_election(&self, success: bool, leader: Option<NodeId>) {
            self.conclusions.lock().push((success, leader));
        }

        fn assess_leader_health(&self) -> bool {
            self.presume_dead
        }
    }

    struct NullDirectory;

    impl Directory for NullDirectory {
        fn lookup(&self, _node: NodeId, _purpose: ConnectionPurpose) -> Option<ChannelHandle> {
            None
        }

        fn broadcast(&self, _envelope: Envelope) {}
    }

    fn concrete_engine(
        node_id: NodeId,
        peers: Vec<NodeId>,
        presume_dead: bool,
    ) -> (Arc<RaftEngine>, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener {
            conclusions: PlMutex::new(Vec::new()),
            presume_dead,
        });
        let ctx = EngineContext {
            node_id,
            peers,
            directory: Arc::new(NullDirectory),
            listener: listener.clone(),
            heartbeat: Arc::new(HeartbeatClock::new()),
            timing: ElectionTiming::default(),
        };
        let engine = Arc::new(RaftEngine {
            ctx,
            state: Mutex::new(EngineState {
                role: Role::Follower,
                term: 0,
                voted_term: None,
                timeout: Duration::from_millis(500),
                append_pending: false,
            }),
        });
        (engine, listener)
    }

    fn engine_with_peers(
        node_id: NodeId,
        peers: Vec<NodeId>,
    ) -> (Arc<dyn ElectionEngine>, Arc<RecordingListener>) {
        let (engine, listener) = concrete_engine(node_id, peers, false);
        (engine, listener)
    }

    #[test]
    fn grants_one_vote_per_term() {
        let (engine, _) = engine_with_peers(1, vec![2, 3]);

        let request = Envelope::election(2, ElectionAction::RequestVote, 1, Some(2));
        let reply = engine.process(&request).expect("first request granted");
        let payload = reply.election.unwrap();
        assert_eq!(payload.action, ElectionAction::Vote);
        assert_eq!(payload.term, 1);
        assert_eq!(payload.leader, Some(2));

        // Competing candidate in the same term is refused.
        let rival = Envelope::election(3, ElectionAction::RequestVote, 1, Some(3));
        assert!(engine.process(&rival).is_none());

        // A higher term resets the vote.
        let next = Envelope::election(3, ElectionAction::RequestVote, 2, Some(3));
        assert!(engine.process(&next).is_some());
    }

    #[test]
    fn stale_term_request_is_ignored() {
        let (engine, _) = engine_with_peers(1, vec![2, 3]);

        engine
            .process(&Envelope::election(2, ElectionAction::RequestVote, 5, Some(2)))
            .expect("granted");
        assert!(engine
            .process(&Envelope::election(3, ElectionAction::RequestVote, 4, Some(3)))
            .is_none());
    }

    #[test]
    fn leader_announcement_concludes_cycle() {
        let (engine, listener) = engine_with_peers(1, vec![2, 3]);

        let announce = Envelope::election(2, ElectionAction::LeaderIs, 3, Some(2));
        assert!(engine.process(&announce).is_none());
        assert_eq!(listener.conclusions.lock().as_slice(), &[(true, Some(2))]);
    }

    #[test]
    fn majority_of_votes_wins() {
        // Majority for 5 nodes is 3: self-vote plus two grants.
        let (engine, listener) = concrete_engine(1, vec![2, 3, 4, 5], true);

        let request = engine.start_election().expect("vote request");
        assert_eq!(request.action(), Some(ElectionAction::RequestVote));

        assert!(engine
            .process(&Envelope::election(2, ElectionAction::Vote, 1, Some(1)))
            .is_none());
        let announce = engine
            .process(&Envelope::election(3, ElectionAction::Vote, 1, Some(1)))
            .expect("winner announcement");
        assert_eq!(announce.action(), Some(ElectionAction::LeaderIs));
        assert_eq!(announce.election.unwrap().leader, Some(1));
        assert_eq!(listener.conclusions.lock().as_slice(), &[(true, Some(1))]);

        // Late votes after the win are ignored.
        assert!(engine
            .process(&Envelope::election(4, ElectionAction::Vote, 1, Some(1)))
            .is_none());
    }

    #[test]
    fn duplicate_votes_from_one_peer_count_once() {
        let (engine, listener) = concrete_engine(1, vec![2, 3, 4, 5], true);
        engine.start_election();

        for _ in 0..3 {
            assert!(engine
                .process(&Envelope::election(2, ElectionAction::Vote, 1, Some(1)))
                .is_none());
        }
        assert!(listener.conclusions.lock().is_empty());
    }

    #[test]
    fn single_node_cluster_wins_immediately() {
        let (engine, listener) = concrete_engine(9, Vec::new(), true);

        let announce = engine.start_election().expect("announcement");
        assert_eq!(announce.action(), Some(ElectionAction::LeaderIs));
        assert_eq!(listener.conclusions.lock().as_slice(), &[(true, Some(9))]);
    }

    #[test]
    fn heartbeat_resets_staleness() {
        let (engine, _) = engine_with_peers(1, vec![2]);
        let beat = Envelope::heartbeat(2);
        assert!(engine.process(&beat).is_none());
    }
}
