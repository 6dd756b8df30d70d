use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique node identifier, stable for the node's lifetime.
pub type NodeId = u64;

/// Identifier of a cluster in the network topology.
pub type ClusterId = u32;

/// Placeholder security code carried in every management header.
/// Peers are not authenticated in this layer; the code is carried, not verified.
pub const DEFAULT_SECURITY_CODE: i32 = -999;

/// Header common to every management envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub originator: NodeId,
    pub sent_at: DateTime<Utc>,
    pub security_code: i32,
}

/// Discriminant for the election protocol.
///
/// `WhoIsLeader` and `LeaderIs` form the leader-discovery shortcut and are
/// handled by the coordinator. The remaining actions are internal to the
/// election engine and opaque to everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionAction {
    WhoIsLeader,
    LeaderIs,
    RequestVote,
    Vote,
    Heartbeat,
}

/// Election payload of a management envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionPayload {
    pub action: ElectionAction,
    #[serde(default)]
    pub term: u64,
    /// Leader for `LeaderIs`/`Heartbeat`, candidate for `RequestVote`/`Vote`.
    #[serde(default)]
    pub leader: Option<NodeId>,
}

/// A management envelope: header plus an optional election payload.
///
/// Envelopes without an election payload are ignored by this layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub election: Option<ElectionPayload>,
}

impl Envelope {
    pub fn election(
        originator: NodeId,
        action: ElectionAction,
        term: u64,
        leader: Option<NodeId>,
    ) -> Self {
        Self {
            header: Header {
                originator,
                sent_at: Utc::now(),
                security_code: DEFAULT_SECURITY_CODE,
            },
            election: Some(ElectionPayload {
                action,
                term,
                leader,
            }),
        }
    }

    pub fn who_is_leader(originator: NodeId) -> Self {
        Self::election(originator, ElectionAction::WhoIsLeader, 0, None)
    }

    pub fn leader_is(originator: NodeId, leader: NodeId) -> Self {
        Self::election(originator, ElectionAction::LeaderIs, 0, Some(leader))
    }

    pub fn heartbeat(originator: NodeId) -> Self {
        Self::election(originator, ElectionAction::Heartbeat, 0, Some(originator))
    }

    pub fn action(&self) -> Option<ElectionAction> {
        self.election.as_ref().map(|p| p.action)
    }
}

/// One-time handshake sent when a node first establishes a connection into
/// a remote cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub from_cluster: ClusterId,
    pub from_node: NodeId,
    pub to_cluster: ClusterId,
    pub to_node: NodeId,
}

/// Everything that can travel over a management connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireMessage {
    Management(Envelope),
    Join(JoinRequest),
}
