//! Leader election and cluster membership coordination.
//!
//! A node runs a [`coordinator::Coordinator`] that owns leader identity and
//! an exclusive election session, delegating the election protocol itself
//! to a pluggable [`election::ElectionEngine`] (Raft-style voting is the
//! built-in). Peer and cross-cluster connectivity is self-healing: the
//! [`cluster::ClusterConnectionManager`] keeps one live link into every
//! other known cluster and rejoins whenever a link drops.

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod election;
pub mod envelope;
pub mod error;
pub mod heartbeat;
pub mod log;
pub mod node;
pub mod shutdown;
pub mod transport;
