use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::envelope::{Envelope, NodeId, WireMessage};
use crate::error::{FlotillaError, Result};

/// Tag distinguishing management-protocol connections from data-plane
/// connections to the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPurpose {
    Management,
    Data,
}

/// Cloneable sending half of a peer connection.
///
/// Sends are non-blocking and fallible; a full or closed channel surfaces
/// as an error the caller can drop or log. `is_closed` reports whether the
/// other half (the connection's writer task) has gone away.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    tx: mpsc::Sender<WireMessage>,
}

impl ChannelHandle {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WireMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn send(&self, message: WireMessage) -> Result<()> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => FlotillaError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => FlotillaError::ChannelClosed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Resolves nodes to live channels and fans envelopes out to peers.
///
/// All operations are safe to call from any thread or task and never block.
pub trait Directory: Send + Sync {
    fn lookup(&self, node: NodeId, purpose: ConnectionPurpose) -> Option<ChannelHandle>;
    fn broadcast(&self, envelope: Envelope);
}

/// In-process connection directory backed by a registration map.
///
/// Transport code registers a channel once the peer behind a connection is
/// known and removes it when the connection ends. Lookups prune entries
/// whose writer task has already exited.
#[derive(Default)]
pub struct SharedDirectory {
    channels: RwLock<HashMap<(NodeId, ConnectionPurpose), ChannelHandle>>,
}

impl SharedDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: NodeId, purpose: ConnectionPurpose, handle: ChannelHandle) {
        tracing::debug!(node, ?purpose, "channel registered");
        self.channels.write().insert((node, purpose), handle);
    }

    pub fn remove(&self, node: NodeId, purpose: ConnectionPurpose) {
        if self.channels.write().remove(&(node, purpose)).is_some() {
            tracing::debug!(node, ?purpose, "channel removed");
        }
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}

impl Directory for SharedDirectory {
    fn lookup(&self, node: NodeId, purpose: ConnectionPurpose) -> Option<ChannelHandle> {
        let handle = self.channels.read().get(&(node, purpose)).cloned()?;
        if handle.is_closed() {
            self.remove(node, purpose);
            return None;
        }
        Some(handle)
    }

    fn broadcast(&self, envelope: Envelope) {
        let channels = self.channels.read();
        for ((node, purpose), handle) in channels.iter() {
            if *purpose != ConnectionPurpose::Management || *node == envelope.header.originator {
                continue;
            }
            if let Err(e) = handle.send(WireMessage::Management(envelope.clone())) {
                tracing::debug!(node, error = %e, "broadcast send dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    #[tokio::test]
    async fn lookup_returns_registered_channel() {
        let directory = SharedDirectory::new();
        let (handle, mut rx) = ChannelHandle::new(4);
        directory.register(5, ConnectionPurpose::Management, handle);

        let found = directory
            .lookup(5, ConnectionPurpose::Management)
            .expect("channel registered");
        found
            .send(WireMessage::Management(Envelope::who_is_leader(1)))
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(WireMessage::Management(env)) if env.header.originator == 1
        ));

        assert!(directory.lookup(5, ConnectionPurpose::Data).is_none());
        assert!(directory.lookup(6, ConnectionPurpose::Management).is_none());
    }

    #[tokio::test]
    async fn lookup_prunes_closed_channels() {
        let directory = SharedDirectory::new();
        let (handle, rx) = ChannelHandle::new(4);
        directory.register(5, ConnectionPurpose::Management, handle);

        drop(rx);
        assert!(directory.lookup(5, ConnectionPurpose::Management).is_none());
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn broadcast_skips_originator() {
        let directory = SharedDirectory::new();
        let (h1, mut rx1) = ChannelHandle::new(4);
        let (h2, mut rx2) = ChannelHandle::new(4);
        directory.register(1, ConnectionPurpose::Management, h1);
        directory.register(2, ConnectionPurpose::Management, h2);

        directory.broadcast(Envelope::who_is_leader(1));

        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }
}
