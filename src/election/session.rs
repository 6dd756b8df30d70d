use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::engine::ElectionEngine;

/// The single election instance allowed in flight per process.
///
/// Created lazily by the coordinator the first time any operation needs an
/// engine, and dropped when a cycle concludes. Dropping cancels and aborts
/// the engine's monitor so a stale cycle can never outlive its slot.
pub struct ElectionSession {
    engine: Arc<dyn ElectionEngine>,
    cycle: u64,
    cancel: CancellationToken,
    monitor: Option<JoinHandle<()>>,
}

impl ElectionSession {
    /// Wrap an engine and start its monitor under a child of `parent`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(engine: Arc<dyn ElectionEngine>, cycle: u64, parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        let monitor = engine.clone().spawn_monitor(cancel.clone());
        Self {
            engine,
            cycle,
            cancel,
            monitor,
        }
    }

    pub fn engine(&self) -> Arc<dyn ElectionEngine> {
        self.engine.clone()
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }
}

impl Drop for ElectionSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}
