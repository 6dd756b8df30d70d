use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Process-wide record of the last observed leader heartbeat.
///
/// Advanced whenever evidence of a live leader arrives (a heartbeat, a
/// granted vote, a discovery round). Failure detection reads `elapsed()`
/// and compares it against the election timeout.
#[derive(Debug)]
pub struct HeartbeatClock {
    last: RwLock<Instant>,
}

impl HeartbeatClock {
    pub fn new() -> Self {
        Self {
            last: RwLock::new(Instant::now()),
        }
    }

    /// Record a heartbeat observation now.
    pub fn touch(&self) {
        *self.last.write() = Instant::now();
    }

    /// Time since the last observation.
    pub fn elapsed(&self) -> Duration {
        self.last.read().elapsed()
    }
}

impl Default for HeartbeatClock {
    fn default() -> Self {
        Self::new()
    }
}
