use std::collections::BTreeMap;

/// Append-only log of leader-issued entries.
///
/// `log_index` is the index of the last appended entry and grows by exactly
/// one per append; `prev_log_index` is always the pre-append value of
/// `log_index`. Entries are never removed. Appends must come from a single
/// logical writer; callers racing on this structure need an external lock
/// around the whole read-modify-write (the coordinator provides one).
#[derive(Debug, Default)]
pub struct ReplicatedLog {
    entries: BTreeMap<u64, String>,
    log_index: u64,
    prev_log_index: u64,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a payload and return its index.
    pub fn append(&mut self, payload: impl Into<String>) -> u64 {
        self.prev_log_index = self.log_index;
        self.log_index += 1;
        self.entries.insert(self.log_index, payload.into());
        self.log_index
    }

    pub fn log_index(&self) -> u64 {
        self.log_index
    }

    pub fn prev_log_index(&self) -> u64 {
        self.prev_log_index
    }

    pub fn entry(&self, index: u64) -> Option<&str> {
        self.entries.get(&index).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
