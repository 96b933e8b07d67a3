//! Round-robin position per kite name.

use dashmap::DashMap;
use std::sync::Arc;

/// Remembers which instance of each kite group was picked last.
#[derive(Debug, Clone, Default)]
pub struct Balancer {
    indices: Arc<DashMap<String, usize>>,
}

impl Balancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last index handed out for `group`, `0` if none yet.
    pub fn index_for(&self, group: &str) -> usize {
        self.indices.get(group).map(|i| *i.value()).unwrap_or(0)
    }

    /// Record `index` as the last pick for `group`.
    pub fn advance(&self, group: &str, index: usize) {
        self.indices.insert(group.to_string(), index);
    }

    /// Pick the next instance out of `n` and remember it.
    ///
    /// The stored index may be stale when the group shrank; the modulo keeps
    /// the result in range. Returns `0` for an empty group.
    pub fn next_index(&self, group: &str, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let mut last = self.indices.entry(group.to_string()).or_insert(0);
        let next = (*last + 1) % n;
        *last = next;
        next
    }
}
