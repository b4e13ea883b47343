//! Server counters for LUSERS and STATS

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Monotonic counters, cheap to bump from any task.
#[derive(Debug, Default)]
pub struct Statistics {
    pub connections_accepted: AtomicU64,
    pub messages_received: AtomicU64,
    pub commands_handled: AtomicU64,
    pub unknown_commands: AtomicU64,
    pub kills: AtomicU64,
    pub squits: AtomicU64,
    /// High-water mark of simultaneous local users
    pub max_local_users: AtomicUsize,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Track the local-user high-water mark.
    pub fn note_local_users(&self, current: usize) {
        self.max_local_users.fetch_max(current, Ordering::Relaxed);
    }

    pub fn max_local_users(&self) -> usize {
        self.max_local_users.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_water_mark() {
        let stats = Statistics::new();
        stats.note_local_users(5);
        stats.note_local_users(3);
        assert_eq!(stats.max_local_users(), 5);
        stats.note_local_users(9);
        assert_eq!(stats.max_local_users(), 9);
    }
}
