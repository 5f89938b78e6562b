//! Relay counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::pairing::Direction;

#[derive(Debug, Default)]
struct Counters {
    pairings: AtomicU64,
    replacements: AtomicU64,
    probe_aborts: AtomicU64,
    pending_bytes: AtomicU64,
    hub_to_external_bytes: AtomicU64,
    external_to_hub_bytes: AtomicU64,
}

/// Shared handle on a relay's counters.
///
/// Cloning is cheap; every clone observes the same relay.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    counters: Arc<Counters>,
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub pairings: u64,
    pub replacements: u64,
    pub probe_aborts: u64,
    pub pending_bytes: u64,
    pub hub_to_external_bytes: u64,
    pub external_to_hub_bytes: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        let c = &self.counters;
        RelayStatsSnapshot {
            pairings: c.pairings.load(Ordering::Relaxed),
            replacements: c.replacements.load(Ordering::Relaxed),
            probe_aborts: c.probe_aborts.load(Ordering::Relaxed),
            pending_bytes: c.pending_bytes.load(Ordering::Relaxed),
            hub_to_external_bytes: c.hub_to_external_bytes.load(Ordering::Relaxed),
            external_to_hub_bytes: c.external_to_hub_bytes.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_pairing(&self) -> u64 {
        self.counters.pairings.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_replacement(&self) {
        self.counters.replacements.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_probe_abort(&self) {
        self.counters.probe_aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pending(&self, bytes: u64) {
        self.counters.pending_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_copied(&self, direction: Direction, bytes: u64) {
        let counter = match direction {
            Direction::HubToExternal => &self.counters.hub_to_external_bytes,
            Direction::ExternalToHub => &self.counters.external_to_hub_bytes,
        };
        counter.fetch_add(bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_shared_between_clones() {
        let stats = RelayStats::new();
        let clone = stats.clone();

        assert_eq!(clone.record_pairing(), 1);
        assert_eq!(clone.record_pairing(), 2);
        clone.record_replacement();
        clone.record_copied(Direction::HubToExternal, 10);
        clone.record_copied(Direction::ExternalToHub, 3);
        clone.record_pending(5);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.pairings, 2);
        assert_eq!(snapshot.replacements, 1);
        assert_eq!(snapshot.hub_to_external_bytes, 10);
        assert_eq!(snapshot.external_to_hub_bytes, 3);
        assert_eq!(snapshot.pending_bytes, 5);
        assert_eq!(snapshot.probe_aborts, 0);
    }
}
