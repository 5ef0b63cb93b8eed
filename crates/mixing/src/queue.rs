//! Queue-announce bookkeeping and rate limiting.
//!
//! Every accepted announcement advances a network-wide counter. A masternode
//! that just announced may not announce again until the counter has moved by
//! `enabled_count / 5` — with many masternodes active, each one's turn comes
//! around rarely.

use std::collections::HashMap;

use umbra_primitives::outpoint::OutPoint;

use crate::error::PoolError;
use crate::messages::QueueAnnounce;

/// How long an announcement stays usable for coordinator selection.
const QUEUE_ANNOUNCE_TTL_SECS: i64 = 120;

#[derive(Clone, Debug)]
pub struct ActiveQueue {
    pub announce: QueueAnnounce,
    pub received_at: i64,
}

#[derive(Default)]
pub struct QueueTracker {
    counter: u64,
    last_seq: HashMap<OutPoint, u64>,
    active: Vec<ActiveQueue>,
}

impl QueueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Applies the rate limit and records the announcement. `Err(StaleQueue)`
    /// for a masternode announcing again too soon.
    pub fn accept(
        &mut self,
        announce: &QueueAnnounce,
        enabled_count: usize,
        now: i64,
    ) -> Result<(), PoolError> {
        let required_advance = ((enabled_count / 5) as u64).max(1);
        if let Some(&last) = self.last_seq.get(&announce.coordinator) {
            if self.counter < last + required_advance {
                return Err(PoolError::StaleQueue);
            }
        }
        self.counter += 1;
        self.last_seq.insert(announce.coordinator, self.counter);
        self.active.push(ActiveQueue {
            announce: announce.clone(),
            received_at: now,
        });
        Ok(())
    }

    /// Drops expired announcements; call from the periodic tick.
    pub fn prune(&mut self, now: i64) {
        self.active
            .retain(|entry| now - entry.received_at <= QUEUE_ANNOUNCE_TTL_SECS);
    }

    /// Live announcements offering `denomination`, freshest last.
    pub fn matching(&self, denomination: u32) -> Vec<&ActiveQueue> {
        self.active
            .iter()
            .filter(|entry| entry.announce.denomination == denomination)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce(tag: u8, denomination: u32, time: i64) -> QueueAnnounce {
        QueueAnnounce {
            denomination,
            coordinator: OutPoint::new([tag; 32], 0),
            time,
            ready: false,
            signature: vec![0x30],
        }
    }

    #[test]
    fn reannounce_is_stale_until_the_counter_advances() {
        let mut tracker = QueueTracker::new();
        let first = announce(1, 0b00100, 100);
        tracker.accept(&first, 20, 100).expect("fresh");

        // 20 enabled nodes: the counter must move 4 before node 1 may repeat.
        assert_eq!(
            tracker.accept(&first, 20, 110),
            Err(PoolError::StaleQueue)
        );
        for tag in 2..=4 {
            tracker
                .accept(&announce(tag, 0b00100, 120), 20, 120)
                .expect("other nodes fresh");
        }
        assert_eq!(
            tracker.accept(&first, 20, 130),
            Err(PoolError::StaleQueue)
        );
        tracker
            .accept(&announce(5, 0b00100, 140), 20, 140)
            .expect("fresh");
        tracker.accept(&first, 20, 150).expect("limit satisfied");
    }

    #[test]
    fn tiny_networks_still_require_one_step() {
        let mut tracker = QueueTracker::new();
        let first = announce(1, 0b00001, 0);
        tracker.accept(&first, 3, 0).expect("fresh");
        assert_eq!(tracker.accept(&first, 3, 1), Err(PoolError::StaleQueue));
        tracker.accept(&announce(2, 0b00001, 2), 3, 2).expect("fresh");
        tracker.accept(&first, 3, 3).expect("advanced");
    }

    #[test]
    fn prune_drops_old_announcements() {
        let mut tracker = QueueTracker::new();
        tracker.accept(&announce(1, 0b00100, 0), 10, 0).expect("fresh");
        tracker.accept(&announce(2, 0b00010, 100), 10, 100).expect("fresh");
        tracker.prune(150);
        assert_eq!(tracker.matching(0b00100).len(), 0);
        assert_eq!(tracker.matching(0b00010).len(), 1);
    }
}
