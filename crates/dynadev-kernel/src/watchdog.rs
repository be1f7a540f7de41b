//! [`LivenessTracker`] – heartbeat acknowledgement monitor.
//!
//! The event source calls [`LivenessTracker::tick`] once per heartbeat period.
//! Every registered peer that has not called [`LivenessTracker::ack`] since
//! the previous tick accumulates one missed period. Peers that miss more than
//! `max_missed` consecutive periods are removed from the tracker and returned
//! to the caller so their subscriptions can be cancelled.

use std::collections::HashMap;
use std::hash::Hash;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Liveness reported for a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The peer has acknowledged within its allowance.
    Alive,
    /// The peer is unknown or has been expired.
    Expired,
}

// ────────────────────────────────────────────────────────────────────────────
// LivenessTracker
// ────────────────────────────────────────────────────────────────────────────

/// Counts missed heartbeat periods per peer.
///
/// # Example
///
/// ```
/// use dynadev_kernel::watchdog::{Liveness, LivenessTracker};
///
/// let mut tracker = LivenessTracker::new(2);
/// tracker.register(7u64);
///
/// assert!(tracker.tick().is_empty()); // missed 1
/// tracker.ack(&7);                    // back to 0
/// assert!(tracker.tick().is_empty()); // missed 1
/// assert!(tracker.tick().is_empty()); // missed 2
/// assert_eq!(tracker.tick(), vec![7]); // missed 3 > 2 → expired
/// assert_eq!(tracker.liveness(&7), Liveness::Expired);
/// ```
#[derive(Debug)]
pub struct LivenessTracker<K> {
    max_missed: u32,
    missed: HashMap<K, u32>,
}

impl<K: Hash + Eq + Clone> LivenessTracker<K> {
    /// Create a tracker that tolerates `max_missed` silent periods.
    pub fn new(max_missed: u32) -> Self {
        Self {
            max_missed,
            missed: HashMap::new(),
        }
    }

    pub fn max_missed(&self) -> u32 {
        self.max_missed
    }

    /// Start tracking `peer`. Re-registering resets its count.
    pub fn register(&mut self, peer: K) {
        self.missed.insert(peer, 0);
    }

    /// Stop tracking `peer`. No-ops for unknown peers.
    pub fn remove(&mut self, peer: &K) {
        self.missed.remove(peer);
    }

    /// Record an acknowledgement. Returns `false` for unknown peers.
    pub fn ack(&mut self, peer: &K) -> bool {
        match self.missed.get_mut(peer) {
            Some(count) => {
                *count = 0;
                true
            }
            None => false,
        }
    }

    /// Advance one heartbeat period and return the peers that just expired.
    /// Expired peers are no longer tracked. The order of the returned list is
    /// unspecified.
    pub fn tick(&mut self) -> Vec<K> {
        let max = self.max_missed;
        let mut expired = Vec::new();
        self.missed.retain(|peer, count| {
            *count += 1;
            if *count > max {
                expired.push(peer.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn missed(&self, peer: &K) -> Option<u32> {
        self.missed.get(peer).copied()
    }

    pub fn liveness(&self, peer: &K) -> Liveness {
        match self.missed.get(peer) {
            Some(count) if *count <= self.max_missed => Liveness::Alive,
            _ => Liveness::Expired,
        }
    }
}
