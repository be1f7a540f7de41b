//! [`BusyState`] – the busy gate of one device.
//!
//! A reconfiguration takes the gate with [`BusyState::try_acquire`] and keeps
//! the returned [`BusyLease`] alive for as long as it runs. Dropping the lease
//! clears the gate. An explicit [`BusyState::set`] (the unlock path) bumps the
//! epoch so that an outstanding lease becomes stale and no longer clears or
//! bypasses the gate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::debug;

#[derive(Debug, Default)]
pub struct BusyState {
    busy: AtomicBool,
    epoch: AtomicU64,
}

impl BusyState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Force the gate to `busy`, invalidating any outstanding lease.
    pub fn set(&self, busy: bool) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.busy.store(busy, Ordering::SeqCst);
        debug!(busy, "busy state set explicitly");
    }

    /// Take the gate. Returns `None` when the device is already busy.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BusyLease> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(epoch, "busy lease acquired");
        Some(BusyLease {
            state: Arc::clone(self),
            epoch,
        })
    }
}

/// Proof that the holder owns the busy gate. Clears the gate on drop unless
/// the gate was forcibly reset in the meantime.
#[derive(Debug)]
pub struct BusyLease {
    state: Arc<BusyState>,
    epoch: u64,
}

impl BusyLease {
    /// `true` while this lease still owns `state`.
    pub fn holds(&self, state: &Arc<BusyState>) -> bool {
        Arc::ptr_eq(&self.state, state)
            && state.is_busy()
            && state.epoch.load(Ordering::SeqCst) == self.epoch
    }
}

impl Drop for BusyLease {
    fn drop(&mut self) {
        if self.state.epoch.load(Ordering::SeqCst) == self.epoch {
            self.state.busy.store(false, Ordering::SeqCst);
            debug!(epoch = self.epoch, "busy lease released");
        }
    }
}
