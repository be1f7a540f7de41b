//! [`AccessGuard`] – per-request admission check.
//!
//! Before a read, write, execute or configure request reaches device logic,
//! call [`AccessGuard::check`] (or the boolean [`AccessGuard::is_allowed`]).
//! While the device's [`BusyState`] is set, every operation kind listed in the
//! [`GatePolicy`] is denied with [`DevError::NotAllowed`], except:
//!
//! 1. targets listed as exempt in the policy,
//! 2. execution of the policy's unlock command,
//! 3. requests made by the holder of the current [`BusyLease`].
//!
//! Which operation kinds are gated is configuration, not code.

use std::collections::HashSet;
use std::sync::Arc;

use dynadev_types::{DevError, OperationKind};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::busy::{BusyLease, BusyState};

/// Which requests the busy gate blocks.
///
/// # Example
///
/// ```
/// use dynadev_kernel::{AccessGuard, BusyState, GatePolicy};
/// use dynadev_types::OperationKind;
///
/// let busy = BusyState::new();
/// let guard = AccessGuard::new(
///     busy.clone(),
///     GatePolicy::default().with_unlock_command("Unlock").exempt("busy"),
/// );
///
/// busy.set(true);
/// assert!(!guard.is_allowed(OperationKind::Execute, "iocmd"));
/// assert!(guard.is_allowed(OperationKind::Execute, "Unlock"));
/// assert!(guard.is_allowed(OperationKind::Read, "busy"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatePolicy {
    #[serde(default = "default_gated")]
    pub gated: HashSet<OperationKind>,
    /// Target names that stay reachable while busy (case-insensitive).
    #[serde(default)]
    pub exempt: HashSet<String>,
    #[serde(default)]
    pub unlock_command: Option<String>,
}

fn default_gated() -> HashSet<OperationKind> {
    [
        OperationKind::Read,
        OperationKind::Write,
        OperationKind::Execute,
        OperationKind::Configure,
    ]
    .into_iter()
    .collect()
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            gated: default_gated(),
            exempt: HashSet::new(),
            unlock_command: None,
        }
    }
}

impl GatePolicy {
    pub fn exempt(mut self, target: &str) -> Self {
        self.exempt.insert(target.to_ascii_lowercase());
        self
    }

    pub fn with_unlock_command(mut self, command: &str) -> Self {
        self.unlock_command = Some(command.to_string());
        self
    }

    pub fn ungate(mut self, kind: OperationKind) -> Self {
        self.gated.remove(&kind);
        self
    }

    fn normalized(mut self) -> Self {
        self.exempt = self.exempt.iter().map(|s| s.to_ascii_lowercase()).collect();
        self
    }

    fn is_unlock(&self, kind: OperationKind, target: &str) -> bool {
        kind == OperationKind::Execute
            && self
                .unlock_command
                .as_deref()
                .is_some_and(|cmd| cmd.eq_ignore_ascii_case(target))
    }
}

/// Busy-state admission check shared by the registry and the request paths.
#[derive(Debug, Clone)]
pub struct AccessGuard {
    busy: Arc<BusyState>,
    policy: Arc<GatePolicy>,
}

impl AccessGuard {
    pub fn new(busy: Arc<BusyState>, policy: GatePolicy) -> Self {
        Self {
            busy,
            policy: Arc::new(policy.normalized()),
        }
    }

    pub fn busy_state(&self) -> &Arc<BusyState> {
        &self.busy
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Return `true` when an anonymous caller may perform `kind` on `target`.
    pub fn is_allowed(&self, kind: OperationKind, target: &str) -> bool {
        self.check(kind, target, None).is_ok()
    }

    /// Return `Ok(())` when the request may proceed, or
    /// [`DevError::NotAllowed`] otherwise.
    pub fn check(
        &self,
        kind: OperationKind,
        target: &str,
        lease: Option<&BusyLease>,
    ) -> Result<(), DevError> {
        if !self.busy.is_busy() || !self.policy.gated.contains(&kind) {
            return Ok(());
        }
        if self.policy.exempt.contains(&target.to_ascii_lowercase())
            || self.policy.is_unlock(kind, target)
            || lease.is_some_and(|l| l.holds(&self.busy))
        {
            return Ok(());
        }
        warn!(operation = %kind, target, "request denied while busy");
        Err(DevError::NotAllowed {
            operation: kind,
            target: target.to_string(),
            reason: "device is busy".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(policy: GatePolicy) -> (Arc<BusyState>, AccessGuard) {
        let busy = BusyState::new();
        let guard = AccessGuard::new(busy.clone(), policy);
        (busy, guard)
    }

    #[test]
    fn everything_allowed_when_idle() {
        let (_busy, g) = guard(GatePolicy::default());
        for kind in [
            OperationKind::Read,
            OperationKind::Write,
            OperationKind::Execute,
            OperationKind::Configure,
        ] {
            assert!(g.is_allowed(kind, "anything"));
        }
    }

    #[test]
    fn busy_blocks_commands_except_unlock() {
        let (busy, g) = guard(GatePolicy::default().with_unlock_command("Unlock"));
        busy.set(true);
        assert!(!g.is_allowed(OperationKind::Execute, "some_command"));
        assert!(!g.is_allowed(OperationKind::Execute, "iocmd"));
        assert!(g.is_allowed(OperationKind::Execute, "unlock"));
        busy.set(false);
        assert!(g.is_allowed(OperationKind::Execute, "some_command"));
    }

    #[test]
    fn unlock_name_does_not_exempt_reads() {
        let (busy, g) = guard(GatePolicy::default().with_unlock_command("Unlock"));
        busy.set(true);
        assert!(!g.is_allowed(OperationKind::Read, "Unlock"));
    }

    #[test]
    fn exempt_targets_are_case_insensitive() {
        let (busy, g) = guard(GatePolicy::default().exempt("Busy"));
        busy.set(true);
        assert!(g.is_allowed(OperationKind::Read, "busy"));
        assert!(g.is_allowed(OperationKind::Read, "BUSY"));
        assert!(!g.is_allowed(OperationKind::Read, "ioattr"));
    }

    #[test]
    fn ungated_kind_passes_while_busy() {
        let (busy, g) = guard(GatePolicy::default().ungate(OperationKind::Read));
        busy.set(true);
        assert!(g.is_allowed(OperationKind::Read, "ioattr"));
        assert!(!g.is_allowed(OperationKind::Write, "ioattr"));
    }

    #[test]
    fn lease_holder_bypasses_gate() {
        let (busy, g) = guard(GatePolicy::default());
        let lease = busy.try_acquire().expect("gate is free");
        assert!(g.check(OperationKind::Configure, "ioattr", Some(&lease)).is_ok());
        let denied = g.check(OperationKind::Configure, "ioattr", None);
        assert!(matches!(denied, Err(DevError::NotAllowed { .. })));
    }

    #[test]
    fn stale_lease_does_not_bypass() {
        let (busy, g) = guard(GatePolicy::default());
        let lease = busy.try_acquire().expect("gate is free");
        busy.set(true);
        assert!(g.check(OperationKind::Configure, "ioattr", Some(&lease)).is_err());
    }
}
