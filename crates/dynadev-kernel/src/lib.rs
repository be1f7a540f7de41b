//! `dynadev-kernel` – Access control and liveness bookkeeping
//!
//! Enforces the rules a device applies before serving a request. It holds no
//! registry state of its own.
//!
//! # Modules
//!
//! - [`busy`] – [`BusyState`][busy::BusyState]: the per-device busy gate set
//!   while a long-running reconfiguration executes, and the RAII
//!   [`BusyLease`][busy::BusyLease] held by that reconfiguration.
//! - [`access_guard`] – [`AccessGuard`][access_guard::AccessGuard]: decides per
//!   [`OperationKind`][dynadev_types::OperationKind] and target name whether a
//!   request may proceed, according to a configurable
//!   [`GatePolicy`][access_guard::GatePolicy].
//! - [`watchdog`] – [`LivenessTracker`][watchdog::LivenessTracker]: counts
//!   heartbeat periods without an acknowledgement and reports subscribers
//!   that have gone silent.

pub mod access_guard;
pub mod busy;
pub mod watchdog;

pub use access_guard::{AccessGuard, GatePolicy};
pub use busy::{BusyLease, BusyState};
pub use watchdog::{Liveness, LivenessTracker};
