//! `relaybank-kernel` – Switching & Interlock
//!
//! The only part of the controller with real invariants.  It does not know
//! about HTTP or configuration files; it owns the relay lines and enforces
//! the rules.
//!
//! # Modules
//!
//! - [`interlock`] – [`InterlockPolicy`][interlock::InterlockPolicy]:
//!   a pure rule engine that validates a requested channel change against the
//!   current snapshot.  The built-in
//!   [`ExclusiveGroupRule`][interlock::ExclusiveGroupRule] keeps at most one
//!   input of each mutual-exclusion group energised.
//! - [`engine`] – [`SwitchEngine`][engine::SwitchEngine]:
//!   single owner of the [`LineDriver`][relaybank_hal::LineDriver]; runs
//!   single-channel sets and break-before-make source changeovers under one
//!   exclusive lock with a mandatory settling interval.
//! - [`emergency`] – [`force_all_off`][emergency::force_all_off]:
//!   unconditional all-off pass that attempts every channel independently.

pub mod emergency;
pub mod engine;
pub mod interlock;

pub use emergency::force_all_off;
pub use engine::{SwitchEngine, DEFAULT_SETTLE};
pub use interlock::{ExclusiveGroupRule, InterlockPolicy, InterlockRule};
