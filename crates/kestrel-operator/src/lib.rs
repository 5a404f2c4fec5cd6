//! Convergence engine for kestrel clusters
//!
//! Each tick probes the cluster, walks the [`phase`] transition table until
//! a phase yields an [`Operator`], and runs that operator's commanders one at
//! a time under an operation record. [`Controller`] drives ticks while
//! holding leadership.

#![deny(missing_docs)]

pub mod commands;
pub mod controller;
pub mod operator;
pub mod operators;
pub mod paths;
pub mod phase;
pub mod probe;
pub mod services;
pub mod tick;

#[cfg(test)]
mod testing;

pub use controller::Controller;
pub use operator::{Commander, Operator, Plan};
pub use operators::{decide, operator_for, Context, Decision};
pub use phase::{next_phase, Condition, Phase, Transition, TRANSITIONS};
pub use probe::probe;
pub use tick::{execute, run_tick, TickOutcome};
