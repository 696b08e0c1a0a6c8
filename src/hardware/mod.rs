//! Hardware access: status polling and the simulated rig.
//!
//! Real devices enter the system through the capability traits in
//! [`crate::core`]; this module holds what sits behind them — the snapshot
//! poller every deployment uses, and the simulated rig used by tests and
//! `RunMode::Simulation`.

pub mod mock;
pub mod poller;
