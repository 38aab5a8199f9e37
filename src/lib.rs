//! Risk-gated signal pipeline with a circuit-breaker control plane.
//!
//! Signals arrive on the bus, pass the entropy/confidence gate, and are
//! blocked outright while the risk state machine is halted. Operator
//! overrides go through the commander and land in a hash-chained ledger.
//! Realized profit is split into reinvest, buffer and withdraw sinks.

pub mod bus;
pub mod commander;
pub mod config;
pub mod error;
pub mod flags;
pub mod gate;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod profit;
pub mod risk;
pub mod runtime;
pub mod signal;
pub mod storage;
