//! Risk state machine: Normal → Escalated → Halted, reset only by an
//! authenticated commander.
//!
//! `machine::apply` is the pure transition function. `actor` owns the single
//! live `RiskState`, persists it, records transitions in the ledger and
//! publishes snapshots. Everything else holds a `RiskHandle`.

pub mod actor;
pub mod fault;
pub mod machine;
pub mod state;
pub mod telemetry;

pub use actor::{spawn_risk_actor, RiskDeps, RiskHandle};
pub use machine::{apply, FatalCondition, RiskInput, Step, Transition};
pub use state::{RiskMode, RiskParams, RiskState};
pub use telemetry::{TelemetrySample, TelemetrySource, TradeResult};
