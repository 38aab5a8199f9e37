//! Pure transition function: (RiskState, RiskInput) -> Step
//!
//! Everything the risk actor does to the state happens here, so the fault
//! harness and the property tests can drive it without a runtime.
//!
//! | From      | Input                                    | To        |
//! |-----------|------------------------------------------|-----------|
//! | Normal    | chaos raised above `escalation_threshold` | Escalated |
//! | any       | chaos reaches the cap                    | Halted    |
//! | any       | fatal condition / kill switch            | Halted    |
//! | Escalated, Halted | authenticated reset              | Normal    |

use serde::{Deserialize, Serialize};

use super::state::{RiskMode, RiskParams, RiskState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum FatalCondition {
    Drawdown { value: f64 },
    SystemError { detail: String },
    ChaosInjection,
    LedgerCorruption { at: u64 },
    BusFailure { topic: String },
}

impl FatalCondition {
    pub fn reason(&self) -> String {
        match self {
            FatalCondition::Drawdown { .. } => "drawdown_limit".to_string(),
            FatalCondition::SystemError { detail } => format!("system_error: {}", detail),
            FatalCondition::ChaosInjection => "chaos_injection".to_string(),
            FatalCondition::LedgerCorruption { at } => format!("ledger_corruption at {}", at),
            FatalCondition::BusFailure { topic } => format!("bus_failure on {}", topic),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskInput {
    /// Raw chaos increase. Negative deltas count as zero.
    ChaosDelta { delta: f64, source: String },
    Latency { ms: u64 },
    Drawdown { value: f64 },
    TradeResult { pnl: f64, equity: f64 },
    Fatal(FatalCondition),
    KillSwitch { actor: String },
    Reset { actor: String },
    SetChaosCap { cap: f64, actor: String },
}

impl RiskInput {
    pub fn actor(&self) -> &str {
        match self {
            RiskInput::KillSwitch { actor } | RiskInput::Reset { actor } | RiskInput::SetChaosCap { actor, .. } => {
                actor
            }
            _ => crate::ledger::RISK_ACTOR,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: RiskMode,
    pub to: RiskMode,
    pub reason: String,
    pub actor: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub state: RiskState,
    pub transition: Option<Transition>,
}

impl Step {
    pub fn changed(&self, before: &RiskState) -> bool {
        self.state != *before
    }
}

fn halt(next: &mut RiskState, reason: String) {
    next.mode = RiskMode::Halted;
    next.halted = true;
    next.halt_reason = Some(reason);
}

/// Raise chaos by `delta` and derive the mode. Halted ignores increases.
fn raise(next: &mut RiskState, params: &RiskParams, delta: f64, source: &str) -> Option<String> {
    if next.halted {
        return None;
    }
    let delta = if delta.is_finite() { delta.max(0.0) } else { 0.0 };
    next.chaos_level = (next.chaos_level + delta).min(next.chaos_cap);
    if next.chaos_level >= next.chaos_cap {
        halt(next, format!("chaos_cap_reached ({})", source));
        return Some("chaos_cap_reached".to_string());
    }
    if next.mode == RiskMode::Normal && next.chaos_level > params.escalation_threshold {
        next.mode = RiskMode::Escalated;
        return Some(format!("chaos_above_threshold ({})", source));
    }
    None
}

fn drawdown(next: &mut RiskState, params: &RiskParams, value: f64) -> Option<String> {
    if !value.is_finite() {
        return None;
    }
    let value = value.max(0.0);
    next.drawdown_estimate = value;
    if value > params.max_drawdown {
        if next.halted {
            return None;
        }
        halt(next, FatalCondition::Drawdown { value }.reason());
        return Some("drawdown_limit".to_string());
    }
    if value > params.drawdown_escalation {
        return raise(next, params, params.drawdown_chaos_step, "drawdown");
    }
    None
}

pub fn apply(state: &RiskState, params: &RiskParams, input: &RiskInput, now_ms: u64) -> Step {
    let mut next = state.clone();
    let reason: Option<String> = match input {
        RiskInput::ChaosDelta { delta, source } => raise(&mut next, params, *delta, source),
        RiskInput::Latency { ms } => {
            if *ms > params.latency_escalation_ms {
                raise(&mut next, params, params.latency_chaos_step, "latency")
            } else {
                None
            }
        }
        RiskInput::Drawdown { value } => drawdown(&mut next, params, *value),
        RiskInput::TradeResult { pnl: _, equity } => {
            if equity.is_finite() {
                next.equity_peak = next.equity_peak.max(*equity);
                let dd = if next.equity_peak > 0.0 { (next.equity_peak - equity) / next.equity_peak } else { 0.0 };
                drawdown(&mut next, params, dd)
            } else {
                None
            }
        }
        RiskInput::Fatal(cond) => {
            if next.halted {
                None
            } else {
                halt(&mut next, cond.reason());
                Some(cond.reason())
            }
        }
        RiskInput::KillSwitch { .. } => {
            if next.halted {
                None
            } else {
                halt(&mut next, "kill_switch".to_string());
                Some("kill_switch".to_string())
            }
        }
        RiskInput::Reset { .. } => {
            if next.mode == RiskMode::Normal {
                None
            } else {
                next.mode = RiskMode::Normal;
                next.halted = false;
                next.halt_reason = None;
                next.chaos_level = params.base_chaos_level.min(next.chaos_cap);
                next.drawdown_estimate = 0.0;
                Some("reset".to_string())
            }
        }
        RiskInput::SetChaosCap { cap, .. } => {
            if !(cap.is_finite() && *cap > 0.0 && *cap <= 1.0) {
                None
            } else {
                next.chaos_cap = *cap;
                next.chaos_level = next.chaos_level.min(*cap);
                if !next.halted && next.chaos_level >= *cap {
                    halt(&mut next, "chaos_cap_lowered".to_string());
                    Some("chaos_cap_lowered".to_string())
                } else {
                    None
                }
            }
        }
    };

    let transition = match reason {
        Some(reason) if next.mode != state.mode => {
            next.last_transition_ms = now_ms;
            Some(Transition { from: state.mode, to: next.mode, reason, actor: input.actor().to_string() })
        }
        _ => None,
    };
    if next != *state {
        next.seq = state.seq + 1;
    }
    Step { state: next, transition }
}
