use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::TuningConfig;

/// Ordered by severity; automatic transitions only ever move up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskMode {
    Normal,
    Escalated,
    Halted,
}

impl RiskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskMode::Normal => "normal",
            RiskMode::Escalated => "escalated",
            RiskMode::Halted => "halted",
        }
    }
}

impl fmt::Display for RiskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds the state machine reads from one config snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskParams {
    pub base_chaos_level: f64,
    pub max_chaos_level: f64,
    pub escalation_threshold: f64,
    pub max_drawdown: f64,
    pub drawdown_escalation: f64,
    pub drawdown_chaos_step: f64,
    pub latency_escalation_ms: u64,
    pub latency_chaos_step: f64,
    pub tick_min: f64,
    pub tick_max: f64,
}

impl RiskParams {
    pub fn from_tuning(t: &TuningConfig) -> Self {
        Self {
            base_chaos_level: t.base_chaos_level,
            max_chaos_level: t.max_chaos_level,
            escalation_threshold: t.escalation_threshold,
            max_drawdown: t.max_drawdown,
            drawdown_escalation: t.drawdown_escalation,
            drawdown_chaos_step: t.drawdown_chaos_step,
            latency_escalation_ms: t.latency_escalation_ms,
            latency_chaos_step: t.latency_chaos_step,
            tick_min: t.escalation_tick_min,
            tick_max: t.escalation_tick_max,
        }
    }
}

impl Default for RiskParams {
    fn default() -> Self {
        Self::from_tuning(&TuningConfig::default())
    }
}

/// Singleton risk state. Only the risk actor mutates it; everyone else
/// reads snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub chaos_level: f64,
    /// Current upper bound for `chaos_level`; commander-adjustable.
    pub chaos_cap: f64,
    pub drawdown_estimate: f64,
    pub equity_peak: f64,
    pub halted: bool,
    pub mode: RiskMode,
    pub last_transition_ms: u64,
    pub halt_reason: Option<String>,
    /// Bumped on every mutation.
    pub seq: u64,
}

impl RiskState {
    pub fn initial(params: &RiskParams, now_ms: u64) -> Self {
        Self {
            chaos_level: params.base_chaos_level.min(params.max_chaos_level),
            chaos_cap: params.max_chaos_level,
            drawdown_estimate: 0.0,
            equity_peak: 0.0,
            halted: false,
            mode: RiskMode::Normal,
            last_transition_ms: now_ms,
            halt_reason: None,
            seq: 0,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        if self.halted != (self.mode == RiskMode::Halted) {
            return Err(format!("halted={} but mode={}", self.halted, self.mode));
        }
        if !(self.chaos_cap > 0.0 && self.chaos_cap <= 1.0) {
            return Err(format!("chaos_cap {} outside (0, 1]", self.chaos_cap));
        }
        if !(0.0..=self.chaos_cap).contains(&self.chaos_level) {
            return Err(format!("chaos_level {} outside [0, {}]", self.chaos_level, self.chaos_cap));
        }
        if !self.drawdown_estimate.is_finite() || self.drawdown_estimate < 0.0 {
            return Err(format!("drawdown_estimate {} invalid", self.drawdown_estimate));
        }
        Ok(())
    }
}
