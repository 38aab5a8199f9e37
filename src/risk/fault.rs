//! Fault-injection harness for the risk state machine.
//!
//! Faults are ordinary inputs to the escalation function (or a failing
//! telemetry source); nothing here can crash the process.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;

use super::machine::{FatalCondition, RiskInput};
use super::telemetry::{TelemetrySample, TelemetrySource};

#[derive(Debug, Clone)]
pub struct FaultProfile {
    pub chaos_spike_rate: f64,
    pub fatal_rate: f64,
    pub telemetry_failure_rate: f64,
    pub spike_size: f64,
}

impl FaultProfile {
    pub fn disabled() -> Self {
        Self { chaos_spike_rate: 0.0, fatal_rate: 0.0, telemetry_failure_rate: 0.0, spike_size: 0.0 }
    }
}

pub fn should_fault(seed: u64, rate: f64) -> bool {
    let v = (seed % 10_000) as f64 / 10_000.0;
    v < rate
}

/// SplitMix64 step, for reproducible per-step seeds.
fn mix(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    ChaosSpike(f64),
    ForcedFatal,
    TelemetryFailure,
}

impl Fault {
    /// The risk input this fault turns into. Telemetry failures have none:
    /// they show up as a read error on the source.
    pub fn as_input(&self) -> Option<RiskInput> {
        match self {
            Fault::ChaosSpike(delta) => Some(RiskInput::ChaosDelta { delta: *delta, source: "fault_injection".into() }),
            Fault::ForcedFatal => Some(RiskInput::Fatal(FatalCondition::ChaosInjection)),
            Fault::TelemetryFailure => None,
        }
    }
}

/// Deterministic fault schedule: same profile and seed, same faults.
#[derive(Debug, Clone)]
pub struct FaultPlan {
    pub steps: Vec<Option<Fault>>,
}

impl FaultPlan {
    pub fn generate(profile: &FaultProfile, seed: u64, len: usize) -> Self {
        let mut state = seed;
        let steps = (0..len)
            .map(|_| {
                state = mix(state);
                if should_fault(state, profile.fatal_rate) {
                    return Some(Fault::ForcedFatal);
                }
                let s2 = mix(state ^ 0xA5A5);
                if should_fault(s2, profile.chaos_spike_rate) {
                    return Some(Fault::ChaosSpike(profile.spike_size));
                }
                let s3 = mix(state ^ 0x5A5A);
                if should_fault(s3, profile.telemetry_failure_rate) {
                    return Some(Fault::TelemetryFailure);
                }
                None
            })
            .collect();
        Self { steps }
    }

    pub fn inputs(&self) -> Vec<RiskInput> {
        self.steps.iter().flatten().filter_map(Fault::as_input).collect()
    }
}

/// Telemetry source that fails on a schedule and otherwise returns `samples`.
pub struct FaultyTelemetry {
    plan: FaultPlan,
    samples: Vec<TelemetrySample>,
    calls: AtomicU64,
}

impl FaultyTelemetry {
    pub fn new(plan: FaultPlan, samples: Vec<TelemetrySample>) -> Self {
        Self { plan, samples, calls: AtomicU64::new(0) }
    }

    /// Fails every read.
    pub fn always_failing() -> Self {
        Self::new(FaultPlan { steps: vec![Some(Fault::TelemetryFailure)] }, Vec::new())
    }
}

#[async_trait]
impl TelemetrySource for FaultyTelemetry {
    async fn read(&self) -> anyhow::Result<Vec<TelemetrySample>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        let step = if self.plan.steps.is_empty() { None } else { self.plan.steps[n % self.plan.steps.len()].clone() };
        match step {
            Some(Fault::TelemetryFailure) => Err(anyhow!("injected telemetry failure")),
            _ => Ok(self.samples.clone()),
        }
    }
}
