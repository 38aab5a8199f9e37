//! Signal quality gate.
//!
//! Each raw signal gets exactly one terminal event: `signal.accepted` or
//! `signal.rejected`. Repeats of an id inside its dedup window produce
//! nothing. Rejections are archived in the background; a failed archive
//! write is logged and does not affect the verdict.

pub mod archive;
pub mod dedup;

use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::bus::retry::RetryConfig;
use crate::bus::{publish_json, Bus, BusStream, Topic, Topics};
use crate::config::{ConfigHandle, TuningConfig};
use crate::flags::{ModuleFlags, SIGNAL_GATE};
use crate::logging::{agg_increment, log, log_gate_decision, obj, ts_epoch_ms, v_str, Domain, Level};
use crate::metrics::GateMetrics;
use crate::risk::RiskState;
use crate::signal::Signal;
use crate::storage::ArchivedSignal;

pub use archive::{MemoryArchive, RejectArchive, SqliteArchive};
pub use dedup::DedupWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Entropy,
    Confidence,
    RiskHalt,
    ModuleDisabled,
    Stale,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Entropy => "entropy",
            RejectReason::Confidence => "confidence",
            RejectReason::RiskHalt => "risk_halt",
            RejectReason::ModuleDisabled => "module_disabled",
            RejectReason::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted(Signal),
    Rejected { signal: Signal, reasons: Vec<RejectReason> },
}

impl Verdict {
    pub fn signal(&self) -> &Signal {
        match self {
            Verdict::Accepted(signal) | Verdict::Rejected { signal, .. } => signal,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted(_))
    }
}

/// Payload on `signal.rejected`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedSignal {
    pub signal: Signal,
    pub reasons: Vec<RejectReason>,
    pub ts_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub entropy_threshold: f64,
    pub confidence_minimum: f64,
}

impl Thresholds {
    pub fn from_tuning(t: &TuningConfig) -> Self {
        Self { entropy_threshold: t.entropy_threshold, confidence_minimum: t.confidence_minimum }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from_tuning(&TuningConfig::default())
    }
}

/// Pure screening. A disabled gate rejects with `module_disabled` alone;
/// otherwise every failing check is listed.
pub fn screen(signal: Signal, thresholds: &Thresholds, risk: &RiskState, enabled: bool, now_ms: u64) -> Verdict {
    if !enabled {
        return Verdict::Rejected { signal, reasons: vec![RejectReason::ModuleDisabled] };
    }
    let mut reasons = Vec::new();
    if signal.is_stale(now_ms) {
        reasons.push(RejectReason::Stale);
    }
    if signal.entropy > thresholds.entropy_threshold {
        reasons.push(RejectReason::Entropy);
    }
    if signal.confidence < thresholds.confidence_minimum {
        reasons.push(RejectReason::Confidence);
    }
    if risk.is_halted() {
        reasons.push(RejectReason::RiskHalt);
    }
    if reasons.is_empty() {
        Verdict::Accepted(signal)
    } else {
        Verdict::Rejected { signal, reasons }
    }
}

/// Stateful part of the gate: dedup plus counters.
pub struct SignalGate {
    dedup: DedupWindow,
    metrics: Arc<GateMetrics>,
}

impl SignalGate {
    pub fn new(dedup_window_ms: u64, dedup_max_window_ms: u64, metrics: Arc<GateMetrics>) -> Self {
        Self { dedup: DedupWindow::new(dedup_window_ms, dedup_max_window_ms), metrics }
    }

    /// `None` for a duplicate; otherwise the verdict, already counted.
    pub fn process(
        &mut self,
        signal: Signal,
        tuning: &TuningConfig,
        risk: &RiskState,
        enabled: bool,
        now_ms: u64,
    ) -> Option<Verdict> {
        self.dedup.set_bounds(
            tuning.dedup_window_secs.saturating_mul(1_000),
            tuning.dedup_max_window_secs.saturating_mul(1_000),
        );
        if !self.dedup.first_sighting(&signal.id, signal.ttl_ms, now_ms) {
            self.metrics.duplicates.inc();
            return None;
        }
        let verdict = screen(signal, &Thresholds::from_tuning(tuning), risk, enabled, now_ms);
        if verdict.is_accepted() {
            self.metrics.accepted.inc();
        } else {
            self.metrics.rejected.inc();
        }
        Some(verdict)
    }

    pub fn metrics(&self) -> &GateMetrics {
        &self.metrics
    }
}

pub struct GateDeps {
    pub bus: Arc<dyn Bus>,
    pub topics: Topics,
    pub retry: RetryConfig,
    pub config: ConfigHandle,
    pub risk: watch::Receiver<RiskState>,
    pub archive: Arc<dyn RejectArchive>,
    pub flags: ModuleFlags,
    pub metrics: Arc<GateMetrics>,
}

fn archive_in_background(archive: Arc<dyn RejectArchive>, rejected: &RejectedSignal, ttl_secs: u64) {
    let entry = ArchivedSignal {
        signal_id: rejected.signal.id.clone(),
        payload: serde_json::to_string(&rejected.signal).unwrap_or_default(),
        reasons: rejected.reasons.iter().map(|r| r.as_str().to_string()).collect(),
        archived_ms: rejected.ts_ms,
        expires_ms: rejected.ts_ms.saturating_add(ttl_secs.saturating_mul(1_000)),
    };
    tokio::spawn(async move {
        let id = entry.signal_id.clone();
        if let Err(err) = archive.archive(entry).await {
            log(
                Level::Warn,
                Domain::Signal,
                "archive_failed",
                obj(&[("signal_id", v_str(&id)), ("error", v_str(&format!("{:#}", err)))]),
            );
        }
    });
}

/// Consume `raw` (the `signal.raw` subscription) until shutdown.
pub async fn run_gate(deps: GateDeps, mut raw: BusStream, mut shutdown: watch::Receiver<bool>) {
    let snapshot = deps.config.current();
    let mut gate = SignalGate::new(
        snapshot.tuning.dedup_window_secs.saturating_mul(1_000),
        snapshot.tuning.dedup_max_window_secs.saturating_mul(1_000),
        deps.metrics.clone(),
    );
    let accepted_topic = deps.topics.name(Topic::SignalAccepted);
    let rejected_topic = deps.topics.name(Topic::SignalRejected);

    loop {
        let env = tokio::select! {
            env = raw.next() => match env {
                Some(env) => env,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let signal = match Signal::parse(&env.payload) {
            Ok(signal) => signal,
            Err(err) => {
                gate.metrics().errored.inc();
                log(Level::Warn, Domain::Signal, "malformed", obj(&[("error", v_str(&err.to_string()))]));
                continue;
            }
        };

        let config = deps.config.current();
        let risk = deps.risk.borrow().clone();
        let enabled = deps.flags.is_enabled(SIGNAL_GATE);
        let now = ts_epoch_ms();
        let Some(verdict) = gate.process(signal, &config.tuning, &risk, enabled, now) else {
            continue;
        };

        match verdict {
            Verdict::Accepted(signal) => {
                agg_increment("accepted");
                log_gate_decision(&signal.id, &signal.symbol, "accepted", &[], signal.entropy, signal.confidence);
                let _ = publish_json(deps.bus.as_ref(), &deps.retry, &accepted_topic, &signal).await;
            }
            Verdict::Rejected { signal, reasons } => {
                agg_increment("rejected");
                let names: Vec<&str> = reasons.iter().map(|r| r.as_str()).collect();
                log_gate_decision(&signal.id, &signal.symbol, "rejected", &names, signal.entropy, signal.confidence);
                let rejected = RejectedSignal { signal, reasons, ts_ms: now };
                archive_in_background(deps.archive.clone(), &rejected, config.tuning.rejected_ttl_secs);
                let _ = publish_json(deps.bus.as_ref(), &deps.retry, &rejected_topic, &rejected).await;
            }
        }
    }
    log(
        Level::Info,
        Domain::Signal,
        "gate_stopped",
        obj(&[
            ("accepted", serde_json::json!(gate.metrics().accepted.get())),
            ("rejected", serde_json::json!(gate.metrics().rejected.get())),
        ]),
    );
}
