//! Inputs that reach the risk actor from outside: polled telemetry, the
//! `risk.telemetry` and `trade.result` topics, and the escalation tick.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

use super::actor::RiskHandle;
use super::machine::{FatalCondition, RiskInput};
use crate::bus::retry::{retry_async, RetryConfig};
use crate::bus::BusStream;
use crate::config::ConfigHandle;
use crate::logging::{log, obj, v_str, Domain, Level};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetrySample {
    Latency { ms: u64 },
    Drawdown { value: f64 },
    /// Explicit chaos injection of a given size.
    Chaos { delta: f64 },
    Fatal { detail: String },
}

impl TelemetrySample {
    pub fn into_input(self) -> RiskInput {
        match self {
            TelemetrySample::Latency { ms } => RiskInput::Latency { ms },
            TelemetrySample::Drawdown { value } => RiskInput::Drawdown { value },
            TelemetrySample::Chaos { delta } => RiskInput::ChaosDelta { delta, source: "telemetry".to_string() },
            TelemetrySample::Fatal { detail } => RiskInput::Fatal(FatalCondition::SystemError { detail }),
        }
    }
}

/// Result of an executed trade as published by the execution layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeResult {
    pub trade_id: String,
    pub pnl: f64,
    pub equity: f64,
}

/// Pull-based telemetry (e.g. an exchange latency probe).
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn read(&self) -> anyhow::Result<Vec<TelemetrySample>>;
}

/// Poll `source` with retry. An exhausted retry is logged and treated as no change.
pub async fn run_telemetry_poller(
    source: Arc<dyn TelemetrySource>,
    risk: RiskHandle,
    retry: RetryConfig,
    poll_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = sleep(Duration::from_secs(poll_secs.max(1))) => {}
            _ = shutdown.changed() => break,
        }
        if poll_once(source.as_ref(), &risk, &retry).await.is_err() {
            break;
        }
    }
}

/// One poll. Errors only when the risk actor is gone.
pub async fn poll_once(
    source: &dyn TelemetrySource,
    risk: &RiskHandle,
    retry: &RetryConfig,
) -> Result<usize, crate::error::ControlError> {
    match retry_async(retry, "telemetry_read", || source.read()).await {
        Ok(samples) => {
            let n = samples.len();
            for sample in samples {
                risk.submit(sample.into_input()).await?;
            }
            Ok(n)
        }
        Err(err) => {
            log(
                Level::Warn,
                Domain::Risk,
                "telemetry_unavailable",
                obj(&[("error", v_str(&format!("{:#}", err)))]),
            );
            Ok(0)
        }
    }
}

/// Forward bus telemetry and trade results to the risk actor.
pub async fn run_telemetry_feed(
    mut telemetry: BusStream,
    mut trades: BusStream,
    risk: RiskHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let input = tokio::select! {
            env = telemetry.next() => match env {
                Some(env) => match serde_json::from_slice::<TelemetrySample>(&env.payload) {
                    Ok(sample) => sample.into_input(),
                    Err(err) => {
                        log(Level::Warn, Domain::Risk, "telemetry_malformed", obj(&[("error", v_str(&err.to_string()))]));
                        continue;
                    }
                },
                None => break,
            },
            env = trades.next() => match env {
                Some(env) => match serde_json::from_slice::<TradeResult>(&env.payload) {
                    Ok(trade) => RiskInput::TradeResult { pnl: trade.pnl, equity: trade.equity },
                    Err(err) => {
                        log(Level::Warn, Domain::Risk, "trade_result_malformed", obj(&[("error", v_str(&err.to_string()))]));
                        continue;
                    }
                },
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        if risk.submit(input).await.is_err() {
            break;
        }
    }
}

/// Periodic chaos increase drawn uniformly from the configured tick range.
/// An interval of 0 keeps the tick idle until a reload enables it.
pub async fn run_escalation_tick(risk: RiskHandle, config: ConfigHandle, mut shutdown: watch::Receiver<bool>) {
    loop {
        let tuning = config.current().tuning.clone();
        let idle = tuning.escalation_interval_secs == 0;
        let wait = if idle { 5 } else { tuning.escalation_interval_secs };
        tokio::select! {
            _ = sleep(Duration::from_secs(wait)) => {}
            _ = shutdown.changed() => break,
        }
        if idle {
            continue;
        }
        let delta = if tuning.escalation_tick_max > tuning.escalation_tick_min {
            rand::thread_rng().gen_range(tuning.escalation_tick_min..=tuning.escalation_tick_max)
        } else {
            tuning.escalation_tick_min
        };
        log(Level::Debug, Domain::Risk, "escalation_tick", obj(&[("delta", json!(delta))]));
        if risk.submit(RiskInput::ChaosDelta { delta, source: "escalation_tick".to_string() }).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, Topics};
    use crate::config::TuningConfig;
    use crate::ledger::{spawn_ledger_writer, Ledger};
    use crate::risk::fault::{Fault, FaultPlan, FaultyTelemetry};
    use crate::risk::{spawn_risk_actor, RiskDeps, RiskMode};

    fn risk_rig() -> (RiskHandle, watch::Sender<bool>) {
        let bus = Arc::new(MemoryBus::new(256));
        let topics = Topics::new("t");
        let (stop, stop_rx) = watch::channel(false);
        let (ledger, _) =
            spawn_ledger_writer(Ledger::in_memory(), bus.clone(), &topics, RetryConfig::immediate(0), 64, stop_rx.clone());
        let deps = RiskDeps {
            bus,
            topics,
            retry: RetryConfig::immediate(0),
            ledger,
            config: ConfigHandle::new(TuningConfig::default()),
            store: None,
        };
        let (risk, _) = spawn_risk_actor(deps, 64, stop_rx);
        (risk, stop)
    }

    #[tokio::test]
    async fn test_failed_poll_leaves_state_unchanged() {
        let (risk, _stop) = risk_rig();
        let source = FaultyTelemetry::always_failing();
        let n = poll_once(&source, &risk, &RetryConfig::immediate(2)).await.unwrap();
        assert_eq!(n, 0);
        let state = risk.snapshot();
        assert_eq!(state.seq, 0);
        assert_eq!(state.mode, RiskMode::Normal);
        assert!(!state.halted);
    }

    #[tokio::test]
    async fn test_poll_recovers_after_transient_failure() {
        let (risk, _stop) = risk_rig();
        let mut rx = risk.subscribe();
        let plan = FaultPlan { steps: vec![Some(Fault::TelemetryFailure), None] };
        let source = FaultyTelemetry::new(plan, vec![TelemetrySample::Fatal { detail: "disk full".into() }]);
        let n = poll_once(&source, &risk, &RetryConfig::immediate(2)).await.unwrap();
        assert_eq!(n, 1);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !rx.borrow().halted {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(risk.snapshot().mode, RiskMode::Halted);
    }

    #[test]
    fn test_sample_json_shape() {
        let s: TelemetrySample = serde_json::from_str(r#"{"kind":"latency","ms":2500}"#).unwrap();
        assert_eq!(s.into_input(), RiskInput::Latency { ms: 2500 });
        let f: TelemetrySample = serde_json::from_str(r#"{"kind":"fatal","detail":"disk full"}"#).unwrap();
        assert!(matches!(f.into_input(), RiskInput::Fatal(FatalCondition::SystemError { .. })));
    }
}
