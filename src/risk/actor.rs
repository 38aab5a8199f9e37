use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::machine::{apply, FatalCondition, RiskInput, Transition};
use super::state::{RiskMode, RiskParams, RiskState};
use crate::bus::retry::RetryConfig;
use crate::bus::{publish_json, Bus, Topic, Topics};
use crate::config::ConfigHandle;
use crate::error::ControlError;
use crate::ledger::{ActionKind, LedgerHandle, RecordOutcome, RecordPayload};
use crate::logging::{log, log_transition, obj, ts_epoch_ms, v_str, Domain, Level};
use crate::storage::{with_store, SharedStore};

struct RiskCommand {
    input: RiskInput,
    reply: Option<oneshot::Sender<RiskState>>,
}

/// The only way to change risk state. Reads go through the watch snapshot.
#[derive(Clone)]
pub struct RiskHandle {
    tx: mpsc::Sender<RiskCommand>,
    state_rx: watch::Receiver<RiskState>,
}

impl RiskHandle {
    /// Queue an input without waiting for it to be applied.
    pub async fn submit(&self, input: RiskInput) -> Result<(), ControlError> {
        self.tx
            .send(RiskCommand { input, reply: None })
            .await
            .map_err(|_| ControlError::Stopped("risk_actor"))
    }

    /// Queue an input and wait until the actor has applied and published it.
    pub async fn submit_confirmed(&self, input: RiskInput) -> Result<RiskState, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RiskCommand { input, reply: Some(reply) })
            .await
            .map_err(|_| ControlError::Stopped("risk_actor"))?;
        rx.await.map_err(|_| ControlError::Stopped("risk_actor"))
    }

    pub fn snapshot(&self) -> RiskState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RiskState> {
        self.state_rx.clone()
    }
}

pub struct RiskDeps {
    pub bus: Arc<dyn Bus>,
    pub topics: Topics,
    pub retry: RetryConfig,
    pub ledger: LedgerHandle,
    pub config: ConfigHandle,
    pub store: Option<SharedStore>,
}

struct RiskActor {
    state: RiskState,
    params: RiskParams,
    deps: RiskDeps,
    state_topic: String,
    state_tx: watch::Sender<RiskState>,
}

impl RiskActor {
    /// Apply one input plus any systemic failure it triggers along the way.
    async fn process(&mut self, input: RiskInput) {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            let now = ts_epoch_ms();
            let before = self.state.clone();
            let step = apply(&before, &self.params, &input, now);
            if !step.changed(&before) {
                continue;
            }
            self.state = step.state;
            if let Err(err) = self.state.check_invariants() {
                log(Level::Fatal, Domain::Risk, "invariant_violation", obj(&[("error", v_str(&err))]));
            }
            self.state_tx.send_replace(self.state.clone());
            self.persist(now).await;

            if let Some(transition) = &step.transition {
                log_transition(
                    transition.from.as_str(),
                    transition.to.as_str(),
                    &transition.reason,
                    &transition.actor,
                    self.state.chaos_level,
                );
                if let Err(err) = self.record(transition, now).await {
                    log(Level::Error, Domain::Risk, "ledger_append_failed", obj(&[("error", v_str(&err.to_string()))]));
                    if let ControlError::LedgerCorruption { at } = err {
                        queue.push_back(RiskInput::Fatal(FatalCondition::LedgerCorruption { at }));
                    }
                }
            }

            if let Err(err) =
                publish_json(self.deps.bus.as_ref(), &self.deps.retry, &self.state_topic, &self.state).await
            {
                if err.is_systemic() {
                    queue.push_back(RiskInput::Fatal(FatalCondition::BusFailure { topic: self.state_topic.clone() }));
                }
            }
        }
    }

    async fn persist(&self, now: u64) {
        let Some(store) = self.deps.store.as_ref() else {
            return;
        };
        let state = self.state.clone();
        if let Err(err) = with_store(store, move |s| s.persist_risk(now, &state)).await {
            log(Level::Error, Domain::Risk, "persist_failed", obj(&[("error", v_str(&format!("{:#}", err)))]));
        }
    }

    async fn record(&self, transition: &Transition, now: u64) -> Result<(), ControlError> {
        let payload = RecordPayload {
            actor: transition.actor.clone(),
            action: ActionKind::RiskTransition,
            target: "risk".to_string(),
            old_value: transition.from.as_str().to_string(),
            new_value: format!("{} ({})", transition.to.as_str(), transition.reason),
            outcome: RecordOutcome::Applied,
            ts_ms: now,
        };
        self.deps.ledger.append(payload).await.map(|_| ())
    }

    /// A reload that moves `max_chaos_level` moves the live cap with it.
    async fn reload(&mut self, params: RiskParams) {
        let cap_moved = params.max_chaos_level != self.params.max_chaos_level;
        self.params = params;
        if cap_moved {
            let cap = self.params.max_chaos_level;
            self.process(RiskInput::SetChaosCap { cap, actor: "config".to_string() }).await;
        }
    }
}

fn restore(store: Option<&SharedStore>, params: &RiskParams) -> RiskState {
    let fresh = RiskState::initial(params, ts_epoch_ms());
    let Some(store) = store else {
        return fresh;
    };
    let loaded = match store.lock() {
        Ok(guard) => guard.load_latest_risk(),
        Err(_) => Err(anyhow::anyhow!("state store mutex poisoned")),
    };
    match loaded {
        Ok(Some(state)) if state.check_invariants().is_ok() => {
            log(
                Level::Info,
                Domain::Risk,
                "restored",
                obj(&[("mode", v_str(state.mode.as_str())), ("seq", json!(state.seq)), ("chaos", json!(state.chaos_level))]),
            );
            state
        }
        Ok(Some(state)) => {
            // A snapshot that fails its own invariants is not trusted; start halted.
            log(Level::Error, Domain::Risk, "restore_rejected", obj(&[("seq", json!(state.seq))]));
            let mut halted = fresh;
            halted.mode = RiskMode::Halted;
            halted.halted = true;
            halted.halt_reason = Some("invalid_snapshot".to_string());
            halted
        }
        Ok(None) => fresh,
        Err(err) => {
            log(Level::Error, Domain::Risk, "restore_failed", obj(&[("error", v_str(&format!("{:#}", err)))]));
            fresh
        }
    }
}

/// Start the risk actor. The last persisted snapshot (if any) is the initial
/// state, so a halt survives a restart.
pub fn spawn_risk_actor(
    deps: RiskDeps,
    capacity: usize,
    mut shutdown: watch::Receiver<bool>,
) -> (RiskHandle, JoinHandle<()>) {
    let mut config_rx = deps.config.subscribe();
    let params = RiskParams::from_tuning(&deps.config.current().tuning);
    let state = restore(deps.store.as_ref(), &params);
    let (state_tx, state_rx) = watch::channel(state.clone());
    let (tx, mut rx) = mpsc::channel::<RiskCommand>(capacity.max(1));
    let state_topic = deps.topics.name(Topic::RiskState);

    let mut actor = RiskActor { state, params, deps, state_topic, state_tx };

    let task = tokio::spawn(async move {
        // Saved cap may differ from the configured one after a commander override.
        if actor.state.chaos_cap != actor.params.max_chaos_level {
            log(
                Level::Info,
                Domain::Risk,
                "cap_from_snapshot",
                obj(&[("cap", json!(actor.state.chaos_cap)), ("configured", json!(actor.params.max_chaos_level))]),
            );
        }
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(RiskCommand { input, reply }) = cmd else { break };
                    actor.process(input).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(actor.state.clone());
                    }
                }
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let snapshot = config_rx.borrow_and_update().clone();
                    actor.reload(RiskParams::from_tuning(&snapshot.tuning)).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        log(Level::Info, Domain::Risk, "actor_stopped", obj(&[("mode", v_str(actor.state.mode.as_str()))]));
    });

    (RiskHandle { tx, state_rx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::TuningConfig;
    use crate::ledger::{spawn_ledger_writer, Ledger};
    use crate::risk::RiskMode;
    use crate::storage::StateStore;
    use futures_util::StreamExt;

    struct Rig {
        risk: RiskHandle,
        ledger: LedgerHandle,
        bus: Arc<MemoryBus>,
        _stop: watch::Sender<bool>,
    }

    fn rig(store: Option<SharedStore>) -> Rig {
        let bus = Arc::new(MemoryBus::new(256));
        let topics = Topics::new("t");
        let (stop, stop_rx) = watch::channel(false);
        let (ledger, _) =
            spawn_ledger_writer(Ledger::in_memory(), bus.clone(), &topics, RetryConfig::immediate(0), 64, stop_rx.clone());
        let deps = RiskDeps {
            bus: bus.clone(),
            topics,
            retry: RetryConfig::immediate(0),
            ledger: ledger.clone(),
            config: ConfigHandle::new(TuningConfig::default()),
            store,
        };
        let (risk, _) = spawn_risk_actor(deps, 64, stop_rx);
        Rig { risk, ledger, bus, _stop: stop }
    }

    #[tokio::test]
    async fn test_kill_switch_confirmed_and_recorded() {
        let r = rig(None);
        let state = r.risk.submit_confirmed(RiskInput::KillSwitch { actor: "ops".into() }).await.unwrap();
        assert_eq!(state.mode, RiskMode::Halted);
        assert!(r.risk.snapshot().halted);

        let records = r.ledger.records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload.action, ActionKind::RiskTransition);
        assert_eq!(records[0].payload.actor, "ops");
        assert_eq!(records[0].payload.old_value, "normal");
    }

    #[tokio::test]
    async fn test_state_published_on_every_change() {
        let r = rig(None);
        let mut sub = r.bus.subscribe("t:risk.state").await.unwrap();
        r.risk
            .submit_confirmed(RiskInput::ChaosDelta { delta: 0.05, source: "test".into() })
            .await
            .unwrap();
        let published: RiskState = serde_json::from_slice(&sub.next().await.unwrap().payload).unwrap();
        assert!((published.chaos_level - 0.15).abs() < 1e-12);
        assert_eq!(published.seq, 1);
    }

    #[tokio::test]
    async fn test_bus_outage_halts() {
        let r = rig(None);
        r.bus.set_available(false);
        let state = r
            .risk
            .submit_confirmed(RiskInput::ChaosDelta { delta: 0.05, source: "test".into() })
            .await
            .unwrap();
        assert!(state.halted);
        assert!(state.halt_reason.unwrap().starts_with("bus_failure"));
    }

    #[tokio::test]
    async fn test_halt_survives_restart() {
        let store = {
            let mut s = StateStore::in_memory().unwrap();
            s.init().unwrap();
            s.into_shared()
        };
        {
            let r = rig(Some(store.clone()));
            r.risk.submit_confirmed(RiskInput::KillSwitch { actor: "ops".into() }).await.unwrap();
        }
        let r = rig(Some(store));
        let state = r.risk.snapshot();
        assert!(state.halted);
        assert_eq!(state.halt_reason.as_deref(), Some("kill_switch"));
    }

    #[tokio::test]
    async fn test_config_reload_moves_cap() {
        let bus = Arc::new(MemoryBus::new(64));
        let topics = Topics::new("t");
        let (_stop, stop_rx) = watch::channel(false);
        let (ledger, _) =
            spawn_ledger_writer(Ledger::in_memory(), bus.clone(), &topics, RetryConfig::immediate(0), 16, stop_rx.clone());
        let config = ConfigHandle::new(TuningConfig::default());
        let deps = RiskDeps {
            bus,
            topics,
            retry: RetryConfig::immediate(0),
            ledger,
            config: config.clone(),
            store: None,
        };
        let (risk, _) = spawn_risk_actor(deps, 16, stop_rx);
        let mut rx = risk.subscribe();
        let mut t = TuningConfig::default();
        t.max_chaos_level = 0.8;
        config.update(t).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(risk.snapshot().chaos_cap, 0.8);
    }
}
