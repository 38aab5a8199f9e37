use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::auth::{Authorizer, OverrideAction, OverrideRequest};
use crate::bus::retry::RetryConfig;
use crate::bus::{publish_json, Bus, BusStream, Topic, Topics};
use crate::config::ConfigHandle;
use crate::error::ControlError;
use crate::flags::ModuleFlags;
use crate::ledger::record::change_id;
use crate::ledger::{LedgerHandle, OverrideRecord, RecordOutcome, RecordPayload};
use crate::logging::{agg_increment, log, log_denial, log_override, obj, ts_epoch_ms, v_str, Domain, Level};
use crate::risk::{RiskHandle, RiskInput};
use crate::signal::{Provenance, Side, Signal};

const PENDING_CAPACITY: usize = 10_000;

/// Accepted signals that can still be side-overridden, keyed by id.
#[derive(Debug, Default)]
pub struct PendingSignals {
    by_id: HashMap<String, Signal>,
}

impl PendingSignals {
    pub fn track(&mut self, signal: Signal, now_ms: u64) {
        if self.by_id.len() >= PENDING_CAPACITY {
            self.evict(now_ms);
        }
        if self.by_id.len() < PENDING_CAPACITY {
            self.by_id.insert(signal.id.clone(), signal);
        }
    }

    pub fn get(&self, id: &str, now_ms: u64) -> Option<&Signal> {
        self.by_id.get(id).filter(|s| !s.is_stale(now_ms))
    }

    pub fn evict(&mut self, now_ms: u64) {
        self.by_id.retain(|_, s| !s.is_stale(now_ms));
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

pub struct CommanderDeps {
    pub bus: Arc<dyn Bus>,
    pub topics: Topics,
    pub retry: RetryConfig,
    pub risk: RiskHandle,
    pub ledger: LedgerHandle,
    pub flags: ModuleFlags,
    pub config: ConfigHandle,
    pub authorizer: Arc<dyn Authorizer>,
}

/// What a validated request will do once recorded.
enum Change {
    Side { signal: Signal, side: Side },
    Cap(f64),
    Kill,
    Reset,
    Module { name: String, enabled: bool },
}

fn invalid(target: &str, reason: impl Into<String>) -> ControlError {
    ControlError::InvalidTarget { target: target.to_string(), reason: reason.into() }
}

fn parse_switch(value: &str, on: &[&str], off: &[&str]) -> Option<bool> {
    let v = value.trim().to_ascii_lowercase();
    if on.contains(&v.as_str()) {
        Some(true)
    } else if off.contains(&v.as_str()) {
        Some(false)
    } else {
        None
    }
}

pub struct OverrideService {
    deps: CommanderDeps,
    pending: PendingSignals,
}

impl OverrideService {
    pub fn new(deps: CommanderDeps) -> Self {
        Self { deps, pending: PendingSignals::default() }
    }

    pub fn track_accepted(&mut self, signal: Signal, now_ms: u64) {
        self.pending.track(signal, now_ms);
    }

    pub fn pending(&self) -> &PendingSignals {
        &self.pending
    }

    /// Authorize, validate, record, apply and announce one override.
    pub async fn submit(&mut self, request: OverrideRequest) -> Result<OverrideRecord, ControlError> {
        let now = ts_epoch_ms();
        let authorized = match self.deps.authorizer.authorize(&request).await {
            Ok(ok) => ok,
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Override,
                    "authorizer_failed",
                    obj(&[("actor", v_str(&request.actor)), ("error", v_str(&format!("{:#}", err)))]),
                );
                false
            }
        };
        if !authorized {
            return Err(self.deny(&request, now).await);
        }

        let (old_value, change) = self.validate(&request, now)?;
        let payload = RecordPayload {
            actor: request.actor.clone(),
            action: request.action.kind(),
            target: request.target.clone(),
            old_value,
            new_value: request.new_value.trim().to_ascii_lowercase(),
            outcome: RecordOutcome::Applied,
            ts_ms: now,
        };
        let cid = change_id(&payload);

        let recorded = self.deps.ledger.append(payload).await;
        if recorded.is_err() && !matches!(change, Change::Kill) {
            // Nothing is applied without a record, except the kill switch.
            return recorded;
        }
        self.apply(change, &request.actor, &cid, now).await?;
        let record = recorded?;

        log_override(
            &record.payload.actor,
            record.payload.action.as_str(),
            &record.payload.target,
            &record.payload.old_value,
            &record.payload.new_value,
            &record.record_hash,
        );
        agg_increment("override");
        let topic = self.deps.topics.name(Topic::RiskOverride);
        let _ = publish_json(self.deps.bus.as_ref(), &self.deps.retry, &topic, &record).await;
        Ok(record)
    }

    async fn deny(&self, request: &OverrideRequest, now: u64) -> ControlError {
        log_denial(&request.actor, request.action.as_str(), &request.target, "unauthorized");
        agg_increment("denial");
        let payload = RecordPayload {
            actor: request.actor.clone(),
            action: request.action.kind(),
            target: request.target.clone(),
            old_value: String::new(),
            new_value: request.new_value.clone(),
            outcome: RecordOutcome::Denied,
            ts_ms: now,
        };
        if let Err(err) = self.deps.ledger.append(payload).await {
            log(Level::Error, Domain::Override, "denial_not_recorded", obj(&[("error", v_str(&err.to_string()))]));
        }
        ControlError::Unauthorized { actor: request.actor.clone(), action: request.action.as_str().to_string() }
    }

    /// Check the request against current state. Returns the old value and
    /// the change to make; touches nothing.
    fn validate(&self, request: &OverrideRequest, now: u64) -> Result<(String, Change), ControlError> {
        let target = request.target.trim();
        let value = request.new_value.trim();
        match request.action {
            OverrideAction::SignalSide => {
                // Derived signals skip the gate; the halt check is repeated here.
                let risk = self.deps.risk.snapshot();
                if risk.is_halted() {
                    return Err(invalid(target, format!("risk is {}; no signal may be admitted", risk.mode.as_str())));
                }
                let signal = self
                    .pending
                    .get(target, now)
                    .ok_or_else(|| invalid(target, "no pending signal with this id"))?;
                let side: Side = value.parse().map_err(|_| invalid(target, format!("bad side {:?}", value)))?;
                Ok((signal.side.as_str().to_string(), Change::Side { signal: signal.clone(), side }))
            }
            OverrideAction::ChaosCap => {
                if target != "risk" {
                    return Err(invalid(target, "chaos_cap targets \"risk\""));
                }
                let cap: f64 = value.parse().map_err(|_| invalid(target, format!("bad cap {:?}", value)))?;
                if !(cap.is_finite() && cap > 0.0 && cap <= 1.0) {
                    return Err(invalid(target, format!("cap {} outside (0, 1]", cap)));
                }
                Ok((self.deps.risk.snapshot().chaos_cap.to_string(), Change::Cap(cap)))
            }
            OverrideAction::KillSwitch => {
                if target != "risk" {
                    return Err(invalid(target, "kill_switch targets \"risk\""));
                }
                let on = parse_switch(value, &["on", "true", "halt"], &["off", "false", "reset"])
                    .ok_or_else(|| invalid(target, format!("bad switch value {:?}", value)))?;
                let old = self.deps.risk.snapshot().mode.as_str().to_string();
                Ok((old, if on { Change::Kill } else { Change::Reset }))
            }
            OverrideAction::ModuleFlag => {
                let known = &self.deps.config.current().tuning.known_modules;
                if !known.iter().any(|m| m == target) {
                    return Err(invalid(target, "unknown module"));
                }
                let enabled = parse_switch(value, &["enabled", "on", "true"], &["disabled", "off", "false"])
                    .ok_or_else(|| invalid(target, format!("bad flag value {:?}", value)))?;
                let old = if self.deps.flags.is_enabled(target) { "enabled" } else { "disabled" };
                Ok((old.to_string(), Change::Module { name: target.to_string(), enabled }))
            }
        }
    }

    async fn apply(&mut self, change: Change, actor: &str, cid: &str, now: u64) -> Result<(), ControlError> {
        match change {
            Change::Side { signal, side } => {
                let provenance =
                    Provenance { change_id: cid.to_string(), actor: actor.to_string(), original_side: signal.side };
                let derived = signal.with_side(side, provenance);
                self.pending.track(derived.clone(), now);
                let topic = self.deps.topics.name(Topic::SignalAccepted);
                publish_json(self.deps.bus.as_ref(), &self.deps.retry, &topic, &derived).await
            }
            Change::Cap(cap) => {
                self.deps.risk.submit_confirmed(RiskInput::SetChaosCap { cap, actor: actor.to_string() }).await?;
                Ok(())
            }
            Change::Kill => {
                let state = self.deps.risk.submit_confirmed(RiskInput::KillSwitch { actor: actor.to_string() }).await?;
                log(
                    Level::Warn,
                    Domain::Override,
                    "kill_switch_confirmed",
                    obj(&[("actor", v_str(actor)), ("mode", v_str(state.mode.as_str()))]),
                );
                Ok(())
            }
            Change::Reset => {
                self.deps.risk.submit_confirmed(RiskInput::Reset { actor: actor.to_string() }).await?;
                Ok(())
            }
            Change::Module { name, enabled } => {
                self.deps.flags.set(&name, enabled);
                Ok(())
            }
        }
    }
}

type Reply = oneshot::Sender<Result<OverrideRecord, ControlError>>;

/// Cloneable entry point for in-process callers.
#[derive(Clone)]
pub struct CommanderHandle {
    tx: mpsc::Sender<(OverrideRequest, Reply)>,
}

impl CommanderHandle {
    pub async fn submit(&self, request: OverrideRequest) -> Result<OverrideRecord, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send((request, reply)).await.map_err(|_| ControlError::Stopped("commander"))?;
        rx.await.map_err(|_| ControlError::Stopped("commander"))?
    }
}

/// Run the service: direct requests, `commander.command` requests from the
/// bus, and `signal.accepted` to learn which signals are still pending.
pub fn spawn_commander(
    mut service: OverrideService,
    mut accepted: BusStream,
    mut commands: BusStream,
    capacity: usize,
    mut shutdown: watch::Receiver<bool>,
) -> (CommanderHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<(OverrideRequest, Reply)>(capacity.max(1));
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                req = rx.recv() => {
                    let Some((request, reply)) = req else { break };
                    let result = service.submit(request).await;
                    let _ = reply.send(result);
                }
                env = accepted.next() => {
                    let Some(env) = env else { break };
                    match serde_json::from_slice::<Signal>(&env.payload) {
                        Ok(signal) => service.track_accepted(signal, ts_epoch_ms()),
                        Err(err) => log(Level::Warn, Domain::Override, "accepted_malformed", obj(&[("error", v_str(&err.to_string()))])),
                    }
                }
                env = commands.next() => {
                    let Some(env) = env else { break };
                    match serde_json::from_slice::<OverrideRequest>(&env.payload) {
                        Ok(request) => {
                            if let Err(err) = service.submit(request).await {
                                log(Level::Warn, Domain::Override, "bus_command_failed", obj(&[("error", v_str(&err.to_string())), ("kind", v_str(err.kind()))]));
                            }
                        }
                        Err(err) => log(Level::Warn, Domain::Override, "command_malformed", obj(&[("error", v_str(&err.to_string()))])),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log(Level::Info, Domain::Override, "commander_stopped", obj(&[("pending", json!(service.pending().len()))]));
    });
    (CommanderHandle { tx }, task)
}
