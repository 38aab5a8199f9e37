//! Wires every component onto one bus and owns their tasks.
//!
//! Shutdown order: flip the main shutdown channel and wait for the pipeline
//! tasks, then stop the ledger writer so it can drain what they queued.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

use crate::bus::retry::RetryConfig;
use crate::bus::{Bus, Topic, Topics};
use crate::commander::{spawn_commander, Authorizer, CommanderDeps, CommanderHandle, OverrideService};
use crate::config::{run_config_poller, Config, ConfigHandle, TuningConfig};
use crate::error::ControlError;
use crate::flags::ModuleFlags;
use crate::gate::{run_gate, GateDeps, RejectArchive};
use crate::ledger::{spawn_ledger_writer, Ledger, LedgerHandle, Verification};
use crate::logging::{log, obj, tick_aggregator, ts_epoch_ms, v_str, Domain, Level};
use crate::metrics::{GateMetrics, MetricsSnapshot, RouterMetrics};
use crate::profit::{run_profit_router, RouterDeps};
use crate::risk::telemetry::{run_escalation_tick, run_telemetry_feed, run_telemetry_poller};
use crate::risk::{spawn_risk_actor, FatalCondition, RiskDeps, RiskHandle, RiskInput, TelemetrySource};
use crate::storage::SharedStore;

const DAY_MS: u64 = 24 * 60 * 60 * 1_000;

pub struct ControlPlaneDeps {
    pub config: Config,
    pub tuning: TuningConfig,
    pub bus: Arc<dyn Bus>,
    pub ledger: Ledger,
    pub store: Option<SharedStore>,
    pub archive: Arc<dyn RejectArchive>,
    pub authorizer: Arc<dyn Authorizer>,
    pub telemetry: Option<Arc<dyn TelemetrySource>>,
    pub retry: RetryConfig,
}

pub struct ControlPlane {
    pub config: ConfigHandle,
    pub risk: RiskHandle,
    pub ledger: LedgerHandle,
    pub commander: CommanderHandle,
    pub flags: ModuleFlags,
    pub topics: Topics,
    gate_metrics: Arc<GateMetrics>,
    router_metrics: Arc<RouterMetrics>,
    shutdown_tx: watch::Sender<bool>,
    ledger_shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    ledger_task: JoinHandle<()>,
}

impl ControlPlane {
    pub async fn start(deps: ControlPlaneDeps) -> Result<ControlPlane, ControlError> {
        let ControlPlaneDeps { config: settings, mut tuning, bus, ledger, store, archive, authorizer, telemetry, retry } =
            deps;
        if let Some(mode) = settings.morphic_mode.as_ref() {
            tuning.morphic_mode = mode.clone();
        }
        let topics = Topics::new(&settings.namespace);
        let config = ConfigHandle::new(tuning);
        config.current().tuning.validate()?;
        let flags = ModuleFlags::new();
        let gate_metrics = Arc::new(GateMetrics::default());
        let router_metrics = Arc::new(RouterMetrics::default());

        // Subscribe before anything is spawned so no early message is missed.
        let raw = bus.subscribe(&topics.name(Topic::SignalRaw)).await?;
        let accepted = bus.subscribe(&topics.name(Topic::SignalAccepted)).await?;
        let commands = bus.subscribe(&topics.name(Topic::CommanderCommand)).await?;
        let profits = bus.subscribe(&topics.name(Topic::ProfitEvent)).await?;
        let telemetry_stream = bus.subscribe(&topics.name(Topic::RiskTelemetry)).await?;
        let trades = bus.subscribe(&topics.name(Topic::TradeResult)).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ledger_shutdown_tx, ledger_shutdown_rx) = watch::channel(false);
        let capacity = settings.command_queue_capacity;

        let (ledger, ledger_task) =
            spawn_ledger_writer(ledger, bus.clone(), &topics, retry.clone(), capacity, ledger_shutdown_rx);

        let (risk, risk_task) = spawn_risk_actor(
            RiskDeps {
                bus: bus.clone(),
                topics: topics.clone(),
                retry: retry.clone(),
                ledger: ledger.clone(),
                config: config.clone(),
                store: store.clone(),
            },
            capacity,
            shutdown_rx.clone(),
        );

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = vec![("risk", risk_task)];

        tasks.push((
            "corruption_watch",
            tokio::spawn(forward_corruption(ledger.corruption(), risk.clone(), shutdown_rx.clone())),
        ));

        tasks.push((
            "gate",
            tokio::spawn(run_gate(
                GateDeps {
                    bus: bus.clone(),
                    topics: topics.clone(),
                    retry: retry.clone(),
                    config: config.clone(),
                    risk: risk.subscribe(),
                    archive: archive.clone(),
                    flags: flags.clone(),
                    metrics: gate_metrics.clone(),
                },
                raw,
                shutdown_rx.clone(),
            )),
        ));

        let service = OverrideService::new(CommanderDeps {
            bus: bus.clone(),
            topics: topics.clone(),
            retry: retry.clone(),
            risk: risk.clone(),
            ledger: ledger.clone(),
            flags: flags.clone(),
            config: config.clone(),
            authorizer,
        });
        let (commander, commander_task) = spawn_commander(service, accepted, commands, capacity, shutdown_rx.clone());
        tasks.push(("commander", commander_task));

        tasks.push((
            "profit_router",
            tokio::spawn(run_profit_router(
                RouterDeps {
                    bus: bus.clone(),
                    topics: topics.clone(),
                    retry: retry.clone(),
                    config: config.clone(),
                    flags: flags.clone(),
                    metrics: router_metrics.clone(),
                },
                profits,
                shutdown_rx.clone(),
            )),
        ));

        tasks.push((
            "telemetry_feed",
            tokio::spawn(run_telemetry_feed(telemetry_stream, trades, risk.clone(), shutdown_rx.clone())),
        ));
        tasks.push((
            "escalation_tick",
            tokio::spawn(run_escalation_tick(risk.clone(), config.clone(), shutdown_rx.clone())),
        ));
        if let Some(source) = telemetry {
            let poll_secs = config.current().tuning.telemetry_poll_secs;
            tasks.push((
                "telemetry_poller",
                tokio::spawn(run_telemetry_poller(source, risk.clone(), retry.clone(), poll_secs, shutdown_rx.clone())),
            ));
        }

        tasks.push((
            "ledger_maintenance",
            tokio::spawn(run_ledger_maintenance(
                ledger.clone(),
                config.clone(),
                settings.ledger_verify_secs,
                shutdown_rx.clone(),
            )),
        ));
        tasks.push((
            "archive_purge",
            tokio::spawn(run_archive_purge(archive, settings.archive_purge_secs, shutdown_rx.clone())),
        ));
        tasks.push(("aggregator", tokio::spawn(run_aggregator(shutdown_rx.clone()))));
        if let Some(path) = settings.tuning_path.as_ref() {
            tasks.push((
                "config_poller",
                tokio::spawn(run_config_poller(
                    config.clone(),
                    PathBuf::from(path),
                    settings.config_poll_secs,
                    shutdown_rx.clone(),
                )),
            ));
        }

        log(
            Level::Info,
            Domain::System,
            "control_plane_started",
            obj(&[
                ("namespace", v_str(&settings.namespace)),
                ("tasks", json!(tasks.len() + 1)),
                ("mode", v_str(risk.snapshot().mode.as_str())),
            ]),
        );

        Ok(ControlPlane {
            config,
            risk,
            ledger,
            commander,
            flags,
            topics,
            gate_metrics,
            router_metrics,
            shutdown_tx,
            ledger_shutdown_tx,
            tasks,
            ledger_task,
        })
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot::collect(&self.gate_metrics, &self.router_metrics)
    }

    pub async fn shutdown(self) {
        log(Level::Info, Domain::System, "shutdown_requested", obj(&[]));
        let _ = self.shutdown_tx.send(true);
        for (name, task) in self.tasks {
            if let Err(err) = task.await {
                log(
                    Level::Error,
                    Domain::System,
                    "task_failed",
                    obj(&[("task", v_str(name)), ("error", v_str(&err.to_string()))]),
                );
            }
        }
        let _ = self.ledger_shutdown_tx.send(true);
        if let Err(err) = self.ledger_task.await {
            log(Level::Error, Domain::System, "task_failed", obj(&[("task", v_str("ledger_writer")), ("error", v_str(&err.to_string()))]));
        }
        MetricsSnapshot::collect(&self.gate_metrics, &self.router_metrics).log();
        crate::logging::flush();
    }
}

/// Ledger corruption becomes a fatal risk input.
async fn forward_corruption(
    mut corruption: watch::Receiver<Option<u64>>,
    risk: RiskHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let current = *corruption.borrow_and_update();
        if let Some(at) = current {
            let _ = risk.submit(RiskInput::Fatal(FatalCondition::LedgerCorruption { at })).await;
            return;
        }
        tokio::select! {
            changed = corruption.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Periodic full verification plus retention truncation.
async fn run_ledger_maintenance(
    ledger: LedgerHandle,
    config: ConfigHandle,
    verify_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(verify_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        match ledger.verify().await {
            Ok(Verification::Valid) => {}
            Ok(Verification::Corrupted { at }) => {
                log(Level::Fatal, Domain::Audit, "verify_failed", obj(&[("at", json!(at))]));
                continue;
            }
            Err(_) => break,
        }
        let retention_days = config.current().tuning.ledger_retention_days;
        if retention_days == 0 {
            continue;
        }
        let cutoff = ts_epoch_ms().saturating_sub(retention_days.saturating_mul(DAY_MS));
        if let Err(err) = ledger.truncate_before(cutoff).await {
            log(Level::Error, Domain::Audit, "truncate_failed", obj(&[("error", v_str(&err.to_string()))]));
        }
    }
}

async fn run_archive_purge(archive: Arc<dyn RejectArchive>, purge_secs: u64, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(Duration::from_secs(purge_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        match archive.purge(ts_epoch_ms()).await {
            Ok(0) => {}
            Ok(n) => log(Level::Debug, Domain::Signal, "archive_purged", obj(&[("removed", json!(n))])),
            Err(err) => log(Level::Warn, Domain::Signal, "archive_purge_failed", obj(&[("error", v_str(&format!("{:#}", err)))])),
        }
    }
}

async fn run_aggregator(mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = ticker.tick() => tick_aggregator(),
            _ = shutdown.changed() => break,
        }
    }
}
