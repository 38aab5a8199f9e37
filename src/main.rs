use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;

use riskgate::bus::retry::RetryConfig;
use riskgate::bus::MemoryBus;
use riskgate::commander::{Authorizer, HmacAuthorizer, StaticAuthorizer};
use riskgate::config::{load_tuning, Config, TuningConfig};
use riskgate::gate::SqliteArchive;
use riskgate::ledger::Ledger;
use riskgate::logging::{log, obj, v_str, Domain, Level};
use riskgate::runtime::{ControlPlane, ControlPlaneDeps};
use riskgate::storage::StateStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let tuning = match cfg.tuning_path.as_deref() {
        Some(path) => load_tuning(Path::new(path))?,
        None => TuningConfig::default(),
    };

    let ledger = Ledger::open(Path::new(&cfg.ledger_path))
        .with_context(|| format!("open ledger {}", cfg.ledger_path))?;
    let mut store = StateStore::new(&cfg.sqlite_path)?;
    store.init()?;
    let store = store.into_shared();

    // Without a secret nobody is granted anything: overrides fail closed.
    let authorizer: Arc<dyn Authorizer> = match cfg.hmac_secret.as_deref() {
        Some(secret) => Arc::new(HmacAuthorizer::new(secret).with_actors(cfg.commander_actors.clone())),
        None => {
            log(Level::Warn, Domain::Override, "no_commander_secret", obj(&[("status", v_str("deny_all"))]));
            Arc::new(StaticAuthorizer::new())
        }
    };

    let bus = Arc::new(MemoryBus::new(cfg.bus_capacity));
    let plane = ControlPlane::start(ControlPlaneDeps {
        config: cfg.clone(),
        tuning,
        bus,
        ledger,
        store: Some(store.clone()),
        archive: Arc::new(SqliteArchive::new(store)),
        authorizer,
        telemetry: None,
        retry: RetryConfig::default(),
    })
    .await?;

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    let final_state = plane.risk.snapshot();
    log(
        Level::Info,
        Domain::System,
        "stopping",
        obj(&[("mode", v_str(final_state.mode.as_str())), ("chaos_level", json!(final_state.chaos_level))]),
    );
    plane.shutdown().await;
    Ok(())
}
