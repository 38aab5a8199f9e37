//! End-to-end: the whole control plane on an in-process bus.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rust_decimal_macros::dec;
use serde_json::json;

use riskgate::bus::retry::RetryConfig;
use riskgate::bus::{Bus, BusStream, MemoryBus, Topic};
use riskgate::commander::{OverrideAction, OverrideRequest, StaticAuthorizer};
use riskgate::config::{Config, TuningConfig};
use riskgate::gate::{MemoryArchive, RejectReason, RejectedSignal};
use riskgate::ledger::Ledger;
use riskgate::logging::ts_epoch_ms;
use riskgate::profit::AllocationEvent;
use riskgate::risk::RiskMode;
use riskgate::runtime::{ControlPlane, ControlPlaneDeps};
use riskgate::signal::Signal;

fn test_config() -> Config {
    Config {
        namespace: "test".to_string(),
        ledger_path: String::new(),
        sqlite_path: String::new(),
        tuning_path: None,
        hmac_secret: None,
        commander_actors: Vec::new(),
        bus_capacity: 1024,
        command_queue_capacity: 64,
        config_poll_secs: 60,
        ledger_verify_secs: 3600,
        archive_purge_secs: 3600,
        morphic_mode: None,
    }
}

async fn start(bus: Arc<MemoryBus>) -> ControlPlane {
    ControlPlane::start(ControlPlaneDeps {
        config: test_config(),
        tuning: TuningConfig::default(),
        bus,
        ledger: Ledger::in_memory(),
        store: None,
        archive: Arc::new(MemoryArchive::new()),
        authorizer: Arc::new(StaticAuthorizer::new().allow_all("ops")),
        telemetry: None,
        retry: RetryConfig::immediate(0),
    })
    .await
    .unwrap()
}

fn raw_signal(id: &str, entropy: f64, confidence: f64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": id,
        "symbol": "BTC-USD",
        "side": "buy",
        "confidence": confidence,
        "entropy": entropy,
        "timestamp": ts_epoch_ms(),
    }))
    .unwrap()
}

async fn next_within(stream: &mut BusStream, ms: u64) -> Option<Vec<u8>> {
    tokio::time::timeout(Duration::from_millis(ms), stream.next())
        .await
        .ok()
        .flatten()
        .map(|env| env.payload)
}

#[tokio::test]
async fn test_high_entropy_signal_rejected() {
    let bus = Arc::new(MemoryBus::new(1024));
    let plane = start(bus.clone()).await;
    let mut rejected = bus.subscribe("test:signal.rejected").await.unwrap();

    bus.publish("test:signal.raw", raw_signal("s-1", 0.6, 0.9)).await.unwrap();
    let payload = next_within(&mut rejected, 2_000).await.expect("rejection");
    let event: RejectedSignal = serde_json::from_slice(&payload).unwrap();
    assert_eq!(event.signal.id, "s-1");
    assert_eq!(event.reasons, vec![RejectReason::Entropy]);

    plane.shutdown().await;
}

#[tokio::test]
async fn test_clean_signal_accepted() {
    let bus = Arc::new(MemoryBus::new(1024));
    let plane = start(bus.clone()).await;
    let mut accepted = bus.subscribe("test:signal.accepted").await.unwrap();

    bus.publish("test:signal.raw", raw_signal("s-2", 0.2, 0.9)).await.unwrap();
    let payload = next_within(&mut accepted, 2_000).await.expect("acceptance");
    let signal: Signal = serde_json::from_slice(&payload).unwrap();
    assert_eq!(signal.id, "s-2");
    assert!(signal.provenance.is_none());
    assert_eq!(plane.metrics().signals_accepted, 1);

    plane.shutdown().await;
}

#[tokio::test]
async fn test_kill_switch_blocks_signals() {
    let bus = Arc::new(MemoryBus::new(1024));
    let plane = start(bus.clone()).await;
    let mut rejected = bus.subscribe("test:signal.rejected").await.unwrap();

    let record = plane
        .commander
        .submit(OverrideRequest::new(OverrideAction::KillSwitch, "risk", "on", "ops"))
        .await
        .unwrap();
    assert_eq!(record.payload.actor, "ops");
    assert_eq!(plane.risk.snapshot().mode, RiskMode::Halted);

    bus.publish("test:signal.raw", raw_signal("s-3", 0.2, 0.9)).await.unwrap();
    let payload = next_within(&mut rejected, 2_000).await.expect("rejection");
    let event: RejectedSignal = serde_json::from_slice(&payload).unwrap();
    assert_eq!(event.reasons, vec![RejectReason::RiskHalt]);

    plane.shutdown().await;
}

#[tokio::test]
async fn test_bus_command_is_applied() {
    let bus = Arc::new(MemoryBus::new(1024));
    let plane = start(bus.clone()).await;
    let mut states = plane.risk.subscribe();

    let request = OverrideRequest::new(OverrideAction::KillSwitch, "risk", "on", "ops");
    bus.publish("test:commander.command", serde_json::to_vec(&request).unwrap()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| s.halted))
        .await
        .expect("halt in time")
        .unwrap();

    plane.shutdown().await;
}

#[tokio::test]
async fn test_profit_split_to_sinks() {
    let bus = Arc::new(MemoryBus::new(1024));
    let plane = start(bus.clone()).await;
    let mut sinks = bus.subscribe("test:profit.*").await.unwrap();

    let event = json!({ "amount": "100", "asset": "USDT", "trade_id": "t-1" });
    bus.publish(&plane.topics.name(Topic::ProfitEvent), serde_json::to_vec(&event).unwrap())
        .await
        .unwrap();

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let env = tokio::time::timeout(Duration::from_secs(2), sinks.next()).await.unwrap().unwrap();
        if env.topic == "test:profit.event" {
            continue;
        }
        let alloc: AllocationEvent = serde_json::from_slice(&env.payload).unwrap();
        seen.push((env.topic, alloc.amount));
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("test:profit.buffer".to_string(), dec!(30)),
            ("test:profit.reinvest".to_string(), dec!(50)),
            ("test:profit.withdraw".to_string(), dec!(20)),
        ]
    );

    plane.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_signal_has_one_terminal_event() {
    let bus = Arc::new(MemoryBus::new(1024));
    let plane = start(bus.clone()).await;
    let mut decided = bus.subscribe("test:signal.*").await.unwrap();

    let payload = raw_signal("s-dup", 0.2, 0.9);
    bus.publish("test:signal.raw", payload.clone()).await.unwrap();
    bus.publish("test:signal.raw", payload).await.unwrap();

    let mut terminal = 0;
    while let Ok(Some(env)) = tokio::time::timeout(Duration::from_millis(300), decided.next()).await {
        if env.topic != "test:signal.raw" {
            terminal += 1;
        }
    }
    assert_eq!(terminal, 1);
    assert_eq!(plane.metrics().signals_duplicate, 1);

    plane.shutdown().await;
}
