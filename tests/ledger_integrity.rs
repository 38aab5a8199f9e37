//! Audit ledger integrity on disk and through the running control plane.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use riskgate::bus::retry::RetryConfig;
use riskgate::bus::MemoryBus;
use riskgate::commander::{OverrideAction, OverrideRequest, StaticAuthorizer};
use riskgate::config::{Config, TuningConfig};
use riskgate::error::ControlError;
use riskgate::gate::MemoryArchive;
use riskgate::ledger::{ActionKind, Ledger, RecordOutcome, RecordPayload, Verification};
use riskgate::runtime::{ControlPlane, ControlPlaneDeps};

fn payload(value: &str, ts_ms: u64) -> RecordPayload {
    RecordPayload {
        actor: "ops".to_string(),
        action: ActionKind::KillSwitch,
        target: "risk".to_string(),
        old_value: String::new(),
        new_value: value.to_string(),
        outcome: RecordOutcome::Applied,
        ts_ms,
    }
}

fn test_config(ledger_path: &str) -> Config {
    Config {
        namespace: "audit".to_string(),
        ledger_path: ledger_path.to_string(),
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

async fn start(ledger: Ledger) -> ControlPlane {
    ControlPlane::start(ControlPlaneDeps {
        config: test_config(""),
        tuning: TuningConfig::default(),
        bus: Arc::new(MemoryBus::new(1024)),
        ledger,
        store: None,
        archive: Arc::new(MemoryArchive::new()),
        authorizer: Arc::new(StaticAuthorizer::new().allow_all("ops")),
        telemetry: None,
        retry: RetryConfig::immediate(0),
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_overrides_verify_clean() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    let plane = start(Ledger::open(&path).unwrap()).await;

    plane
        .commander
        .submit(OverrideRequest::new(OverrideAction::ChaosCap, "risk", "0.4", "ops"))
        .await
        .unwrap();
    plane
        .commander
        .submit(OverrideRequest::new(OverrideAction::ModuleFlag, "profit_router", "disabled", "ops"))
        .await
        .unwrap();

    assert_eq!(plane.ledger.verify().await.unwrap(), Verification::Valid);
    let records = plane.ledger.records().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].prev_hash, records[0].record_hash);
    plane.shutdown().await;

    let mut reopened = Ledger::open(&path).unwrap();
    assert_eq!(reopened.len(), 2);
    assert_eq!(reopened.verify_all(), Verification::Valid);
}

#[test]
fn test_edited_record_detected_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    {
        let mut ledger = Ledger::open(&path).unwrap();
        ledger.append(payload("on", 1)).unwrap();
        ledger.append(payload("off", 2)).unwrap();
        ledger.sync().unwrap();
    }

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"new_value\":\"on\""));
    std::fs::write(&path, text.replacen("\"new_value\":\"on\"", "\"new_value\":\"no\"", 1)).unwrap();

    let mut ledger = Ledger::open(&path).unwrap();
    assert_eq!(ledger.corrupted_at(), Some(0));
    assert_eq!(ledger.verify_all(), Verification::Corrupted { at: 0 });
    let err = ledger.append(payload("on", 3)).unwrap_err();
    assert!(matches!(err, ControlError::LedgerCorruption { at: 0 }));
}

#[test]
fn test_verifier_does_not_create_missing_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("never-written.jsonl");
    let out = Command::new(env!("CARGO_BIN_EXE_verify_ledger")).arg(&path).output().unwrap();
    assert!(!out.status.success());
    assert!(!path.exists());
}

#[test]
fn test_verifier_reports_tampering_without_writing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    {
        let mut ledger = Ledger::open(&path).unwrap();
        ledger.append(payload("on", 1)).unwrap();
        ledger.append(payload("off", 2)).unwrap();
    }
    let out = Command::new(env!("CARGO_BIN_EXE_verify_ledger")).arg(&path).output().unwrap();
    assert!(out.status.success());
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["records"], 2);
    assert_eq!(report["verification"]["status"], "valid");

    let text = std::fs::read_to_string(&path).unwrap();
    let tampered = text.replacen("\"new_value\":\"off\"", "\"new_value\":\"of\"", 1);
    std::fs::write(&path, &tampered).unwrap();
    let out = Command::new(env!("CARGO_BIN_EXE_verify_ledger")).arg(&path).output().unwrap();
    assert!(!out.status.success());
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["verification"]["status"], "corrupted");
    assert_eq!(report["verification"]["at"], 1);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), tampered);
}

#[test]
fn test_crash_mid_append_keeps_ledger_usable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    {
        let mut ledger = Ledger::open(&path).unwrap();
        ledger.append(payload("on", 1)).unwrap();
        ledger.append(payload("off", 2)).unwrap();
        ledger.sync().unwrap();
    }
    let full = std::fs::read(&path).unwrap();
    let mut torn = full.clone();
    torn.extend_from_slice(br#"{"kind":"record","index":2,"prev_hash":"ab"#);
    std::fs::write(&path, &torn).unwrap();

    let mut ledger = Ledger::open(&path).unwrap();
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger.verify_all(), Verification::Valid);
    assert_eq!(ledger.append(payload("on", 3)).unwrap().index, 2);
    drop(ledger);

    let mut reopened = Ledger::open(&path).unwrap();
    assert_eq!(reopened.len(), 3);
    assert_eq!(reopened.verify_all(), Verification::Valid);
}

#[test]
fn test_truncation_reanchors_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    let dropped_head = {
        let mut ledger = Ledger::open(&path).unwrap();
        ledger.append(payload("on", 10)).unwrap();
        let second = ledger.append(payload("off", 20)).unwrap();
        ledger.append(payload("on", 30)).unwrap();
        assert_eq!(ledger.truncate_before(25).unwrap(), 2);
        assert_eq!(ledger.anchor(), second.record_hash);
        assert_eq!(ledger.verify_all(), Verification::Valid);
        second.record_hash
    };

    let mut ledger = Ledger::open(&path).unwrap();
    assert_eq!(ledger.anchor(), dropped_head);
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger.records()[0].index, 2);
    assert_eq!(ledger.verify_all(), Verification::Valid);

    let next = ledger.append(payload("off", 40)).unwrap();
    assert_eq!(next.index, 3);
    assert_eq!(ledger.verify_all(), Verification::Valid);
}

#[tokio::test]
async fn test_corrupted_ledger_halts_risk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    {
        let mut ledger = Ledger::open(&path).unwrap();
        ledger.append(payload("on", 1)).unwrap();
        ledger.sync().unwrap();
    }
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, text.replacen("\"actor\":\"ops\"", "\"actor\":\"eve\"", 1)).unwrap();

    let plane = start(Ledger::open(&path).unwrap()).await;
    let mut states = plane.risk.subscribe();
    let state = tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| s.halted))
        .await
        .expect("halt in time")
        .unwrap()
        .clone();
    assert_eq!(state.halt_reason.as_deref(), Some("ledger_corruption at 0"));

    // A corrupted ledger refuses further overrides.
    let err = plane
        .commander
        .submit(OverrideRequest::new(OverrideAction::ChaosCap, "risk", "0.3", "ops"))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::LedgerCorruption { .. }));
    plane.shutdown().await;
}
