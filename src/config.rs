//! Process settings and hot-reloadable tuning.
//!
//! `Config` is read once from the environment. `TuningConfig` holds every
//! threshold the components consult per message; it lives behind a
//! `ConfigHandle` that hands out versioned, immutable snapshots, so a
//! component reads one snapshot per event and never re-reads mid-computation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{interval, Duration};

use crate::error::ControlError;
use crate::logging::{log, obj, v_str, Domain, Level};

#[derive(Debug, Clone)]
pub struct Config {
    pub namespace: String,
    pub ledger_path: String,
    pub sqlite_path: String,
    pub tuning_path: Option<String>,
    pub hmac_secret: Option<String>,
    pub commander_actors: Vec<String>,
    pub bus_capacity: usize,
    pub command_queue_capacity: usize,
    pub config_poll_secs: u64,
    pub ledger_verify_secs: u64,
    pub archive_purge_secs: u64,
    pub morphic_mode: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            namespace: std::env::var("BUS_NAMESPACE").unwrap_or_else(|_| "titan:prod".to_string()),
            ledger_path: std::env::var("LEDGER_PATH").unwrap_or_else(|_| "./override_ledger.jsonl".to_string()),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./riskgate.sqlite".to_string()),
            tuning_path: std::env::var("TUNING_PATH").ok(),
            hmac_secret: std::env::var("COMMANDER_SECRET").ok(),
            commander_actors: std::env::var("COMMANDER_ACTORS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            bus_capacity: std::env::var("BUS_CAPACITY").ok().and_then(|v| v.parse().ok()).unwrap_or(1024),
            command_queue_capacity: std::env::var("COMMAND_QUEUE_CAP").ok().and_then(|v| v.parse().ok()).unwrap_or(256),
            config_poll_secs: std::env::var("CONFIG_POLL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(5),
            ledger_verify_secs: std::env::var("LEDGER_VERIFY_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(3600),
            archive_purge_secs: std::env::var("ARCHIVE_PURGE_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(300),
            morphic_mode: std::env::var("MORPHIC_MODE").ok(),
        }
    }
}

/// Named policy preset. Only the fields that are set override the base tuning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MorphicProfile {
    pub escalation_threshold: Option<f64>,
    pub max_chaos_level: Option<f64>,
    pub confidence_minimum: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    // Signal gate
    pub entropy_threshold: f64,
    pub confidence_minimum: f64,
    pub rejected_ttl_secs: u64,
    pub dedup_window_secs: u64,
    /// Upper bound on how long one id is remembered, whatever its TTL.
    pub dedup_max_window_secs: u64,

    // Risk state machine
    pub base_chaos_level: f64,
    pub max_chaos_level: f64,
    pub escalation_threshold: f64,
    pub max_drawdown: f64,
    pub drawdown_escalation: f64,
    pub drawdown_chaos_step: f64,
    pub latency_escalation_ms: u64,
    pub latency_chaos_step: f64,
    pub escalation_tick_min: f64,
    pub escalation_tick_max: f64,
    /// 0 disables the periodic escalation tick.
    pub escalation_interval_secs: u64,
    pub telemetry_poll_secs: u64,

    // Profit router
    pub reinvest_pct: f64,
    pub buffer_pct: f64,
    pub amount_scale: u32,
    pub profit_dedup_capacity: usize,

    // Ledger
    pub ledger_retention_days: u64,

    // Commander
    pub known_modules: Vec<String>,

    pub morphic_mode: String,
    pub morphic_profiles: HashMap<String, MorphicProfile>,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            entropy_threshold: 0.38,
            confidence_minimum: 0.74,
            rejected_ttl_secs: 30 * 60,
            dedup_window_secs: 10 * 60,
            dedup_max_window_secs: 6 * 60 * 60,

            base_chaos_level: 0.1,
            max_chaos_level: 0.5,
            escalation_threshold: 0.3,
            max_drawdown: 0.05,
            drawdown_escalation: 0.03,
            drawdown_chaos_step: 0.1,
            latency_escalation_ms: 2_000,
            latency_chaos_step: 0.05,
            escalation_tick_min: 0.01,
            escalation_tick_max: 0.05,
            escalation_interval_secs: 0,
            telemetry_poll_secs: 15,

            reinvest_pct: 0.5,
            buffer_pct: 0.3,
            amount_scale: 8,
            profit_dedup_capacity: 100_000,

            ledger_retention_days: 90,

            known_modules: vec!["signal_gate".to_string(), "profit_router".to_string()],

            morphic_mode: "default".to_string(),
            morphic_profiles: HashMap::new(),
        }
    }
}

fn unit_interval(name: &str, v: f64) -> Result<(), ControlError> {
    if v.is_finite() && (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(ControlError::ConfigurationInvalid(format!("{} must be in [0, 1], got {}", name, v)))
    }
}

impl TuningConfig {
    /// Structural checks. Allocation ratios are deliberately left to the
    /// profit router, which rejects events (not reloads) on a bad split.
    pub fn validate(&self) -> Result<(), ControlError> {
        unit_interval("entropy_threshold", self.entropy_threshold)?;
        unit_interval("confidence_minimum", self.confidence_minimum)?;
        unit_interval("base_chaos_level", self.base_chaos_level)?;
        unit_interval("max_chaos_level", self.max_chaos_level)?;
        unit_interval("escalation_threshold", self.escalation_threshold)?;
        unit_interval("max_drawdown", self.max_drawdown)?;
        unit_interval("drawdown_escalation", self.drawdown_escalation)?;
        if self.max_chaos_level <= 0.0 {
            return Err(ControlError::ConfigurationInvalid("max_chaos_level must be > 0".into()));
        }
        if self.base_chaos_level > self.max_chaos_level {
            return Err(ControlError::ConfigurationInvalid(
                "base_chaos_level exceeds max_chaos_level".into(),
            ));
        }
        if self.escalation_tick_min < 0.0 || self.escalation_tick_max < self.escalation_tick_min {
            return Err(ControlError::ConfigurationInvalid("escalation tick range is empty".into()));
        }
        if self.drawdown_chaos_step < 0.0 || self.latency_chaos_step < 0.0 {
            return Err(ControlError::ConfigurationInvalid("chaos steps must be >= 0".into()));
        }
        if self.dedup_max_window_secs < self.dedup_window_secs {
            return Err(ControlError::ConfigurationInvalid(
                "dedup_max_window_secs below dedup_window_secs".into(),
            ));
        }
        if self.amount_scale > 28 {
            return Err(ControlError::ConfigurationInvalid("amount_scale above 28".into()));
        }
        Ok(())
    }

    /// Apply the active morphic profile on top of the base values.
    pub fn effective(&self) -> TuningConfig {
        let mut out = self.clone();
        if let Some(profile) = self.morphic_profiles.get(&self.morphic_mode) {
            if let Some(v) = profile.escalation_threshold {
                out.escalation_threshold = v;
            }
            if let Some(v) = profile.max_chaos_level {
                out.max_chaos_level = v;
            }
            if let Some(v) = profile.confidence_minimum {
                out.confidence_minimum = v;
            }
        }
        out
    }
}

pub fn load_tuning(path: &Path) -> Result<TuningConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read tuning file {}", path.display()))?;
    let tuning: TuningConfig =
        serde_json::from_str(&raw).with_context(|| format!("parse tuning file {}", path.display()))?;
    tuning.effective().validate()?;
    Ok(tuning)
}

/// Immutable view of the tuning at a given version.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub tuning: TuningConfig,
}

#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<ConfigSnapshot>>>,
}

impl ConfigHandle {
    pub fn new(tuning: TuningConfig) -> Self {
        let snapshot = Arc::new(ConfigSnapshot { version: 1, tuning: tuning.effective() });
        let (tx, _rx) = watch::channel(snapshot);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.tx.subscribe()
    }

    /// Publish a new snapshot. Returns the new version.
    pub fn update(&self, tuning: TuningConfig) -> Result<u64, ControlError> {
        let effective = tuning.effective();
        effective.validate()?;
        let version = self.current().version + 1;
        self.tx.send_replace(Arc::new(ConfigSnapshot { version, tuning: effective }));
        log(
            Level::Info,
            Domain::Config,
            "reloaded",
            obj(&[("version", json!(version)), ("morphic_mode", v_str(&tuning.morphic_mode))]),
        );
        Ok(version)
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Poll the tuning file and publish a new snapshot whenever it changes.
/// Invalid files are logged and the previous snapshot stays active.
pub async fn run_config_poller(
    handle: ConfigHandle,
    path: PathBuf,
    poll_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_seen = modified_at(&path);
    let mut ticker = interval(Duration::from_secs(poll_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let current = modified_at(&path);
        if current.is_none() || current == last_seen {
            continue;
        }
        last_seen = current;
        match load_tuning(&path) {
            Ok(tuning) => {
                if let Err(err) = handle.update(tuning) {
                    log(Level::Error, Domain::Config, "reload_rejected", obj(&[("error", v_str(&err.to_string()))]));
                }
            }
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Config,
                    "reload_failed",
                    obj(&[("path", v_str(&path.to_string_lossy())), ("error", v_str(&format!("{:#}", err)))]),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let t = TuningConfig::default();
        assert!(t.validate().is_ok());
        assert_eq!(t.entropy_threshold, 0.38);
        assert_eq!(t.confidence_minimum, 0.74);
        assert_eq!(t.reinvest_pct, 0.5);
        assert_eq!(t.buffer_pct, 0.3);
    }

    #[test]
    fn test_morphic_profile_overrides_only_set_fields() {
        let mut t = TuningConfig::default();
        t.morphic_profiles.insert(
            "alpha_push".to_string(),
            MorphicProfile { confidence_minimum: Some(0.7), ..Default::default() },
        );
        t.morphic_mode = "alpha_push".to_string();
        let eff = t.effective();
        assert_eq!(eff.confidence_minimum, 0.7);
        assert_eq!(eff.escalation_threshold, t.escalation_threshold);

        t.morphic_mode = "unknown".to_string();
        assert_eq!(t.effective().confidence_minimum, 0.74);
    }

    #[test]
    fn test_handle_versions_increase() {
        let handle = ConfigHandle::new(TuningConfig::default());
        assert_eq!(handle.current().version, 1);
        let mut t = TuningConfig::default();
        t.reinvest_pct = 0.6;
        let v = handle.update(t).unwrap();
        assert_eq!(v, 2);
        assert_eq!(handle.current().tuning.reinvest_pct, 0.6);
    }

    #[test]
    fn test_invalid_update_keeps_previous_snapshot() {
        let handle = ConfigHandle::new(TuningConfig::default());
        let mut t = TuningConfig::default();
        t.entropy_threshold = 1.5;
        assert!(handle.update(t).is_err());
        assert_eq!(handle.current().version, 1);
        assert_eq!(handle.current().tuning.entropy_threshold, 0.38);
    }

    #[test]
    fn test_dedup_max_window_not_below_min() {
        let mut t = TuningConfig::default();
        t.dedup_max_window_secs = t.dedup_window_secs - 1;
        assert_eq!(t.validate().unwrap_err().kind(), "configuration_invalid");
    }

    #[test]
    fn test_load_tuning_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tuning.json");
        std::fs::write(&path, r#"{"entropy_threshold": 0.4, "buffer_pct": 0.2}"#).unwrap();
        let t = load_tuning(&path).unwrap();
        assert_eq!(t.entropy_threshold, 0.4);
        assert_eq!(t.buffer_pct, 0.2);
        assert_eq!(t.confidence_minimum, 0.74);
    }
}
