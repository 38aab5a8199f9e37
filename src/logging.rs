//! Structured logging for the control plane.
//!
//! Every record is one JSON line carrying run id, sequence number, level,
//! component and event name, so a gate decision or an override denial can be
//! reconstructed from the logs without replaying the ledger.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Signal,   // Gate decisions, dedup, archive
    Risk,     // State machine transitions, telemetry
    Override, // Commander requests and denials
    Audit,    // Ledger appends, verification, truncation
    Profit,   // Allocation splits
    Bus,      // Publish retries, dead letters
    Config,   // Reloads, validation failures
    System,   // Startup, shutdown, recovery
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Signal => "signal",
            Domain::Risk => "risk",
            Domain::Override => "override",
            Domain::Audit => "audit",
            Domain::Profit => "profit",
            Domain::Bus => "bus",
            Domain::Config => "config",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS is a comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
    metrics: Option<Mutex<BufWriter<File>>>,
    stdout: bool,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(file) => Some(Mutex::new(BufWriter::new(file))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let stdout = !matches!(std::env::var("LOG_STDOUT").as_deref(), Ok("0") | Ok("false"));
        let base = match std::env::var("LOG_DIR") {
            Ok(dir) if dir == "-" => None,
            Ok(dir) => Some(dir),
            Err(_) => Some("out/runs".to_string()),
        };
        let Some(base) = base else {
            return RunContext { run_id, events: None, trace: None, metrics: None, stdout };
        };

        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }
        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            metrics: open_sink(run_dir.join("metrics.jsonl")),
            run_id,
            stdout,
        }
    })
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["token", "signature", "secret", "hmac_secret", "authorization"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["signal_id", "trade_id", "actor", "target", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    if event.starts_with("metrics.") {
        write_line(&ctx.metrics, &line);
    }
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    if ctx.stdout {
        println!("{}", line);
    }
}

/// Flush buffered sinks (called on shutdown).
pub fn flush() {
    if let Some(ctx) = RUN_CONTEXT.get() {
        for sink in [&ctx.events, &ctx.trace, &ctx.metrics].into_iter().flatten() {
            if let Ok(mut w) = sink.lock() {
                let _ = w.flush();
            }
        }
    }
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_gate_decision(signal_id: &str, symbol: &str, verdict: &str, reasons: &[&str], entropy: f64, confidence: f64) {
    let level = if verdict == "accepted" { Level::Info } else { Level::Warn };
    log(
        level,
        Domain::Signal,
        "gate_decision",
        obj(&[
            ("signal_id", v_str(signal_id)),
            ("symbol", v_str(symbol)),
            ("verdict", v_str(verdict)),
            ("reasons", Value::Array(reasons.iter().map(|r| v_str(r)).collect())),
            ("entropy", v_num(entropy)),
            ("confidence", v_num(confidence)),
        ]),
    );
}

pub fn log_transition(from: &str, to: &str, reason: &str, actor: &str, chaos_level: f64) {
    let level = if to == "halted" { Level::Error } else { Level::Warn };
    log(
        level,
        Domain::Risk,
        "transition",
        obj(&[
            ("from", v_str(from)),
            ("to", v_str(to)),
            ("reason", v_str(reason)),
            ("actor", v_str(actor)),
            ("chaos_level", v_num(chaos_level)),
        ]),
    );
}

pub fn log_override(actor: &str, action: &str, target: &str, old_value: &str, new_value: &str, record_hash: &str) {
    log(
        Level::Info,
        Domain::Override,
        "override_applied",
        obj(&[
            ("actor", v_str(actor)),
            ("action", v_str(action)),
            ("target", v_str(target)),
            ("old_value", v_str(old_value)),
            ("new_value", v_str(new_value)),
            ("record_hash", v_str(record_hash)),
        ]),
    );
}

pub fn log_denial(actor: &str, action: &str, target: &str, reason: &str) {
    log(
        Level::Warn,
        Domain::Override,
        "override_denied",
        obj(&[
            ("actor", v_str(actor)),
            ("action", v_str(action)),
            ("target", v_str(target)),
            ("reason", v_str(reason)),
        ]),
    );
}

pub fn log_allocation(trade_id: &str, amount: &str, reinvest: &str, buffer: &str, withdraw: &str, config_version: u64) {
    log(
        Level::Info,
        Domain::Profit,
        "allocation",
        obj(&[
            ("trade_id", v_str(trade_id)),
            ("amount", v_str(amount)),
            ("reinvest", v_str(reinvest)),
            ("buffer", v_str(buffer)),
            ("withdraw", v_str(withdraw)),
            ("config_version", json!(config_version)),
        ]),
    );
}

pub fn log_dead_letter(topic: &str, attempts: u32, error: &str, payload_len: usize) {
    log(
        Level::Error,
        Domain::Bus,
        "dead_letter",
        obj(&[
            ("topic", v_str(topic)),
            ("attempts", json!(attempts)),
            ("error", v_str(error)),
            ("payload_len", json!(payload_len)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Log Aggregator for Periodic Summaries
// =============================================================================

static AGGREGATOR: OnceLock<Mutex<LogAggregator>> = OnceLock::new();

fn get_aggregator() -> &'static Mutex<LogAggregator> {
    AGGREGATOR.get_or_init(|| Mutex::new(LogAggregator::new()))
}

struct LogAggregator {
    accepted: u64,
    rejected: u64,
    overrides: u64,
    denials: u64,
    allocations: u64,
    dead_letters: u64,
    last_flush: Instant,
    flush_interval_secs: u64,
}

impl LogAggregator {
    fn new() -> Self {
        Self {
            accepted: 0,
            rejected: 0,
            overrides: 0,
            denials: 0,
            allocations: 0,
            dead_letters: 0,
            last_flush: Instant::now(),
            flush_interval_secs: std::env::var("LOG_FLUSH_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        }
    }

    fn increment(&mut self, event: &str) {
        match event {
            "accepted" => self.accepted += 1,
            "rejected" => self.rejected += 1,
            "override" => self.overrides += 1,
            "denial" => self.denials += 1,
            "allocation" => self.allocations += 1,
            "dead_letter" => self.dead_letters += 1,
            _ => {}
        }
    }

    fn maybe_flush(&mut self) -> Option<Map<String, Value>> {
        if self.last_flush.elapsed().as_secs() < self.flush_interval_secs {
            return None;
        }
        let out = obj(&[
            ("accepted", json!(self.accepted)),
            ("rejected", json!(self.rejected)),
            ("overrides", json!(self.overrides)),
            ("denials", json!(self.denials)),
            ("allocations", json!(self.allocations)),
            ("dead_letters", json!(self.dead_letters)),
        ]);
        *self = LogAggregator { last_flush: Instant::now(), flush_interval_secs: self.flush_interval_secs, ..LogAggregator::new() };
        Some(out)
    }
}

/// Call periodically to emit aggregated stats
pub fn tick_aggregator() {
    if let Ok(mut agg) = get_aggregator().lock() {
        if let Some(fields) = agg.maybe_flush() {
            log(Level::Info, Domain::System, "metrics.aggregated_stats", fields);
        }
    }
}

/// Increment a counter in the aggregator
pub fn agg_increment(event: &str) {
    if let Ok(mut agg) = get_aggregator().lock() {
        agg.increment(event);
    }
}
