//! Realized-profit router.
//!
//! Splits each profit event into reinvest / buffer / withdraw using the ratios
//! of a single config snapshot. Reinvest and buffer are truncated to the
//! configured scale and withdraw takes the remainder, so the three parts
//! always sum to the input amount exactly.

use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

use futures_util::StreamExt;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;

use crate::bus::retry::RetryConfig;
use crate::bus::{publish_json, Bus, BusStream, Topic, Topics};
use crate::config::{ConfigHandle, ConfigSnapshot};
use crate::error::ControlError;
use crate::flags::{ModuleFlags, PROFIT_ROUTER};
use crate::logging::{agg_increment, log, log_allocation, obj, ts_epoch_ms, v_str, Domain, Level};
use crate::metrics::RouterMetrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitEvent {
    pub amount: Decimal,
    pub asset: String,
    pub trade_id: String,
    #[serde(default)]
    pub ts_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sink {
    Reinvest,
    Buffer,
    Withdraw,
}

impl Sink {
    pub fn topic(&self) -> Topic {
        match self {
            Sink::Reinvest => Topic::ProfitReinvest,
            Sink::Buffer => Topic::ProfitBuffer,
            Sink::Withdraw => Topic::ProfitWithdraw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationEvent {
    pub trade_id: String,
    pub asset: String,
    pub amount: Decimal,
    pub sink: Sink,
    pub config_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub reinvest: Decimal,
    pub buffer: Decimal,
    pub withdraw: Decimal,
}

impl Allocation {
    pub fn total(&self) -> Decimal {
        self.reinvest + self.buffer + self.withdraw
    }
}

fn ratio(name: &str, v: f64) -> Result<Decimal, ControlError> {
    if !v.is_finite() || !(0.0..=1.0).contains(&v) {
        return Err(ControlError::ConfigurationInvalid(format!("{} must be in [0, 1], got {}", name, v)));
    }
    // Shortest decimal form of the f64, so 0.3 is 0.3 and not 0.299999...
    Decimal::from_str(&v.to_string())
        .map_err(|e| ControlError::ConfigurationInvalid(format!("{} not representable: {}", name, e)))
}

/// Pure split of `amount` by (reinvest_pct, buffer_pct).
pub fn split(amount: Decimal, reinvest_pct: f64, buffer_pct: f64, scale: u32) -> Result<Allocation, ControlError> {
    let r = ratio("reinvest_pct", reinvest_pct)?;
    let b = ratio("buffer_pct", buffer_pct)?;
    if r + b > Decimal::ONE {
        return Err(ControlError::ConfigurationInvalid(format!(
            "reinvest_pct + buffer_pct = {} exceeds 1",
            r + b
        )));
    }
    if amount <= Decimal::ZERO {
        return Err(ControlError::MalformedInput(format!("profit amount must be positive, got {}", amount)));
    }
    let reinvest = (amount * r).round_dp_with_strategy(scale, RoundingStrategy::ToZero);
    let buffer = (amount * b).round_dp_with_strategy(scale, RoundingStrategy::ToZero);
    let withdraw = amount - reinvest - buffer;
    Ok(Allocation { reinvest, buffer, withdraw })
}

/// Stateful router: idempotent per trade id, bounded memory of seen ids.
///
/// Memory is bounded by count (`profit_dedup_capacity`), not by time. A
/// redelivery arriving after more than `capacity` newer trade ids have been
/// routed is no longer recognised and is allocated a second time.
pub struct ProfitRouter {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
    metrics: Arc<RouterMetrics>,
}

impl ProfitRouter {
    pub fn new(capacity: usize, metrics: Arc<RouterMetrics>) -> Self {
        Self { seen: HashSet::new(), order: VecDeque::new(), capacity: capacity.max(1), metrics }
    }

    /// `Ok(None)` when this trade id was already routed. A failed route does
    /// not mark the id, so the event can be retried after a config fix.
    pub fn route(&mut self, event: &ProfitEvent, snapshot: &ConfigSnapshot) -> Result<Option<Allocation>, ControlError> {
        if event.trade_id.trim().is_empty() {
            self.metrics.rejected.inc();
            return Err(ControlError::MalformedInput("profit event without trade id".into()));
        }
        if self.seen.contains(&event.trade_id) {
            self.metrics.duplicates.inc();
            return Ok(None);
        }
        let t = &snapshot.tuning;
        let allocation = match split(event.amount, t.reinvest_pct, t.buffer_pct, t.amount_scale) {
            Ok(a) => a,
            Err(err) => {
                self.metrics.rejected.inc();
                return Err(err);
            }
        };
        self.remember(&event.trade_id);
        self.metrics.routed.inc();
        Ok(Some(allocation))
    }

    fn remember(&mut self, trade_id: &str) {
        if self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.seen.insert(trade_id.to_string());
        self.order.push_back(trade_id.to_string());
    }
}

pub struct RouterDeps {
    pub bus: Arc<dyn Bus>,
    pub topics: Topics,
    pub retry: RetryConfig,
    pub config: ConfigHandle,
    pub flags: ModuleFlags,
    pub metrics: Arc<RouterMetrics>,
}

/// Consume `profit.event` until shutdown.
pub async fn run_profit_router(deps: RouterDeps, mut events: BusStream, mut shutdown: watch::Receiver<bool>) {
    let capacity = deps.config.current().tuning.profit_dedup_capacity;
    let mut router = ProfitRouter::new(capacity, deps.metrics.clone());

    loop {
        let env = tokio::select! {
            env = events.next() => match env {
                Some(env) => env,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let event: ProfitEvent = match serde_json::from_slice(&env.payload) {
            Ok(e) => e,
            Err(err) => {
                deps.metrics.rejected.inc();
                log(Level::Warn, Domain::Profit, "malformed", obj(&[("error", v_str(&err.to_string()))]));
                continue;
            }
        };
        if !deps.flags.is_enabled(PROFIT_ROUTER) {
            log(Level::Warn, Domain::Profit, "module_disabled", obj(&[("trade_id", v_str(&event.trade_id))]));
            continue;
        }

        let snapshot = deps.config.current();
        let allocation = match router.route(&event, &snapshot) {
            Ok(Some(a)) => a,
            Ok(None) => {
                log(Level::Debug, Domain::Profit, "duplicate", obj(&[("trade_id", v_str(&event.trade_id))]));
                continue;
            }
            Err(err) => {
                let level = if matches!(err, ControlError::ConfigurationInvalid(_)) { Level::Error } else { Level::Warn };
                log(
                    level,
                    Domain::Profit,
                    "route_rejected",
                    obj(&[
                        ("trade_id", v_str(&event.trade_id)),
                        ("kind", v_str(err.kind())),
                        ("error", v_str(&err.to_string())),
                        ("config_version", json!(snapshot.version)),
                    ]),
                );
                continue;
            }
        };

        agg_increment("allocation");
        log_allocation(
            &event.trade_id,
            &event.amount.to_string(),
            &allocation.reinvest.to_string(),
            &allocation.buffer.to_string(),
            &allocation.withdraw.to_string(),
            snapshot.version,
        );
        for (sink, amount) in [
            (Sink::Reinvest, allocation.reinvest),
            (Sink::Buffer, allocation.buffer),
            (Sink::Withdraw, allocation.withdraw),
        ] {
            let out = AllocationEvent {
                trade_id: event.trade_id.clone(),
                asset: event.asset.clone(),
                amount,
                sink,
                config_version: snapshot.version,
            };
            let topic = deps.topics.name(sink.topic());
            let _ = publish_json(deps.bus.as_ref(), &deps.retry, &topic, &out).await;
        }
    }
    log(
        Level::Info,
        Domain::Profit,
        "router_stopped",
        obj(&[("routed", json!(deps.metrics.routed.get())), ("at", json!(ts_epoch_ms()))]),
    );
}
