use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::logging::{log, obj, Domain, Level};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct GateMetrics {
    pub accepted: Counter,
    pub rejected: Counter,
    pub errored: Counter,
    pub duplicates: Counter,
}

#[derive(Debug, Default)]
pub struct RouterMetrics {
    pub routed: Counter,
    pub duplicates: Counter,
    pub rejected: Counter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub signals_accepted: u64,
    pub signals_rejected: u64,
    pub signals_errored: u64,
    pub signals_duplicate: u64,
    pub profits_routed: u64,
    pub profits_duplicate: u64,
    pub profits_rejected: u64,
    pub dead_letters: u64,
}

impl MetricsSnapshot {
    pub fn collect(gate: &GateMetrics, router: &RouterMetrics) -> Self {
        Self {
            signals_accepted: gate.accepted.get(),
            signals_rejected: gate.rejected.get(),
            signals_errored: gate.errored.get(),
            signals_duplicate: gate.duplicates.get(),
            profits_routed: router.routed.get(),
            profits_duplicate: router.duplicates.get(),
            profits_rejected: router.rejected.get(),
            dead_letters: crate::bus::retry::dead_letter_count(),
        }
    }

    pub fn log(&self) {
        let fields = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => obj(&[]),
        };
        log(Level::Info, Domain::System, "metrics.snapshot", fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reads_counters() {
        let gate = GateMetrics::default();
        let router = RouterMetrics::default();
        gate.accepted.inc();
        gate.accepted.inc();
        gate.duplicates.inc();
        router.routed.inc();
        let snap = MetricsSnapshot::collect(&gate, &router);
        assert_eq!(snap.signals_accepted, 2);
        assert_eq!(snap.signals_duplicate, 1);
        assert_eq!(snap.profits_routed, 1);
        assert_eq!(snap.signals_rejected, 0);
    }
}
