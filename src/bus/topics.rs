#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    SignalRaw,
    SignalAccepted,
    SignalRejected,
    RiskState,
    RiskOverride,
    RiskTelemetry,
    AuditAppend,
    CommanderCommand,
    TradeResult,
    ProfitEvent,
    ProfitReinvest,
    ProfitBuffer,
    ProfitWithdraw,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::SignalRaw => "signal.raw",
            Topic::SignalAccepted => "signal.accepted",
            Topic::SignalRejected => "signal.rejected",
            Topic::RiskState => "risk.state",
            Topic::RiskOverride => "risk.override",
            Topic::RiskTelemetry => "risk.telemetry",
            Topic::AuditAppend => "audit.append",
            Topic::CommanderCommand => "commander.command",
            Topic::TradeResult => "trade.result",
            Topic::ProfitEvent => "profit.event",
            Topic::ProfitReinvest => "profit.reinvest",
            Topic::ProfitBuffer => "profit.buffer",
            Topic::ProfitWithdraw => "profit.withdraw",
        }
    }
}

/// Namespace-prefixed topic names, e.g. `titan:prod:signal.raw`.
#[derive(Debug, Clone)]
pub struct Topics {
    namespace: String,
}

impl Topics {
    pub fn new(namespace: &str) -> Self {
        Self { namespace: namespace.trim_end_matches(':').to_string() }
    }

    pub fn name(&self, topic: Topic) -> String {
        if self.namespace.is_empty() {
            topic.as_str().to_string()
        } else {
            format!("{}:{}", self.namespace, topic.as_str())
        }
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new("titan:prod")
    }
}
