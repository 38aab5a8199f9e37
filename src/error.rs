//! Error taxonomy for the control plane.
//!
//! Component-local errors (a single malformed message) are recovered where
//! they occur. Systemic errors (ledger corruption, a bus that stays down)
//! are forwarded to the risk state machine as fatal inputs.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("unauthorized: actor {actor} may not {action}")]
    Unauthorized { actor: String, action: String },
    #[error("invalid target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },
    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),
    #[error("bus unavailable on {topic}: {reason}")]
    BusUnavailable { topic: String, reason: String },
    #[error("ledger corrupted at index {at}")]
    LedgerCorruption { at: u64 },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("component stopped: {0}")]
    Stopped(&'static str),
}

impl ControlError {
    /// Systemic errors must reach the risk state machine.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            ControlError::BusUnavailable { .. } | ControlError::LedgerCorruption { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::MalformedInput(_) => "malformed_input",
            ControlError::Unauthorized { .. } => "unauthorized",
            ControlError::InvalidTarget { .. } => "invalid_target",
            ControlError::ConfigurationInvalid(_) => "configuration_invalid",
            ControlError::BusUnavailable { .. } => "bus_unavailable",
            ControlError::LedgerCorruption { .. } => "ledger_corruption",
            ControlError::Storage(_) => "storage",
            ControlError::Stopped(_) => "stopped",
        }
    }
}

impl From<rusqlite::Error> for ControlError {
    fn from(err: rusqlite::Error) -> Self {
        ControlError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for ControlError {
    fn from(err: std::io::Error) -> Self {
        ControlError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_systemic_classification() {
        assert!(ControlError::LedgerCorruption { at: 3 }.is_systemic());
        assert!(ControlError::BusUnavailable {
            topic: "t".into(),
            reason: "down".into()
        }
        .is_systemic());
        assert!(!ControlError::MalformedInput("x".into()).is_systemic());
        assert!(!ControlError::ConfigurationInvalid("x".into()).is_systemic());
    }

    #[test]
    fn test_display_carries_context() {
        let err = ControlError::Unauthorized {
            actor: "mallory".into(),
            action: "kill_switch".into(),
        };
        assert_eq!(err.to_string(), "unauthorized: actor mallory may not kill_switch");
        assert_eq!(err.kind(), "unauthorized");
    }
}
