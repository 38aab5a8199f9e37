use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Anchor of an untruncated chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Actor recorded for transitions the state machine makes on its own.
pub const RISK_ACTOR: &str = "risk_state_machine";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SignalSide,
    ChaosCap,
    KillSwitch,
    ModuleFlag,
    RiskTransition,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::SignalSide => "signal_side",
            ActionKind::ChaosCap => "chaos_cap",
            ActionKind::KillSwitch => "kill_switch",
            ActionKind::ModuleFlag => "module_flag",
            ActionKind::RiskTransition => "risk_transition",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Applied,
    Denied,
}

/// The hashed part of a record. Values are kept as strings so the
/// canonical encoding never depends on float formatting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPayload {
    pub actor: String,
    pub action: ActionKind,
    pub target: String,
    pub old_value: String,
    pub new_value: String,
    pub outcome: RecordOutcome,
    pub ts_ms: u64,
}

impl RecordPayload {
    /// Field order is fixed by the struct definition.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub index: u64,
    pub change_id: String,
    pub prev_hash: String,
    pub record_hash: String,
    pub payload: RecordPayload,
}

pub fn change_id(payload: &RecordPayload) -> String {
    hex::encode(Sha256::digest(payload.canonical_bytes()))
}

pub fn record_hash(change_id: &str, prev_hash: &str, payload: &RecordPayload) -> String {
    let mut hasher = Sha256::new();
    hasher.update(change_id.as_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.update(payload.canonical_bytes());
    hex::encode(hasher.finalize())
}

impl OverrideRecord {
    pub fn seal(index: u64, prev_hash: &str, payload: RecordPayload) -> OverrideRecord {
        let change_id = change_id(&payload);
        let record_hash = record_hash(&change_id, prev_hash, &payload);
        OverrideRecord { index, change_id, prev_hash: prev_hash.to_string(), record_hash, payload }
    }

    /// Hashes recomputed from the stored payload match the stored ones.
    pub fn is_intact(&self) -> bool {
        let cid = change_id(&self.payload);
        cid == self.change_id && record_hash(&cid, &self.prev_hash, &self.payload) == self.record_hash
    }
}
