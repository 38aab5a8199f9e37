use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::ControlError;
use crate::ledger::ActionKind;
use crate::logging::ts_epoch_ms;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew either side of a signed request's timestamp.
pub const DEFAULT_FRESHNESS_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    SignalSide,
    ChaosCap,
    KillSwitch,
    ModuleFlag,
}

impl OverrideAction {
    pub fn as_str(&self) -> &'static str {
        self.kind().as_str()
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            OverrideAction::SignalSide => ActionKind::SignalSide,
            OverrideAction::ChaosCap => ActionKind::ChaosCap,
            OverrideAction::KillSwitch => ActionKind::KillSwitch,
            OverrideAction::ModuleFlag => ActionKind::ModuleFlag,
        }
    }
}

impl fmt::Display for OverrideAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverrideAction {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "signal_side" => Ok(OverrideAction::SignalSide),
            "chaos_cap" => Ok(OverrideAction::ChaosCap),
            "kill_switch" => Ok(OverrideAction::KillSwitch),
            "module_flag" => Ok(OverrideAction::ModuleFlag),
            other => Err(ControlError::MalformedInput(format!("unknown override action {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideRequest {
    pub action: OverrideAction,
    pub target: String,
    pub new_value: String,
    pub actor: String,
    /// Issue time in epoch millis; signed.
    #[serde(default)]
    pub ts_ms: u64,
    /// Single-use value; signed.
    #[serde(default)]
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl OverrideRequest {
    pub fn new(action: OverrideAction, target: &str, new_value: &str, actor: &str) -> Self {
        Self {
            action,
            target: target.to_string(),
            new_value: new_value.to_string(),
            actor: actor.to_string(),
            ts_ms: ts_epoch_ms(),
            nonce: format!("{:016x}", rand::random::<u64>()),
            token: None,
        }
    }

    pub fn with_token(mut self, token: String) -> Self {
        self.token = Some(token);
        self
    }

    /// Bytes covered by the HMAC token: a JSON array, so no field can
    /// absorb a neighbour's separator.
    pub fn signing_message(&self) -> String {
        serde_json::json!([self.actor, self.action.as_str(), self.target, self.new_value, self.ts_ms, self.nonce])
            .to_string()
    }
}

/// Yes/no decision on an override. An `Err` is treated as a denial.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, request: &OverrideRequest) -> Result<bool>;
}

/// Requires a hex HMAC-SHA256 token over the request, optionally restricted
/// to a set of actors. A signed request is accepted once, and only while its
/// timestamp is within the freshness window of the local clock.
pub struct HmacAuthorizer {
    secret: Vec<u8>,
    actors: Option<HashSet<String>>,
    freshness_ms: u64,
    /// nonce -> request timestamp, pruned once outside the window.
    seen: Mutex<HashMap<String, u64>>,
}

impl HmacAuthorizer {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            actors: None,
            freshness_ms: DEFAULT_FRESHNESS_MS,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_freshness_ms(mut self, freshness_ms: u64) -> Self {
        self.freshness_ms = freshness_ms;
        self
    }

    pub fn with_actors<I: IntoIterator<Item = String>>(mut self, actors: I) -> Self {
        let set: HashSet<String> = actors.into_iter().collect();
        self.actors = if set.is_empty() { None } else { Some(set) };
        self
    }

    pub fn sign(secret: &str, request: &OverrideRequest) -> Result<String> {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| anyhow!("HMAC error: {}", e))?;
        mac.update(request.signing_message().as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl Authorizer for HmacAuthorizer {
    async fn authorize(&self, request: &OverrideRequest) -> Result<bool> {
        if let Some(actors) = &self.actors {
            if !actors.contains(&request.actor) {
                return Ok(false);
            }
        }
        let Some(token) = request.token.as_deref() else {
            return Ok(false);
        };
        let Ok(sig) = hex::decode(token) else {
            return Ok(false);
        };
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|e| anyhow!("HMAC error: {}", e))?;
        mac.update(request.signing_message().as_bytes());
        if mac.verify_slice(&sig).is_err() {
            return Ok(false);
        }
        self.check_fresh(request, ts_epoch_ms())
    }
}

impl HmacAuthorizer {
    /// Timestamp inside the window and nonce not used before. Records the nonce.
    fn check_fresh(&self, request: &OverrideRequest, now_ms: u64) -> Result<bool> {
        if request.nonce.is_empty() || request.ts_ms.abs_diff(now_ms) > self.freshness_ms {
            return Ok(false);
        }
        let mut seen = self.seen.lock().map_err(|_| anyhow!("nonce cache poisoned"))?;
        let window = self.freshness_ms;
        seen.retain(|_, ts| ts.abs_diff(now_ms) <= window);
        if seen.contains_key(&request.nonce) {
            return Ok(false);
        }
        seen.insert(request.nonce.clone(), request.ts_ms);
        Ok(true)
    }
}

/// Allow-list of actors and the actions each may take.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    grants: HashMap<String, HashSet<OverrideAction>>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, actor: &str, actions: &[OverrideAction]) -> Self {
        self.grants.entry(actor.to_string()).or_default().extend(actions.iter().copied());
        self
    }

    pub fn allow_all(self, actor: &str) -> Self {
        self.allow(
            actor,
            &[
                OverrideAction::SignalSide,
                OverrideAction::ChaosCap,
                OverrideAction::KillSwitch,
                OverrideAction::ModuleFlag,
            ],
        )
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(&self, request: &OverrideRequest) -> Result<bool> {
        Ok(self.grants.get(&request.actor).map(|a| a.contains(&request.action)).unwrap_or(false))
    }
}
