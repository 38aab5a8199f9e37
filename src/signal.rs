//! Trading signal as it travels the pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

/// Signals older than this (producer did not set a TTL) are stale.
pub const DEFAULT_SIGNAL_TTL_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(ControlError::MalformedInput(format!("unknown side {:?}", other))),
        }
    }
}

impl TryFrom<String> for Side {
    type Error = ControlError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Attached when a commander override changed the side of a signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub change_id: String,
    pub actor: String,
    pub original_side: Side,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub confidence: f64,
    pub entropy: f64,
    #[serde(default)]
    pub strategy: String,
    /// Creation time, epoch milliseconds.
    pub timestamp: u64,
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

fn default_ttl_ms() -> u64 {
    DEFAULT_SIGNAL_TTL_MS
}

impl Signal {
    /// Decode and validate a bus payload.
    pub fn parse(payload: &[u8]) -> Result<Signal, ControlError> {
        let signal: Signal =
            serde_json::from_slice(payload).map_err(|e| ControlError::MalformedInput(e.to_string()))?;
        signal.validate()?;
        Ok(signal)
    }

    pub fn validate(&self) -> Result<(), ControlError> {
        if self.id.trim().is_empty() {
            return Err(ControlError::MalformedInput("signal id is empty".into()));
        }
        if self.symbol.trim().is_empty() {
            return Err(ControlError::MalformedInput(format!("signal {} has no symbol", self.id)));
        }
        for (name, v) in [("confidence", self.confidence), ("entropy", self.entropy)] {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(ControlError::MalformedInput(format!(
                    "signal {} {} out of [0, 1]: {}",
                    self.id, name, v
                )));
            }
        }
        Ok(())
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.timestamp.saturating_add(self.ttl_ms)
    }

    pub fn is_stale(&self, now_ms: u64) -> bool {
        self.expires_at_ms() < now_ms
    }

    /// Derived copy with a different side. Keeps the id.
    pub fn with_side(&self, side: Side, provenance: Provenance) -> Signal {
        Signal { side, provenance: Some(provenance), ..self.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(extra: &str) -> String {
        format!(
            r#"{{"id":"s-1","symbol":"BTC-USD","side":"BUY","confidence":0.9,"entropy":0.2,"timestamp":1000{}}}"#,
            extra
        )
    }

    #[test]
    fn test_parse_defaults_and_case_insensitive_side() {
        let s = Signal::parse(raw("").as_bytes()).unwrap();
        assert_eq!(s.side, Side::Buy);
        assert_eq!(s.ttl_ms, DEFAULT_SIGNAL_TTL_MS);
        assert!(s.provenance.is_none());
        assert_eq!(s.expires_at_ms(), 61_000);
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        let bad = raw("").replace("0.9", "1.4");
        let err = Signal::parse(bad.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), "malformed_input");
        assert!(Signal::parse(b"not json").is_err());
        assert!(Signal::parse(raw("").replace("BUY", "hold").as_bytes()).is_err());
    }

    #[test]
    fn test_staleness() {
        let s = Signal::parse(raw(r#","ttl_ms":500"#).as_bytes()).unwrap();
        assert!(!s.is_stale(1_500));
        assert!(s.is_stale(1_501));
    }

    #[test]
    fn test_with_side_keeps_identity() {
        let s = Signal::parse(raw("").as_bytes()).unwrap();
        let p = Provenance { change_id: "abc".into(), actor: "ops".into(), original_side: Side::Buy };
        let d = s.with_side(Side::Sell, p.clone());
        assert_eq!(d.id, s.id);
        assert_eq!(d.side, Side::Sell);
        assert_eq!(d.provenance, Some(p));
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains(r#""side":"sell""#));
    }
}
