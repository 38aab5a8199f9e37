//! Offline audit ledger check.
//!
//! Usage: verify_ledger <ledger.jsonl>
//!
//! Reads the file without touching it, prints one JSON object and exits
//! non-zero when the file is missing or the chain is broken.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde_json::json;

use riskgate::ledger::{inspect, Verification};

fn main() -> Result<()> {
    let Some(path) = std::env::args().nth(1).map(PathBuf::from) else {
        bail!("usage: verify_ledger <ledger.jsonl>");
    };
    let report = inspect(&path).with_context(|| format!("verify {}", path.display()))?;
    let out = json!({
        "path": path.to_string_lossy(),
        "records": report.records,
        "first_index": report.first_index,
        "head_hash": report.head_hash,
        "torn_tail": report.torn_tail,
        "verification": report.verification,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    if let Verification::Corrupted { at } = report.verification {
        eprintln!("ledger corrupted at index {}", at);
        std::process::exit(1);
    }
    Ok(())
}
