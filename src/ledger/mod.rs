//! Append-only, hash-chained audit ledger.
//!
//! Every override (applied or denied) and every risk transition becomes an
//! `OverrideRecord` whose hash covers the previous record's hash. There is
//! no edit or delete API; `truncate_before` drops a prefix for retention and
//! keeps the last dropped hash as the new anchor so the rest still verifies.
//!
//! `Ledger` is plain synchronous state. The `writer` module puts it behind a
//! single-writer task; `verify_chain` is pure and works on any record slice.

pub mod chain;
pub mod file;
pub mod record;
pub mod writer;

use std::ops::Range;
use std::path::Path;

use serde::Serialize;
use serde_json::json;

pub use chain::{verify_chain, Verification};
pub use file::{LedgerFile, Tail};
pub use record::{ActionKind, OverrideRecord, RecordOutcome, RecordPayload, GENESIS_HASH, RISK_ACTOR};
pub use writer::{spawn_ledger_writer, LedgerHandle};

use crate::error::ControlError;
use crate::logging::{log, obj, v_str, Domain, Level};

/// Read-only verdict on a ledger file.
#[derive(Debug, Clone, Serialize)]
pub struct Inspection {
    pub records: usize,
    pub first_index: Option<u64>,
    pub head_hash: String,
    pub torn_tail: bool,
    pub verification: Verification,
}

/// Verify the ledger at `path` without creating, repairing or appending to
/// it. A missing file is an error, not an empty chain.
pub fn inspect(path: &Path) -> Result<Inspection, ControlError> {
    if !path.is_file() {
        return Err(ControlError::Storage(format!("no ledger file at {}", path.display())));
    }
    let recovered = LedgerFile::recover(path)?;
    let verification = match recovered.bad_line {
        Some(at) => Verification::Corrupted { at },
        None => verify_chain(&recovered.anchor, &recovered.records),
    };
    Ok(Inspection {
        records: recovered.records.len(),
        first_index: recovered.records.first().map(|r| r.index),
        head_hash: recovered.records.last().map(|r| r.record_hash.clone()).unwrap_or(recovered.anchor),
        torn_tail: matches!(recovered.tail, Tail::Torn { .. }),
        verification,
    })
}

#[derive(Debug)]
pub struct Ledger {
    anchor: String,
    base_index: u64,
    records: Vec<OverrideRecord>,
    file: Option<LedgerFile>,
    corrupted: Option<u64>,
}

impl Ledger {
    pub fn in_memory() -> Self {
        Self {
            anchor: GENESIS_HASH.to_string(),
            base_index: 0,
            records: Vec::new(),
            file: None,
            corrupted: None,
        }
    }

    /// Load and verify the file at `path`. A ledger that fails verification
    /// is still returned, marked corrupted, and refuses appends.
    pub fn open(path: &Path) -> Result<Self, ControlError> {
        let recovered = LedgerFile::recover(path)?;
        if recovered.tail != Tail::Clean {
            // An append cut short by a crash; the complete lines before it stand.
            log(
                Level::Warn,
                Domain::Audit,
                "ledger_tail_repaired",
                obj(&[
                    ("path", v_str(&path.to_string_lossy())),
                    ("tail", v_str(&format!("{:?}", recovered.tail))),
                    ("records", json!(recovered.records.len())),
                ]),
            );
            LedgerFile::repair_tail(path, recovered.tail)?;
        }
        let file = LedgerFile::open(path)?;
        let mut ledger = Self {
            anchor: recovered.anchor,
            base_index: recovered.base_index,
            records: recovered.records,
            file: Some(file),
            corrupted: recovered.bad_line,
        };
        if ledger.corrupted.is_none() {
            ledger.verify_all();
        }
        log(
            Level::Info,
            Domain::Audit,
            "ledger_recovered",
            obj(&[
                ("path", v_str(&path.to_string_lossy())),
                ("records", json!(ledger.records.len())),
                ("base_index", json!(ledger.base_index)),
                ("corrupted_at", json!(ledger.corrupted)),
            ]),
        );
        Ok(ledger)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn anchor(&self) -> &str {
        &self.anchor
    }

    pub fn records(&self) -> &[OverrideRecord] {
        &self.records
    }

    pub fn head_hash(&self) -> &str {
        self.records.last().map(|r| r.record_hash.as_str()).unwrap_or(&self.anchor)
    }

    pub fn next_index(&self) -> u64 {
        self.base_index + self.records.len() as u64
    }

    pub fn corrupted_at(&self) -> Option<u64> {
        self.corrupted
    }

    pub fn append(&mut self, payload: RecordPayload) -> Result<OverrideRecord, ControlError> {
        if let Some(at) = self.corrupted {
            return Err(ControlError::LedgerCorruption { at });
        }
        let record = OverrideRecord::seal(self.next_index(), self.head_hash(), payload);
        if let Some(file) = self.file.as_mut() {
            file.append(&record)?;
        }
        self.records.push(record.clone());
        Ok(record)
    }

    /// Verify records whose index falls in `range`. The first one is linked
    /// against its stored predecessor (or the anchor).
    pub fn verify(&self, range: Range<u64>) -> Verification {
        let start = range.start.max(self.base_index);
        let end = range.end.min(self.next_index());
        if start >= end {
            return Verification::Valid;
        }
        let lo = (start - self.base_index) as usize;
        let hi = (end - self.base_index) as usize;
        let anchor = if lo == 0 { self.anchor.as_str() } else { self.records[lo - 1].record_hash.as_str() };
        verify_chain(anchor, &self.records[lo..hi])
    }

    /// Full verification. A failure latches the corrupted flag.
    pub fn verify_all(&mut self) -> Verification {
        if let Some(at) = self.corrupted {
            return Verification::Corrupted { at };
        }
        let result = verify_chain(&self.anchor, &self.records);
        if let Verification::Corrupted { at } = result {
            self.corrupted = Some(at);
            log(Level::Fatal, Domain::Audit, "ledger_corrupted", obj(&[("at", json!(at))]));
        }
        result
    }

    /// Drop the leading records stamped before `cutoff_ms`. Returns how many
    /// were dropped.
    pub fn truncate_before(&mut self, cutoff_ms: u64) -> Result<usize, ControlError> {
        if let Some(at) = self.corrupted {
            return Err(ControlError::LedgerCorruption { at });
        }
        let dropped = self.records.iter().take_while(|r| r.payload.ts_ms < cutoff_ms).count();
        if dropped == 0 {
            return Ok(0);
        }
        let last = &self.records[dropped - 1];
        let anchor = last.record_hash.clone();
        let base_index = last.index + 1;
        let kept: Vec<OverrideRecord> = self.records[dropped..].to_vec();
        if let Some(path) = self.file.as_ref().map(|f| f.path().to_path_buf()) {
            self.file = Some(LedgerFile::rewrite(&path, &anchor, base_index, &kept)?);
        }
        self.anchor = anchor;
        self.base_index = base_index;
        self.records = kept;
        log(
            Level::Info,
            Domain::Audit,
            "ledger_truncated",
            obj(&[("dropped", json!(dropped)), ("base_index", json!(base_index)), ("anchor", v_str(&self.anchor))]),
        );
        Ok(dropped)
    }

    pub fn sync(&mut self) -> Result<(), ControlError> {
        match self.file.as_mut() {
            Some(file) => file.sync(),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn records_mut(&mut self) -> &mut Vec<OverrideRecord> {
        &mut self.records
    }
}
