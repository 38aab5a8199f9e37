use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::record::{OverrideRecord, GENESIS_HASH};
use crate::error::ControlError;

/// One line of the ledger file. The first line is always `Genesis`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LedgerLine {
    Genesis { anchor: String, base_index: u64 },
    Record(OverrideRecord),
}

/// Contents read back from disk. `bad_line` is the index of the first
/// newline-terminated record line that could not be decoded; nothing after
/// it is loaded.
#[derive(Debug, Clone)]
pub struct Recovered {
    pub anchor: String,
    pub base_index: u64,
    pub records: Vec<OverrideRecord>,
    pub bad_line: Option<u64>,
    pub tail: Tail,
}

/// State of the file after its last complete line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tail {
    Clean,
    /// Last line decoded but has no trailing newline.
    Unterminated,
    /// Last line is an interrupted write; only the first `valid_len` bytes hold.
    Torn { valid_len: u64 },
}

#[derive(Debug)]
pub struct LedgerFile {
    file: File,
    path: PathBuf,
}

fn encode(line: &LedgerLine) -> String {
    serde_json::to_string(line).unwrap_or_else(|_| "{}".to_string())
}

impl LedgerFile {
    /// Open for appending, writing a genesis line if the file is new or empty.
    pub fn open(path: &Path) -> Result<Self, ControlError> {
        let fresh = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if fresh {
            let genesis = LedgerLine::Genesis { anchor: GENESIS_HASH.to_string(), base_index: 0 };
            file.write_all(encode(&genesis).as_bytes())?;
            file.write_all(b"\n")?;
            file.flush()?;
        }
        Ok(Self { file, path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &OverrideRecord) -> Result<(), ControlError> {
        let line = encode(&LedgerLine::Record(record.clone()));
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), ControlError> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Read every line back without modifying the file. A missing file is
    /// an empty chain.
    pub fn recover(path: &Path) -> Result<Recovered, ControlError> {
        let mut out = Recovered {
            anchor: GENESIS_HASH.to_string(),
            base_index: 0,
            records: Vec::new(),
            bad_line: None,
            tail: Tail::Clean,
        };
        if !path.exists() {
            return Ok(out);
        }
        let bytes = std::fs::read(path)?;
        let mut seen_genesis = false;
        let mut offset = 0usize;
        while offset < bytes.len() {
            let rest = &bytes[offset..];
            let (line, terminated) = match rest.iter().position(|b| *b == b'\n') {
                Some(end) => (&rest[..end], true),
                None => (rest, false),
            };
            let line_start = offset;
            offset += line.len() + usize::from(terminated);
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let position = out.base_index + out.records.len() as u64;
            match serde_json::from_slice::<LedgerLine>(line) {
                Ok(LedgerLine::Genesis { anchor, base_index }) if !seen_genesis => {
                    seen_genesis = true;
                    out.anchor = anchor;
                    out.base_index = base_index;
                }
                Ok(LedgerLine::Record(record)) if seen_genesis => out.records.push(record),
                Err(_) if !terminated => {
                    out.tail = Tail::Torn { valid_len: line_start as u64 };
                    break;
                }
                _ => {
                    out.bad_line = Some(position);
                    break;
                }
            }
            if !terminated {
                out.tail = Tail::Unterminated;
            }
        }
        Ok(out)
    }

    /// Make the file end on a complete line: cut a torn tail, or terminate
    /// a last line that lost only its newline.
    pub fn repair_tail(path: &Path, tail: Tail) -> Result<(), ControlError> {
        match tail {
            Tail::Clean => {}
            Tail::Unterminated => {
                let mut file = OpenOptions::new().append(true).open(path)?;
                file.write_all(b"\n")?;
                file.sync_data()?;
            }
            Tail::Torn { valid_len } => {
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(valid_len)?;
                file.sync_data()?;
            }
        }
        Ok(())
    }

    /// Replace the file contents atomically: write a sibling temp file, then rename.
    pub fn rewrite(
        path: &Path,
        anchor: &str,
        base_index: u64,
        records: &[OverrideRecord],
    ) -> Result<LedgerFile, ControlError> {
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut out = File::create(&tmp)?;
            let genesis = LedgerLine::Genesis { anchor: anchor.to_string(), base_index };
            out.write_all(encode(&genesis).as_bytes())?;
            out.write_all(b"\n")?;
            for record in records {
                out.write_all(encode(&LedgerLine::Record(record.clone())).as_bytes())?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            out.sync_data()?;
        }
        std::fs::rename(&tmp, path)?;
        LedgerFile::open(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::record::{ActionKind, RecordOutcome, RecordPayload};

    fn record(index: u64, prev: &str) -> OverrideRecord {
        OverrideRecord::seal(
            index,
            prev,
            RecordPayload {
                actor: "ops".into(),
                action: ActionKind::ModuleFlag,
                target: "profit_router".into(),
                old_value: "enabled".into(),
                new_value: "disabled".into(),
                outcome: RecordOutcome::Applied,
                ts_ms: 7,
            },
        )
    }

    #[test]
    fn test_open_append_recover() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let r0 = record(0, GENESIS_HASH);
        {
            let mut f = LedgerFile::open(&path).unwrap();
            f.append(&r0).unwrap();
        }
        // Reopening must not add a second genesis line.
        {
            let mut f = LedgerFile::open(&path).unwrap();
            f.append(&record(1, &r0.record_hash)).unwrap();
        }
        let rec = LedgerFile::recover(&path).unwrap();
        assert_eq!(rec.anchor, GENESIS_HASH);
        assert_eq!(rec.records.len(), 2);
        assert!(rec.bad_line.is_none());
    }

    #[test]
    fn test_garbage_line_marks_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let mut f = LedgerFile::open(&path).unwrap();
        f.append(&record(0, GENESIS_HASH)).unwrap();
        drop(f);
        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(b"{not json\n").unwrap();
        let rec = LedgerFile::recover(&path).unwrap();
        assert_eq!(rec.records.len(), 1);
        assert_eq!(rec.bad_line, Some(1));
    }

    #[test]
    fn test_torn_last_line_is_a_tail_not_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let r0 = record(0, GENESIS_HASH);
        let mut f = LedgerFile::open(&path).unwrap();
        f.append(&r0).unwrap();
        drop(f);
        let intact = std::fs::metadata(&path).unwrap().len();
        let partial = encode(&LedgerLine::Record(record(1, &r0.record_hash)));
        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(&partial.as_bytes()[..partial.len() / 2]).unwrap();
        drop(raw);

        let rec = LedgerFile::recover(&path).unwrap();
        assert_eq!(rec.records.len(), 1);
        assert!(rec.bad_line.is_none());
        assert_eq!(rec.tail, Tail::Torn { valid_len: intact });

        LedgerFile::repair_tail(&path, rec.tail).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact);
        assert_eq!(LedgerFile::recover(&path).unwrap().tail, Tail::Clean);
    }

    #[test]
    fn test_missing_newline_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let r0 = record(0, GENESIS_HASH);
        let mut f = LedgerFile::open(&path).unwrap();
        f.append(&r0).unwrap();
        drop(f);
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 1]).unwrap();

        let rec = LedgerFile::recover(&path).unwrap();
        assert_eq!(rec.records.len(), 1);
        assert_eq!(rec.tail, Tail::Unterminated);
        LedgerFile::repair_tail(&path, rec.tail).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), full);
    }

    #[test]
    fn test_missing_file_is_empty_chain() {
        let dir = tempfile::tempdir().unwrap();
        let rec = LedgerFile::recover(&dir.path().join("absent.jsonl")).unwrap();
        assert!(rec.records.is_empty());
        assert_eq!(rec.base_index, 0);
    }
}
