use serde::{Deserialize, Serialize};

use super::record::OverrideRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verification {
    Valid,
    Corrupted { at: u64 },
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid)
    }
}

/// Walk `records` from `anchor` and report the first record whose hashes,
/// link or index do not check out. Pure: reads nothing but its arguments.
pub fn verify_chain(anchor: &str, records: &[OverrideRecord]) -> Verification {
    let mut prev = anchor;
    let mut expected_index = records.first().map(|r| r.index);
    for record in records {
        if Some(record.index) != expected_index || record.prev_hash != prev || !record.is_intact() {
            return Verification::Corrupted { at: record.index };
        }
        prev = &record.record_hash;
        expected_index = record.index.checked_add(1);
    }
    Verification::Valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::record::{ActionKind, RecordOutcome, RecordPayload, GENESIS_HASH};

    fn chain(n: u64) -> Vec<OverrideRecord> {
        let mut out: Vec<OverrideRecord> = Vec::new();
        for i in 0..n {
            let prev = out.last().map(|r| r.record_hash.clone()).unwrap_or_else(|| GENESIS_HASH.to_string());
            out.push(OverrideRecord::seal(
                i,
                &prev,
                RecordPayload {
                    actor: "ops".into(),
                    action: ActionKind::ChaosCap,
                    target: "risk".into(),
                    old_value: "0.5".into(),
                    new_value: format!("0.{}", i + 1),
                    outcome: RecordOutcome::Applied,
                    ts_ms: 1_000 + i,
                },
            ));
        }
        out
    }

    #[test]
    fn test_adjacent_records_link() {
        let records = chain(5);
        for pair in records.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].record_hash);
        }
        assert_eq!(verify_chain(GENESIS_HASH, &records), Verification::Valid);
        assert_eq!(verify_chain(GENESIS_HASH, &[]), Verification::Valid);
    }

    #[test]
    fn test_tampered_middle_record() {
        let mut records = chain(5);
        records[2].payload.actor = "mallory".into();
        assert_eq!(verify_chain(GENESIS_HASH, &records), Verification::Corrupted { at: 2 });
    }

    #[test]
    fn test_resealed_record_breaks_successor_link() {
        let mut records = chain(4);
        let mut forged = records[1].payload.clone();
        forged.new_value = "1.0".into();
        records[1] = OverrideRecord::seal(1, &records[0].record_hash, forged);
        assert_eq!(verify_chain(GENESIS_HASH, &records), Verification::Corrupted { at: 2 });
    }

    #[test]
    fn test_wrong_anchor_and_dropped_record() {
        let records = chain(3);
        assert_eq!(verify_chain(&"f".repeat(64), &records), Verification::Corrupted { at: 0 });
        let gap = vec![records[0].clone(), records[2].clone()];
        assert_eq!(verify_chain(GENESIS_HASH, &gap), Verification::Corrupted { at: 2 });
    }
}
