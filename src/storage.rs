use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::risk::RiskState;

/// Local SQLite state: risk snapshots and the rejected-signal archive.
pub struct StateStore {
    conn: Connection,
}

pub type SharedStore = Arc<Mutex<StateStore>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedSignal {
    pub signal_id: String,
    pub payload: String,
    pub reasons: Vec<String>,
    pub archived_ms: u64,
    pub expires_ms: u64,
}

impl StateStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS risk_snapshots (
                seq INTEGER NOT NULL,
                ts_ms INTEGER NOT NULL,
                mode TEXT NOT NULL,
                state TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS rejected_signals (
                signal_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                reasons TEXT NOT NULL,
                archived_ms INTEGER NOT NULL,
                expires_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS rejected_expiry ON rejected_signals (expires_ms);
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn persist_risk(&mut self, ts_ms: u64, state: &RiskState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO risk_snapshots (seq, ts_ms, mode, state) VALUES (?1, ?2, ?3, ?4)",
            params![state.seq as i64, ts_ms as i64, state.mode.as_str(), json],
        )?;
        // Keep a short tail; only the newest row is ever read back.
        tx.execute(
            "DELETE FROM risk_snapshots WHERE rowid NOT IN
                (SELECT rowid FROM risk_snapshots ORDER BY rowid DESC LIMIT 100)",
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn load_latest_risk(&self) -> Result<Option<RiskState>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT state FROM risk_snapshots ORDER BY rowid DESC LIMIT 1", [], |row| row.get(0))
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Insert or refresh an archived rejection.
    pub fn archive_rejected(&mut self, entry: &ArchivedSignal) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO rejected_signals (signal_id, payload, reasons, archived_ms, expires_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.signal_id,
                entry.payload,
                entry.reasons.join(","),
                entry.archived_ms as i64,
                entry.expires_ms as i64
            ],
        )?;
        Ok(())
    }

    /// Archived entry that has not expired at `now_ms`.
    pub fn load_rejected(&self, signal_id: &str, now_ms: u64) -> Result<Option<ArchivedSignal>> {
        let row = self
            .conn
            .query_row(
                "SELECT signal_id, payload, reasons, archived_ms, expires_ms FROM rejected_signals
                 WHERE signal_id = ?1 AND expires_ms > ?2",
                params![signal_id, now_ms as i64],
                |row| {
                    let reasons: String = row.get(2)?;
                    Ok(ArchivedSignal {
                        signal_id: row.get(0)?,
                        payload: row.get(1)?,
                        reasons: reasons.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect(),
                        archived_ms: row.get::<_, i64>(3)? as u64,
                        expires_ms: row.get::<_, i64>(4)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn purge_expired(&mut self, now_ms: u64) -> Result<usize> {
        let n = self.conn.execute("DELETE FROM rejected_signals WHERE expires_ms <= ?1", params![now_ms as i64])?;
        Ok(n)
    }
}

/// Run `f` against the shared store on the blocking pool.
pub async fn with_store<T, F>(store: &SharedStore, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut StateStore) -> Result<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = store.lock().map_err(|_| anyhow!("state store mutex poisoned"))?;
        f(&mut *guard)
    })
    .await
    .map_err(|e| anyhow!("state store task failed: {}", e))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::{RiskMode, RiskParams};

    fn store() -> StateStore {
        let mut s = StateStore::in_memory().unwrap();
        s.init().unwrap();
        s
    }

    #[test]
    fn test_risk_snapshot_roundtrip_keeps_latest() {
        let mut s = store();
        assert!(s.load_latest_risk().unwrap().is_none());
        let mut state = RiskState::initial(&RiskParams::default(), 1);
        s.persist_risk(1, &state).unwrap();
        state.mode = RiskMode::Halted;
        state.halted = true;
        state.halt_reason = Some("kill_switch".into());
        state.seq = 2;
        s.persist_risk(2, &state).unwrap();
        assert_eq!(s.load_latest_risk().unwrap(), Some(state));
    }

    #[test]
    fn test_halted_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.sqlite");
        let path = path.to_str().unwrap();
        let mut state = RiskState::initial(&RiskParams::default(), 1);
        state.mode = RiskMode::Halted;
        state.halted = true;
        {
            let mut s = StateStore::new(path).unwrap();
            s.init().unwrap();
            s.persist_risk(1, &state).unwrap();
        }
        let mut s = StateStore::new(path).unwrap();
        s.init().unwrap();
        assert!(s.load_latest_risk().unwrap().unwrap().halted);
    }

    #[test]
    fn test_rejected_archive_expiry() {
        let mut s = store();
        let entry = ArchivedSignal {
            signal_id: "s-9".into(),
            payload: "{}".into(),
            reasons: vec!["entropy".into(), "confidence".into()],
            archived_ms: 100,
            expires_ms: 200,
        };
        s.archive_rejected(&entry).unwrap();
        assert_eq!(s.load_rejected("s-9", 150).unwrap(), Some(entry));
        assert!(s.load_rejected("s-9", 250).unwrap().is_none());
        assert_eq!(s.purge_expired(250).unwrap(), 1);
        assert_eq!(s.purge_expired(250).unwrap(), 0);
    }
}
