use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::storage::{with_store, ArchivedSignal, SharedStore};

/// Where rejected signals are kept until their retention expires.
#[async_trait]
pub trait RejectArchive: Send + Sync {
    async fn archive(&self, entry: ArchivedSignal) -> Result<()>;

    /// Drop expired entries; returns how many went.
    async fn purge(&self, now_ms: u64) -> Result<usize>;
}

pub struct SqliteArchive {
    store: SharedStore,
}

impl SqliteArchive {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RejectArchive for SqliteArchive {
    async fn archive(&self, entry: ArchivedSignal) -> Result<()> {
        with_store(&self.store, move |s| s.archive_rejected(&entry)).await
    }

    async fn purge(&self, now_ms: u64) -> Result<usize> {
        with_store(&self.store, move |s| s.purge_expired(now_ms)).await
    }
}

#[derive(Default)]
pub struct MemoryArchive {
    entries: Mutex<HashMap<String, ArchivedSignal>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, signal_id: &str) -> Option<ArchivedSignal> {
        self.entries.lock().ok().and_then(|m| m.get(signal_id).cloned())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RejectArchive for MemoryArchive {
    async fn archive(&self, entry: ArchivedSignal) -> Result<()> {
        let mut map = self.entries.lock().map_err(|_| anyhow!("archive mutex poisoned"))?;
        map.insert(entry.signal_id.clone(), entry);
        Ok(())
    }

    async fn purge(&self, now_ms: u64) -> Result<usize> {
        let mut map = self.entries.lock().map_err(|_| anyhow!("archive mutex poisoned"))?;
        let before = map.len();
        map.retain(|_, e| e.expires_ms > now_ms);
        Ok(before - map.len())
    }
}
