use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::{Ledger, OverrideRecord, RecordPayload, Verification};
use crate::bus::retry::RetryConfig;
use crate::bus::{publish_json, Bus, Topic, Topics};
use crate::error::ControlError;
use crate::logging::{log, obj, v_str, Domain, Level};

enum LedgerCommand {
    Append { payload: RecordPayload, reply: oneshot::Sender<Result<OverrideRecord, ControlError>> },
    Verify { reply: oneshot::Sender<Verification> },
    Truncate { cutoff_ms: u64, reply: oneshot::Sender<Result<usize, ControlError>> },
    Records { reply: oneshot::Sender<Vec<OverrideRecord>> },
}

/// Cloneable front of the single ledger writer task.
#[derive(Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<LedgerCommand>,
    corruption: watch::Receiver<Option<u64>>,
}

const STOPPED: ControlError = ControlError::Stopped("ledger_writer");

impl LedgerHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> LedgerCommand) -> Result<T, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| STOPPED)?;
        rx.await.map_err(|_| STOPPED)
    }

    /// Append and wait for the sealed record.
    pub async fn append(&self, payload: RecordPayload) -> Result<OverrideRecord, ControlError> {
        self.request(|reply| LedgerCommand::Append { payload, reply }).await?
    }

    pub async fn verify(&self) -> Result<Verification, ControlError> {
        self.request(|reply| LedgerCommand::Verify { reply }).await
    }

    pub async fn truncate_before(&self, cutoff_ms: u64) -> Result<usize, ControlError> {
        self.request(|reply| LedgerCommand::Truncate { cutoff_ms, reply }).await?
    }

    pub async fn records(&self) -> Result<Vec<OverrideRecord>, ControlError> {
        self.request(|reply| LedgerCommand::Records { reply }).await
    }

    /// Index of the first corrupted record once verification has failed.
    pub fn corruption(&self) -> watch::Receiver<Option<u64>> {
        self.corruption.clone()
    }
}

struct Writer {
    ledger: Ledger,
    bus: Arc<dyn Bus>,
    topic: String,
    retry: RetryConfig,
    corruption_tx: watch::Sender<Option<u64>>,
}

impl Writer {
    fn note_corruption(&self) {
        if let Some(at) = self.ledger.corrupted_at() {
            self.corruption_tx.send_if_modified(|cur| {
                if cur.is_none() {
                    *cur = Some(at);
                    true
                } else {
                    false
                }
            });
        }
    }

    async fn handle(&mut self, cmd: LedgerCommand) {
        match cmd {
            LedgerCommand::Append { payload, reply } => {
                let result = self.ledger.append(payload);
                if let Ok(record) = &result {
                    log(
                        Level::Debug,
                        Domain::Audit,
                        "appended",
                        obj(&[
                            ("index", json!(record.index)),
                            ("action", v_str(record.payload.action.as_str())),
                            ("actor", v_str(&record.payload.actor)),
                            ("record_hash", v_str(&record.record_hash)),
                        ]),
                    );
                    if let Err(err) = publish_json(self.bus.as_ref(), &self.retry, &self.topic, record).await {
                        log(Level::Error, Domain::Audit, "publish_failed", obj(&[("error", v_str(&err.to_string()))]));
                    }
                }
                let _ = reply.send(result);
            }
            LedgerCommand::Verify { reply } => {
                let result = self.ledger.verify_all();
                self.note_corruption();
                let _ = reply.send(result);
            }
            LedgerCommand::Truncate { cutoff_ms, reply } => {
                let _ = reply.send(self.ledger.truncate_before(cutoff_ms));
            }
            LedgerCommand::Records { reply } => {
                let _ = reply.send(self.ledger.records().to_vec());
            }
        }
    }
}

/// Start the writer. On shutdown it stops accepting commands, finishes the
/// ones already queued and syncs the file.
pub fn spawn_ledger_writer(
    ledger: Ledger,
    bus: Arc<dyn Bus>,
    topics: &Topics,
    retry: RetryConfig,
    capacity: usize,
    mut shutdown: watch::Receiver<bool>,
) -> (LedgerHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let (corruption_tx, corruption_rx) = watch::channel(None);
    let mut writer = Writer { ledger, bus, topic: topics.name(Topic::AuditAppend), retry, corruption_tx };
    writer.note_corruption();

    let task = tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => writer.handle(cmd).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        rx.close();
        let mut drained = 0u64;
        while let Some(cmd) = rx.recv().await {
            writer.handle(cmd).await;
            drained += 1;
        }
        if let Err(err) = writer.ledger.sync() {
            log(Level::Error, Domain::Audit, "sync_failed", obj(&[("error", v_str(&err.to_string()))]));
        }
        log(
            Level::Info,
            Domain::Audit,
            "writer_stopped",
            obj(&[("drained", json!(drained)), ("records", json!(writer.ledger.len()))]),
        );
    });

    (LedgerHandle { tx, corruption: corruption_rx }, task)
}
