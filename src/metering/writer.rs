use super::accounting::{self, ReconcileSummary};
use super::quota::{self, QuotaConfig, QuotaEvent};
use super::snapshot::PeerCounterSnapshot;
use super::store::CounterStore;
use super::PeerIdentity;
use crate::error::{MeterError, Result};
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread;
use tokio::sync::oneshot;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Operations the writer thread can perform.
pub enum WriteOp {
    Reconcile {
        snapshots: Vec<PeerCounterSnapshot>,
        today: NaiveDate,
        reply: Reply<ReconcileSummary>,
    },
    EvaluateQuota {
        peers: Vec<PeerIdentity>,
        config: QuotaConfig,
        reference: NaiveDate,
        reply: Reply<Vec<QuotaEvent>>,
    },
    ResetCompleted {
        month: String,
        reply: Reply<bool>,
    },
    CompleteReset {
        month: String,
        reply: Reply<usize>,
    },
    Shutdown,
}

/// Owner of the only read-write connection to the metering database.
///
/// Every mutation runs on the dedicated `meter-writer` thread, one operation
/// at a time, so read-modify-write sequences never interleave.
pub struct MeterWriter {
    sender: Mutex<Option<SyncSender<WriteOp>>>,
    join_handle: Mutex<Option<thread::JoinHandle<()>>>,
    db_path: PathBuf,
}

impl MeterWriter {
    /// Open (or create) the database at `db_path` and start the writer thread.
    pub fn open(db_path: &Path, queue_capacity: usize) -> Result<Self> {
        let store = CounterStore::open(db_path)?;
        let (tx, rx) = mpsc::sync_channel::<WriteOp>(queue_capacity.max(1));

        let handle = thread::Builder::new()
            .name("meter-writer".into())
            .spawn(move || writer_loop(store, rx))?;

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            join_handle: Mutex::new(Some(handle)),
            db_path: db_path.to_path_buf(),
        })
    }

    /// Path to the underlying database file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub async fn reconcile(
        &self,
        snapshots: Vec<PeerCounterSnapshot>,
        today: NaiveDate,
    ) -> Result<ReconcileSummary> {
        self.request(|reply| WriteOp::Reconcile {
            snapshots,
            today,
            reply,
        })
        .await
    }

    pub async fn evaluate_quota(
        &self,
        peers: Vec<PeerIdentity>,
        config: QuotaConfig,
        reference: NaiveDate,
    ) -> Result<Vec<QuotaEvent>> {
        self.request(|reply| WriteOp::EvaluateQuota {
            peers,
            config,
            reference,
            reply,
        })
        .await
    }

    /// Whether the monthly reset for `month` already ran, in this or an
    /// earlier process.
    pub async fn reset_completed(&self, month: String) -> Result<bool> {
        self.request(|reply| WriteOp::ResetCompleted { month, reply })
            .await
    }

    /// Record the reset for `month` and prune alerts of earlier months.
    pub async fn complete_reset(&self, month: String) -> Result<usize> {
        self.request(|reply| WriteOp::CompleteReset { month, reply })
            .await
    }

    async fn request<T>(&self, op: impl FnOnce(Reply<T>) -> WriteOp) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let guard = self.sender.lock();
            let Some(sender) = guard.as_ref() else {
                return Err(MeterError::WriterUnavailable("writer shut down".into()));
            };
            match sender.try_send(op(reply_tx)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    return Err(MeterError::WriterUnavailable("writer queue full".into()));
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(MeterError::WriterUnavailable("writer thread exited".into()));
                }
            }
        }
        reply_rx
            .await
            .map_err(|_| MeterError::WriterUnavailable("writer dropped the request".into()))?
    }

    /// Graceful shutdown: signal the writer thread and wait for it to finish.
    pub fn shutdown(&self) {
        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.try_send(WriteOp::Shutdown);
            // Dropping the sender disconnects the channel even if Shutdown
            // could not be queued.
            drop(sender);
        }
        if let Some(handle) = self.join_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MeterWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Writer thread main loop: one operation at a time, in arrival order.
fn writer_loop(store: CounterStore, rx: mpsc::Receiver<WriteOp>) {
    while let Ok(op) = rx.recv() {
        match op {
            WriteOp::Reconcile {
                snapshots,
                today,
                reply,
            } => {
                let result = accounting::reconcile(&store, &snapshots, today);
                if let Err(ref e) = result {
                    tracing::error!("metering reconcile failed: {e}");
                }
                let _ = reply.send(result);
            }
            WriteOp::EvaluateQuota {
                peers,
                config,
                reference,
                reply,
            } => {
                let result = quota::evaluate(&store, &peers, &config, reference);
                if let Err(ref e) = result {
                    tracing::error!("quota evaluation failed: {e}");
                }
                let _ = reply.send(result);
            }
            WriteOp::ResetCompleted { month, reply } => {
                let _ = reply.send(store.reset_completed(&month));
            }
            WriteOp::CompleteReset { month, reply } => {
                let reset_at = chrono::Utc::now().to_rfc3339();
                let _ = reply.send(store.complete_reset(&month, &reset_at));
            }
            WriteOp::Shutdown => break,
        }
    }
    tracing::debug!("meter writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering::PeerKey;
    use tempfile::TempDir;

    fn snap(key: &str, rx: u64) -> PeerCounterSnapshot {
        PeerCounterSnapshot {
            peer_key: PeerKey::new(key),
            endpoint: String::new(),
            allowed_ips: String::new(),
            last_handshake_epoch: 0,
            rx_bytes: rx,
            tx_bytes: 0,
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 10).unwrap()
    }

    #[tokio::test]
    async fn writer_reconciles_and_persists() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("traffic.db");
        let writer = MeterWriter::open(&path, 8).unwrap();
        let summary = writer.reconcile(vec![snap("a", 10), snap("b", 20)], today()).await.unwrap();
        assert_eq!(summary.peers, 2);
        drop(writer);

        let store = CounterStore::open(&path).unwrap();
        let counter = store.load_counter(&PeerKey::new("b")).unwrap().unwrap();
        assert_eq!(counter.last_seen_rx, 20);
    }

    #[tokio::test]
    async fn requests_after_shutdown_fail_cleanly() {
        let tmp = TempDir::new().unwrap();
        let writer = MeterWriter::open(&tmp.path().join("traffic.db"), 8).unwrap();
        writer.shutdown();
        let err = writer.reconcile(vec![snap("a", 1)], today()).await.unwrap_err();
        assert!(matches!(err, MeterError::WriterUnavailable(_)));
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("traffic.db");
        {
            let writer = MeterWriter::open(&path, 8).unwrap();
            writer.reconcile(vec![snap("a", 5_000)], today()).await.unwrap();
        }
        let writer = MeterWriter::open(&path, 8).unwrap();
        writer.reconcile(vec![snap("a", 100)], today()).await.unwrap();
        drop(writer);

        let store = CounterStore::open(&path).unwrap();
        let counter = store.load_counter(&PeerKey::new("a")).unwrap().unwrap();
        assert_eq!(counter.total_rx(), 5_100);
    }
}
