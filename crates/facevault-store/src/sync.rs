//! Remote Sync Adapter: best-effort replication on a dedicated worker.
//!
//! Local writes commit first and return to the caller; the matching remote
//! operation is queued here as a [`SyncTask`] and executed FIFO by the worker
//! thread. Outcomes are kept in a shared log (pending and failed tasks) that
//! callers and tests can inspect. Failed tasks are never retried unless
//! [`ReplicatorHandle::retry_failed`] is called.

use crate::remote::{RemoteError, RemoteStore};
use facevault_core::{now_millis, Embedding, RegistryRecord, Timestamp};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Upper bound on remembered failures; the oldest are dropped first.
pub const MAX_FAILED: usize = 1024;

/// Remote side effect of a local write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", content = "target", rename_all = "camelCase")]
pub enum SyncOp {
    PushEmbedding(Embedding),
    PushRecord(RegistryRecord),
    DeleteEmbedding(String),
    DeleteRecord(String),
}

impl SyncOp {
    pub fn identity_id(&self) -> &str {
        match self {
            SyncOp::PushEmbedding(e) => &e.identity_id,
            SyncOp::PushRecord(r) => &r.identity_id,
            SyncOp::DeleteEmbedding(id) | SyncOp::DeleteRecord(id) => id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SyncOp::PushEmbedding(_) => "push_embedding",
            SyncOp::PushRecord(_) => "push_record",
            SyncOp::DeleteEmbedding(_) => "delete_embedding",
            SyncOp::DeleteRecord(_) => "delete_record",
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, SyncOp::DeleteEmbedding(_) | SyncOp::DeleteRecord(_))
    }

    /// Whether `other` targets the same remote document the same way.
    fn supersedes(&self, other: &SyncOp) -> bool {
        self.label() == other.label() && self.identity_id() == other.identity_id()
    }

    fn apply(&self, remote: &mut dyn RemoteStore) -> Result<(), RemoteError> {
        match self {
            SyncOp::PushEmbedding(e) => remote.push_embedding(e),
            SyncOp::PushRecord(r) => remote.push_record(r),
            SyncOp::DeleteEmbedding(id) => remote.delete_embedding(id),
            SyncOp::DeleteRecord(id) => remote.delete_record(id),
        }
    }
}

/// A queued replication step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTask {
    pub id: Uuid,
    #[serde(flatten)]
    pub op: SyncOp,
    pub enqueued_at: Timestamp,
}

/// A replication step the remote rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedSync {
    pub task: SyncTask,
    pub error: String,
    pub failed_at: Timestamp,
}

#[derive(Default)]
struct SyncLog {
    pending: VecDeque<SyncTask>,
    failed: VecDeque<FailedSync>,
    completed: u64,
}

impl SyncLog {
    /// Record a failure, replacing any older failure for the same document.
    fn push_failed(&mut self, entry: FailedSync) {
        self.failed.retain(|f| !entry.task.op.supersedes(&f.task.op));
        if self.failed.len() == MAX_FAILED {
            self.failed.pop_front();
        }
        self.failed.push_back(entry);
    }

    /// A later success makes older failures for the same document moot.
    fn clear_failed(&mut self, op: &SyncOp) {
        self.failed.retain(|f| !op.supersedes(&f.task.op));
    }
}

/// Messages sent from store components to the worker thread.
enum SyncRequest {
    Replicate(SyncTask),
    PullEmbedding {
        identity_id: String,
        reply: oneshot::Sender<Result<Option<Embedding>, RemoteError>>,
    },
    PullRecords {
        reply: oneshot::Sender<Result<HashMap<String, RegistryRecord>, RemoteError>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the replication worker.
#[derive(Clone)]
pub struct ReplicatorHandle {
    tx: Option<mpsc::UnboundedSender<SyncRequest>>,
    log: Arc<Mutex<SyncLog>>,
    remote: Option<String>,
}

impl ReplicatorHandle {
    /// Handle for a store with no remote tier. Pulls report [`RemoteError::Disabled`].
    pub fn disabled() -> Self {
        Self {
            tx: None,
            log: Arc::default(),
            remote: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Description of the remote tier, if any.
    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    /// Queue `op` for the worker. Never blocks and never fails.
    pub fn enqueue(&self, op: SyncOp) {
        let Some(tx) = &self.tx else {
            tracing::trace!(op = op.label(), "no remote tier; replication skipped");
            return;
        };

        let task = SyncTask {
            id: Uuid::new_v4(),
            op,
            enqueued_at: now_millis(),
        };
        self.log().pending.push_back(task.clone());

        if let Err(mpsc::error::SendError(SyncRequest::Replicate(task))) =
            tx.send(SyncRequest::Replicate(task))
        {
            tracing::warn!(op = task.op.label(), identity = task.op.identity_id(), "replication worker gone; task dropped");
            let mut log = self.log();
            log.pending.retain(|t| t.id != task.id);
            log.push_failed(FailedSync {
                error: RemoteError::ChannelClosed.to_string(),
                task,
                failed_at: now_millis(),
            });
        }
    }

    /// Fetch one embedding from the remote tier.
    ///
    /// Ordered after every task queued before the call.
    pub async fn pull_embedding(&self, identity_id: &str) -> Result<Option<Embedding>, RemoteError> {
        let tx = self.tx.as_ref().ok_or(RemoteError::Disabled)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(SyncRequest::PullEmbedding {
            identity_id: identity_id.to_string(),
            reply: reply_tx,
        })
        .map_err(|_| RemoteError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RemoteError::ChannelClosed)?
    }

    /// Fetch every registry record from the remote tier.
    pub async fn pull_records(&self) -> Result<HashMap<String, RegistryRecord>, RemoteError> {
        let tx = self.tx.as_ref().ok_or(RemoteError::Disabled)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(SyncRequest::PullRecords { reply: reply_tx })
            .map_err(|_| RemoteError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RemoteError::ChannelClosed)?
    }

    /// Wait until every task queued before this call has been attempted.
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send(SyncRequest::Flush { reply: reply_tx }).is_ok() {
            let _ = reply_rx.await;
        }
    }

    /// Tasks queued but not yet attempted (oldest first).
    pub fn pending(&self) -> Vec<SyncTask> {
        self.log().pending.iter().cloned().collect()
    }

    /// Tasks the remote rejected (oldest first), at most one per document
    /// and operation.
    pub fn failed(&self) -> Vec<FailedSync> {
        self.log().failed.iter().cloned().collect()
    }

    pub fn completed(&self) -> u64 {
        self.log().completed
    }

    /// Re-queue every failed task. Returns how many were re-queued.
    pub fn retry_failed(&self) -> usize {
        let failed = std::mem::take(&mut self.log().failed);
        let count = failed.len();
        for entry in failed {
            self.enqueue(entry.task.op);
        }
        if count > 0 {
            tracing::info!(count, "re-queued failed replication tasks");
        }
        count
    }

    fn log(&self) -> MutexGuard<'_, SyncLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Spawn the replication worker on a dedicated OS thread.
///
/// The worker exits once every [`ReplicatorHandle`] clone is dropped.
pub fn spawn_replicator<R: RemoteStore>(mut remote: R) -> std::io::Result<ReplicatorHandle> {
    let description = remote.describe();
    let log: Arc<Mutex<SyncLog>> = Arc::default();
    let worker_log = Arc::clone(&log);
    let (tx, mut rx) = mpsc::unbounded_channel::<SyncRequest>();

    std::thread::Builder::new()
        .name("facevault-sync".into())
        .spawn(move || {
            tracing::info!("replication worker started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    SyncRequest::Replicate(task) => {
                        let result = task.op.apply(&mut remote);
                        record_outcome(&worker_log, task, result);
                    }
                    SyncRequest::PullEmbedding { identity_id, reply } => {
                        let _ = reply.send(remote.pull_embedding(&identity_id));
                    }
                    SyncRequest::PullRecords { reply } => {
                        let _ = reply.send(remote.pull_records());
                    }
                    SyncRequest::Flush { reply } => {
                        let _ = reply.send(());
                    }
                }
            }
            tracing::info!("replication worker exiting");
        })?;

    tracing::info!(remote = %description, "remote replication enabled");
    Ok(ReplicatorHandle {
        tx: Some(tx),
        log,
        remote: Some(description),
    })
}

fn record_outcome(log: &Mutex<SyncLog>, task: SyncTask, result: Result<(), RemoteError>) {
    let mut log = log.lock().unwrap_or_else(|e| e.into_inner());
    log.pending.retain(|t| t.id != task.id);

    match result {
        Ok(()) => {
            log.completed += 1;
            log.clear_failed(&task.op);
            tracing::debug!(op = task.op.label(), identity = task.op.identity_id(), "replicated");
        }
        Err(err) => {
            if task.op.is_delete() {
                tracing::warn!(
                    op = task.op.label(),
                    identity = task.op.identity_id(),
                    error = %err,
                    "partial deletion: removed locally but remote copy may remain"
                );
            } else {
                tracing::warn!(
                    op = task.op.label(),
                    identity = task.op.identity_id(),
                    error = %err,
                    "remote replication failed; local copy remains authoritative"
                );
            }
            log.push_failed(FailedSync {
                task,
                error: err.to_string(),
                failed_at: now_millis(),
            });
        }
    }
}
