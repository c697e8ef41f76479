//! Push/pull reconciliation between local state and the remote store.
//!
//! `save_to_cloud` is a two-phase contract: the captured snapshot is written
//! to local storage first, so it survives regardless of network outcome, and
//! the remote push is a reconciliation phase whose failure is a reported
//! event. Conflicts are surfaced, never silently resolved.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::store::{LocalStore, NS_QUEUE, NS_STATE};

use super::assembler::SnapshotAssembler;
use super::model::{
    backoff_with_jitter, ConflictRecord, OperationKind, OperationRecord, OperationStatus, Snapshot,
};
use super::remote::{PushOutcome, RemoteError, RemoteStore, RetryClass};

/// What to do when a push comes back conflicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Return both sides to the caller; local state and version untouched.
    #[default]
    Surface,
    /// Fetch the remote state and restore it locally.
    PreferRemote,
    /// Re-push the local snapshot with force.
    PreferLocal,
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub conflict_policy: ConflictPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            conflict_policy: ConflictPolicy::Surface,
        }
    }
}

/// Save pipeline state, published for UI consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Capturing,
    Pushing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaveOptions {
    /// Push regardless of the version token (used to resolve a conflict in
    /// favor of local state).
    pub force: bool,
    /// Suppress info-level logging for background periodic saves.
    pub silent: bool,
}

/// Result of `save_to_cloud`. `success` means the remote store accepted the
/// push; `queued` means the push is parked durably for a later drain (the
/// local copy is safe either way).
#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    pub success: bool,
    pub queued: bool,
    pub conflicts: Vec<ConflictRecord>,
    pub error: Option<String>,
}

/// Where `restore_from_cloud` found state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSource {
    Remote,
    LocalCache,
    /// Brand-new user: nothing anywhere, and that is not an error.
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreFromCloudOutcome {
    pub success: bool,
    pub source: RestoreSource,
    pub snapshot: Option<Snapshot>,
    pub errors: Vec<String>,
}

/// Queue drain report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueReport {
    /// Operations confirmed by the remote store and removed.
    pub processed: usize,
    /// Operations dropped from the retry path and reported as failed.
    pub failed: usize,
    /// Operations that failed transiently and stay queued.
    pub retried: usize,
}

/// Top-level reconciliation loop for one user session.
pub struct SyncOrchestrator {
    remote: Arc<dyn RemoteStore>,
    store: Arc<dyn LocalStore>,
    assembler: Arc<SnapshotAssembler>,
    config: OrchestratorConfig,
    online: watch::Receiver<bool>,
    phase: watch::Sender<SyncPhase>,
    draining: watch::Sender<bool>,
    failures: mpsc::UnboundedSender<OperationRecord>,
}

impl SyncOrchestrator {
    /// Returns the orchestrator and the receiving end of its failure
    /// channel; permanently dropped operations are reported there.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn LocalStore>,
        assembler: Arc<SnapshotAssembler>,
        online: watch::Receiver<bool>,
        config: OrchestratorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<OperationRecord>) {
        let (failures, failure_rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(SyncPhase::Idle);
        let (draining, _) = watch::channel(false);
        (
            Self {
                remote,
                store,
                assembler,
                config,
                online,
                phase,
                draining,
                failures,
            },
            failure_rx,
        )
    }

    pub fn phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub fn draining(&self) -> watch::Receiver<bool> {
        self.draining.subscribe()
    }

    fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Capture, persist locally, then push. Offline or exhausted retries
    /// queue the push durably instead of discarding it.
    pub async fn save_to_cloud(&self, user_id: &str, options: SaveOptions) -> SaveOutcome {
        self.phase.send_replace(SyncPhase::Capturing);
        let mut snapshot = self.assembler.capture(user_id).await;
        snapshot.version = self.load_local(user_id).and_then(|prior| prior.version);

        // Durable-first: the local copy survives whatever the network does.
        self.store_local(user_id, &snapshot);

        if !self.is_online() {
            let queued = self.enqueue_snapshot_push(user_id, &snapshot);
            self.phase.send_replace(SyncPhase::Idle);
            if !options.silent {
                info!("[Sync] Offline; snapshot for {} saved locally and queued", user_id);
            }
            return SaveOutcome {
                success: false,
                queued,
                conflicts: Vec::new(),
                error: None,
            };
        }

        self.phase.send_replace(SyncPhase::Pushing);
        let outcome = match self.push_with_retry(user_id, &snapshot, options.force).await {
            Ok(PushOutcome::Accepted(version)) => {
                snapshot.version = Some(version.clone());
                self.store_local(user_id, &snapshot);
                if !options.silent {
                    info!("[Sync] Snapshot for {} accepted at version {}", user_id, version);
                }
                SaveOutcome {
                    success: true,
                    queued: false,
                    conflicts: Vec::new(),
                    error: None,
                }
            }
            Ok(PushOutcome::Conflicted(conflicts)) => {
                warn!(
                    "[Sync] Push for {} conflicted on {} entities",
                    user_id,
                    conflicts.len()
                );
                self.resolve_conflicts(user_id, &snapshot, conflicts).await
            }
            Err(err) => {
                warn!(
                    "[Sync] Push for {} failed after retries, queueing: {}",
                    user_id, err
                );
                let queued = self.enqueue_snapshot_push(user_id, &snapshot);
                SaveOutcome {
                    success: false,
                    queued,
                    conflicts: Vec::new(),
                    error: Some(err.to_string()),
                }
            }
        };
        self.phase.send_replace(SyncPhase::Idle);
        outcome
    }

    /// Applies the configured conflict policy. `Surface` leaves the locally
    /// stored snapshot and version untouched for the caller to resolve.
    async fn resolve_conflicts(
        &self,
        user_id: &str,
        snapshot: &Snapshot,
        conflicts: Vec<ConflictRecord>,
    ) -> SaveOutcome {
        match self.config.conflict_policy {
            ConflictPolicy::Surface => SaveOutcome {
                success: false,
                queued: false,
                conflicts,
                error: None,
            },
            ConflictPolicy::PreferRemote => {
                let restore = self.restore_from_cloud(user_id).await;
                SaveOutcome {
                    success: restore.success && restore.source == RestoreSource::Remote,
                    queued: false,
                    conflicts,
                    error: restore.errors.first().cloned(),
                }
            }
            ConflictPolicy::PreferLocal => {
                match self.push_with_retry(user_id, snapshot, true).await {
                    Ok(PushOutcome::Accepted(version)) => {
                        let mut accepted = snapshot.clone();
                        accepted.version = Some(version);
                        self.store_local(user_id, &accepted);
                        SaveOutcome {
                            success: true,
                            queued: false,
                            conflicts,
                            error: None,
                        }
                    }
                    Ok(PushOutcome::Conflicted(_)) => SaveOutcome {
                        success: false,
                        queued: false,
                        conflicts,
                        error: Some("forced push still conflicted".to_string()),
                    },
                    Err(err) => {
                        let queued = self.enqueue_snapshot_push(user_id, snapshot);
                        SaveOutcome {
                            success: false,
                            queued,
                            conflicts,
                            error: Some(err.to_string()),
                        }
                    }
                }
            }
        }
    }

    /// Latest remote state when reachable, else the cached local snapshot,
    /// else an empty success for a brand-new user.
    pub async fn restore_from_cloud(&self, user_id: &str) -> RestoreFromCloudOutcome {
        if self.is_online() {
            match self.remote.fetch_latest(user_id).await {
                Ok(Some(latest)) => {
                    let applied = self.assembler.restore(user_id, &latest.snapshot).await;
                    let mut snapshot = latest.snapshot;
                    snapshot.version = Some(latest.version);
                    self.store_local(user_id, &snapshot);
                    return RestoreFromCloudOutcome {
                        success: applied.restored,
                        source: RestoreSource::Remote,
                        snapshot: Some(snapshot),
                        errors: applied.errors,
                    };
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        "[Sync] Remote fetch for {} failed, falling back to cache: {}",
                        user_id, err
                    );
                }
            }
        }

        if let Some(snapshot) = self.load_local(user_id) {
            return RestoreFromCloudOutcome {
                success: true,
                source: RestoreSource::LocalCache,
                snapshot: Some(snapshot),
                errors: Vec::new(),
            };
        }

        RestoreFromCloudOutcome {
            success: true,
            source: RestoreSource::Empty,
            snapshot: None,
            errors: Vec::new(),
        }
    }

    /// Drains pending operations oldest-first: removes on success, bumps the
    /// retry count on transient failure, and drops (while reporting) any
    /// operation past the retry budget or failing permanently.
    pub async fn process_sync_queue(&self, user_id: &str) -> QueueReport {
        self.draining.send_replace(true);
        let report = self.drain_queue(user_id).await;
        self.draining.send_replace(false);
        report
    }

    async fn drain_queue(&self, user_id: &str) -> QueueReport {
        let mut report = QueueReport::default();
        let entries = match self.store.list(NS_QUEUE) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("[Sync] Could not enumerate queue: {}", err);
                return report;
            }
        };

        let mut records: Vec<OperationRecord> = entries
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_value(value) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!("[Sync] Dropping unreadable queue entry {}: {}", key, err);
                    None
                }
            })
            .filter(|record: &OperationRecord| {
                record.user_id == user_id && record.status == OperationStatus::Pending
            })
            .collect();
        // UUIDv7 ids sort by creation time; created_at is the primary order.
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        for mut record in records {
            let result = self.attempt_operation(&record).await;
            match result {
                Ok(()) => {
                    if let Err(err) = self.store.delete(NS_QUEUE, &record.id) {
                        warn!("[Sync] Failed to clear drained op={}: {}", record.id, err);
                    }
                    debug!("[Sync] Drained op={} ({:?})", record.id, record.op);
                    report.processed += 1;
                }
                Err(err) => {
                    record.retry_count += 1;
                    record.last_error = Some(err.to_string());
                    let exhausted = record.retry_count > self.config.max_retries;
                    let permanent = err.retry_class() == RetryClass::Permanent;
                    if exhausted || permanent {
                        warn!(
                            "[Sync] Dropping op={} after {} attempts: {}",
                            record.id, record.retry_count, err
                        );
                        record.status = OperationStatus::Dead;
                        self.persist_record(&record);
                        let _ = self.failures.send(record);
                        report.failed += 1;
                    } else {
                        self.persist_record(&record);
                        report.retried += 1;
                    }
                }
            }
        }
        report
    }

    async fn attempt_operation(&self, record: &OperationRecord) -> Result<(), RemoteError> {
        match record.op {
            OperationKind::EntityWrite => {
                let Some(key) = record.key.as_ref() else {
                    // Malformed; treat as permanent so it is reported, not retried.
                    return Err(RemoteError::api(400, "entity write without key"));
                };
                self.remote.upsert(&record.user_id, key, &record.payload).await
            }
            OperationKind::SnapshotPush => {
                let snapshot: Snapshot = serde_json::from_value(record.payload.clone())
                    .map_err(|err| RemoteError::api(400, format!("unreadable snapshot: {err}")))?;
                match self
                    .remote
                    .push_snapshot(&record.user_id, &snapshot, snapshot.version.as_ref(), false)
                    .await?
                {
                    PushOutcome::Accepted(version) => {
                        let mut accepted = snapshot;
                        accepted.version = Some(version);
                        self.store_local(&record.user_id, &accepted);
                        Ok(())
                    }
                    // A queued push that conflicts needs a caller decision;
                    // surfaced through the failure channel, payload intact.
                    PushOutcome::Conflicted(conflicts) => Err(RemoteError::api(
                        409,
                        format!("version conflict on {} entities", conflicts.len()),
                    )),
                }
            }
        }
    }

    /// Background task draining the queue whenever connectivity transitions
    /// offline -> online.
    pub fn spawn_reconnect_drain(self: &Arc<Self>, user_id: String) -> tokio::task::JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut online = orchestrator.online.clone();
        // Baseline read before the task is scheduled; a transition racing the
        // spawn still registers as offline -> online on the first poll.
        let mut was_online = *online.borrow();
        tokio::spawn(async move {
            while online.changed().await.is_ok() {
                let now_online = *online.borrow();
                if now_online && !was_online {
                    info!("[Sync] Back online; draining queue for {}", user_id);
                    let report = orchestrator.process_sync_queue(&user_id).await;
                    debug!(
                        "[Sync] Reconnect drain for {}: processed={} failed={} retried={}",
                        user_id, report.processed, report.failed, report.retried
                    );
                }
                was_online = now_online;
            }
        })
    }

    /// Optional follower re-fetching remote state on change notifications.
    /// Shortens the multi-device divergence window; correctness never
    /// depends on a notification arriving.
    pub fn spawn_remote_follower(
        self: &Arc<Self>,
        user_id: String,
        mut notify: mpsc::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            while notify.recv().await.is_some() {
                let outcome = orchestrator.restore_from_cloud(&user_id).await;
                debug!(
                    "[Sync] Remote change follow for {}: source={:?} success={}",
                    user_id, outcome.source, outcome.success
                );
            }
        })
    }

    async fn push_with_retry(
        &self,
        user_id: &str,
        snapshot: &Snapshot,
        force: bool,
    ) -> Result<PushOutcome, RemoteError> {
        let mut attempt: u32 = 0;
        loop {
            match self
                .remote
                .push_snapshot(user_id, snapshot, snapshot.version.as_ref(), force)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    if err.retry_class() == RetryClass::Retryable
                        && attempt < self.config.max_retries
                    {
                        let delay = backoff_with_jitter(
                            attempt,
                            self.config.backoff_base,
                            self.config.backoff_cap,
                        );
                        attempt += 1;
                        debug!(
                            "[Sync] Push retry {}/{} for {} in {:?}: {}",
                            attempt, self.config.max_retries, user_id, delay, err
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    fn enqueue_snapshot_push(&self, user_id: &str, snapshot: &Snapshot) -> bool {
        if !self.store.is_available() {
            warn!("[Sync] Local storage unavailable; cannot queue snapshot push");
            return false;
        }
        let payload = match serde_json::to_value(snapshot) {
            Ok(value) => value,
            Err(err) => {
                warn!("[Sync] Could not serialize snapshot for queueing: {}", err);
                return false;
            }
        };
        let record =
            OperationRecord::snapshot_push(Uuid::now_v7().to_string(), user_id, payload);
        self.persist_record(&record);
        debug!(
            "[Sync] Queued snapshot push op={} for {} ({} entries)",
            record.id,
            user_id,
            snapshot.entry_count()
        );
        true
    }

    fn persist_record(&self, record: &OperationRecord) {
        match serde_json::to_value(record) {
            Ok(value) => {
                if let Err(err) = self.store.put(NS_QUEUE, &record.id, &value) {
                    warn!("[Sync] Failed to persist op={}: {}", record.id, err);
                }
            }
            Err(err) => warn!("[Sync] Failed to serialize op={}: {}", record.id, err),
        }
    }

    fn load_local(&self, user_id: &str) -> Option<Snapshot> {
        match self.store.get(NS_STATE, user_id) {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    warn!("[Sync] Unreadable cached snapshot for {}: {}", user_id, err);
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!("[Sync] Could not read cached snapshot for {}: {}", user_id, err);
                None
            }
        }
    }

    fn store_local(&self, user_id: &str, snapshot: &Snapshot) {
        let mut snapshot = snapshot.clone();
        if snapshot.captured_at.is_empty() {
            snapshot.captured_at = Utc::now().to_rfc3339();
        }
        match serde_json::to_value(&snapshot) {
            Ok(value) => {
                if let Err(err) = self.store.put(NS_STATE, user_id, &value) {
                    warn!("[Sync] Failed to cache snapshot for {}: {}", user_id, err);
                }
            }
            Err(err) => warn!("[Sync] Failed to serialize snapshot for {}: {}", user_id, err),
        }
    }
}
