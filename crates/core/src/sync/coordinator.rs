//! Debounced per-entity write coordination.
//!
//! Converts bursty write intents for the same `(entity_kind, entity_id)` key
//! into a single eventual remote write. Each key moves through an explicit
//! state machine: `Idle -> Pending(timer) -> InFlight -> Idle`. Writes for
//! different keys run fully in parallel; writes for the same key are
//! serialized on that key's execution lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::store::{LocalStore, NS_QUEUE};

use super::model::{
    backoff_with_jitter, merge_payloads, EntityKey, OperationRecord, OperationStatus,
};
use super::remote::{RemoteStore, RetryClass};

/// Tuning for debounce and retry behavior.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Window during which repeated intents for one key are merged.
    pub debounce: Duration,
    /// Retries after the first failed attempt before an operation is dead.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            max_retries: 3,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(8),
        }
    }
}

/// Result of one caller-visible write intent. Expected failures land here,
/// never as panics or errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub success: bool,
    pub operation_id: String,
    pub error: Option<String>,
}

/// A write intent sitting in the debounce window, merged in place as new
/// intents for the same key arrive.
struct PendingWrite {
    operation_id: String,
    user_id: String,
    payload: serde_json::Value,
    created_at: String,
    waiters: Vec<oneshot::Sender<WriteOutcome>>,
}

struct KeyState {
    /// Serializes remote writes for this key.
    exec_lock: Arc<AsyncMutex<()>>,
    pending: Option<PendingWrite>,
    /// Bumped on every intent and never reset, even when a pending is
    /// cancelled and a new one starts. A timer task whose epoch no longer
    /// matches was superseded and must not fire.
    epoch: u64,
}

impl KeyState {
    fn new() -> Self {
        Self {
            exec_lock: Arc::new(AsyncMutex::new(())),
            pending: None,
            epoch: 0,
        }
    }
}

struct Inner {
    remote: Arc<dyn RemoteStore>,
    store: Arc<dyn LocalStore>,
    config: CoordinatorConfig,
    keys: Mutex<HashMap<EntityKey, KeyState>>,
    failures: mpsc::UnboundedSender<OperationRecord>,
    /// Checked once at construction; when false, durable queueing is skipped
    /// and the coordinator still debounces and writes.
    durable: bool,
}

/// Explicitly constructed write service owning its own queue and backoff
/// state; inject one per session.
#[derive(Clone)]
pub struct WriteCoordinator {
    inner: Arc<Inner>,
}

impl WriteCoordinator {
    /// Returns the coordinator and the receiving end of its failure channel.
    /// Every permanently failed operation is reported there exactly once.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn LocalStore>,
        config: CoordinatorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<OperationRecord>) {
        let (failures, failure_rx) = mpsc::unbounded_channel();
        let durable = store.is_available();
        if !durable {
            warn!("[Coordinator] Local storage unavailable; offline queueing disabled");
        } else {
            reclaim_stranded(store.as_ref());
        }
        (
            Self {
                inner: Arc::new(Inner {
                    remote,
                    store,
                    config,
                    keys: Mutex::new(HashMap::new()),
                    failures,
                    durable,
                }),
            },
            failure_rx,
        )
    }

    /// Merge `payload` into the key's pending write (newest fields win),
    /// restart the key's debounce timer, and resolve once the eventually
    /// executed write completes or permanently fails.
    pub async fn queue_write(
        &self,
        user_id: &str,
        key: EntityKey,
        payload: serde_json::Value,
    ) -> WriteOutcome {
        let (rx, operation_id, epoch) = {
            let mut keys = lock_keys(&self.inner.keys);
            let state = keys.entry(key.clone()).or_insert_with(KeyState::new);
            let (tx, rx) = oneshot::channel();
            state.epoch += 1;

            let operation_id = match state.pending.as_mut() {
                Some(pending) => {
                    pending.payload = merge_payloads(&pending.payload, &payload);
                    pending.waiters.push(tx);
                    pending.operation_id.clone()
                }
                None => {
                    let pending = PendingWrite {
                        operation_id: Uuid::now_v7().to_string(),
                        user_id: user_id.to_string(),
                        payload,
                        created_at: Utc::now().to_rfc3339(),
                        waiters: vec![tx],
                    };
                    let id = pending.operation_id.clone();
                    state.pending = Some(pending);
                    id
                }
            };
            (rx, operation_id, state.epoch)
        };

        debug!(
            "[Coordinator] Queued write op={} key={} epoch={}",
            operation_id, key, epoch
        );

        let inner = Arc::clone(&self.inner);
        let timer_key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.debounce).await;
            inner.fire_if_current(timer_key, epoch).await;
        });

        rx.await.unwrap_or_else(|_| WriteOutcome {
            success: false,
            operation_id,
            error: Some("write task dropped".to_string()),
        })
    }

    /// Cancel any pending debounce for the key and write now, bypassing the
    /// queue. The cancelled pending payload is folded underneath the
    /// immediate one so no fields are lost; the immediate fields win.
    pub async fn write_immediate(
        &self,
        user_id: &str,
        key: EntityKey,
        payload: serde_json::Value,
    ) -> WriteOutcome {
        let (cancelled, exec_lock) = {
            let mut keys = lock_keys(&self.inner.keys);
            let state = keys.entry(key.clone()).or_insert_with(KeyState::new);
            (state.pending.take(), Arc::clone(&state.exec_lock))
        };

        let (operation_id, created_at, merged, waiters) = match cancelled {
            Some(pending) => {
                debug!(
                    "[Coordinator] Immediate write cancels pending op={} key={}",
                    pending.operation_id, key
                );
                (
                    pending.operation_id,
                    pending.created_at,
                    merge_payloads(&pending.payload, &payload),
                    pending.waiters,
                )
            }
            None => (
                Uuid::now_v7().to_string(),
                Utc::now().to_rfc3339(),
                payload,
                Vec::new(),
            ),
        };

        let mut record = OperationRecord::entity_write(
            operation_id,
            user_id.to_string(),
            key.clone(),
            merged,
        );
        record.created_at = created_at;

        let guard = exec_lock.lock().await;
        let outcome = self.inner.write_with_retry(&key, record).await;
        drop(guard);

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        outcome
    }
}

impl Inner {
    /// Timer callback: fires the key's pending write if this timer is still
    /// the current one, then executes under the key's lock.
    async fn fire_if_current(self: Arc<Self>, key: EntityKey, epoch: u64) {
        let fired = {
            let mut keys = lock_keys(&self.keys);
            let Some(state) = keys.get_mut(&key) else {
                return;
            };
            if state.epoch == epoch {
                state
                    .pending
                    .take()
                    .map(|p| (p, Arc::clone(&state.exec_lock)))
            } else {
                // Superseded by a newer intent or an immediate write.
                None
            }
        };

        let Some((pending, exec_lock)) = fired else {
            return;
        };
        let record = pending_record(&pending, &key);
        let waiters = pending.waiters;

        let guard = exec_lock.lock().await;
        let outcome = self.write_with_retry(&key, record).await;
        drop(guard);

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// One remote write with the configured retry budget. Exhaustion or a
    /// permanent failure marks the durable record dead and reports it on the
    /// failure channel; the payload stays recoverable.
    async fn write_with_retry(&self, key: &EntityKey, mut record: OperationRecord) -> WriteOutcome {
        let Some(record_key) = record.key.clone() else {
            // Coordinator records always carry a key.
            return WriteOutcome {
                success: false,
                operation_id: record.id,
                error: Some("operation record missing entity key".to_string()),
            };
        };
        // Persisted InFlight for the whole attempt so a concurrent queue
        // drain never races this write for the same key.
        record.status = OperationStatus::InFlight;
        self.persist_record(&record);

        loop {
            match self
                .remote
                .upsert(&record.user_id, &record_key, &record.payload)
                .await
            {
                Ok(()) => {
                    if self.durable {
                        if let Err(err) = self.store.delete(NS_QUEUE, &record.id) {
                            warn!(
                                "[Coordinator] Failed to clear queued op={}: {}",
                                record.id, err
                            );
                        }
                    }
                    debug!("[Coordinator] Write applied op={} key={}", record.id, key);
                    return WriteOutcome {
                        success: true,
                        operation_id: record.id,
                        error: None,
                    };
                }
                Err(err) => {
                    let retryable = err.retry_class() == RetryClass::Retryable;
                    if retryable && record.retry_count < self.config.max_retries {
                        let delay = backoff_with_jitter(
                            record.retry_count,
                            self.config.backoff_base,
                            self.config.backoff_cap,
                        );
                        record.retry_count += 1;
                        record.last_error = Some(err.to_string());
                        self.persist_record(&record);
                        debug!(
                            "[Coordinator] Write retry {}/{} op={} key={} in {:?}: {}",
                            record.retry_count, self.config.max_retries, record.id, key, delay, err
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    warn!(
                        "[Coordinator] Write permanently failed op={} key={} after {} retries: {}",
                        record.id, key, record.retry_count, err
                    );
                    record.status = OperationStatus::Dead;
                    record.last_error = Some(err.to_string());
                    self.persist_record(&record);
                    let outcome = WriteOutcome {
                        success: false,
                        operation_id: record.id.clone(),
                        error: Some(err.to_string()),
                    };
                    let _ = self.failures.send(record);
                    return outcome;
                }
            }
        }
    }

    fn persist_record(&self, record: &OperationRecord) {
        if !self.durable {
            return;
        }
        match serde_json::to_value(record) {
            Ok(value) => {
                if let Err(err) = self.store.put(NS_QUEUE, &record.id, &value) {
                    warn!(
                        "[Coordinator] Failed to persist op={}: {}",
                        record.id, err
                    );
                }
            }
            Err(err) => warn!(
                "[Coordinator] Failed to serialize op={}: {}",
                record.id, err
            ),
        }
    }
}

/// A record left `InFlight` by a previous session had no writer alive to
/// finish it; put it back on the drain path.
fn reclaim_stranded(store: &dyn LocalStore) {
    let entries = match store.list(NS_QUEUE) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("[Coordinator] Could not scan queue for stranded ops: {}", err);
            return;
        }
    };
    for (key, value) in entries {
        let Ok(mut record) = serde_json::from_value::<OperationRecord>(value) else {
            continue;
        };
        if record.status != OperationStatus::InFlight {
            continue;
        }
        record.status = OperationStatus::Pending;
        match serde_json::to_value(&record) {
            Ok(value) => {
                if let Err(err) = store.put(NS_QUEUE, &key, &value) {
                    warn!("[Coordinator] Failed to re-queue stranded op={}: {}", record.id, err);
                } else {
                    debug!("[Coordinator] Re-queued stranded op={}", record.id);
                }
            }
            Err(err) => warn!("[Coordinator] Failed to serialize stranded op={}: {}", record.id, err),
        }
    }
}

fn pending_record(pending: &PendingWrite, key: &EntityKey) -> OperationRecord {
    let mut record = OperationRecord::entity_write(
        pending.operation_id.clone(),
        pending.user_id.clone(),
        key.clone(),
        pending.payload.clone(),
    );
    record.created_at = pending.created_at.clone();
    record
}

fn lock_keys(keys: &Mutex<HashMap<EntityKey, KeyState>>) -> std::sync::MutexGuard<'_, HashMap<EntityKey, KeyState>> {
    keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
