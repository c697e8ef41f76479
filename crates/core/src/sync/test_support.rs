//! In-memory doubles shared by the sync service tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

use crate::errors::{Error, Result};
use crate::store::LocalStore;

use super::assembler::SnapshotSource;
use super::model::{EntityKey, Snapshot, VersionToken};
use super::remote::{PushOutcome, RemoteError, RemoteLatest, RemoteStore};

struct StoredEntry {
    value: Value,
    seq: u64,
    expires_at: Option<Instant>,
}

/// `LocalStore` over a plain map. Expiry uses the tokio clock so paused-time
/// tests control it.
pub struct MemoryStore {
    entries: StdMutex<HashMap<String, BTreeMap<String, StoredEntry>>>,
    seq: AtomicU64,
    available: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            available: true,
        }
    }

    /// Simulates storage that failed to open.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    fn insert(&self, namespace: &str, key: &str, value: &Value, expires_at: Option<Instant>) {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(namespace.to_string()).or_default().insert(
            key.to_string(),
            StoredEntry {
                value: value.clone(),
                seq: self.seq.fetch_add(1, Ordering::SeqCst),
                expires_at,
            },
        );
    }

    fn expired(entry: &StoredEntry) -> bool {
        entry.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl LocalStore for MemoryStore {
    fn is_available(&self) -> bool {
        self.available
    }

    fn put(&self, namespace: &str, key: &str, value: &Value) -> Result<()> {
        if self.available {
            self.insert(namespace, key, value, None);
        }
        Ok(())
    }

    fn put_with_ttl(&self, namespace: &str, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        if self.available {
            self.insert(namespace, key, value, Some(Instant::now() + ttl));
        }
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let mut entries = self.entries.lock().unwrap();
        let Some(ns) = entries.get_mut(namespace) else {
            return Ok(None);
        };
        if ns.get(key).is_some_and(Self::expired) {
            ns.remove(key);
            return Ok(None);
        }
        Ok(ns.get(key).map(|entry| entry.value.clone()))
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(ns) = entries.get_mut(namespace) {
            ns.remove(key);
        }
        Ok(())
    }

    fn list(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        let entries = self.entries.lock().unwrap();
        let Some(ns) = entries.get(namespace) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<(&String, &StoredEntry)> = ns
            .iter()
            .filter(|(_, entry)| !Self::expired(entry))
            .collect();
        rows.sort_by_key(|(_, entry)| entry.seq);
        Ok(rows
            .into_iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    fn sweep_expired(&self, namespace: &str) -> Result<usize> {
        let mut entries = self.entries.lock().unwrap();
        let Some(ns) = entries.get_mut(namespace) else {
            return Ok(0);
        };
        let before = ns.len();
        ns.retain(|_, entry| !Self::expired(entry));
        Ok(before - ns.len())
    }

    fn clear(&self, namespace: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(namespace);
        Ok(())
    }
}

/// Scriptable `RemoteStore`. Upsert failures and delays are consumed from
/// budgets; push outcomes pop from a script, defaulting to `Accepted` with
/// an incrementing version.
pub struct MockRemote {
    upserts: AsyncMutex<Vec<(String, EntityKey, Value)>>,
    upsert_failures: AsyncMutex<u32>,
    upsert_delay: AsyncMutex<Option<Duration>>,
    upsert_attempts: AtomicU32,
    upserts_in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    push_script: StdMutex<Vec<std::result::Result<PushOutcome, RemoteError>>>,
    push_failures: AtomicU32,
    push_attempts: AtomicU32,
    next_version: AtomicU32,
    latest: StdMutex<Option<RemoteLatest>>,
    fetch_latest_attempts: AtomicU32,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            upserts: AsyncMutex::new(Vec::new()),
            upsert_failures: AsyncMutex::new(0),
            upsert_delay: AsyncMutex::new(None),
            upsert_attempts: AtomicU32::new(0),
            upserts_in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            push_script: StdMutex::new(Vec::new()),
            push_failures: AtomicU32::new(0),
            push_attempts: AtomicU32::new(0),
            next_version: AtomicU32::new(1),
            latest: StdMutex::new(None),
            fetch_latest_attempts: AtomicU32::new(0),
        }
    }

    pub async fn upserts(&self) -> Vec<(String, EntityKey, Value)> {
        self.upserts.lock().await.clone()
    }

    pub async fn fail_next_upserts(&self, count: u32) {
        *self.upsert_failures.lock().await = count;
    }

    pub async fn set_upsert_delay(&self, delay: Duration) {
        *self.upsert_delay.lock().await = Some(delay);
    }

    pub fn upsert_attempts(&self) -> u32 {
        self.upsert_attempts.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_upserts(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn script_push(&self, outcome: std::result::Result<PushOutcome, RemoteError>) {
        self.push_script.lock().unwrap().push(outcome);
    }

    pub fn fail_next_pushes(&self, count: u32) {
        self.push_failures.store(count, Ordering::SeqCst);
    }

    pub fn push_attempts(&self) -> u32 {
        self.push_attempts.load(Ordering::SeqCst)
    }

    pub fn set_latest(&self, latest: Option<RemoteLatest>) {
        *self.latest.lock().unwrap() = latest;
    }

    pub fn fetch_latest_attempts(&self) -> u32 {
        self.fetch_latest_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn upsert(
        &self,
        user_id: &str,
        key: &EntityKey,
        payload: &Value,
    ) -> std::result::Result<(), RemoteError> {
        self.upsert_attempts.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.upserts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let delay = *self.upsert_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.upserts_in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut failures = self.upsert_failures.lock().await;
        if *failures > 0 {
            *failures = failures.saturating_sub(1);
            return Err(RemoteError::transport("connection reset"));
        }
        drop(failures);

        self.upserts
            .lock()
            .await
            .push((user_id.to_string(), key.clone(), payload.clone()));
        Ok(())
    }

    async fn fetch(
        &self,
        _user_id: &str,
        _collection: &str,
    ) -> std::result::Result<Vec<Value>, RemoteError> {
        Ok(Vec::new())
    }

    async fn push_snapshot(
        &self,
        _user_id: &str,
        _snapshot: &Snapshot,
        _version: Option<&VersionToken>,
        _force: bool,
    ) -> std::result::Result<PushOutcome, RemoteError> {
        self.push_attempts.fetch_add(1, Ordering::SeqCst);
        let failures = self.push_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.push_failures
                .store(failures.saturating_sub(1), Ordering::SeqCst);
            return Err(RemoteError::transport("connection reset"));
        }
        let mut script = self.push_script.lock().unwrap();
        if script.is_empty() {
            let version = self.next_version.fetch_add(1, Ordering::SeqCst);
            return Ok(PushOutcome::Accepted(VersionToken(version.to_string())));
        }
        script.remove(0)
    }

    async fn fetch_latest(
        &self,
        _user_id: &str,
    ) -> std::result::Result<Option<RemoteLatest>, RemoteError> {
        self.fetch_latest_attempts.fetch_add(1, Ordering::SeqCst);
        Ok(self.latest.lock().unwrap().clone())
    }
}

/// `SnapshotSource` over an in-memory row set, upserting by the `id` field.
pub struct MemorySource {
    name: &'static str,
    recency_limit: Option<usize>,
    rows: StdMutex<HashMap<String, Vec<Value>>>,
    fail_fetches: AtomicBool,
    fail_upserts: AtomicBool,
}

impl MemorySource {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            recency_limit: None,
            rows: StdMutex::new(HashMap::new()),
            fail_fetches: AtomicBool::new(false),
            fail_upserts: AtomicBool::new(false),
        }
    }

    pub fn with_recency_limit(mut self, limit: usize) -> Self {
        self.recency_limit = Some(limit);
        self
    }

    pub fn seed(&self, user_id: &str, rows: Vec<Value>) {
        self.rows
            .lock()
            .unwrap()
            .insert(user_id.to_string(), rows);
    }

    pub fn rows(&self, user_id: &str) -> Vec<Value> {
        self.rows
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_fetches(&self) {
        self.fail_fetches.store(true, Ordering::SeqCst);
    }

    pub fn fail_upserts(&self) {
        self.fail_upserts.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SnapshotSource for MemorySource {
    fn name(&self) -> &'static str {
        self.name
    }

    fn recency_limit(&self) -> Option<usize> {
        self.recency_limit
    }

    async fn fetch(&self, user_id: &str) -> Result<Vec<Value>> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(Error::data_source(self.name, "simulated fetch failure"));
        }
        Ok(self.rows(user_id))
    }

    async fn upsert(&self, user_id: &str, rows: &[Value]) -> Result<()> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(Error::data_source(self.name, "simulated upsert failure"));
        }
        let mut all = self.rows.lock().unwrap();
        let existing = all.entry(user_id.to_string()).or_default();
        for row in rows {
            let id = row.get("id").cloned();
            match existing
                .iter_mut()
                .find(|candidate| id.is_some() && candidate.get("id").cloned() == id)
            {
                Some(slot) => *slot = row.clone(),
                None => existing.push(row.clone()),
            }
        }
        Ok(())
    }
}
