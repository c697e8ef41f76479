//! Sync domain models and the pure helpers the engine is built on.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Entity collections that participate in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Profile,
    Pet,
    Preferences,
    Wallet,
    Transaction,
    Goal,
    InventoryItem,
    Accessory,
    GameSession,
    Quest,
}

impl EntityKind {
    /// Wire/collection name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Pet => "pet",
            Self::Preferences => "preferences",
            Self::Wallet => "wallet",
            Self::Transaction => "transaction",
            Self::Goal => "goal",
            Self::InventoryItem => "inventory_item",
            Self::Accessory => "accessory",
            Self::GameSession => "game_session",
            Self::Quest => "quest",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one user-scoped record: `(entity_kind, entity_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// What a queued operation does when it is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    EntityWrite,
    SnapshotPush,
}

/// Lifecycle of a durable operation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting for a queue drain to pick it up.
    Pending,
    /// Owned by a live writer; queue drains must skip it so the same entity
    /// never has two writes in flight.
    InFlight,
    /// Off the retry path; payload kept for recovery.
    Dead,
}

/// A durable intent to write against the remote store.
///
/// Lives in the `queue` namespace until a confirmed remote write deletes it,
/// or retry exhaustion marks it [`OperationStatus::Dead`]. Dead records keep
/// their payload so abandoned data stays recoverable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub id: String,
    pub op: OperationKind,
    pub key: Option<EntityKey>,
    pub user_id: String,
    pub payload: serde_json::Value,
    pub created_at: String,
    pub retry_count: u32,
    pub status: OperationStatus,
    pub last_error: Option<String>,
}

impl OperationRecord {
    pub fn entity_write(
        id: impl Into<String>,
        user_id: impl Into<String>,
        key: EntityKey,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            op: OperationKind::EntityWrite,
            key: Some(key),
            user_id: user_id.into(),
            payload,
            created_at: Utc::now().to_rfc3339(),
            retry_count: 0,
            status: OperationStatus::Pending,
            last_error: None,
        }
    }

    pub fn snapshot_push(
        id: impl Into<String>,
        user_id: impl Into<String>,
        snapshot: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            op: OperationKind::SnapshotPush,
            key: None,
            user_id: user_id.into(),
            payload: snapshot,
            created_at: Utc::now().to_rfc3339(),
            retry_count: 0,
            status: OperationStatus::Pending,
            last_error: None,
        }
    }
}

/// Opaque remote version stamp used to detect divergence before a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionToken(pub String);

impl std::fmt::Display for VersionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reported divergence between local and remote values for one entity.
/// Resolution is a caller decision; the engine never merges these itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub kind: EntityKind,
    pub entity_id: String,
    pub local_value: serde_json::Value,
    pub remote_value: serde_json::Value,
}

/// Point-in-time aggregate of all entity collections for one user.
///
/// Internally consistent only at capture time; partial fetch failures leave
/// that collection empty and record the source name in `degraded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub collections: BTreeMap<String, Vec<serde_json::Value>>,
    pub captured_at: String,
    pub version: Option<VersionToken>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<String>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            collections: BTreeMap::new(),
            captured_at: Utc::now().to_rfc3339(),
            version: None,
            degraded: Vec::new(),
        }
    }

    /// Total entries across all collections.
    pub fn entry_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }
}

/// Field-level shallow merge of two write payloads: fields of `newer` win,
/// fields only present in `base` survive. Non-object payloads are replaced
/// wholesale by `newer`.
pub fn merge_payloads(base: &serde_json::Value, newer: &serde_json::Value) -> serde_json::Value {
    match (base.as_object(), newer.as_object()) {
        (Some(base_map), Some(newer_map)) => {
            let mut merged = base_map.clone();
            for (field, value) in newer_map {
                merged.insert(field.clone(), value.clone());
            }
            serde_json::Value::Object(merged)
        }
        _ => newer.clone(),
    }
}

/// Exponential backoff with jitter: `base * 2^attempt`, capped at `cap`,
/// plus up to 20% random jitter.
pub fn backoff_with_jitter(attempt: u32, base: Duration, cap: Duration) -> Duration {
    const MAX_EXPONENT: u32 = 8;

    let exp = attempt.min(MAX_EXPONENT);
    let backoff_ms = base
        .as_millis()
        .saturating_mul(1_u128 << exp)
        .min(cap.as_millis()) as u64;
    let jitter = rand::thread_rng().gen_range(0..=(backoff_ms / 5).max(1));
    Duration::from_millis(backoff_ms.saturating_add(jitter))
}
