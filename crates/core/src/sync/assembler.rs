//! Cross-entity snapshot capture and restore.
//!
//! Fans out to every registered data source in parallel to build one
//! point-in-time [`Snapshot`], and applies a snapshot's collections back out
//! through the same sources on restore.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::errors::Result;

use super::model::Snapshot;

/// Key each row is made orderable by; backfilled with "now" when a source
/// omits it.
pub const ROW_TIMESTAMP_FIELD: &str = "updatedAt";

/// One collection's accessor: knows how to read and upsert its rows for a
/// user. Sources are independent; capture imposes no ordering between them.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Collection name used as the snapshot key.
    fn name(&self) -> &'static str;

    /// When set, capture keeps only the most recent N rows (transactions,
    /// game sessions).
    fn recency_limit(&self) -> Option<usize> {
        None
    }

    async fn fetch(&self, user_id: &str) -> Result<Vec<serde_json::Value>>;

    /// Insert-or-update keyed by the row's natural key plus `user_id`;
    /// applying the same rows twice must be a no-op.
    async fn upsert(&self, user_id: &str, rows: &[serde_json::Value]) -> Result<()>;
}

/// Result of applying a snapshot back to the data sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    /// True only when zero collections failed.
    pub restored: bool,
    pub errors: Vec<String>,
}

/// Assembles and restores full user state across registered sources.
pub struct SnapshotAssembler {
    sources: Vec<Arc<dyn SnapshotSource>>,
}

impl SnapshotAssembler {
    pub fn new(sources: Vec<Arc<dyn SnapshotSource>>) -> Self {
        Self { sources }
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Fetch every collection in parallel. A failing source degrades its
    /// collection to empty and is recorded in `degraded`, never aborting
    /// the whole capture.
    pub async fn capture(&self, user_id: &str) -> Snapshot {
        let fetches = self.sources.iter().map(|source| {
            let source = Arc::clone(source);
            async move {
                let rows = source.fetch(user_id).await;
                (source, rows)
            }
        });

        let mut collections = BTreeMap::new();
        let mut degraded = Vec::new();
        for (source, rows) in join_all(fetches).await {
            match rows {
                Ok(rows) => {
                    collections.insert(source.name().to_string(), normalize_rows(rows, source.recency_limit()));
                }
                Err(err) => {
                    warn!(
                        "[Assembler] Source '{}' failed during capture for user {}: {}",
                        source.name(),
                        user_id,
                        err
                    );
                    collections.insert(source.name().to_string(), Vec::new());
                    degraded.push(source.name().to_string());
                }
            }
        }

        let snapshot = Snapshot {
            collections,
            captured_at: Utc::now().to_rfc3339(),
            version: None,
            degraded,
        };
        debug!(
            "[Assembler] Captured {} entries across {} collections for user {} (degraded: {})",
            snapshot.entry_count(),
            snapshot.collections.len(),
            user_id,
            snapshot.degraded.len()
        );
        snapshot
    }

    /// Apply each collection back to its owning source, continuing past
    /// individual failures. Upsert semantics make a second restore of the
    /// same snapshot a no-op.
    pub async fn restore(&self, user_id: &str, snapshot: &Snapshot) -> RestoreOutcome {
        let mut errors = Vec::new();
        for (collection, rows) in &snapshot.collections {
            let Some(source) = self
                .sources
                .iter()
                .find(|source| source.name() == collection)
            else {
                errors.push(format!(
                    "no data source registered for collection '{}'",
                    collection
                ));
                continue;
            };
            if let Err(err) = source.upsert(user_id, rows).await {
                warn!(
                    "[Assembler] Restore of '{}' failed for user {}: {}",
                    collection, user_id, err
                );
                errors.push(format!("{}: {}", collection, err));
            }
        }

        RestoreOutcome {
            restored: errors.is_empty(),
            errors,
        }
    }
}

/// Backfills missing row timestamps with "now" so every entry is orderable,
/// then applies the source's recency bound newest-first.
fn normalize_rows(
    mut rows: Vec<serde_json::Value>,
    recency_limit: Option<usize>,
) -> Vec<serde_json::Value> {
    let now = Utc::now().to_rfc3339();
    for row in &mut rows {
        if let Some(map) = row.as_object_mut() {
            let needs_backfill = match map.get(ROW_TIMESTAMP_FIELD) {
                Some(serde_json::Value::String(s)) => s.is_empty(),
                Some(serde_json::Value::Null) | None => true,
                Some(_) => false,
            };
            if needs_backfill {
                map.insert(
                    ROW_TIMESTAMP_FIELD.to_string(),
                    serde_json::Value::String(now.clone()),
                );
            }
        }
    }

    if let Some(limit) = recency_limit {
        rows.sort_by(|a, b| row_sort_key(b).cmp(&row_sort_key(a)));
        rows.truncate(limit);
    }
    rows
}

/// Millisecond timestamp for ordering; falls back to the raw string when a
/// row carries a non-RFC3339 value.
fn row_sort_key(row: &serde_json::Value) -> (i64, String) {
    let raw = row
        .get(ROW_TIMESTAMP_FIELD)
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let millis = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(i64::MIN);
    (millis, raw.to_string())
}
