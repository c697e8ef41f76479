//! Wire types for the cloud sync API.

use serde::{Deserialize, Serialize};

use mintling_core::sync::{ConflictRecord, Snapshot};

/// Error payload returned by the API for non-success statuses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    pub error: String,
    pub code: String,
    pub message: String,
}

/// POST /api/v1/sync/snapshots/push
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSnapshotRequest {
    pub user_id: String,
    pub snapshot: Snapshot,
    /// Last version this client saw; `None` lets the server treat the push
    /// as an initial upload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_version: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSnapshotResponse {
    pub version: String,
}

/// Body of a 409 response to a stale push.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResponse {
    pub conflicts: Vec<ConflictRecord>,
}

/// GET /api/v1/sync/snapshots/latest
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestSnapshotResponse {
    pub snapshot: Snapshot,
    pub version: String,
}

/// POST /api/v1/sync/entities/upsert
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertEntityRequest {
    pub user_id: String,
    pub collection: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
}

/// GET /api/v1/sync/entities/{collection}
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityListResponse {
    pub items: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse {
    pub success: bool,
}
