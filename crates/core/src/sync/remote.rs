//! Remote authoritative store contract.
//!
//! The engine never talks HTTP directly; it drives this trait. The shipping
//! implementation is `mintling-connect`; tests use in-memory fakes.

use async_trait::async_trait;

use super::model::{ConflictRecord, EntityKey, Snapshot, VersionToken};

/// Retry policy classification for remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Failure talking to the remote store. Timeouts are deliberately folded
/// into the transport case: upstream they behave identically to a network
/// failure and enter the retry/backoff path.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("authentication error: {0}")]
    Auth(String),
}

impl RemoteError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Transport(_) => RetryClass::Retryable,
            Self::Api { status, .. } => match *status {
                401 | 403 => RetryClass::ReauthRequired,
                408 | 425 | 429 => RetryClass::Retryable,
                500..=599 => RetryClass::Retryable,
                _ => RetryClass::Permanent,
            },
            Self::Auth(_) => RetryClass::ReauthRequired,
        }
    }
}

/// Outcome of pushing a snapshot with a version token.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// The remote store applied the snapshot and advanced its version.
    Accepted(VersionToken),
    /// The version token was stale; nothing was applied. Both sides of each
    /// divergent entity come back for the caller to resolve.
    Conflicted(Vec<ConflictRecord>),
}

/// Latest remote state for a user, when any exists.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteLatest {
    pub snapshot: Snapshot,
    pub version: VersionToken,
}

/// Per-entity and whole-snapshot operations the remote store exposes.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upsert one entity record, keyed by its natural key plus user id.
    async fn upsert(
        &self,
        user_id: &str,
        key: &EntityKey,
        payload: &serde_json::Value,
    ) -> Result<(), RemoteError>;

    /// Fetch one collection for a user.
    async fn fetch(
        &self,
        user_id: &str,
        collection: &str,
    ) -> Result<Vec<serde_json::Value>, RemoteError>;

    /// Push a full snapshot carrying the last-known version token. A stale
    /// token yields `PushOutcome::Conflicted`, not an error. `force` asks
    /// the store to apply regardless of the token.
    async fn push_snapshot(
        &self,
        user_id: &str,
        snapshot: &Snapshot,
        version: Option<&VersionToken>,
        force: bool,
    ) -> Result<PushOutcome, RemoteError>;

    /// Latest remote snapshot and version for a user; `None` for new users.
    async fn fetch_latest(&self, user_id: &str) -> Result<Option<RemoteLatest>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_class_for_http_statuses() {
        assert_eq!(
            RemoteError::api(500, "boom").retry_class(),
            RetryClass::Retryable
        );
        assert_eq!(
            RemoteError::api(429, "slow down").retry_class(),
            RetryClass::Retryable
        );
        assert_eq!(
            RemoteError::api(401, "no").retry_class(),
            RetryClass::ReauthRequired
        );
        assert_eq!(
            RemoteError::api(400, "bad").retry_class(),
            RetryClass::Permanent
        );
    }

    #[test]
    fn transport_failures_are_retryable() {
        assert_eq!(
            RemoteError::transport("timeout after 15s").retry_class(),
            RetryClass::Retryable
        );
    }
}
