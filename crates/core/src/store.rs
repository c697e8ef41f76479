//! Local persistence seam.
//!
//! The engine talks to device storage through [`LocalStore`]; the SQLite
//! implementation lives in `mintling-storage-sqlite`. Everything the engine
//! persists lands in one of three namespaces.

use std::time::Duration;

use crate::errors::Result;

/// Namespace holding one snapshot (and its version token) per user.
pub const NS_STATE: &str = "state";
/// Namespace holding pending operation records keyed by operation id.
pub const NS_QUEUE: &str = "queue";
/// Namespace holding generic TTL-bound cache entries.
pub const NS_CACHE: &str = "cache";

/// Durable, namespace-partitioned key/value storage on the device.
///
/// Implementations must survive process restarts and never touch the
/// network. Writes to the same key are serialized; reads and cross-key
/// writes may run concurrently. When the underlying storage cannot be
/// opened, implementations degrade to no-ops and report it through
/// [`LocalStore::is_available`] instead of erroring on every call.
pub trait LocalStore: Send + Sync {
    /// False when device storage is disabled or full; all other operations
    /// are then successful no-ops. Callers check once and adapt.
    fn is_available(&self) -> bool;

    /// Durable upsert; overwriting the same key is idempotent.
    fn put(&self, namespace: &str, key: &str, value: &serde_json::Value) -> Result<()>;

    /// Durable upsert with an expiry, for the `cache` namespace.
    fn put_with_ttl(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()>;

    /// Returns the live value, or `None` for missing or expired keys.
    fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>>;

    /// Idempotent delete; removing a missing key is not an error.
    fn delete(&self, namespace: &str, key: &str) -> Result<()>;

    /// All live `(key, value)` pairs in a namespace, oldest first.
    fn list(&self, namespace: &str) -> Result<Vec<(String, serde_json::Value)>>;

    /// Removes entries whose expiry has passed; returns the count removed.
    fn sweep_expired(&self, namespace: &str) -> Result<usize>;

    /// Wipes an entire namespace.
    fn clear(&self, namespace: &str) -> Result<()>;
}
