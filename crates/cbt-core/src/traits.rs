//! Trait seams between the engine and the outside world.
//!
//! Concrete stores live in `cbt-store`; in-memory fakes live in
//! [`crate::fakes`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{ExamPackage, ExamResult, Session};

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Device-local store
// ---------------------------------------------------------------------------

/// Fast, synchronous key/value storage on the device.
///
/// Holds the active session record and one remaining-time record per section.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Remove a key. No-op if absent.
    fn remove(&self, key: &str) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// Remote store
// ---------------------------------------------------------------------------

/// Slower, reliable storage shared across devices.
///
/// Holds at most one session row per user and an append-only list of results.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Human-readable backend name (e.g. "rest").
    fn name(&self) -> &str;

    /// Insert or replace the user's session row.
    async fn upsert_session(
        &self,
        user_id: &str,
        session: &Session,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Fetch the user's session row, if any.
    async fn fetch_session(&self, user_id: &str) -> StoreResult<Option<Session>>;

    /// Delete the user's session row. No-op if absent.
    async fn delete_session(&self, user_id: &str) -> StoreResult<()>;

    /// Append a finalized result. Inserting the same result id twice must not
    /// produce two rows.
    async fn insert_result(&self, result: &ExamResult) -> StoreResult<()>;

    /// The user's results, newest first.
    async fn list_results(&self, user_id: &str) -> StoreResult<Vec<ExamResult>>;
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Read-only source of fully resolved exam packages.
#[async_trait]
pub trait PackageCatalog: Send + Sync {
    async fn fetch_package(&self, package_id: &str) -> anyhow::Result<Option<ExamPackage>>;
}
