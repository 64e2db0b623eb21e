//! In-memory store, catalog and event fakes for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::controller::{EventSink, ExamEvent};
use crate::error::StoreError;
use crate::model::{ExamPackage, ExamResult, Session};
use crate::traits::{LocalStore, PackageCatalog, RemoteStore, StoreResult};

fn poisoned<T>(_: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Connection("lock poisoned".into())
}

/// Device-local store backed by a map.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entries: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Keys currently present, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn check(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Io("local store unavailable".into()));
        }
        Ok(())
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        Ok(self.entries.lock().map_err(poisoned)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check()?;
        self.entries
            .lock()
            .map_err(poisoned)?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.check()?;
        self.entries.lock().map_err(poisoned)?.remove(key);
        Ok(())
    }
}

/// One operation applied to a [`MemoryRemoteStore`], in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Upsert {
        user_id: String,
        section_index: usize,
        answered: usize,
    },
    Fetch { user_id: String },
    Delete { user_id: String },
    InsertResult { id: uuid::Uuid },
}

#[derive(Debug, Clone)]
struct SessionRow {
    session: Session,
    updated_at: DateTime<Utc>,
}

/// Remote store backed by maps, with failure injection.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    sessions: Mutex<HashMap<String, SessionRow>>,
    results: Mutex<Vec<ExamResult>>,
    calls: Mutex<Vec<RemoteCall>>,
    offline: AtomicBool,
    failing_result_inserts: AtomicU32,
    failing_deletes: AtomicU32,
    rejected_upserts: AtomicU32,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every operation with a connection error while `offline` is set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` result inserts.
    pub fn fail_next_result_inserts(&self, n: u32) {
        self.failing_result_inserts.store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` session upserts with a 400 response.
    pub fn reject_next_upserts(&self, n: u32) {
        self.rejected_upserts.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` session deletes.
    pub fn fail_next_deletes(&self, n: u32) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    /// Put a session row in place directly, as another device would.
    pub fn seed_session(&self, user_id: &str, session: Session, updated_at: DateTime<Utc>) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(
                user_id.to_string(),
                SessionRow {
                    session,
                    updated_at,
                },
            );
        }
    }

    /// The stored session row, bypassing failure injection.
    pub fn stored_session(&self, user_id: &str) -> Option<Session> {
        self.sessions
            .lock()
            .ok()
            .and_then(|s| s.get(user_id).map(|row| row.session.clone()))
    }

    pub fn stored_updated_at(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.sessions
            .lock()
            .ok()
            .and_then(|s| s.get(user_id).map(|row| row.updated_at))
    }

    pub fn stored_results(&self) -> Vec<ExamResult> {
        self.results.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Every call received, including failed ones.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: RemoteCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("remote unreachable".into()));
        }
        Ok(())
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert_session(
        &self,
        user_id: &str,
        session: &Session,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.record(RemoteCall::Upsert {
            user_id: user_id.to_string(),
            section_index: session.current_section_index,
            answered: session.responses.iter().filter(|r| r.is_answered()).count(),
        });
        self.check_online()?;
        if Self::take_failure(&self.rejected_upserts) {
            return Err(StoreError::Http {
                status: 400,
                message: "injected upsert rejection".into(),
            });
        }
        self.sessions.lock().map_err(poisoned)?.insert(
            user_id.to_string(),
            SessionRow {
                session: session.clone(),
                updated_at,
            },
        );
        Ok(())
    }

    async fn fetch_session(&self, user_id: &str) -> StoreResult<Option<Session>> {
        self.record(RemoteCall::Fetch {
            user_id: user_id.to_string(),
        });
        self.check_online()?;
        Ok(self
            .sessions
            .lock()
            .map_err(poisoned)?
            .get(user_id)
            .map(|row| row.session.clone()))
    }

    async fn delete_session(&self, user_id: &str) -> StoreResult<()> {
        self.record(RemoteCall::Delete {
            user_id: user_id.to_string(),
        });
        self.check_online()?;
        if Self::take_failure(&self.failing_deletes) {
            return Err(StoreError::Http {
                status: 503,
                message: "injected delete failure".into(),
            });
        }
        self.sessions.lock().map_err(poisoned)?.remove(user_id);
        Ok(())
    }

    async fn insert_result(&self, result: &ExamResult) -> StoreResult<()> {
        self.record(RemoteCall::InsertResult { id: result.id });
        self.check_online()?;
        if Self::take_failure(&self.failing_result_inserts) {
            return Err(StoreError::Http {
                status: 503,
                message: "injected insert failure".into(),
            });
        }
        let mut results = self.results.lock().map_err(poisoned)?;
        if !results.iter().any(|r| r.id == result.id) {
            results.push(result.clone());
        }
        Ok(())
    }

    async fn list_results(&self, user_id: &str) -> StoreResult<Vec<ExamResult>> {
        self.check_online()?;
        let mut results: Vec<ExamResult> = self
            .results
            .lock()
            .map_err(poisoned)?
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        Ok(results)
    }
}

/// Catalog over a fixed set of packages.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    packages: HashMap<String, ExamPackage>,
}

impl StaticCatalog {
    pub fn new(packages: impl IntoIterator<Item = ExamPackage>) -> Self {
        Self {
            packages: packages.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }
}

#[async_trait]
impl PackageCatalog for StaticCatalog {
    async fn fetch_package(&self, package_id: &str) -> anyhow::Result<Option<ExamPackage>> {
        Ok(self.packages.get(package_id).cloned())
    }
}

/// Event sink that keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ExamEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExamEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of recorded events matching `pred`.
    pub fn count(&self, pred: impl Fn(&ExamEvent) -> bool) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|ev| pred(ev)).count())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ExamEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
