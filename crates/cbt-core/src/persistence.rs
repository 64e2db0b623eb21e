//! Dual local/remote session persistence.
//!
//! The local record is written synchronously on every save. Remote writes go
//! through a single background writer task fed by an unbounded channel, so
//! they are applied in the order they were issued and callers never wait on
//! them. A remote upsert that fails transiently is kept and retried on the
//! next flush unless a newer upsert or a clear for the same user supersedes
//! it. Permanent failures are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::model::Session;
use crate::traits::{LocalStore, RemoteStore, StoreResult};

/// Local store key holding the serialized active session.
pub const SESSION_KEY: &str = "active_session";

#[derive(Debug)]
struct PendingUpsert {
    user_id: String,
    session: Session,
    updated_at: DateTime<Utc>,
}

#[derive(Debug)]
enum RemoteOp {
    Upsert(PendingUpsert),
    Clear {
        user_id: String,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Keeps one session record synchronized across the local and remote stores.
pub struct SessionPersistence {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    tx: mpsc::UnboundedSender<RemoteOp>,
}

impl SessionPersistence {
    /// Create the persistence layer and spawn its remote writer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(Arc::clone(&remote), rx));
        Self {
            local,
            remote,
            clock,
            tx,
        }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Overwrite the local record, then queue a remote upsert.
    ///
    /// Only the local write can fail here; the remote outcome is never
    /// reported to the caller.
    pub fn save(&self, user_id: &str, session: &Session) -> StoreResult<()> {
        let json = serde_json::to_string(session)?;
        self.local.set(SESSION_KEY, &json)?;
        debug!(
            user_id,
            section = session.current_section_index,
            responses = session.responses.len(),
            "session saved locally"
        );

        let op = RemoteOp::Upsert(PendingUpsert {
            user_id: user_id.to_string(),
            session: session.clone(),
            updated_at: self.clock.now(),
        });
        if self.tx.send(op).is_err() {
            warn!(user_id, "remote writer stopped; session saved locally only");
        }
        Ok(())
    }

    /// Load the user's active session.
    ///
    /// A remote record wins and replaces the local one. Without a remote
    /// record (or when the remote is unreachable) the local record is used.
    #[instrument(skip(self))]
    pub async fn load(&self, user_id: &str) -> Option<Session> {
        self.flush().await;

        match self.remote.fetch_session(user_id).await {
            Ok(Some(session)) => {
                match serde_json::to_string(&session) {
                    Ok(json) => {
                        if let Err(e) = self.local.set(SESSION_KEY, &json) {
                            warn!("failed to mirror remote session locally: {e}");
                        }
                    }
                    Err(e) => warn!("failed to serialize remote session: {e}"),
                }
                debug!(remote = self.remote.name(), "loaded session from remote");
                return Some(session);
            }
            Ok(None) => debug!("no remote session"),
            Err(e) => warn!(remote = self.remote.name(), "remote load failed, using local: {e}"),
        }

        self.load_local()
    }

    /// Read the local record. A malformed record counts as absent.
    pub fn load_local(&self) -> Option<Session> {
        let raw = match self.local.get(SESSION_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("failed to read local session: {e}");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("discarding malformed local session: {e}");
                None
            }
        }
    }

    /// Delete the remote and local records of a finished attempt.
    ///
    /// The remote delete runs after every upsert queued before it and is
    /// attempted exactly once. The local record is only removed while it
    /// still belongs to `attempt`, so a newer attempt started meanwhile
    /// survives.
    #[instrument(skip(self, attempt), fields(package = %attempt.package_id))]
    pub async fn clear(&self, user_id: &str, attempt: &Session) -> StoreResult<()> {
        let (reply, rx) = oneshot::channel();
        let remote_result = if self
            .tx
            .send(RemoteOp::Clear {
                user_id: user_id.to_string(),
                reply,
            })
            .is_ok()
        {
            rx.await
                .unwrap_or_else(|_| Err(StoreError::Connection("remote writer stopped".into())))
        } else {
            Err(StoreError::Connection("remote writer stopped".into()))
        };

        let local_result = match self.load_local() {
            Some(local) if !local.same_attempt(attempt) => {
                debug!("local record belongs to a newer attempt, keeping it");
                Ok(())
            }
            _ => self.local.remove(SESSION_KEY),
        };

        remote_result.and(local_result)
    }

    /// Wait until every queued remote write has been attempted.
    pub async fn flush(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RemoteOp::Flush { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

impl std::fmt::Debug for SessionPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPersistence")
            .field("remote", &self.remote.name())
            .finish_non_exhaustive()
    }
}

async fn run_writer(remote: Arc<dyn RemoteStore>, mut rx: mpsc::UnboundedReceiver<RemoteOp>) {
    let mut pending: HashMap<String, PendingUpsert> = HashMap::new();

    while let Some(op) = rx.recv().await {
        match op {
            RemoteOp::Upsert(upsert) => {
                pending.remove(&upsert.user_id);
                push(remote.as_ref(), upsert, &mut pending).await;
            }
            RemoteOp::Flush { reply } => {
                let retry: Vec<PendingUpsert> = pending.drain().map(|(_, u)| u).collect();
                for upsert in retry {
                    push(remote.as_ref(), upsert, &mut pending).await;
                }
                let _ = reply.send(());
            }
            RemoteOp::Clear { user_id, reply } => {
                pending.remove(&user_id);
                let result = remote.delete_session(&user_id).await;
                if let Err(e) = &result {
                    warn!(user_id = %user_id, "remote session delete failed: {e}");
                }
                let _ = reply.send(result);
            }
        }
    }
    debug!("remote writer stopped");
}

async fn push(
    remote: &dyn RemoteStore,
    upsert: PendingUpsert,
    pending: &mut HashMap<String, PendingUpsert>,
) {
    match remote
        .upsert_session(&upsert.user_id, &upsert.session, upsert.updated_at)
        .await
    {
        Ok(()) => debug!(user_id = %upsert.user_id, "remote session updated"),
        Err(e) if e.is_transient() => {
            warn!(user_id = %upsert.user_id, "remote session update failed, will retry: {e}");
            pending.insert(upsert.user_id.clone(), upsert);
        }
        Err(e) => {
            warn!(user_id = %upsert.user_id, "remote session update rejected, dropping it: {e}");
        }
    }
}
