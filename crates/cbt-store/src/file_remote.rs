//! Remote store backed by a (possibly shared or synced) directory.
//!
//! Layout:
//!
//! ```text
//! <dir>/sessions/<user>.json        one session row per user
//! <dir>/results/<user>/<id>.json    one file per finalized result
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use cbt_core::model::{ExamResult, Session};
use cbt_core::error::StoreError;
use cbt_core::traits::{RemoteStore, StoreResult};

use crate::file_local::encode_key;

#[derive(Debug, Serialize, Deserialize)]
struct SessionRow {
    user_id: String,
    session_data: Session,
    updated_at: DateTime<Utc>,
}

/// A [`RemoteStore`] over a directory tree.
#[derive(Debug, Clone)]
pub struct FileRemoteStore {
    dir: PathBuf,
}

impl FileRemoteStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, user_id: &str) -> PathBuf {
        self.dir
            .join("sessions")
            .join(format!("{}.json", encode_key(user_id)))
    }

    fn results_dir(&self, user_id: &str) -> PathBuf {
        self.dir.join("results").join(encode_key(user_id))
    }
}

/// Replace `path` through a uniquely named temp file in the same directory.
async fn write_atomic(path: &Path, contents: Vec<u8>) -> StoreResult<()> {
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    tokio::fs::create_dir_all(&parent).await?;
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> StoreResult<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(&contents)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Io(format!("write task failed: {e}")))?
}

#[async_trait]
impl RemoteStore for FileRemoteStore {
    fn name(&self) -> &str {
        "file"
    }

    #[instrument(skip(self, session))]
    async fn upsert_session(
        &self,
        user_id: &str,
        session: &Session,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let row = SessionRow {
            user_id: user_id.to_string(),
            session_data: session.clone(),
            updated_at,
        };
        let json = serde_json::to_vec_pretty(&row)?;
        write_atomic(&self.session_path(user_id), json).await
    }

    #[instrument(skip(self))]
    async fn fetch_session(&self, user_id: &str) -> StoreResult<Option<Session>> {
        let raw = match tokio::fs::read(self.session_path(user_id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let row: SessionRow = serde_json::from_slice(&raw)?;
        Ok(Some(row.session_data))
    }

    #[instrument(skip(self))]
    async fn delete_session(&self, user_id: &str) -> StoreResult<()> {
        match tokio::fs::remove_file(self.session_path(user_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, result), fields(result_id = %result.id))]
    async fn insert_result(&self, result: &ExamResult) -> StoreResult<()> {
        let path = self
            .results_dir(&result.user_id)
            .join(format!("{}.json", result.id));
        let json = serde_json::to_vec_pretty(result)?;
        write_atomic(&path, json).await
    }

    #[instrument(skip(self))]
    async fn list_results(&self, user_id: &str) -> StoreResult<Vec<ExamResult>> {
        let dir = self.results_dir(user_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut results = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<ExamResult>(&raw) {
                Ok(result) => results.push(result),
                Err(e) => warn!("skipping {}: {e}", path.display()),
            }
        }

        results.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        Ok(results)
    }
}
