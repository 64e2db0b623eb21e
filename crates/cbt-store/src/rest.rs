//! Remote store over a PostgREST-compatible HTTP API (e.g. Supabase).
//!
//! Sessions live in one table keyed by `user_id` with the serialized session
//! in a `session_data` column; results are rows of a second table.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use cbt_core::error::StoreError;
use cbt_core::model::{ExamResult, Session};
use cbt_core::traits::{RemoteStore, StoreResult};

const DEFAULT_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_SESSIONS_TABLE: &str = "active_sessions";
pub const DEFAULT_RESULTS_TABLE: &str = "exam_results";

/// HTTP remote store.
pub struct RestRemoteStore {
    base_url: String,
    api_key: String,
    sessions_table: String,
    results_table: String,
    client: reqwest::Client,
}

impl RestRemoteStore {
    pub fn new(base_url: &str, api_key: &str) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| StoreError::Connection(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            sessions_table: DEFAULT_SESSIONS_TABLE.to_string(),
            results_table: DEFAULT_RESULTS_TABLE.to_string(),
            client,
        })
    }

    pub fn with_tables(mut self, sessions_table: &str, results_table: &str) -> Self {
        self.sessions_table = sessions_table.to_string();
        self.results_table = results_table.to_string();
        self
    }

    fn url(&self, table: &str, params: &[(&str, String)]) -> StoreResult<Url> {
        Url::parse_with_params(&format!("{}/rest/v1/{table}", self.base_url), params)
            .map_err(|e| StoreError::Connection(format!("invalid remote URL: {e}")))
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", self.api_key.as_str())
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    async fn send(&self, req: RequestBuilder) -> StoreResult<Response> {
        let response = self.authorized(req).send().await.map_err(|e| {
            if e.is_timeout() {
                StoreError::Timeout(DEFAULT_TIMEOUT_SECS)
            } else {
                StoreError::Connection(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if status >= 400 {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Http { status, message });
        }
        Ok(response)
    }
}

impl std::fmt::Debug for RestRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestRemoteStore")
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .field("sessions_table", &self.sessions_table)
            .field("results_table", &self.results_table)
            .finish()
    }
}

#[derive(Serialize)]
struct SessionRowOut<'a> {
    user_id: &'a str,
    session_data: &'a Session,
    updated_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct SessionRowIn {
    session_data: Session,
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
    fn name(&self) -> &str {
        "rest"
    }

    #[instrument(skip(self, session))]
    async fn upsert_session(
        &self,
        user_id: &str,
        session: &Session,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let url = self.url(&self.sessions_table, &[("on_conflict", "user_id".into())])?;
        let row = SessionRowOut {
            user_id,
            session_data: session,
            updated_at,
        };
        self.send(
            self.client
                .post(url)
                .header("Prefer", "resolution=merge-duplicates")
                .json(&[row]),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch_session(&self, user_id: &str) -> StoreResult<Option<Session>> {
        let url = self.url(
            &self.sessions_table,
            &[
                ("select", "session_data".into()),
                ("user_id", format!("eq.{user_id}")),
            ],
        )?;
        let response = self.send(self.client.get(url)).await?;
        let rows: Vec<SessionRowIn> = response
            .json()
            .await
            .map_err(|e| StoreError::Serialization(format!("failed to parse session row: {e}")))?;
        debug!(rows = rows.len(), "fetched session rows");
        Ok(rows.into_iter().next().map(|row| row.session_data))
    }

    #[instrument(skip(self))]
    async fn delete_session(&self, user_id: &str) -> StoreResult<()> {
        let url = self.url(&self.sessions_table, &[("user_id", format!("eq.{user_id}"))])?;
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    #[instrument(skip(self, result), fields(result_id = %result.id))]
    async fn insert_result(&self, result: &ExamResult) -> StoreResult<()> {
        let url = self.url(&self.results_table, &[("on_conflict", "id".into())])?;
        self.send(
            self.client
                .post(url)
                .header("Prefer", "resolution=ignore-duplicates")
                .json(&[result]),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_results(&self, user_id: &str) -> StoreResult<Vec<ExamResult>> {
        let url = self.url(
            &self.results_table,
            &[
                ("user_id", format!("eq.{user_id}")),
                ("order", "completed_at.desc".into()),
            ],
        )?;
        let response = self.send(self.client.get(url)).await?;
        response
            .json()
            .await
            .map_err(|e| StoreError::Serialization(format!("failed to parse results: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbt_core::clock::fixed_now;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> RestRemoteStore {
        RestRemoteStore::new(&server.uri(), "test-key").unwrap()
    }

    fn sample_result() -> ExamResult {
        ExamResult {
            id: uuid::Uuid::nil(),
            user_id: "u1".into(),
            package_id: "pkg".into(),
            package_title: "Package".into(),
            completed_at: fixed_now(),
            total_score: 556,
            subject_scores: [("Math".to_string(), 556)].into_iter().collect(),
            responses: Default::default(),
        }
    }

    #[tokio::test]
    async fn upsert_posts_session_row() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/active_sessions"))
            .and(query_param("on_conflict", "user_id"))
            .and(header("apikey", "test-key"))
            .and(header("Authorization", "Bearer test-key"))
            .and(header("Prefer", "resolution=merge-duplicates"))
            .and(body_partial_json(serde_json::json!([
                {"user_id": "u1", "session_data": {"package_id": "pkg"}}
            ])))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let session = Session::begin("pkg", fixed_now());
        store(&server)
            .upsert_session("u1", &session, fixed_now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fetch_returns_first_row() {
        let server = MockServer::start().await;
        let session = Session::begin("pkg", fixed_now());

        Mock::given(method("GET"))
            .and(path("/rest/v1/active_sessions"))
            .and(query_param("user_id", "eq.u1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([{ "session_data": session }])),
            )
            .mount(&server)
            .await;

        let fetched = store(&server).fetch_session("u1").await.unwrap();
        assert_eq!(fetched, Some(session));
    }

    #[tokio::test]
    async fn fetch_with_no_rows_is_none() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/active_sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        assert!(store(&server).fetch_session("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_row_is_serialization_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/active_sessions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([{ "session_data": "garbage" }])),
            )
            .mount(&server)
            .await;

        let err = store(&server).fetch_session("u1").await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[tokio::test]
    async fn delete_filters_by_user() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/rest/v1/active_sessions"))
            .and(query_param("user_id", "eq.u1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        store(&server).delete_session("u1").await.unwrap();
    }

    #[tokio::test]
    async fn insert_result_ignores_duplicates() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/exam_results"))
            .and(query_param("on_conflict", "id"))
            .and(header("Prefer", "resolution=ignore-duplicates"))
            .and(body_partial_json(serde_json::json!([
                {"package_title": "Package", "total_score": 556}
            ])))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        store(&server).insert_result(&sample_result()).await.unwrap();
    }

    #[tokio::test]
    async fn list_results_orders_newest_first() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/exam_results"))
            .and(query_param("user_id", "eq.u1"))
            .and(query_param("order", "completed_at.desc"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!([sample_result()])),
            )
            .mount(&server)
            .await;

        let results = store(&server).list_results("u1").await.unwrap();
        assert_eq!(results, vec![sample_result()]);
    }

    #[tokio::test]
    async fn custom_tables() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/rest/v1/sessions_v2"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        store(&server)
            .with_tables("sessions_v2", "results_v2")
            .delete_session("u1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn error_status_maps_to_http_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/active_sessions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let err = store(&server).fetch_session("u1").await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Http {
                status: 503,
                message: "unavailable".into()
            }
        );
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unreachable_server_is_connection_error() {
        let store = RestRemoteStore::new("http://127.0.0.1:1", "key").unwrap();
        let err = store.delete_session("u1").await.unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
    }

    #[test]
    fn debug_masks_api_key() {
        let store = RestRemoteStore::new("http://localhost:54321", "secret-key").unwrap();
        let debug = format!("{store:?}");
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("***"));
    }
}
