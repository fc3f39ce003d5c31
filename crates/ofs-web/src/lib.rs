//! Axum read API over the scoring and enrichment stores.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use ofs_core::{EnrichmentRun, FacilityScore};
use ofs_storage::{FacilityStore, JobStore, StoreError};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ofs-web";

#[derive(Clone)]
pub struct AppState {
    pub job_store: Arc<dyn JobStore>,
    pub facility_store: Arc<dyn FacilityStore>,
}

impl AppState {
    pub fn new(job_store: Arc<dyn JobStore>, facility_store: Arc<dyn FacilityStore>) -> Self {
        Self {
            job_store,
            facility_store,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

enum ApiError {
    NotFound(String),
    Internal(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody {
                    error: format!("{what} not found"),
                }),
            )
                .into_response(),
            ApiError::Internal(err) => {
                error!(error = %err, "store error serving request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: "internal error".into(),
                    }),
                )
                    .into_response()
            }
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/facilities/{id}/score", get(facility_score_handler))
        .route("/api/scores", get(scores_handler))
        .route("/api/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving read api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn facility_score_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Json<FacilityScore>, ApiError> {
    let score = state
        .facility_store
        .score(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("score for facility {id}")))?;
    Ok(Json(score))
}

async fn scores_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<FacilityScore>>, ApiError> {
    let mut scores = Vec::new();
    for facility_id in state.facility_store.facility_ids().await? {
        if let Some(score) = state.facility_store.score(facility_id).await? {
            scores.push(score);
        }
    }
    Ok(Json(scores))
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<EnrichmentRun>>, ApiError> {
    Ok(Json(state.job_store.runs().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use ofs_core::{RunStatus, SubIndex};
    use ofs_storage::MemStore;
    use std::collections::BTreeMap;
    use tower::ServiceExt;

    async fn state_with_store() -> (AppState, Arc<MemStore>, Uuid) {
        let store = Arc::new(MemStore::new());
        let facility_id = Uuid::new_v4();
        store
            .set_attributes(facility_id, BTreeMap::from([(SubIndex::Pay, 80u8)]))
            .await;
        ofs_scoring::run_scoring(store.as_ref(), store.as_ref())
            .await
            .unwrap();
        let state = AppState::new(store.clone(), store.clone());
        (state, store, facility_id)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap();
        (status, value)
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let (state, _store, _facility_id) = state_with_store().await;
        let (status, body) = get_json(app(state), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn facility_score_returns_the_stored_row() {
        let (state, _store, facility_id) = state_with_store().await;
        let uri = format!("/api/facilities/{facility_id}/score");
        let (status, body) = get_json(app(state), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["facility_id"], facility_id.to_string());
        // Pay 80 at weight .15, twelve defaults at 50, normalized:
        // (12 + 44) / 1.03 = 54.4 -> 54.
        assert_eq!(body["ofs_score"], 54);
        assert_eq!(body["ofs_grade"], "D+");
        assert_eq!(body["indices_available"], 1);
        assert_eq!(body["sub_scores"]["pay"]["value"], 80);
    }

    #[tokio::test]
    async fn unknown_facility_is_404() {
        let (state, _store, _facility_id) = state_with_store().await;
        let uri = format!("/api/facilities/{}/score", Uuid::new_v4());
        let (status, body) = get_json(app(state), &uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn scores_lists_every_scored_facility() {
        let (state, store, first) = state_with_store().await;
        let second = Uuid::new_v4();
        store.set_attributes(second, BTreeMap::new()).await;
        ofs_scoring::run_scoring(store.as_ref(), store.as_ref())
            .await
            .unwrap();

        let (status, body) = get_json(app(state), "/api/scores").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        let ids: Vec<&str> = rows
            .iter()
            .map(|r| r["facility_id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&first.to_string().as_str()));
        assert!(ids.contains(&second.to_string().as_str()));
    }

    #[tokio::test]
    async fn runs_lists_the_audit_trail_newest_first() {
        let (state, store, _facility_id) = state_with_store().await;
        let base = Utc::now();
        for (offset, status) in [(10, RunStatus::Success), (20, RunStatus::Partial)] {
            store
                .record_run(&ofs_core::EnrichmentRun {
                    id: Uuid::new_v4(),
                    policy: "new_or_changed".into(),
                    started_at: base,
                    finished_at: base + chrono::Duration::seconds(offset),
                    processed: 5,
                    enriched: 4,
                    expired: 0,
                    failed: 1,
                    status,
                })
                .await
                .unwrap();
        }

        let (status, body) = get_json(app(state), "/api/runs").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["status"], "partial");
        assert_eq!(rows[1]["status"], "success");
    }
}
