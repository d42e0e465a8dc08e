//! HTTP job-control API
//!
//! Thin axum layer over [`Engine`]: submit, inspect, cancel and remove jobs,
//! read capabilities and metrics, and adjust the concurrency limit.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::capabilities::CapabilitySnapshot;
use crate::engine::{Engine, EngineError};
use crate::jobs::Job;
use crate::metrics::MetricsSnapshot;
use crate::sidecar::CompletedTranscode;

/// Default listen address for the API.
pub fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7878))
}

/// Errors that can occur when running the API server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    Bind(#[from] std::io::Error),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub media_id: String,
    pub preset_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveResponse {
    pub removed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MaxJobsRequest {
    pub value: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MaxJobsResponse {
    pub value: u32,
    /// Limit in force after resolving 0 against the core count
    pub effective: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorBody { error: message })).into_response()
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match self {
            EngineError::MediaNotFound(_)
            | EngineError::PresetNotFound(_)
            | EngineError::JobNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Store(_) => StatusCode::CONFLICT,
        };
        error_response(status, self.to_string())
    }
}

/// Handler for GET /jobs
async fn list_jobs(State(engine): State<Arc<Engine>>) -> Json<Vec<Job>> {
    Json(engine.list_jobs().await)
}

/// Handler for POST /jobs
async fn submit_job(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), EngineError> {
    let job_id = engine
        .submit(&request.media_id, &request.preset_name)
        .await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { job_id })))
}

/// Handler for GET /jobs/:id
async fn get_job(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, EngineError> {
    Ok(Json(engine.job(&id).await?))
}

/// Handler for POST /jobs/:id/cancel
async fn cancel_job(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, EngineError> {
    engine.job(&id).await?;
    let cancelled = engine.cancel(&id).await;
    Ok(Json(CancelResponse { cancelled }))
}

/// Handler for DELETE /jobs/:id
async fn remove_job(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<RemoveResponse>, EngineError> {
    engine.job(&id).await?;
    let removed = engine.remove(&id).await;
    Ok(Json(RemoveResponse { removed }))
}

/// Handler for GET /capabilities
async fn get_capabilities(State(engine): State<Arc<Engine>>) -> Json<CapabilitySnapshot> {
    Json(engine.capabilities().await)
}

/// Handler for POST /capabilities/refresh
async fn refresh_capabilities(State(engine): State<Arc<Engine>>) -> Json<CapabilitySnapshot> {
    Json(engine.refresh_capabilities().await)
}

/// Handler for PUT /config/max-concurrent-jobs
async fn set_max_jobs(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<MaxJobsRequest>,
) -> Json<MaxJobsResponse> {
    engine.set_max_concurrent_jobs(request.value).await;
    Json(MaxJobsResponse {
        value: request.value,
        effective: engine.max_concurrent_jobs().await,
    })
}

/// Handler for GET /completed
async fn list_completed(State(engine): State<Arc<Engine>>) -> Response {
    match engine.completed().await {
        Ok(items) => Json::<Vec<CompletedTranscode>>(items).into_response(),
        Err(e) => {
            log::error!("Failed to list completed transcodes: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Handler for GET /metrics
async fn get_metrics(State(engine): State<Arc<Engine>>) -> Json<MetricsSnapshot> {
    Json(engine.metrics().await)
}

/// Creates the axum Router with all job-control endpoints
pub fn create_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/:id", get(get_job).delete(remove_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/capabilities", get(get_capabilities))
        .route("/capabilities/refresh", post(refresh_capabilities))
        .route("/config/max-concurrent-jobs", put(set_max_jobs))
        .route("/completed", get(list_completed))
        .route("/metrics", get(get_metrics))
        .with_state(engine)
}

/// Runs the API server on `addr` until it fails
pub async fn run_server(engine: Arc<Engine>, addr: SocketAddr) -> Result<(), ServerError> {
    let app = create_router(engine);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{test_engine, TestEngine};
    use crate::jobs::JobStatus;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use http_body_util::BodyExt;
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    fn request(method: Method, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(t: &TestEngine, req: Request<Body>) -> Response {
        create_router(t.engine.clone()).oneshot(req).await.unwrap()
    }

    async fn body_json<T: DeserializeOwned>(response: Response) -> T {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn submit(t: &TestEngine, media_id: &str) -> String {
        let response = send(
            t,
            request(
                Method::POST,
                "/jobs",
                Some(serde_json::json!({"media_id": media_id, "preset_name": "medium"})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json::<SubmitResponse>(response).await.job_id
    }

    #[tokio::test]
    async fn test_submit_and_get_job() {
        let t = test_engine(1);
        let id = submit(&t, "a").await;

        let response = send(&t, request(Method::GET, &format!("/jobs/{}", id), None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let job: Job = body_json(response).await;
        assert_eq!(job.id, id);
        assert_eq!(job.media_id, "a");
        assert_eq!(job.status, JobStatus::Processing);

        let response = send(&t, request(Method::GET, "/jobs", None)).await;
        let jobs: Vec<Job> = body_json(response).await;
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_submit_unknown_media_is_not_found() {
        let t = test_engine(1);
        let response = send(
            &t,
            request(
                Method::POST,
                "/jobs",
                Some(serde_json::json!({"media_id": "zzz", "preset_name": "medium"})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: ErrorBody = body_json(response).await;
        assert!(body.error.contains("zzz"));
    }

    #[tokio::test]
    async fn test_get_unknown_job_is_not_found() {
        let t = test_engine(1);
        let response = send(&t, request(Method::GET, "/jobs/nope", None)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_then_remove() {
        let t = test_engine(1);
        submit(&t, "a").await;
        let queued = submit(&t, "b").await;

        let response = send(&t, request(Method::DELETE, &format!("/jobs/{}", queued), None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!body_json::<RemoveResponse>(response).await.removed);

        let response = send(
            &t,
            request(Method::POST, &format!("/jobs/{}/cancel", queued), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json::<CancelResponse>(response).await.cancelled);

        let response = send(
            &t,
            request(Method::POST, &format!("/jobs/{}/cancel", queued), None),
        )
        .await;
        assert!(!body_json::<CancelResponse>(response).await.cancelled);

        let response = send(&t, request(Method::DELETE, &format!("/jobs/{}", queued), None)).await;
        assert!(body_json::<RemoveResponse>(response).await.removed);
        assert!(t.engine.get_status(&queued).await.is_none());
    }

    #[tokio::test]
    async fn test_set_max_concurrent_jobs_admits_queue() {
        let t = test_engine(1);
        submit(&t, "a").await;
        let queued = submit(&t, "b").await;

        let response = send(
            &t,
            request(
                Method::PUT,
                "/config/max-concurrent-jobs",
                Some(serde_json::json!({"value": 2})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: MaxJobsResponse = body_json(response).await;
        assert_eq!(body.value, 2);
        assert_eq!(body.effective, 2);
        assert_eq!(
            t.engine.get_status(&queued).await.unwrap().status,
            JobStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_metrics_capabilities_and_completed() {
        let t = test_engine(1);
        submit(&t, "a").await;

        let response = send(&t, request(Method::GET, "/metrics", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let metrics: MetricsSnapshot = body_json(response).await;
        assert_eq!(metrics.running_jobs, 1);
        assert_eq!(metrics.jobs.processing, 1);

        let response = send(&t, request(Method::GET, "/capabilities", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let caps: CapabilitySnapshot = body_json(response).await;
        assert!(caps.recommended.is_none());

        let response = send(&t, request(Method::GET, "/completed", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let completed: Vec<serde_json::Value> = body_json(response).await;
        assert!(completed.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_json_field_names() {
        let t = test_engine(1);
        let response = send(&t, request(Method::GET, "/metrics", None)).await;
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert!(json.get("timestamp_unix_ms").is_some());
        assert!(json.get("queue_len").is_some());
        assert!(json.get("running_jobs").is_some());
        assert!(json.get("max_concurrent_jobs").is_some());
        let jobs = json.get("jobs").unwrap();
        for key in ["pending", "processing", "completed", "failed", "cancelled"] {
            assert!(jobs.get(key).is_some(), "missing jobs.{}", key);
        }
        let system = json.get("system").unwrap();
        assert!(system.get("cpu_usage_percent").is_some());
        assert!(system.get("mem_usage_percent").is_some());
        assert!(system.get("load_avg_1").is_some());
    }
}
