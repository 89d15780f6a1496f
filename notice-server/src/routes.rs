use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use notice_core::downtime::DowntimeTracker;
use notice_core::models::Pagination;
use notice_core::pipeline::{IngestOutcome, MailboxMessage, Pipeline};
use notice_core::reconcile::Reconciler;
use notice_core::{Error, Store};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use submission_registry::{validate_submission_v1, CanonicalSubmissionV1};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub pipeline: Arc<Pipeline>,
}

pub(crate) type ApiResponse = (StatusCode, Json<serde_json::Value>);
pub(crate) type ApiResult = Result<ApiResponse, ApiResponse>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/submissions", post(handle_submission))
        .route("/admin/consistency-check", post(handle_consistency_check))
        .route("/downtime-events", get(handle_downtime_events))
        .route("/downtime-stats", get(handle_downtime_stats))
        .merge(crate::catalog::routes())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Maps a submission onto the mailbox shape the pipeline ingests.
pub fn submission_to_message(submission: CanonicalSubmissionV1) -> MailboxMessage {
    let id = submission.original_id.unwrap_or_else(|| {
        format!(
            "submission-{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        )
    });
    MailboxMessage {
        id,
        subject: submission
            .subject
            .unwrap_or_else(|| "Submitted notification".into()),
        from: submission.sender.unwrap_or_default(),
        date: submission.received_at,
        body_text: None,
        body_html: Some(submission.html),
    }
}

async fn handle_submission(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult {
    let submission: CanonicalSubmissionV1 = parse_body(payload)?;
    validate_submission_v1(&submission).map_err(bad_request)?;

    let message = submission_to_message(submission);
    let pipeline = state.pipeline.clone();
    let outcome = blocking(move || pipeline.ingest(&message)).await?;

    let status = match outcome {
        IngestOutcome::Duplicate => StatusCode::CONFLICT,
        _ => StatusCode::CREATED,
    };
    Ok((status, Json(to_json(&outcome)?)))
}

async fn handle_consistency_check(State(state): State<AppState>) -> ApiResult {
    let store = state.store.clone();
    let stats = blocking(move || Ok(Reconciler::new(store).run_check())).await?;
    let status = if stats.errors > 0 {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    Ok((status, Json(to_json(&stats)?)))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub service_id: Option<i64>,
    pub skip: Option<u32>,
    pub limit: Option<u32>,
}

async fn handle_downtime_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult {
    let defaults = Pagination::default();
    let page = Pagination {
        skip: query.skip.unwrap_or(defaults.skip),
        limit: query.limit.unwrap_or(defaults.limit),
    };
    let store = state.store.clone();
    let events =
        blocking(move || DowntimeTracker::new(store).list_events(query.service_id, page)).await?;
    Ok((StatusCode::OK, Json(to_json(&events)?)))
}

async fn handle_downtime_stats(State(state): State<AppState>) -> ApiResult {
    let store = state.store.clone();
    let stats = blocking(move || {
        DowntimeTracker::new(store).compute_average_downtime(chrono::Utc::now())
    })
    .await?;
    Ok((StatusCode::OK, Json(to_json(&stats)?)))
}

/// Runs store or pipeline work off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiResponse>
where
    F: FnOnce() -> notice_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(error_response(&err)),
        Err(join) => {
            tracing::error!(error = %join, "request worker failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            ))
        }
    }
}

fn error_response(err: &Error) -> ApiResponse {
    let status = match err {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::Storage(_) | Error::ExternalCall(_) => {
            tracing::error!(error = %err, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": err.to_string() })))
}

fn bad_request(message: String) -> ApiResponse {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

pub(crate) fn parse_body<T: DeserializeOwned>(
    payload: serde_json::Value,
) -> Result<T, ApiResponse> {
    serde_json::from_value(payload).map_err(|e| bad_request(e.to_string()))
}

pub(crate) fn to_json<T: serde::Serialize>(
    value: &T,
) -> Result<serde_json::Value, ApiResponse> {
    serde_json::to_value(value).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{router, AppState};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use notice_core::pipeline::{Pipeline, PreFilter};
    use notice_core::Store;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn db_path(name: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        std::env::temp_dir()
            .join("noticehub-server-tests")
            .join(format!("{name}-{nanos}.db"))
            .to_string_lossy()
            .into_owned()
    }

    pub fn app(name: &str) -> (Router, Store) {
        let store = Store::open(db_path(name)).expect("store");
        let pipeline = Arc::new(Pipeline::new(store.clone(), PreFilter::default()));
        (
            router(AppState {
                store: store.clone(),
                pipeline,
            }),
            store,
        )
    }

    pub async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn with_json(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        with_json("POST", uri, body)
    }

    pub fn put_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        with_json("PUT", uri, body)
    }

    pub fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }
}
