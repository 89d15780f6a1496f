//! Catalog and notification administration routes.

use crate::routes::{blocking, parse_body, to_json, ApiResult, AppState};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use notice_core::catalog::{Catalog, ExternalServicePatch, InternalSystemPatch};
use notice_core::lifecycle::{NotificationLifecycle, NotificationPatch};
use notice_core::models::{NotificationStatus, Pagination, Severity};
use serde::Deserialize;
use serde_json::json;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/notifications", get(list_notifications))
        .route(
            "/notifications/:id",
            get(get_notification)
                .put(update_notification)
                .delete(delete_notification),
        )
        .route("/external-services", get(list_services).post(create_service))
        .route(
            "/external-services/:id",
            get(get_service).put(update_service).delete(delete_service),
        )
        .route("/internal-systems", get(list_systems).post(create_system))
        .route(
            "/internal-systems/:id",
            get(get_system).put(update_system).delete(delete_system),
        )
        .route("/dependencies", get(list_dependencies).post(create_dependency))
        .route(
            "/dependencies/:id",
            get(get_dependency)
                .put(update_dependency)
                .delete(delete_dependency),
        )
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub skip: Option<u32>,
    pub limit: Option<u32>,
    pub external_service_id: Option<i64>,
}

impl PageQuery {
    fn page(&self) -> Pagination {
        let defaults = Pagination::default();
        Pagination {
            skip: self.skip.unwrap_or(defaults.skip),
            limit: self.limit.unwrap_or(defaults.limit),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NewService {
    name: String,
    provider: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceChanges {
    name: Option<String>,
    provider: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NewSystem {
    name: String,
    responsible_contact: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SystemChanges {
    name: Option<String>,
    responsible_contact: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NewDependency {
    internal_system_id: i64,
    external_service_id: i64,
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DependencyChanges {
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NotificationChanges {
    title: Option<String>,
    status: Option<NotificationStatus>,
    service_name: Option<String>,
    severity: Option<Severity>,
}

async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult {
    let lifecycle = NotificationLifecycle::new(state.store.clone());
    let page = query.page();
    let rows = blocking(move || lifecycle.list(page)).await?;
    Ok((StatusCode::OK, Json(to_json(&rows)?)))
}

async fn get_notification(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let lifecycle = NotificationLifecycle::new(state.store.clone());
    let detail = blocking(move || lifecycle.get_detail(id)).await?;
    Ok((StatusCode::OK, Json(to_json(&detail)?)))
}

async fn update_notification(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult {
    let changes: NotificationChanges = parse_body(payload)?;
    let patch = NotificationPatch {
        title: changes.title,
        status: changes.status,
        service_name: changes.service_name,
        severity: changes.severity,
    };
    let lifecycle = NotificationLifecycle::new(state.store.clone());
    let updated = blocking(move || {
        lifecycle.update(id, &patch)?;
        lifecycle.get_detail(id)
    })
    .await?;
    Ok((StatusCode::OK, Json(to_json(&updated)?)))
}

async fn delete_notification(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let lifecycle = NotificationLifecycle::new(state.store.clone());
    blocking(move || lifecycle.delete(id)).await?;
    Ok((StatusCode::OK, Json(json!({ "deleted": id }))))
}

async fn list_services(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult {
    let catalog = Catalog::new(state.store.clone());
    let page = query.page();
    let rows = blocking(move || catalog.list_external_services(page)).await?;
    Ok((StatusCode::OK, Json(to_json(&rows)?)))
}

async fn create_service(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult {
    let new: NewService = parse_body(payload)?;
    let catalog = Catalog::new(state.store.clone());
    let service = blocking(move || {
        catalog.create_external_service(
            &new.name,
            new.provider.as_deref(),
            new.description.as_deref(),
        )
    })
    .await?;
    Ok((StatusCode::CREATED, Json(to_json(&service)?)))
}

async fn get_service(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let catalog = Catalog::new(state.store.clone());
    let service = blocking(move || catalog.get_external_service(id)).await?;
    Ok((StatusCode::OK, Json(to_json(&service)?)))
}

async fn update_service(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult {
    let changes: ServiceChanges = parse_body(payload)?;
    let patch = ExternalServicePatch {
        name: changes.name,
        provider: changes.provider,
        description: changes.description,
    };
    let catalog = Catalog::new(state.store.clone());
    let service = blocking(move || catalog.update_external_service(id, &patch)).await?;
    Ok((StatusCode::OK, Json(to_json(&service)?)))
}

async fn delete_service(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let catalog = Catalog::new(state.store.clone());
    blocking(move || catalog.delete_external_service(id)).await?;
    Ok((StatusCode::OK, Json(json!({ "deleted": id }))))
}

async fn list_systems(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult {
    let catalog = Catalog::new(state.store.clone());
    let page = query.page();
    let rows = blocking(move || catalog.list_internal_systems(page)).await?;
    Ok((StatusCode::OK, Json(to_json(&rows)?)))
}

async fn create_system(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult {
    let new: NewSystem = parse_body(payload)?;
    let catalog = Catalog::new(state.store.clone());
    let system = blocking(move || {
        catalog.create_internal_system(
            &new.name,
            new.responsible_contact.as_deref(),
            new.description.as_deref(),
        )
    })
    .await?;
    Ok((StatusCode::CREATED, Json(to_json(&system)?)))
}

async fn get_system(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let catalog = Catalog::new(state.store.clone());
    let system = blocking(move || catalog.get_internal_system(id)).await?;
    Ok((StatusCode::OK, Json(to_json(&system)?)))
}

async fn update_system(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult {
    let changes: SystemChanges = parse_body(payload)?;
    let patch = InternalSystemPatch {
        name: changes.name,
        responsible_contact: changes.responsible_contact,
        description: changes.description,
    };
    let catalog = Catalog::new(state.store.clone());
    let system = blocking(move || catalog.update_internal_system(id, &patch)).await?;
    Ok((StatusCode::OK, Json(to_json(&system)?)))
}

async fn delete_system(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let catalog = Catalog::new(state.store.clone());
    blocking(move || catalog.delete_internal_system(id)).await?;
    Ok((StatusCode::OK, Json(json!({ "deleted": id }))))
}

/// `external_service_id` narrows the listing to one service's dependents.
async fn list_dependencies(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult {
    let catalog = Catalog::new(state.store.clone());
    let page = query.page();
    let rows = blocking(move || match query.external_service_id {
        Some(service_id) => catalog.dependencies_for_service(service_id),
        None => catalog.list_dependencies(page),
    })
    .await?;
    Ok((StatusCode::OK, Json(to_json(&rows)?)))
}

async fn create_dependency(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult {
    let new: NewDependency = parse_body(payload)?;
    let catalog = Catalog::new(state.store.clone());
    let dependency = blocking(move || {
        catalog.create_dependency(
            new.internal_system_id,
            new.external_service_id,
            new.description.as_deref(),
        )
    })
    .await?;
    Ok((StatusCode::CREATED, Json(to_json(&dependency)?)))
}

async fn get_dependency(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let catalog = Catalog::new(state.store.clone());
    let dependency = blocking(move || catalog.get_dependency(id)).await?;
    Ok((StatusCode::OK, Json(to_json(&dependency)?)))
}

async fn update_dependency(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult {
    let changes: DependencyChanges = parse_body(payload)?;
    let catalog = Catalog::new(state.store.clone());
    let dependency =
        blocking(move || catalog.update_dependency(id, changes.description.as_deref())).await?;
    Ok((StatusCode::OK, Json(to_json(&dependency)?)))
}

async fn delete_dependency(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let catalog = Catalog::new(state.store.clone());
    blocking(move || catalog.delete_dependency(id)).await?;
    Ok((StatusCode::OK, Json(json!({ "deleted": id }))))
}
