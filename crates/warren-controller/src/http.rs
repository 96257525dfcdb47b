//! HTTP API over the object store.
//!
//! Exposes the declarative resources as JSON so that users (and tests) can
//! create Sandboxes, claims, templates and pools, and watch their status
//! change as the controllers work.
//!
//! ## Endpoints
//!
//! - `GET /healthz` - Liveness
//! - `GET /readyz` - Readiness (controllers started)
//! - `GET /apis/{kind}/{namespace}` - List, optionally `?labelSelector=k=v,k2`
//! - `POST /apis/{kind}/{namespace}` - Create
//! - `GET|PUT|DELETE /apis/{kind}/{namespace}/{name}` - Read, replace, delete
//! - `PUT /apis/{kind}/{namespace}/{name}/status` - Replace status
//!
//! Deletes accept `?uid=` and `?resourceVersion=` preconditions. Status
//! writes that change a controller-computed condition (`Ready` on Sandboxes
//! and claims) are rejected.
//!
//! `{kind}` is matched case-insensitively against the registered kinds.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, put},
    Router,
};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use warren_api::sandbox::CONDITION_READY;
use warren_api::{
    DynamicObject, LabelSelector, ObjectKey, ObjectStore, Preconditions, Registry, Resource,
    Sandbox, SandboxClaim, StoreError,
};

/// Conditions computed by the controllers; clients may not change them.
const CONTROLLER_CONDITIONS: &[(&str, &str)] = &[
    (Sandbox::KIND, CONDITION_READY),
    (SandboxClaim::KIND, CONDITION_READY),
];

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn ObjectStore>,
    registry: Arc<Registry>,
    ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(store: Arc<dyn ObjectStore>, registry: Arc<Registry>) -> Self {
        Self {
            store,
            registry,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag reported by `/readyz`.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    fn resolve_kind(&self, kind: &str) -> Result<&'static str, ApiError> {
        self.registry
            .kinds()
            .find(|info| info.kind.eq_ignore_ascii_case(kind))
            .map(|info| info.kind)
            .ok_or_else(|| ApiError(StoreError::UnknownKind(kind.to_string())))
    }
}

/// Store error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::AlreadyExists { .. }
            | StoreError::Conflict { .. }
            | StoreError::UidMismatch { .. }
            | StoreError::AlreadyOwned { .. } => StatusCode::CONFLICT,
            StoreError::UnknownKind(_)
            | StoreError::KindMismatch { .. }
            | StoreError::InvalidObject(_)
            | StoreError::Json(_) => StatusCode::BAD_REQUEST,
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "Request rejected");
        }
        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "code": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    label_selector: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteParams {
    uid: Option<String>,
    resource_version: Option<u64>,
}

/// Build the HTTP router.
pub fn build_router(state: AppState) -> Router {
    tracing::debug!("Building HTTP router");

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/apis/:kind/:namespace", get(list).post(create))
        .route(
            "/apis/:kind/:namespace/:name",
            get(read).put(replace).delete(delete),
        )
        .route("/apis/:kind/:namespace/:name/status", put(replace_status))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": "healthy",
        "service": "warren-controller"
    }))
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "starting" })),
        )
    }
}

async fn list(
    State(state): State<AppState>,
    Path((kind, namespace)): Path<(String, String)>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let kind = state.resolve_kind(&kind)?;
    let selector = match params.label_selector.as_deref() {
        Some(raw) => LabelSelector::parse(raw)?,
        None => LabelSelector::everything(),
    };
    let items = state.store.list(kind, Some(&namespace), &selector).await?;
    Ok(Json(serde_json::json!({ "kind": kind, "items": items })))
}

/// Fill `object`'s kind and namespace from the path, rejecting a body that
/// names something else.
fn bind_object(
    object: &mut DynamicObject,
    kind: &'static str,
    namespace: &str,
    name: Option<&str>,
) -> ApiResult<()> {
    if !object.kind.is_empty() && object.kind != kind {
        return Err(StoreError::KindMismatch {
            expected: kind.to_string(),
            actual: object.kind.clone(),
        }
        .into());
    }
    object.kind = kind.to_string();

    let meta = &mut object.metadata;
    if !meta.namespace.is_empty() && meta.namespace != namespace {
        return Err(StoreError::InvalidObject(format!(
            "metadata.namespace {:?} does not match path namespace {namespace:?}",
            meta.namespace
        ))
        .into());
    }
    meta.namespace = namespace.to_string();

    if let Some(name) = name {
        if !meta.name.is_empty() && meta.name != name {
            return Err(StoreError::InvalidObject(format!(
                "metadata.name {:?} does not match path name {name:?}",
                meta.name
            ))
            .into());
        }
        meta.name = name.to_string();
    }
    Ok(())
}

async fn create(
    State(state): State<AppState>,
    Path((kind, namespace)): Path<(String, String)>,
    Json(mut object): Json<DynamicObject>,
) -> ApiResult<(StatusCode, Json<DynamicObject>)> {
    let kind = state.resolve_kind(&kind)?;
    bind_object(&mut object, kind, &namespace, None)?;
    let created = state.store.create(object).await?;
    tracing::info!(kind, object = %created.key(), "Created via API");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn read(
    State(state): State<AppState>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
) -> ApiResult<Json<DynamicObject>> {
    let kind = state.resolve_kind(&kind)?;
    let object = state.store.get(kind, &ObjectKey::new(namespace, name)).await?;
    Ok(Json(object))
}

async fn replace(
    State(state): State<AppState>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
    Json(mut object): Json<DynamicObject>,
) -> ApiResult<Json<DynamicObject>> {
    let kind = state.resolve_kind(&kind)?;
    bind_object(&mut object, kind, &namespace, Some(&name))?;
    Ok(Json(state.store.update(object).await?))
}

async fn replace_status(
    State(state): State<AppState>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
    Json(mut object): Json<DynamicObject>,
) -> ApiResult<Json<DynamicObject>> {
    let kind = state.resolve_kind(&kind)?;
    bind_object(&mut object, kind, &namespace, Some(&name))?;

    let guarded = CONTROLLER_CONDITIONS.iter().filter(|(k, _)| *k == kind);
    let mut stored = None;
    for (_, condition_type) in guarded {
        if stored.is_none() {
            stored = Some(state.store.get(kind, &object.key()).await?);
        }
        let current = stored.as_ref().and_then(|s| find_condition(&s.status, condition_type));
        if find_condition(&object.status, condition_type) != current {
            return Err(StoreError::InvalidObject(format!(
                "condition {condition_type} of {kind} is managed by the controller"
            ))
            .into());
        }
    }

    Ok(Json(state.store.update_status(object).await?))
}

/// The condition of `condition_type` in a raw status, if any.
fn find_condition<'a>(status: &'a serde_json::Value, condition_type: &str) -> Option<&'a serde_json::Value> {
    status
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(serde_json::Value::as_str) == Some(condition_type))
}

async fn delete(
    State(state): State<AppState>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<StatusCode> {
    let kind = state.resolve_kind(&kind)?;
    let key = ObjectKey::new(namespace, name);
    let preconditions = Preconditions {
        uid: params.uid,
        resource_version: params.resource_version,
    };
    state.store.delete(kind, &key, &preconditions).await?;
    tracing::info!(kind, object = %key, "Deleted via API");
    Ok(StatusCode::NO_CONTENT)
}

/// Start the HTTP server.
///
/// This function runs until the server is shut down via the provided
/// shutdown signal.
pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(state);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
