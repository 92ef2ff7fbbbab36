// =============================================================================
// REST API Endpoints — Axum 0.7 (component L: external interface adapter)
// =============================================================================
//
// All endpoints live under `/api/v1/`. `/api/v1/health` is public; every
// other route requires a valid Bearer token via the `AuthBearer` extractor.
// This layer is deliberately thin: every handler validates its input, calls
// one method on `InstanceController`/`LifecycleManager`, and maps the result
// to a JSON response — it holds no simulation logic of its own.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::AuthBearer;
use crate::controller::InstanceController;
use crate::errors::EngineError;
use crate::factory::{MarketTemplate, TemplateStore};
use crate::ids::ObjectId;
use crate::snapshot::build_snapshot;
use crate::timeseries::Granularity;

/// Shared state for the whole HTTP/WS surface.
pub struct AppState {
    pub controller: Arc<InstanceController>,
    pub template_store: Arc<dyn TemplateStore>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/templates", post(create_template))
        .route("/api/v1/templates", get(list_templates))
        .route("/api/v1/instances", post(create_instance))
        .route("/api/v1/instances", get(list_instances))
        .route("/api/v1/instances/progress/:request_id", get(get_progress))
        .route("/api/v1/instances/progress/:request_id/cancel", post(cancel_creation))
        .route("/api/v1/instances/:instance_id", get(get_instance))
        .route("/api/v1/instances/:instance_id", delete(delete_instance))
        .route("/api/v1/instances/:instance_id/stop", post(stop_instance))
        .route("/api/v1/instances/:instance_id/resume", post(resume_instance))
        .route("/api/v1/instances/:instance_id/fps", post(set_fps))
        .route("/api/v1/instances/:instance_id/acceleration", post(set_acceleration))
        .route("/api/v1/instances/:instance_id/snapshot", get(get_snapshot))
        .route("/api/v1/instances/:instance_id/objects/:object_id/pause", post(pause_object))
        .route("/api/v1/instances/:instance_id/objects/:object_id/resume", post(resume_object))
        .route("/api/v1/instances/:instance_id/objects/:object_id/destroy", post(destroy_object))
        .route("/api/v1/instances/:instance_id/series/:object_id", get(get_series))
        .route("/api/v1/instances/:instance_id/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

fn error_response(err: EngineError) -> (StatusCode, Json<serde_json::Value>) {
    let err = err.logged();
    let status = match err.code() {
        "ValidationError" | "InvalidAcceleration" => StatusCode::BAD_REQUEST,
        "TemplateNotFound" | "InstanceNotFound" | "StockNotFound" | "SeriesNotFound" | "ProgressNotFound" => StatusCode::NOT_FOUND,
        "IllegalState" | "IllegalTransition" | "InstanceBusy" | "InsufficientShares" | "OversubscribedShares" => StatusCode::CONFLICT,
        "Forbidden" => StatusCode::FORBIDDEN,
        "StageTimeout" | "WorkerCrashed" | "LaggingSubscriber" | "TimestampRegression" | "SeriesExists" | "Cancelled" => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": { "code": err.code(), "message": err.to_string() } })))
}

// ---- Health (public) -------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// ---- Templates --------------------------------------------------------------

async fn create_template(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(template): Json<MarketTemplate>,
) -> impl IntoResponse {
    if let Err(e) = template.validate() {
        return error_response(e).into_response();
    }
    match state.template_store.put(template.clone()).await {
        Ok(()) => Json(serde_json::json!({ "id": template.id })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn list_templates(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.template_store.list_ids().await {
        Ok(ids) => Json(ids).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

// ---- Instances ----------------------------------------------------------------

#[derive(Deserialize)]
struct CreateInstanceRequest {
    template_id: String,
    /// Caller-supplied owner tag (spec §4.J `create(templateId, userId,
    /// name?)`). Per spec §1, authenticating *who* this is is an external
    /// collaborator's job — the core only stores the tag and uses it to
    /// scope `list`/`get`/`delete`/`export`.
    owner_id: Option<String>,
    /// Optional display name for the instance, carried through verbatim.
    name: Option<String>,
}

/// Query param carrying the caller's owner tag for the owner-scoped
/// endpoints (list/get/delete/export). Plain query param rather than a
/// header because, per spec §1, auth/identity is an external collaborator
/// this crate doesn't implement — a real deployment would derive this from
/// a validated session upstream of these handlers.
#[derive(Deserialize)]
struct OwnerQuery {
    owner_id: Option<String>,
}

/// Enqueues the creation pipeline and returns immediately — 202 semantics
/// per spec §6. Poll `GET /instances/progress/:request_id` for completion.
async fn create_instance(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateInstanceRequest>,
) -> impl IntoResponse {
    let request_id = state.controller.create_instance(&req.template_id, req.owner_id, req.name);
    info!(request_id = %request_id, "instance creation enqueued via API");
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "request_id": request_id }))).into_response()
}

async fn get_progress(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> impl IntoResponse {
    match state.controller.get_progress(&request_id) {
        Ok(progress) => Json(progress).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn cancel_creation(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> impl IntoResponse {
    match state.controller.cancel_creation(&request_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn list_instances(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<OwnerQuery>,
) -> impl IntoResponse {
    Json(state.controller.list_instances(query.owner_id.as_deref()))
}

async fn get_instance(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> impl IntoResponse {
    match state.controller.get_instance(&instance_id, query.owner_id.as_deref()) {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn delete_instance(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> impl IntoResponse {
    match state.controller.delete_instance(&instance_id, query.owner_id.as_deref()).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn stop_instance(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> impl IntoResponse {
    match state.controller.stop_instance(&instance_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn resume_instance(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> impl IntoResponse {
    match state.controller.resume_instance(&instance_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

#[derive(Deserialize)]
struct FpsRequest {
    fps: u32,
}

async fn set_fps(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(req): Json<FpsRequest>,
) -> impl IntoResponse {
    let lifecycle = match state.controller.lifecycle_of(&instance_id, None) {
        Ok(lm) => lm,
        Err(e) => return error_response(e).into_response(),
    };
    match lifecycle.set_fps(req.fps) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

#[derive(Deserialize)]
struct AccelerationRequest {
    acceleration: f64,
}

async fn set_acceleration(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(req): Json<AccelerationRequest>,
) -> impl IntoResponse {
    let lifecycle = match state.controller.lifecycle_of(&instance_id, None) {
        Ok(lm) => lm,
        Err(e) => return error_response(e).into_response(),
    };
    match lifecycle.clock.set_acceleration(req.acceleration) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn get_snapshot(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> impl IntoResponse {
    let lifecycle = match state.controller.lifecycle_of(&instance_id, query.owner_id.as_deref()) {
        Ok(lm) => lm,
        Err(e) => return error_response(e).into_response(),
    };
    Json(build_snapshot(&lifecycle)).into_response()
}

// ---- Individual objects ----------------------------------------------------

fn parse_object_id(raw: &str) -> Result<ObjectId, EngineError> {
    raw.parse::<u64>()
        .map(ObjectId)
        .map_err(|_| EngineError::Validation(format!("invalid object id: {raw}")))
}

async fn pause_object(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path((instance_id, object_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let lifecycle = match state.controller.lifecycle_of(&instance_id, None) {
        Ok(lm) => lm,
        Err(e) => return error_response(e).into_response(),
    };
    let id = match parse_object_id(&object_id) {
        Ok(id) => id,
        Err(e) => return error_response(e).into_response(),
    };
    match lifecycle.pause(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn resume_object(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path((instance_id, object_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let lifecycle = match state.controller.lifecycle_of(&instance_id, None) {
        Ok(lm) => lm,
        Err(e) => return error_response(e).into_response(),
    };
    let id = match parse_object_id(&object_id) {
        Ok(id) => id,
        Err(e) => return error_response(e).into_response(),
    };
    match lifecycle.resume(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn destroy_object(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path((instance_id, object_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let lifecycle = match state.controller.lifecycle_of(&instance_id, None) {
        Ok(lm) => lm,
        Err(e) => return error_response(e).into_response(),
    };
    let id = match parse_object_id(&object_id) {
        Ok(id) => id,
        Err(e) => return error_response(e).into_response(),
    };
    match lifecycle.destroy(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

// ---- Time series ------------------------------------------------------------

#[derive(Deserialize)]
struct SeriesQuery {
    #[serde(default = "default_granularity")]
    granularity: String,
    #[serde(default = "default_limit")]
    limit: usize,
    start_time: Option<i64>,
    end_time: Option<i64>,
}

fn default_granularity() -> String {
    "1m".to_string()
}

fn default_limit() -> usize {
    500
}

fn parse_granularity(raw: &str) -> Result<Granularity, EngineError> {
    match raw {
        "1m" => Ok(Granularity::M1),
        "5m" => Ok(Granularity::M5),
        "15m" => Ok(Granularity::M15),
        "30m" => Ok(Granularity::M30),
        "1h" => Ok(Granularity::H1),
        "1d" => Ok(Granularity::D1),
        "1w" => Ok(Granularity::W1),
        "1M" => Ok(Granularity::Mo1),
        other => Err(EngineError::Validation(format!("unknown granularity: {other}"))),
    }
}

async fn get_series(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path((instance_id, object_id)): Path<(String, String)>,
    Query(query): Query<SeriesQuery>,
) -> impl IntoResponse {
    let lifecycle = match state.controller.lifecycle_of(&instance_id, None) {
        Ok(lm) => lm,
        Err(e) => return error_response(e).into_response(),
    };
    let id = match parse_object_id(&object_id) {
        Ok(id) => id,
        Err(e) => return error_response(e).into_response(),
    };
    let granularity = match parse_granularity(&query.granularity) {
        Ok(g) => g,
        Err(e) => return error_response(e).into_response(),
    };

    match (query.start_time, query.end_time) {
        (Some(start_ms), Some(end_ms)) => {
            let (Some(start), Some(end)) = (
                chrono::DateTime::from_timestamp_millis(start_ms),
                chrono::DateTime::from_timestamp_millis(end_ms),
            ) else {
                return error_response(EngineError::Validation("invalid start_time/end_time".into())).into_response();
            };
            match lifecycle.timeseries.query_range(id, granularity, start, end, query.limit) {
                Ok(buckets) => Json(buckets).into_response(),
                Err(e) => error_response(e).into_response(),
            }
        }
        _ => match lifecycle.timeseries.history(id, granularity, query.limit) {
            Ok(history) => Json(history).into_response(),
            Err(e) => error_response(e).into_response(),
        },
    }
}
