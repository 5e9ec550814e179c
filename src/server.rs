use crate::advisory::{locate_with_advisory, AdvisoryLocator, Resolution};
use crate::config::AppConfig;
use crate::error::CoreError;
use crate::routing::{plan_route, RouteResponse};
use crate::sync::{PositionUpdate, SyncHandle};
use crate::types::{Coordinate, DensityCategory, UserPosition, Zone, ZoneAssignment, ZoneId};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::info;

pub struct AppState {
    pub sync: SyncHandle,
    pub advisory: Arc<dyn AdvisoryLocator>,
    pub advisory_timeout: Duration,
}

pub enum ApiError {
    Core(CoreError),
    NotFound(String),
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError::Core(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, format!("not found: {what}")),
            ApiError::Core(e) => {
                let status = match &e {
                    CoreError::InvalidPolygon { .. }
                    | CoreError::InvalidCapacity { .. }
                    | CoreError::InvalidEndpoints { .. } => StatusCode::BAD_REQUEST,
                    CoreError::UnknownZone(_) => StatusCode::NOT_FOUND,
                    CoreError::OrchestratorStopped => StatusCode::SERVICE_UNAVAILABLE,
                    CoreError::PublishFailure(_) => StatusCode::BAD_GATEWAY,
                };
                (status, e.to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneInput {
    name: String,
    boundary: Vec<Coordinate>,
    capacity: u32,
    #[serde(default)]
    adjacent: Vec<ZoneId>,
}

#[derive(Deserialize)]
pub struct OverrideRequest {
    density: DensityCategory,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRequest {
    user_id: String,
    latitude: f64,
    longitude: f64,
    observed_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct LocateParams {
    lat: f64,
    lon: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocateResponse {
    zone_id: ZoneAssignment,
    advisory: bool,
}

#[derive(Deserialize)]
pub struct RouteParams {
    from: ZoneId,
    to: ZoneId,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/zones", get(list_zones))
        .route("/api/zones/{id}", get(get_zone).put(put_zone).delete(delete_zone))
        .route("/api/zones/{id}/override", post(set_override).delete(clear_override))
        .route("/api/positions", post(submit_position))
        .route("/api/positions/{user_id}", get(get_position).delete(remove_position))
        .route("/api/locate", get(locate_handler))
        .route("/api/route", get(route_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(config: &AppConfig, state: AppState) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, config.server.port))?;

    info!(%addr, "starting server");

    let app = router(Arc::new(state));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn list_zones(State(state): State<Arc<AppState>>) -> Json<Vec<Zone>> {
    Json(state.sync.snapshot().zones.clone())
}

async fn get_zone(State(state): State<Arc<AppState>>, Path(id): Path<ZoneId>) -> Result<Json<Zone>, ApiError> {
    state
        .sync
        .snapshot()
        .zone(&id)
        .cloned()
        .map(Json)
        .ok_or(ApiError::Core(CoreError::UnknownZone(id)))
}

async fn put_zone(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ZoneId>,
    Json(input): Json<ZoneInput>,
) -> Result<Json<Zone>, ApiError> {
    let mut zone = Zone::new(id, input.name, input.boundary, input.capacity);
    zone.adjacent = input.adjacent;
    Ok(Json(state.sync.upsert_zone(zone).await?))
}

async fn delete_zone(State(state): State<Arc<AppState>>, Path(id): Path<ZoneId>) -> Result<StatusCode, ApiError> {
    state.sync.delete_zone(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_override(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ZoneId>,
    Json(req): Json<OverrideRequest>,
) -> Result<Json<Zone>, ApiError> {
    Ok(Json(state.sync.set_override(&id, req.density).await?))
}

async fn clear_override(State(state): State<Arc<AppState>>, Path(id): Path<ZoneId>) -> Result<Json<Zone>, ApiError> {
    Ok(Json(state.sync.clear_override(&id).await?))
}

async fn submit_position(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PositionRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .sync
        .submit_position(PositionUpdate {
            user_id: req.user_id,
            coordinate: Coordinate::new(req.latitude, req.longitude),
            observed_at: req.observed_at.unwrap_or_else(Utc::now),
        })
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn get_position(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<UserPosition>, ApiError> {
    state
        .sync
        .snapshot()
        .position(&user_id)
        .cloned()
        .map(Json)
        .ok_or(ApiError::NotFound(user_id))
}

async fn remove_position(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.sync.remove_position(&user_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(user_id))
    }
}

async fn locate_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LocateParams>,
) -> Json<LocateResponse> {
    let snapshot = state.sync.snapshot();
    let point = Coordinate::new(params.lat, params.lon);
    let resolution = locate_with_advisory(point, &snapshot.zones, state.advisory.as_ref(), state.advisory_timeout).await;

    Json(LocateResponse {
        zone_id: resolution.assignment(),
        advisory: matches!(resolution, Resolution::AdvisoryFallback(_)),
    })
}

async fn route_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RouteParams>,
) -> Result<Json<RouteResponse>, ApiError> {
    let snapshot = state.sync.snapshot();
    let route = plan_route(&params.from, &params.to, &snapshot.zones)?;
    Ok(Json(RouteResponse::from(route)))
}
