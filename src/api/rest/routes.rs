use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::route;
use crate::error::AppError;
use crate::models::item::ItemStatus;
use crate::models::route::DriverRoute;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/drivers/:id/route",
            post(start_route).get(get_route),
        )
        .route("/drivers/:id/route/recalculate", post(recalculate_route))
        .route("/drivers/:id/route/advance", post(advance_route))
        .route("/drivers/:id/route/pending", post(add_pending))
        .route("/drivers/:id/route/end", post(end_route))
        .route(
            "/drivers/:id/route/stops/:stop_id/confirm",
            post(confirm_item),
        )
        .route(
            "/drivers/:id/route/stops/:stop_id/unconfirm",
            post(unconfirm_item),
        )
        .route("/drivers/:id/route/stops/:stop_id/issue", post(report_issue))
}

#[derive(Deserialize)]
pub struct StartRouteRequest {
    pub shift_end: DateTime<Utc>,
    pub item_ids: Vec<Uuid>,
}

#[derive(Deserialize, Default)]
pub struct RecalculateRequest {
    #[serde(default)]
    pub extra_item_ids: Vec<Uuid>,
}

#[derive(Deserialize)]
pub struct StopItemRequest {
    pub item_id: Uuid,
}

#[derive(Deserialize)]
pub struct IssueRequest {
    pub item_id: Uuid,
    pub status: ItemStatus,
}

#[derive(Deserialize)]
pub struct PendingRequest {
    pub item_id: Uuid,
}

async fn start_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<StartRouteRequest>,
) -> Result<Json<DriverRoute>, AppError> {
    let route = route::generate_route(state, id, payload.shift_end, payload.item_ids).await?;
    Ok(Json(route))
}

async fn get_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DriverRoute>, AppError> {
    let route = state
        .routes
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("no route for driver {id}")))?;

    Ok(Json(route.value().clone()))
}

async fn recalculate_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    payload: Option<Json<RecalculateRequest>>,
) -> Result<Json<DriverRoute>, AppError> {
    let extra = payload.map(|Json(p)| p.extra_item_ids).unwrap_or_default();
    let route = route::recalculate_route(state, id, extra).await?;
    Ok(Json(route))
}

async fn advance_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DriverRoute>, AppError> {
    let route = route::advance(&state, id)?;
    Ok(Json(route))
}

async fn confirm_item(
    State(state): State<Arc<AppState>>,
    Path((id, stop_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<StopItemRequest>,
) -> Result<Json<DriverRoute>, AppError> {
    let route = route::confirm_item(&state, id, stop_id, payload.item_id)?;
    Ok(Json(route))
}

async fn unconfirm_item(
    State(state): State<Arc<AppState>>,
    Path((id, stop_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<StopItemRequest>,
) -> Result<Json<DriverRoute>, AppError> {
    let route = route::unconfirm_item(&state, id, stop_id, payload.item_id)?;
    Ok(Json(route))
}

async fn report_issue(
    State(state): State<Arc<AppState>>,
    Path((id, stop_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<IssueRequest>,
) -> Result<Json<DriverRoute>, AppError> {
    let route = route::report_issue(&state, id, stop_id, payload.item_id, payload.status)?;
    Ok(Json(route))
}

async fn add_pending(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<PendingRequest>,
) -> Result<Json<DriverRoute>, AppError> {
    let route = route::add_pending_item(&state, id, payload.item_id)?;
    Ok(Json(route))
}

async fn end_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DriverRoute>, AppError> {
    let route = route::end_route(&state, id)?;
    Ok(Json(route))
}
