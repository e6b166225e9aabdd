use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::transfer::transfer_items;
use crate::error::AppError;
use crate::models::route::RouteStatus;
use crate::models::session::{ActiveDriver, DriverSession};
use crate::models::transfer::TransferRecord;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", get(list_drivers))
        .route("/drivers/:id/login", post(login))
        .route("/drivers/:id/logout", post(logout))
        .route("/transfers", post(create_transfer))
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub name: String,
}

#[derive(Serialize)]
pub struct LogoutResponse {
    pub driver_id: Uuid,
    pub released_items: usize,
}

#[derive(Deserialize)]
pub struct TransferRequest {
    pub item_ids: Vec<Uuid>,
    pub from_driver_id: Uuid,
    pub to_driver_id: Uuid,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<DriverSession>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }

    let session = state.sessions.register(id, payload.name);
    Ok(Json(session))
}

/// Logout releases the driver's non-locked items but leaves any route
/// object intact for the next login. Locked items stay assigned so that
/// physical custody is never silently lost.
async fn logout(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<LogoutResponse>, AppError> {
    if !state.sessions.unregister(id) {
        return Err(AppError::NotFound(format!("driver {id} has no session")));
    }

    let released = state.ledger.release_unlocked_for(id);
    Ok(Json(LogoutResponse {
        driver_id: id,
        released_items: released.len(),
    }))
}

async fn list_drivers(State(state): State<Arc<AppState>>) -> Json<Vec<ActiveDriver>> {
    let drivers = state.sessions.list_active(|driver_id| {
        state
            .routes
            .get(&driver_id)
            .is_some_and(|route| route.status == RouteStatus::Active)
    });
    Json(drivers)
}

async fn create_transfer(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TransferRequest>,
) -> Result<Json<TransferRecord>, AppError> {
    let record = transfer_items(
        &state,
        payload.item_ids,
        payload.from_driver_id,
        payload.to_driver_id,
    )?;
    Ok(Json(record))
}
