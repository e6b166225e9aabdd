use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::route::apply_item_status;
use crate::engine::watcher::enqueue_item_event;
use crate::error::AppError;
use crate::models::item::{DeliverableItem, GeoPoint, ItemStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/items", post(create_item))
        .route("/items/:id", get(get_item))
        .route("/items/:id/status", patch(update_item_status))
}

#[derive(Deserialize)]
pub struct CreateItemRequest {
    pub order_id: Uuid,
    pub source_shop_id: Uuid,
    pub source_address: String,
    pub source_location: GeoPoint,
    pub destination_address: String,
    pub destination: GeoPoint,
    pub due_by: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: ItemStatus,
}

async fn create_item(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateItemRequest>,
) -> Result<Json<DeliverableItem>, AppError> {
    if payload.source_address.trim().is_empty() || payload.destination_address.trim().is_empty() {
        return Err(AppError::BadRequest("address cannot be empty".to_string()));
    }

    let item = DeliverableItem {
        id: Uuid::new_v4(),
        order_id: payload.order_id,
        source_shop_id: payload.source_shop_id,
        source_address: payload.source_address,
        source_location: payload.source_location,
        destination_address: payload.destination_address,
        destination: payload.destination,
        due_by: payload.due_by,
        status: ItemStatus::Ready,
        picked_up_at: None,
        delivered_at: None,
        created_at: Utc::now(),
    };

    state.items.insert(item.id, item.clone());
    enqueue_item_event(&state, item.clone()).await?;

    Ok(Json(item))
}

async fn get_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliverableItem>, AppError> {
    let item = state
        .items
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("item {id} not found")))?;

    Ok(Json(item.value().clone()))
}

/// The externally owned `set item status` operation. Status changes flow
/// through the same transition table the engine uses, then feed the
/// pending-work watcher.
async fn update_item_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<DeliverableItem>, AppError> {
    let updated = apply_item_status(&state, id, payload.status)?;
    enqueue_item_event(&state, updated.clone()).await?;

    Ok(Json(updated))
}
