use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::stop::StopKind;

/// Route lifecycle notifications, broadcast to websocket subscribers. The
/// pending-work watcher only produces events (`PendingItemAdded` when new
/// deliverable work lands in a driver's scope); nothing in the engine
/// consumes this stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RouteEvent {
    RoutePlanned { driver_id: Uuid, stops: usize },
    RouteRecalculated { driver_id: Uuid, stops: usize },
    StopCompleted { driver_id: Uuid, stop_id: Uuid, kind: StopKind },
    RouteCompleted { driver_id: Uuid },
    RouteEnded { driver_id: Uuid },
    PendingItemAdded { driver_id: Uuid, item_id: Uuid },
    ItemsTransferred { from_driver_id: Uuid, to_driver_id: Uuid, item_ids: Vec<Uuid> },
}
