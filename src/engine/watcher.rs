use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::AppError;
use crate::models::event::RouteEvent;
use crate::models::item::{DeliverableItem, ItemStatus};
use crate::models::route::RouteStatus;
use crate::state::AppState;

/// Feeds an item lifecycle change into the watcher queue.
pub async fn enqueue_item_event(state: &AppState, item: DeliverableItem) -> Result<(), AppError> {
    state
        .item_tx
        .send(item)
        .await
        .map_err(|err| AppError::Internal(format!("item queue send failed: {err}")))
}

/// Watches item lifecycle changes and queues newly deliverable work on the
/// owning driver's active route, to be folded in on the next recalculation.
pub async fn run_pending_watcher(
    state: Arc<AppState>,
    mut item_rx: mpsc::Receiver<DeliverableItem>,
) {
    info!("pending-work watcher started");

    while let Some(item) = item_rx.recv().await {
        if item.status != ItemStatus::Ready {
            continue;
        }
        let Some(owner) = state.ledger.owner_of(item.id) else {
            continue;
        };

        let queued = {
            let Some(mut route) = state.routes.get_mut(&owner) else {
                continue;
            };
            if route.status != RouteStatus::Active || route.references_item(item.id) {
                continue;
            }
            route.pending_new_item_ids.push(item.id);
            true
        };

        if queued {
            let _ = state.route_events_tx.send(RouteEvent::PendingItemAdded {
                driver_id: owner,
                item_id: item.id,
            });
            info!(item_id = %item.id, driver_id = %owner, "pending item queued for active route");
        }
    }

    warn!("pending-work watcher stopped: item channel closed");
}
