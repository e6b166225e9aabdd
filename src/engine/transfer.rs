use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::event::RouteEvent;
use crate::models::route::{DriverRoute, RouteStatus};
use crate::models::stop::StopStatus;
use crate::models::transfer::TransferRecord;
use crate::state::AppState;

/// Hands a set of items from one driver to another. This is the only
/// operation allowed to move locked items. All-or-nothing: the single
/// failure mode is an inactive target, checked before any mutation.
pub fn transfer_items(
    state: &AppState,
    item_ids: Vec<Uuid>,
    from_driver_id: Uuid,
    to_driver_id: Uuid,
) -> Result<TransferRecord, AppError> {
    if item_ids.is_empty() {
        return Err(AppError::BadRequest("no items to transfer".to_string()));
    }
    if !state.sessions.is_active(to_driver_id) {
        state
            .metrics
            .transfers_total
            .with_label_values(&["rejected"])
            .inc();
        return Err(AppError::DriverNotActive(to_driver_id));
    }

    state.ledger.transfer_ownership(&item_ids, to_driver_id);

    // Queue the items on the target's active route so they get folded in
    // on the next recalculation. Guards are taken one at a time; the two
    // route entries are never held together.
    if let Some(mut target) = state.routes.get_mut(&to_driver_id) {
        if target.status == RouteStatus::Active {
            for &item_id in &item_ids {
                if !target.references_item(item_id) {
                    target.pending_new_item_ids.push(item_id);
                }
            }
        }
    }

    if let Some(mut source) = state.routes.get_mut(&from_driver_id) {
        strip_items_from_open_stops(source.value_mut(), &item_ids);
    }

    let record = TransferRecord {
        id: Uuid::new_v4(),
        item_ids: item_ids.clone(),
        from_driver_id,
        to_driver_id,
        transferred_at: Utc::now(),
    };
    state.transfers.insert(record.id, record.clone());

    state
        .metrics
        .transfers_total
        .with_label_values(&["success"])
        .inc();
    let _ = state.route_events_tx.send(RouteEvent::ItemsTransferred {
        from_driver_id,
        to_driver_id,
        item_ids,
    });
    info!(
        from = %from_driver_id,
        to = %to_driver_id,
        items = record.item_ids.len(),
        "items transferred"
    );

    Ok(record)
}

/// Removes the items from every non-completed stop on the source route,
/// pruning stops left empty. Completed stops are history and never touched.
fn strip_items_from_open_stops(route: &mut DriverRoute, item_ids: &[Uuid]) {
    for stop in route
        .stops
        .iter_mut()
        .filter(|s| s.status != StopStatus::Completed)
    {
        stop.item_ids.retain(|id| !item_ids.contains(id));
        stop.confirmed_item_ids.retain(|id| !item_ids.contains(id));
    }

    let mut pruned: Vec<Uuid> = Vec::new();
    route.stops.retain(|stop| {
        if stop.status == StopStatus::Completed || !stop.item_ids.is_empty() {
            true
        } else {
            pruned.push(stop.id);
            false
        }
    });

    for stop in route.stops.iter_mut() {
        stop.depends_on.retain(|dep| !pruned.contains(dep));
        stop.dependent_dropoffs.retain(|dep| !pruned.contains(dep));
    }

    route.pending_new_item_ids.retain(|id| !item_ids.contains(id));

    if route.status == RouteStatus::Active && !route.repoint_current() {
        route.status = RouteStatus::Completed;
        route.completed_at = Some(Utc::now());
    }
}
