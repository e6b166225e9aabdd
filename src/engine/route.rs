use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::optimizer::{OptimizeRequest, OptimizedPlan};
use crate::engine::stops::{build_stop_inputs, StopInput};
use crate::error::AppError;
use crate::models::event::RouteEvent;
use crate::models::item::{DeliverableItem, ItemStatus};
use crate::models::route::{DriverRoute, RouteStatus};
use crate::models::stop::{RouteStop, StopKind, StopStatus};
use crate::state::AppState;

/// Ledger side effect of an item status transition.
enum LedgerEffect {
    /// Item enters physical custody of its owner.
    Lock,
    /// Custody ends entirely; item leaves the ledger, lock included.
    Discharge,
    /// Ownership is dropped unless the item is locked.
    ReleaseUnlocked,
    Keep,
}

enum Stamp {
    PickedUp,
    Delivered,
    None,
}

/// Target status -> (ledger side effect, timestamp field to stamp).
fn status_effect(status: ItemStatus) -> (LedgerEffect, Stamp) {
    match status {
        ItemStatus::Ready => (LedgerEffect::Keep, Stamp::None),
        ItemStatus::OutForDelivery => (LedgerEffect::Lock, Stamp::PickedUp),
        ItemStatus::PickedUp => (LedgerEffect::Lock, Stamp::PickedUp),
        ItemStatus::Delivered => (LedgerEffect::Discharge, Stamp::Delivered),
        ItemStatus::DeliveredWithIssue => (LedgerEffect::Discharge, Stamp::Delivered),
        ItemStatus::OnHold => (LedgerEffect::ReleaseUnlocked, Stamp::None),
        ItemStatus::Canceled => (LedgerEffect::ReleaseUnlocked, Stamp::None),
    }
}

/// Moves an item to `status`, stamping timestamps and applying the ledger
/// side effect from the transition table. This is the single path through
/// which the engine ever touches item lifecycle state.
pub fn apply_item_status(
    state: &AppState,
    item_id: Uuid,
    status: ItemStatus,
) -> Result<DeliverableItem, AppError> {
    let (effect, stamp) = status_effect(status);

    let updated = {
        let mut item = state
            .items
            .get_mut(&item_id)
            .ok_or_else(|| AppError::NotFound(format!("item {item_id} not found")))?;
        item.status = status;
        let now = Utc::now();
        match stamp {
            Stamp::PickedUp => item.picked_up_at = Some(now),
            Stamp::Delivered => item.delivered_at = Some(now),
            Stamp::None => {}
        }
        item.clone()
    };

    match effect {
        LedgerEffect::Lock => {
            if let Some(owner) = state.ledger.owner_of(item_id) {
                state.ledger.lock(&[item_id], owner);
            }
        }
        LedgerEffect::Discharge => state.ledger.discharge(&[item_id]),
        LedgerEffect::ReleaseUnlocked => state.ledger.release(&[item_id]),
        LedgerEffect::Keep => {}
    }
    state
        .metrics
        .locked_items
        .set(state.ledger.locked_count() as i64);

    Ok(updated)
}

/// Builds and activates a fresh route for the driver's selected items.
pub async fn generate_route(
    state: Arc<AppState>,
    driver_id: Uuid,
    shift_end: DateTime<Utc>,
    item_ids: Vec<Uuid>,
) -> Result<DriverRoute, AppError> {
    if !state.sessions.is_active(driver_id) {
        return Err(AppError::DriverNotActive(driver_id));
    }
    if shift_end <= Utc::now() {
        return Err(AppError::BadRequest("shift end is in the past".to_string()));
    }
    if let Some(route) = state.routes.get(&driver_id) {
        if matches!(route.status, RouteStatus::Active | RouteStatus::Planning) {
            return Err(AppError::Conflict("route already in progress".to_string()));
        }
    }

    let mut items: Vec<DeliverableItem> = Vec::with_capacity(item_ids.len());
    for item_id in &item_ids {
        let item = state
            .items
            .get(item_id)
            .ok_or_else(|| AppError::NotFound(format!("item {item_id} not found")))?
            .clone();
        if !item.status.is_actionable() {
            continue;
        }
        // Physical custody elsewhere; only a transfer can move these.
        if state.ledger.is_owned_by_other(item.id, driver_id) && state.ledger.is_locked(item.id) {
            continue;
        }
        items.push(item);
    }

    let inputs = build_stop_inputs(&items);
    if inputs.is_empty() {
        return Err(AppError::NothingToPlan);
    }

    let generation = state
        .routes
        .get(&driver_id)
        .map(|route| route.generation)
        .unwrap_or(0)
        + 1;
    let previous = state.routes.insert(
        driver_id,
        planning_placeholder(driver_id, shift_end, generation),
    );

    let request = OptimizeRequest {
        stops: inputs,
        service_minutes: state.stop_service_minutes,
        now: Utc::now(),
        shift_end,
        home_base: state.home_base.clone(),
    };

    let started = Instant::now();
    let result = state.optimizer.plan(request).await;
    observe_plan(&state, started, result.is_ok());

    let plan = match result {
        Ok(plan) => plan,
        Err(err) => {
            restore_previous(&state, driver_id, generation, previous);
            warn!(driver_id = %driver_id, error = %err, "route generation failed");
            return Err(err);
        }
    };

    let mut entry = state
        .routes
        .get_mut(&driver_id)
        .ok_or_else(|| AppError::Conflict("route was ended during planning".to_string()))?;
    if entry.generation != generation || entry.status != RouteStatus::Planning {
        warn!(driver_id = %driver_id, "discarding stale optimizer response");
        return Err(AppError::Conflict(
            "route superseded during planning".to_string(),
        ));
    }

    let planned_items: Vec<Uuid> = plan
        .stops
        .iter()
        .flat_map(|stop| stop.input.item_ids.iter().copied())
        .collect();
    let claimed: HashSet<Uuid> = state.ledger.claim(&planned_items, driver_id).into_iter().collect();

    let stops = materialize_stops(&plan, &claimed, &HashMap::new());
    if stops.is_empty() {
        drop(entry);
        restore_previous(&state, driver_id, generation, previous);
        return Err(AppError::NothingToPlan);
    }

    entry.status = RouteStatus::Active;
    entry.stops = stops;
    entry.return_leg = Some(plan.return_leg);
    entry.unfit_stops = plan.unfit_stops;
    entry.repoint_current();
    let route = entry.clone();
    drop(entry);

    let _ = state.route_events_tx.send(RouteEvent::RoutePlanned {
        driver_id,
        stops: route.stops.len(),
    });
    info!(
        driver_id = %driver_id,
        stops = route.stops.len(),
        items = claimed.len(),
        "route generated"
    );

    Ok(route)
}

/// Folds pending and explicitly added work into an active route. Completed
/// stops are frozen; only the open remainder plus the new inputs reach the
/// optimizer, and the returned order is spliced after the frozen prefix.
pub async fn recalculate_route(
    state: Arc<AppState>,
    driver_id: Uuid,
    extra_item_ids: Vec<Uuid>,
) -> Result<DriverRoute, AppError> {
    if !state.sessions.is_active(driver_id) {
        return Err(AppError::DriverNotActive(driver_id));
    }

    let (generation, shift_end, inputs) = {
        let mut entry = state
            .routes
            .get_mut(&driver_id)
            .ok_or_else(|| AppError::NotFound(format!("no route for driver {driver_id}")))?;
        if entry.status != RouteStatus::Active {
            return Err(AppError::Conflict("route is not active".to_string()));
        }

        let mut incomplete: Vec<StopInput> = Vec::new();
        for stop in entry.stops.iter().filter(|s| s.is_open()) {
            let live: Vec<Uuid> = stop
                .item_ids
                .iter()
                .copied()
                .filter(|id| {
                    state
                        .items
                        .get(id)
                        .is_some_and(|item| item.status.is_actionable())
                })
                .collect();
            if live.is_empty() {
                continue;
            }
            incomplete.push(StopInput {
                id: stop.id,
                kind: stop.kind,
                address: stop.address.clone(),
                location: stop.location.clone(),
                source_shop_id: stop.source_shop_id,
                order_id: stop.order_id,
                item_ids: live,
                depends_on: stop.depends_on.clone(),
            });
        }
        // Completed pickups already satisfied their dependents.
        let open_ids: HashSet<Uuid> = incomplete.iter().map(|s| s.id).collect();
        for input in &mut incomplete {
            input.depends_on.retain(|dep| open_ids.contains(dep));
        }

        let mut fold: Vec<Uuid> = entry.pending_new_item_ids.clone();
        fold.extend(extra_item_ids);
        fold.sort();
        fold.dedup();
        let represented: HashSet<Uuid> = entry
            .stops
            .iter()
            .flat_map(|s| s.item_ids.iter().copied())
            .collect();
        let fold_items: Vec<DeliverableItem> = fold
            .into_iter()
            .filter(|id| !represented.contains(id))
            .filter_map(|id| state.items.get(&id).map(|item| item.clone()))
            .filter(|item| item.status.is_actionable())
            .filter(|item| {
                !(state.ledger.is_owned_by_other(item.id, driver_id)
                    && state.ledger.is_locked(item.id))
            })
            .collect();

        let mut inputs = incomplete;
        merge_new_inputs(&mut inputs, build_stop_inputs(&fold_items));
        if inputs.is_empty() {
            return Err(AppError::NothingToPlan);
        }

        let generation = entry.generation + 1;
        entry.generation = generation;
        entry.status = RouteStatus::Planning;
        (generation, entry.shift_end, inputs)
    };

    let request = OptimizeRequest {
        stops: inputs,
        service_minutes: state.stop_service_minutes,
        now: Utc::now(),
        shift_end,
        home_base: state.home_base.clone(),
    };

    let started = Instant::now();
    let result = state.optimizer.plan(request).await;
    observe_plan(&state, started, result.is_ok());

    let plan = match result {
        Ok(plan) => plan,
        Err(err) => {
            // Revert to the previous active route; nothing was committed.
            if let Some(mut entry) = state.routes.get_mut(&driver_id) {
                if entry.generation == generation && entry.status == RouteStatus::Planning {
                    entry.status = RouteStatus::Active;
                }
            }
            warn!(driver_id = %driver_id, error = %err, "route recalculation failed");
            return Err(err);
        }
    };

    let mut entry = state
        .routes
        .get_mut(&driver_id)
        .ok_or_else(|| AppError::Conflict("route was ended during recalculation".to_string()))?;
    if entry.generation != generation || entry.status != RouteStatus::Planning {
        warn!(driver_id = %driver_id, "discarding stale optimizer response");
        return Err(AppError::Conflict(
            "route superseded during recalculation".to_string(),
        ));
    }

    let planned_items: Vec<Uuid> = plan
        .stops
        .iter()
        .flat_map(|stop| stop.input.item_ids.iter().copied())
        .collect();
    let claimed: HashSet<Uuid> = state.ledger.claim(&planned_items, driver_id).into_iter().collect();

    let carry: HashMap<Uuid, StopCarry> = entry
        .stops
        .iter()
        .filter(|s| s.is_open())
        .map(|s| {
            (
                s.id,
                StopCarry {
                    confirmed: s.confirmed_item_ids.clone(),
                    issue: s.issue,
                },
            )
        })
        .collect();

    let optimized = materialize_stops(&plan, &claimed, &carry);
    if optimized.is_empty() {
        entry.status = RouteStatus::Active;
        return Err(AppError::NothingToPlan);
    }

    let mut stops: Vec<RouteStop> = entry
        .stops
        .iter()
        .filter(|s| s.status == StopStatus::Completed)
        .cloned()
        .collect();
    stops.extend(optimized);

    entry.stops = stops;
    entry.status = RouteStatus::Active;
    entry.pending_new_item_ids.clear();
    entry.return_leg = Some(plan.return_leg);
    entry.unfit_stops = plan.unfit_stops;
    entry.repoint_current();
    let route = entry.clone();
    drop(entry);

    let _ = state.route_events_tx.send(RouteEvent::RouteRecalculated {
        driver_id,
        stops: route.stops.len(),
    });
    info!(driver_id = %driver_id, stops = route.stops.len(), "route recalculated");

    Ok(route)
}

/// Completes the current stop, applies its item side effects, and moves the
/// pointer to the next open stop. Completing the last open stop completes
/// the route and releases the driver's non-locked items.
pub fn advance(state: &AppState, driver_id: Uuid) -> Result<DriverRoute, AppError> {
    let mut entry = state
        .routes
        .get_mut(&driver_id)
        .ok_or_else(|| AppError::NotFound(format!("no route for driver {driver_id}")))?;
    if entry.status != RouteStatus::Active {
        return Err(AppError::Conflict("route is not active".to_string()));
    }
    let index = entry.current_stop_index;
    let (stop_id, kind, stop_items) = {
        let stop = entry
            .current_stop()
            .ok_or_else(|| AppError::Conflict("no current stop".to_string()))?;
        if stop.cancelled {
            return Err(AppError::Conflict("current stop is cancelled".to_string()));
        }
        (stop.id, stop.kind, stop.item_ids.clone())
    };

    // Item transitions for this completion. Items already driven to an
    // exception status at this stop keep it; a picked-up item with no later
    // dropoff on the route is a pickup-only flow.
    let actionable = |item_id: Uuid| {
        state
            .items
            .get(&item_id)
            .is_some_and(|item| item.status.is_actionable())
    };
    let mut transitions: Vec<(Uuid, ItemStatus)> = Vec::new();
    match kind {
        StopKind::Pickup => {
            for &item_id in stop_items.iter().filter(|&&id| actionable(id)) {
                let has_dropoff = entry
                    .stops
                    .iter()
                    .skip(index + 1)
                    .any(|s| s.is_open() && s.item_ids.contains(&item_id));
                let target = if has_dropoff {
                    ItemStatus::OutForDelivery
                } else {
                    ItemStatus::PickedUp
                };
                transitions.push((item_id, target));
            }
        }
        StopKind::Dropoff => {
            for &item_id in stop_items.iter().filter(|&&id| actionable(id)) {
                transitions.push((item_id, ItemStatus::Delivered));
            }
        }
        StopKind::Task => {}
    }

    let now = Utc::now();
    {
        let stop = &mut entry.stops[index];
        stop.status = StopStatus::Completed;
        stop.completed_at = Some(now);
    }

    let route_done = !entry.repoint_current();
    if route_done {
        entry.status = RouteStatus::Completed;
        entry.completed_at = Some(now);
    }
    drop(entry);

    for (item_id, status) in transitions {
        if let Err(err) = apply_item_status(state, item_id, status) {
            warn!(item_id = %item_id, error = %err, "item transition skipped on stop completion");
        }
    }

    if route_done {
        state.ledger.release_unlocked_for(driver_id);
        let _ = state
            .route_events_tx
            .send(RouteEvent::RouteCompleted { driver_id });
        info!(driver_id = %driver_id, "route completed");
    }

    state
        .metrics
        .stops_completed_total
        .with_label_values(&[kind_label(kind)])
        .inc();
    let _ = state.route_events_tx.send(RouteEvent::StopCompleted {
        driver_id,
        stop_id,
        kind,
    });

    let route = state
        .routes
        .get(&driver_id)
        .map(|r| r.clone())
        .ok_or_else(|| AppError::Internal("route vanished during advance".to_string()))?;
    Ok(route)
}

/// Marks an item as individually handed over at a stop. Advisory only; the
/// stop still completes through [`advance`].
pub fn confirm_item(
    state: &AppState,
    driver_id: Uuid,
    stop_id: Uuid,
    item_id: Uuid,
) -> Result<DriverRoute, AppError> {
    with_open_stop(state, driver_id, stop_id, |stop| {
        if !stop.item_ids.contains(&item_id) {
            return Err(AppError::BadRequest(format!(
                "item {item_id} is not fulfilled at stop {stop_id}"
            )));
        }
        if !stop.confirmed_item_ids.contains(&item_id) {
            stop.confirmed_item_ids.push(item_id);
        }
        Ok(())
    })
}

pub fn unconfirm_item(
    state: &AppState,
    driver_id: Uuid,
    stop_id: Uuid,
    item_id: Uuid,
) -> Result<DriverRoute, AppError> {
    with_open_stop(state, driver_id, stop_id, |stop| {
        stop.confirmed_item_ids.retain(|id| *id != item_id);
        Ok(())
    })
}

/// Flags an issue at a stop and drives the item into the caller-chosen
/// exception status. The stop is cancelled outright once none of its items
/// remain actionable. Does not advance the route.
pub fn report_issue(
    state: &AppState,
    driver_id: Uuid,
    stop_id: Uuid,
    item_id: Uuid,
    status: ItemStatus,
) -> Result<DriverRoute, AppError> {
    if !status.is_exception() {
        return Err(AppError::BadRequest(format!(
            "status {status:?} is not an exception status"
        )));
    }

    let stop_items = {
        let mut entry = state
            .routes
            .get_mut(&driver_id)
            .ok_or_else(|| AppError::NotFound(format!("no route for driver {driver_id}")))?;
        if entry.status != RouteStatus::Active {
            return Err(AppError::Conflict("route is not active".to_string()));
        }
        let stop = entry
            .stops
            .iter_mut()
            .find(|s| s.id == stop_id)
            .ok_or_else(|| AppError::NotFound(format!("stop {stop_id} not found")))?;
        if stop.status == StopStatus::Completed {
            return Err(AppError::Conflict("stop already completed".to_string()));
        }
        if !stop.item_ids.contains(&item_id) {
            return Err(AppError::BadRequest(format!(
                "item {item_id} is not fulfilled at stop {stop_id}"
            )));
        }
        stop.issue = true;
        stop.item_ids.clone()
    };

    apply_item_status(state, item_id, status)?;

    let all_dead = stop_items.iter().all(|id| {
        state
            .items
            .get(id)
            .map(|item| !item.status.is_actionable())
            .unwrap_or(true)
    });

    let mut entry = state
        .routes
        .get_mut(&driver_id)
        .ok_or_else(|| AppError::Internal("route vanished during issue report".to_string()))?;
    let mut route_done = false;
    if all_dead {
        if let Some(stop) = entry.stops.iter_mut().find(|s| s.id == stop_id) {
            if stop.status == StopStatus::Current {
                stop.status = StopStatus::Pending;
            }
            stop.cancelled = true;
        }
        // The pointer must move off the cancelled stop; cancelling the last
        // open stop completes the route.
        if entry.status == RouteStatus::Active && !entry.repoint_current() {
            entry.status = RouteStatus::Completed;
            entry.completed_at = Some(Utc::now());
            route_done = true;
        }
    }
    let route = entry.clone();
    drop(entry);

    if route_done {
        state.ledger.release_unlocked_for(driver_id);
        let _ = state
            .route_events_tx
            .send(RouteEvent::RouteCompleted { driver_id });
        info!(driver_id = %driver_id, "route completed");
    }
    info!(driver_id = %driver_id, stop_id = %stop_id, item_id = %item_id, ?status, "issue reported");
    Ok(route)
}

/// Queues a newly deliverable item for the next recalculation. Used by the
/// pending-work watcher and exposed to external callers.
pub fn add_pending_item(
    state: &AppState,
    driver_id: Uuid,
    item_id: Uuid,
) -> Result<DriverRoute, AppError> {
    let mut entry = state
        .routes
        .get_mut(&driver_id)
        .ok_or_else(|| AppError::NotFound(format!("no route for driver {driver_id}")))?;
    if entry.status != RouteStatus::Active {
        return Err(AppError::Conflict("route is not active".to_string()));
    }
    if !entry.references_item(item_id) {
        entry.pending_new_item_ids.push(item_id);
        let route = entry.clone();
        drop(entry);
        let _ = state
            .route_events_tx
            .send(RouteEvent::PendingItemAdded { driver_id, item_id });
        return Ok(route);
    }
    Ok(entry.clone())
}

/// Forces the route to `Completed` and releases the driver's non-locked
/// items. Bumping the generation makes any in-flight optimizer response
/// stale, so it can never overwrite the ended route.
pub fn end_route(state: &AppState, driver_id: Uuid) -> Result<DriverRoute, AppError> {
    let mut entry = state
        .routes
        .get_mut(&driver_id)
        .ok_or_else(|| AppError::NotFound(format!("no route for driver {driver_id}")))?;
    entry.status = RouteStatus::Completed;
    entry.completed_at = Some(Utc::now());
    entry.generation += 1;
    let route = entry.clone();
    drop(entry);

    let released = state.ledger.release_unlocked_for(driver_id);
    let _ = state.route_events_tx.send(RouteEvent::RouteEnded { driver_id });
    info!(driver_id = %driver_id, released = released.len(), "route ended");
    Ok(route)
}

fn with_open_stop(
    state: &AppState,
    driver_id: Uuid,
    stop_id: Uuid,
    mutate: impl FnOnce(&mut RouteStop) -> Result<(), AppError>,
) -> Result<DriverRoute, AppError> {
    let mut entry = state
        .routes
        .get_mut(&driver_id)
        .ok_or_else(|| AppError::NotFound(format!("no route for driver {driver_id}")))?;
    if entry.status != RouteStatus::Active {
        return Err(AppError::Conflict("route is not active".to_string()));
    }
    let stop = entry
        .stops
        .iter_mut()
        .find(|s| s.id == stop_id)
        .ok_or_else(|| AppError::NotFound(format!("stop {stop_id} not found")))?;
    if stop.status == StopStatus::Completed {
        return Err(AppError::Conflict("stop already completed".to_string()));
    }
    mutate(stop)?;
    Ok(entry.clone())
}

struct StopCarry {
    confirmed: Vec<Uuid>,
    issue: bool,
}

fn planning_placeholder(driver_id: Uuid, shift_end: DateTime<Utc>, generation: u64) -> DriverRoute {
    DriverRoute {
        driver_id,
        status: RouteStatus::Planning,
        stops: Vec::new(),
        current_stop_index: 0,
        pending_new_item_ids: Vec::new(),
        shift_end,
        return_leg: None,
        unfit_stops: 0,
        generation,
        created_at: Utc::now(),
        completed_at: None,
    }
}

fn restore_previous(
    state: &AppState,
    driver_id: Uuid,
    generation: u64,
    previous: Option<DriverRoute>,
) {
    match previous {
        Some(prev) => {
            if let Some(mut entry) = state.routes.get_mut(&driver_id) {
                if entry.generation == generation && entry.status == RouteStatus::Planning {
                    *entry = prev;
                }
            }
        }
        None => {
            state.routes.remove_if(&driver_id, |_, route| {
                route.generation == generation && route.status == RouteStatus::Planning
            });
        }
    }
}

/// Turns an optimizer plan into route stops, keeping only items the ledger
/// actually granted and pruning any stop left without items. Dependency
/// links are rewired to the surviving stop set.
fn materialize_stops(
    plan: &OptimizedPlan,
    claimed: &HashSet<Uuid>,
    carry: &HashMap<Uuid, StopCarry>,
) -> Vec<RouteStop> {
    let mut stops: Vec<RouteStop> = Vec::with_capacity(plan.stops.len());
    for optimized in &plan.stops {
        let input = &optimized.input;
        let item_ids: Vec<Uuid> = input
            .item_ids
            .iter()
            .copied()
            .filter(|id| claimed.contains(id))
            .collect();
        if item_ids.is_empty() {
            continue;
        }

        let (confirmed, issue) = carry
            .get(&input.id)
            .map(|c| {
                let kept: Vec<Uuid> = c
                    .confirmed
                    .iter()
                    .copied()
                    .filter(|id| item_ids.contains(id))
                    .collect();
                (kept, c.issue)
            })
            .unwrap_or_default();

        stops.push(RouteStop {
            id: input.id,
            kind: input.kind,
            status: StopStatus::Pending,
            address: input.address.clone(),
            location: input.location.clone(),
            source_shop_id: input.source_shop_id,
            order_id: input.order_id,
            item_ids,
            confirmed_item_ids: confirmed,
            depends_on: input.depends_on.clone(),
            dependent_dropoffs: Vec::new(),
            issue,
            cancelled: false,
            eta_arrival: Some(optimized.eta_arrival),
            eta_departure: Some(optimized.eta_departure),
            travel_minutes: optimized.travel_minutes,
            travel_km: optimized.travel_km,
            fits_in_shift: optimized.fits_in_shift,
            rationale: optimized.rationale.clone(),
            completed_at: None,
        });
    }

    let kept: HashSet<Uuid> = stops.iter().map(|s| s.id).collect();
    let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for stop in &mut stops {
        stop.depends_on.retain(|dep| kept.contains(dep));
        if stop.kind == StopKind::Dropoff {
            for dep in &stop.depends_on {
                dependents.entry(*dep).or_default().push(stop.id);
            }
        }
    }
    for stop in &mut stops {
        if let Some(dropoffs) = dependents.remove(&stop.id) {
            stop.dependent_dropoffs = dropoffs;
        }
    }

    stops
}

/// Merges freshly built inputs into the surviving open-stop inputs: new
/// items for a shop or order that already has an open stop join that stop
/// instead of spawning a duplicate.
fn merge_new_inputs(existing: &mut Vec<StopInput>, new_inputs: Vec<StopInput>) {
    let mut remap: HashMap<Uuid, Uuid> = HashMap::new();
    let (pickups, dropoffs): (Vec<StopInput>, Vec<StopInput>) = new_inputs
        .into_iter()
        .partition(|s| s.kind == StopKind::Pickup);

    for pickup in pickups {
        if let Some(open_pickup) = existing
            .iter_mut()
            .find(|s| s.kind == StopKind::Pickup && s.source_shop_id == pickup.source_shop_id)
        {
            remap.insert(pickup.id, open_pickup.id);
            for item_id in pickup.item_ids {
                if !open_pickup.item_ids.contains(&item_id) {
                    open_pickup.item_ids.push(item_id);
                }
            }
        } else {
            existing.push(pickup);
        }
    }

    for mut dropoff in dropoffs {
        for dep in &mut dropoff.depends_on {
            if let Some(mapped) = remap.get(dep) {
                *dep = *mapped;
            }
        }
        if let Some(open_dropoff) = existing
            .iter_mut()
            .find(|s| s.kind == StopKind::Dropoff && s.order_id == dropoff.order_id)
        {
            for item_id in dropoff.item_ids {
                if !open_dropoff.item_ids.contains(&item_id) {
                    open_dropoff.item_ids.push(item_id);
                }
            }
            for dep in dropoff.depends_on {
                if !open_dropoff.depends_on.contains(&dep) {
                    open_dropoff.depends_on.push(dep);
                }
            }
        } else {
            existing.push(dropoff);
        }
    }
}

fn observe_plan(state: &AppState, started: Instant, success: bool) {
    let outcome = if success { "success" } else { "error" };
    state
        .metrics
        .optimizer_latency_seconds
        .with_label_values(&[outcome])
        .observe(started.elapsed().as_secs_f64());
    state
        .metrics
        .routes_planned_total
        .with_label_values(&[outcome])
        .inc();
}

fn kind_label(kind: StopKind) -> &'static str {
    match kind {
        StopKind::Pickup => "pickup",
        StopKind::Dropoff => "dropoff",
        StopKind::Task => "task",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use futures::future::BoxFuture;
    use uuid::Uuid;

    use super::*;
    use crate::config::Config;
    use crate::engine::optimizer::test_support::echo_plan;
    use crate::engine::optimizer::RouteOptimizer;
    use crate::models::item::GeoPoint;

    /// Echoes request order and records the stop ids of every call.
    struct RecordingOptimizer {
        calls: Mutex<Vec<Vec<Uuid>>>,
        delay_ms: u64,
    }

    impl RecordingOptimizer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                delay_ms: 0,
            })
        }

        fn slow(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                delay_ms,
            })
        }

        fn recorded(&self) -> Vec<Vec<Uuid>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RouteOptimizer for RecordingOptimizer {
        fn optimize(
            &self,
            request: crate::engine::optimizer::OptimizeRequest,
        ) -> BoxFuture<'static, Result<OptimizedPlan, AppError>> {
            self.calls
                .lock()
                .unwrap()
                .push(request.stops.iter().map(|s| s.id).collect());
            let delay_ms = self.delay_ms;
            Box::pin(async move {
                if delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
                Ok(echo_plan(&request))
            })
        }
    }

    fn test_config() -> Config {
        Config {
            http_port: 0,
            log_level: "info".to_string(),
            item_queue_size: 16,
            event_buffer_size: 16,
            optimizer_timeout_secs: 5,
            stop_service_minutes: 5,
            max_stops_per_optimizer_call: 25,
            home_base: GeoPoint {
                lat: 53.5511,
                lng: 9.9937,
            },
        }
    }

    fn test_state(optimizer: Arc<dyn RouteOptimizer>) -> Arc<AppState> {
        let (state, _item_rx) = AppState::new(&test_config(), optimizer);
        Arc::new(state)
    }

    fn seed_item(state: &AppState, seed: u128, shop: u128, order: u128) -> Uuid {
        let item = DeliverableItem {
            id: Uuid::from_u128(seed),
            order_id: Uuid::from_u128(order),
            source_shop_id: Uuid::from_u128(shop),
            source_address: format!("Shop {shop}"),
            source_location: GeoPoint {
                lat: 53.55,
                lng: 9.99,
            },
            destination_address: format!("Order {order}"),
            destination: GeoPoint {
                lat: 53.56,
                lng: 10.00,
            },
            due_by: Utc::now() + chrono::Duration::hours(4),
            status: ItemStatus::Ready,
            picked_up_at: None,
            delivered_at: None,
            created_at: Utc::now(),
        };
        let id = item.id;
        state.items.insert(id, item);
        id
    }

    fn login(state: &AppState, seed: u128) -> Uuid {
        let driver = Uuid::from_u128(seed);
        state.sessions.register(driver, format!("driver-{seed}"));
        driver
    }

    fn shift_end() -> chrono::DateTime<Utc> {
        Utc::now() + chrono::Duration::hours(8)
    }

    #[tokio::test]
    async fn generate_claims_items_and_activates_route() {
        let state = test_state(RecordingOptimizer::new());
        let driver = login(&state, 1);
        let x1 = seed_item(&state, 10, 100, 1000);
        let x2 = seed_item(&state, 11, 100, 2000);

        let route = generate_route(state.clone(), driver, shift_end(), vec![x1, x2])
            .await
            .unwrap();

        assert_eq!(route.status, RouteStatus::Active);
        // One pickup for the shared shop, two dropoffs.
        assert_eq!(route.stops.len(), 3);
        assert_eq!(route.stops[0].kind, StopKind::Pickup);
        assert_eq!(route.stops[0].status, StopStatus::Current);
        assert_eq!(route.current_stop_index, 0);
        assert_eq!(state.ledger.owner_of(x1), Some(driver));
        assert_eq!(state.ledger.owner_of(x2), Some(driver));
        assert!(!state.ledger.is_locked(x1));
    }

    #[tokio::test]
    async fn generate_requires_active_session() {
        let state = test_state(RecordingOptimizer::new());
        let driver = Uuid::from_u128(1);
        let x1 = seed_item(&state, 10, 100, 1000);

        let result = generate_route(state.clone(), driver, shift_end(), vec![x1]).await;
        assert!(matches!(result, Err(AppError::DriverNotActive(_))));
    }

    #[tokio::test]
    async fn generate_with_no_actionable_items_is_nothing_to_plan() {
        let state = test_state(RecordingOptimizer::new());
        let driver = login(&state, 1);
        let x1 = seed_item(&state, 10, 100, 1000);
        apply_item_status(&state, x1, ItemStatus::Canceled).unwrap();

        let result = generate_route(state.clone(), driver, shift_end(), vec![x1]).await;
        assert!(matches!(result, Err(AppError::NothingToPlan)));
        assert!(state.routes.get(&driver).is_none());
    }

    #[tokio::test]
    async fn advance_locks_pickup_items_and_delivers_dropoffs() {
        let state = test_state(RecordingOptimizer::new());
        let driver = login(&state, 1);
        let x1 = seed_item(&state, 10, 100, 1000);

        generate_route(state.clone(), driver, shift_end(), vec![x1])
            .await
            .unwrap();

        // Pickup completes: item is physically held.
        let route = advance(&state, driver).unwrap();
        assert!(state.ledger.is_locked(x1));
        assert_eq!(
            state.items.get(&x1).unwrap().status,
            ItemStatus::OutForDelivery
        );
        assert_eq!(route.stops[0].status, StopStatus::Completed);
        assert_eq!(route.stops[1].status, StopStatus::Current);

        // Dropoff completes: item delivered, custody discharged, route done.
        let route = advance(&state, driver).unwrap();
        assert_eq!(route.status, RouteStatus::Completed);
        assert_eq!(state.items.get(&x1).unwrap().status, ItemStatus::Delivered);
        assert_eq!(state.ledger.owner_of(x1), None);
        assert!(state.items.get(&x1).unwrap().delivered_at.is_some());
    }

    #[tokio::test]
    async fn recalculate_freezes_completed_prefix_and_optimizes_remainder() {
        let optimizer = RecordingOptimizer::new();
        let state = test_state(optimizer.clone());
        let driver = login(&state, 1);
        // x1, x2 from shop P to orders O1, O2.
        let x1 = seed_item(&state, 10, 100, 1000);
        let x2 = seed_item(&state, 11, 100, 2000);

        let route = generate_route(state.clone(), driver, shift_end(), vec![x1, x2])
            .await
            .unwrap();
        assert_eq!(route.stops.len(), 3);

        // Complete pickup-P and the first dropoff.
        advance(&state, driver).unwrap();
        let route = advance(&state, driver).unwrap();
        let frozen_ids: Vec<Uuid> = route
            .stops
            .iter()
            .filter(|s| s.status == StopStatus::Completed)
            .map(|s| s.id)
            .collect();
        assert_eq!(frozen_ids.len(), 2);
        let open_dropoff_id = route.stops[2].id;

        // x3 from shop Q to order O3 appears and is folded in.
        let x3 = seed_item(&state, 12, 200, 3000);
        add_pending_item(&state, driver, x3).unwrap();

        let route = recalculate_route(state.clone(), driver, Vec::new())
            .await
            .unwrap();

        // Frozen prefix unchanged and in order.
        let prefix: Vec<Uuid> = route.stops[..2].iter().map(|s| s.id).collect();
        assert_eq!(prefix, frozen_ids);
        assert!(route.stops[..2]
            .iter()
            .all(|s| s.status == StopStatus::Completed));

        // Remainder: old open dropoff plus pickup-Q and dropoff-O3.
        assert_eq!(route.stops.len(), 5);
        assert!(route.stops[2..].iter().any(|s| s.id == open_dropoff_id));
        assert!(route.pending_new_item_ids.is_empty());
        assert_eq!(state.ledger.owner_of(x3), Some(driver));

        // Second optimizer call saw only the incomplete remainder.
        let calls = optimizer.recorded();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].len(), 3);
        assert!(calls[1].contains(&open_dropoff_id));
        assert!(!calls[1].contains(&frozen_ids[0]));
        assert!(!calls[1].contains(&frozen_ids[1]));
    }

    #[tokio::test]
    async fn recalculate_merges_new_items_into_existing_open_stops() {
        let state = test_state(RecordingOptimizer::new());
        let driver = login(&state, 1);
        let x1 = seed_item(&state, 10, 100, 1000);

        generate_route(state.clone(), driver, shift_end(), vec![x1])
            .await
            .unwrap();

        // Same shop, same order: no new stops should appear.
        let x2 = seed_item(&state, 11, 100, 1000);
        let route = recalculate_route(state.clone(), driver, vec![x2])
            .await
            .unwrap();

        assert_eq!(route.stops.len(), 2);
        assert!(route.stops.iter().all(|s| s.item_ids.contains(&x2)));
        assert_eq!(state.ledger.owner_of(x2), Some(driver));
    }

    #[tokio::test]
    async fn stale_optimizer_response_cannot_overwrite_ended_route() {
        let state = test_state(RecordingOptimizer::slow(80));
        let driver = login(&state, 1);
        let x1 = seed_item(&state, 10, 100, 1000);

        generate_route(state.clone(), driver, shift_end(), vec![x1])
            .await
            .unwrap();

        let recalc_state = state.clone();
        let x2 = seed_item(&state, 11, 200, 2000);
        let handle = tokio::spawn(async move {
            recalculate_route(recalc_state, driver, vec![x2]).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        end_route(&state, driver).unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(AppError::Conflict(_))));

        let route = state.routes.get(&driver).unwrap().clone();
        assert_eq!(route.status, RouteStatus::Completed);
        // The stale plan never landed.
        assert_eq!(route.stops.len(), 2);
    }

    #[tokio::test]
    async fn end_route_releases_unlocked_but_keeps_locked_custody() {
        let state = test_state(RecordingOptimizer::new());
        let driver = login(&state, 1);
        let x1 = seed_item(&state, 10, 100, 1000);
        let x2 = seed_item(&state, 11, 200, 2000);

        generate_route(state.clone(), driver, shift_end(), vec![x1, x2])
            .await
            .unwrap();
        state.ledger.lock(&[x1], driver);

        end_route(&state, driver).unwrap();

        assert_eq!(state.ledger.owner_of(x1), Some(driver));
        assert!(state.ledger.is_locked(x1));
        assert_eq!(state.ledger.owner_of(x2), None);
    }

    #[tokio::test]
    async fn confirmation_is_advisory_and_survives_recalculation() {
        let state = test_state(RecordingOptimizer::new());
        let driver = login(&state, 1);
        let x1 = seed_item(&state, 10, 100, 1000);

        let route = generate_route(state.clone(), driver, shift_end(), vec![x1])
            .await
            .unwrap();
        let pickup_id = route.stops[0].id;

        let route = confirm_item(&state, driver, pickup_id, x1).unwrap();
        assert_eq!(route.stops[0].confirmed_item_ids, vec![x1]);

        let route = recalculate_route(state.clone(), driver, vec![seed_item(&state, 11, 200, 2000)])
            .await
            .unwrap();
        let pickup = route.stops.iter().find(|s| s.id == pickup_id).unwrap();
        assert_eq!(pickup.confirmed_item_ids, vec![x1]);

        let route = unconfirm_item(&state, driver, pickup_id, x1).unwrap();
        let pickup = route.stops.iter().find(|s| s.id == pickup_id).unwrap();
        assert!(pickup.confirmed_item_ids.is_empty());
    }

    #[tokio::test]
    async fn report_issue_cancels_stop_once_nothing_actionable_remains() {
        let state = test_state(RecordingOptimizer::new());
        let driver = login(&state, 1);
        let x1 = seed_item(&state, 10, 100, 1000);

        let route = generate_route(state.clone(), driver, shift_end(), vec![x1])
            .await
            .unwrap();
        let pickup_id = route.stops[0].id;
        let dropoff_id = route.stops[1].id;

        let route = report_issue(&state, driver, dropoff_id, x1, ItemStatus::OnHold).unwrap();
        let dropoff = route.stops.iter().find(|s| s.id == dropoff_id).unwrap();
        assert!(dropoff.issue);
        assert!(dropoff.cancelled);
        assert_eq!(state.items.get(&x1).unwrap().status, ItemStatus::OnHold);
        // On hold and unlocked: ownership released.
        assert_eq!(state.ledger.owner_of(x1), None);

        // The pickup also holds only x1, but it was not reported against.
        let pickup = route.stops.iter().find(|s| s.id == pickup_id).unwrap();
        assert!(!pickup.issue);
    }

    #[tokio::test]
    async fn advance_keeps_exception_status_of_reported_items() {
        let state = test_state(RecordingOptimizer::new());
        let driver = login(&state, 1);
        // Same order: one dropoff fulfilling both items.
        let x1 = seed_item(&state, 10, 100, 1000);
        let x2 = seed_item(&state, 11, 100, 1000);

        let route = generate_route(state.clone(), driver, shift_end(), vec![x1, x2])
            .await
            .unwrap();
        assert_eq!(route.stops.len(), 2);
        let dropoff_id = route.stops[1].id;

        // Pickup done: both items in hand.
        advance(&state, driver).unwrap();
        report_issue(&state, driver, dropoff_id, x1, ItemStatus::OnHold).unwrap();

        let route = advance(&state, driver).unwrap();
        assert_eq!(route.status, RouteStatus::Completed);

        // x2 delivered and discharged; x1 keeps its exception status and
        // its custody record, because the stack is still in the van.
        assert_eq!(state.items.get(&x2).unwrap().status, ItemStatus::Delivered);
        assert_eq!(state.ledger.owner_of(x2), None);
        assert_eq!(state.items.get(&x1).unwrap().status, ItemStatus::OnHold);
        assert_eq!(state.ledger.owner_of(x1), Some(driver));
        assert!(state.ledger.is_locked(x1));
    }

    #[tokio::test]
    async fn cancelling_current_stop_repoints_to_next_open_stop() {
        let state = test_state(RecordingOptimizer::new());
        let driver = login(&state, 1);
        // Shared pickup, two separate dropoffs.
        let x1 = seed_item(&state, 10, 100, 1000);
        let x2 = seed_item(&state, 11, 100, 2000);

        let route = generate_route(state.clone(), driver, shift_end(), vec![x1, x2])
            .await
            .unwrap();
        assert_eq!(route.stops.len(), 3);

        advance(&state, driver).unwrap();
        let route = state.routes.get(&driver).unwrap().clone();
        assert_eq!(route.current_stop_index, 1);
        let cancelled_id = route.stops[1].id;
        let cancelled_item = route.stops[1].item_ids[0];
        let surviving_item = if cancelled_item == x1 { x2 } else { x1 };

        let route = report_issue(&state, driver, cancelled_id, cancelled_item, ItemStatus::Canceled)
            .unwrap();
        assert!(route.stops[1].cancelled);
        assert_ne!(route.stops[1].status, StopStatus::Current);
        assert_eq!(route.current_stop_index, 2);
        assert_eq!(route.stops[2].status, StopStatus::Current);

        let route = advance(&state, driver).unwrap();
        assert_eq!(route.status, RouteStatus::Completed);
        assert_eq!(
            state.items.get(&surviving_item).unwrap().status,
            ItemStatus::Delivered
        );
        assert_eq!(
            state.items.get(&cancelled_item).unwrap().status,
            ItemStatus::Canceled
        );
    }

    #[tokio::test]
    async fn cancelling_last_open_stop_completes_route() {
        let state = test_state(RecordingOptimizer::new());
        let driver = login(&state, 1);
        let x1 = seed_item(&state, 10, 100, 1000);

        let route = generate_route(state.clone(), driver, shift_end(), vec![x1])
            .await
            .unwrap();
        let dropoff_id = route.stops[1].id;

        advance(&state, driver).unwrap();
        let route = report_issue(&state, driver, dropoff_id, x1, ItemStatus::Canceled).unwrap();

        assert_eq!(route.status, RouteStatus::Completed);
        assert_eq!(route.current_stop_index, route.stops.len());
        assert!(route.completed_at.is_some());

        let result = advance(&state, driver);
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn report_issue_rejects_non_exception_status() {
        let state = test_state(RecordingOptimizer::new());
        let driver = login(&state, 1);
        let x1 = seed_item(&state, 10, 100, 1000);

        let route = generate_route(state.clone(), driver, shift_end(), vec![x1])
            .await
            .unwrap();
        let stop_id = route.stops[0].id;

        let result = report_issue(&state, driver, stop_id, x1, ItemStatus::Delivered);
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }
}
