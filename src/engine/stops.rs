use std::collections::BTreeMap;

use uuid::Uuid;

use crate::models::item::{DeliverableItem, GeoPoint, ItemStatus};
use crate::models::stop::StopKind;

/// Optimizer-facing description of a stop before it has been sequenced.
#[derive(Debug, Clone)]
pub struct StopInput {
    pub id: Uuid,
    pub kind: StopKind,
    pub address: String,
    pub location: GeoPoint,
    pub source_shop_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub item_ids: Vec<Uuid>,
    /// Dropoffs only: pickup stop ids that must come first.
    pub depends_on: Vec<Uuid>,
}

/// Groups a driver's claimed items into stop inputs: one pickup per source
/// shop still holding items, one dropoff per destination order, and the
/// pickup dependencies of every dropoff.
///
/// Items outside the actionable statuses are excluded entirely. An item
/// already out for delivery needs no pickup, so it contributes only to its
/// dropoff. Output order is keyed by shop/order id and therefore stable.
pub fn build_stop_inputs(items: &[DeliverableItem]) -> Vec<StopInput> {
    let actionable: Vec<&DeliverableItem> = items
        .iter()
        .filter(|item| item.status.is_actionable())
        .collect();

    // Pickups: Ready items grouped by source shop.
    let mut by_shop: BTreeMap<Uuid, Vec<&DeliverableItem>> = BTreeMap::new();
    for item in &actionable {
        if item.status == ItemStatus::Ready {
            by_shop.entry(item.source_shop_id).or_default().push(item);
        }
    }

    let mut pickups: Vec<StopInput> = Vec::with_capacity(by_shop.len());
    let mut pickup_by_shop: BTreeMap<Uuid, Uuid> = BTreeMap::new();
    for (shop_id, shop_items) in &by_shop {
        let first = shop_items[0];
        let stop_id = Uuid::new_v4();
        pickup_by_shop.insert(*shop_id, stop_id);
        pickups.push(StopInput {
            id: stop_id,
            kind: StopKind::Pickup,
            address: first.source_address.clone(),
            location: first.source_location.clone(),
            source_shop_id: Some(*shop_id),
            order_id: None,
            item_ids: shop_items.iter().map(|item| item.id).collect(),
            depends_on: Vec::new(),
        });
    }

    // Dropoffs: all actionable items grouped by destination order.
    let mut by_order: BTreeMap<Uuid, Vec<&DeliverableItem>> = BTreeMap::new();
    for item in &actionable {
        by_order.entry(item.order_id).or_default().push(item);
    }

    let mut dropoffs: Vec<StopInput> = Vec::with_capacity(by_order.len());
    for (order_id, order_items) in &by_order {
        let first = order_items[0];
        let mut depends_on: Vec<Uuid> = order_items
            .iter()
            .filter_map(|item| pickup_by_shop.get(&item.source_shop_id).copied())
            .collect();
        depends_on.sort();
        depends_on.dedup();

        dropoffs.push(StopInput {
            id: Uuid::new_v4(),
            kind: StopKind::Dropoff,
            address: first.destination_address.clone(),
            location: first.destination.clone(),
            source_shop_id: None,
            order_id: Some(*order_id),
            item_ids: order_items.iter().map(|item| item.id).collect(),
            depends_on,
        });
    }

    let mut inputs = pickups;
    inputs.extend(dropoffs);
    inputs
}
