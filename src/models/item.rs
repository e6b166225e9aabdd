use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Lifecycle of a deliverable item. The route engine only moves items
/// between these states as a side effect of stop completion or an issue
/// report; everything else is driven from outside.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ItemStatus {
    Ready,
    OutForDelivery,
    PickedUp,
    Delivered,
    DeliveredWithIssue,
    OnHold,
    Canceled,
}

impl ItemStatus {
    /// Statuses in which an item may still appear in a stop.
    pub fn is_actionable(self) -> bool {
        matches!(self, ItemStatus::Ready | ItemStatus::OutForDelivery)
    }

    /// Statuses a driver may report as the outcome of an issue on a stop.
    pub fn is_exception(self) -> bool {
        matches!(
            self,
            ItemStatus::DeliveredWithIssue | ItemStatus::OnHold | ItemStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverableItem {
    pub id: Uuid,
    /// Destination order this item belongs to; one dropoff stop per order.
    pub order_id: Uuid,
    /// Print shop the item has to be collected from.
    pub source_shop_id: Uuid,
    pub source_address: String,
    pub source_location: GeoPoint,
    pub destination_address: String,
    pub destination: GeoPoint,
    pub due_by: DateTime<Utc>,
    pub status: ItemStatus,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
