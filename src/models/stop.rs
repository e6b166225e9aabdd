use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::item::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopKind {
    Pickup,
    Dropoff,
    Task,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopStatus {
    Pending,
    Current,
    Completed,
}

/// One physical visit on a driver's route. Timing fields come from the
/// optimizer; `confirmed_item_ids` is advisory bookkeeping and never gates
/// stop completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStop {
    pub id: Uuid,
    pub kind: StopKind,
    pub status: StopStatus,
    pub address: String,
    pub location: GeoPoint,
    /// Pickup stops: the shop being visited. Dropoffs: `None`.
    pub source_shop_id: Option<Uuid>,
    /// Dropoff stops: the destination order. Pickups: `None`.
    pub order_id: Option<Uuid>,
    pub item_ids: Vec<Uuid>,
    pub confirmed_item_ids: Vec<Uuid>,
    /// Dropoffs: pickup stops that must be visited first.
    pub depends_on: Vec<Uuid>,
    /// Pickups: dropoff stops supplied by this visit.
    pub dependent_dropoffs: Vec<Uuid>,
    pub issue: bool,
    pub cancelled: bool,
    pub eta_arrival: Option<DateTime<Utc>>,
    pub eta_departure: Option<DateTime<Utc>>,
    pub travel_minutes: f64,
    pub travel_km: f64,
    pub fits_in_shift: bool,
    pub rationale: String,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RouteStop {
    pub fn is_open(&self) -> bool {
        self.status != StopStatus::Completed && !self.cancelled
    }
}
