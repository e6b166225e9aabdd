use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::stop::{RouteStop, StopStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RouteStatus {
    Idle,
    Planning,
    Active,
    Completed,
}

/// Leg from the last stop back to home base, computed by the optimizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnLeg {
    pub travel_minutes: f64,
    pub travel_km: f64,
    pub eta_arrival: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverRoute {
    pub driver_id: Uuid,
    pub status: RouteStatus,
    pub stops: Vec<RouteStop>,
    /// Index of the first open stop, or `stops.len()` when none remain.
    pub current_stop_index: usize,
    /// Items that became deliverable after the last (re)plan; folded in on
    /// the next recalculation.
    pub pending_new_item_ids: Vec<Uuid>,
    pub shift_end: DateTime<Utc>,
    pub return_leg: Option<ReturnLeg>,
    pub unfit_stops: u32,
    /// Bumped on every (re)plan and on end; stale optimizer responses carry
    /// an older value and are discarded.
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DriverRoute {
    pub fn current_stop(&self) -> Option<&RouteStop> {
        self.stops.get(self.current_stop_index)
    }

    pub fn references_item(&self, item_id: Uuid) -> bool {
        self.pending_new_item_ids.contains(&item_id)
            || self.stops.iter().any(|stop| stop.item_ids.contains(&item_id))
    }

    /// Re-points `current_stop_index` at the first open stop and flags it
    /// `Current`. Returns false when no open stop remains.
    pub fn repoint_current(&mut self) -> bool {
        for (index, stop) in self.stops.iter_mut().enumerate() {
            if stop.status == StopStatus::Completed || stop.cancelled {
                continue;
            }
            stop.status = StopStatus::Current;
            self.current_stop_index = index;
            return true;
        }
        self.current_stop_index = self.stops.len();
        false
    }
}
