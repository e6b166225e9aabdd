use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSession {
    pub driver_id: Uuid,
    pub name: String,
    pub started_at: DateTime<Utc>,
}

/// `list active` view: a session annotated with whether the driver has a
/// route in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveDriver {
    pub driver_id: Uuid,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub has_active_route: bool,
}
