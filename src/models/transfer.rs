use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Record of a completed hand-off of items between two drivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub item_ids: Vec<Uuid>,
    pub from_driver_id: Uuid,
    pub to_driver_id: Uuid,
    pub transferred_at: DateTime<Utc>,
}
