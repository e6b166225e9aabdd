use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::session::{ActiveDriver, DriverSession};

/// Tracks which drivers are currently logged in. Routes live elsewhere and
/// survive logout; the registry only answers "is this driver active".
pub struct DriverSessionRegistry {
    sessions: DashMap<Uuid, DriverSession>,
}

impl DriverSessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Idempotent login. A repeated login keeps the original session start.
    pub fn register(&self, driver_id: Uuid, name: String) -> DriverSession {
        self.sessions
            .entry(driver_id)
            .or_insert_with(|| DriverSession {
                driver_id,
                name,
                started_at: Utc::now(),
            })
            .clone()
    }

    /// Removes the session. Returns false when the driver was not active.
    /// Item release on logout is handled by the caller against the ledger.
    pub fn unregister(&self, driver_id: Uuid) -> bool {
        self.sessions.remove(&driver_id).is_some()
    }

    pub fn is_active(&self, driver_id: Uuid) -> bool {
        self.sessions.contains_key(&driver_id)
    }

    /// Active sessions annotated via the caller-supplied route query, so the
    /// registry stays decoupled from route storage.
    pub fn list_active(&self, has_active_route: impl Fn(Uuid) -> bool) -> Vec<ActiveDriver> {
        self.sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                ActiveDriver {
                    driver_id: session.driver_id,
                    name: session.name.clone(),
                    started_at: session.started_at,
                    has_active_route: has_active_route(session.driver_id),
                }
            })
            .collect()
    }
}

impl Default for DriverSessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
