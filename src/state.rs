use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::optimizer::{OptimizerClient, RouteOptimizer};
use crate::ledger::ItemAssignmentLedger;
use crate::models::event::RouteEvent;
use crate::models::item::{DeliverableItem, GeoPoint};
use crate::models::route::DriverRoute;
use crate::models::transfer::TransferRecord;
use crate::observability::metrics::Metrics;
use crate::sessions::DriverSessionRegistry;

pub struct AppState {
    pub sessions: DriverSessionRegistry,
    pub ledger: ItemAssignmentLedger,
    pub routes: DashMap<Uuid, DriverRoute>,
    pub items: DashMap<Uuid, DeliverableItem>,
    pub transfers: DashMap<Uuid, TransferRecord>,
    pub optimizer: OptimizerClient,
    pub item_tx: mpsc::Sender<DeliverableItem>,
    pub route_events_tx: broadcast::Sender<RouteEvent>,
    pub metrics: Metrics,
    pub stop_service_minutes: u32,
    pub home_base: GeoPoint,
}

impl AppState {
    pub fn new(
        config: &Config,
        optimizer: Arc<dyn RouteOptimizer>,
    ) -> (Self, mpsc::Receiver<DeliverableItem>) {
        let (item_tx, item_rx) = mpsc::channel(config.item_queue_size);
        let (route_events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);

        (
            Self {
                sessions: DriverSessionRegistry::new(),
                ledger: ItemAssignmentLedger::new(),
                routes: DashMap::new(),
                items: DashMap::new(),
                transfers: DashMap::new(),
                optimizer: OptimizerClient::new(
                    optimizer,
                    Duration::from_secs(config.optimizer_timeout_secs),
                    config.max_stops_per_optimizer_call,
                ),
                item_tx,
                route_events_tx,
                metrics: Metrics::new(),
                stop_service_minutes: config.stop_service_minutes,
                home_base: config.home_base.clone(),
            },
            item_rx,
        )
    }
}
