use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub routes_planned_total: IntCounterVec,
    pub optimizer_latency_seconds: HistogramVec,
    pub stops_completed_total: IntCounterVec,
    pub transfers_total: IntCounterVec,
    pub locked_items: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let routes_planned_total = IntCounterVec::new(
            Opts::new("routes_planned_total", "Route plans by outcome"),
            &["outcome"],
        )
        .expect("valid routes_planned_total metric");

        let optimizer_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "optimizer_latency_seconds",
                "Latency of optimizer round-trips in seconds",
            ),
            &["outcome"],
        )
        .expect("valid optimizer_latency_seconds metric");

        let stops_completed_total = IntCounterVec::new(
            Opts::new("stops_completed_total", "Completed stops by kind"),
            &["kind"],
        )
        .expect("valid stops_completed_total metric");

        let transfers_total = IntCounterVec::new(
            Opts::new("transfers_total", "Item transfers by outcome"),
            &["outcome"],
        )
        .expect("valid transfers_total metric");

        let locked_items = IntGauge::new(
            "locked_items",
            "Items currently in a driver's physical possession",
        )
        .expect("valid locked_items metric");

        registry
            .register(Box::new(routes_planned_total.clone()))
            .expect("register routes_planned_total");
        registry
            .register(Box::new(optimizer_latency_seconds.clone()))
            .expect("register optimizer_latency_seconds");
        registry
            .register(Box::new(stops_completed_total.clone()))
            .expect("register stops_completed_total");
        registry
            .register(Box::new(transfers_total.clone()))
            .expect("register transfers_total");
        registry
            .register(Box::new(locked_items.clone()))
            .expect("register locked_items");

        Self {
            registry,
            routes_planned_total,
            optimizer_latency_seconds,
            stops_completed_total,
            transfers_total,
            locked_items,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
