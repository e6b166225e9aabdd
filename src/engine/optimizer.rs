use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::warn;
use uuid::Uuid;

use crate::engine::stops::StopInput;
use crate::error::AppError;
use crate::geo::{haversine_km, travel_minutes};
use crate::models::item::GeoPoint;
use crate::models::route::ReturnLeg;
use crate::models::stop::StopKind;

#[derive(Debug, Clone)]
pub struct OptimizeRequest {
    pub stops: Vec<StopInput>,
    pub service_minutes: u32,
    pub now: DateTime<Utc>,
    pub shift_end: DateTime<Utc>,
    pub home_base: GeoPoint,
}

#[derive(Debug, Clone)]
pub struct OptimizedStop {
    pub input: StopInput,
    pub eta_arrival: DateTime<Utc>,
    pub eta_departure: DateTime<Utc>,
    pub travel_minutes: f64,
    pub travel_km: f64,
    pub fits_in_shift: bool,
    pub rationale: String,
}

#[derive(Debug, Clone)]
pub struct OptimizedPlan {
    pub stops: Vec<OptimizedStop>,
    pub unfit_stops: u32,
    pub return_leg: ReturnLeg,
}

/// Black-box stop sequencer. Implementations decide the order; the client
/// defends the precedence invariant on every response.
pub trait RouteOptimizer: Send + Sync {
    fn optimize(&self, request: OptimizeRequest) -> BoxFuture<'static, Result<OptimizedPlan, AppError>>;
}

/// Transport-level adapter around a [`RouteOptimizer`]: applies the call
/// timeout, chunks oversized stop sets, and validates that every returned
/// order schedules each dropoff strictly after its dependency pickups.
pub struct OptimizerClient {
    inner: Arc<dyn RouteOptimizer>,
    timeout: Duration,
    max_stops_per_call: usize,
}

impl OptimizerClient {
    pub fn new(inner: Arc<dyn RouteOptimizer>, timeout: Duration, max_stops_per_call: usize) -> Self {
        Self {
            inner,
            timeout,
            max_stops_per_call: max_stops_per_call.max(1),
        }
    }

    pub async fn plan(&self, request: OptimizeRequest) -> Result<OptimizedPlan, AppError> {
        if request.stops.is_empty() {
            return Err(AppError::NothingToPlan);
        }

        let chunks = chunk_inputs(&request.stops, self.max_stops_per_call);
        let mut ordered: Vec<OptimizedStop> = Vec::with_capacity(request.stops.len());
        let mut unfit_stops = 0u32;
        let mut return_leg: Option<ReturnLeg> = None;
        let mut chunk_start = request.now;

        for chunk in chunks {
            let sub_request = OptimizeRequest {
                stops: chunk,
                now: chunk_start,
                ..request.clone()
            };

            let plan = tokio::time::timeout(self.timeout, self.inner.optimize(sub_request))
                .await
                .map_err(|_| AppError::Optimizer("optimizer call timed out".to_string()))??;

            if let Some(last) = plan.stops.last() {
                chunk_start = last.eta_departure;
            }
            unfit_stops = unfit_stops.saturating_add(plan.unfit_stops);
            return_leg = Some(plan.return_leg);
            ordered.extend(plan.stops);
        }

        validate_plan(&request.stops, &ordered)?;

        let return_leg = return_leg
            .ok_or_else(|| AppError::Internal("optimizer returned no chunks".to_string()))?;

        Ok(OptimizedPlan {
            stops: ordered,
            unfit_stops,
            return_leg,
        })
    }
}

/// Splits oversized stop sets into bounded calls. Pickups are moved ahead
/// of all dropoffs first, so a dropoff can never land in an earlier chunk
/// than a pickup it depends on.
fn chunk_inputs(stops: &[StopInput], max_per_call: usize) -> Vec<Vec<StopInput>> {
    if stops.len() <= max_per_call {
        return vec![stops.to_vec()];
    }

    let mut reordered: Vec<StopInput> = stops
        .iter()
        .filter(|s| s.kind == StopKind::Pickup)
        .cloned()
        .collect();
    reordered.extend(stops.iter().filter(|s| s.kind != StopKind::Pickup).cloned());

    reordered
        .chunks(max_per_call)
        .map(|chunk| chunk.to_vec())
        .collect()
}

fn validate_plan(inputs: &[StopInput], ordered: &[OptimizedStop]) -> Result<(), AppError> {
    let input_ids: HashSet<Uuid> = inputs.iter().map(|s| s.id).collect();

    let mut positions: HashMap<Uuid, usize> = HashMap::with_capacity(ordered.len());
    for (index, stop) in ordered.iter().enumerate() {
        if !input_ids.contains(&stop.input.id) {
            return Err(AppError::Optimizer(format!(
                "response contains unknown stop {}",
                stop.input.id
            )));
        }
        positions.insert(stop.input.id, index);
    }

    if positions.len() != input_ids.len() {
        return Err(AppError::Optimizer(
            "response dropped or duplicated stops".to_string(),
        ));
    }

    for input in inputs.iter().filter(|s| s.kind == StopKind::Dropoff) {
        let Some(&dropoff_pos) = positions.get(&input.id) else {
            continue;
        };
        for dep in input.depends_on.iter().filter(|d| input_ids.contains(d)) {
            if positions.get(dep).is_some_and(|&dep_pos| dep_pos >= dropoff_pos) {
                warn!(dropoff = %input.id, pickup = %dep, "optimizer violated pickup precedence");
                return Err(AppError::Optimizer(format!(
                    "dropoff {} scheduled before its pickup {dep}",
                    input.id
                )));
            }
        }
    }

    Ok(())
}

/// Built-in nearest-neighbour sequencer so the service runs without an
/// external optimizer deployment. Dependency pickups gate eligibility, so
/// the produced order always satisfies the precedence contract.
pub struct GreedyOptimizer {
    pub speed_kmh: f64,
}

impl Default for GreedyOptimizer {
    fn default() -> Self {
        Self { speed_kmh: 30.0 }
    }
}

impl RouteOptimizer for GreedyOptimizer {
    fn optimize(&self, request: OptimizeRequest) -> BoxFuture<'static, Result<OptimizedPlan, AppError>> {
        let speed_kmh = self.speed_kmh;
        Box::pin(async move { greedy_plan(&request, speed_kmh) })
    }
}

fn greedy_plan(request: &OptimizeRequest, speed_kmh: f64) -> Result<OptimizedPlan, AppError> {
    let mut remaining: Vec<StopInput> = request.stops.clone();
    let known_ids: HashSet<Uuid> = remaining.iter().map(|s| s.id).collect();
    let mut scheduled: HashSet<Uuid> = HashSet::with_capacity(remaining.len());
    let mut ordered: Vec<OptimizedStop> = Vec::with_capacity(remaining.len());

    let mut position = request.home_base.clone();
    let mut clock = request.now;
    let mut unfit_stops = 0u32;

    while !remaining.is_empty() {
        let eligible_index = remaining
            .iter()
            .enumerate()
            .filter(|(_, stop)| {
                stop.depends_on
                    .iter()
                    .all(|dep| scheduled.contains(dep) || !known_ids.contains(dep))
            })
            .min_by(|(_, a), (_, b)| {
                let da = haversine_km(&position, &a.location);
                let db = haversine_km(&position, &b.location);
                da.total_cmp(&db)
            })
            .map(|(index, _)| index);

        let Some(index) = eligible_index else {
            return Err(AppError::Optimizer(
                "unsatisfiable pickup precedence constraints".to_string(),
            ));
        };

        let stop = remaining.remove(index);
        let travel_km = haversine_km(&position, &stop.location);
        let minutes = travel_minutes(travel_km, speed_kmh);
        let eta_arrival = clock + chrono::Duration::seconds((minutes * 60.0) as i64);
        let eta_departure =
            eta_arrival + chrono::Duration::minutes(i64::from(request.service_minutes));
        let fits_in_shift = eta_departure <= request.shift_end;
        if !fits_in_shift {
            unfit_stops += 1;
        }

        position = stop.location.clone();
        clock = eta_departure;
        scheduled.insert(stop.id);
        ordered.push(OptimizedStop {
            eta_arrival,
            eta_departure,
            travel_minutes: minutes,
            travel_km,
            fits_in_shift,
            rationale: format!("nearest eligible stop, {travel_km:.1} km from previous"),
            input: stop,
        });
    }

    let return_km = haversine_km(&position, &request.home_base);
    let return_minutes = travel_minutes(return_km, speed_kmh);
    let return_leg = ReturnLeg {
        travel_minutes: return_minutes,
        travel_km: return_km,
        eta_arrival: clock + chrono::Duration::seconds((return_minutes * 60.0) as i64),
    };

    Ok(OptimizedPlan {
        stops: ordered,
        unfit_stops,
        return_leg,
    })
}
