//! Multi-hop route builder.
//!
//! Exact k-hop routing is intractable, so this is a beam search: at each
//! depth every frontier state expands into its best nearby flips and only
//! the top `beam_width` states survive, ranked by profit per jump and then
//! total profit. Every returned route is feasible under cargo and budget
//! and every segment has positive profit, but optimality is not promised.
//! Expansion considers only the single best ask level per type, trading
//! fill depth for search breadth.

use std::collections::{HashMap, HashSet};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::orders::{bucket_by_type, fetch_orders};
use super::{
    sanitize, ProgressSink, RouteResult, RouteSegment, ScanParams, Scanner,
};
use crate::error::{FlipperError, Result};
use crate::esi::market::{MarketOrder, OrderSide};
use crate::universe::{Catalog, Universe};

/// Segment candidates considered per expansion before the beam cut.
const EXPANSION_FANOUT: usize = 4;

#[derive(Clone)]
struct SearchState {
    current_system: i32,
    budget_left: f64,
    profit: f64,
    jumps: u32,
    segments: Vec<RouteSegment>,
    /// (type, buy system) pairs already flipped, to stop the search from
    /// milking one order book repeatedly.
    used: HashSet<(i32, i32)>,
}

impl SearchState {
    fn profit_per_jump(&self) -> f64 {
        self.profit / self.jumps.max(1) as f64
    }
}

fn state_rank(a: &SearchState, b: &SearchState) -> std::cmp::Ordering {
    b.profit_per_jump()
        .partial_cmp(&a.profit_per_jump())
        .unwrap_or(std::cmp::Ordering::Equal)
        .then(
            b.profit
                .partial_cmp(&a.profit)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
}

/// One candidate segment from `from_system`.
fn best_segments(
    universe: &Universe,
    catalog: &Catalog,
    params: &ScanParams,
    sells_by_type: &HashMap<i32, Vec<MarketOrder>>,
    buys_by_type: &HashMap<i32, Vec<MarketOrder>>,
    state: &SearchState,
) -> Vec<RouteSegment> {
    let buy_systems = universe.systems_within(
        state.current_system,
        params.buy_radius,
        params.min_route_security,
    );
    let sell_systems = universe.systems_within(
        state.current_system,
        params.sell_radius,
        params.min_route_security,
    );

    let sell_multiplier = params.instant_sell_multiplier();
    let buy_multiplier = params.buy_cost_multiplier();

    let mut candidates: Vec<RouteSegment> = Vec::new();
    for (&type_id, asks) in sells_by_type {
        let Some(bids) = buys_by_type.get(&type_id) else {
            continue;
        };
        let Some(ask) = asks
            .iter()
            .filter(|a| buy_systems.contains_key(&a.system_id))
            .filter(|a| !state.used.contains(&(type_id, a.system_id)))
            .min_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal))
        else {
            continue;
        };
        let Some(bid) = bids
            .iter()
            .filter(|b| sell_systems.contains_key(&b.system_id))
            .max_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal))
        else {
            continue;
        };

        let profit_per_unit = bid.price * sell_multiplier - ask.price * buy_multiplier;
        if profit_per_unit <= 0.0 {
            continue;
        }

        let item_volume = catalog.item_volume(type_id);
        let cargo_units = (params.cargo_m3 / item_volume).floor() as i64;
        let budget_units = if state.budget_left.is_finite() {
            (state.budget_left / (ask.price * buy_multiplier)).floor() as i64
        } else {
            i64::MAX
        };
        let units = cargo_units
            .min(budget_units)
            .min(ask.volume_remaining)
            .min(bid.volume_remaining);
        if units <= 0 {
            continue;
        }

        let to_buy = buy_systems[&ask.system_id];
        let Some(to_sell) =
            universe.shortest_path(ask.system_id, bid.system_id, params.min_route_security)
        else {
            continue;
        };
        let jumps = to_buy + to_sell;
        let profit = profit_per_unit * units as f64;

        candidates.push(RouteSegment {
            type_id,
            type_name: catalog.item_name(type_id),
            units,
            buy_system_id: ask.system_id,
            buy_system_name: universe.system_name(ask.system_id),
            sell_system_id: bid.system_id,
            sell_system_name: universe.system_name(bid.system_id),
            buy_price: ask.price,
            sell_price: bid.price,
            profit: sanitize(profit),
            jumps,
        });
    }

    candidates.sort_by(|a, b| {
        let ppj_a = a.profit / a.jumps.max(1) as f64;
        let ppj_b = b.profit / b.jumps.max(1) as f64;
        ppj_b
            .partial_cmp(&ppj_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.profit
                    .partial_cmp(&a.profit)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
    candidates.truncate(EXPANSION_FANOUT);
    candidates
}

/// Pure beam search over prefetched orders.
pub fn search(
    universe: &Universe,
    catalog: &Catalog,
    params: &ScanParams,
    orders: Vec<MarketOrder>,
    cancel: &CancellationToken,
) -> Result<Vec<RouteResult>> {
    let (buys, sells): (Vec<MarketOrder>, Vec<MarketOrder>) =
        orders.into_iter().partition(|o| o.is_buy);
    let sells_by_type = bucket_by_type(sells);
    let buys_by_type = bucket_by_type(buys);

    let initial_budget = if params.budget_isk > 0.0 {
        params.budget_isk
    } else {
        f64::INFINITY
    };

    let mut frontier = vec![SearchState {
        current_system: params.origin_system_id,
        budget_left: initial_budget,
        profit: 0.0,
        jumps: 0,
        segments: Vec::new(),
        used: HashSet::new(),
    }];
    let mut completed: Vec<SearchState> = Vec::new();

    for depth in 0..params.route_hops {
        if cancel.is_cancelled() {
            return Err(FlipperError::Canceled);
        }
        let mut next: Vec<SearchState> = Vec::new();
        for state in &frontier {
            let segments = best_segments(
                universe,
                catalog,
                params,
                &sells_by_type,
                &buys_by_type,
                state,
            );
            for segment in segments {
                let mut expanded = state.clone();
                expanded.current_system = segment.sell_system_id;
                if expanded.budget_left.is_finite() {
                    // Sale proceeds come back net of fees, so the working
                    // budget grows by exactly the segment profit.
                    expanded.budget_left = (expanded.budget_left + segment.profit).max(0.0);
                }
                expanded.profit += segment.profit;
                expanded.jumps += segment.jumps;
                expanded
                    .used
                    .insert((segment.type_id, segment.buy_system_id));
                expanded.segments.push(segment);
                next.push(expanded);
            }
        }

        if next.is_empty() {
            debug!(depth, "route frontier exhausted");
            break;
        }
        next.sort_by(state_rank);
        next.truncate(params.beam_width);
        completed.extend(next.iter().cloned().filter(|s| !s.segments.is_empty()));
        frontier = next;
    }

    completed.sort_by(state_rank);
    completed.dedup_by(|a, b| {
        a.segments.len() == b.segments.len()
            && a.segments
                .iter()
                .zip(&b.segments)
                .all(|(x, y)| x.type_id == y.type_id && x.buy_system_id == y.buy_system_id)
    });
    completed.truncate(params.max_results);

    Ok(completed
        .into_iter()
        .map(|s| {
            let cargo_used = s
                .segments
                .iter()
                .map(|seg| seg.units as f64 * catalog.item_volume(seg.type_id))
                .fold(0.0, f64::max);
            let isk_used = s
                .segments
                .iter()
                .map(|seg| seg.buy_price * seg.units as f64)
                .fold(0.0, f64::max);
            RouteResult {
                total_profit: sanitize(s.profit),
                total_jumps: s.jumps,
                profit_per_jump: sanitize(s.profit / s.jumps.max(1) as f64),
                isk_used: sanitize(isk_used),
                cargo_used_m3: sanitize(cargo_used),
                segments: s.segments,
            }
        })
        .collect())
}

impl Scanner {
    pub async fn scan_routes(
        &self,
        params: &ScanParams,
        cancel: &CancellationToken,
        progress: ProgressSink,
    ) -> Result<Vec<RouteResult>> {
        params.validate()?;
        let deadline = params.deadline();

        progress("Finding systems within reach...".into());
        // The whole search stays inside the area reachable by hopping at
        // most sell_radius per hop from the buy perimeter.
        let reach = params.buy_radius + params.route_hops * params.sell_radius.max(1);
        let area = self.universe.systems_within(
            params.origin_system_id,
            reach.min(30),
            params.min_route_security,
        );
        let regions = self.universe.regions_in_set(&area);

        progress(format!("Fetching orders from {} regions...", regions.len()));
        let (orders, failed) =
            fetch_orders(self, &regions, OrderSide::All, Some(&area), cancel, deadline).await;
        for region_id in failed {
            progress(format!("Warning: region {region_id} skipped"));
        }

        progress("Searching routes...".into());
        let routes = search(&self.universe, &self.catalog, params, orders, cancel)?;
        progress(format!("Found {} routes", routes.len()));
        Ok(routes)
    }
}
