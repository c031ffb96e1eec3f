//! Radius flip scan: buy cheap within the buy radius, haul, sell into
//! resting bids within the sell radius.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::orders::{bucket_by_type, enrich_histories, fetch_orders};
use super::{
    sanitize, FlipResult, ProgressSink, ScanParams, Scanner,
};
use crate::error::{FlipperError, Result};
use crate::esi::market::{HistoryBucket, MarketOrder, OrderSide};
use crate::universe::{Catalog, Universe};

/// Whether a buy order's reach covers a sale happening at `ask`'s station.
/// The numeric ranges are jump counts from the order's system; the path
/// check ignores any security preference because order reach is a market
/// rule, not a routing choice.
fn buy_range_reaches(universe: &Universe, bid: &MarketOrder, ask: &MarketOrder) -> bool {
    match bid.range.as_str() {
        "region" => universe.region_of(bid.system_id) == universe.region_of(ask.system_id),
        "solarsystem" => bid.system_id == ask.system_id,
        "station" | "" => bid.location_id == ask.location_id,
        numeric => match numeric.parse::<u32>() {
            Ok(jumps) => match universe.shortest_path(bid.system_id, ask.system_id, 0.0) {
                Some(d) => d <= jumps,
                None => false,
            },
            // Unknown range strings get the most conservative reading.
            Err(_) => bid.location_id == ask.location_id,
        },
    }
}

struct FlipCandidate {
    row: FlipResult,
    buy_region: i32,
}

/// Pure evaluation over already-fetched books. `sell_orders` must be sell
/// orders inside the buy radius, `buy_orders` buy orders inside the sell
/// radius; `buy_systems` carries BFS distance from the origin.
#[allow(clippy::too_many_arguments)]
fn evaluate(
    universe: &Universe,
    catalog: &Catalog,
    params: &ScanParams,
    buy_systems: &HashMap<i32, u32>,
    sell_orders: Vec<MarketOrder>,
    buy_orders: Vec<MarketOrder>,
    cancel: &CancellationToken,
) -> Result<Vec<FlipCandidate>> {
    let sells_by_type = bucket_by_type(sell_orders);
    let mut buys_by_type = bucket_by_type(buy_orders);

    let sell_multiplier = params.instant_sell_multiplier();
    let buy_multiplier = params.buy_cost_multiplier();

    let mut candidates = Vec::new();
    for (type_id, mut asks) in sells_by_type {
        if cancel.is_cancelled() {
            return Err(FlipperError::Canceled);
        }
        let Some(bids) = buys_by_type.get_mut(&type_id) else {
            continue;
        };

        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));

        let best_ask = &asks[0];
        let Some(bid) = bids.iter().find(|b| buy_range_reaches(universe, b, best_ask)) else {
            continue;
        };

        let bid_net = bid.price * sell_multiplier;
        if bid_net <= best_ask.price * buy_multiplier {
            continue;
        }

        let item_volume = catalog.item_volume(type_id);
        let cargo_units = (params.cargo_m3 / item_volume).floor() as i64;
        if cargo_units <= 0 {
            continue;
        }
        // We sell into one resting bid, so it also bounds the trade size.
        let max_units = cargo_units.min(bid.volume_remaining);

        // Start from the cheapest ask and keep absorbing deeper levels at
        // the same station while they still beat the bid after fees.
        let mut units = 0i64;
        let mut cost = 0.0;
        for ask in asks.iter().filter(|a| a.location_id == best_ask.location_id) {
            if units >= max_units {
                break;
            }
            if ask.price * buy_multiplier >= bid_net {
                break;
            }
            let take = (max_units - units).min(ask.volume_remaining);
            units += take;
            cost += ask.price * take as f64;
        }
        if units <= 0 {
            continue;
        }

        let avg_buy = cost / units as f64;
        let profit_per_unit = bid_net - avg_buy * buy_multiplier;
        let total_profit = profit_per_unit * units as f64;
        let margin_percent = profit_per_unit / avg_buy * 100.0;

        if margin_percent < params.min_margin_percent || total_profit < params.min_profit {
            continue;
        }

        let buy_jumps = match buy_systems.get(&best_ask.system_id) {
            Some(d) => *d,
            None => continue,
        };
        let Some(sell_jumps) =
            universe.shortest_path(best_ask.system_id, bid.system_id, params.min_route_security)
        else {
            continue;
        };
        let total_jumps = buy_jumps + sell_jumps;
        let profit_per_jump = total_profit / total_jumps.max(1) as f64;

        let buy_region = universe.region_of(best_ask.system_id).unwrap_or(0);

        candidates.push(FlipCandidate {
            buy_region,
            row: FlipResult {
                type_id,
                type_name: catalog.item_name(type_id),
                item_volume,
                buy_price: sanitize(avg_buy),
                buy_station: catalog.station_name(best_ask.location_id),
                buy_system_id: best_ask.system_id,
                buy_system_name: universe.system_name(best_ask.system_id),
                sell_price: bid.price,
                sell_station: catalog.station_name(bid.location_id),
                sell_system_id: bid.system_id,
                sell_system_name: universe.system_name(bid.system_id),
                profit_per_unit: sanitize(profit_per_unit),
                margin_percent: sanitize(margin_percent),
                units,
                buy_order_remain: best_ask.volume_remaining,
                sell_order_remain: bid.volume_remaining,
                total_profit: sanitize(total_profit),
                profit_per_jump: sanitize(profit_per_jump),
                buy_jumps,
                sell_jumps,
                total_jumps,
                daily_volume: 0.0,
            },
        });
    }
    Ok(candidates)
}

/// Total profit descending, then margin, then fewer jumps, then type id.
/// Every key is deterministic so equal rows always land in the same order.
pub fn rank(rows: &mut [FlipResult]) {
    rows.sort_by(|a, b| {
        b.total_profit
            .partial_cmp(&a.total_profit)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.margin_percent
                    .partial_cmp(&a.margin_percent)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.total_jumps.cmp(&b.total_jumps))
            .then(a.type_id.cmp(&b.type_id))
    });
}

impl Scanner {
    pub async fn scan_flips(
        &self,
        params: &ScanParams,
        cancel: &CancellationToken,
        progress: ProgressSink,
    ) -> Result<Vec<FlipResult>> {
        params.validate()?;
        let deadline = params.deadline();

        progress("Finding systems within radius...".into());
        let buy_systems = self.universe.systems_within(
            params.origin_system_id,
            params.buy_radius,
            params.min_route_security,
        );
        let sell_systems = self.universe.systems_within(
            params.origin_system_id,
            params.sell_radius,
            params.min_route_security,
        );

        let mut regions = self.universe.regions_in_set(&buy_systems);
        regions.extend(self.universe.regions_in_set(&sell_systems));

        progress(format!("Fetching orders from {} regions...", regions.len()));
        let union_systems: HashMap<i32, u32> = buy_systems
            .iter()
            .chain(sell_systems.iter())
            .map(|(k, v)| (*k, *v))
            .collect();
        let (orders, failed) = fetch_orders(
            self,
            &regions,
            OrderSide::All,
            Some(&union_systems),
            cancel,
            deadline,
        )
        .await;
        for region_id in failed {
            progress(format!("Warning: region {region_id} skipped"));
        }
        if cancel.is_cancelled() {
            return Err(FlipperError::Canceled);
        }

        let mut sell_orders = Vec::new();
        let mut buy_orders = Vec::new();
        for order in orders {
            if order.is_buy {
                if sell_systems.contains_key(&order.system_id) {
                    buy_orders.push(order);
                }
            } else if buy_systems.contains_key(&order.system_id) {
                sell_orders.push(order);
            }
        }
        debug!(
            sells = sell_orders.len(),
            buys = buy_orders.len(),
            "flip scan books assembled"
        );

        let mut candidates = evaluate(
            &self.universe,
            &self.catalog,
            params,
            &buy_systems,
            sell_orders,
            buy_orders,
            cancel,
        )?;

        // History enrichment only for rows that survived the price filters.
        let needs_history = params.min_daily_volume > 0.0 || params.require_history;
        if needs_history && !candidates.is_empty() {
            progress(format!(
                "Fetching history for {} types...",
                candidates.len()
            ));
            let mut by_region: HashMap<i32, HashSet<i32>> = HashMap::new();
            for c in &candidates {
                by_region.entry(c.buy_region).or_default().insert(c.row.type_id);
            }
            let mut volumes: HashMap<(i32, i32), f64> = HashMap::new();
            let mut known: HashMap<(i32, i32), Arc<Vec<HistoryBucket>>> = HashMap::new();
            for (region_id, type_ids) in by_region {
                let histories =
                    enrich_histories(self, region_id, &type_ids, cancel, deadline).await;
                for (type_id, entries) in histories {
                    volumes.insert(
                        (region_id, type_id),
                        super::history::avg_daily_volume(&entries, 7),
                    );
                    known.insert((region_id, type_id), entries);
                }
            }

            candidates.retain_mut(|c| {
                let key = (c.buy_region, c.row.type_id);
                match known.get(&key) {
                    Some(entries) if !entries.is_empty() => {
                        c.row.daily_volume = volumes.get(&key).copied().unwrap_or(0.0);
                        c.row.daily_volume >= params.min_daily_volume
                    }
                    _ => !params.require_history && params.min_daily_volume <= 0.0,
                }
            });
        }

        let mut rows: Vec<FlipResult> = candidates.into_iter().map(|c| c.row).collect();
        rank(&mut rows);
        rows.truncate(params.max_results);

        progress(format!("Found {} profitable flips", rows.len()));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::universe::{ItemType, SolarSystem, Station};

    fn universe() -> Universe {
        let mut u = Universe::new();
        // origin 1 - 2 - A(3); origin - 4 - 5 - B(6)
        for (id, sec) in [(1, 0.9), (2, 0.9), (3, 0.9), (4, 0.9), (5, 0.9), (6, 0.9)] {
            u.insert_system(SolarSystem {
                system_id: id,
                name: format!("S{id}"),
                region_id: 10,
                security: sec,
            });
        }
        u.connect(1, 2);
        u.connect(2, 3);
        u.connect(1, 4);
        u.connect(4, 5);
        u.connect(5, 6);
        u
    }

    fn catalog() -> Catalog {
        let mut c = Catalog::new();
        c.insert_type(ItemType {
            type_id: 34,
            name: "Tritanium".into(),
            volume: 1.0,
            market_group_id: None,
        });
        c.insert_station(Station {
            station_id: 100,
            name: "Station A".into(),
            system_id: 3,
        });
        c.insert_station(Station {
            station_id: 200,
            name: "Station B".into(),
            system_id: 6,
        });
        c
    }

    fn ask(price: f64, volume: i64) -> MarketOrder {
        MarketOrder {
            order_id: 1,
            type_id: 34,
            location_id: 100,
            system_id: 3,
            is_buy: false,
            price,
            volume_remaining: volume,
            volume_total: volume,
            min_volume: 1,
            range: String::new(),
            issued_at: String::new(),
        }
    }

    fn bid(price: f64, volume: i64, range: &str) -> MarketOrder {
        MarketOrder {
            order_id: 2,
            type_id: 34,
            location_id: 200,
            system_id: 6,
            is_buy: true,
            price,
            volume_remaining: volume,
            volume_total: volume,
            min_volume: 1,
            range: range.into(),
            issued_at: String::new(),
        }
    }

    fn params() -> ScanParams {
        let mut p = ScanParams::default();
        p.origin_system_id = 1;
        p.buy_radius = 2;
        p.sell_radius = 3;
        p.cargo_m3 = 10.0;
        p.sales_tax_percent = 3.6;
        p.broker_fee_percent = 1.0;
        p.min_margin_percent = 0.0;
        p.min_profit = 0.0;
        p
    }

    fn run_evaluate(
        params: &ScanParams,
        sells: Vec<MarketOrder>,
        buys: Vec<MarketOrder>,
    ) -> Vec<FlipResult> {
        let u = universe();
        let buy_systems = u.systems_within(params.origin_system_id, params.buy_radius, 0.0);
        let cancel = CancellationToken::new();
        let mut rows: Vec<FlipResult> =
            evaluate(&u, &catalog(), params, &buy_systems, sells, buys, &cancel)
                .unwrap()
                .into_iter()
                .map(|c| c.row)
                .collect();
        rank(&mut rows);
        rows
    }

    #[test]
    fn trivial_flip_profit_identity() {
        // Ask 100 two jumps out, bid 130 three jumps out, cargo for 10 units.
        let rows = run_evaluate(&params(), vec![ask(100.0, 50)], vec![bid(130.0, 50, "region")]);
        assert_eq!(rows.len(), 1);
        let r = &rows[0];
        assert_eq!(r.units, 10);
        let expected = 10.0 * (130.0 * 0.964 - 100.0 * 1.01);
        assert!(
            (r.total_profit - expected).abs() / expected < 1e-9,
            "total {} vs {}",
            r.total_profit,
            expected
        );
        // Identity: total = (sell*(1-tax) - buy*(1+broker)) * units.
        let identity = (r.sell_price * 0.964 - r.buy_price * 1.01) * r.units as f64;
        assert!((r.total_profit - identity).abs() / identity.abs() < 1e-9);
        assert_eq!(r.buy_jumps, 2);
        assert!(r.total_jumps >= r.buy_jumps);
    }

    #[test]
    fn absorbs_deeper_asks_while_still_profitable() {
        // Cheapest ask has only 4 units; the next level still beats the bid.
        let mut a1 = ask(100.0, 4);
        let mut a2 = ask(110.0, 50);
        a1.order_id = 1;
        a2.order_id = 3;
        let rows = run_evaluate(&params(), vec![a1, a2], vec![bid(130.0, 50, "region")]);
        assert_eq!(rows.len(), 1);
        let r = &rows[0];
        assert_eq!(r.units, 10);
        // 4 @ 100 + 6 @ 110 = 1060 total, 106 average.
        assert!((r.buy_price - 106.0).abs() < 1e-9);
    }

    #[test]
    fn unprofitable_deeper_asks_are_left_alone() {
        let a1 = ask(100.0, 4);
        let a2 = ask(129.0, 50); // 129 * 1.01 > 130 * 0.964
        let rows = run_evaluate(&params(), vec![a1, a2], vec![bid(130.0, 50, "region")]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].units, 4);
    }

    #[test]
    fn station_range_bid_needs_matching_location() {
        let rows = run_evaluate(&params(), vec![ask(100.0, 50)], vec![bid(130.0, 50, "station")]);
        assert!(rows.is_empty());

        // Numeric range wide enough to reach the ask's system.
        let rows = run_evaluate(&params(), vec![ask(100.0, 50)], vec![bid(130.0, 50, "10")]);
        assert_eq!(rows.len(), 1);

        // Numeric range too short: 3 and 6 are 5 jumps apart.
        let rows = run_evaluate(&params(), vec![ask(100.0, 50)], vec![bid(130.0, 50, "2")]);
        assert!(rows.is_empty());
    }

    #[test]
    fn tightening_filters_never_grows_results() {
        let sells = vec![ask(100.0, 50)];
        let buys = vec![bid(130.0, 50, "region")];
        let loose = run_evaluate(&params(), sells.clone(), buys.clone()).len();

        let mut strict = params();
        strict.min_margin_percent = 50.0;
        let tight = run_evaluate(&strict, sells.clone(), buys.clone()).len();
        assert!(tight <= loose);

        let mut strict = params();
        strict.min_profit = 1e12;
        assert!(run_evaluate(&strict, sells, buys).len() <= loose);
    }

    #[test]
    fn ranking_tie_breaks_are_deterministic() {
        let mut rows = vec![
            FlipResult {
                type_id: 35,
                type_name: "B".into(),
                item_volume: 1.0,
                buy_price: 100.0,
                buy_station: String::new(),
                buy_system_id: 0,
                buy_system_name: String::new(),
                sell_price: 130.0,
                sell_station: String::new(),
                sell_system_id: 0,
                sell_system_name: String::new(),
                profit_per_unit: 10.0,
                margin_percent: 10.0,
                units: 10,
                buy_order_remain: 0,
                sell_order_remain: 0,
                total_profit: 100.0,
                profit_per_jump: 10.0,
                buy_jumps: 1,
                sell_jumps: 1,
                total_jumps: 2,
                daily_volume: 0.0,
            },
            FlipResult {
                type_id: 34,
                type_name: "A".into(),
                item_volume: 1.0,
                buy_price: 100.0,
                buy_station: String::new(),
                buy_system_id: 0,
                buy_system_name: String::new(),
                sell_price: 130.0,
                sell_station: String::new(),
                sell_system_id: 0,
                sell_system_name: String::new(),
                profit_per_unit: 10.0,
                margin_percent: 10.0,
                units: 10,
                buy_order_remain: 0,
                sell_order_remain: 0,
                total_profit: 100.0,
                profit_per_jump: 10.0,
                buy_jumps: 1,
                sell_jumps: 1,
                total_jumps: 2,
                daily_volume: 0.0,
            },
        ];
        rank(&mut rows);
        assert_eq!(rows[0].type_id, 34);

        rows[1].margin_percent = 20.0;
        rank(&mut rows);
        assert_eq!(rows[0].type_id, 35);

        rows[0].margin_percent = 20.0;
        rows[0].total_jumps = 1;
        rank(&mut rows);
        assert_eq!(rows[0].total_jumps, 1);
    }

    #[tokio::test]
    async fn isolated_origin_returns_empty_not_error() {
        use crate::engine::{ScanCaches, Scanner};
        use crate::esi::{EsiClient, EsiConfig};
        use std::sync::Arc;

        let server = wiremock::MockServer::start().await;
        // Empty book for the lone region.
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(
                wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!([])),
            )
            .mount(&server)
            .await;

        let mut u = Universe::new();
        u.insert_system(SolarSystem {
            system_id: 1,
            name: "Lonely".into(),
            region_id: 10,
            security: 0.9,
        });

        let scanner = Scanner::new(
            Arc::new(
                EsiClient::new(EsiConfig {
                    base_url: server.uri(),
                    ..EsiConfig::default()
                })
                .unwrap(),
            ),
            Arc::new(u),
            Arc::new(catalog()),
            Arc::new(ScanCaches::new(std::time::Duration::from_secs(60))),
        );

        let mut p = params();
        p.buy_radius = 0;
        p.sell_radius = 0;
        let messages = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_messages = messages.clone();
        let sink: ProgressSink = Arc::new(move |m| sink_messages.lock().unwrap().push(m));

        let cancel = CancellationToken::new();
        let rows = scanner.scan_flips(&p, &cancel, sink).await.unwrap();
        assert!(rows.is_empty());
        assert!(!messages.lock().unwrap().is_empty());
    }
}
