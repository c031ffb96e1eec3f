//! Public-contract scan: find item-exchange contracts priced below what the
//! included items would fetch on the market.
//!
//! Pricing is deliberately paranoid. Lone cheap sell orders are treated as
//! bait, items without trading activity count against the contract, and a
//! margin that looks too good to be true is assumed to be exactly that.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::execution::plan_fill;
use super::history;
use super::orders::{enrich_histories, fetch_orders, location_systems};
use super::{safe_div, sanitize, ContractResult, ProgressSink, ScanParams, Scanner};
use crate::error::{FlipperError, Result};
use crate::esi::contracts::{ContractItem, ContractKind, PublicContract};
use crate::esi::market::{MarketOrder, OrderSide};
use crate::esi::Deadline;
use crate::universe::Catalog;

const DEFAULT_MIN_CONTRACT_PRICE: f64 = 10_000_000.0;
const DEFAULT_MAX_CONTRACT_MARGIN: f64 = 100.0;
const DEFAULT_MIN_PRICED_RATIO: f64 = 0.8;
const DEFAULT_HOLD_DAYS: u32 = 7;
const MAX_HOLD_DAYS: u32 = 180;
const DEFAULT_TARGET_CONFIDENCE: f64 = 80.0;

/// Listed volume below this makes a min-sell price untrustworthy.
const MIN_SELL_ORDER_VOLUME: i64 = 5;
const LOW_VOLUME_PRICE_PENALTY: f64 = 1.5;
/// Daily volume below this marks an item as effectively untraded.
const MIN_DAILY_VOLUME_FOR_ITEM: f64 = 1.0;
/// Share of daily market volume we can realistically capture.
const FILL_PARTICIPATION: f64 = 0.35;
/// Extra markdown applied to expected proceeds.
const CONSERVATIVE_HAIRCUT: f64 = 0.03;
/// Carry cost of locked capital per day, as a fraction of contract price.
const DAILY_CARRY_RATE: f64 = 0.001;
/// When history is missing, treat listed depth as two weeks of turnover.
const DEPTH_TURNOVER_DAYS: f64 = 14.0;
const MAX_CONTRACT_RESULTS: usize = 100;

/// Trade-hub regions in descending priority; contract history VWAPs come
/// from the best hub present in the candidate set.
const HUB_REGION_PRIORITY: &[i32] = &[10000002, 10000043, 10000032, 10000030, 10000042];

pub fn effective_min_contract_price(params: &ScanParams) -> f64 {
    if params.min_contract_price > 0.0 {
        params.min_contract_price
    } else {
        DEFAULT_MIN_CONTRACT_PRICE
    }
}

pub fn effective_max_contract_margin(params: &ScanParams) -> f64 {
    if params.max_contract_margin_percent > 0.0 {
        params.max_contract_margin_percent
    } else {
        DEFAULT_MAX_CONTRACT_MARGIN
    }
}

pub fn effective_min_priced_ratio(params: &ScanParams) -> f64 {
    if params.min_priced_ratio > 0.0 {
        params.min_priced_ratio
    } else {
        DEFAULT_MIN_PRICED_RATIO
    }
}

pub fn effective_hold_days(params: &ScanParams) -> u32 {
    if params.contract_hold_days == 0 {
        DEFAULT_HOLD_DAYS
    } else {
        params.contract_hold_days.min(MAX_HOLD_DAYS)
    }
}

pub fn effective_target_confidence(params: &ScanParams) -> f64 {
    if params.contract_target_confidence <= 0.0 {
        DEFAULT_TARGET_CONFIDENCE
    } else {
        params.contract_target_confidence.min(100.0)
    }
}

/// Market snapshot for one item type.
#[derive(Debug, Clone, Default)]
pub struct ItemPriceData {
    pub min_sell: f64,
    pub total_sell_volume: i64,
    pub sell_order_count: usize,
    pub vwap: f64,
    pub daily_volume: f64,
    pub has_history: bool,
}

/// Builds per-type price data from sell orders, penalizing thin listings.
pub fn build_price_data(sell_orders: &[MarketOrder]) -> HashMap<i32, ItemPriceData> {
    let mut data: HashMap<i32, ItemPriceData> = HashMap::new();
    for order in sell_orders {
        if order.price <= 0.0 {
            continue;
        }
        let pd = data.entry(order.type_id).or_default();
        if pd.min_sell == 0.0 || order.price < pd.min_sell {
            pd.min_sell = order.price;
        }
        pd.total_sell_volume += order.volume_remaining;
        pd.sell_order_count += 1;
    }
    for pd in data.values_mut() {
        if pd.total_sell_volume < MIN_SELL_ORDER_VOLUME {
            pd.min_sell *= LOW_VOLUME_PRICE_PENALTY;
        }
    }
    data
}

fn effective_daily_volume(pd: &ItemPriceData) -> f64 {
    if pd.daily_volume > 0.0 {
        return pd.daily_volume;
    }
    if pd.total_sell_volume > 0 {
        return pd.total_sell_volume as f64 / DEPTH_TURNOVER_DAYS;
    }
    0.0
}

pub fn estimate_fill_days(quantity: i64, daily_volume: f64) -> f64 {
    if quantity <= 0 {
        return 0.0;
    }
    let executable_per_day = daily_volume * FILL_PARTICIPATION;
    if executable_per_day <= 0.0 {
        return f64::INFINITY;
    }
    quantity as f64 / executable_per_day
}

/// Probability of fully liquidating within the horizon, 1 - exp(-T/tau).
pub fn fill_probability(fill_days: f64, horizon_days: f64) -> f64 {
    if horizon_days <= 0.0 {
        return 0.0;
    }
    if fill_days <= 0.0 {
        return 1.0;
    }
    if fill_days.is_infinite() {
        return 0.0;
    }
    (1.0 - (-horizon_days / fill_days).exp()).clamp(0.0, 1.0)
}

/// Valuation of one contract against the market. `None` means rejected.
/// Location resolution and jump counts are the caller's job.
pub fn evaluate_contract(
    params: &ScanParams,
    catalog: &Catalog,
    price_data: &HashMap<i32, ItemPriceData>,
    liquidation_books: &HashMap<i32, Vec<MarketOrder>>,
    contract: &PublicContract,
    items: &[ContractItem],
) -> Option<ContractResult> {
    if items.is_empty() {
        return None;
    }
    let instant = params.contract_instant_liquidation;
    let min_priced_ratio = effective_min_priced_ratio(params);
    let max_margin = effective_max_contract_margin(params);
    let hold_days = effective_hold_days(params) as f64;
    let target_confidence = effective_target_confidence(params);
    let sell_multiplier = if instant {
        params.instant_sell_multiplier()
    } else {
        params.posted_sell_multiplier()
    };

    let mut market_value = 0.0;
    let mut item_count = 0i64;
    let mut priced_count = 0usize;
    let mut total_types = 0usize;
    let mut low_volume_items = 0usize;
    let mut high_deviation_items = 0usize;
    let mut has_blueprint_original = false;
    let mut full_liquidation_prob = 1.0;
    let mut max_fill_days = 0.0f64;
    let mut expected_gross_by_fill = 0.0;
    let mut top_items: Vec<String> = Vec::new();

    for item in items {
        if !item.is_included {
            continue;
        }
        if item.is_blueprint_copy {
            continue;
        }
        if catalog.is_blueprint(item.type_id) {
            has_blueprint_original = true;
            continue;
        }
        total_types += 1;

        if instant {
            let Some(book) = liquidation_books.get(&item.type_id) else {
                continue;
            };
            let plan = plan_fill(book, item.quantity, false);
            if !plan.can_fill || plan.expected_price <= 0.0 {
                continue;
            }
            priced_count += 1;
            market_value += plan.expected_price * item.quantity as f64;
            item_count += item.quantity;
            push_item_label(&mut top_items, catalog, item);
            continue;
        }

        let Some(pd) = price_data.get(&item.type_id) else {
            continue;
        };
        if pd.min_sell <= 0.0 {
            continue;
        }

        let use_price = if pd.has_history && pd.vwap > 0.0 {
            if pd.min_sell < pd.vwap * 0.5 {
                // A sell order under half of VWAP is bait; value the item
                // conservatively instead of trusting it.
                high_deviation_items += 1;
                (pd.vwap * 0.7).min(pd.min_sell * 2.0)
            } else {
                pd.vwap.min(pd.min_sell)
            }
        } else {
            if params.require_history {
                continue;
            }
            pd.min_sell
        };

        if pd.daily_volume < MIN_DAILY_VOLUME_FOR_ITEM {
            low_volume_items += 1;
        }

        priced_count += 1;
        market_value += use_price * item.quantity as f64;
        item_count += item.quantity;

        let daily = effective_daily_volume(pd);
        let fill_days = estimate_fill_days(item.quantity, daily);
        let item_prob = fill_probability(fill_days, hold_days);
        full_liquidation_prob *= item_prob;
        if fill_days.is_infinite() {
            max_fill_days = max_fill_days.max(hold_days * 10.0);
        } else {
            max_fill_days = max_fill_days.max(fill_days);
        }
        expected_gross_by_fill += use_price * item.quantity as f64 * item_prob;

        push_item_label(&mut top_items, catalog, item);
    }

    // Pure blueprint-original contracts have no dependable valuation.
    if has_blueprint_original && total_types == 0 {
        return None;
    }
    if total_types == 0 || priced_count == 0 {
        return None;
    }
    if (priced_count as f64) / (total_types as f64) < min_priced_ratio {
        return None;
    }
    // Instant liquidation demands every tradable item be absorbed now.
    if instant && priced_count < total_types {
        return None;
    }
    if (low_volume_items as f64) / (priced_count as f64) > 0.5 {
        return None;
    }
    if (high_deviation_items as f64) / (priced_count as f64) > 0.3 {
        return None;
    }
    if market_value <= 0.0 {
        return None;
    }

    let effective_value = market_value * sell_multiplier;
    let profit = effective_value - contract.price;
    if profit <= 0.0 {
        return None;
    }
    let margin = profit / contract.price * 100.0;
    if margin > max_margin {
        return None;
    }

    let mut expected_profit = profit;
    let mut expected_margin = margin;
    let mut confidence_pct = 100.0;
    let mut est_liquidation_days = 0.0;
    let mut conservative_value = effective_value;
    let mut carry_cost = 0.0;

    if !instant {
        confidence_pct = full_liquidation_prob * 100.0;
        if confidence_pct < target_confidence {
            return None;
        }
        est_liquidation_days = max_fill_days;
        let conservative_gross = expected_gross_by_fill * (1.0 - CONSERVATIVE_HAIRCUT);
        conservative_value = conservative_gross * sell_multiplier;
        carry_cost = contract.price * DAILY_CARRY_RATE * hold_days;
        expected_profit = conservative_value - contract.price - carry_cost;
        if expected_profit <= 0.0 {
            return None;
        }
        expected_margin = safe_div(expected_profit, contract.price) * 100.0;
    }

    if expected_margin < params.min_margin_percent {
        return None;
    }

    let title = if contract.title.trim().is_empty() {
        synthesize_title(&top_items)
    } else {
        contract.title.trim().to_string()
    };

    Some(ContractResult {
        contract_id: contract.contract_id,
        title,
        price: contract.price,
        market_value: sanitize(market_value),
        profit: sanitize(profit),
        margin_percent: sanitize(margin),
        expected_profit: sanitize(expected_profit),
        expected_margin_percent: sanitize(expected_margin),
        sell_confidence_pct: sanitize(confidence_pct),
        est_liquidation_days: sanitize(est_liquidation_days),
        conservative_value: sanitize(conservative_value),
        carry_cost: sanitize(carry_cost),
        volume_m3: contract.volume,
        station_name: String::new(),
        system_name: String::new(),
        region_name: String::new(),
        item_count,
        jumps: 0,
        profit_per_jump: 0.0,
    })
}

fn push_item_label(labels: &mut Vec<String>, catalog: &Catalog, item: &ContractItem) {
    let name = catalog.item_name(item.type_id);
    if item.quantity > 1 {
        labels.push(format!("{}x {}", item.quantity, name));
    } else {
        labels.push(name);
    }
}

/// Builds a display title from the contract contents.
pub fn synthesize_title(items: &[String]) -> String {
    match items.len() {
        0 => "Item exchange".to_string(),
        1 => items[0].clone(),
        2 | 3 => items.join(", "),
        n => format!("{} + {} more", items[..2].join(", "), n - 2),
    }
}

/// Highest-priority trade hub present in the set, else the lowest id for
/// determinism.
pub fn best_hub_region(regions: &HashSet<i32>) -> i32 {
    for &hub in HUB_REGION_PRIORITY {
        if regions.contains(&hub) {
            return hub;
        }
    }
    regions.iter().copied().min().unwrap_or(0)
}

impl Scanner {
    pub async fn scan_contracts(
        &self,
        params: &ScanParams,
        cancel: &CancellationToken,
        progress: ProgressSink,
    ) -> Result<Vec<ContractResult>> {
        params.validate()?;
        let deadline = params.deadline();
        let min_price = effective_min_contract_price(params);
        let instant = params.contract_instant_liquidation;

        progress("Finding systems within radius...".into());
        let buy_systems = self.universe.systems_within(
            params.origin_system_id,
            params.buy_radius,
            params.min_route_security,
        );
        let buy_regions = self.universe.regions_in_set(&buy_systems);

        let (sell_systems, sell_regions) = if instant {
            let systems = self.universe.systems_within(
                params.origin_system_id,
                params.sell_radius,
                params.min_route_security,
            );
            let regions = self.universe.regions_in_set(&systems);
            (Some(systems), regions)
        } else {
            (None, HashSet::new())
        };

        progress(format!(
            "Fetching orders and contracts from {} regions...",
            buy_regions.len()
        ));

        // Orders and the contract index arrive in parallel; the contract
        // pull itself fans out per region through the shared cache.
        let sell_orders_fut = fetch_orders(
            self,
            &buy_regions,
            OrderSide::Sell,
            Some(&buy_systems),
            cancel,
            deadline,
        );
        let contracts_fut = self.fetch_contracts_merged(&buy_regions, cancel, deadline);
        let liquidation_fut = async {
            if instant {
                let systems = sell_systems.as_ref().unwrap();
                fetch_orders(self, &sell_regions, OrderSide::Buy, Some(systems), cancel, deadline)
                    .await
            } else {
                (Vec::new(), Vec::new())
            }
        };
        let ((sell_orders, failed_a), all_contracts, (liquidation_orders, failed_b)) =
            tokio::join!(sell_orders_fut, contracts_fut, liquidation_fut);
        for region_id in failed_a.into_iter().chain(failed_b) {
            progress(format!("Warning: region {region_id} skipped"));
        }
        if cancel.is_cancelled() {
            return Err(FlipperError::Canceled);
        }

        let mut market_locations = location_systems(&sell_orders);
        market_locations.extend(location_systems(&liquidation_orders));

        let mut liquidation_books: HashMap<i32, Vec<MarketOrder>> = HashMap::new();
        if instant {
            for order in &liquidation_orders {
                liquidation_books
                    .entry(order.type_id)
                    .or_default()
                    .push(order.clone());
            }
        }

        let mut price_data = build_price_data(&sell_orders);

        // Candidate filter: open item exchanges above the price floor at a
        // location we can actually reach.
        let mut candidates: Vec<PublicContract> = Vec::new();
        for contract in all_contracts {
            if contract.kind != ContractKind::ItemExchange || contract.is_expired() {
                continue;
            }
            if contract.price < min_price {
                continue;
            }
            let Some(system_id) =
                self.resolve_location(contract.start_location_id, &market_locations)
            else {
                continue;
            };
            if !buy_systems.contains_key(&system_id) {
                continue;
            }
            candidates.push(contract);
        }
        debug!(count = candidates.len(), "contract candidates after filtering");
        progress(format!("Evaluating {} contracts...", candidates.len()));
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let items_by_contract = self
            .fetch_items_batch(&candidates, cancel, deadline, &progress)
            .await;

        // History enrichment, estimate mode only: VWAP from the best hub
        // region in the candidate set.
        if !instant {
            let mut need_history: HashSet<i32> = HashSet::new();
            for items in items_by_contract.values() {
                for item in items.iter() {
                    if item.is_included
                        && !item.is_blueprint_copy
                        && price_data.contains_key(&item.type_id)
                    {
                        need_history.insert(item.type_id);
                    }
                }
            }
            if !need_history.is_empty() {
                progress(format!(
                    "Fetching market history for {} item types...",
                    need_history.len()
                ));
                let hub = best_hub_region(&buy_regions);
                let histories = enrich_histories(self, hub, &need_history, cancel, deadline).await;
                for (type_id, entries) in histories {
                    if let Some(pd) = price_data.get_mut(&type_id) {
                        if !entries.is_empty() {
                            pd.vwap = history::vwap(&entries, 30);
                            pd.daily_volume = history::avg_daily_volume(&entries, 7);
                            pd.has_history = true;
                        }
                    }
                }
            }
        }

        let mut results = Vec::new();
        for contract in &candidates {
            if cancel.is_cancelled() {
                return Err(FlipperError::Canceled);
            }
            let Some(items) = items_by_contract.get(&contract.contract_id) else {
                continue;
            };
            let Some(mut row) = evaluate_contract(
                params,
                &self.catalog,
                &price_data,
                &liquidation_books,
                contract,
                items,
            ) else {
                continue;
            };

            let system_id = self.resolve_location(contract.start_location_id, &market_locations);
            if let Some(system_id) = system_id {
                row.system_name = self.universe.system_name(system_id);
                if let Some(region_id) = self.universe.region_of(system_id) {
                    row.region_name = self.universe.region_name(region_id);
                }
                row.jumps = match buy_systems.get(&system_id) {
                    Some(d) => *d,
                    None => self
                        .universe
                        .shortest_path(
                            params.origin_system_id,
                            system_id,
                            params.min_route_security,
                        )
                        .unwrap_or(0),
                };
                if row.jumps > 0 {
                    row.profit_per_jump = sanitize(row.profit / row.jumps as f64);
                }
            }
            row.station_name = self
                .location_display_name(contract.start_location_id, system_id, cancel, deadline)
                .await;
            results.push(row);
        }

        results.sort_by(|a, b| {
            b.rank_profit()
                .partial_cmp(&a.rank_profit())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.contract_id.cmp(&b.contract_id))
        });
        results.truncate(MAX_CONTRACT_RESULTS);

        progress(format!("Found {} profitable contracts", results.len()));
        Ok(results)
    }

    async fn fetch_contracts_merged(
        &self,
        regions: &HashSet<i32>,
        cancel: &CancellationToken,
        deadline: Deadline,
    ) -> Vec<PublicContract> {
        let futures: Vec<_> = regions
            .iter()
            .map(|&region_id| async move {
                let esi = self.esi.clone();
                let result = self
                    .caches
                    .contracts
                    .get_or_fetch(region_id, || async move {
                        let contracts = esi
                            .fetch_region_contracts(region_id, cancel, deadline)
                            .await?;
                        Ok(Arc::new(contracts))
                    })
                    .await;
                match result {
                    Ok(contracts) => contracts.as_ref().clone(),
                    Err(e) => {
                        warn!(region_id, error = %e, "contract index fetch failed");
                        Vec::new()
                    }
                }
            })
            .collect();

        futures_util::future::join_all(futures)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn fetch_items_batch(
        &self,
        candidates: &[PublicContract],
        cancel: &CancellationToken,
        deadline: Deadline,
        progress: &ProgressSink,
    ) -> HashMap<i32, Arc<Vec<ContractItem>>> {
        let semaphore = Arc::new(Semaphore::new(10));
        let total = candidates.len();
        progress(format!("Fetching items for {total} contracts..."));

        let futures: Vec<_> = candidates
            .iter()
            .map(|contract| {
                let contract_id = contract.contract_id;
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore.acquire().await.ok()?;
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let esi = self.esi.clone();
                    let result = self
                        .caches
                        .contract_items
                        .get_or_fetch(contract_id, || async move {
                            let items = esi
                                .fetch_contract_items(contract_id, cancel, deadline)
                                .await?;
                            Ok(Arc::new(items))
                        })
                        .await;
                    match result {
                        Ok(items) => Some((contract_id, items)),
                        Err(e) => {
                            debug!(contract_id, error = %e, "contract items fetch failed");
                            None
                        }
                    }
                }
            })
            .collect();

        futures_util::future::join_all(futures)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    fn resolve_location(
        &self,
        location_id: i64,
        market_locations: &HashMap<i64, i32>,
    ) -> Option<i32> {
        self.catalog
            .station_system(location_id)
            .or_else(|| market_locations.get(&location_id).copied())
    }

    /// Human-readable location name: catalog station, cached structure
    /// name, or a synthesized placeholder.
    async fn location_display_name(
        &self,
        location_id: i64,
        system_id: Option<i32>,
        cancel: &CancellationToken,
        deadline: Deadline,
    ) -> String {
        if self.catalog.station(location_id).is_some() {
            return self.catalog.station_name(location_id);
        }
        if self.esi.session.is_authenticated().await {
            let esi = self.esi.clone();
            let fetched = self
                .caches
                .structure_names
                .get_or_fetch(location_id, || async move {
                    let info = esi
                        .fetch_structure_info(location_id, cancel, deadline)
                        .await?;
                    Ok(Arc::new(info.name))
                })
                .await;
            if let Ok(name) = fetched {
                return name.as_ref().clone();
            }
        }
        match system_id {
            Some(id) => format!("Structure @ {}", self.universe.system_name(id)),
            None => format!("Location {location_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::universe::ItemType;

    fn catalog() -> Catalog {
        let mut c = Catalog::new();
        for (id, name) in [(34, "Tritanium"), (35, "Pyerite"), (638, "Raven")] {
            c.insert_type(ItemType {
                type_id: id,
                name: name.into(),
                volume: 1.0,
                market_group_id: None,
            });
        }
        c.insert_type(ItemType {
            type_id: 955,
            name: "Raven Blueprint".into(),
            volume: 0.01,
            market_group_id: None,
        });
        c
    }

    fn contract(price: f64) -> PublicContract {
        PublicContract {
            contract_id: 7001,
            kind: ContractKind::ItemExchange,
            price,
            start_location_id: 100,
            volume: 500.0,
            date_expired: "2099-01-01T00:00:00Z".into(),
            title: String::new(),
        }
    }

    fn item(type_id: i32, quantity: i64) -> ContractItem {
        ContractItem {
            type_id,
            quantity,
            is_included: true,
            is_blueprint_copy: false,
        }
    }

    fn priced(min_sell: f64, vwap: f64, daily: f64) -> ItemPriceData {
        ItemPriceData {
            min_sell,
            total_sell_volume: 1000,
            sell_order_count: 10,
            vwap,
            daily_volume: daily,
            has_history: vwap > 0.0,
        }
    }

    fn params() -> ScanParams {
        let mut p = ScanParams::default();
        p.origin_system_id = 1;
        p.cargo_m3 = 10_000.0;
        p.sales_tax_percent = 3.6;
        p.broker_fee_percent = 1.0;
        p.min_margin_percent = 0.0;
        p.contract_target_confidence = 1.0;
        p
    }

    #[test]
    fn effective_filters_fall_back_to_defaults() {
        let mut p = ScanParams::default();
        p.min_contract_price = 0.0;
        p.max_contract_margin_percent = 0.0;
        p.min_priced_ratio = 0.0;
        p.contract_hold_days = 0;
        p.contract_target_confidence = 0.0;
        assert_eq!(effective_min_contract_price(&p), DEFAULT_MIN_CONTRACT_PRICE);
        assert_eq!(effective_max_contract_margin(&p), DEFAULT_MAX_CONTRACT_MARGIN);
        assert_eq!(effective_min_priced_ratio(&p), DEFAULT_MIN_PRICED_RATIO);
        assert_eq!(effective_hold_days(&p), DEFAULT_HOLD_DAYS);
        assert_eq!(effective_target_confidence(&p), DEFAULT_TARGET_CONFIDENCE);

        p.min_contract_price = 50_000_000.0;
        p.contract_hold_days = 365;
        p.contract_target_confidence = 140.0;
        assert_eq!(effective_min_contract_price(&p), 50_000_000.0);
        assert_eq!(effective_hold_days(&p), MAX_HOLD_DAYS);
        assert_eq!(effective_target_confidence(&p), 100.0);
    }

    #[test]
    fn fill_days_and_probability() {
        // 350 units at 100/day and 35% participation: ten days.
        assert_eq!(estimate_fill_days(350, 100.0), 10.0);
        let p = fill_probability(10.0, 7.0);
        assert!(p > 0.0 && p < 1.0);
        assert_eq!(fill_probability(estimate_fill_days(10, 0.0), 7.0), 0.0);
        assert_eq!(fill_probability(0.0, 7.0), 1.0);
        assert_eq!(fill_probability(5.0, 0.0), 0.0);
    }

    #[test]
    fn thin_listings_get_price_penalty() {
        let orders = vec![MarketOrder {
            order_id: 0,
            type_id: 34,
            location_id: 1,
            system_id: 1,
            is_buy: false,
            price: 100.0,
            volume_remaining: 2,
            volume_total: 2,
            min_volume: 1,
            range: String::new(),
            issued_at: String::new(),
        }];
        let data = build_price_data(&orders);
        assert_eq!(data[&34].min_sell, 150.0);
    }

    #[test]
    fn undervalued_contract_is_accepted() {
        let mut price_data = HashMap::new();
        price_data.insert(34, priced(100.0, 100.0, 500.0));

        // 1000 units worth ~100 each, contract at 60k.
        let row = evaluate_contract(
            &params(),
            &catalog(),
            &price_data,
            &HashMap::new(),
            &contract(60_000.0),
            &[item(34, 1000)],
        )
        .expect("accepted");
        assert!(row.profit > 0.0);
        assert!(row.expected_profit > 0.0);
        assert!(row.margin_percent > 0.0);
        assert_eq!(row.item_count, 1000);
        assert_eq!(row.title, "1000x Tritanium");
    }

    #[test]
    fn bait_pricing_marks_high_deviation_and_rejects() {
        // VWAP 50, lone ask 10: bait. Every priced item is high-deviation,
        // which is far past the 30% tolerance.
        let mut price_data = HashMap::new();
        price_data.insert(34, priced(10.0, 50.0, 500.0));

        let row = evaluate_contract(
            &params(),
            &catalog(),
            &price_data,
            &HashMap::new(),
            &contract(1_000.0),
            &[item(34, 100)],
        );
        assert!(row.is_none());
    }

    #[test]
    fn bait_share_under_threshold_survives_with_conservative_price() {
        // One bait item among four cleanly priced ones: 25% < 30%.
        let mut price_data = HashMap::new();
        price_data.insert(34, priced(10.0, 50.0, 500.0));
        for id in [35, 638] {
            price_data.insert(id, priced(100.0, 100.0, 500.0));
        }
        let items = vec![item(34, 10), item(35, 100), item(638, 1), item(35, 100)];

        let row = evaluate_contract(
            &params(),
            &catalog(),
            &price_data,
            &HashMap::new(),
            &contract(10_000.0),
            &items,
        )
        .expect("accepted");
        // The bait item was valued at min(0.7*50, 2*10) = 20 per unit.
        let expected_value = 20.0 * 10.0 + 100.0 * 200.0 + 100.0;
        assert!((row.market_value - expected_value).abs() < 1e-9);
    }

    #[test]
    fn suspiciously_high_margin_is_rejected() {
        let mut price_data = HashMap::new();
        price_data.insert(34, priced(100.0, 100.0, 500.0));

        // 95k value for a 1k contract: margin way past 100%.
        let row = evaluate_contract(
            &params(),
            &catalog(),
            &price_data,
            &HashMap::new(),
            &contract(1_000.0),
            &[item(34, 1000)],
        );
        assert!(row.is_none());
    }

    #[test]
    fn priced_ratio_filter_is_monotone() {
        let mut price_data = HashMap::new();
        price_data.insert(34, priced(100.0, 100.0, 500.0));
        // Type 35 is unpriced; ratio = 1/2.
        let items = vec![item(34, 500), item(35, 10)];

        let mut loose = params();
        loose.min_priced_ratio = 0.4;
        let accepted = evaluate_contract(
            &loose,
            &catalog(),
            &price_data,
            &HashMap::new(),
            &contract(30_000.0),
            &items,
        );
        assert!(accepted.is_some());

        let mut strict = loose.clone();
        strict.min_priced_ratio = 0.8;
        let rejected = evaluate_contract(
            &strict,
            &catalog(),
            &price_data,
            &HashMap::new(),
            &contract(30_000.0),
            &items,
        );
        assert!(rejected.is_none());
    }

    #[test]
    fn instant_mode_requires_full_absorption() {
        let mut p = params();
        p.contract_instant_liquidation = true;

        let bid = MarketOrder {
            order_id: 0,
            type_id: 34,
            location_id: 1,
            system_id: 1,
            is_buy: true,
            price: 100.0,
            volume_remaining: 50,
            volume_total: 50,
            min_volume: 1,
            range: String::new(),
            issued_at: String::new(),
        };
        let mut books = HashMap::new();
        books.insert(34, vec![bid]);

        // 40 units fit into the 50-unit bid.
        let ok = evaluate_contract(
            &p,
            &catalog(),
            &HashMap::new(),
            &books,
            &contract(2_000.0),
            &[item(34, 40)],
        );
        assert!(ok.is_some());

        // 60 units cannot be fully absorbed: rejected outright.
        let too_big = evaluate_contract(
            &p,
            &catalog(),
            &HashMap::new(),
            &books,
            &contract(2_000.0),
            &[item(34, 60)],
        );
        assert!(too_big.is_none());
    }

    #[test]
    fn blueprint_copies_are_ignored_and_pure_blueprint_contracts_rejected() {
        let mut price_data = HashMap::new();
        price_data.insert(34, priced(100.0, 100.0, 500.0));

        let mut bpc = item(955, 1);
        bpc.is_blueprint_copy = true;
        let mixed = vec![item(34, 1000), bpc];
        assert!(evaluate_contract(
            &params(),
            &catalog(),
            &price_data,
            &HashMap::new(),
            &contract(60_000.0),
            &mixed,
        )
        .is_some());

        let pure = vec![item(955, 1)];
        assert!(evaluate_contract(
            &params(),
            &catalog(),
            &price_data,
            &HashMap::new(),
            &contract(60_000.0),
            &pure,
        )
        .is_none());
    }

    #[test]
    fn title_synthesis() {
        assert_eq!(synthesize_title(&[]), "Item exchange");
        assert_eq!(synthesize_title(&["Raven".into()]), "Raven");
        assert_eq!(
            synthesize_title(&["Raven".into(), "Scorpion".into()]),
            "Raven, Scorpion"
        );
        assert_eq!(
            synthesize_title(&[
                "A".into(),
                "B".into(),
                "C".into(),
                "D".into(),
                "E".into()
            ]),
            "A, B + 3 more"
        );
    }

    #[test]
    fn hub_region_selection() {
        let set = HashSet::from([10000030, 10000002, 10000099]);
        assert_eq!(best_hub_region(&set), 10000002);
        let no_hub = HashSet::from([10000099, 10000055]);
        assert_eq!(best_hub_region(&no_hub), 10000055);
        assert_eq!(best_hub_region(&HashSet::new()), 0);
    }
}
