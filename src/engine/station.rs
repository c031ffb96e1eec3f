//! Same-station trading scan.
//!
//! For every type traded at one station, compute spread quality, liquidity,
//! and manipulation-warning metrics from the local book plus regional
//! history, then simulate the cargo-sized round trip against the actual
//! book.

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::execution::plan_fill;
use super::history;
use super::orders::{bucket_by_type, enrich_histories, fetch_orders};
use super::{sanitize, ProgressSink, ScanParams, Scanner, StationTrade};
use crate::error::{FlipperError, Result};
use crate::esi::market::{MarketOrder, OrderSide};

/// Price band around the best level that counts as executable depth.
const DEPTH_BAND: f64 = 0.05;
/// Share of daily volume a single trader can expect to take.
const DAILY_PARTICIPATION: f64 = 0.25;
/// Fallback trade size when history gives no daily share.
const FALLBACK_QTY_CAP: i64 = 1000;
const ROI_WINDOW_DAYS: f64 = 90.0;
const ROI_CAP_PCT: f64 = 1000.0;

/// Splits daily traded volume into expected sell-side fills using book
/// imbalance: a book heavy on sell volume clears sell orders faster than
/// the raw daily average.
pub fn estimate_sell_units_per_day(daily_volume: f64, buy_volume: i64, sell_volume: i64) -> f64 {
    let total = (buy_volume + sell_volume) as f64;
    if total <= 0.0 || daily_volume <= 0.0 {
        return daily_volume;
    }
    daily_volume * 2.0 * sell_volume as f64 / total
}

pub fn estimate_buy_units_per_day(daily_volume: f64, buy_volume: i64, sell_volume: i64) -> f64 {
    let total = (buy_volume + sell_volume) as f64;
    if total <= 0.0 || daily_volume <= 0.0 {
        return daily_volume;
    }
    daily_volume * 2.0 * buy_volume as f64 / total
}

/// Trade size for the execution simulation: the daily share when history
/// supports one, bounded by book depth and cargo; otherwise depth and
/// cargo under a hard cap.
pub fn execution_desired_qty(daily_share: i64, book_depth: i64, cargo_units: i64) -> i64 {
    if daily_share > 0 {
        daily_share.min(book_depth).min(cargo_units)
    } else {
        book_depth.min(cargo_units).min(FALLBACK_QTY_CAP)
    }
}

fn depth_within_band(orders: &[MarketOrder], best: f64, buying_side: bool) -> i64 {
    if best <= 0.0 {
        return 0;
    }
    orders
        .iter()
        .filter(|o| {
            if buying_side {
                o.price >= best * (1.0 - DEPTH_BAND)
            } else {
                o.price <= best * (1.0 + DEPTH_BAND)
            }
        })
        .map(|o| o.volume_remaining)
        .sum()
}

fn largest_order_share(orders: &[MarketOrder]) -> f64 {
    let total: i64 = orders.iter().map(|o| o.volume_remaining).sum();
    if total <= 0 {
        return 0.0;
    }
    let largest = orders.iter().map(|o| o.volume_remaining).max().unwrap_or(0);
    largest as f64 / total as f64
}

/// Weighted manipulation flags, clamped to [0, 100].
pub fn scam_score(
    best_bid: f64,
    best_ask: f64,
    vwap_30d: f64,
    avg_30d: f64,
    bids: &[MarketOrder],
    asks: &[MarketOrder],
    traded_last_3d: bool,
) -> f64 {
    let mut score: f64 = 0.0;
    if vwap_30d > 0.0 && best_bid < 0.5 * vwap_30d {
        score += 40.0;
    }
    if largest_order_share(bids) > 0.7 || largest_order_share(asks) > 0.7 {
        score += 25.0;
    }
    if !traded_last_3d {
        score += 20.0;
    }
    if avg_30d > 0.0 && best_bid > 0.0 && best_ask > 0.0 {
        let mid = 0.5 * (best_bid + best_ask);
        if (mid - avg_30d).abs() / avg_30d > 0.5 {
            score += 15.0;
        }
    }
    score.min(100.0)
}

/// Composite 0-100 score: margin 30, depth 20, period ROI 20, volume 15,
/// scam complement 15, each component normalized to [0, 1] first.
pub fn composite_score(
    margin_pct: f64,
    depth_score: f64,
    period_roi_pct: f64,
    daily_volume: f64,
    scam: f64,
) -> f64 {
    let margin_n = (margin_pct / 20.0).clamp(0.0, 1.0);
    let depth_n = depth_score.clamp(0.0, 1.0);
    let roi_n = (period_roi_pct / 50.0).clamp(0.0, 1.0);
    let volume_n = ((daily_volume + 1.0).log10() / 6.0).clamp(0.0, 1.0);
    let clean_n = ((100.0 - scam) / 100.0).clamp(0.0, 1.0);
    30.0 * margin_n + 20.0 * depth_n + 20.0 * roi_n + 15.0 * volume_n + 15.0 * clean_n
}

/// Hypothetical ROI from round-tripping the spread for 90 days: each cycle
/// buys and re-sells the simulated quantity, cycle time set by how fast the
/// sell side actually clears.
pub fn period_roi_pct(
    net_spread_per_unit: f64,
    unit_cost: f64,
    desired_qty: i64,
    sell_units_per_day: f64,
) -> f64 {
    if net_spread_per_unit <= 0.0 || unit_cost <= 0.0 || desired_qty <= 0 {
        return 0.0;
    }
    if sell_units_per_day <= 0.0 {
        return 0.0;
    }
    let cycle_days = (desired_qty as f64 / sell_units_per_day).max(0.5);
    let cycles = ROI_WINDOW_DAYS / cycle_days;
    let per_cycle = net_spread_per_unit / unit_cost;
    (per_cycle * cycles * 100.0).min(ROI_CAP_PCT)
}

impl Scanner {
    pub async fn scan_station(
        &self,
        params: &ScanParams,
        cancel: &CancellationToken,
        progress: ProgressSink,
    ) -> Result<Vec<StationTrade>> {
        params.validate()?;
        let deadline = params.deadline();
        if params.station_id == 0 {
            return Err(FlipperError::BadInput("station_id is required".into()));
        }
        let station_name = self.catalog.station_name(params.station_id);
        let system_id = self
            .catalog
            .station_system(params.station_id)
            .ok_or_else(|| {
                FlipperError::BadInput(format!("unknown station {}", params.station_id))
            })?;
        let region_id = self
            .universe
            .region_of(system_id)
            .ok_or_else(|| FlipperError::BadInput(format!("unknown system {system_id}")))?;

        progress(format!("Fetching full book for {station_name}..."));
        let regions = HashSet::from([region_id]);
        let (orders, failed) =
            fetch_orders(self, &regions, OrderSide::All, None, cancel, deadline).await;
        if !failed.is_empty() {
            return Err(FlipperError::ServerError {
                status: 0,
                body: format!("region {region_id} unavailable"),
            });
        }

        let station_orders: Vec<MarketOrder> = orders
            .into_iter()
            .filter(|o| o.location_id == params.station_id)
            .collect();
        let books = bucket_by_type(station_orders);
        debug!(types = books.len(), "station book assembled");

        let type_ids: HashSet<i32> = books.keys().copied().collect();
        progress(format!("Fetching history for {} types...", type_ids.len()));
        let histories = enrich_histories(self, region_id, &type_ids, cancel, deadline).await;

        let sell_multiplier = params.posted_sell_multiplier();
        let buy_multiplier = params.buy_cost_multiplier();
        let cargo = params.cargo_m3;

        let mut rows = Vec::new();
        for (type_id, book) in books {
            if cancel.is_cancelled() {
                return Err(FlipperError::Canceled);
            }

            let (bids, asks): (Vec<MarketOrder>, Vec<MarketOrder>) =
                book.into_iter().partition(|o| o.is_buy);
            let best_bid = bids.iter().map(|o| o.price).fold(0.0, f64::max);
            let best_ask = asks
                .iter()
                .map(|o| o.price)
                .fold(f64::INFINITY, f64::min);
            if best_bid <= 0.0 || !best_ask.is_finite() || best_ask <= 0.0 {
                continue;
            }

            let entries = histories.get(&type_id);
            if entries.is_none() && params.require_history {
                continue;
            }
            let empty = Vec::new();
            let entries = entries.map(|e| e.as_slice()).unwrap_or(&empty);

            let vwap = history::vwap(entries, 30);
            let daily_volume = history::avg_daily_volume(entries, 7);
            if daily_volume < params.min_daily_volume {
                continue;
            }
            let volatility = history::volatility_pct(entries, 30);
            let avg_30d: f64 = {
                let prices: Vec<f64> = entries
                    .iter()
                    .filter(|e| e.average > 0.0)
                    .map(|e| e.average)
                    .collect();
                history::mean(&prices)
            };

            let spread = best_ask - best_bid;
            let net_spread = best_ask * sell_multiplier - best_bid * buy_multiplier;
            let margin_percent = net_spread / best_ask * 100.0;
            if margin_percent < params.min_margin_percent {
                continue;
            }

            let buy_volume: i64 = bids.iter().map(|o| o.volume_remaining).sum();
            let sell_volume: i64 = asks.iter().map(|o| o.volume_remaining).sum();

            let bid_depth = depth_within_band(&bids, best_bid, true);
            let ask_depth = depth_within_band(&asks, best_ask, false);
            let depth_score = if daily_volume > 0.0 {
                (bid_depth + ask_depth) as f64 / daily_volume
            } else {
                0.0
            };

            let days_of_supply = if daily_volume > 0.0 {
                sell_volume as f64 / daily_volume
            } else {
                0.0
            };

            let sell_per_day = estimate_sell_units_per_day(daily_volume, buy_volume, sell_volume);
            let buy_per_day = estimate_buy_units_per_day(daily_volume, buy_volume, sell_volume);
            let buy_sell_ratio = if sell_per_day > 0.0 {
                buy_per_day / sell_per_day
            } else {
                0.0
            };
            if buy_sell_ratio < params.min_buy_sell_ratio
                || buy_sell_ratio > params.max_buy_sell_ratio
            {
                continue;
            }

            let traded_recently = history::traded_within(entries, 3);
            let scam = scam_score(
                best_bid,
                best_ask,
                vwap,
                avg_30d,
                &bids,
                &asks,
                traded_recently,
            );
            if scam > params.max_scam_score {
                continue;
            }
            if volatility > params.max_volatility_pct {
                continue;
            }

            let item_volume = self.catalog.item_volume(type_id);
            let cargo_units = (cargo / item_volume).floor() as i64;
            let daily_share = (daily_volume * DAILY_PARTICIPATION) as i64;
            let desired = execution_desired_qty(
                daily_share,
                bid_depth.min(ask_depth),
                cargo_units,
            );

            let buy_plan = plan_fill(&asks, desired, true);
            let sell_plan = plan_fill(&bids, desired, false);
            let filled = buy_plan.filled_qty.min(sell_plan.filled_qty);
            let expected_profit = if filled > 0 {
                (sell_plan.expected_price * params.instant_sell_multiplier()
                    - buy_plan.expected_price)
                    * filled as f64
            } else {
                0.0
            };

            let roi = period_roi_pct(net_spread, best_bid * buy_multiplier, desired, sell_per_day);
            if roi < params.min_period_roi {
                continue;
            }

            let captured_per_day = sell_per_day.min(buy_per_day) * DAILY_PARTICIPATION;
            let daily_profit = net_spread * captured_per_day;

            let composite = composite_score(margin_percent, depth_score, roi, daily_volume, scam);

            rows.push(StationTrade {
                type_id,
                type_name: self.catalog.item_name(type_id),
                station_id: params.station_id,
                station_name: station_name.clone(),
                best_bid,
                best_ask,
                spread: sanitize(spread),
                margin_percent: sanitize(margin_percent),
                daily_volume: sanitize(daily_volume),
                buy_volume,
                sell_volume,
                vwap: sanitize(vwap),
                volatility_pct: sanitize(volatility),
                depth_score: sanitize(depth_score),
                days_of_supply: sanitize(days_of_supply),
                buy_sell_ratio: sanitize(buy_sell_ratio),
                scam_score: sanitize(scam),
                period_roi_pct: sanitize(roi),
                composite_score: sanitize(composite),
                daily_profit: sanitize(daily_profit),
                filled_qty: filled,
                can_fill: buy_plan.can_fill && sell_plan.can_fill,
                expected_buy_price: sanitize(buy_plan.expected_price),
                expected_sell_price: sanitize(sell_plan.expected_price),
                slippage_buy_pct: sanitize(buy_plan.slippage_pct),
                slippage_sell_pct: sanitize(sell_plan.slippage_pct),
                expected_profit: sanitize(expected_profit),
            });
        }

        rows.sort_by(|a, b| {
            b.composite_score
                .partial_cmp(&a.composite_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.daily_profit
                        .partial_cmp(&a.daily_profit)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.type_id.cmp(&b.type_id))
        });
        rows.truncate(params.max_results);

        progress(format!("Found {} station trades", rows.len()));
        Ok(rows)
    }
}
