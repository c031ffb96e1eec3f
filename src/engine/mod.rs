//! Scan engine.
//!
//! Four scanners share one [`Scanner`] handle: radius flips, same-station
//! trading, public contracts, and multi-hop routes. Each takes a
//! [`ScanParams`], a cancellation token, and a progress sink, and returns a
//! ranked result list. All network traffic flows through the upstream client
//! with the engine's caches interposed.

pub mod contracts;
pub mod execution;
pub mod flips;
pub mod history;
pub mod orders;
pub mod portfolio;
pub mod risk;
pub mod routes;
pub mod station;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::TtlCache;
use crate::error::{FlipperError, Result};
use crate::esi::contracts::{ContractItem, PublicContract};
use crate::esi::market::HistoryBucket;
use crate::esi::{Deadline, EsiClient};
use crate::universe::{Catalog, Universe};

/// Progress messages are best effort: the sink may drop them without
/// affecting scan results.
pub type ProgressSink = Arc<dyn Fn(String) + Send + Sync>;

pub fn null_progress() -> ProgressSink {
    Arc::new(|_| {})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    Flips,
    Station,
    Contracts,
    Routes,
}

impl ScanKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanKind::Flips => "flips",
            ScanKind::Station => "station",
            ScanKind::Contracts => "contracts",
            ScanKind::Routes => "routes",
        }
    }

    pub fn parse(s: &str) -> Option<ScanKind> {
        match s {
            "flips" => Some(ScanKind::Flips),
            "station" => Some(ScanKind::Station),
            "contracts" => Some(ScanKind::Contracts),
            "routes" => Some(ScanKind::Routes),
            _ => None,
        }
    }
}

fn default_max_results() -> usize {
    50
}
fn default_scan_timeout() -> u64 {
    120
}
fn default_beam_width() -> usize {
    8
}
fn default_hops() -> u32 {
    3
}
fn default_priced_ratio() -> f64 {
    0.8
}
fn default_max_contract_margin() -> f64 {
    100.0
}
fn default_min_contract_price() -> f64 {
    10_000_000.0
}
fn default_hold_days() -> u32 {
    7
}
fn default_target_confidence() -> f64 {
    80.0
}
fn default_min_period_roi() -> f64 {
    5.0
}
fn default_max_volatility() -> f64 {
    60.0
}
fn default_max_scam_score() -> f64 {
    50.0
}
fn default_min_bvs() -> f64 {
    0.25
}
fn default_max_bvs() -> f64 {
    4.0
}

/// Common parameter object for every scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanParams {
    pub origin_system_id: i32,
    #[serde(default)]
    pub buy_radius: u32,
    #[serde(default)]
    pub sell_radius: u32,
    pub cargo_m3: f64,
    pub sales_tax_percent: f64,
    pub broker_fee_percent: f64,
    #[serde(default)]
    pub min_margin_percent: f64,
    #[serde(default)]
    pub min_profit: f64,
    #[serde(default)]
    pub min_daily_volume: f64,
    /// 0 disables the security floor.
    #[serde(default)]
    pub min_route_security: f64,
    #[serde(default)]
    pub require_history: bool,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Scan-level time budget in seconds; every upstream call's deadline
    /// derives from it. 0 disables the budget.
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,

    // Station scan.
    #[serde(default)]
    pub station_id: i64,
    #[serde(default = "default_min_period_roi")]
    pub min_period_roi: f64,
    #[serde(default = "default_max_volatility")]
    pub max_volatility_pct: f64,
    #[serde(default = "default_max_scam_score")]
    pub max_scam_score: f64,
    #[serde(default = "default_min_bvs")]
    pub min_buy_sell_ratio: f64,
    #[serde(default = "default_max_bvs")]
    pub max_buy_sell_ratio: f64,

    // Contract scan.
    #[serde(default = "default_min_contract_price")]
    pub min_contract_price: f64,
    #[serde(default = "default_max_contract_margin")]
    pub max_contract_margin_percent: f64,
    #[serde(default = "default_priced_ratio")]
    pub min_priced_ratio: f64,
    #[serde(default)]
    pub contract_instant_liquidation: bool,
    #[serde(default = "default_hold_days")]
    pub contract_hold_days: u32,
    #[serde(default = "default_target_confidence")]
    pub contract_target_confidence: f64,

    // Route scan.
    #[serde(default = "default_hops")]
    pub route_hops: u32,
    #[serde(default)]
    pub budget_isk: f64,
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,
}

impl Default for ScanParams {
    fn default() -> Self {
        serde_json::from_str(
            r#"{"origin_system_id":0,"cargo_m3":5000.0,
                "sales_tax_percent":3.6,"broker_fee_percent":1.0}"#,
        )
        .expect("defaults deserialize")
    }
}

impl ScanParams {
    /// Synchronous parameter validation; every scanner calls this first.
    pub fn validate(&self) -> Result<()> {
        if self.origin_system_id == 0 {
            return Err(FlipperError::BadInput("origin_system_id is required".into()));
        }
        if self.buy_radius > 30 || self.sell_radius > 30 {
            return Err(FlipperError::BadInput("radius must be at most 30 jumps".into()));
        }
        if self.cargo_m3 <= 0.0 {
            return Err(FlipperError::BadInput("cargo_m3 must be positive".into()));
        }
        for (name, pct) in [
            ("sales_tax_percent", self.sales_tax_percent),
            ("broker_fee_percent", self.broker_fee_percent),
        ] {
            if !(0.0..=100.0).contains(&pct) {
                return Err(FlipperError::BadInput(format!("{name} must be in [0, 100]")));
            }
        }
        if !(0.0..=1.0).contains(&self.min_priced_ratio) {
            return Err(FlipperError::BadInput("min_priced_ratio must be in [0, 1]".into()));
        }
        if self.route_hops == 0 || self.route_hops > 10 {
            return Err(FlipperError::BadInput("route_hops must be in [1, 10]".into()));
        }
        if self.beam_width == 0 {
            return Err(FlipperError::BadInput("beam_width must be positive".into()));
        }
        Ok(())
    }

    /// Fraction kept of gross sale proceeds when selling into resting bids.
    pub fn instant_sell_multiplier(&self) -> f64 {
        (1.0 - self.sales_tax_percent / 100.0).max(0.0)
    }

    /// Fraction kept when posting fresh sell orders (tax plus broker fee).
    pub fn posted_sell_multiplier(&self) -> f64 {
        (1.0 - (self.sales_tax_percent + self.broker_fee_percent) / 100.0).max(0.0)
    }

    /// Cost multiplier on the buy side (broker fee on placed orders).
    pub fn buy_cost_multiplier(&self) -> f64 {
        1.0 + self.broker_fee_percent / 100.0
    }

    /// Deadline for the whole scan, struck when it starts. Every upstream
    /// call made on the scan's behalf inherits it.
    pub fn deadline(&self) -> Deadline {
        if self.scan_timeout_secs == 0 {
            Deadline::none()
        } else {
            Deadline::after(Duration::from_secs(self.scan_timeout_secs))
        }
    }
}

// ---- result rows ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlipResult {
    pub type_id: i32,
    pub type_name: String,
    pub item_volume: f64,
    pub buy_price: f64,
    pub buy_station: String,
    pub buy_system_id: i32,
    pub buy_system_name: String,
    pub sell_price: f64,
    pub sell_station: String,
    pub sell_system_id: i32,
    pub sell_system_name: String,
    pub profit_per_unit: f64,
    pub margin_percent: f64,
    pub units: i64,
    pub buy_order_remain: i64,
    pub sell_order_remain: i64,
    pub total_profit: f64,
    pub profit_per_jump: f64,
    pub buy_jumps: u32,
    pub sell_jumps: u32,
    pub total_jumps: u32,
    pub daily_volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationTrade {
    pub type_id: i32,
    pub type_name: String,
    pub station_id: i64,
    pub station_name: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub spread: f64,
    pub margin_percent: f64,
    pub daily_volume: f64,
    pub buy_volume: i64,
    pub sell_volume: i64,
    pub vwap: f64,
    pub volatility_pct: f64,
    pub depth_score: f64,
    pub days_of_supply: f64,
    pub buy_sell_ratio: f64,
    pub scam_score: f64,
    pub period_roi_pct: f64,
    pub composite_score: f64,
    pub daily_profit: f64,
    pub filled_qty: i64,
    pub can_fill: bool,
    pub expected_buy_price: f64,
    pub expected_sell_price: f64,
    pub slippage_buy_pct: f64,
    pub slippage_sell_pct: f64,
    pub expected_profit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractResult {
    pub contract_id: i32,
    pub title: String,
    pub price: f64,
    pub market_value: f64,
    pub profit: f64,
    pub margin_percent: f64,
    pub expected_profit: f64,
    pub expected_margin_percent: f64,
    pub sell_confidence_pct: f64,
    pub est_liquidation_days: f64,
    pub conservative_value: f64,
    pub carry_cost: f64,
    pub volume_m3: f64,
    pub station_name: String,
    pub system_name: String,
    pub region_name: String,
    pub item_count: i64,
    pub jumps: u32,
    pub profit_per_jump: f64,
}

impl ContractResult {
    /// Ranking key: expected profit when the long-horizon model ran,
    /// realized profit otherwise.
    pub fn rank_profit(&self) -> f64 {
        if self.expected_profit != 0.0 {
            self.expected_profit
        } else {
            self.profit
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSegment {
    pub type_id: i32,
    pub type_name: String,
    pub units: i64,
    pub buy_system_id: i32,
    pub buy_system_name: String,
    pub sell_system_id: i32,
    pub sell_system_name: String,
    pub buy_price: f64,
    pub sell_price: f64,
    pub profit: f64,
    pub jumps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResult {
    pub segments: Vec<RouteSegment>,
    pub total_profit: f64,
    pub total_jumps: u32,
    pub profit_per_jump: f64,
    pub isk_used: f64,
    pub cargo_used_m3: f64,
}

/// Common header shared by every result shape; the alert pipeline and the
/// ranking summary work against this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultHeader {
    pub type_id: i32,
    pub name: String,
    pub total_profit: f64,
    pub margin_percent: f64,
    pub jumps: u32,
}

/// Tagged result set of one finished scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "rows", rename_all = "snake_case")]
pub enum ScanResults {
    Flips(Vec<FlipResult>),
    Station(Vec<StationTrade>),
    Contracts(Vec<ContractResult>),
    Routes(Vec<RouteResult>),
}

impl ScanResults {
    pub fn kind(&self) -> ScanKind {
        match self {
            ScanResults::Flips(_) => ScanKind::Flips,
            ScanResults::Station(_) => ScanKind::Station,
            ScanResults::Contracts(_) => ScanKind::Contracts,
            ScanResults::Routes(_) => ScanKind::Routes,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ScanResults::Flips(v) => v.len(),
            ScanResults::Station(v) => v.len(),
            ScanResults::Contracts(v) => v.len(),
            ScanResults::Routes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn headers(&self) -> Vec<ResultHeader> {
        match self {
            ScanResults::Flips(v) => v
                .iter()
                .map(|r| ResultHeader {
                    type_id: r.type_id,
                    name: r.type_name.clone(),
                    total_profit: r.total_profit,
                    margin_percent: r.margin_percent,
                    jumps: r.total_jumps,
                })
                .collect(),
            ScanResults::Station(v) => v
                .iter()
                .map(|r| ResultHeader {
                    type_id: r.type_id,
                    name: r.type_name.clone(),
                    total_profit: r.daily_profit,
                    margin_percent: r.margin_percent,
                    jumps: 0,
                })
                .collect(),
            ScanResults::Contracts(v) => v
                .iter()
                .map(|r| ResultHeader {
                    type_id: 0,
                    name: r.title.clone(),
                    total_profit: r.rank_profit(),
                    margin_percent: r.margin_percent,
                    jumps: r.jumps,
                })
                .collect(),
            ScanResults::Routes(v) => v
                .iter()
                .map(|r| ResultHeader {
                    type_id: r.segments.first().map(|s| s.type_id).unwrap_or(0),
                    name: r
                        .segments
                        .first()
                        .map(|s| s.type_name.clone())
                        .unwrap_or_default(),
                    total_profit: r.total_profit,
                    margin_percent: 0.0,
                    jumps: r.total_jumps,
                })
                .collect(),
        }
    }

    pub fn top_profit(&self) -> f64 {
        self.headers()
            .iter()
            .map(|h| h.total_profit)
            .fold(0.0, f64::max)
    }

    pub fn total_profit(&self) -> f64 {
        self.headers().iter().map(|h| h.total_profit).sum()
    }
}

// ---- scanner handle ----

/// Per-key caches shared by all concurrent scans.
pub struct ScanCaches {
    pub contracts: TtlCache<i32, Arc<Vec<PublicContract>>>,
    pub contract_items: TtlCache<i32, Arc<Vec<ContractItem>>>,
    pub history: TtlCache<(i32, i32), Arc<Vec<HistoryBucket>>>,
    pub structure_names: TtlCache<i64, Arc<String>>,
}

impl ScanCaches {
    pub fn new(history_ttl: Duration) -> Self {
        Self {
            contracts: TtlCache::new(Duration::from_secs(300)),
            contract_items: TtlCache::new(Duration::from_secs(3600)),
            history: TtlCache::new(history_ttl),
            structure_names: TtlCache::new(Duration::from_secs(24 * 3600)),
        }
    }
}

pub struct Scanner {
    pub esi: Arc<EsiClient>,
    pub universe: Arc<Universe>,
    pub catalog: Arc<Catalog>,
    pub caches: Arc<ScanCaches>,
}

impl Scanner {
    pub fn new(
        esi: Arc<EsiClient>,
        universe: Arc<Universe>,
        catalog: Arc<Catalog>,
        caches: Arc<ScanCaches>,
    ) -> Self {
        Self {
            esi,
            universe,
            catalog,
            caches,
        }
    }
}

/// Clamp NaN and infinities out of stored floats; JSON cannot carry them and
/// a poisoned metric must not sink a whole result set.
pub fn sanitize(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

pub fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_validation() {
        let mut p = ScanParams::default();
        assert!(p.validate().is_err());

        p.origin_system_id = 30000142;
        assert!(p.validate().is_ok());

        p.buy_radius = 31;
        assert!(p.validate().is_err());
        p.buy_radius = 5;

        p.cargo_m3 = 0.0;
        assert!(p.validate().is_err());
        p.cargo_m3 = 5000.0;

        p.sales_tax_percent = 120.0;
        assert!(p.validate().is_err());
        p.sales_tax_percent = 3.6;

        p.route_hops = 0;
        assert!(p.validate().is_err());
        p.route_hops = 3;

        assert!(p.validate().is_ok());
    }

    #[test]
    fn scan_deadline_from_timeout_knob() {
        let mut p = ScanParams::default();
        assert_eq!(p.scan_timeout_secs, 120);
        assert!(p.deadline().remaining().is_some());

        p.scan_timeout_secs = 0;
        assert!(p.deadline().remaining().is_none());
        assert!(!p.deadline().is_expired());
    }

    #[test]
    fn fee_multipliers() {
        let mut p = ScanParams::default();
        p.sales_tax_percent = 8.0;
        p.broker_fee_percent = 3.0;
        assert!((p.instant_sell_multiplier() - 0.92).abs() < 1e-12);
        assert!((p.posted_sell_multiplier() - 0.89).abs() < 1e-12);
        assert!((p.buy_cost_multiplier() - 1.03).abs() < 1e-12);

        // Pathological fees clamp at zero rather than going negative.
        p.sales_tax_percent = 150.0;
        assert_eq!(p.instant_sell_multiplier(), 0.0);
    }

    #[test]
    fn sanitize_strips_non_finite() {
        assert_eq!(sanitize(1.5), 1.5);
        assert_eq!(sanitize(f64::NAN), 0.0);
        assert_eq!(sanitize(f64::INFINITY), 0.0);
        assert_eq!(safe_div(1.0, 0.0), 0.0);
        assert_eq!(safe_div(6.0, 2.0), 3.0);
    }

    #[test]
    fn results_summary() {
        let results = ScanResults::Flips(vec![
            FlipResult {
                type_id: 34,
                type_name: "Tritanium".into(),
                item_volume: 0.01,
                buy_price: 100.0,
                buy_station: "A".into(),
                buy_system_id: 1,
                buy_system_name: "S1".into(),
                sell_price: 130.0,
                sell_station: "B".into(),
                sell_system_id: 2,
                sell_system_name: "S2".into(),
                profit_per_unit: 24.32,
                margin_percent: 24.3,
                units: 10,
                buy_order_remain: 100,
                sell_order_remain: 50,
                total_profit: 243.2,
                profit_per_jump: 48.6,
                buy_jumps: 2,
                sell_jumps: 3,
                total_jumps: 5,
                daily_volume: 1000.0,
            },
            FlipResult {
                type_id: 35,
                type_name: "Pyerite".into(),
                item_volume: 0.01,
                buy_price: 10.0,
                buy_station: "A".into(),
                buy_system_id: 1,
                buy_system_name: "S1".into(),
                sell_price: 12.0,
                sell_station: "B".into(),
                sell_system_id: 2,
                sell_system_name: "S2".into(),
                profit_per_unit: 1.5,
                margin_percent: 15.0,
                units: 100,
                buy_order_remain: 1000,
                sell_order_remain: 500,
                total_profit: 150.0,
                profit_per_jump: 30.0,
                buy_jumps: 2,
                sell_jumps: 3,
                total_jumps: 5,
                daily_volume: 500.0,
            },
        ]);

        assert_eq!(results.kind(), ScanKind::Flips);
        assert_eq!(results.len(), 2);
        assert!((results.top_profit() - 243.2).abs() < 1e-9);
        assert!((results.total_profit() - 393.2).abs() < 1e-9);
        let headers = results.headers();
        assert_eq!(headers[0].type_id, 34);
        assert_eq!(headers[0].jumps, 5);
    }

    #[test]
    fn scan_kind_round_trip() {
        for kind in [
            ScanKind::Flips,
            ScanKind::Station,
            ScanKind::Contracts,
            ScanKind::Routes,
        ] {
            assert_eq!(ScanKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ScanKind::parse("bogus"), None);
    }
}
