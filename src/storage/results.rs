//! Scan history and typed result persistence.
//!
//! One scan writes one `scan_history` row plus its result rows in a single
//! transaction; cancellation before commit leaves nothing behind. Rows are
//! never mutated after insert.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Database;
use crate::engine::{
    ContractResult, FlipResult, RouteResult, RouteSegment, ScanKind, ScanResults, StationTrade,
};
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: i64,
    pub kind: ScanKind,
    pub origin_system: String,
    pub started_at: String,
    pub duration_ms: i64,
    pub result_count: i64,
    pub top_profit: f64,
    pub total_profit: f64,
    pub params_json: String,
}

impl Database {
    /// Persists a finished scan and its full result set atomically.
    /// Returns the new scan id.
    pub fn record_scan(
        &self,
        origin_system: &str,
        started_at: &str,
        duration_ms: i64,
        params_json: &str,
        results: &ScanResults,
    ) -> Result<i64> {
        let mut conn = self.write();
        let tx = conn.transaction()?;

        let started_at = if started_at.is_empty() {
            Utc::now().to_rfc3339()
        } else {
            started_at.to_string()
        };
        tx.execute(
            "INSERT INTO scan_history
                 (kind, origin_system, started_at, duration_ms, result_count,
                  top_profit, total_profit, params_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                results.kind().as_str(),
                origin_system,
                started_at,
                duration_ms,
                results.len() as i64,
                results.top_profit(),
                results.total_profit(),
                params_json,
            ],
        )?;
        let scan_id = tx.last_insert_rowid();

        match results {
            ScanResults::Flips(rows) => {
                let mut stmt = tx.prepare(
                    "INSERT INTO flip_results (
                         scan_id, type_id, type_name, item_volume,
                         buy_price, buy_station, buy_system_id, buy_system_name,
                         sell_price, sell_station, sell_system_id, sell_system_name,
                         profit_per_unit, margin_percent, units,
                         buy_order_remain, sell_order_remain,
                         total_profit, profit_per_jump, buy_jumps, sell_jumps,
                         total_jumps, daily_volume
                     ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,
                               ?18,?19,?20,?21,?22,?23)",
                )?;
                for r in rows {
                    stmt.execute(params![
                        scan_id,
                        r.type_id,
                        r.type_name,
                        r.item_volume,
                        r.buy_price,
                        r.buy_station,
                        r.buy_system_id,
                        r.buy_system_name,
                        r.sell_price,
                        r.sell_station,
                        r.sell_system_id,
                        r.sell_system_name,
                        r.profit_per_unit,
                        r.margin_percent,
                        r.units,
                        r.buy_order_remain,
                        r.sell_order_remain,
                        r.total_profit,
                        r.profit_per_jump,
                        r.buy_jumps,
                        r.sell_jumps,
                        r.total_jumps,
                        r.daily_volume,
                    ])?;
                }
            }
            ScanResults::Station(rows) => {
                let mut stmt = tx.prepare(
                    "INSERT INTO station_results (
                         scan_id, type_id, type_name, station_id, station_name,
                         best_bid, best_ask, spread, margin_percent,
                         daily_volume, buy_volume, sell_volume, vwap,
                         volatility_pct, depth_score, days_of_supply, buy_sell_ratio,
                         scam_score, period_roi_pct, composite_score, daily_profit,
                         filled_qty, can_fill, expected_buy_price, expected_sell_price,
                         slippage_buy_pct, slippage_sell_pct, expected_profit
                     ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,
                               ?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?27,?28)",
                )?;
                for r in rows {
                    stmt.execute(params![
                        scan_id,
                        r.type_id,
                        r.type_name,
                        r.station_id,
                        r.station_name,
                        r.best_bid,
                        r.best_ask,
                        r.spread,
                        r.margin_percent,
                        r.daily_volume,
                        r.buy_volume,
                        r.sell_volume,
                        r.vwap,
                        r.volatility_pct,
                        r.depth_score,
                        r.days_of_supply,
                        r.buy_sell_ratio,
                        r.scam_score,
                        r.period_roi_pct,
                        r.composite_score,
                        r.daily_profit,
                        r.filled_qty,
                        r.can_fill as i64,
                        r.expected_buy_price,
                        r.expected_sell_price,
                        r.slippage_buy_pct,
                        r.slippage_sell_pct,
                        r.expected_profit,
                    ])?;
                }
            }
            ScanResults::Contracts(rows) => {
                let mut stmt = tx.prepare(
                    "INSERT INTO contract_results (
                         scan_id, contract_id, title, price, market_value,
                         profit, margin_percent, expected_profit, expected_margin_percent,
                         sell_confidence_pct, est_liquidation_days, conservative_value,
                         carry_cost, volume_m3, station_name, system_name, region_name,
                         item_count, jumps, profit_per_jump
                     ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,
                               ?17,?18,?19,?20)",
                )?;
                for r in rows {
                    stmt.execute(params![
                        scan_id,
                        r.contract_id,
                        r.title,
                        r.price,
                        r.market_value,
                        r.profit,
                        r.margin_percent,
                        r.expected_profit,
                        r.expected_margin_percent,
                        r.sell_confidence_pct,
                        r.est_liquidation_days,
                        r.conservative_value,
                        r.carry_cost,
                        r.volume_m3,
                        r.station_name,
                        r.system_name,
                        r.region_name,
                        r.item_count,
                        r.jumps,
                        r.profit_per_jump,
                    ])?;
                }
            }
            ScanResults::Routes(rows) => {
                let mut stmt = tx.prepare(
                    "INSERT INTO route_results (
                         scan_id, total_profit, total_jumps, profit_per_jump,
                         isk_used, cargo_used_m3, segments_json
                     ) VALUES (?1,?2,?3,?4,?5,?6,?7)",
                )?;
                for r in rows {
                    stmt.execute(params![
                        scan_id,
                        r.total_profit,
                        r.total_jumps,
                        r.profit_per_jump,
                        r.isk_used,
                        r.cargo_used_m3,
                        serde_json::to_string(&r.segments)?,
                    ])?;
                }
            }
        }

        tx.commit()?;
        Ok(scan_id)
    }

    pub fn scan_history(&self, limit: usize) -> Result<Vec<ScanRecord>> {
        let conn = self.read();
        let mut stmt = conn.prepare(
            "SELECT id, kind, origin_system, started_at, duration_ms, result_count,
                    top_profit, total_profit, params_json
               FROM scan_history ORDER BY id DESC LIMIT ?1",
        )?;
        let records = stmt
            .query_map([limit as i64], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn scan_by_id(&self, scan_id: i64) -> Result<Option<ScanRecord>> {
        let conn = self.read();
        let record = conn
            .query_row(
                "SELECT id, kind, origin_system, started_at, duration_ms, result_count,
                        top_profit, total_profit, params_json
                   FROM scan_history WHERE id = ?1",
                [scan_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Loads the full result set for a scan, typed by the recorded kind.
    pub fn scan_results(&self, scan_id: i64) -> Result<Option<ScanResults>> {
        let record = match self.scan_by_id(scan_id)? {
            Some(r) => r,
            None => return Ok(None),
        };

        let conn = self.read();
        let results = match record.kind {
            ScanKind::Flips => {
                let mut stmt = conn.prepare(
                    "SELECT type_id, type_name, item_volume,
                            buy_price, buy_station, buy_system_id, buy_system_name,
                            sell_price, sell_station, sell_system_id, sell_system_name,
                            profit_per_unit, margin_percent, units,
                            buy_order_remain, sell_order_remain,
                            total_profit, profit_per_jump, buy_jumps, sell_jumps,
                            total_jumps, daily_volume
                       FROM flip_results WHERE scan_id = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([scan_id], |row| {
                        Ok(FlipResult {
                            type_id: row.get(0)?,
                            type_name: row.get(1)?,
                            item_volume: row.get(2)?,
                            buy_price: row.get(3)?,
                            buy_station: row.get(4)?,
                            buy_system_id: row.get(5)?,
                            buy_system_name: row.get(6)?,
                            sell_price: row.get(7)?,
                            sell_station: row.get(8)?,
                            sell_system_id: row.get(9)?,
                            sell_system_name: row.get(10)?,
                            profit_per_unit: row.get(11)?,
                            margin_percent: row.get(12)?,
                            units: row.get(13)?,
                            buy_order_remain: row.get(14)?,
                            sell_order_remain: row.get(15)?,
                            total_profit: row.get(16)?,
                            profit_per_jump: row.get(17)?,
                            buy_jumps: row.get(18)?,
                            sell_jumps: row.get(19)?,
                            total_jumps: row.get(20)?,
                            daily_volume: row.get(21)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                ScanResults::Flips(rows)
            }
            ScanKind::Station => {
                let mut stmt = conn.prepare(
                    "SELECT type_id, type_name, station_id, station_name,
                            best_bid, best_ask, spread, margin_percent,
                            daily_volume, buy_volume, sell_volume, vwap,
                            volatility_pct, depth_score, days_of_supply, buy_sell_ratio,
                            scam_score, period_roi_pct, composite_score, daily_profit,
                            filled_qty, can_fill, expected_buy_price, expected_sell_price,
                            slippage_buy_pct, slippage_sell_pct, expected_profit
                       FROM station_results WHERE scan_id = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([scan_id], |row| {
                        Ok(StationTrade {
                            type_id: row.get(0)?,
                            type_name: row.get(1)?,
                            station_id: row.get(2)?,
                            station_name: row.get(3)?,
                            best_bid: row.get(4)?,
                            best_ask: row.get(5)?,
                            spread: row.get(6)?,
                            margin_percent: row.get(7)?,
                            daily_volume: row.get(8)?,
                            buy_volume: row.get(9)?,
                            sell_volume: row.get(10)?,
                            vwap: row.get(11)?,
                            volatility_pct: row.get(12)?,
                            depth_score: row.get(13)?,
                            days_of_supply: row.get(14)?,
                            buy_sell_ratio: row.get(15)?,
                            scam_score: row.get(16)?,
                            period_roi_pct: row.get(17)?,
                            composite_score: row.get(18)?,
                            daily_profit: row.get(19)?,
                            filled_qty: row.get(20)?,
                            can_fill: row.get::<_, i64>(21)? != 0,
                            expected_buy_price: row.get(22)?,
                            expected_sell_price: row.get(23)?,
                            slippage_buy_pct: row.get(24)?,
                            slippage_sell_pct: row.get(25)?,
                            expected_profit: row.get(26)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                ScanResults::Station(rows)
            }
            ScanKind::Contracts => {
                let mut stmt = conn.prepare(
                    "SELECT contract_id, title, price, market_value, profit, margin_percent,
                            expected_profit, expected_margin_percent, sell_confidence_pct,
                            est_liquidation_days, conservative_value, carry_cost, volume_m3,
                            station_name, system_name, region_name, item_count, jumps,
                            profit_per_jump
                       FROM contract_results WHERE scan_id = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([scan_id], |row| {
                        Ok(ContractResult {
                            contract_id: row.get(0)?,
                            title: row.get(1)?,
                            price: row.get(2)?,
                            market_value: row.get(3)?,
                            profit: row.get(4)?,
                            margin_percent: row.get(5)?,
                            expected_profit: row.get(6)?,
                            expected_margin_percent: row.get(7)?,
                            sell_confidence_pct: row.get(8)?,
                            est_liquidation_days: row.get(9)?,
                            conservative_value: row.get(10)?,
                            carry_cost: row.get(11)?,
                            volume_m3: row.get(12)?,
                            station_name: row.get(13)?,
                            system_name: row.get(14)?,
                            region_name: row.get(15)?,
                            item_count: row.get(16)?,
                            jumps: row.get(17)?,
                            profit_per_jump: row.get(18)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                ScanResults::Contracts(rows)
            }
            ScanKind::Routes => {
                let mut stmt = conn.prepare(
                    "SELECT total_profit, total_jumps, profit_per_jump, isk_used,
                            cargo_used_m3, segments_json
                       FROM route_results WHERE scan_id = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([scan_id], |row| {
                        let segments_json: String = row.get(5)?;
                        Ok(RouteResult {
                            total_profit: row.get(0)?,
                            total_jumps: row.get(1)?,
                            profit_per_jump: row.get(2)?,
                            isk_used: row.get(3)?,
                            cargo_used_m3: row.get(4)?,
                            segments: serde_json::from_str(&segments_json).unwrap_or_default(),
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                ScanResults::Routes(rows)
            }
        };
        Ok(Some(results))
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScanRecord> {
    let kind: String = row.get(1)?;
    Ok(ScanRecord {
        id: row.get(0)?,
        kind: ScanKind::parse(&kind).unwrap_or(ScanKind::Flips),
        origin_system: row.get(2)?,
        started_at: row.get(3)?,
        duration_ms: row.get(4)?,
        result_count: row.get(5)?,
        top_profit: row.get(6)?,
        total_profit: row.get(7)?,
        params_json: row.get(8)?,
    })
}
