//! Embedded relational store.
//!
//! One writer connection behind a mutex serializes all mutations; a second
//! connection serves reads. Write-ahead journaling keeps readers from
//! blocking the writer. Every multi-row insert happens inside a single
//! transaction, so a canceled scan either persists completely or not at all.

pub mod alerts;
pub mod results;
pub mod schema;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

use crate::config::Config;
use crate::error::{FlipperError, Result};

/// Metric a watchlist row tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    MarginPercent,
    TotalProfit,
    ProfitPerUnit,
    DailyVolume,
}

impl AlertMetric {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertMetric::MarginPercent => "margin_percent",
            AlertMetric::TotalProfit => "total_profit",
            AlertMetric::ProfitPerUnit => "profit_per_unit",
            AlertMetric::DailyVolume => "daily_volume",
        }
    }

    pub fn parse(s: &str) -> AlertMetric {
        match s {
            "total_profit" => AlertMetric::TotalProfit,
            "profit_per_unit" => AlertMetric::ProfitPerUnit,
            "daily_volume" => AlertMetric::DailyVolume,
            _ => AlertMetric::MarginPercent,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WatchlistItem {
    pub type_id: i32,
    pub type_name: String,
    pub added_at: String,
    #[serde(default)]
    pub alert_enabled: bool,
    #[serde(default = "default_metric")]
    pub alert_metric: AlertMetric,
    #[serde(default)]
    pub alert_threshold: f64,
}

fn default_metric() -> AlertMetric {
    AlertMetric::MarginPercent
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DemandRegion {
    pub region_id: i32,
    pub region_name: String,
    pub hot_score: f64,
    pub status: String,
    pub kills_today: i64,
    pub kills_baseline: i64,
    pub isk_destroyed: f64,
    pub active_players: i64,
    pub top_ships: Vec<String>,
}

pub struct Database {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA busy_timeout = 5000;
        PRAGMA foreign_keys = ON;
        PRAGMA synchronous = NORMAL;
        ",
    )?;
    Ok(())
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let writer = Connection::open(path)?;
        apply_pragmas(&writer)?;
        schema::migrate(&writer)
            .map_err(|e| FlipperError::Fatal(format!("schema migration: {e}")))?;
        schema::import_legacy_config(&writer, path);

        let reader = Connection::open(path)?;
        apply_pragmas(&reader)?;

        info!(path = %path.display(), "database ready");
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    pub(crate) fn write(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.writer.lock().expect("writer poisoned")
    }

    pub(crate) fn read(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.reader.lock().expect("reader poisoned")
    }

    // ---- config ----

    /// Loads the singleton config row, falling back to defaults when the row
    /// is absent or unreadable.
    pub fn load_config(&self) -> Config {
        let conn = self.read();
        let json: Option<String> = conn
            .query_row("SELECT json FROM config WHERE id = 1", [], |row| row.get(0))
            .optional()
            .ok()
            .flatten();
        json.and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default()
    }

    pub fn save_config(&self, config: &Config) -> Result<()> {
        let json = serde_json::to_string(config)?;
        let conn = self.write();
        conn.execute(
            "INSERT INTO config (id, json) VALUES (1, ?1)
             ON CONFLICT (id) DO UPDATE SET json = excluded.json",
            [&json],
        )?;
        Ok(())
    }

    // ---- watchlist ----

    pub fn watchlist(&self) -> Result<Vec<WatchlistItem>> {
        let conn = self.read();
        let mut stmt = conn.prepare(
            "SELECT type_id, type_name, added_at, alert_enabled, alert_metric, alert_threshold
               FROM watchlist ORDER BY type_id",
        )?;
        let items = stmt
            .query_map([], |row| {
                Ok(WatchlistItem {
                    type_id: row.get(0)?,
                    type_name: row.get(1)?,
                    added_at: row.get(2)?,
                    alert_enabled: row.get::<_, i64>(3)? != 0,
                    alert_metric: AlertMetric::parse(&row.get::<_, String>(4)?),
                    alert_threshold: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Inserts a watchlist row. Returns false when the type is already
    /// tracked.
    pub fn add_watchlist_item(&self, item: &WatchlistItem) -> Result<bool> {
        let added_at = if item.added_at.is_empty() {
            Utc::now().to_rfc3339()
        } else {
            item.added_at.clone()
        };
        let conn = self.write();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO watchlist
                 (type_id, type_name, added_at, alert_enabled, alert_metric, alert_threshold)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                item.type_id,
                item.type_name,
                added_at,
                item.alert_enabled as i64,
                item.alert_metric.as_str(),
                item.alert_threshold,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn update_watchlist_alert(
        &self,
        type_id: i32,
        enabled: bool,
        metric: AlertMetric,
        threshold: f64,
    ) -> Result<bool> {
        let conn = self.write();
        let updated = conn.execute(
            "UPDATE watchlist
                SET alert_enabled = ?2, alert_metric = ?3, alert_threshold = ?4
              WHERE type_id = ?1",
            params![type_id, enabled as i64, metric.as_str(), threshold],
        )?;
        Ok(updated > 0)
    }

    /// Removes a watchlist row; alert history cascades away with it.
    pub fn remove_watchlist_item(&self, type_id: i32) -> Result<bool> {
        let conn = self.write();
        let deleted = conn.execute("DELETE FROM watchlist WHERE type_id = ?1", [type_id])?;
        Ok(deleted > 0)
    }

    // ---- demand regions ----

    pub fn upsert_demand_region(&self, region: &DemandRegion) -> Result<()> {
        let ships = serde_json::to_string(&region.top_ships)?;
        let conn = self.write();
        conn.execute(
            "INSERT INTO demand_regions
                 (region_id, region_name, hot_score, status, kills_today, kills_baseline,
                  isk_destroyed, active_players, top_ships, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (region_id) DO UPDATE SET
                 region_name = excluded.region_name,
                 hot_score = excluded.hot_score,
                 status = excluded.status,
                 kills_today = excluded.kills_today,
                 kills_baseline = excluded.kills_baseline,
                 isk_destroyed = excluded.isk_destroyed,
                 active_players = excluded.active_players,
                 top_ships = excluded.top_ships,
                 updated_at = excluded.updated_at",
            params![
                region.region_id,
                region.region_name,
                region.hot_score,
                region.status,
                region.kills_today,
                region.kills_baseline,
                region.isk_destroyed,
                region.active_players,
                ships,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn demand_regions(&self) -> Result<Vec<DemandRegion>> {
        let conn = self.read();
        let mut stmt = conn.prepare(
            "SELECT region_id, region_name, hot_score, status, kills_today, kills_baseline,
                    isk_destroyed, active_players, top_ships
               FROM demand_regions ORDER BY hot_score DESC",
        )?;
        let regions = stmt
            .query_map([], |row| {
                let ships_json: String = row.get(8)?;
                Ok(DemandRegion {
                    region_id: row.get(0)?,
                    region_name: row.get(1)?,
                    hot_score: row.get(2)?,
                    status: row.get(3)?,
                    kills_today: row.get(4)?,
                    kills_baseline: row.get(5)?,
                    isk_destroyed: row.get(6)?,
                    active_players: row.get(7)?,
                    top_ships: serde_json::from_str(&ships_json).unwrap_or_default(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(regions)
    }

    pub fn demand_region(&self, region_id: i32) -> Result<Option<DemandRegion>> {
        Ok(self
            .demand_regions()?
            .into_iter()
            .find(|r| r.region_id == region_id))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use tempfile::TempDir;

    pub fn open_test_db() -> (TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("flipper.db")).unwrap();
        (dir, db)
    }
}
