//! Schema creation and migration.
//!
//! Migrations are additive and idempotent: tables are created `IF NOT
//! EXISTS` and later columns are probed through `PRAGMA table_info` before
//! being added, so running them against any prior schema version converges
//! on the same shape as a fresh install. Columns are never renamed or
//! dropped.

use rusqlite::Connection;
use std::path::Path;
use tracing::{info, warn};

use crate::error::Result;

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS config (
            id   INTEGER PRIMARY KEY CHECK (id = 1),
            json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS watchlist (
            type_id   INTEGER PRIMARY KEY,
            type_name TEXT NOT NULL DEFAULT '',
            added_at  TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS alert_history (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            watchlist_type_id INTEGER NOT NULL
                REFERENCES watchlist(type_id) ON DELETE CASCADE,
            type_name       TEXT NOT NULL DEFAULT '',
            alert_metric    TEXT NOT NULL,
            alert_threshold REAL NOT NULL,
            current_value   REAL NOT NULL,
            message         TEXT NOT NULL DEFAULT '',
            channels_sent   TEXT NOT NULL DEFAULT '[]',
            channels_failed TEXT NOT NULL DEFAULT '{}',
            sent_at         TEXT NOT NULL,
            scan_id         INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_alert_history_lookup
            ON alert_history (watchlist_type_id, alert_metric, alert_threshold, sent_at);

        CREATE TABLE IF NOT EXISTS scan_history (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            kind          TEXT NOT NULL,
            origin_system TEXT NOT NULL DEFAULT '',
            started_at    TEXT NOT NULL,
            duration_ms   INTEGER NOT NULL DEFAULT 0,
            result_count  INTEGER NOT NULL DEFAULT 0,
            top_profit    REAL NOT NULL DEFAULT 0,
            total_profit  REAL NOT NULL DEFAULT 0,
            params_json   TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS flip_results (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            scan_id INTEGER NOT NULL
                REFERENCES scan_history(id) ON DELETE CASCADE,
            type_id          INTEGER NOT NULL,
            type_name        TEXT NOT NULL DEFAULT '',
            item_volume      REAL NOT NULL DEFAULT 0,
            buy_price        REAL NOT NULL DEFAULT 0,
            buy_station      TEXT NOT NULL DEFAULT '',
            buy_system_id    INTEGER NOT NULL DEFAULT 0,
            buy_system_name  TEXT NOT NULL DEFAULT '',
            sell_price       REAL NOT NULL DEFAULT 0,
            sell_station     TEXT NOT NULL DEFAULT '',
            sell_system_id   INTEGER NOT NULL DEFAULT 0,
            sell_system_name TEXT NOT NULL DEFAULT '',
            profit_per_unit  REAL NOT NULL DEFAULT 0,
            margin_percent   REAL NOT NULL DEFAULT 0,
            units            INTEGER NOT NULL DEFAULT 0,
            buy_order_remain  INTEGER NOT NULL DEFAULT 0,
            sell_order_remain INTEGER NOT NULL DEFAULT 0,
            total_profit    REAL NOT NULL DEFAULT 0,
            profit_per_jump REAL NOT NULL DEFAULT 0,
            buy_jumps       INTEGER NOT NULL DEFAULT 0,
            sell_jumps      INTEGER NOT NULL DEFAULT 0,
            total_jumps     INTEGER NOT NULL DEFAULT 0,
            daily_volume    REAL NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS station_results (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            scan_id INTEGER NOT NULL
                REFERENCES scan_history(id) ON DELETE CASCADE,
            type_id        INTEGER NOT NULL,
            type_name      TEXT NOT NULL DEFAULT '',
            station_id     INTEGER NOT NULL DEFAULT 0,
            station_name   TEXT NOT NULL DEFAULT '',
            best_bid       REAL NOT NULL DEFAULT 0,
            best_ask       REAL NOT NULL DEFAULT 0,
            spread         REAL NOT NULL DEFAULT 0,
            margin_percent REAL NOT NULL DEFAULT 0,
            daily_volume   REAL NOT NULL DEFAULT 0,
            buy_volume     INTEGER NOT NULL DEFAULT 0,
            sell_volume    INTEGER NOT NULL DEFAULT 0,
            vwap           REAL NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS contract_results (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            scan_id INTEGER NOT NULL
                REFERENCES scan_history(id) ON DELETE CASCADE,
            contract_id    INTEGER NOT NULL,
            title          TEXT NOT NULL DEFAULT '',
            price          REAL NOT NULL DEFAULT 0,
            market_value   REAL NOT NULL DEFAULT 0,
            profit         REAL NOT NULL DEFAULT 0,
            margin_percent REAL NOT NULL DEFAULT 0,
            volume_m3      REAL NOT NULL DEFAULT 0,
            station_name   TEXT NOT NULL DEFAULT '',
            system_name    TEXT NOT NULL DEFAULT '',
            region_name    TEXT NOT NULL DEFAULT '',
            item_count     INTEGER NOT NULL DEFAULT 0,
            jumps          INTEGER NOT NULL DEFAULT 0,
            profit_per_jump REAL NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS route_results (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            scan_id INTEGER NOT NULL
                REFERENCES scan_history(id) ON DELETE CASCADE,
            total_profit    REAL NOT NULL DEFAULT 0,
            total_jumps     INTEGER NOT NULL DEFAULT 0,
            profit_per_jump REAL NOT NULL DEFAULT 0,
            isk_used        REAL NOT NULL DEFAULT 0,
            cargo_used_m3   REAL NOT NULL DEFAULT 0,
            segments_json   TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE IF NOT EXISTS demand_regions (
            region_id      INTEGER PRIMARY KEY,
            region_name    TEXT NOT NULL DEFAULT '',
            hot_score      REAL NOT NULL DEFAULT 0,
            status         TEXT NOT NULL DEFAULT '',
            kills_today    INTEGER NOT NULL DEFAULT 0,
            kills_baseline INTEGER NOT NULL DEFAULT 0,
            isk_destroyed  REAL NOT NULL DEFAULT 0,
            active_players INTEGER NOT NULL DEFAULT 0,
            top_ships      TEXT NOT NULL DEFAULT '[]',
            updated_at     TEXT NOT NULL DEFAULT ''
        );
        ",
    )?;

    // Columns added after the first release. Probing keeps reruns no-ops.
    add_column_if_missing(conn, "watchlist", "alert_enabled", "INTEGER NOT NULL DEFAULT 0")?;
    add_column_if_missing(
        conn,
        "watchlist",
        "alert_metric",
        "TEXT NOT NULL DEFAULT 'margin_percent'",
    )?;
    add_column_if_missing(conn, "watchlist", "alert_threshold", "REAL NOT NULL DEFAULT 0")?;

    for (column, decl) in [
        ("volatility_pct", "REAL NOT NULL DEFAULT 0"),
        ("depth_score", "REAL NOT NULL DEFAULT 0"),
        ("days_of_supply", "REAL NOT NULL DEFAULT 0"),
        ("buy_sell_ratio", "REAL NOT NULL DEFAULT 0"),
        ("scam_score", "REAL NOT NULL DEFAULT 0"),
        ("period_roi_pct", "REAL NOT NULL DEFAULT 0"),
        ("composite_score", "REAL NOT NULL DEFAULT 0"),
        ("filled_qty", "INTEGER NOT NULL DEFAULT 0"),
        ("can_fill", "INTEGER NOT NULL DEFAULT 0"),
        ("expected_buy_price", "REAL NOT NULL DEFAULT 0"),
        ("expected_sell_price", "REAL NOT NULL DEFAULT 0"),
        ("slippage_buy_pct", "REAL NOT NULL DEFAULT 0"),
        ("slippage_sell_pct", "REAL NOT NULL DEFAULT 0"),
        ("expected_profit", "REAL NOT NULL DEFAULT 0"),
        ("daily_profit", "REAL NOT NULL DEFAULT 0"),
    ] {
        add_column_if_missing(conn, "station_results", column, decl)?;
    }

    for (column, decl) in [
        ("expected_profit", "REAL NOT NULL DEFAULT 0"),
        ("expected_margin_percent", "REAL NOT NULL DEFAULT 0"),
        ("sell_confidence_pct", "REAL NOT NULL DEFAULT 0"),
        ("est_liquidation_days", "REAL NOT NULL DEFAULT 0"),
        ("conservative_value", "REAL NOT NULL DEFAULT 0"),
        ("carry_cost", "REAL NOT NULL DEFAULT 0"),
    ] {
        add_column_if_missing(conn, "contract_results", column, decl)?;
    }

    Ok(())
}

pub fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    if !has_column(conn, table, column)? {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
    }
    Ok(())
}

/// First-start import of the pre-database JSON config file. The file is
/// renamed to a backup afterwards so the import runs at most once.
pub fn import_legacy_config(conn: &Connection, db_path: &Path) {
    let dir = match db_path.parent() {
        Some(d) => d.to_path_buf(),
        None => return,
    };
    let legacy = dir.join("config.json");
    if !legacy.exists() {
        return;
    }

    let already: std::result::Result<i64, _> =
        conn.query_row("SELECT COUNT(*) FROM config", [], |row| row.get(0));
    if matches!(already, Ok(n) if n > 0) {
        return;
    }

    match std::fs::read_to_string(&legacy) {
        Ok(raw) => match serde_json::from_str::<crate::config::Config>(&raw) {
            Ok(cfg) => {
                let json = serde_json::to_string(&cfg).unwrap_or_else(|_| "{}".into());
                if let Err(e) = conn.execute(
                    "INSERT OR REPLACE INTO config (id, json) VALUES (1, ?1)",
                    [&json],
                ) {
                    warn!(error = %e, "legacy config import failed");
                    return;
                }
                let backup = dir.join("config.json.bak");
                if let Err(e) = std::fs::rename(&legacy, &backup) {
                    warn!(error = %e, "could not rename legacy config");
                } else {
                    info!(path = %backup.display(), "imported legacy config");
                }
            }
            Err(e) => warn!(error = %e, "legacy config unreadable, skipping import"),
        },
        Err(e) => warn!(error = %e, "legacy config unreadable, skipping import"),
    }
}
