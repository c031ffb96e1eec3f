//! Alert history persistence.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{AlertMetric, Database};
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertHistoryEntry {
    pub id: i64,
    pub type_id: i32,
    pub type_name: String,
    pub metric: AlertMetric,
    pub threshold: f64,
    pub current_value: f64,
    pub message: String,
    pub channels_sent: Vec<String>,
    pub channels_failed: HashMap<String, String>,
    pub sent_at: String,
    pub scan_id: Option<i64>,
}

impl Database {
    pub fn save_alert(&self, entry: &AlertHistoryEntry) -> Result<i64> {
        let sent_at = if entry.sent_at.is_empty() {
            Utc::now().to_rfc3339()
        } else {
            entry.sent_at.clone()
        };
        let conn = self.write();
        conn.execute(
            "INSERT INTO alert_history (
                 watchlist_type_id, type_name, alert_metric, alert_threshold,
                 current_value, message, channels_sent, channels_failed, sent_at, scan_id
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                entry.type_id,
                entry.type_name,
                entry.metric.as_str(),
                entry.threshold,
                entry.current_value,
                entry.message,
                serde_json::to_string(&entry.channels_sent)?,
                serde_json::to_string(&entry.channels_failed)?,
                sent_at,
                entry.scan_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Alert history, newest first. `type_id` 0 means no filter, `limit` 0
    /// means unlimited.
    pub fn alert_history(&self, type_id: i32, limit: usize) -> Result<Vec<AlertHistoryEntry>> {
        let mut sql = String::from(
            "SELECT id, watchlist_type_id, type_name, alert_metric, alert_threshold,
                    current_value, message, channels_sent, channels_failed, sent_at, scan_id
               FROM alert_history",
        );
        if type_id > 0 {
            sql.push_str(" WHERE watchlist_type_id = ?1");
        }
        sql.push_str(" ORDER BY sent_at DESC, id DESC");
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.read();
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<AlertHistoryEntry> {
            let metric: String = row.get(3)?;
            let sent: String = row.get(7)?;
            let failed: String = row.get(8)?;
            Ok(AlertHistoryEntry {
                id: row.get(0)?,
                type_id: row.get(1)?,
                type_name: row.get(2)?,
                metric: AlertMetric::parse(&metric),
                threshold: row.get(4)?,
                current_value: row.get(5)?,
                message: row.get(6)?,
                channels_sent: serde_json::from_str(&sent).unwrap_or_default(),
                channels_failed: serde_json::from_str(&failed).unwrap_or_default(),
                sent_at: row.get(9)?,
                scan_id: row.get(10)?,
            })
        };

        let entries = if type_id > 0 {
            stmt.query_map([type_id], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            stmt.query_map([], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        Ok(entries)
    }

    /// When the most recent alert for this exact (type, metric, threshold)
    /// triple was sent. `None` when no such alert exists; a changed
    /// threshold therefore starts with a clean slate.
    pub fn last_alert_time(
        &self,
        type_id: i32,
        metric: AlertMetric,
        threshold: f64,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.read();
        let sent_at: Option<String> = conn
            .query_row(
                "SELECT sent_at FROM alert_history
                  WHERE watchlist_type_id = ?1 AND alert_metric = ?2 AND alert_threshold = ?3
                  ORDER BY sent_at DESC LIMIT 1",
                params![type_id, metric.as_str(), threshold],
                |row| row.get(0),
            )
            .optional()?;

        Ok(sent_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    /// Removes alert rows older than the cutoff. Returns how many went away.
    pub fn cleanup_alert_history(&self, older_than_days: u32) -> Result<usize> {
        if older_than_days == 0 {
            return Ok(0);
        }
        let cutoff = (Utc::now() - chrono::Duration::days(older_than_days as i64)).to_rfc3339();
        let conn = self.write();
        let removed = conn.execute("DELETE FROM alert_history WHERE sent_at < ?1", [cutoff])?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testutil::open_test_db;
    use crate::storage::WatchlistItem;

    fn watch(db: &Database, type_id: i32) {
        db.add_watchlist_item(&WatchlistItem {
            type_id,
            type_name: format!("Type {type_id}"),
            added_at: String::new(),
            alert_enabled: true,
            alert_metric: AlertMetric::MarginPercent,
            alert_threshold: 10.0,
        })
        .unwrap();
    }

    fn entry(type_id: i32, sent_at: &str) -> AlertHistoryEntry {
        AlertHistoryEntry {
            id: 0,
            type_id,
            type_name: format!("Type {type_id}"),
            metric: AlertMetric::MarginPercent,
            threshold: 10.0,
            current_value: 14.2,
            message: "Type: Margin 14.20% >= 10.00%".into(),
            channels_sent: vec!["desktop".into()],
            channels_failed: HashMap::new(),
            sent_at: sent_at.to_string(),
            scan_id: None,
        }
    }

    #[test]
    fn save_and_list() {
        let (_dir, db) = open_test_db();
        watch(&db, 34);
        db.save_alert(&entry(34, "2026-07-01T10:00:00+00:00")).unwrap();
        db.save_alert(&entry(34, "2026-07-02T10:00:00+00:00")).unwrap();

        let all = db.alert_history(0, 0).unwrap();
        assert_eq!(all.len(), 2);
        // Newest first.
        assert_eq!(all[0].sent_at, "2026-07-02T10:00:00+00:00");
        assert_eq!(all[0].channels_sent, vec!["desktop"]);

        let limited = db.alert_history(34, 1).unwrap();
        assert_eq!(limited.len(), 1);
        assert!(db.alert_history(99, 0).unwrap().is_empty());
    }

    #[test]
    fn last_alert_time_keys_on_full_triple() {
        let (_dir, db) = open_test_db();
        watch(&db, 34);
        db.save_alert(&entry(34, "2026-07-01T10:00:00+00:00")).unwrap();

        let hit = db
            .last_alert_time(34, AlertMetric::MarginPercent, 10.0)
            .unwrap();
        assert!(hit.is_some());

        // A different threshold has no history, so dedup resets.
        assert!(db
            .last_alert_time(34, AlertMetric::MarginPercent, 12.0)
            .unwrap()
            .is_none());
        assert!(db
            .last_alert_time(34, AlertMetric::TotalProfit, 10.0)
            .unwrap()
            .is_none());
        assert!(db
            .last_alert_time(35, AlertMetric::MarginPercent, 10.0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn watchlist_delete_cascades_history() {
        let (_dir, db) = open_test_db();
        watch(&db, 34);
        db.save_alert(&entry(34, "2026-07-01T10:00:00+00:00")).unwrap();
        db.save_alert(&entry(34, "2026-07-02T10:00:00+00:00")).unwrap();
        assert_eq!(db.alert_history(34, 0).unwrap().len(), 2);

        db.remove_watchlist_item(34).unwrap();
        assert!(db.alert_history(34, 0).unwrap().is_empty());
    }

    #[test]
    fn cleanup_removes_only_old_rows() {
        let (_dir, db) = open_test_db();
        watch(&db, 34);
        let old = (Utc::now() - chrono::Duration::days(40)).to_rfc3339();
        let recent = (Utc::now() - chrono::Duration::days(2)).to_rfc3339();
        db.save_alert(&entry(34, &old)).unwrap();
        db.save_alert(&entry(34, &recent)).unwrap();

        let removed = db.cleanup_alert_history(30).unwrap();
        assert_eq!(removed, 1);
        let remaining = db.alert_history(34, 0).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].sent_at, recent);

        assert_eq!(db.cleanup_alert_history(0).unwrap(), 0);
    }
}
