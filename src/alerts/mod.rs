//! Watchlist alert pipeline.
//!
//! After a scan finishes, every enabled watchlist row is checked against
//! the fresh results: find the row's type, read the tracked metric, apply
//! the threshold and the per-triple cooldown, then fan the message out to
//! the configured channels and record the outcome. A failed channel send
//! is recorded, never retried here; a failed history write is logged and
//! does not undo the send.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::ScanResults;
use crate::storage::alerts::AlertHistoryEntry;
use crate::storage::{AlertMetric, Database};

const CHANNEL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_COOLDOWN_SECS: u64 = 3600;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone)]
pub struct PendingAlert {
    pub type_id: i32,
    pub type_name: String,
    pub metric: AlertMetric,
    pub threshold: f64,
    pub current_value: f64,
    pub message: String,
}

pub struct AlertEngine {
    db: Arc<Database>,
    http: reqwest::Client,
    telegram_base: String,
}

/// Reads the tracked metric for one type out of a result set. Contract and
/// route rows have no per-type identity, so they never match.
pub fn extract_metric(results: &ScanResults, type_id: i32, metric: AlertMetric) -> Option<(f64, String)> {
    match results {
        ScanResults::Flips(rows) => rows.iter().find(|r| r.type_id == type_id).map(|r| {
            let value = match metric {
                AlertMetric::MarginPercent => r.margin_percent,
                AlertMetric::TotalProfit => r.total_profit,
                AlertMetric::ProfitPerUnit => r.profit_per_unit,
                AlertMetric::DailyVolume => r.daily_volume,
            };
            (value, r.type_name.clone())
        }),
        ScanResults::Station(rows) => rows.iter().find(|r| r.type_id == type_id).map(|r| {
            let value = match metric {
                AlertMetric::MarginPercent => r.margin_percent,
                AlertMetric::TotalProfit => r.daily_profit,
                AlertMetric::ProfitPerUnit => r.best_ask - r.best_bid,
                AlertMetric::DailyVolume => r.daily_volume,
            };
            (value, r.type_name.clone())
        }),
        ScanResults::Contracts(_) | ScanResults::Routes(_) => None,
    }
}

pub fn format_message(type_name: &str, metric: AlertMetric, threshold: f64, current: f64) -> String {
    match metric {
        AlertMetric::MarginPercent => {
            format!("{type_name}: Margin {current:.2}% >= {threshold:.2}%")
        }
        AlertMetric::TotalProfit => {
            format!("{type_name}: Total Profit {current:.0} ISK >= {threshold:.0} ISK")
        }
        AlertMetric::ProfitPerUnit => {
            format!("{type_name}: Profit/Unit {current:.0} ISK >= {threshold:.0} ISK")
        }
        AlertMetric::DailyVolume => {
            format!("{type_name}: Daily Volume {current:.0} >= {threshold:.0}")
        }
    }
}

impl AlertEngine {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            http: reqwest::Client::new(),
            telegram_base: TELEGRAM_API_BASE.to_string(),
        }
    }

    #[cfg(test)]
    fn with_telegram_base(mut self, base: &str) -> Self {
        self.telegram_base = base.trim_end_matches('/').to_string();
        self
    }

    /// Which watchlist rows should fire against this result set right now.
    pub fn check(&self, config: &Config, results: &ScanResults) -> Vec<PendingAlert> {
        let watchlist = match self.db.watchlist() {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "watchlist unavailable, skipping alert check");
                return Vec::new();
            }
        };

        let cooldown = if config.alert_cooldown_secs > 0 {
            config.alert_cooldown_secs
        } else {
            DEFAULT_COOLDOWN_SECS
        };

        let mut pending = Vec::new();
        for item in watchlist.iter().filter(|i| i.alert_enabled) {
            if item.alert_threshold <= 0.0 {
                continue;
            }
            let Some((current, type_name)) =
                extract_metric(results, item.type_id, item.alert_metric)
            else {
                continue;
            };
            if current < item.alert_threshold {
                continue;
            }

            match self
                .db
                .last_alert_time(item.type_id, item.alert_metric, item.alert_threshold)
            {
                Ok(Some(last)) => {
                    let elapsed = (Utc::now() - last).num_seconds();
                    if elapsed >= 0 && (elapsed as u64) < cooldown {
                        info!(
                            type_id = item.type_id,
                            elapsed, "alert cooldown active, skipping"
                        );
                        continue;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(type_id = item.type_id, error = %e, "cooldown lookup failed");
                    continue;
                }
            }

            let display_name = if type_name.is_empty() {
                item.type_name.clone()
            } else {
                type_name
            };
            let message =
                format_message(&display_name, item.alert_metric, item.alert_threshold, current);
            pending.push(PendingAlert {
                type_id: item.type_id,
                type_name: display_name,
                metric: item.alert_metric,
                threshold: item.alert_threshold,
                current_value: current,
                message,
            });
        }
        pending
    }

    /// Sends one alert over every enabled channel and records the outcome.
    pub async fn send(
        &self,
        config: &Config,
        alert: &PendingAlert,
        scan_id: Option<i64>,
    ) -> AlertHistoryEntry {
        let mut sent: Vec<String> = Vec::new();
        let mut failed: HashMap<String, String> = HashMap::new();

        if config.alert_telegram
            && !config.alert_telegram_token.is_empty()
            && !config.alert_telegram_chat_id.is_empty()
        {
            match self.send_telegram(config, &alert.message).await {
                Ok(()) => sent.push("telegram".into()),
                Err(e) => {
                    failed.insert("telegram".into(), e);
                }
            }
        }
        if config.alert_discord && !config.alert_discord_webhook.is_empty() {
            match self.send_discord(config, &alert.message).await {
                Ok(()) => sent.push("discord".into()),
                Err(e) => {
                    failed.insert("discord".into(), e);
                }
            }
        }
        // The desktop channel is delivered by the browser-side listener, so
        // it always counts as sent.
        if config.alert_desktop {
            sent.push("desktop".into());
        }

        let entry = AlertHistoryEntry {
            id: 0,
            type_id: alert.type_id,
            type_name: alert.type_name.clone(),
            metric: alert.metric,
            threshold: alert.threshold,
            current_value: alert.current_value,
            message: alert.message.clone(),
            channels_sent: sent,
            channels_failed: failed,
            sent_at: Utc::now().to_rfc3339(),
            scan_id,
        };

        if let Err(e) = self.db.save_alert(&entry) {
            warn!(type_id = alert.type_id, error = %e, "alert history write failed");
        } else {
            info!(
                type_id = alert.type_id,
                channels = ?entry.channels_sent,
                "alert sent"
            );
        }
        entry
    }

    /// Full pipeline for a finished scan.
    pub async fn run(
        &self,
        config: &Config,
        results: &ScanResults,
        scan_id: Option<i64>,
    ) -> Vec<AlertHistoryEntry> {
        let pending = self.check(config, results);
        let mut entries = Vec::with_capacity(pending.len());
        for alert in &pending {
            entries.push(self.send(config, alert, scan_id).await);
        }
        entries
    }

    async fn send_telegram(&self, config: &Config, text: &str) -> std::result::Result<(), String> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.telegram_base, config.alert_telegram_token
        );
        let body = json!({
            "chat_id": config.alert_telegram_chat_id,
            "text": text,
        });
        let response = self
            .http
            .post(&url)
            .timeout(CHANNEL_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("telegram returned {}", response.status()))
        }
    }

    async fn send_discord(&self, config: &Config, text: &str) -> std::result::Result<(), String> {
        let body = json!({ "content": text });
        let response = self
            .http
            .post(&config.alert_discord_webhook)
            .timeout(CHANNEL_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("discord returned {}", response.status()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FlipResult;
    use crate::storage::testutil::open_test_db;
    use crate::storage::WatchlistItem;
    use wiremock::matchers::{body_string_contains, method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn flip_row(type_id: i32, margin: f64, total: f64) -> FlipResult {
        FlipResult {
            type_id,
            type_name: format!("Type {type_id}"),
            item_volume: 0.01,
            buy_price: 100.0,
            buy_station: String::new(),
            buy_system_id: 1,
            buy_system_name: String::new(),
            sell_price: 130.0,
            sell_station: String::new(),
            sell_system_id: 2,
            sell_system_name: String::new(),
            profit_per_unit: 25.0,
            margin_percent: margin,
            units: 10,
            buy_order_remain: 0,
            sell_order_remain: 0,
            total_profit: total,
            profit_per_jump: 0.0,
            buy_jumps: 0,
            sell_jumps: 0,
            total_jumps: 0,
            daily_volume: 4000.0,
        }
    }

    fn watch(db: &Database, type_id: i32, metric: AlertMetric, threshold: f64) {
        db.add_watchlist_item(&WatchlistItem {
            type_id,
            type_name: format!("Type {type_id}"),
            added_at: String::new(),
            alert_enabled: true,
            alert_metric: metric,
            alert_threshold: threshold,
        })
        .unwrap();
    }

    #[test]
    fn metric_extraction_per_kind() {
        let results = ScanResults::Flips(vec![flip_row(34, 14.0, 2_000_000.0)]);
        let (margin, name) = extract_metric(&results, 34, AlertMetric::MarginPercent).unwrap();
        assert_eq!(margin, 14.0);
        assert_eq!(name, "Type 34");
        let (total, _) = extract_metric(&results, 34, AlertMetric::TotalProfit).unwrap();
        assert_eq!(total, 2_000_000.0);
        assert!(extract_metric(&results, 99, AlertMetric::MarginPercent).is_none());

        let contracts = ScanResults::Contracts(vec![]);
        assert!(extract_metric(&contracts, 34, AlertMetric::MarginPercent).is_none());
    }

    #[test]
    fn message_formats() {
        assert_eq!(
            format_message("Tritanium", AlertMetric::MarginPercent, 10.0, 14.2),
            "Tritanium: Margin 14.20% >= 10.00%"
        );
        assert_eq!(
            format_message("Tritanium", AlertMetric::TotalProfit, 1_000_000.0, 2_500_000.0),
            "Tritanium: Total Profit 2500000 ISK >= 1000000 ISK"
        );
        assert_eq!(
            format_message("Tritanium", AlertMetric::DailyVolume, 1000.0, 4000.0),
            "Tritanium: Daily Volume 4000 >= 1000"
        );
    }

    #[tokio::test]
    async fn threshold_and_cooldown_gate_alerts() {
        let (_dir, db) = open_test_db();
        let db = Arc::new(db);
        watch(&db, 34, AlertMetric::MarginPercent, 10.0);

        let engine = AlertEngine::new(db.clone());
        let mut config = Config::default();
        config.alert_desktop = true;

        // Below threshold: nothing fires.
        let quiet = ScanResults::Flips(vec![flip_row(34, 5.0, 1000.0)]);
        assert!(engine.check(&config, &quiet).is_empty());

        // Above threshold: fires once, then the cooldown holds it.
        let loud = ScanResults::Flips(vec![flip_row(34, 14.0, 1000.0)]);
        let entries = engine.run(&config, &loud, None).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].channels_sent, vec!["desktop"]);

        let again = engine.run(&config, &loud, None).await;
        assert!(again.is_empty());
        assert_eq!(db.alert_history(34, 0).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changed_threshold_resets_cooldown() {
        let (_dir, db) = open_test_db();
        let db = Arc::new(db);
        watch(&db, 34, AlertMetric::MarginPercent, 10.0);

        let engine = AlertEngine::new(db.clone());
        let mut config = Config::default();
        config.alert_desktop = true;

        let loud = ScanResults::Flips(vec![flip_row(34, 20.0, 1000.0)]);
        assert_eq!(engine.run(&config, &loud, None).await.len(), 1);

        // Raise the threshold: the triple changes, eligibility resets.
        db.update_watchlist_alert(34, true, AlertMetric::MarginPercent, 15.0)
            .unwrap();
        assert_eq!(engine.run(&config, &loud, None).await.len(), 1);
        assert_eq!(db.alert_history(34, 0).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn telegram_channel_delivery_and_failure_recording() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/bot[^/]+/sendMessage$"))
            .and(body_string_contains("chat_id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let (_dir, db) = open_test_db();
        let db = Arc::new(db);
        watch(&db, 34, AlertMetric::MarginPercent, 10.0);

        let engine = AlertEngine::new(db.clone()).with_telegram_base(&server.uri());
        let mut config = Config::default();
        config.alert_telegram = true;
        config.alert_telegram_token = "123:abc".into();
        config.alert_telegram_chat_id = "42".into();
        // Discord webhook points nowhere routable: transient failure.
        config.alert_discord = true;
        config.alert_discord_webhook = "http://127.0.0.1:1/webhook".into();

        let loud = ScanResults::Flips(vec![flip_row(34, 14.0, 1000.0)]);
        let entries = engine.run(&config, &loud, Some(7)).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].channels_sent, vec!["telegram"]);
        assert!(entries[0].channels_failed.contains_key("discord"));
        assert_eq!(entries[0].scan_id, Some(7));

        let stored = db.alert_history(34, 0).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].channels_sent, vec!["telegram"]);
        assert!(stored[0].channels_failed.contains_key("discord"));
    }
}
