//! Runtime configuration.
//!
//! The config lives as a JSON singleton row in the database and is loaded
//! with defaults for any missing field, so additive changes never break an
//! existing install.

use serde::{Deserialize, Serialize};

fn default_system_name() -> String {
    "Jita".to_string()
}
fn default_cargo() -> f64 {
    5_000.0
}
fn default_buy_radius() -> u32 {
    5
}
fn default_sell_radius() -> u32 {
    5
}
fn default_min_margin() -> f64 {
    10.0
}
fn default_min_profit() -> f64 {
    1_000_000.0
}
fn default_sales_tax() -> f64 {
    3.6
}
fn default_broker_fee() -> f64 {
    1.0
}
fn default_max_results() -> usize {
    50
}
fn default_cooldown() -> u64 {
    3600
}
fn default_history_ttl() -> u64 {
    1800
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Home system used as the default scan origin.
    #[serde(default = "default_system_name")]
    pub system_name: String,
    #[serde(default = "default_cargo")]
    pub cargo_capacity_m3: f64,
    #[serde(default = "default_buy_radius")]
    pub buy_radius: u32,
    #[serde(default = "default_sell_radius")]
    pub sell_radius: u32,
    #[serde(default = "default_min_margin")]
    pub min_margin_percent: f64,
    #[serde(default = "default_min_profit")]
    pub min_profit: f64,
    #[serde(default)]
    pub min_daily_volume: f64,
    #[serde(default = "default_sales_tax")]
    pub sales_tax_percent: f64,
    #[serde(default = "default_broker_fee")]
    pub broker_fee_percent: f64,
    #[serde(default)]
    pub min_route_security: f64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    // Alert channels.
    #[serde(default)]
    pub alert_desktop: bool,
    #[serde(default)]
    pub alert_telegram: bool,
    #[serde(default)]
    pub alert_telegram_token: String,
    #[serde(default)]
    pub alert_telegram_chat_id: String,
    #[serde(default)]
    pub alert_discord: bool,
    #[serde(default)]
    pub alert_discord_webhook: String,
    #[serde(default = "default_cooldown")]
    pub alert_cooldown_secs: u64,

    /// How long fetched history buckets stay fresh, in seconds.
    #[serde(default = "default_history_ttl")]
    pub history_cache_ttl_secs: u64,

    /// OAuth session, if the user has authenticated.
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub token_expires_at: String,
    #[serde(default)]
    pub character_name: String,
    #[serde(default)]
    pub character_id: i64,
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}
