//! Market order, history, and wallet endpoints.

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{Deadline, EsiClient};
use crate::error::{FlipperError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    All,
    Buy,
    Sell,
}

impl OrderSide {
    fn as_query(self) -> &'static str {
        match self {
            OrderSide::All => "all",
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// One resting order in a regional book.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketOrder {
    pub order_id: i64,
    pub type_id: i32,
    pub location_id: i64,
    pub system_id: i32,
    #[serde(rename = "is_buy_order", default)]
    pub is_buy: bool,
    pub price: f64,
    #[serde(rename = "volume_remain")]
    pub volume_remaining: i64,
    pub volume_total: i64,
    #[serde(default = "one")]
    pub min_volume: i64,
    /// Buy-order reach: `station`, `solarsystem`, `region`, or a jump count.
    #[serde(default)]
    pub range: String,
    #[serde(rename = "issued", default)]
    pub issued_at: String,
}

fn one() -> i64 {
    1
}

/// Daily aggregate for a (region, type) pair.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HistoryBucket {
    pub date: String,
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
    pub volume: i64,
    pub order_count: i64,
}

/// One wallet transaction from the authenticated character.
#[derive(Debug, Clone, Deserialize)]
pub struct WalletTransaction {
    pub transaction_id: i64,
    pub date: String,
    pub type_id: i32,
    pub location_id: i64,
    pub quantity: i64,
    pub unit_price: f64,
    #[serde(rename = "is_buy")]
    pub is_buy: bool,
    /// Resolved from the catalog after fetch; not on the wire.
    #[serde(default)]
    pub type_name: String,
    #[serde(default)]
    pub location_name: String,
}

impl EsiClient {
    /// All orders for a region, optionally restricted to one side of the book.
    pub async fn fetch_region_orders(
        &self,
        region_id: i32,
        side: OrderSide,
        cancel: &CancellationToken,
        deadline: Deadline,
    ) -> Result<Vec<MarketOrder>> {
        let path = format!(
            "/markets/{region_id}/orders/?order_type={}",
            side.as_query()
        );
        self.get_paginated(&path, false, cancel, deadline).await
    }

    /// Daily history for a type in a region. A type with no market history
    /// comes back as an empty list rather than an error.
    pub async fn fetch_market_history(
        &self,
        region_id: i32,
        type_id: i32,
        cancel: &CancellationToken,
        deadline: Deadline,
    ) -> Result<Vec<HistoryBucket>> {
        let path = format!("/markets/{region_id}/history/?type_id={type_id}");
        match self
            .get_json::<Vec<HistoryBucket>>(&path, false, cancel, deadline)
            .await
        {
            Ok(entries) => Ok(entries),
            Err(FlipperError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Wallet transactions for the signed-in character. Requires a session.
    pub async fn fetch_wallet_transactions(
        &self,
        character_id: i64,
        cancel: &CancellationToken,
        deadline: Deadline,
    ) -> Result<Vec<WalletTransaction>> {
        let path = format!("/characters/{character_id}/wallet/transactions/");
        self.get_json(&path, true, cancel, deadline).await
    }
}
