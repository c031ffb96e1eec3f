//! Public contract and structure endpoints.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{Deadline, EsiClient};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractKind {
    ItemExchange,
    Auction,
    Courier,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublicContract {
    pub contract_id: i32,
    #[serde(rename = "type")]
    pub kind: ContractKind,
    #[serde(default)]
    pub price: f64,
    pub start_location_id: i64,
    /// Total packaged volume in m3.
    #[serde(default)]
    pub volume: f64,
    pub date_expired: String,
    #[serde(default)]
    pub title: String,
}

impl PublicContract {
    pub fn is_expired(&self) -> bool {
        match DateTime::parse_from_rfc3339(&self.date_expired) {
            Ok(t) => t <= Utc::now(),
            // Unparseable expiry is treated as expired; we never value a
            // contract we cannot prove is still open.
            Err(_) => true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractItem {
    pub type_id: i32,
    pub quantity: i64,
    /// Included items go to the buyer; excluded ones are asked from them.
    #[serde(default)]
    pub is_included: bool,
    #[serde(default)]
    pub is_blueprint_copy: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructureInfo {
    pub name: String,
    pub solar_system_id: i32,
}

impl EsiClient {
    /// The public-contract index for one region.
    pub async fn fetch_region_contracts(
        &self,
        region_id: i32,
        cancel: &CancellationToken,
        deadline: Deadline,
    ) -> Result<Vec<PublicContract>> {
        let path = format!("/contracts/public/{region_id}/");
        self.get_paginated(&path, false, cancel, deadline).await
    }

    /// Items inside one public contract.
    pub async fn fetch_contract_items(
        &self,
        contract_id: i32,
        cancel: &CancellationToken,
        deadline: Deadline,
    ) -> Result<Vec<ContractItem>> {
        let path = format!("/contracts/public/items/{contract_id}/");
        self.get_paginated(&path, false, cancel, deadline).await
    }

    /// Name and system of a player structure. Requires docking access, hence
    /// an authenticated session.
    pub async fn fetch_structure_info(
        &self,
        structure_id: i64,
        cancel: &CancellationToken,
        deadline: Deadline,
    ) -> Result<StructureInfo> {
        let path = format!("/universe/structures/{structure_id}/");
        self.get_json(&path, true, cancel, deadline).await
    }
}
