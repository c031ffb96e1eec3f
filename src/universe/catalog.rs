//! Static item and station catalog.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{FlipperError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct ItemType {
    pub type_id: i32,
    pub name: String,
    /// Packaged volume per unit, in m3.
    pub volume: f64,
    #[serde(default)]
    pub market_group_id: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Station {
    pub station_id: i64,
    pub name: String,
    pub system_id: i32,
}

/// Immutable catalog loaded once at startup.
#[derive(Debug, Default)]
pub struct Catalog {
    types: HashMap<i32, ItemType>,
    stations: HashMap<i64, Station>,
}

#[derive(Deserialize)]
struct CatalogFile {
    types: Vec<ItemType>,
    stations: Vec<Station>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FlipperError::Fatal(format!("read {}: {e}", path.display())))?;
        let file: CatalogFile = serde_json::from_str(&raw)?;
        let mut catalog = Self::new();
        for t in file.types {
            catalog.insert_type(t);
        }
        for s in file.stations {
            catalog.insert_station(s);
        }
        Ok(catalog)
    }

    pub fn insert_type(&mut self, item: ItemType) {
        self.types.insert(item.type_id, item);
    }

    pub fn insert_station(&mut self, station: Station) {
        self.stations.insert(station.station_id, station);
    }

    pub fn item(&self, type_id: i32) -> Option<&ItemType> {
        self.types.get(&type_id)
    }

    pub fn item_name(&self, type_id: i32) -> String {
        self.types
            .get(&type_id)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| format!("Type {type_id}"))
    }

    /// Unit volume, defaulting to 1 m3 for unknown types so cargo math
    /// stays finite.
    pub fn item_volume(&self, type_id: i32) -> f64 {
        self.types.get(&type_id).map(|t| t.volume).unwrap_or(1.0)
    }

    pub fn station(&self, station_id: i64) -> Option<&Station> {
        self.stations.get(&station_id)
    }

    pub fn station_name(&self, station_id: i64) -> String {
        self.stations
            .get(&station_id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("Location {station_id}"))
    }

    /// Catalog-known station to solar system resolution. Player structures
    /// are not in the catalog and resolve through market data instead.
    pub fn station_system(&self, station_id: i64) -> Option<i32> {
        self.stations.get(&station_id).map(|s| s.system_id)
    }

    /// Blueprints have no dependable market price and are excluded from
    /// valuation everywhere.
    pub fn is_blueprint(&self, type_id: i32) -> bool {
        self.types
            .get(&type_id)
            .map(|t| t.name.to_lowercase().contains("blueprint"))
            .unwrap_or(false)
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }
}
