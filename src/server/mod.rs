//! HTTP surface and scan orchestration.
//!
//! One operation per scan kind, each returning a newline-delimited JSON
//! stream; everything else is conventional REST over the store.

pub mod rest;
pub mod scan;

use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tokio::sync::RwLock;
use tracing::info;

use crate::alerts::AlertEngine;
use crate::config::Config;
use crate::engine::Scanner;
use crate::storage::Database;

pub struct AppState {
    pub db: Arc<Database>,
    pub scanner: Arc<Scanner>,
    pub alerts: AlertEngine,
    pub config: RwLock<Config>,
}

impl AppState {
    pub fn new(db: Arc<Database>, scanner: Arc<Scanner>) -> Self {
        let config = db.load_config();
        Self {
            alerts: AlertEngine::new(db.clone()),
            db,
            scanner,
            config: RwLock::new(config),
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(rest::health))
        .route("/api/scan/:kind", post(scan::run_scan))
        .route("/api/config", get(rest::get_config).put(rest::put_config))
        .route("/api/watchlist", get(rest::list_watchlist).post(rest::add_watchlist))
        .route("/api/watchlist/:type_id", axum::routing::delete(rest::remove_watchlist))
        .route("/api/watchlist/:type_id/alert", put(rest::update_watchlist_alert))
        .route("/api/scans", get(rest::list_scans))
        .route("/api/scans/:id", get(rest::get_scan))
        .route("/api/alerts", get(rest::list_alerts))
        .route("/api/demand", get(rest::list_demand).post(rest::upsert_demand))
        .route("/api/auth/token", post(rest::store_token))
        .route("/api/auth/status", get(rest::auth_status))
        .route("/api/impact", get(rest::impact_estimate))
        .route("/api/portfolio", get(rest::portfolio_report))
        .with_state(state)
}

/// Binds and serves until ctrl-c. A bind failure propagates so `main` can
/// exit nonzero.
pub async fn serve(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::engine::ScanCaches;
    use crate::esi::{EsiClient, EsiConfig};
    use crate::universe::{Catalog, ItemType, SolarSystem, Station, Universe};
    use std::time::Duration;
    use tempfile::TempDir;

    /// In-process server over a temp database and a mock upstream.
    pub struct TestServer {
        pub addr: std::net::SocketAddr,
        pub state: Arc<AppState>,
        _dir: TempDir,
    }

    pub async fn spawn_server(upstream: &str) -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("flipper.db")).unwrap());

        let mut universe = Universe::new();
        universe.insert_system(SolarSystem {
            system_id: 30000142,
            name: "Jita".into(),
            region_id: 10000002,
            security: 0.9,
        });
        universe.set_region_name(10000002, "The Forge");
        let mut catalog = Catalog::new();
        catalog.insert_type(ItemType {
            type_id: 34,
            name: "Tritanium".into(),
            volume: 0.01,
            market_group_id: None,
        });
        catalog.insert_station(Station {
            station_id: 60003760,
            name: "Jita IV - Moon 4 - Caldari Navy Assembly Plant".into(),
            system_id: 30000142,
        });

        let esi = Arc::new(
            EsiClient::new(EsiConfig {
                base_url: upstream.to_string(),
                ..EsiConfig::default()
            })
            .unwrap(),
        );
        let scanner = Arc::new(Scanner::new(
            esi,
            Arc::new(universe),
            Arc::new(catalog),
            Arc::new(ScanCaches::new(Duration::from_secs(60))),
        ));
        let state = Arc::new(AppState::new(db, scanner));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestServer {
            addr,
            state,
            _dir: dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::spawn_server;

    #[tokio::test]
    async fn health_and_config_round_trip() {
        let upstream = wiremock::MockServer::start().await;
        let server = spawn_server(&upstream.uri()).await;
        let base = format!("http://{}", server.addr);
        let client = reqwest::Client::new();

        let health: serde_json::Value = client
            .get(format!("{base}/api/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        let mut config: crate::config::Config = client
            .get(format!("{base}/api/config"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(config.system_name, "Jita");

        config.buy_radius = 9;
        let response = client
            .put(format!("{base}/api/config"))
            .json(&config)
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());

        let back: crate::config::Config = client
            .get(format!("{base}/api/config"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(back.buy_radius, 9);
        // The store saw the update too, not just the in-memory copy.
        assert_eq!(server.state.db.load_config().buy_radius, 9);
    }

    #[tokio::test]
    async fn watchlist_crud_over_http() {
        let upstream = wiremock::MockServer::start().await;
        let server = spawn_server(&upstream.uri()).await;
        let base = format!("http://{}", server.addr);
        let client = reqwest::Client::new();

        let added = client
            .post(format!("{base}/api/watchlist"))
            .json(&serde_json::json!({
                "type_id": 34,
                "type_name": "Tritanium",
                "added_at": "",
                "alert_enabled": true,
                "alert_metric": "total_profit",
                "alert_threshold": 2500000.0
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(added.status(), reqwest::StatusCode::CREATED);

        let list: Vec<serde_json::Value> = client
            .get(format!("{base}/api/watchlist"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["type_id"], 34);

        let removed = client
            .delete(format!("{base}/api/watchlist/34"))
            .send()
            .await
            .unwrap();
        assert!(removed.status().is_success());

        let missing = client
            .delete(format!("{base}/api/watchlist/34"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
