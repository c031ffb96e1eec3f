//! Scanner entry point.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use flipper::config::Config;
use flipper::engine::{ScanCaches, Scanner};
use flipper::esi::auth::Token;
use flipper::esi::{EsiClient, EsiConfig};
use flipper::server::{serve, AppState};
use flipper::storage::Database;
use flipper::universe::{Catalog, Universe};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DB_FILE: &str = "flipper.db";
const LOG_FILE: &str = "flipper.log";
const CACHE_DIR: &str = "cache";

#[derive(Parser)]
#[command(name = "flipper")]
#[command(about = "Market arbitrage scanner for the EVE Online economy")]
struct Cli {
    /// Port for the HTTP API
    #[arg(long, default_value_t = 13370)]
    port: u16,
}

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOG_FILE)
        .ok();

    match file {
        Some(file) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}

/// Static data is optional at startup: an empty universe still serves the
/// REST surface, scans just return nothing useful.
fn load_static_data() -> (Universe, Catalog) {
    let cache = Path::new(CACHE_DIR);
    let universe = match Universe::load(&cache.join("universe.json")) {
        Ok(u) => {
            info!(systems = u.len(), "universe graph loaded");
            u
        }
        Err(e) => {
            warn!(error = %e, "universe graph unavailable, starting empty");
            Universe::new()
        }
    };
    let catalog = match Catalog::load(&cache.join("catalog.json")) {
        Ok(c) => {
            info!(types = c.type_count(), "type catalog loaded");
            c
        }
        Err(e) => {
            warn!(error = %e, "type catalog unavailable, starting empty");
            Catalog::new()
        }
    };
    (universe, catalog)
}

async fn restore_session(esi: &EsiClient, config: &Config) {
    if config.refresh_token.is_empty() {
        return;
    }
    let expires_at = DateTime::parse_from_rfc3339(&config.token_expires_at)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    esi.session
        .install(Token {
            access_token: config.access_token.clone(),
            refresh_token: config.refresh_token.clone(),
            expires_at,
            character_name: config.character_name.clone(),
            character_id: config.character_id,
        })
        .await;
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    let db = match Database::open(Path::new(DB_FILE)) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            eprintln!("database unavailable: {e}");
            std::process::exit(1);
        }
    };
    let config = db.load_config();

    let (universe, catalog) = load_static_data();

    let esi = match EsiClient::new(EsiConfig::default()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("http client: {e}");
            std::process::exit(1);
        }
    };
    restore_session(&esi, &config).await;

    let caches = Arc::new(ScanCaches::new(Duration::from_secs(
        config.history_cache_ttl_secs.max(60),
    )));
    let scanner = Arc::new(Scanner::new(
        esi,
        Arc::new(universe),
        Arc::new(catalog),
        caches,
    ));

    let state = Arc::new(AppState::new(db, scanner));
    if let Err(e) = serve(state, cli.port).await {
        eprintln!("server: {e}");
        std::process::exit(1);
    }
}
