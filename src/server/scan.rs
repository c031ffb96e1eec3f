//! Stream-per-scan endpoint.
//!
//! Each scan runs under a cancellation token tied to the response stream:
//! when the client goes away the stream drops, the token fires, and every
//! outstanding upstream request and engine loop winds down. Results are
//! only persisted on a completed, uncancelled scan.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures_util::stream;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::AppState;
use crate::engine::{ProgressSink, ScanKind, ScanParams, ScanResults};
use crate::error::FlipperError;

/// Progress events beyond this buffer are dropped, never awaited.
const EVENT_BUFFER: usize = 64;

fn event_line(value: serde_json::Value) -> String {
    let mut line = value.to_string();
    line.push('\n');
    line
}

pub async fn run_scan(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Json(params): Json<ScanParams>,
) -> Response {
    let Some(kind) = ScanKind::parse(&kind) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown scan kind {kind}")})),
        )
            .into_response();
    };
    if let Err(e) = params.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        )
            .into_response();
    }

    let (tx, rx) = mpsc::channel::<String>(EVENT_BUFFER);
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let progress_tx = tx.clone();
    let progress: ProgressSink = Arc::new(move |message: String| {
        // Best effort: a slow consumer loses progress lines, not results.
        let _ = progress_tx.try_send(event_line(json!({
            "kind": "progress",
            "message": message,
            "at": Utc::now().to_rfc3339(),
        })));
    });

    let task_state = state.clone();
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        execute(task_state, kind, params, task_cancel, progress, tx).await;
    });

    // The drop guard rides inside the stream state, so client disconnect
    // cancels the scan.
    let body_stream = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        rx.recv()
            .await
            .map(|line| (Ok::<_, Infallible>(line), (rx, guard)))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(body_stream))
        .expect("static response parts")
        .into_response()
}

async fn execute(
    state: Arc<AppState>,
    kind: ScanKind,
    params: ScanParams,
    cancel: CancellationToken,
    progress: ProgressSink,
    tx: mpsc::Sender<String>,
) {
    let started = Instant::now();
    let started_at = Utc::now().to_rfc3339();
    let scanner = state.scanner.clone();

    let outcome = match kind {
        ScanKind::Flips => scanner
            .scan_flips(&params, &cancel, progress)
            .await
            .map(ScanResults::Flips),
        ScanKind::Station => scanner
            .scan_station(&params, &cancel, progress)
            .await
            .map(ScanResults::Station),
        ScanKind::Contracts => scanner
            .scan_contracts(&params, &cancel, progress)
            .await
            .map(ScanResults::Contracts),
        ScanKind::Routes => scanner
            .scan_routes(&params, &cancel, progress)
            .await
            .map(ScanResults::Routes),
    };

    let results = match outcome {
        Ok(results) => results,
        Err(FlipperError::Canceled) => {
            info!(kind = kind.as_str(), "scan canceled, nothing persisted");
            return;
        }
        Err(e) => {
            error!(kind = kind.as_str(), error = %e, "scan failed");
            let _ = tx
                .send(event_line(json!({
                    "kind": "error",
                    "error": e.to_string(),
                })))
                .await;
            return;
        }
    };

    let duration_ms = started.elapsed().as_millis() as i64;
    let _ = tx
        .send(event_line(json!({
            "kind": "partial",
            "results": &results,
        })))
        .await;

    if cancel.is_cancelled() {
        info!(kind = kind.as_str(), "client gone before persistence");
        return;
    }

    let origin_system = state
        .scanner
        .universe
        .system_name(params.origin_system_id);
    let params_json = serde_json::to_string(&params).unwrap_or_else(|_| "{}".into());

    let scan_id = match state
        .db
        .record_scan(&origin_system, &started_at, duration_ms, &params_json, &results)
    {
        Ok(id) => Some(id),
        Err(e) => {
            // The scan still completed; the caller gets results either way.
            warn!(error = %e, "scan history write failed");
            None
        }
    };

    let config = state.config.read().await.clone();
    let alerts = state.alerts.run(&config, &results, scan_id).await;

    let _ = tx
        .send(event_line(json!({
            "kind": "final",
            "scan_id": scan_id,
            "count": results.len(),
            "top_profit": results.top_profit(),
            "total_profit": results.total_profit(),
            "duration_ms": duration_ms,
            "alerts_sent": alerts.len(),
        })))
        .await;
}
