mod config;
mod driver;
mod extract;
mod ledger;
mod metrics;
mod models;
mod navigation;
mod parse;
mod retry;
mod scheduler;
mod store;
mod sync;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use config::{HostConfig, PortalsConfig};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, RunOptions, SyncLog, SyncStatus};
use scheduler::{SchedulerContext, SchedulerError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use store::SqliteStore;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "stocksync.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let host = HostConfig::from_env();
    let portals = PortalsConfig::load()?;
    // A bad cron expression or timezone must stop the boot here.
    scheduler::parse_schedule(&host.cron_expression, &host.timezone)?;

    let store = Arc::new(SqliteStore::open(&host.database_path)?);
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");

    let port = host.port;
    let scheduler_enabled = host.scheduler_enabled;
    let context = Arc::new(SchedulerContext::new(host, portals, store));
    if scheduler_enabled {
        let _scheduler = context.clone().spawn();
    } else {
        info!(target = "stocksync.api", "scheduler disabled, manual runs only");
    }

    let state = AppState {
        context,
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .nest(
            "/sync",
            Router::new()
                .route("/run-now", post(run_now))
                .route("/stop", post(stop_scheduler))
                .route("/history", get(sync_history))
                .route("/current", get(sync_current))
                .route("/history/{id}/cancel", post(cancel_sync)),
        )
        .route("/inventory/{sku}", get(inventory_item))
        .route("/movements/{reference}", get(movements))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "stocksync.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    context: Arc<SchedulerContext>,
    prometheus_handle: PrometheusHandle,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "stocksync-rs",
    }))
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

#[derive(Debug, Default, Deserialize)]
struct RunNowRequest {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    process_stock: Option<bool>,
}

#[derive(Debug, Serialize)]
struct RunNowResponse {
    runs: Vec<SyncLog>,
}

/// Trigger a sync of both portals immediately.
///
/// - Method: `POST`
/// - Path: `/sync/run-now`
/// - Body: `{ "limit": 50, "process_stock": true }` (both optional)
///
/// Returns 409 while another run is in flight.
async fn run_now(
    State(state): State<AppState>,
    payload: Option<Json<RunNowRequest>>,
) -> Result<Json<RunNowResponse>, AppError> {
    crate::metrics::inc_requests("/sync/run-now");
    let request = payload.map(|Json(body)| body).unwrap_or_default();
    let options = RunOptions {
        limit: request.limit,
        process_stock: request.process_stock.unwrap_or(true),
    };
    let started = std::time::Instant::now();
    let runs = state.context.run_now(options).await?;
    crate::metrics::sync_elapsed("all", started.elapsed().as_millis());
    Ok(Json(RunNowResponse { runs }))
}

/// Disable future scheduled fires. In-flight runs finish on their own.
async fn stop_scheduler(State(state): State<AppState>) -> Json<serde_json::Value> {
    crate::metrics::inc_requests("/sync/stop");
    state.context.stop();
    Json(json!({ "scheduler": "stopped" }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    20
}

async fn sync_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<SyncLog>>, AppError> {
    crate::metrics::inc_requests("/sync/history");
    let logs = state.context.store().sync_history(query.limit.min(200))?;
    Ok(Json(logs))
}

#[derive(Debug, Serialize)]
struct CurrentRunResponse {
    run: Option<SyncLog>,
    elapsed_secs: Option<i64>,
}

/// The RUNNING sync log entry, if any, with its elapsed time.
async fn sync_current(State(state): State<AppState>) -> Result<Json<CurrentRunResponse>, AppError> {
    crate::metrics::inc_requests("/sync/current");
    let run = state.context.store().running_sync()?;
    let elapsed_secs = run
        .as_ref()
        .map(|log| (Utc::now() - log.started_at).num_seconds());
    Ok(Json(CurrentRunResponse { run, elapsed_secs }))
}

/// Marks a stale RUNNING entry FAILED so the history reads true after a
/// crashed run. Does not interrupt a live run.
async fn cancel_sync(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SyncLog>, AppError> {
    crate::metrics::inc_requests("/sync/history/cancel");
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::BadRequest("invalid run id".to_string()));
    };
    let existing = state
        .context
        .store()
        .sync_history(200)?
        .into_iter()
        .find(|log| log.id == uuid);
    match existing {
        Some(log) if log.status == SyncStatus::Running => {
            let cancelled = state.context.store().cancel_sync_log(uuid)?;
            Ok(Json(cancelled))
        }
        Some(_) => Err(AppError::BadRequest("run already finished".to_string())),
        None => Err(AppError::NotFound),
    }
}

/// Current on-hand quantity and restock metadata for one sku.
async fn inventory_item(
    State(state): State<AppState>,
    Path(sku): Path<String>,
) -> Result<Json<models::InventoryItem>, AppError> {
    crate::metrics::inc_requests("/inventory");
    match state.context.store().get_inventory(&sku)? {
        Some(item) => Ok(Json(item)),
        None => Err(AppError::NotFound),
    }
}

/// Ledger entries produced by one order or invoice.
async fn movements(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Json<Vec<models::StockMovement>>, AppError> {
    crate::metrics::inc_requests("/movements");
    Ok(Json(state.context.store().movements_for(&reference)?))
}

#[derive(Debug)]
enum AppError {
    Scheduler(SchedulerError),
    Store(store::StoreError),
    BadRequest(String),
    NotFound,
}

impl From<SchedulerError> for AppError {
    fn from(value: SchedulerError) -> Self {
        Self::Scheduler(value)
    }
}

impl From<store::StoreError> for AppError {
    fn from(value: store::StoreError) -> Self {
        Self::Store(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::Scheduler(SchedulerError::AlreadyRunning) => (
                StatusCode::CONFLICT,
                ApiError {
                    error: "sync_in_progress".to_string(),
                    detail: Some("a sync run is already in progress".to_string()),
                },
            ),
            AppError::Scheduler(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError {
                    error: "sync_failed".to_string(),
                    detail: Some(err.to_string()),
                },
            ),
            AppError::Store(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError {
                    error: "store".to_string(),
                    detail: Some(err.to_string()),
                },
            ),
            AppError::BadRequest(detail) => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: "bad_request".to_string(),
                    detail: Some(detail),
                },
            ),
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: "not_found".to_string(),
                    detail: None,
                },
            ),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
