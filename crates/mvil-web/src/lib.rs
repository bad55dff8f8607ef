//! Axum read API over role baselines and canonical postings, plus admin entry points.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use mvil_core::RawPosting;
use mvil_storage::StoreError;
use mvil_sync::{AggregationError, InsightsService, RefreshMode};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mvil-web";

pub const NOT_YET_AVAILABLE_MESSAGE: &str = "insights not yet available — run aggregation";

#[derive(Clone)]
pub struct AppState {
    pub service: InsightsService,
    /// Parent of every admin-triggered refresh; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(service: InsightsService) -> Self {
        Self {
            service,
            shutdown: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RefreshQuery {
    force: Option<bool>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/role-families", get(role_families_handler))
        .route("/baselines/{role_family}", get(baselines_handler))
        .route("/postings/{id}", get(posting_handler))
        .route("/admin/ingest", post(ingest_handler))
        .route("/admin/refresh", post(refresh_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving insights api");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.corpus.canonical_count().await {
        Ok(count) => Json(json!({
            "status": "ok",
            "canonical_postings": count,
            "refresh_running": state.service.refresh.is_running(),
        }))
        .into_response(),
        Err(err) => store_error(err),
    }
}

async fn role_families_handler(State(state): State<Arc<AppState>>) -> Response {
    let baselines = &state.service.baselines;
    match baselines.has_any_baselines().await {
        Ok(false) => not_yet_available(),
        Ok(true) => match baselines.role_families().await {
            Ok(families) => Json(json!({ "status": "ok", "role_families": families })).into_response(),
            Err(err) => store_error(err),
        },
        Err(err) => store_error(err),
    }
}

/// Never falls back to a live query: an empty store is reported as such.
async fn baselines_handler(
    State(state): State<Arc<AppState>>,
    Path(role_family): Path<String>,
) -> Response {
    let baselines = &state.service.baselines;
    match baselines.has_any_baselines().await {
        Ok(false) => return not_yet_available(),
        Ok(true) => {}
        Err(err) => return store_error(err),
    }
    match baselines.baselines_for_family(&role_family).await {
        Ok(Some(family)) => Json(json!({ "status": "ok", "baselines": family })).into_response(),
        Ok(None) => not_found(format!("no baselines for role family {role_family}")),
        Err(err) => store_error(err),
    }
}

/// The posting's canonical representative plus the mapping that led there.
async fn posting_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    let corpus = &state.service.corpus;
    let record = match corpus.get_dedupe_record(id).await {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(format!("posting {id} not found")),
        Err(err) => return store_error(err),
    };
    match corpus.get_posting(record.canonical_posting_id).await {
        Ok(Some(canonical)) => Json(json!({ "posting": canonical, "dedupe": record })).into_response(),
        Ok(None) => not_found(format!("canonical posting {} not found", record.canonical_posting_id)),
        Err(err) => store_error(err),
    }
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Json(raws): Json<Vec<RawPosting>>,
) -> Response {
    let (summary, _) = state.service.ingest_batch(raws, false).await;
    Json(summary).into_response()
}

async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RefreshQuery>,
) -> Response {
    let mode = if query.force.unwrap_or(false) {
        RefreshMode::Forced
    } else {
        RefreshMode::Opportunistic
    };
    let cancel = state.shutdown.child_token();
    match state.service.refresh.refresh(mode, &cancel).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(AggregationError::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(json!({ "status": "busy", "message": "a refresh is already running" })),
        )
            .into_response(),
        Err(AggregationError::Store(err)) => store_error(err),
        Err(err) => {
            warn!(error = %err, "admin refresh failed");
            server_error(anyhow::Error::new(err))
        }
    }
}

fn not_yet_available() -> Response {
    Json(json!({
        "status": "not_yet_available",
        "message": NOT_YET_AVAILABLE_MESSAGE,
    }))
    .into_response()
}

fn not_found(message: String) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "status": "not_found", "message": message })),
    )
        .into_response()
}

fn store_error(err: StoreError) -> Response {
    if matches!(err, StoreError::Unavailable(_)) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "message": err.to_string() })),
        )
            .into_response();
    }
    server_error(err.into())
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "error", "message": format!("Server error: {err}") })),
    )
        .into_response()
}
