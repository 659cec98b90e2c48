use crate::config::{ParallelMode, SimulationConfig};
use crate::data::{self, PriceTable};
use crate::error::EngineError;
use crate::portfolio::{self, SimulationReport};
use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Clone)]
struct WebState {
    defaults: SimulationConfig,
    last: Arc<Mutex<Option<SimulationReport>>>,
}

#[derive(Clone, Debug, Serialize)]
struct ApiError {
    error: String,
}

/// Either `symbols` with a date range, or an inline `prices` table.
#[derive(Debug, Deserialize)]
struct OptimizeRequest {
    #[serde(default)]
    symbols: Vec<String>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    prices: Option<PriceTable>,
    trials: Option<usize>,
    trading_days: Option<u32>,
    seed: Option<u64>,
    parallel: Option<ParallelMode>,
}

impl OptimizeRequest {
    fn config(&self, defaults: &SimulationConfig) -> SimulationConfig {
        SimulationConfig {
            trials: self.trials.unwrap_or(defaults.trials),
            trading_days_per_year: self.trading_days.unwrap_or(defaults.trading_days_per_year),
            seed: self.seed.or(defaults.seed),
            parallel: self.parallel.unwrap_or(defaults.parallel),
        }
    }
}

fn app(defaults: SimulationConfig) -> Router {
    let state = WebState {
        defaults,
        last: Arc::new(Mutex::new(None)),
    };

    Router::new()
        .route("/api/health", get(health))
        .route("/api/optimize", post(optimize))
        .route("/api/last", get(last_report))
        .with_state(state)
}

pub async fn run_webui_server(port: u16, defaults: SimulationConfig) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!("WebUI listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app(defaults)).await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn optimize(
    State(state): State<WebState>,
    Json(req): Json<OptimizeRequest>,
) -> Result<Json<SimulationReport>, (StatusCode, Json<ApiError>)> {
    let config = req.config(&state.defaults);
    config.validate().map_err(engine_err)?;

    let prices = match req.prices {
        Some(prices) => prices,
        None => {
            let symbols = data::parse_symbols(&req.symbols.join(" ")).map_err(engine_err)?;
            if symbols.is_empty() {
                return Err(api_err(
                    StatusCode::BAD_REQUEST,
                    "either symbols or prices is required",
                ));
            }
            let (Some(start), Some(end)) = (req.start, req.end) else {
                return Err(api_err(
                    StatusCode::BAD_REQUEST,
                    "start and end dates are required with symbols",
                ));
            };
            data::fetch_price_table(&symbols, start, end)
                .await
                .map_err(|e| api_err(StatusCode::BAD_GATEWAY, &e.to_string()))?
        }
    };

    let report = tokio::task::spawn_blocking(move || portfolio::run_with_config(&prices, &config))
        .await
        .map_err(internal_err)?
        .map_err(engine_err)?;

    *state.last.lock().await = Some(report.clone());
    Ok(Json(report))
}

async fn last_report(
    State(state): State<WebState>,
) -> Result<Json<SimulationReport>, (StatusCode, Json<ApiError>)> {
    let last = state.last.lock().await.clone();
    last.map(Json)
        .ok_or_else(|| api_err(StatusCode::NOT_FOUND, "no optimization has run yet"))
}

fn api_err(status: StatusCode, message: &str) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            error: message.to_string(),
        }),
    )
}

fn internal_err<E: std::fmt::Display>(err: E) -> (StatusCode, Json<ApiError>) {
    api_err(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
}

fn engine_err(err: EngineError) -> (StatusCode, Json<ApiError>) {
    if err.is_caller_error() {
        warn!("Rejected optimization request: {}", err);
        api_err(StatusCode::BAD_REQUEST, &err.to_string())
    } else {
        internal_err(err)
    }
}
