use axum::{
    extract::{Query, State},
    routing::{get, post},
    serve, Json, Router,
};
use axum_macros::debug_handler;

use reqwest::StatusCode;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info, instrument};

use crate::{
    domain::{PriceChange, PriceReading, PriceSeries},
    operations::{fetch_and_persist_prices, price_series, SyncError, DEFAULT_PERIOD_DAYS},
    setup::AppState,
};

/// The main entry point for the http app.
pub(crate) async fn start_http_server(state: AppState) -> Result<(), std::io::Error> {
    let router = Router::new()
        .route("/prices", get(get_prices))
        .route("/prices/sync", post(sync_prices))
        .route("/series", get(get_series))
        .with_state(state);

    let port = std::env::var("PORT").unwrap_or("8080".to_string());
    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("now listening on port {}", port);

    serve(listener, router).await
}

/// Fetch the current prices of every region without storing them.
#[debug_handler(state = AppState)]
#[instrument(skip(state))]
async fn get_prices(
    State(state): State<AppState>,
) -> axum::response::Result<(StatusCode, Json<Vec<PriceReading>>)> {
    let prices = state.electricity_provider.fetch_prices().await.map_err(|e| {
        error!("{}", e);
        (StatusCode::BAD_GATEWAY, e.to_string())
    })?;

    Ok((StatusCode::OK, Json(prices)))
}

/// Fetch the current prices and store the ones that changed.
#[debug_handler(state = AppState)]
#[instrument(skip(state))]
async fn sync_prices(
    State(state): State<AppState>,
) -> axum::response::Result<(StatusCode, Json<Vec<PriceChange>>)> {
    let changes = fetch_and_persist_prices(
        &*state.electricity_provider,
        &*state.price_repository,
        None,
    )
    .await
    .map_err(|e| {
        let status = match e {
            SyncError::Provider(_) => StatusCode::BAD_GATEWAY,
            SyncError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, e.to_string())
    })?;

    Ok((StatusCode::OK, Json(changes)))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SeriesParameters {
    period_days: Option<i64>,
}

#[debug_handler(state = AppState)]
#[instrument(skip(state))]
async fn get_series(
    State(state): State<AppState>,
    parameters: Query<SeriesParameters>,
) -> axum::response::Result<(StatusCode, Json<PriceSeries>)> {
    let period_days = parameters.period_days.unwrap_or(DEFAULT_PERIOD_DAYS);

    if period_days < 0 {
        return Err((StatusCode::BAD_REQUEST, "period_days cannot be negative").into());
    }

    let series = price_series(&*state.price_repository, period_days)
        .await
        .map_err(|e| {
            error!("{}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    Ok((StatusCode::OK, Json(series)))
}
