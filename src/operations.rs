use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tracing::{error, info};

use crate::domain::{
    ElectricityPriceProvider, ElectricityProviderError, PriceChange, PriceReading, PriceSeries,
};
use crate::price_repository::{PriceRepository, PriceRepositoryError};

/// Region plotted by the series query.
pub(crate) const SERIES_REGION: i32 = 1;
pub(crate) const DEFAULT_PERIOD_DAYS: i64 = 28;
pub(crate) const SERIES_TIMEZONE: Tz = chrono_tz::Europe::Oslo;

#[derive(Debug, Error)]
pub(crate) enum SyncError {
    #[error(transparent)]
    Provider(#[from] ElectricityProviderError),
    #[error(transparent)]
    Repository(#[from] PriceRepositoryError),
}

/// Persist the changed prices among `readings`, fetching them from the
/// provider first when none are given.
pub(crate) async fn fetch_and_persist_prices(
    electricity_provider: &dyn ElectricityPriceProvider,
    price_repository: &dyn PriceRepository,
    readings: Option<Vec<PriceReading>>,
) -> Result<Vec<PriceChange>, SyncError> {
    let readings = match readings {
        Some(readings) => readings,
        None => electricity_provider.fetch_prices().await.map_err(|e| {
            error!("{}", e);
            e
        })?,
    };

    info!(
        "Checking {} prices from {} for changes",
        readings.len(),
        electricity_provider.name()
    );

    let changes = price_repository
        .persist_changed_prices(&readings)
        .await
        .map_err(|e| {
            error!("{}", e);
            e
        })?;

    Ok(changes)
}

/// Start of a window reaching `period_days` back from now. Windows past the
/// representable range, or before the epoch, start at the epoch.
pub(crate) fn window_start(period_days: i64) -> DateTime<Utc> {
    Duration::try_days(period_days)
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .map_or(DateTime::<Utc>::UNIX_EPOCH, |start| start.max(DateTime::<Utc>::UNIX_EPOCH))
}

/// Prices of [`SERIES_REGION`] over the last `period_days`, newest first.
pub(crate) async fn price_series(
    price_repository: &dyn PriceRepository,
    period_days: i64,
) -> Result<PriceSeries, PriceRepositoryError> {
    let since = window_start(period_days);

    let rows = price_repository
        .fetch_prices_of_region_since(SERIES_REGION, since)
        .await?;

    let series = PriceSeries::from_rows(&rows, SERIES_TIMEZONE);

    info!(
        "Series of region {} over {} days holds {} prices",
        SERIES_REGION,
        period_days,
        series.len()
    );

    Ok(series)
}
