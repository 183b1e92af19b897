use axum::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;
use thiserror::Error;

/// One observation of a region's price as published by a provider.
/// The unit is kept for display only, it is never persisted.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub(crate) struct PriceReading {
    pub(crate) region_id: i32,
    pub(crate) region_name: Option<String>,
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) price: Decimal,
    pub(crate) unit: String,
}

impl PriceReading {
    pub(crate) fn stamped(&self, timestamp: DateTime<Utc>) -> PriceReading {
        PriceReading {
            timestamp,
            ..self.clone()
        }
    }
}

/// A row of the append-only `price` table.
#[derive(Serialize, Debug, Clone, FromRow, PartialEq)]
pub(crate) struct StoredPrice {
    pub(crate) id: i32,
    pub(crate) region: i32,
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) price: Decimal,
}

/// What the change-gated writer did for a single region.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub(crate) struct PriceChange {
    pub(crate) region_id: i32,
    pub(crate) price: Decimal,
    pub(crate) changed: bool,
}

/// Two parallel sequences ready to be handed to a plotting tool.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub(crate) struct PriceSeries {
    pub(crate) timestamps: Vec<String>,
    pub(crate) prices: Vec<Decimal>,
}

impl PriceSeries {
    pub(crate) const TIMESTAMP_FORMAT: &'static str = "%Y-%m-%d %H:%M";

    /// Project stored rows, already ordered by the caller, into a series with
    /// timestamps rendered in the given timezone.
    pub(crate) fn from_rows(rows: &[StoredPrice], timezone: Tz) -> PriceSeries {
        let (timestamps, prices) = rows
            .iter()
            .map(|row| {
                (
                    row.timestamp
                        .with_timezone(&timezone)
                        .format(Self::TIMESTAMP_FORMAT)
                        .to_string(),
                    row.price,
                )
            })
            .unzip();

        PriceSeries { timestamps, prices }
    }

    pub(crate) fn len(&self) -> usize {
        self.prices.len()
    }
}

#[async_trait]
pub(crate) trait ElectricityPriceProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_prices(&self) -> Result<Vec<PriceReading>, ElectricityProviderError>;
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ElectricityProviderError {
    #[error("price endpoint unreachable, status code {0}")]
    EndpointUnreachable(u16),
    #[error("malformed price response: {0}")]
    MalformedResponse(String),
    #[error("failed to fetch prices: {0}")]
    Request(String),
}
