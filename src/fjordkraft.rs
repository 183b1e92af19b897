use std::str::FromStr;

use axum::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde_derive::Deserialize;
use tracing::instrument;

use crate::domain::{ElectricityPriceProvider, ElectricityProviderError, PriceReading};

pub(crate) const API_URL: &str = "https://www.fjordkraft.no/Templates/Fjordkraft/webservices/PriceMap.asmx/GetDailyPricesJson?regionPriceMapPageId=1";

#[derive(Clone, Debug)]
pub(crate) struct Fjordkraft {
    client: Client,
    url: String,
}

impl Fjordkraft {
    pub(crate) fn new() -> Self {
        Self {
            client: Client::new(),
            url: API_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_url(url: impl Into<String>) -> Self {
        Self {
            client: Client::builder().no_proxy().build().unwrap(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl ElectricityPriceProvider for Fjordkraft {
    fn name(&self) -> &'static str {
        "fjordkraft"
    }

    #[instrument(skip(self))]
    async fn fetch_prices(&self) -> Result<Vec<PriceReading>, ElectricityProviderError> {
        info!("Fetching prices from fjordkraft");

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ElectricityProviderError::Request(e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(ElectricityProviderError::EndpointUnreachable(
                response.status().as_u16(),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ElectricityProviderError::Request(e.to_string()))?;

        let prices = parse_prices_body(&body, Utc::now())?;

        info!("Fetched {} prices from fjordkraft", prices.len());

        Ok(prices)
    }
}

/// The endpoint answers with a one-line xml envelope around the json document,
/// the payload sits between the second `>` and the next `<`.
fn extract_payload(body: &str) -> Result<&str, ElectricityProviderError> {
    body.split('>')
        .nth(2)
        .and_then(|rest| rest.split('<').next())
        .ok_or_else(|| {
            ElectricityProviderError::MalformedResponse(
                "response is not wrapped in the expected envelope".to_string(),
            )
        })
}

fn parse_prices_body(
    body: &str,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<PriceReading>, ElectricityProviderError> {
    let payload = extract_payload(body)?;

    let response = serde_json::from_str::<Response>(payload)
        .map_err(|e| ElectricityProviderError::MalformedResponse(e.to_string()))?;

    response
        .areas
        .into_iter()
        .map(|area| area.into_reading(fetched_at))
        .collect()
}

/// Split a price like `"45,12 øre/kWh"` into its amount and unit.
fn parse_price(raw: &str) -> Result<(Decimal, String), ElectricityProviderError> {
    let mut parts = raw.split(' ');

    let amount = parts.next().unwrap_or_default().replace(',', ".");
    let unit = parts.next().ok_or_else(|| {
        ElectricityProviderError::MalformedResponse(format!("price \"{}\" has no unit", raw))
    })?;

    let amount = Decimal::from_str(&amount).map_err(|e| {
        ElectricityProviderError::MalformedResponse(format!("price \"{}\": {}", raw, e))
    })?;

    Ok((amount, unit.to_string()))
}

#[derive(Deserialize, Debug)]
struct Response {
    #[serde(rename = "Areas")]
    areas: Vec<Area>,
}

#[derive(Deserialize, Debug)]
struct Area {
    id: i32,
    #[serde(default)]
    name: Option<String>,
    price: String,
}

impl Area {
    fn into_reading(
        self,
        fetched_at: DateTime<Utc>,
    ) -> Result<PriceReading, ElectricityProviderError> {
        let (price, unit) = parse_price(&self.price)?;

        Ok(PriceReading {
            region_id: self.id,
            region_name: self.name,
            timestamp: fetched_at,
            price,
            unit,
        })
    }
}
