//! Frankfurter (ECB reference rates) HTTP client.

use super::{checked_rate, CurrencyRateProvider, DataSourceError};
use crate::domain::currency;
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_FX_API_URL: &str = "https://api.frankfurter.dev/v1";

#[derive(Debug, Deserialize)]
struct RatesResponse {
    rates: HashMap<String, f64>,
}

/// Live FX rates from a Frankfurter-compatible API.
#[derive(Debug, Clone)]
pub struct FrankfurterRateProvider {
    client: Client,
    base_url: String,
}

impl FrankfurterRateProvider {
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, base_url }
    }

    pub fn default_url() -> Self {
        Self::new(DEFAULT_FX_API_URL.to_string())
    }

    pub fn latest_url(&self, from: &str, to: &str) -> String {
        format!("{}/latest?base={}&symbols={}", self.base_url, from, to)
    }

    async fn get_rates(&self, url: &str) -> Result<RatesResponse, DataSourceError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(20)),
            ..Default::default()
        };

        retry(backoff, || async {
            let response = self.client.get(url).send().await.map_err(|e| {
                backoff::Error::transient(DataSourceError::NetworkError(e.to_string()))
            })?;

            let status = response.status();
            if status == 429 {
                return Err(backoff::Error::transient(DataSourceError::RateLimited));
            }
            if status.is_server_error() {
                return Err(backoff::Error::transient(DataSourceError::HttpError {
                    status: status.as_u16(),
                    message: "Server error".to_string(),
                }));
            }
            if status == 404 || status == 422 {
                return Err(backoff::Error::permanent(DataSourceError::UnsupportedCurrency(
                    url.to_string(),
                )));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(DataSourceError::HttpError {
                    status: status.as_u16(),
                    message: "Client error".to_string(),
                }));
            }

            response
                .json::<RatesResponse>()
                .await
                .map_err(|e| backoff::Error::permanent(DataSourceError::ParseError(e.to_string())))
        })
        .await
    }
}

#[async_trait]
impl CurrencyRateProvider for FrankfurterRateProvider {
    async fn rate(&self, from: &str, to: &str) -> Result<f64, DataSourceError> {
        let from = currency::normalize(from);
        let to = currency::normalize(to);
        if from == to {
            return Ok(1.0);
        }
        if currency::is_pence(&from) || currency::is_pence(&to) {
            // Pence are not an ECB currency; callers resolve them through GBP.
            return Err(DataSourceError::UnsupportedCurrency(format!("{}/{}", from, to)));
        }

        debug!(from = %from, to = %to, "Fetching FX rate");
        let response = self.get_rates(&self.latest_url(&from, &to)).await?;
        let rate = response
            .rates
            .get(&to)
            .copied()
            .ok_or_else(|| DataSourceError::UnsupportedCurrency(format!("{}/{}", from, to)))?;
        checked_rate(rate, &from, &to)
    }
}
