// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

//! Live fiat/crypto exchange rate.
//!
//! The oracle is queried at amount entry and again for invoice display; a
//! short TTL cache collapses those into one upstream fetch. A failed fetch
//! with a cold cache is a hard, retryable error — the caller must never see
//! a zero or stale rate.

use crate::ttl_cache::TtlCache;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const HTTP_TIMEOUT_SECS: u64 = 15;
const FETCH_MAX_ELAPSED: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Error)]
pub enum OracleError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected price response: {0}")]
    Malformed(String),

    #[error("price service returned an unusable rate: {0}")]
    InvalidRate(f64),
}

/// Returns the live fiat price of one unit of crypto.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn rate(&self) -> Result<f64, OracleError>;
}

/// CoinGecko-backed USD/LTC oracle with a short-lived cache.
pub struct CoinGeckoOracle {
    client: reqwest::Client,
    base_url: String,
    cache: TtlCache<f64>,
}

impl CoinGeckoOracle {
    pub fn new(base_url: &str, cache_ttl: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: TtlCache::new(cache_ttl),
        }
    }

    async fn fetch_rate(&self) -> Result<f64, OracleError> {
        let url = format!(
            "{}/api/v3/simple/price?ids=litecoin&vs_currencies=usd",
            self.base_url
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(OracleError::Transport(format!(
                "price service returned {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        parse_price_response(&body)
    }
}

#[async_trait]
impl PriceOracle for CoinGeckoOracle {
    async fn rate(&self) -> Result<f64, OracleError> {
        if let Some(rate) = self.cache.get_if_valid().await {
            return Ok(rate);
        }

        let rate = match crate::retry_with_max_elapsed_time!(self.fetch_rate(), FETCH_MAX_ELAPSED)
        {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) | Err(e) => return Err(e),
        };

        self.cache.update(rate).await;
        debug!("[PriceOracle] refreshed rate: 1 LTC = {:.2} USD", rate);
        Ok(rate)
    }
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    litecoin: PriceEntry,
}

#[derive(Debug, Deserialize)]
struct PriceEntry {
    usd: f64,
}

pub(crate) fn parse_price_response(body: &str) -> Result<f64, OracleError> {
    let response: PriceResponse =
        serde_json::from_str(body).map_err(|e| OracleError::Malformed(e.to_string()))?;

    let rate = response.litecoin.usd;
    if !rate.is_finite() || rate <= 0.0 {
        return Err(OracleError::InvalidRate(rate));
    }
    Ok(rate)
}
