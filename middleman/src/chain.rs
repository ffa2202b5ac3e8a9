// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

//! Blockchain explorer client.
//!
//! `ChainWatcher` is the narrow seam the payment monitor polls through.
//! The production implementation queries the SoChain address API; matching
//! a transaction against the expected deposit amount is the monitor's job,
//! not the watcher's.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const HTTP_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected explorer response: {0}")]
    Malformed(String),
}

/// One transaction observed on an address.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTx {
    pub txid: String,
    pub value: f64,
    pub confirmations: u32,
}

/// Looks up recent transactions for an address.
#[async_trait]
pub trait ChainWatcher: Send + Sync {
    async fn lookup(&self, address: &str) -> Result<Vec<ChainTx>, ChainError>;
}

/// SoChain-backed watcher for Litecoin addresses.
pub struct SochainWatcher {
    client: reqwest::Client,
    base_url: String,
    network: String,
}

impl SochainWatcher {
    pub fn new(base_url: &str, network: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            network: network.to_string(),
        }
    }
}

#[async_trait]
impl ChainWatcher for SochainWatcher {
    async fn lookup(&self, address: &str) -> Result<Vec<ChainTx>, ChainError> {
        let url = format!(
            "{}/api/v2/address/{}/{}",
            self.base_url, self.network, address
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChainError::Transport(format!(
                "explorer returned {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        parse_address_response(&body)
    }
}

// SoChain wraps the payload in {"status": "...", "data": {"txs": [...]}}
// and reports values as decimal strings.
#[derive(Debug, Deserialize)]
struct AddressResponse {
    data: AddressData,
}

#[derive(Debug, Deserialize)]
struct AddressData {
    #[serde(default)]
    txs: Vec<TxEntry>,
}

#[derive(Debug, Deserialize)]
struct TxEntry {
    txid: String,
    value: String,
    #[serde(default)]
    confirmations: u32,
}

pub(crate) fn parse_address_response(body: &str) -> Result<Vec<ChainTx>, ChainError> {
    let response: AddressResponse =
        serde_json::from_str(body).map_err(|e| ChainError::Malformed(e.to_string()))?;

    response
        .data
        .txs
        .into_iter()
        .map(|tx| {
            let value = tx
                .value
                .parse::<f64>()
                .map_err(|_| ChainError::Malformed(format!("bad tx value '{}'", tx.value)))?;
            Ok(ChainTx {
                txid: tx.txid,
                value,
                confirmations: tx.confirmations,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_response() {
        let body = r#"{
            "status": "success",
            "data": {
                "network": "LTC",
                "address": "LVg2kJoFNg45Nbpy53h7Fe1wKyeXVRhMH9",
                "txs": [
                    {"txid": "abc123", "value": "2.00000000", "confirmations": 3},
                    {"txid": "def456", "value": "0.10000000", "confirmations": 0}
                ]
            }
        }"#;

        let txs = parse_address_response(body).unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].txid, "abc123");
        assert_eq!(txs[0].value, 2.0);
        assert_eq!(txs[0].confirmations, 3);
        assert_eq!(txs[1].value, 0.1);
    }

    #[test]
    fn test_parse_empty_tx_list() {
        let body = r#"{"status": "success", "data": {"txs": []}}"#;
        assert!(parse_address_response(body).unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_value() {
        let body = r#"{"data": {"txs": [{"txid": "abc", "value": "not-a-number"}]}}"#;
        let err = parse_address_response(body).unwrap_err();
        assert!(matches!(err, ChainError::Malformed(_)));
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let err = parse_address_response("<html>rate limited</html>").unwrap_err();
        assert!(matches!(err, ChainError::Malformed(_)));
    }
}
