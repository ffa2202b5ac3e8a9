// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

//! Payout wallet seam.
//!
//! `WalletSigner` signs and broadcasts the payout. Key material never
//! enters this process: the production implementation drives a
//! litecoind-compatible wallet daemon over JSON-RPC. A response without a
//! txid is a failure, full stop — callers must not treat it as success.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Error)]
pub enum WalletError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("wallet rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("wallet returned no transaction id")]
    MissingTxid,
}

/// Signs and broadcasts a payout; returns the txid.
#[async_trait]
pub trait WalletSigner: Send + Sync {
    async fn send_payout(&self, address: &str, amount: f64) -> Result<String, WalletError>;
}

/// JSON-RPC client for a litecoind-compatible wallet daemon.
pub struct WalletRpcSigner {
    client: reqwest::Client,
    rpc_url: String,
    rpc_user: String,
    rpc_password: String,
    /// Fee rate handed to `settxfee` before each payout.
    fee_per_kb: f64,
}

impl WalletRpcSigner {
    pub fn new(rpc_url: &str, rpc_user: &str, rpc_password: &str, fee_per_kb: f64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("reqwest client");
        Self {
            client,
            rpc_url: rpc_url.to_string(),
            rpc_user: rpc_user.to_string(),
            rpc_password: rpc_password.to_string(),
            fee_per_kb,
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, WalletError> {
        let response = self
            .client
            .post(&self.rpc_url)
            .basic_auth(&self.rpc_user, Some(&self.rpc_password))
            .json(&json!({
                "jsonrpc": "1.0",
                "id": "middleman",
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .map_err(|e| WalletError::Transport(e.to_string()))?;

        let body = response
            .text()
            .await
            .map_err(|e| WalletError::Transport(e.to_string()))?;
        parse_rpc_response(&body)
    }
}

#[async_trait]
impl WalletSigner for WalletRpcSigner {
    async fn send_payout(&self, address: &str, amount: f64) -> Result<String, WalletError> {
        // Fee policy first; a rejected settxfee only means the daemon kept
        // its previous rate, which is safe to proceed with.
        let _ = self.call("settxfee", json!([self.fee_per_kb])).await;

        let result = self
            .call("sendtoaddress", json!([address, amount]))
            .await?;

        let txid = result
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or(WalletError::MissingTxid)?
            .to_string();

        info!("[WalletSigner] payout broadcast: txid={}", txid);
        Ok(txid)
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

pub(crate) fn parse_rpc_response(body: &str) -> Result<Value, WalletError> {
    let response: RpcResponse =
        serde_json::from_str(body).map_err(|e| WalletError::Transport(e.to_string()))?;

    if let Some(error) = response.error {
        return Err(WalletError::Rpc {
            code: error.code,
            message: error.message,
        });
    }

    match response.result {
        Some(Value::Null) | None => Err(WalletError::MissingTxid),
        Some(value) => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_successful_send() {
        let body = r#"{"result": "a1b2c3", "error": null, "id": "middleman"}"#;
        let value = parse_rpc_response(body).unwrap();
        assert_eq!(value.as_str(), Some("a1b2c3"));
    }

    #[test]
    fn test_parse_rpc_error() {
        let body = r#"{"result": null, "error": {"code": -6, "message": "Insufficient funds"}, "id": "middleman"}"#;
        let err = parse_rpc_response(body).unwrap_err();
        match err {
            WalletError::Rpc { code, message } => {
                assert_eq!(code, -6);
                assert_eq!(message, "Insufficient funds");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_null_result_is_not_success() {
        let body = r#"{"result": null, "error": null, "id": "middleman"}"#;
        assert!(matches!(
            parse_rpc_response(body).unwrap_err(),
            WalletError::MissingTxid
        ));
    }

    #[test]
    fn test_garbage_body_is_transport_error() {
        assert!(matches!(
            parse_rpc_response("502 bad gateway").unwrap_err(),
            WalletError::Transport(_)
        ));
    }
}
