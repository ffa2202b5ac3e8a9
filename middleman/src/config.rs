// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

//! Service configuration.
//!
//! Loaded once at startup from a YAML or JSON file and validated into the
//! runtime policy; read-only afterwards.

use crate::state_machine::{validate_payout_address, DealPolicy};
use anyhow::{anyhow, Result};
use middleman_config::Config;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TelegramSection {
    /// Bot API token.
    pub bot_token: String,
    /// User allowed to run the override command.
    pub owner_id: i64,
    /// Chat-title prefix that marks ticket chats.
    #[serde(default = "default_scope_prefix")]
    pub ticket_scope_prefix: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainSection {
    /// Explorer base url.
    #[serde(default = "default_explorer_url")]
    pub explorer_url: String,
    /// Escrow deposit address watched for incoming payments.
    pub deposit_address: String,
    #[serde(default = "default_network")]
    pub network: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RatesSection {
    /// Price API base url.
    #[serde(default = "default_price_url")]
    pub price_url: String,
    /// How long a fetched rate may be reused.
    #[serde(default = "default_rate_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for RatesSection {
    fn default() -> Self {
        Self {
            price_url: default_price_url(),
            cache_ttl_secs: default_rate_cache_ttl_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WalletSection {
    /// JSON-RPC endpoint of the wallet daemon holding the escrow key.
    pub rpc_url: String,
    #[serde(default)]
    pub rpc_user: String,
    #[serde(default)]
    pub rpc_password: String,
    /// Payout fee policy, passed to the daemon as fee-per-kB.
    #[serde(default = "default_fee_per_kb")]
    pub fee_per_kb: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DealSection {
    /// How long a deal may wait for its payment before timing out.
    #[serde(default = "default_deal_timeout_secs")]
    pub timeout_secs: u64,
    /// Response deadline for each interactive step.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Payment monitor cadence.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Delay between a terminal stage and ticket teardown.
    #[serde(default = "default_grace_delay_secs")]
    pub grace_delay_secs: u64,
    /// Tolerance when matching on-chain values against the invoice.
    #[serde(default = "default_payment_tolerance")]
    pub payment_tolerance: f64,
}

impl Default for DealSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_deal_timeout_secs(),
            step_timeout_secs: default_step_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            grace_delay_secs: default_grace_delay_secs(),
            payment_tolerance: default_payment_tolerance(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MiddlemanConfig {
    pub telegram: TelegramSection,
    pub chain: ChainSection,
    #[serde(default)]
    pub rates: RatesSection,
    pub wallet: WalletSection,
    #[serde(default)]
    pub deal: DealSection,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Config for MiddlemanConfig {}

impl MiddlemanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.is_empty() {
            return Err(anyhow!("telegram.bot-token must be set"));
        }
        if self.telegram.owner_id == 0 {
            return Err(anyhow!("telegram.owner-id must be set"));
        }
        validate_payout_address(&self.chain.deposit_address)
            .map_err(|_| anyhow!("chain.deposit-address is not a plausible LTC address"))?;
        if self.wallet.rpc_url.is_empty() {
            return Err(anyhow!("wallet.rpc-url must be set"));
        }
        if self.wallet.fee_per_kb <= 0.0 || !self.wallet.fee_per_kb.is_finite() {
            return Err(anyhow!("wallet.fee-per-kb must be a positive number"));
        }
        if self.deal.timeout_secs == 0
            || self.deal.step_timeout_secs == 0
            || self.deal.poll_interval_secs == 0
        {
            return Err(anyhow!("deal timeouts and poll interval must be non-zero"));
        }
        if self.deal.payment_tolerance <= 0.0 || !self.deal.payment_tolerance.is_finite() {
            return Err(anyhow!("deal.payment-tolerance must be a positive number"));
        }
        Ok(())
    }

    pub fn policy(&self) -> DealPolicy {
        DealPolicy {
            deal_timeout: Duration::from_secs(self.deal.timeout_secs),
            step_timeout: Duration::from_secs(self.deal.step_timeout_secs),
            grace_delay: Duration::from_secs(self.deal.grace_delay_secs),
            payment_tolerance: self.deal.payment_tolerance,
            deposit_address: self.chain.deposit_address.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.deal.poll_interval_secs)
    }

    pub fn rate_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.rates.cache_ttl_secs)
    }
}

fn default_scope_prefix() -> String {
    "deal-".to_string()
}

fn default_explorer_url() -> String {
    "https://sochain.com".to_string()
}

fn default_network() -> String {
    "LTC".to_string()
}

fn default_price_url() -> String {
    "https://api.coingecko.com".to_string()
}

fn default_rate_cache_ttl_secs() -> u64 {
    30
}

fn default_fee_per_kb() -> f64 {
    0.0001
}

fn default_deal_timeout_secs() -> u64 {
    3600
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_grace_delay_secs() -> u64 {
    10
}

fn default_payment_tolerance() -> f64 {
    1e-8
}

fn default_metrics_port() -> u16 {
    9184
}
