// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

#[derive(Clone, Debug)]
pub struct MiddlemanMetrics {
    pub(crate) deals_opened: IntCounter,
    pub(crate) deals_released: IntCounter,
    pub(crate) deals_cancelled: IntCounter,
    pub(crate) deals_timed_out: IntCounter,
    pub(crate) active_deals: IntGauge,

    pub(crate) payment_lookups: IntCounter,
    pub(crate) payment_lookup_errors: IntCounter,
    pub(crate) payments_matched: IntCounter,

    pub(crate) payouts_submitted: IntCounter,
    pub(crate) payout_errors: IntCounter,
    pub(crate) override_releases: IntCounter,

    pub(crate) rejected_actions: IntCounterVec,
    pub(crate) notify_failures: IntCounter,
}

impl MiddlemanMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            deals_opened: register_int_counter_with_registry!(
                "middleman_deals_opened",
                "Total number of deals opened",
                registry,
            )
            .unwrap(),
            deals_released: register_int_counter_with_registry!(
                "middleman_deals_released",
                "Total number of deals that reached payout",
                registry,
            )
            .unwrap(),
            deals_cancelled: register_int_counter_with_registry!(
                "middleman_deals_cancelled",
                "Total number of deals cancelled",
                registry,
            )
            .unwrap(),
            deals_timed_out: register_int_counter_with_registry!(
                "middleman_deals_timed_out",
                "Total number of deals that timed out",
                registry,
            )
            .unwrap(),
            active_deals: register_int_gauge_with_registry!(
                "middleman_active_deals",
                "Number of deals currently in the store",
                registry,
            )
            .unwrap(),
            payment_lookups: register_int_counter_with_registry!(
                "middleman_payment_lookups",
                "Total number of explorer lookups performed by the payment monitor",
                registry,
            )
            .unwrap(),
            payment_lookup_errors: register_int_counter_with_registry!(
                "middleman_payment_lookup_errors",
                "Total number of failed explorer lookups",
                registry,
            )
            .unwrap(),
            payments_matched: register_int_counter_with_registry!(
                "middleman_payments_matched",
                "Total number of deposits matched on chain",
                registry,
            )
            .unwrap(),
            payouts_submitted: register_int_counter_with_registry!(
                "middleman_payouts_submitted",
                "Total number of payouts broadcast by the wallet",
                registry,
            )
            .unwrap(),
            payout_errors: register_int_counter_with_registry!(
                "middleman_payout_errors",
                "Total number of failed payout attempts",
                registry,
            )
            .unwrap(),
            override_releases: register_int_counter_with_registry!(
                "middleman_override_releases",
                "Total number of owner-override releases",
                registry,
            )
            .unwrap(),
            rejected_actions: register_int_counter_vec_with_registry!(
                "middleman_rejected_actions",
                "Total number of rejected user actions, by error type",
                &["type"],
                registry,
            )
            .unwrap(),
            notify_failures: register_int_counter_with_registry!(
                "middleman_notify_failures",
                "Total number of notification sends that exhausted retries",
                registry,
            )
            .unwrap(),
        }
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Self::new(&Registry::new())
    }
}
