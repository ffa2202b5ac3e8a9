// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

pub mod chain;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod node;
pub mod notify;
pub mod payment_monitor;
pub mod rates;
pub mod state_machine;
pub mod store;
pub mod ticket;
pub mod ttl_cache;
pub mod types;
pub mod wallet;

#[cfg(test)]
pub mod test_utils;

#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // The following delay sequence (in secs) will be used, applied with jitter
        // 0.4, 0.8, 1.6, 3.2, 6.4, ... capped by max_elapsed_time
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(120),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                let result = $func.await;
                match result {
                    Ok(v) => Ok(Ok(v)),
                    Err(e) => {
                        // Every error is treated as transient so the call
                        // retries until max_elapsed_time runs out.
                        tracing::debug!("Retrying due to error: {:?}", e);
                        Err(backoff::Error::transient(e))
                    }
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}
