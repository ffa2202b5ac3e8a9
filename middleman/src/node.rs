// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

//! Node assembly: wires the collaborators together and runs the long-lived
//! loops (gateway, interaction router, payment monitor, metrics server)
//! under one cancellation token.

use crate::chain::{ChainWatcher, SochainWatcher};
use crate::config::MiddlemanConfig;
use crate::gateway::TelegramGateway;
use crate::metrics::MiddlemanMetrics;
use crate::notify::telegram::{TelegramChannel, TelegramConfig};
use crate::notify::NotificationChannel;
use crate::payment_monitor::PaymentMonitor;
use crate::rates::{CoinGeckoOracle, PriceOracle};
use crate::state_machine::DealStateMachine;
use crate::store::DealStore;
use crate::ticket::TicketRouter;
use crate::types::UserId;
use crate::wallet::{WalletRpcSigner, WalletSigner};
use anyhow::Result;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const EVENT_QUEUE_DEPTH: usize = 256;

/// Start every component and return a handle that resolves once they have
/// all shut down.
pub async fn run_middleman_node(
    config: MiddlemanConfig,
    registry: &Registry,
) -> Result<JoinHandle<()>> {
    config.validate()?;

    let metrics = Arc::new(MiddlemanMetrics::new(registry));
    let store = Arc::new(DealStore::new());

    let watcher: Arc<dyn ChainWatcher> = Arc::new(SochainWatcher::new(
        &config.chain.explorer_url,
        &config.chain.network,
    ));
    let oracle: Arc<dyn PriceOracle> = Arc::new(CoinGeckoOracle::new(
        &config.rates.price_url,
        config.rate_cache_ttl(),
    ));
    let signer: Arc<dyn WalletSigner> = Arc::new(WalletRpcSigner::new(
        &config.wallet.rpc_url,
        &config.wallet.rpc_user,
        &config.wallet.rpc_password,
        config.wallet.fee_per_kb,
    ));
    let channel: Arc<dyn NotificationChannel> = Arc::new(TelegramChannel::new(TelegramConfig {
        bot_token: config.telegram.bot_token.clone(),
    }));

    let machine = Arc::new(DealStateMachine::new(
        store.clone(),
        oracle,
        signer,
        channel.clone(),
        config.policy(),
        metrics.clone(),
    ));
    let router = Arc::new(TicketRouter::new(
        machine.clone(),
        store.clone(),
        channel,
        metrics.clone(),
        UserId(config.telegram.owner_id),
    ));
    let monitor = Arc::new(PaymentMonitor::new(
        store,
        watcher,
        machine,
        metrics,
        config.poll_interval(),
    ));

    let cancel = CancellationToken::new();
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let gateway = TelegramGateway::new(
        &config.telegram.bot_token,
        &config.telegram.ticket_scope_prefix,
        event_tx,
    );

    let mut handles = Vec::new();
    handles.push(gateway.start(cancel.clone()));
    handles.push(router.start(event_rx, cancel.clone()));
    handles.push(monitor.start(cancel.clone()));
    handles.push(start_metrics_server(
        registry.clone(),
        config.metrics_port,
        cancel.clone(),
    ));

    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            cancel_on_signal.cancel();
        }
    });

    info!("middleman node started");
    Ok(tokio::spawn(async move {
        for handle in handles {
            let _ = handle.await;
        }
        info!("middleman node stopped");
    }))
}

fn start_metrics_server(
    registry: Registry,
    port: u16,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let app = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let registry = registry.clone();
                async move {
                    let encoder = prometheus::TextEncoder::new();
                    encoder.encode_to_string(&registry.gather()).unwrap_or_default()
                }
            }),
        );

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("[Metrics] failed to bind {}: {}", addr, e);
                return;
            }
        };
        info!("[Metrics] serving on {}", addr);

        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!("[Metrics] server error: {}", e);
        }
    })
}
