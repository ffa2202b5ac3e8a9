// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use middleman::config::MiddlemanConfig;
use middleman::node::run_middleman_node;
use middleman_config::Config;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
struct Args {
    #[clap(env, long)]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = MiddlemanConfig::load(&args.config_path)?;
    let registry = prometheus::Registry::new();

    info!("starting middleman node");
    let handle = run_middleman_node(config, &registry).await?;
    handle
        .await
        .map_err(|e| anyhow::anyhow!("task join error: {}", e))
}
