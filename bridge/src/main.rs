// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use notary_bridge::config::NotaryNodeConfig;
use notary_bridge::ledger::InMemoryLedger;
use notary_bridge::metrics::start_prometheus_server;
use notary_bridge::node::run_notary_node;
use notary_bridge::utils::generate_notary_node_config_and_write_to_file;
use notary_bridge_config::Config;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version = VERSION)]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
    /// Write a config template to `config-path` and exit.
    #[clap(long)]
    pub generate_config_template: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.generate_config_template {
        generate_notary_node_config_and_write_to_file(&args.config_path)?;
        println!("Config template written to {:?}", args.config_path);
        return Ok(());
    }

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = NotaryNodeConfig::load(&args.config_path)?;

    let metrics_address =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), config.metrics_port);
    let prometheus_registry = prometheus::Registry::new();
    let mut handles = vec![start_prometheus_server(
        metrics_address,
        prometheus_registry.clone(),
    )];
    info!("Metrics server started at port {}", config.metrics_port);

    // single-host deployment: the notary keeps the ledger in process
    let ledger = Arc::new(InMemoryLedger::new());
    handles.extend(run_notary_node(config, ledger, VERSION, &prometheus_registry).await?);

    // Every task runs for the lifetime of the process, the first one to end stops it.
    let (result, index, _) = futures::future::select_all(handles).await;
    let result = result
        .map_err(|e| anyhow::anyhow!("Task join error: {}", e))
        .and_then(|r| r);
    if let Err(e) = &result {
        error!("Notary task {} failed: {:?}", index, e);
    }
    result
}
