// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Entrypoint: parse configuration, assemble the collaborators the selected
//! role needs, serve `/metrics`, and hand off to that role's worker loop.

use std::sync::Arc;

use clap::Parser;
use forest_snapshot_pipeline::{
    broker::LapinBroker,
    chain_tool::ChainTool,
    config::{PipelineConfig, Role},
    metrics::{self, PipelineMetrics},
    notify::SlackNotifier,
    object_store_client::R2Client,
    worker::{self, WorkerContext},
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(PipelineConfig::parse());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    tracing::info!(role = %config.role, "starting forest-snapshotd");

    let broker: Arc<dyn forest_snapshot_pipeline::broker::BrokerClient> = Arc::new(LapinBroker::new(
        &config.rabbitmq_host,
        &config.rabbitmq_user,
        &config.rabbitmq_pass.0,
    ));

    let chain_tool = ChainTool::new(match config.role {
        Role::Compute => "forest-cli",
        Role::Build => "forest-cli",
        Role::Upload => "forest-cli",
        Role::Validate => "forest-tool",
    });

    let metrics = Arc::new(PipelineMetrics::new(&config.role.to_string()));

    let notifier = config
        .slack_token
        .as_ref()
        .map(|token| Arc::new(SlackNotifier::new(reqwest::Client::new(), token.0.clone(), config.slack_channel.clone())));

    let object_store = match config.role {
        Role::Upload | Role::Validate => Some(Arc::new(R2Client::from_config(&config)?)),
        _ => None,
    };

    let docker = match config.role {
        Role::Validate => Some(bollard::Docker::connect_with_local_defaults()?),
        _ => None,
    };

    let metrics_addr = std::net::SocketAddr::new(config.metrics_bind, config.metrics_port());
    let metrics_for_server = Arc::clone(&metrics);
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_for_server, metrics_addr).await {
            tracing::error!(error = %e, "metrics server exited");
        }
    });

    let ctx = WorkerContext {
        config: Arc::clone(&config),
        broker,
        chain_tool,
        metrics,
        notifier,
        object_store,
        docker,
    };

    match config.role {
        Role::Compute => worker::compute::run(&ctx).await,
        Role::Build => worker::build::run(&ctx).await,
        Role::Upload => worker::upload::run(&ctx).await,
        Role::Validate => worker::validate::run(&ctx).await,
    }
}
